use std::path::PathBuf;
use std::process::ExitCode;

use binreloc::ensure_binary_is_relocatable;
use colored::Colorize;

use crate::CommonArgs;

#[derive(clap::Args)]
pub struct CheckArgs {
    /// Prefix that must not appear in the binaries.
    #[clap(long = "forbid", value_name = "PREFIX", required = true)]
    forbidden: Vec<PathBuf>,

    /// File(s).
    #[clap(value_name = "FILE...", required = true)]
    files: Vec<PathBuf>,
}

pub fn check(common: CommonArgs, args: CheckArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let patchelf = common.patchelf();
    let mut num_failed = 0;
    for file in args.files.into_iter() {
        let file = std::path::absolute(file)?;
        if let Err(e) = ensure_binary_is_relocatable(&patchelf, &file, &args.forbidden) {
            eprintln!("{} {}", "error:".red().bold(), e);
            num_failed += 1;
        }
    }
    if num_failed != 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
