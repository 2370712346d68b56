use std::path::PathBuf;
use std::process::ExitCode;

use binreloc::classify as classify_file;

use crate::CommonArgs;
use crate::FileFormatStr;
use crate::Printer;

#[derive(clap::Args)]
pub struct ClassifyArgs {
    /// File(s).
    #[clap(value_name = "FILE...", required = true)]
    files: Vec<PathBuf>,
}

pub fn classify(
    _common: CommonArgs,
    args: ClassifyArgs,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut printer = Printer::new(false);
    for file in args.files.iter() {
        let format = classify_file(file)?;
        printer.kv(&file.display().to_string(), FileFormatStr(format));
    }
    Ok(ExitCode::SUCCESS)
}
