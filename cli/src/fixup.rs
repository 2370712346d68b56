use std::path::PathBuf;
use std::process::ExitCode;

use binreloc::MachoFixer;

use crate::ChangesStr;
use crate::CommonArgs;

#[derive(clap::Args)]
pub struct FixupArgs {
    /// Dependencies under this directory are referenced via `@rpath`.
    #[clap(long = "store-root", value_name = "DIR")]
    store_root: Option<PathBuf>,

    /// The directory that contains the file.
    #[clap(value_name = "ROOT")]
    root: PathBuf,

    /// Mach-O file relative to the root directory.
    #[clap(value_name = "FILE")]
    file: PathBuf,
}

pub fn fixup(common: CommonArgs, args: FixupArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let tool = common.install_name_tool();
    let fixer = MachoFixer::new(&tool).store_root(args.store_root);
    let relative_path = if args.file.is_absolute() {
        args.file.strip_prefix(&args.root)?.to_path_buf()
    } else {
        args.file
    };
    let (changes, converged) = fixer.fixup_all(&args.root, &relative_path)?;
    println!("{} {}", ChangesStr(changes), relative_path.display());
    if !converged {
        eprintln!(
            "{:?} still needs changes, run the command again",
            args.root.join(&relative_path)
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
