use std::path::PathBuf;
use std::process::ExitCode;

use binreloc::classify as classify_file;
use binreloc::get_rpaths;
use binreloc::FileFormat;
use binreloc::MachoTool;

use crate::CommonArgs;
use crate::Printer;

#[derive(clap::Args)]
pub struct RpathArgs {
    /// ELF or Mach-O file.
    #[clap(value_name = "FILE")]
    file: PathBuf,
}

pub fn rpath(common: CommonArgs, args: RpathArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut printer = Printer::new(true);
    match classify_file(&args.file)? {
        FileFormat::Elf => {
            let rpaths = get_rpaths(&common.patchelf(), &args.file)?;
            printer.title("RPATH");
            for rpath in rpaths.iter() {
                printer.row(rpath.display());
            }
        }
        FileFormat::MachODylib | FileFormat::MachOExecutable => {
            let info = common.install_name_tool().read(&args.file)?;
            if let Some(id) = info.id.as_ref() {
                printer.title("Install name");
                printer.row(id);
            }
            printer.title("RPATH");
            for rpath in info.rpaths.iter() {
                printer.row(rpath);
            }
            printer.title("Dependencies");
            for dependency in info.dependencies.iter() {
                printer.row(dependency);
            }
        }
        other => {
            return Err(format!(
                "{:?} is not an ELF or Mach-O file with RPATH: {}",
                args.file,
                other.as_str()
            )
            .into());
        }
    }
    Ok(ExitCode::SUCCESS)
}
