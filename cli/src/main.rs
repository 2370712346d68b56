use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use binreloc::InstallNameTool;
use binreloc::Patchelf;

mod check;
mod classify;
mod fixup;
mod formatting;
mod relocate;
mod rpath;

pub(crate) use self::check::*;
pub(crate) use self::classify::*;
pub(crate) use self::fixup::*;
pub(crate) use self::formatting::*;
pub(crate) use self::relocate::*;
pub(crate) use self::rpath::*;

#[derive(clap::Parser)]
#[clap(version)]
struct Args {
    #[clap(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
pub struct CommonArgs {
    /// `patchelf` executable.
    ///
    /// Searched in `PATH` by default.
    #[clap(long = "patchelf", value_name = "FILE", global = true)]
    patchelf: Option<PathBuf>,

    /// `install_name_tool` executable.
    ///
    /// Searched in `PATH` by default.
    #[clap(long = "install-name-tool", value_name = "FILE", global = true)]
    install_name_tool: Option<PathBuf>,

    /// Kill external tools after this number of seconds.
    #[clap(
        long = "timeout",
        value_name = "SECONDS",
        default_value = "60",
        global = true
    )]
    timeout: u64,
}

impl CommonArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn patchelf(&self) -> Patchelf {
        let patchelf = match self.patchelf.as_ref() {
            Some(program) => Patchelf::new(program),
            None => Patchelf::find().unwrap_or_else(|_| Patchelf::new("patchelf")),
        };
        patchelf.timeout(self.timeout())
    }

    pub fn install_name_tool(&self) -> InstallNameTool {
        let tool = match self.install_name_tool.as_ref() {
            Some(program) => InstallNameTool::new(program),
            None => InstallNameTool::find()
                .unwrap_or_else(|_| InstallNameTool::new("install_name_tool")),
        };
        tool.timeout(self.timeout())
    }
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print file formats.
    Classify(ClassifyArgs),
    /// Print RPATH of ELF files or load commands of Mach-O files.
    Rpath(RpathArgs),
    /// Relocate files from old prefixes to the new ones.
    Relocate(RelocateArgs),
    /// Fix install names and remove duplicate RPATH entries of a Mach-O file.
    Fixup(FixupArgs),
    /// Make sure that binaries don't refer to the forbidden prefixes.
    Check(CheckArgs),
}

fn main() -> ExitCode {
    do_main()
        .inspect_err(|e| eprintln!("{e}"))
        .unwrap_or(ExitCode::FAILURE)
}

fn do_main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::init();
    match args.command {
        Command::Classify(command_args) => classify(args.common, command_args),
        Command::Rpath(command_args) => rpath(args.common, command_args),
        Command::Relocate(command_args) => relocate(args.common, command_args),
        Command::Fixup(command_args) => fixup(args.common, command_args),
        Command::Check(command_args) => check(args.common, command_args),
    }
}
