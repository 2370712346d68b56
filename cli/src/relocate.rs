use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;

use binreloc::PrefixMap;
use binreloc::RelocateOptions;
use binreloc::ReplaceOptions;
use log::debug;

use crate::CommonArgs;
use crate::FileStatusStr;
use crate::Printer;

#[derive(thiserror::Error, Debug)]
pub enum MappingError {
    #[error("Expected OLD=NEW, got {0:?}")]
    MissingSeparator(String),
    #[error("Empty prefix in {0:?}")]
    EmptyPrefix(String),
}

fn parse_mapping(s: &str) -> Result<(PathBuf, PathBuf), MappingError> {
    let (old, new) = s
        .split_once('=')
        .ok_or_else(|| MappingError::MissingSeparator(s.into()))?;
    if old.is_empty() || new.is_empty() {
        return Err(MappingError::EmptyPrefix(s.into()));
    }
    Ok((old.into(), new.into()))
}

#[derive(clap::Args)]
pub struct RelocateArgs {
    /// Replace prefix OLD with NEW.
    ///
    /// More specific prefixes should go first.
    #[clap(
        short = 'm',
        long = "map",
        value_name = "OLD=NEW",
        value_parser = parse_mapping,
        required = true
    )]
    mappings: Vec<(PathBuf, PathBuf)>,

    /// Make RPATH entries under the root directory relative to the binaries.
    #[clap(action, long = "relative", requires = "root")]
    relative: bool,

    /// The directory where the files now reside.
    #[clap(short = 'r', long = "root", value_name = "DIR")]
    root: Option<PathBuf>,

    /// Mach-O dependencies under this directory are referenced via `@rpath`.
    #[clap(long = "store-root", value_name = "DIR")]
    store_root: Option<PathBuf>,

    /// Stop after the first failure.
    #[clap(action, long = "fail-fast")]
    fail_fast: bool,

    /// The number of worker threads.
    #[clap(short = 'j', long = "jobs", value_name = "N")]
    jobs: Option<usize>,

    /// The number of bytes after a C-string that are searched for its terminating NUL byte.
    #[clap(long = "lookahead", value_name = "BYTES")]
    lookahead: Option<usize>,

    /// Read the files to relocate from FILE, one per line.
    #[clap(long = "files-from", value_name = "FILE")]
    files_from: Option<PathBuf>,

    /// File(s).
    #[clap(value_name = "FILE...", required_unless_present = "files_from")]
    files: Vec<PathBuf>,
}

fn parse_file_list(s: &str) -> Vec<PathBuf> {
    s.lines()
        .filter(|line| !line.trim().is_empty())
        .map(PathBuf::from)
        .collect()
}

pub fn relocate(
    common: CommonArgs,
    args: RelocateArgs,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut prefixes = PrefixMap::new();
    for (old, new) in args.mappings.iter() {
        prefixes.insert_path(old, new)?;
    }
    let mut replace = ReplaceOptions::new();
    if let Some(lookahead) = args.lookahead {
        replace = replace.lookahead(lookahead);
    }
    let options = RelocateOptions::new()
        .relative(args.relative)
        .root(args.root)
        .store_root(args.store_root)
        .fail_fast(args.fail_fast)
        .jobs(args.jobs)
        .tool_timeout(common.timeout())
        .replace(replace);
    debug!("Relocation options: {:?}", options);
    let mut files = args.files;
    if let Some(files_from) = args.files_from.as_ref() {
        files.extend(parse_file_list(&fs_err::read_to_string(files_from)?));
    }
    let files = files
        .into_iter()
        .map(std::path::absolute)
        .collect::<Result<Vec<_>, _>>()?;
    let relocator = options.new_relocator(common.patchelf(), common.install_name_tool(), prefixes);
    let report = relocator.relocate(&files)?;
    let mut printer = Printer::new(false);
    for file in report.files.iter() {
        printer.line(format_args!(
            "{} {}",
            FileStatusStr(&file.status),
            file.path.display()
        ));
        for warning in file.warnings.iter() {
            printer.line(format_args!("  {} {}", "warning:".yellow(), warning));
        }
    }
    for (path, error) in report.failures() {
        printer.line(format_args!("{} {:?}: {}", "error:".red().bold(), path, error));
    }
    printer.line(format_args!(
        "{} files: {} modified, {} unchanged, {} failed, {} skipped",
        report.files.len(),
        report.num_modified(),
        report.num_relocated() - report.num_modified(),
        report.num_failed(),
        report.num_skipped(),
    ));
    if !report.is_success() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
