use std::ffi::OsStr;
use std::ffi::OsString;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use log::debug;
use log::warn;

use crate::constants::*;
use crate::process;
use crate::Error;
use crate::PrefixMap;
use crate::ToolError;

/// Reads and writes RPATH entries of ELF files.
pub trait RpathTool: Send + Sync {
    /// Get RPATH entries in file order.
    fn read_rpaths(&self, path: &Path) -> Result<Vec<PathBuf>, ToolError>;

    /// Replace all RPATH/RUNPATH entries with a single RPATH entry.
    fn write_rpaths(&self, path: &Path, rpaths: &[PathBuf]) -> Result<(), ToolError>;
}

impl<T: RpathTool + ?Sized> RpathTool for &T {
    fn read_rpaths(&self, path: &Path) -> Result<Vec<PathBuf>, ToolError> {
        (**self).read_rpaths(path)
    }

    fn write_rpaths(&self, path: &Path, rpaths: &[PathBuf]) -> Result<(), ToolError> {
        (**self).write_rpaths(path, rpaths)
    }
}

/// [`RpathTool`] backed by `patchelf` executable.
#[derive(Debug, Clone)]
pub struct Patchelf {
    program: PathBuf,
    timeout: Duration,
}

impl Patchelf {
    /// Use the provided `patchelf` executable.
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Find `patchelf` in `PATH`.
    pub fn find() -> Result<Self, ToolError> {
        let program = which::which("patchelf").map_err(|e| {
            debug!("Failed to find patchelf: {e}");
            ToolError::NotFound("patchelf".into())
        })?;
        Ok(Self::new(program))
    }

    /// Kill the tool if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Path to the executable.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl RpathTool for Patchelf {
    fn read_rpaths(&self, path: &Path) -> Result<Vec<PathBuf>, ToolError> {
        let mut command = Command::new(&self.program);
        command.arg("--print-rpath").arg(path);
        let output = process::run(command, self.timeout)?;
        Ok(split_rpaths(output.stdout.trim_end_matches(['\n', '\r'])))
    }

    fn write_rpaths(&self, path: &Path, rpaths: &[PathBuf]) -> Result<(), ToolError> {
        let mut command = Command::new(&self.program);
        command
            .arg("--force-rpath")
            .arg("--set-rpath")
            .arg(join_rpaths(rpaths))
            .arg(path);
        process::run(command, self.timeout)?;
        Ok(())
    }
}

/// The outcome of [`set_rpaths`].
#[derive(Debug)]
pub enum RpathUpdate {
    /// The entries were written.
    Written,
    /// The tool failed and the file was left as is.
    Skipped(ToolError),
}

impl RpathUpdate {
    /// Returns `true` if the entries were written.
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written)
    }
}

/// Get RPATH entries of ELF file in file order.
pub fn get_rpaths<T: RpathTool + ?Sized>(tool: &T, path: &Path) -> Result<Vec<PathBuf>, Error> {
    Ok(tool.read_rpaths(path)?)
}

/// Force-set RPATH of ELF file.
///
/// Tool failures are not fatal: they are logged and returned as [`RpathUpdate::Skipped`].
pub fn set_rpaths<T: RpathTool + ?Sized>(tool: &T, path: &Path, rpaths: &[PathBuf]) -> RpathUpdate {
    match tool.write_rpaths(path, rpaths) {
        Ok(()) => {
            debug!("Set RPATH of {:?} to {:?}", path, join_rpaths(rpaths));
            RpathUpdate::Written
        }
        Err(e) => {
            warn!("Failed to set RPATH of {:?}: {}", path, e);
            RpathUpdate::Skipped(e)
        }
    }
}

/// Make entries under `root` relative to the directory of `reference_file`.
///
/// The resulting entries start with `$ORIGIN`. Other entries are returned unchanged.
pub fn to_relative(reference_file: &Path, root: &Path, paths: &[PathBuf]) -> Vec<PathBuf> {
    let root = normalize(root);
    let origin_dir = origin_dir(reference_file);
    paths
        .iter()
        .map(|path| {
            if !path.is_absolute() {
                return path.clone();
            }
            let normalized = normalize(path);
            if !normalized.starts_with(&root) {
                return path.clone();
            }
            match pathdiff::diff_paths(&normalized, &origin_dir) {
                Some(relative) if relative.as_os_str().is_empty() => PathBuf::from(ORIGIN),
                Some(relative) => Path::new(ORIGIN).join(relative),
                None => path.clone(),
            }
        })
        .collect()
}

/// Expand `$ORIGIN`-relative entries against the directory of `reference_file`.
///
/// Other entries, including relative paths without `$ORIGIN`, are returned unchanged.
pub fn to_absolute(reference_file: &Path, paths: &[PathBuf]) -> Vec<PathBuf> {
    let origin_dir = origin_dir(reference_file);
    paths
        .iter()
        .map(|path| {
            let mut components = path.components();
            match components.next() {
                Some(Component::Normal(first)) if is_origin(first) => {
                    normalize(&origin_dir.join(components.as_path()))
                }
                _ => path.clone(),
            }
        })
        .collect()
}

/// Replace prefixes of RPATH entries and remove duplicates.
///
/// Each entry is rewritten with the first pair whose old prefix starts the entry.
pub fn transform_rpaths(paths: &[PathBuf], prefixes: &PrefixMap) -> Vec<PathBuf> {
    let mut transformed: Vec<PathBuf> = Vec::with_capacity(paths.len());
    for path in paths.iter() {
        let path = prefixes.map_path(path).unwrap_or_else(|| path.clone());
        if !transformed.contains(&path) {
            transformed.push(path);
        }
    }
    transformed
}

/// Lexically normalize the path, i.e. remove `.` and resolve `..` without accessing the file system.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                // `/..` is `/`.
                Some(Component::RootDir) => {}
                _ => normalized.push(".."),
            },
            other => normalized.push(other),
        }
    }
    normalized
}

fn origin_dir(reference_file: &Path) -> PathBuf {
    normalize(reference_file.parent().unwrap_or(Path::new("/")))
}

fn is_origin(component: &OsStr) -> bool {
    component == ORIGIN || component == ORIGIN_BRACES
}

fn split_rpaths(s: &str) -> Vec<PathBuf> {
    s.split(':')
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .collect()
}

pub(crate) fn join_rpaths(rpaths: &[PathBuf]) -> OsString {
    let mut joined = OsString::new();
    for (i, path) in rpaths.iter().enumerate() {
        if i != 0 {
            joined.push(":");
        }
        joined.push(path);
    }
    joined
}
