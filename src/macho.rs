use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use goblin::mach::Mach;
use goblin::mach::MachO;
use goblin::mach::SingleArch;
use log::debug;
use log::log_enabled;
use log::trace;
use log::warn;
use log::Level::Trace;

use crate::classify;
use crate::constants::*;
use crate::fs;
use crate::process;
use crate::Changes;
use crate::Error;
use crate::FileFormat;
use crate::PrefixMap;
use crate::ToolError;

/// Linker metadata of a Mach-O file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachoInfo {
    /// Install name (`LC_ID_DYLIB`).
    pub id: Option<String>,
    /// RPATH entries (`LC_RPATH`) in file order, including duplicates.
    pub rpaths: Vec<String>,
    /// Install names of the dependencies.
    pub dependencies: Vec<String>,
}

/// Changes to Mach-O load commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachoEdit {
    /// New install name.
    pub id: Option<String>,
    /// Dependency changes, `(old, new)`.
    pub changes: Vec<(String, String)>,
    /// RPATH changes, `(old, new)`; every occurrence of `old` is changed.
    pub change_rpaths: Vec<(String, String)>,
    /// RPATH entries to delete; each deletes one occurrence.
    pub delete_rpaths: Vec<String>,
    /// RPATH entries to append.
    pub add_rpaths: Vec<String>,
}

impl MachoEdit {
    /// Returns `true` if the edit changes nothing.
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.changes.is_empty()
            && self.change_rpaths.is_empty()
            && self.delete_rpaths.is_empty()
            && self.add_rpaths.is_empty()
    }

    /// Which parts of the file the edit modifies.
    pub fn affected(&self) -> Changes {
        let mut changes = Changes::empty();
        if self.id.is_some() || !self.changes.is_empty() {
            changes |= Changes::INSTALL_NAME;
        }
        if !self.change_rpaths.is_empty()
            || !self.delete_rpaths.is_empty()
            || !self.add_rpaths.is_empty()
        {
            changes |= Changes::RPATH;
        }
        changes
    }

    /// `install_name_tool` arguments without the file name.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(id) = self.id.as_ref() {
            args.extend(["-id".into(), id.into()]);
        }
        for (old, new) in self.changes.iter() {
            args.extend(["-change".into(), old.into(), new.into()]);
        }
        for (old, new) in self.change_rpaths.iter() {
            args.extend(["-rpath".into(), old.into(), new.into()]);
        }
        for rpath in self.delete_rpaths.iter() {
            args.extend(["-delete_rpath".into(), rpath.into()]);
        }
        for rpath in self.add_rpaths.iter() {
            args.extend(["-add_rpath".into(), rpath.into()]);
        }
        args
    }
}

/// Reads and modifies Mach-O load commands.
pub trait MachoTool: Send + Sync {
    /// Read install name, RPATH entries and dependencies.
    fn read(&self, path: &Path) -> Result<MachoInfo, Error>;

    /// Apply the edit in place.
    fn apply(&self, path: &Path, edit: &MachoEdit) -> Result<(), ToolError>;
}

impl<T: MachoTool + ?Sized> MachoTool for &T {
    fn read(&self, path: &Path) -> Result<MachoInfo, Error> {
        (**self).read(path)
    }

    fn apply(&self, path: &Path, edit: &MachoEdit) -> Result<(), ToolError> {
        (**self).apply(path, edit)
    }
}

/// [`MachoTool`] that parses load commands with `goblin` and modifies them with `install_name_tool`.
#[derive(Debug, Clone)]
pub struct InstallNameTool {
    program: PathBuf,
    timeout: Duration,
}

impl InstallNameTool {
    /// Use the provided `install_name_tool` executable.
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Find `install_name_tool` in `PATH`.
    pub fn find() -> Result<Self, ToolError> {
        let program = which::which("install_name_tool").map_err(|e| {
            debug!("Failed to find install_name_tool: {e}");
            ToolError::NotFound("install_name_tool".into())
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

impl MachoTool for InstallNameTool {
    fn read(&self, path: &Path) -> Result<MachoInfo, Error> {
        read_macho(path)
    }

    fn apply(&self, path: &Path, edit: &MachoEdit) -> Result<(), ToolError> {
        let mut command = Command::new(&self.program);
        command.args(edit.to_args()).arg(path);
        process::run(command, self.timeout)?;
        Ok(())
    }
}

/// Read install name, RPATH entries and dependencies of a Mach-O file.
///
/// Universal binaries are read from the first slice.
pub fn read_macho(path: &Path) -> Result<MachoInfo, Error> {
    let data = fs::read(path)?;
    let invalid = |e: goblin::error::Error| Error::InvalidMachO(path.to_path_buf(), e.to_string());
    match Mach::parse(&data).map_err(invalid)? {
        Mach::Binary(macho) => Ok(macho_info(&macho)),
        // All slices are assumed to carry the same load commands.
        Mach::Fat(fat) => match fat.get(0).map_err(invalid)? {
            SingleArch::MachO(macho) => Ok(macho_info(&macho)),
            SingleArch::Archive(..) => Err(Error::InvalidMachO(
                path.to_path_buf(),
                "The first slice is an archive".into(),
            )),
        },
    }
}

fn macho_info(macho: &MachO) -> MachoInfo {
    MachoInfo {
        id: macho.name.map(Into::into),
        rpaths: macho.rpaths.iter().map(|s| s.to_string()).collect(),
        // The first library is the file itself.
        dependencies: macho.libs.iter().skip(1).map(|s| s.to_string()).collect(),
    }
}

/// Rewrites install names and removes duplicate RPATH entries of Mach-O files.
pub struct MachoFixer<'a, T: ?Sized> {
    tool: &'a T,
    store_root: Option<PathBuf>,
}

impl<'a, T: MachoTool + ?Sized> MachoFixer<'a, T> {
    /// Create new fixer.
    pub fn new(tool: &'a T) -> Self {
        Self {
            tool,
            store_root: None,
        }
    }

    /// Dependencies under this directory are referenced via `@rpath`.
    pub fn store_root(mut self, store_root: Option<PathBuf>) -> Self {
        self.store_root = store_root;
        self
    }

    /// Fix install name, dependencies and RPATH entries of `root/relative_path`.
    ///
    /// Returns `true` if the file was modified. Each call removes at most one
    /// occurrence of each duplicate RPATH entry, hence the callers should repeat the call
    /// until it returns `false`.
    pub fn fixup(&self, root: &Path, relative_path: &Path) -> Result<bool, Error> {
        Ok(self.fixup_edit(root, relative_path)?.is_some())
    }

    /// Same as [`fixup`](Self::fixup) but returns the applied edit.
    pub fn fixup_edit(&self, root: &Path, relative_path: &Path) -> Result<Option<MachoEdit>, Error> {
        let path = root.join(relative_path);
        let format = classify(&path)?;
        if !format.is_macho() || !format.has_linker_metadata() {
            return Ok(None);
        }
        let info = self.tool.read(&path)?;
        let edit = self.plan(root, relative_path, format, &info);
        if edit.is_empty() {
            return Ok(None);
        }
        if log_enabled!(Trace) {
            trace!("Fixing up {:?}: {:?}", path, edit);
        }
        match self.tool.apply(&path, &edit) {
            Ok(()) => Ok(Some(edit)),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("Failed to fix up {:?}: {}", path, e);
                Ok(None)
            }
        }
    }

    /// Repeat [`fixup_edit`](Self::fixup_edit) until the file needs no more changes.
    ///
    /// Returns all applied changes and `false` if the file still needed changes after the
    /// last pass.
    pub fn fixup_all(&self, root: &Path, relative_path: &Path) -> Result<(Changes, bool), Error> {
        let mut changes = Changes::empty();
        for _ in 0..MAX_FIXUP_PASSES {
            match self.fixup_edit(root, relative_path)? {
                Some(edit) => changes |= edit.affected(),
                None => return Ok((changes, true)),
            }
        }
        Ok((changes, false))
    }

    /// Compute the changes [`fixup`](Self::fixup) would make.
    pub fn plan(
        &self,
        root: &Path,
        relative_path: &Path,
        format: FileFormat,
        info: &MachoInfo,
    ) -> MachoEdit {
        let mut edit = MachoEdit::default();
        if format == FileFormat::MachODylib {
            if let Some(id) = info.id.as_ref() {
                let id_path = Path::new(id);
                if id_path.is_absolute() && id_path.starts_with(root) {
                    let new_id = format!("{}/{}", RPATH_TOKEN, relative_path.display());
                    if new_id != *id {
                        edit.id = Some(new_id);
                    }
                }
            }
        }
        if let Some(store_root) = self.store_root.as_ref() {
            for dependency in info.dependencies.iter() {
                let dependency_path = Path::new(dependency);
                if !dependency_path.starts_with(store_root) {
                    continue;
                }
                let (Some(dir), Some(file_name)) =
                    (dependency_path.parent(), dependency_path.file_name())
                else {
                    continue;
                };
                let dir = dir.to_string_lossy().into_owned();
                let in_rpaths = info.rpaths.contains(&dir);
                if dir == root.to_string_lossy() && !in_rpaths {
                    continue;
                }
                edit.changes.push((
                    dependency.clone(),
                    format!("{}/{}", RPATH_TOKEN, file_name.to_string_lossy()),
                ));
                if !in_rpaths && !edit.add_rpaths.contains(&dir) {
                    edit.add_rpaths.push(dir);
                }
            }
        }
        let mut seen: Vec<&str> = Vec::new();
        for rpath in info.rpaths.iter() {
            if is_relative_to_binary(rpath) || seen.contains(&rpath.as_str()) {
                continue;
            }
            seen.push(rpath);
            let count = info.rpaths.iter().filter(|other| *other == rpath).count();
            if count > 1 {
                if count > 2 {
                    warn!(
                        "RPATH {:?} occurs {} times in {:?}",
                        rpath,
                        count,
                        root.join(relative_path)
                    );
                } else {
                    debug!(
                        "Duplicate RPATH {:?} in {:?}",
                        rpath,
                        root.join(relative_path)
                    );
                }
                edit.delete_rpaths.push(rpath.clone());
            } else if !Path::new(rpath).is_dir() {
                debug!(
                    "Nonexistent RPATH {:?} in {:?}",
                    rpath,
                    root.join(relative_path)
                );
            }
        }
        edit
    }
}

fn is_relative_to_binary(rpath: &str) -> bool {
    [LOADER_PATH, EXECUTABLE_PATH, RPATH_TOKEN]
        .iter()
        .any(|prefix| rpath.starts_with(prefix))
}

/// Compute the edit that moves install name, dependencies and RPATH entries to the new prefixes.
///
/// With `relative_root`, the resulting entries under the root are made relative to
/// the directory of `binary` via `@loader_path`. Install name is relocated as is; it is
/// made `@rpath`-relative by [`MachoFixer`].
pub fn relocation_edit(
    binary: &Path,
    info: &MachoInfo,
    prefixes: &PrefixMap,
    relative_root: Option<&Path>,
) -> MachoEdit {
    let binary_dir = binary.parent().unwrap_or(Path::new("/"));
    let relocate = |s: &str| -> Option<String> {
        let mapped = match prefixes.map_bytes(s.as_bytes()) {
            Some(bytes) => String::from_utf8(bytes).ok()?,
            None => s.to_string(),
        };
        let under_root = relative_root.is_some_and(|root| {
            let path = Path::new(&mapped);
            path.is_absolute() && path.starts_with(root)
        });
        let mapped = if under_root {
            match pathdiff::diff_paths(&mapped, binary_dir) {
                Some(relative) if relative.as_os_str().is_empty() => LOADER_PATH.to_string(),
                Some(relative) => format!("{}/{}", LOADER_PATH, relative.display()),
                None => mapped,
            }
        } else {
            mapped
        };
        (mapped != s).then_some(mapped)
    };
    let mut edit = MachoEdit::default();
    if let Some(id) = info.id.as_ref() {
        edit.id = prefixes
            .map_bytes(id.as_bytes())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|new| new != id);
    }
    for dependency in info.dependencies.iter() {
        if let Some(new) = relocate(dependency) {
            edit.changes.push((dependency.clone(), new));
        }
    }
    let relocated: Vec<(&String, Option<String>)> = info
        .rpaths
        .iter()
        .map(|rpath| (rpath, relocate(rpath)))
        .collect();
    // `install_name_tool -rpath` fails if the new entry is already present.
    let mut present: Vec<&str> = relocated
        .iter()
        .filter(|(_, new)| new.is_none())
        .map(|(rpath, _)| rpath.as_str())
        .collect();
    for (rpath, new) in relocated.iter() {
        let Some(new) = new else {
            continue;
        };
        if edit.change_rpaths.iter().any(|(old, _)| old == *rpath) {
            continue;
        }
        if present.contains(&new.as_str()) {
            edit.delete_rpaths.push((*rpath).clone());
        } else {
            edit.change_rpaths.push(((*rpath).clone(), new.clone()));
            present.push(new);
        }
    }
    edit
}
