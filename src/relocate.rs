use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use log::debug;
use log::warn;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::classify;
use crate::constants::*;
use crate::fs;
use crate::get_rpaths;
use crate::relocate_binary_file;
use crate::relocate_links;
use crate::relocate_text_file;
use crate::relocation_edit;
use crate::set_rpaths;
use crate::to_absolute;
use crate::to_relative;
use crate::transform_rpaths;
use crate::Error;
use crate::FileFormat;
use crate::InstallNameTool;
use crate::MachoFixer;
use crate::MachoTool;
use crate::Patchelf;
use crate::PrefixMap;
use crate::ReplaceOptions;
use crate::RpathTool;
use crate::RpathUpdate;

bitflags! {
    /// Relocation steps that modified a file.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct Changes: u8 {
        /// RPATH entries were rewritten.
        const RPATH = 1 << 0;
        /// Mach-O install name or install names of the dependencies were rewritten.
        const INSTALL_NAME = 1 << 1;
        /// Prefixes were replaced in the file contents.
        const CONTENTS = 1 << 2;
        /// Symbolic link was retargeted.
        const LINK = 1 << 3;
    }
}

/// Stops relocation of the files that were not processed yet.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create new token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns `true` if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Relocation options.
#[derive(Debug, Clone)]
pub struct RelocateOptions {
    relative: bool,
    root: Option<PathBuf>,
    store_root: Option<PathBuf>,
    fail_fast: bool,
    jobs: Option<usize>,
    tool_timeout: Duration,
    replace: ReplaceOptions,
    cancel: CancelToken,
}

impl RelocateOptions {
    /// Default options.
    pub fn new() -> Self {
        Self {
            relative: false,
            root: None,
            store_root: None,
            fail_fast: false,
            jobs: None,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            replace: ReplaceOptions::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Make RPATH entries under the [root](Self::root) relative to the binary.
    ///
    /// ELF files use `$ORIGIN`, Mach-O files use `@loader_path`.
    pub fn relative(mut self, relative: bool) -> Self {
        self.relative = relative;
        self
    }

    /// The directory where the relocated files now reside.
    ///
    /// Required for relative RPATH entries. Mach-O install names under this directory are
    /// replaced with `@rpath`-relative ones.
    pub fn root(mut self, root: Option<PathBuf>) -> Self {
        self.root = root;
        self
    }

    /// Mach-O dependencies under this directory are referenced via `@rpath`.
    pub fn store_root(mut self, store_root: Option<PathBuf>) -> Self {
        self.store_root = store_root;
        self
    }

    /// Do not process the remaining files after the first failure.
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// The number of worker threads.
    ///
    /// When not set the number of available CPUs is used.
    pub fn jobs(mut self, jobs: Option<usize>) -> Self {
        self.jobs = jobs;
        self
    }

    /// Kill external tools that run longer than `timeout`.
    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Binary replacement options.
    pub fn replace(mut self, replace: ReplaceOptions) -> Self {
        self.replace = replace;
        self
    }

    /// Use the provided token to cancel relocation from another thread.
    pub fn cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// `patchelf` and `install_name_tool` from `PATH` with the configured timeout.
    ///
    /// A tool that can't be found is reported only when a file that needs it is encountered.
    pub fn default_tools(&self) -> (Patchelf, InstallNameTool) {
        let patchelf = Patchelf::find().unwrap_or_else(|_| Patchelf::new("patchelf"));
        let install_name_tool = InstallNameTool::find()
            .unwrap_or_else(|_| InstallNameTool::new("install_name_tool"));
        (
            patchelf.timeout(self.tool_timeout),
            install_name_tool.timeout(self.tool_timeout),
        )
    }

    /// Create new relocator with the current options.
    pub fn new_relocator<R: RpathTool, M: MachoTool>(
        self,
        rpath_tool: R,
        macho_tool: M,
        prefixes: PrefixMap,
    ) -> Relocator<R, M> {
        Relocator::new(rpath_tool, macho_tool, prefixes, self)
    }
}

impl Default for RelocateOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Relocation status of a file.
#[derive(Debug)]
pub enum FileStatus {
    /// Nothing to relocate.
    Unchanged,
    /// The file was modified.
    Modified(Changes),
    /// The file couldn't be relocated.
    Failed(Error),
    /// The file wasn't processed because the relocation was cancelled.
    Skipped,
}

/// Relocation report of a file.
#[derive(Debug)]
pub struct FileReport {
    /// File path.
    pub path: PathBuf,
    /// File format if the file was classified.
    pub format: Option<FileFormat>,
    /// Relocation status.
    pub status: FileStatus,
    /// Non-fatal problems.
    pub warnings: Vec<String>,
}

/// Relocation report of a batch of files.
#[derive(Debug, Default)]
pub struct RelocationReport {
    /// Reports in the order of the input files.
    pub files: Vec<FileReport>,
}

impl RelocationReport {
    /// All files were relocated.
    pub fn is_success(&self) -> bool {
        self.num_failed() == 0 && self.num_skipped() == 0
    }

    /// Some files were relocated and some failed or were skipped.
    pub fn is_partial(&self) -> bool {
        !self.is_success() && self.num_relocated() != 0
    }

    /// The number of files that were relocated or needed no relocation.
    pub fn num_relocated(&self) -> usize {
        self.files
            .iter()
            .filter(|file| {
                matches!(
                    file.status,
                    FileStatus::Unchanged | FileStatus::Modified(..)
                )
            })
            .count()
    }

    /// The number of modified files.
    pub fn num_modified(&self) -> usize {
        self.files
            .iter()
            .filter(|file| matches!(file.status, FileStatus::Modified(..)))
            .count()
    }

    /// The number of failed files.
    pub fn num_failed(&self) -> usize {
        self.failures().count()
    }

    /// The number of skipped files.
    pub fn num_skipped(&self) -> usize {
        self.files
            .iter()
            .filter(|file| matches!(file.status, FileStatus::Skipped))
            .count()
    }

    /// Failed files and their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&Path, &Error)> {
        self.files.iter().filter_map(|file| match file.status {
            FileStatus::Failed(ref e) => Some((file.path.as_path(), e)),
            _ => None,
        })
    }
}

/// Relocates batches of files from old prefixes to the new ones.
pub struct Relocator<R, M> {
    rpath_tool: R,
    macho_tool: M,
    prefixes: PrefixMap,
    options: RelocateOptions,
}

impl<R: RpathTool, M: MachoTool> Relocator<R, M> {
    /// Create new relocator.
    pub fn new(rpath_tool: R, macho_tool: M, prefixes: PrefixMap, options: RelocateOptions) -> Self {
        Self {
            rpath_tool,
            macho_tool,
            prefixes,
            options,
        }
    }

    /// Old-to-new prefix mapping.
    pub fn prefixes(&self) -> &PrefixMap {
        &self.prefixes
    }

    /// Relocate the files that were moved to the new prefixes.
    ///
    /// Fails only if the arguments are invalid, in which case no file is modified.
    /// Per-file errors are collected in the report.
    pub fn relocate(&self, files: &[PathBuf]) -> Result<RelocationReport, Error> {
        self.validate(files)?;
        let mut seen: HashSet<&Path> = HashSet::with_capacity(files.len());
        let mut unique: Vec<&Path> = Vec::with_capacity(files.len());
        for path in files.iter() {
            if !seen.insert(path) {
                warn!("{:?} is listed more than once", path);
                continue;
            }
            unique.push(path);
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.options.jobs.unwrap_or(0))
            .build()?;
        let files = pool.install(|| {
            unique
                .par_iter()
                .map(|path| self.relocate_or_skip(path))
                .collect()
        });
        Ok(RelocationReport { files })
    }

    fn validate(&self, files: &[PathBuf]) -> Result<(), Error> {
        if self.options.relative && self.options.root.is_none() {
            return Err(Error::InvalidArgument(
                "Relative RPATH requires the root directory".into(),
            ));
        }
        if let Some(path) = files.iter().find(|path| !path.is_absolute()) {
            return Err(Error::InvalidArgument(format!(
                "{:?} is not an absolute path",
                path
            )));
        }
        for path in files.iter() {
            if let Err(e) = fs::symlink_metadata(path) {
                if e.kind() == ErrorKind::NotFound {
                    return Err(Error::InvalidArgument(format!("{:?} does not exist", path)));
                }
            }
        }
        Ok(())
    }

    fn relocate_or_skip(&self, path: &Path) -> FileReport {
        if self.options.cancel.is_cancelled() {
            return FileReport {
                path: path.to_path_buf(),
                format: None,
                status: FileStatus::Skipped,
                warnings: Vec::new(),
            };
        }
        let report = self.relocate_file(path);
        if let FileStatus::Failed(ref e) = report.status {
            warn!("Failed to relocate {:?}: {}", path, e);
            if self.options.fail_fast {
                self.options.cancel.cancel();
            }
        }
        report
    }

    /// Relocate one file.
    pub fn relocate_file(&self, path: &Path) -> FileReport {
        let mut report = FileReport {
            path: path.to_path_buf(),
            format: None,
            status: FileStatus::Unchanged,
            warnings: Vec::new(),
        };
        let result = self.do_relocate_file(path, &mut report);
        report.status = match result {
            Ok(changes) if changes.is_empty() => FileStatus::Unchanged,
            Ok(changes) => FileStatus::Modified(changes),
            Err(e) => FileStatus::Failed(e),
        };
        debug!("Relocated {:?}: {:?}", path, report.status);
        report
    }

    fn do_relocate_file(&self, path: &Path, report: &mut FileReport) -> Result<Changes, Error> {
        let mut changes = Changes::empty();
        if fs::symlink_metadata(path)?.file_type().is_symlink() {
            if !relocate_links(&[path], &self.prefixes)?.is_empty() {
                changes |= Changes::LINK;
            }
            return Ok(changes);
        }
        let format = classify(path)?;
        report.format = Some(format);
        match format {
            FileFormat::Elf => changes |= self.relocate_elf(path, &mut report.warnings)?,
            FileFormat::MachODylib | FileFormat::MachOExecutable => {
                changes |= self.relocate_macho(path, &mut report.warnings)?
            }
            FileFormat::MachOObject | FileFormat::Text | FileFormat::Other => {}
        }
        let modified = if format.is_binary() {
            relocate_binary_file(path, &self.prefixes, &self.options.replace)?
        } else {
            relocate_text_file(path, &self.prefixes)?
        };
        if modified {
            changes |= Changes::CONTENTS;
        }
        Ok(changes)
    }

    fn relocate_elf(&self, path: &Path, warnings: &mut Vec<String>) -> Result<Changes, Error> {
        let rpaths = match get_rpaths(&self.rpath_tool, path) {
            Ok(rpaths) => rpaths,
            Err(Error::RpathTool(e)) if !e.is_fatal() => {
                warnings.push(format!("Failed to read RPATH: {}", e));
                return Ok(Changes::empty());
            }
            Err(e) => return Err(e),
        };
        if rpaths.is_empty() {
            return Ok(Changes::empty());
        }
        let new_rpaths = match self.relative_root() {
            Some(root) => {
                // Expand `$ORIGIN` against the location where the file was built.
                let original_path = self
                    .prefixes
                    .unmap_path(path)
                    .unwrap_or_else(|| path.to_path_buf());
                let absolute = to_absolute(&original_path, &rpaths);
                let transformed = transform_rpaths(&absolute, &self.prefixes);
                to_relative(path, root, &transformed)
            }
            None => transform_rpaths(&rpaths, &self.prefixes),
        };
        if new_rpaths == rpaths {
            return Ok(Changes::empty());
        }
        match set_rpaths(&self.rpath_tool, path, &new_rpaths) {
            RpathUpdate::Written => Ok(Changes::RPATH),
            RpathUpdate::Skipped(e) if e.is_fatal() => Err(e.into()),
            RpathUpdate::Skipped(e) => {
                warnings.push(format!("RPATH was not updated: {}", e));
                Ok(Changes::empty())
            }
        }
    }

    fn relocate_macho(&self, path: &Path, warnings: &mut Vec<String>) -> Result<Changes, Error> {
        let mut changes = Changes::empty();
        let info = self.macho_tool.read(path)?;
        let edit = relocation_edit(path, &info, &self.prefixes, self.relative_root());
        if !edit.is_empty() {
            match self.macho_tool.apply(path, &edit) {
                Ok(()) => changes |= edit.affected(),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warnings.push(format!("Load commands were not updated: {}", e)),
            }
        }
        let Some(root) = self.options.root.as_ref() else {
            warnings.push("Load commands were not fixed up: no root directory".into());
            return Ok(changes);
        };
        let Ok(relative_path) = path.strip_prefix(root) else {
            warnings.push(format!(
                "Load commands were not fixed up: the file is outside of {:?}",
                root
            ));
            return Ok(changes);
        };
        let fixer =
            MachoFixer::new(&self.macho_tool).store_root(self.options.store_root.clone());
        let (fixed, converged) = fixer.fixup_all(root, relative_path)?;
        if !converged {
            warnings.push(format!(
                "Load commands were not fixed up after {} passes",
                MAX_FIXUP_PASSES
            ));
        }
        Ok(changes | fixed)
    }

    fn relative_root(&self) -> Option<&Path> {
        if self.options.relative {
            self.options.root.as_deref()
        } else {
            None
        }
    }
}

/// Make RPATH entries under `root` relative to the binaries via `$ORIGIN`.
///
/// Files other than ELF are ignored. Returns the files that were modified.
pub fn make_elf_binaries_relative<T: RpathTool + ?Sized>(
    tool: &T,
    binaries: &[PathBuf],
    root: &Path,
) -> Result<Vec<PathBuf>, Error> {
    let mut modified = Vec::new();
    for binary in binaries.iter() {
        if classify(binary)? != FileFormat::Elf {
            continue;
        }
        let rpaths = get_rpaths(tool, binary)?;
        if rpaths.is_empty() {
            continue;
        }
        let new_rpaths = to_relative(binary, root, &rpaths);
        if new_rpaths == rpaths {
            continue;
        }
        match set_rpaths(tool, binary, &new_rpaths) {
            RpathUpdate::Written => modified.push(binary.clone()),
            RpathUpdate::Skipped(e) if e.is_fatal() => return Err(e.into()),
            RpathUpdate::Skipped(..) => {}
        }
    }
    Ok(modified)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    use crate::format::tests::macho_header;
    use crate::macho::tests::FakeMachoTool;
use crate::macho::tests::HangingMachoTool;
    use crate::rpath::tests::paths;
    use crate::rpath::tests::FakeRpathTool;
    use crate::MachoInfo;
    use crate::ToolError;
    use tempfile::TempDir;

    const OLD_ROOT: &str = "/old/store/padded-to-be-longer-than-any-temporary-directory";

    struct Workspace {
        workdir: TempDir,
        prefixes: PrefixMap,
    }

    impl Workspace {
        fn new() -> Self {
            let _ = env_logger::try_init();
            let workdir = TempDir::with_prefix("binreloc-test-").unwrap();
            for dir in ["pkg/bin", "pkg/lib", "dep/lib"] {
                std::fs::create_dir_all(workdir.path().join(dir)).unwrap();
            }
            let prefixes = PrefixMap::from_pairs([
                (format!("{OLD_ROOT}/pkg"), workdir.path().join("pkg").display().to_string()),
                (OLD_ROOT.to_string(), workdir.path().display().to_string()),
            ])
            .unwrap();
            Self { workdir, prefixes }
        }

        fn root(&self) -> &Path {
            self.workdir.path()
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.workdir.path().join(relative)
        }

        fn new_path(&self, relative: &str) -> String {
            self.path(relative).display().to_string()
        }

        fn write_elf(&self, relative: &str, strings: &[&str]) -> PathBuf {
            let mut bytes = b"\x7fELF\x02\x01\x01\0\0\0\0\0\0\0\0\0".to_vec();
            for s in strings {
                bytes.extend(s.as_bytes());
                bytes.push(0);
            }
            let path = self.path(relative);
            std::fs::write(&path, bytes).unwrap();
            path
        }
    }

    fn modified(report: &FileReport) -> Changes {
        match report.status {
            FileStatus::Modified(changes) => changes,
            ref other => panic!("Unexpected status {:?}", other),
        }
    }

    #[test]
    fn relocate_elf_absolute() {
        let ws = Workspace::new();
        let binary = ws.write_elf(
            "pkg/bin/tool",
            &[&format!("{OLD_ROOT}/pkg/share/tool/data.txt")],
        );
        let rpath_tool = FakeRpathTool::default();
        rpath_tool.insert(
            binary.clone(),
            paths(&[&format!("{OLD_ROOT}/pkg/lib"), "$ORIGIN/../lib", "/usr/lib"]),
        );
        let relocator = RelocateOptions::new().new_relocator(
            &rpath_tool,
            FakeMachoTool::default(),
            ws.prefixes.clone(),
        );
        let report = relocator.relocate(&[binary.clone()]).unwrap();
        assert!(report.is_success());
        assert_eq!(Some(FileFormat::Elf), report.files[0].format);
        assert_eq!(Changes::RPATH | Changes::CONTENTS, modified(&report.files[0]));
        assert_eq!(
            paths(&[&ws.new_path("pkg/lib"), "$ORIGIN/../lib", "/usr/lib"]),
            rpath_tool.get(&binary)
        );
        let contents = std::fs::read(&binary).unwrap();
        let expected = format!("{}/share/tool/data.txt\0", ws.new_path("pkg"));
        assert!(contents.ends_with(expected.as_bytes()));
        assert_eq!(
            16 + OLD_ROOT.len() + "/pkg/share/tool/data.txt\0".len(),
            contents.len()
        );
    }

    #[test]
    fn relocate_elf_relative() {
        let ws = Workspace::new();
        let binary = ws.write_elf("pkg/bin/tool", &[]);
        let rpath_tool = FakeRpathTool::default();
        rpath_tool.insert(
            binary.clone(),
            paths(&[
                &format!("{OLD_ROOT}/pkg/lib"),
                "$ORIGIN/../lib",
                &format!("{OLD_ROOT}/dep/lib"),
                "/usr/lib",
            ]),
        );
        let relocator = RelocateOptions::new()
            .relative(true)
            .root(Some(ws.root().to_path_buf()))
            .new_relocator(&rpath_tool, FakeMachoTool::default(), ws.prefixes.clone());
        let report = relocator.relocate(&[binary.clone()]).unwrap();
        assert_eq!(Changes::RPATH, modified(&report.files[0]));
        assert_eq!(
            paths(&["$ORIGIN/../lib", "$ORIGIN/../../dep/lib", "/usr/lib"]),
            rpath_tool.get(&binary)
        );
        // Already relocated.
        let report = relocator.relocate(&[binary.clone()]).unwrap();
        assert!(matches!(report.files[0].status, FileStatus::Unchanged));
    }

    #[test]
    fn make_relative() {
        let ws = Workspace::new();
        let binary = ws.write_elf("pkg/bin/tool", &[]);
        let script = ws.path("pkg/bin/script");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        let rpath_tool = FakeRpathTool::default();
        rpath_tool.insert(
            binary.clone(),
            paths(&[&ws.new_path("pkg/lib"), "/usr/lib"]),
        );
        assert_eq!(
            vec![binary.clone()],
            make_elf_binaries_relative(&rpath_tool, &[binary.clone(), script], ws.root()).unwrap()
        );
        assert_eq!(paths(&["$ORIGIN/../lib", "/usr/lib"]), rpath_tool.get(&binary));
    }

    #[test]
    fn relocate_text_and_links() {
        let ws = Workspace::new();
        let config = ws.path("pkg/bin/tool-config");
        std::fs::write(
            &config,
            format!("prefix={OLD_ROOT}/pkg\nlibdir={OLD_ROOT}/dep/lib\n"),
        )
        .unwrap();
        let link = ws.path("pkg/lib/libdep.so");
        symlink(format!("{OLD_ROOT}/dep/lib/libdep.so.1"), &link).unwrap();
        let relative_link = ws.path("pkg/lib/libdep.so.1");
        symlink("../../dep/lib/libdep.so.1", &relative_link).unwrap();
        let relocator = RelocateOptions::new().new_relocator(
            FakeRpathTool::default(),
            FakeMachoTool::default(),
            ws.prefixes.clone(),
        );
        let report = relocator
            .relocate(&[config.clone(), link.clone(), relative_link.clone()])
            .unwrap();
        assert!(report.is_success());
        assert_eq!(Some(FileFormat::Text), report.files[0].format);
        assert_eq!(Changes::CONTENTS, modified(&report.files[0]));
        assert_eq!(Changes::LINK, modified(&report.files[1]));
        assert!(matches!(report.files[2].status, FileStatus::Unchanged));
        assert_eq!(
            format!(
                "prefix={}\nlibdir={}\n",
                ws.new_path("pkg"),
                ws.new_path("dep/lib")
            ),
            std::fs::read_to_string(&config).unwrap()
        );
        assert_eq!(
            ws.path("dep/lib/libdep.so.1"),
            std::fs::read_link(&link).unwrap()
        );
    }

    #[test]
    fn relocate_macho() {
        let ws = Workspace::new();
        let dylib = ws.path("pkg/lib/libfoo.dylib");
        std::fs::write(&dylib, macho_header(MH_DYLIB)).unwrap();
        let macho_tool = FakeMachoTool::default();
        macho_tool.insert(
            dylib.clone(),
            MachoInfo {
                id: Some(format!("{OLD_ROOT}/pkg/lib/libfoo.dylib")),
                rpaths: vec![
                    format!("{OLD_ROOT}/dep/lib"),
                    format!("{OLD_ROOT}/dep/lib"),
                ],
                dependencies: vec![
                    format!("{OLD_ROOT}/dep/lib/libdep.dylib"),
                    "/usr/lib/libSystem.B.dylib".into(),
                ],
            },
        );
        let relocator = RelocateOptions::new()
            .root(Some(ws.root().to_path_buf()))
            .new_relocator(FakeRpathTool::default(), &macho_tool, ws.prefixes.clone());
        let report = relocator.relocate(&[dylib.clone()]).unwrap();
        assert_eq!(
            Changes::INSTALL_NAME | Changes::RPATH,
            modified(&report.files[0])
        );
        assert_eq!(
            MachoInfo {
                id: Some("@rpath/pkg/lib/libfoo.dylib".into()),
                rpaths: vec![ws.new_path("dep/lib")],
                dependencies: vec![
                    ws.new_path("dep/lib/libdep.dylib"),
                    "/usr/lib/libSystem.B.dylib".into(),
                ],
            },
            macho_tool.get(&dylib)
        );
    }

    #[test]
    fn macho_fixup_requires_root() {
        let ws = Workspace::new();
        let dylib = ws.path("pkg/lib/libfoo.dylib");
        std::fs::write(&dylib, macho_header(MH_DYLIB)).unwrap();
        let info = MachoInfo {
            id: Some("@rpath/libfoo.dylib".into()),
            rpaths: vec![format!("{OLD_ROOT}/dep/lib"), format!("{OLD_ROOT}/dep/lib")],
            dependencies: Vec::new(),
        };
        let macho_tool = FakeMachoTool::default();
        macho_tool.insert(dylib.clone(), info.clone());
        let relocator = RelocateOptions::new().new_relocator(
            FakeRpathTool::default(),
            &macho_tool,
            ws.prefixes.clone(),
        );
        let report = relocator.relocate(&[dylib.clone()]).unwrap();
        assert!(report.is_success());
        assert_eq!(Changes::RPATH, modified(&report.files[0]));
        assert_eq!(
            vec![ws.new_path("dep/lib"), ws.new_path("dep/lib")],
            macho_tool.get(&dylib).rpaths
        );
        assert_eq!(1, report.files[0].warnings.len());
        assert!(report.files[0].warnings[0].contains("no root directory"));

        // The file is outside of the root directory.
        macho_tool.insert(dylib.clone(), info);
        let relocator = RelocateOptions::new()
            .root(Some(ws.path("dep")))
            .new_relocator(FakeRpathTool::default(), &macho_tool, ws.prefixes.clone());
        let report = relocator.relocate(&[dylib.clone()]).unwrap();
        assert!(report.is_success());
        assert_eq!(1, report.files[0].warnings.len());
        assert!(report.files[0].warnings[0].contains("outside of"));

        // Duplicates are removed when the file is under the root directory.
        let relocator = RelocateOptions::new()
            .root(Some(ws.root().to_path_buf()))
            .new_relocator(FakeRpathTool::default(), &macho_tool, ws.prefixes.clone());
        let report = relocator.relocate(&[dylib.clone()]).unwrap();
        assert!(report.files[0].warnings.is_empty());
        assert_eq!(Changes::RPATH, modified(&report.files[0]));
        assert_eq!(vec![ws.new_path("dep/lib")], macho_tool.get(&dylib).rpaths);
    }

    #[test]
    fn timeout_is_fatal_for_the_file() {
        let ws = Workspace::new();
        let dylib = ws.path("pkg/lib/libfoo.dylib");
        std::fs::write(&dylib, macho_header(MH_DYLIB)).unwrap();
        let macho_tool = HangingMachoTool(FakeMachoTool::default());
        let info = MachoInfo {
            id: Some(format!("{OLD_ROOT}/pkg/lib/libfoo.dylib")),
            ..Default::default()
        };
        macho_tool.0.insert(dylib.clone(), info.clone());
        let relocator = RelocateOptions::new()
            .root(Some(ws.root().to_path_buf()))
            .new_relocator(FakeRpathTool::default(), &macho_tool, ws.prefixes.clone());
        let report = relocator.relocate(&[dylib.clone()]).unwrap();
        assert!(!report.is_success());
        assert!(matches!(
            report.files[0].status,
            FileStatus::Failed(Error::RpathTool(ToolError::Timeout(..)))
        ));
        assert_eq!(info, macho_tool.0.get(&dylib));

        let binary = ws.write_elf("pkg/bin/tool", &[]);
        let relocator = RelocateOptions::new().new_relocator(
            SlowPatchelf(paths(&[&format!("{OLD_ROOT}/pkg/lib")])),
            FakeMachoTool::default(),
            ws.prefixes.clone(),
        );
        let report = relocator.relocate(&[binary]).unwrap();
        assert!(matches!(
            report.files[0].status,
            FileStatus::Failed(Error::RpathTool(ToolError::Timeout(..)))
        ));
    }

    /// Reads RPATH but times out when writing it.
    struct SlowPatchelf(Vec<PathBuf>);

    impl RpathTool for SlowPatchelf {
        fn read_rpaths(&self, _path: &Path) -> Result<Vec<PathBuf>, ToolError> {
            Ok(self.0.clone())
        }

        fn write_rpaths(&self, _path: &Path, _rpaths: &[PathBuf]) -> Result<(), ToolError> {
            Err(ToolError::Timeout("patchelf".into(), Duration::from_millis(200)))
        }
    }

    #[test]
    fn invalid_arguments() {
        let ws = Workspace::new();
        let relocator = RelocateOptions::new().new_relocator(
            FakeRpathTool::default(),
            FakeMachoTool::default(),
            ws.prefixes.clone(),
        );
        assert!(relocator
            .relocate(&[PathBuf::from("relative/path")])
            .unwrap_err()
            .is_invalid_argument());
        let relocator = RelocateOptions::new().relative(true).new_relocator(
            FakeRpathTool::default(),
            FakeMachoTool::default(),
            ws.prefixes.clone(),
        );
        assert!(relocator
            .relocate(&[ws.path("pkg")])
            .unwrap_err()
            .is_invalid_argument());
        let text = ws.path("pkg/bin/config");
        std::fs::write(&text, format!("root={OLD_ROOT}\n")).unwrap();
        let relocator = RelocateOptions::new().new_relocator(
            FakeRpathTool::default(),
            FakeMachoTool::default(),
            ws.prefixes.clone(),
        );
        assert!(relocator
            .relocate(&[text.clone(), ws.path("pkg/bin/missing")])
            .unwrap_err()
            .is_invalid_argument());
        // Nothing is touched.
        assert_eq!(
            format!("root={OLD_ROOT}\n"),
            std::fs::read_to_string(&text).unwrap()
        );
        // Dangling symbolic links are relocated.
        let link = ws.path("pkg/lib/libdep.so");
        symlink(format!("{OLD_ROOT}/dep/lib/libdep.so.1"), &link).unwrap();
        let report = relocator.relocate(&[link]).unwrap();
        assert_eq!(Changes::LINK, modified(&report.files[0]));
    }

    #[test]
    fn failures_are_collected() {
        let ws = Workspace::new();
        let short = ws.write_elf("pkg/lib/libshort.so", &[]);
        // Grows by more than the tail can absorb.
        std::fs::write(&short, format!("{OLD_ROOT}/x\0")).unwrap();
        let prefixes = PrefixMap::from_pairs([(OLD_ROOT, format!("{OLD_ROOT}/longer"))]).unwrap();
        let text = ws.path("pkg/bin/config");
        std::fs::write(&text, format!("root={OLD_ROOT}\n")).unwrap();
        let relocator = RelocateOptions::new().new_relocator(
            FakeRpathTool::default(),
            FakeMachoTool::default(),
            prefixes,
        );
        let report = relocator.relocate(&[short.clone(), text.clone()]).unwrap();
        assert!(report.is_partial());
        assert_eq!(1, report.num_failed());
        assert_eq!(1, report.num_modified());
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(1, failures.len());
        assert_eq!(short, failures[0].0);
        assert!(matches!(failures[0].1, Error::CannotShrinkCString { .. }));
        assert_eq!(
            format!("{OLD_ROOT}/x\0").as_bytes(),
            std::fs::read(&short).unwrap()
        );
    }

    #[test]
    fn fail_fast_skips_the_rest() {
        let ws = Workspace::new();
        let short = ws.path("pkg/lib/libshort.so");
        std::fs::write(&short, format!("{OLD_ROOT}/x\0")).unwrap();
        let prefixes = PrefixMap::from_pairs([(OLD_ROOT, format!("{OLD_ROOT}/longer"))]).unwrap();
        let text = ws.path("pkg/bin/config");
        std::fs::write(&text, format!("root={OLD_ROOT}\n")).unwrap();
        let relocator = RelocateOptions::new()
            .fail_fast(true)
            .jobs(Some(1))
            .new_relocator(FakeRpathTool::default(), FakeMachoTool::default(), prefixes);
        let report = relocator.relocate(&[short, text.clone()]).unwrap();
        assert!(!report.is_success());
        assert!(!report.is_partial());
        assert!(matches!(
            report.files[0].status,
            FileStatus::Failed(Error::CannotShrinkCString { .. })
        ));
        assert!(matches!(report.files[1].status, FileStatus::Skipped));
        assert_eq!(
            format!("root={OLD_ROOT}\n"),
            std::fs::read_to_string(&text).unwrap()
        );
    }

    #[test]
    fn cancelled_batch_is_skipped() {
        let ws = Workspace::new();
        let text = ws.path("pkg/bin/config");
        std::fs::write(&text, "").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let relocator = RelocateOptions::new().cancel(cancel).new_relocator(
            FakeRpathTool::default(),
            FakeMachoTool::default(),
            ws.prefixes.clone(),
        );
        let report = relocator.relocate(&[text]).unwrap();
        assert_eq!(1, report.num_skipped());
    }

    struct MissingPatchelf;

    impl RpathTool for MissingPatchelf {
        fn read_rpaths(&self, _path: &Path) -> Result<Vec<PathBuf>, ToolError> {
            Err(ToolError::NotFound("patchelf".into()))
        }

        fn write_rpaths(&self, _path: &Path, _rpaths: &[PathBuf]) -> Result<(), ToolError> {
            Err(ToolError::NotFound("patchelf".into()))
        }
    }

    #[test]
    fn missing_tool_is_fatal_for_the_file() {
        let ws = Workspace::new();
        let binary = ws.write_elf("pkg/bin/tool", &[]);
        let relocator = RelocateOptions::new().new_relocator(
            MissingPatchelf,
            FakeMachoTool::default(),
            ws.prefixes.clone(),
        );
        let report = relocator.relocate(&[binary]).unwrap();
        assert!(matches!(
            report.files[0].status,
            FileStatus::Failed(Error::RpathTool(ToolError::NotFound(..)))
        ));
    }
}
