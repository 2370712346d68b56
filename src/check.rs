use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use log::trace;
use memchr::memmem;

use crate::classify;
use crate::constants::*;
use crate::fs;
use crate::read_macho;
use crate::rpath::join_rpaths;
use crate::Error;
use crate::FileFormat;
use crate::RpathTool;

/// Make sure that the binary doesn't contain any of the `forbidden` prefixes.
///
/// Printable strings that are equal to one of the RPATH entries or to all entries joined with
/// `:` are not checked; RPATH is rewritten separately. Text files always pass.
pub fn ensure_binary_is_relocatable<T, P>(tool: &T, path: &Path, forbidden: &[P]) -> Result<(), Error>
where
    T: RpathTool + ?Sized,
    P: AsRef<Path>,
{
    if !path.is_absolute() {
        return Err(Error::InvalidArgument(format!(
            "{:?} is not an absolute path",
            path
        )));
    }
    if !path.exists() {
        return Err(Error::InvalidArgument(format!("{:?} does not exist", path)));
    }
    let format = classify(path)?;
    let rpaths: Vec<Vec<u8>> = match format {
        FileFormat::Text => return Ok(()),
        FileFormat::Elf => {
            let rpaths = tool.read_rpaths(path)?;
            let mut strings: Vec<Vec<u8>> = rpaths
                .iter()
                .map(|rpath| rpath.as_os_str().as_bytes().to_vec())
                .collect();
            strings.push(join_rpaths(&rpaths).as_bytes().to_vec());
            strings
        }
        FileFormat::MachODylib | FileFormat::MachOExecutable => read_macho(path)?
            .rpaths
            .into_iter()
            .map(String::into_bytes)
            .collect(),
        FileFormat::MachOObject | FileFormat::Other => Vec::new(),
    };
    let data = fs::read(path)?;
    let finders: Vec<(&Path, memmem::Finder)> = forbidden
        .iter()
        .map(|prefix| {
            let prefix = prefix.as_ref();
            (prefix, memmem::Finder::new(prefix.as_os_str().as_bytes()))
        })
        .collect();
    for string in printable_strings(&data) {
        if rpaths.iter().any(|rpath| rpath.as_slice() == string) {
            continue;
        }
        for (prefix, finder) in finders.iter() {
            if finder.find(string).is_some() {
                trace!(
                    "Found {:?} in {:?}",
                    OsStr::from_bytes(string),
                    path
                );
                return Err(Error::InstallRootString {
                    path: path.to_path_buf(),
                    prefix: prefix.display().to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Same as [`ensure_binary_is_relocatable`] but for many files.
pub fn ensure_binaries_are_relocatable<T, P>(
    tool: &T,
    paths: &[PathBuf],
    forbidden: &[P],
) -> Result<(), Error>
where
    T: RpathTool + ?Sized,
    P: AsRef<Path>,
{
    for path in paths.iter() {
        ensure_binary_is_relocatable(tool, path, forbidden)?;
    }
    Ok(())
}

/// Sequences of printable ASCII characters, at least four characters long.
fn printable_strings(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|ch| !is_printable(*ch))
        .filter(|string| string.len() >= MIN_STRING_LEN)
}

fn is_printable(ch: u8) -> bool {
    ch == b'\t' || (b' '..=b'~').contains(&ch)
}
