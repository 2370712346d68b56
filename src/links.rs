use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

use log::debug;

use crate::fs;
use crate::Error;
use crate::PrefixMap;

/// Retarget symbolic links whose absolute targets start with one of the old prefixes.
///
/// Relative targets and targets outside of the old prefixes are left as is. The new link
/// replaces the old one atomically. Returns the links that were retargeted.
pub fn relocate_links<P: AsRef<Path>>(
    links: &[P],
    prefixes: &PrefixMap,
) -> Result<Vec<PathBuf>, Error> {
    let mut relocated = Vec::new();
    for link in links.iter() {
        let link = link.as_ref();
        let old_target = fs::read_link(link)?;
        if !old_target.is_absolute() {
            continue;
        }
        let Some(new_target) = prefixes.map_path(&old_target) else {
            continue;
        };
        replace_link(link, &new_target)?;
        debug!(
            "Retargeted {:?}: {:?} -> {:?}",
            link, old_target, new_target
        );
        relocated.push(link.to_path_buf());
    }
    Ok(relocated)
}

fn replace_link(link: &Path, target: &Path) -> Result<(), Error> {
    let file_name = link
        .file_name()
        .ok_or_else(|| Error::InvalidArgument(format!("{:?} is not a symbolic link", link)))?;
    let new_file_name = {
        let mut name = OsString::new();
        name.push(".");
        name.push(file_name);
        name.push(".binreloc.tmp");
        name
    };
    let new_link = match link.parent() {
        Some(parent) => parent.join(&new_file_name),
        None => new_file_name.into(),
    };
    let _ = std::fs::remove_file(&new_link);
    fs::os::unix::fs::symlink(target, &new_link)?;
    if let Err(e) = fs::rename(&new_link, link) {
        let _ = std::fs::remove_file(&new_link);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    use tempfile::TempDir;

    #[test]
    fn retarget_absolute_links() {
        let workdir = TempDir::with_prefix("binreloc-test-").unwrap();
        let dir = workdir.path();
        let absolute = dir.join("absolute");
        let relative = dir.join("relative");
        let unrelated = dir.join("unrelated");
        let specific = dir.join("specific");
        symlink("/old/store/pkg/lib/libfoo.so.1", &absolute).unwrap();
        symlink("libfoo.so.1", &relative).unwrap();
        symlink("/usr/lib/libc.so.6", &unrelated).unwrap();
        symlink("/old/store/special/file", &specific).unwrap();
        let prefixes = PrefixMap::from_pairs([
            ("/old/store/special", "/somewhere/else"),
            ("/old/store", "/new/store"),
        ])
        .unwrap();
        let relocated = relocate_links(
            &[&absolute, &relative, &unrelated, &specific],
            &prefixes,
        )
        .unwrap();
        assert_eq!(vec![absolute.clone(), specific.clone()], relocated);
        assert_eq!(
            Path::new("/new/store/pkg/lib/libfoo.so.1"),
            std::fs::read_link(&absolute).unwrap()
        );
        assert_eq!(
            Path::new("/somewhere/else/file"),
            std::fs::read_link(&specific).unwrap()
        );
        assert_eq!(Path::new("libfoo.so.1"), std::fs::read_link(&relative).unwrap());
        assert_eq!(
            Path::new("/usr/lib/libc.so.6"),
            std::fs::read_link(&unrelated).unwrap()
        );
        assert_eq!(4, std::fs::read_dir(dir).unwrap().count());
    }

    #[test]
    fn regular_file_is_an_error() {
        let workdir = TempDir::with_prefix("binreloc-test-").unwrap();
        let path = workdir.path().join("file");
        std::fs::write(&path, "").unwrap();
        let prefixes = PrefixMap::from_pairs([("/old", "/new")]).unwrap();
        assert!(matches!(
            relocate_links(&[path], &prefixes),
            Err(Error::Io(..))
        ));
    }
}
