use std::ffi::OsStr;
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::path::Path;
use std::path::PathBuf;

use memchr::memmem::Finder;

use crate::Error;

/// Ordered mapping from old prefixes to new prefixes.
///
/// When several old prefixes match at the same offset, the one inserted first wins,
/// i.e. more specific prefixes should be inserted before more general ones.
/// Old prefixes are matched literally.
#[derive(Debug, Clone, Default)]
pub struct PrefixMap {
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
    finders: Vec<Finder<'static>>,
}

impl PrefixMap {
    /// Empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build mapping from `(old, new)` pairs preserving their order.
    pub fn from_pairs<I, O, N>(pairs: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (O, N)>,
        O: Into<Vec<u8>>,
        N: Into<Vec<u8>>,
    {
        let mut map = Self::new();
        for (old, new) in pairs {
            map.insert(old, new)?;
        }
        Ok(map)
    }

    /// Append a mapping.
    ///
    /// If `old` is already present, its replacement is updated in place and the position is
    /// retained. Fails if `old` is empty.
    pub fn insert<O: Into<Vec<u8>>, N: Into<Vec<u8>>>(
        &mut self,
        old: O,
        new: N,
    ) -> Result<(), Error> {
        let old = old.into();
        let new = new.into();
        if old.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "Empty prefix can't be replaced with {:?}",
                new.escape_ascii().to_string()
            )));
        }
        if let Some(i) = self.pairs.iter().position(|(o, _)| *o == old) {
            self.pairs[i].1 = new;
            return Ok(());
        }
        self.finders.push(Finder::new(&old).into_owned());
        self.pairs.push((old, new));
        Ok(())
    }

    /// Append a mapping between two paths.
    pub fn insert_path<O: AsRef<Path>, N: AsRef<Path>>(
        &mut self,
        old: O,
        new: N,
    ) -> Result<(), Error> {
        self.insert(
            old.as_ref().as_os_str().as_bytes(),
            new.as_ref().as_os_str().as_bytes(),
        )
    }

    /// The number of mappings.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns `true` if there are no mappings.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterate over `(old, new)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.pairs
            .iter()
            .map(|(old, new)| (old.as_slice(), new.as_slice()))
    }

    /// Old prefixes in order.
    pub fn old_prefixes(&self) -> impl Iterator<Item = &[u8]> {
        self.pairs.iter().map(|(old, _)| old.as_slice())
    }

    pub(crate) fn old(&self, index: usize) -> &[u8] {
        &self.pairs[index].0
    }

    pub(crate) fn new_prefix(&self, index: usize) -> &[u8] {
        &self.pairs[index].1
    }

    /// Replace the first matching old prefix at the start of `bytes`.
    pub fn map_bytes(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let (old, new) = self.iter().find(|(old, _)| bytes.starts_with(old))?;
        let mut mapped = Vec::with_capacity(new.len() + bytes.len() - old.len());
        mapped.extend_from_slice(new);
        mapped.extend_from_slice(&bytes[old.len()..]);
        Some(mapped)
    }

    /// Replace the first matching old prefix at the start of `path`.
    pub fn map_path(&self, path: &Path) -> Option<PathBuf> {
        self.map_bytes(path.as_os_str().as_bytes())
            .map(|bytes| OsString::from_vec(bytes).into())
    }

    /// Replace the first matching *new* prefix at the start of `path` with the old one.
    ///
    /// Used to find out where a relocated file was originally installed.
    pub fn unmap_path(&self, path: &Path) -> Option<PathBuf> {
        let bytes = path.as_os_str().as_bytes();
        let (old, new) = self.iter().find(|(_, new)| bytes.starts_with(new))?;
        let mut mapped = old.to_vec();
        mapped.extend_from_slice(&bytes[new.len()..]);
        Some(OsStr::from_bytes(&mapped).into())
    }

    /// Search `haystack` for any of the old prefixes.
    pub fn searcher<'m, 'h>(&'m self, haystack: &'h [u8]) -> Searcher<'m, 'h> {
        Searcher {
            finders: &self.finders,
            haystack,
            next: vec![Next::NotSearched; self.finders.len()],
        }
    }
}

/// A match of one of the old prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    /// Offset of the first byte.
    pub start: usize,
    /// Offset after the last byte.
    pub end: usize,
    /// Index of the matching pair in the [`PrefixMap`].
    pub index: usize,
}

#[derive(Debug, Clone, Copy)]
enum Next {
    NotSearched,
    At(usize),
    Exhausted,
}

/// Leftmost-first search for all old prefixes at once.
///
/// Each prefix is searched for independently and the next occurrence is cached, so scanning
/// the whole haystack costs one pass per prefix regardless of the number of matches.
pub struct Searcher<'m, 'h> {
    finders: &'m [Finder<'static>],
    haystack: &'h [u8],
    next: Vec<Next>,
}

impl Searcher<'_, '_> {
    /// Find the leftmost match that starts at `pos` or later.
    ///
    /// Among matches at the same offset the earliest-listed prefix wins.
    /// Successive calls must not decrease `pos`.
    pub fn find_at(&mut self, pos: usize) -> Option<Match> {
        let haystack = self.haystack;
        let mut best: Option<Match> = None;
        for (index, finder) in self.finders.iter().enumerate() {
            let start = match self.next[index] {
                Next::Exhausted => continue,
                Next::At(start) if start >= pos => start,
                _ => {
                    let found = haystack
                        .get(pos..)
                        .and_then(|rest| finder.find(rest))
                        .map(|i| i + pos);
                    match found {
                        Some(start) => {
                            self.next[index] = Next::At(start);
                            start
                        }
                        None => {
                            self.next[index] = Next::Exhausted;
                            continue;
                        }
                    }
                }
            };
            if best.map_or(true, |best| start < best.start) {
                best = Some(Match {
                    start,
                    end: start + finder.needle().len(),
                    index,
                });
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_matches(map: &PrefixMap, haystack: &[u8]) -> Vec<(usize, usize)> {
        let mut searcher = map.searcher(haystack);
        let mut matches = Vec::new();
        let mut pos = 0;
        while let Some(m) = searcher.find_at(pos) {
            matches.push((m.start, m.index));
            pos = m.end;
        }
        matches
    }

    #[test]
    fn empty_prefix_is_rejected() {
        let mut map = PrefixMap::new();
        assert!(matches!(
            map.insert(b"".as_slice(), b"/new".as_slice()),
            Err(Error::InvalidArgument(..))
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn reinsert_keeps_position() {
        let map =
            PrefixMap::from_pairs([("/a", "/x"), ("/b", "/y"), ("/a", "/z")]).unwrap();
        let pairs: Vec<_> = map.iter().collect();
        assert_eq!(
            vec![
                (b"/a".as_slice(), b"/z".as_slice()),
                (b"/b".as_slice(), b"/y".as_slice())
            ],
            pairs
        );
    }

    #[test]
    fn leftmost_first() {
        let map = PrefixMap::from_pairs([("/first/path", "1"), ("/second/path", "2")]).unwrap();
        assert_eq!(
            vec![(14, 0), (37, 1)],
            all_matches(&map, b"contains both /first/path/subdir and /second/path/sub")
        );
    }

    #[test]
    fn earlier_listed_prefix_wins_at_same_offset() {
        let specific_first =
            PrefixMap::from_pairs([("/replace/in", "1"), ("/replace", "2")]).unwrap();
        let general_first =
            PrefixMap::from_pairs([("/replace", "2"), ("/replace/in", "1")]).unwrap();
        assert_eq!(vec![(0, 0)], all_matches(&specific_first, b"/replace/in/y"));
        assert_eq!(vec![(0, 0)], all_matches(&general_first, b"/replace/in/y"));
        assert_eq!(
            b"/replace".as_slice(),
            general_first.old(all_matches(&general_first, b"/replace/in/y")[0].1)
        );
    }

    #[test]
    fn metacharacters_are_literal() {
        let map = PrefixMap::from_pairs([("/safe/[a-z]", "/x")]).unwrap();
        assert_eq!(
            vec![(38, 0)],
            all_matches(&map, b"don't match /safe/a/path but do match /safe/[a-z]/file")
        );
    }

    #[test]
    fn map_and_unmap_paths() {
        let map = PrefixMap::from_pairs([("/old/pkg", "/new/pkg"), ("/old", "/store")]).unwrap();
        assert_eq!(
            Some(PathBuf::from("/new/pkg/lib")),
            map.map_path(Path::new("/old/pkg/lib"))
        );
        assert_eq!(
            Some(PathBuf::from("/store/other/lib")),
            map.map_path(Path::new("/old/other/lib"))
        );
        assert_eq!(None, map.map_path(Path::new("/usr/lib")));
        assert_eq!(
            Some(PathBuf::from("/old/pkg/bin/tool")),
            map.unmap_path(Path::new("/new/pkg/bin/tool"))
        );
    }
}
