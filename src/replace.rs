use std::ffi::OsString;
use std::io::Write;
use std::path::Path;

use log::debug;
use log::trace;
use memchr::memchr;

use crate::constants::*;
use crate::fs;
use crate::Error;
use crate::Match;
use crate::PrefixMap;

/// Options of length-preserving binary replacement.
#[derive(Debug, Clone, Copy)]
pub struct ReplaceOptions {
    suffix_safety_size: usize,
    lookahead: usize,
}

impl ReplaceOptions {
    /// Default options.
    pub fn new() -> Self {
        Self {
            suffix_safety_size: DEFAULT_SUFFIX_SAFETY_SIZE,
            lookahead: DEFAULT_LOOKAHEAD,
        }
    }

    /// The number of trailing bytes of a C-string that must survive the replacement.
    ///
    /// Linkers merge read-only strings that share a common suffix, hence a string that ends
    /// within this many bytes after a prefix may be referenced from the middle by other code.
    pub fn suffix_safety_size(mut self, value: usize) -> Self {
        self.suffix_safety_size = value;
        self
    }

    /// How many bytes after a match to search for the terminating NUL byte.
    ///
    /// Values smaller than the suffix safety size plus one are rounded up.
    pub fn lookahead(mut self, value: usize) -> Self {
        self.lookahead = value;
        self
    }

    /// Get suffix safety size.
    pub fn get_suffix_safety_size(&self) -> usize {
        self.suffix_safety_size
    }

    fn window(&self) -> usize {
        self.lookahead.max(self.suffix_safety_size.saturating_add(1))
    }
}

impl Default for ReplaceOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Edit {
    offset: usize,
    bytes: Vec<u8>,
}

/// Replace all old prefixes in `buf` with the new ones without changing its length.
///
/// Shorter replacements are padded with leading `/`, which keeps the end of the surrounding
/// C-string intact. Longer replacements borrow bytes from the tail of a NUL-terminated
/// string. Either all replacements are applied or, on error, none of them.
///
/// Returns the number of replacements.
pub fn apply_binary_replacements(
    buf: &mut [u8],
    prefixes: &PrefixMap,
    options: &ReplaceOptions,
) -> Result<usize, Error> {
    let edits = plan_binary_replacements(buf, prefixes, options)?;
    for edit in edits.iter() {
        buf[edit.offset..edit.offset + edit.bytes.len()].copy_from_slice(&edit.bytes);
    }
    Ok(edits.len())
}

fn plan_binary_replacements(
    data: &[u8],
    prefixes: &PrefixMap,
    options: &ReplaceOptions,
) -> Result<Vec<Edit>, Error> {
    let mut edits = Vec::new();
    let mut searcher = prefixes.searcher(data);
    let mut pos = 0;
    while let Some(m) = searcher.find_at(pos) {
        let window_end = data.len().min(m.end.saturating_add(options.window()));
        let tail_len = memchr(0, &data[m.end..window_end]);
        let (bytes, consumed) = replacement(data, m, prefixes, tail_len, window_end, options)?;
        trace!(
            "Replacing {:?} at {:#x}",
            prefixes.old(m.index).escape_ascii().to_string(),
            m.start
        );
        edits.push(Edit {
            offset: m.start,
            bytes,
        });
        pos = consumed;
    }
    Ok(edits)
}

/// Returns the bytes to write at the match offset and the offset where scanning resumes.
fn replacement(
    data: &[u8],
    m: Match,
    prefixes: &PrefixMap,
    tail_len: Option<usize>,
    window_end: usize,
    options: &ReplaceOptions,
) -> Result<(Vec<u8>, usize), Error> {
    let old = prefixes.old(m.index);
    let new = prefixes.new_prefix(m.index);
    let safety = options.suffix_safety_size;
    let cannot_replace = || Error::CannotShrinkCString {
        old: old.to_vec(),
        new: new.to_vec(),
        c_string: data[m.start..tail_len.map_or(window_end, |n| m.end + n)].to_vec(),
    };
    if new.len() <= old.len() {
        let shorter = old.len() - new.len();
        let keeps_suffix = match tail_len {
            // Either not a C-string or a very long one.
            None => true,
            Some(n) if n >= safety => true,
            Some(n) => suffix(old, safety - n) == suffix(new, safety - n),
        };
        if keeps_suffix {
            let mut bytes = Vec::with_capacity(old.len());
            bytes.resize(shorter, b'/');
            bytes.extend_from_slice(new);
            return Ok((bytes, m.end));
        }
        match tail_len {
            // Strictly greater because the string gets a new terminator.
            Some(n) if shorter > safety => {
                let mut bytes = Vec::with_capacity(new.len() + n + 1);
                bytes.extend_from_slice(new);
                bytes.extend_from_slice(&data[m.end..m.end + n + 1]);
                Ok((bytes, m.end + n + 1))
            }
            _ => Err(cannot_replace()),
        }
    } else {
        let longer = new.len() - old.len();
        match tail_len {
            Some(n) if n >= longer && n - longer >= safety => Ok((new.to_vec(), m.start + new.len())),
            _ => Err(cannot_replace()),
        }
    }
}

fn suffix(s: &[u8], len: usize) -> &[u8] {
    &s[s.len().saturating_sub(len)..]
}

/// Replace all old prefixes in text `data` with the new ones.
///
/// The length of the text may change. A prefix is replaced only if it starts a path, i.e. it
/// is not preceded by another path component. Returns `None` if nothing was replaced.
pub fn replace_text(data: &[u8], prefixes: &PrefixMap) -> Option<Vec<u8>> {
    let mut searcher = prefixes.searcher(data);
    let mut output: Option<Vec<u8>> = None;
    let mut copied = 0;
    let mut pos = 0;
    while let Some(m) = searcher.find_at(pos) {
        if !starts_path(data, copied, m.start) {
            pos = m.start + 1;
            continue;
        }
        let end = m.end
            + data[m.end..]
                .iter()
                .take_while(|ch| is_path_char(**ch))
                .count();
        let output = output.get_or_insert_with(|| Vec::with_capacity(data.len()));
        output.extend_from_slice(&data[copied..m.start]);
        output.extend_from_slice(prefixes.new_prefix(m.index));
        output.extend_from_slice(&data[m.end..end]);
        copied = end;
        pos = end;
    }
    let mut output = output?;
    output.extend_from_slice(&data[copied..]);
    Some(output)
}

fn starts_path(data: &[u8], lower_bound: usize, start: usize) -> bool {
    let mut i = start;
    while i > lower_bound && is_word_char(data[i - 1]) {
        i -= 1;
    }
    i == 0 || !is_path_char(data[i - 1])
}

fn is_word_char(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || ch == b'_' || ch == b'-'
}

fn is_path_char(ch: u8) -> bool {
    is_word_char(ch) || ch == b'/'
}

/// Relocate a binary file in place without changing its length.
///
/// Returns `true` if the file was modified. On error the file is left untouched.
pub fn relocate_binary_file<P: AsRef<Path>>(
    path: P,
    prefixes: &PrefixMap,
    options: &ReplaceOptions,
) -> Result<bool, Error> {
    let path = path.as_ref();
    let expected_len = fs::metadata(path)?.len() as usize;
    let mut data = fs::read(path)?;
    let num_replaced = apply_binary_replacements(&mut data, prefixes, options)?;
    if num_replaced == 0 {
        return Ok(false);
    }
    debug!("Replaced {} prefix(es) in {:?}", num_replaced, path);
    write_in_place(path, &data, Some(expected_len))?;
    Ok(true)
}

/// Relocate a text file in place.
///
/// Returns `true` if the file was modified.
pub fn relocate_text_file<P: AsRef<Path>>(path: P, prefixes: &PrefixMap) -> Result<bool, Error> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    let Some(new_data) = replace_text(&data, prefixes) else {
        return Ok(false);
    };
    if new_data == data {
        return Ok(false);
    }
    debug!("Replaced prefixes in text file {:?}", path);
    write_in_place(path, &new_data, None)?;
    Ok(true)
}

/// Replace the contents of `path` via a temporary file in the same directory.
///
/// Permission bits are preserved. When `expected_len` is set, the temporary file is checked to
/// have exactly this length before it replaces the original.
pub(crate) fn write_in_place(
    path: &Path,
    contents: &[u8],
    expected_len: Option<usize>,
) -> Result<(), Error> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidArgument(format!("{:?} is not a file", path)))?;
    let new_file_name = {
        let mut name = OsString::new();
        name.push(".");
        name.push(file_name);
        name.push(".binreloc.tmp");
        name
    };
    let new_path = match path.parent() {
        Some(parent) => parent.join(&new_file_name),
        None => new_file_name.into(),
    };
    let permissions = fs::metadata(path)?.permissions();
    let _ = std::fs::remove_file(&new_path);
    let result = write_new_file(&new_path, contents, expected_len, path).and_then(|()| {
        fs::set_permissions(&new_path, permissions)?;
        fs::rename(&new_path, path)?;
        Ok(())
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&new_path);
    }
    result
}

fn write_new_file(
    new_path: &Path,
    contents: &[u8],
    expected_len: Option<usize>,
    path: &Path,
) -> Result<(), Error> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(new_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    let actual = file.metadata()?.len() as usize;
    if let Some(expected) = expected_len {
        if actual != expected {
            return Err(Error::LengthMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
            });
        }
    }
    Ok(())
}
