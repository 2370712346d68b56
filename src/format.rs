use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;

use log::trace;

use crate::constants::*;
use crate::fs::File;
use crate::Error;

/// File format as far as relocation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    /// ELF executable, shared object or any other ELF file.
    Elf,
    /// Mach-O dynamic library or bundle.
    MachODylib,
    /// Mach-O executable.
    MachOExecutable,
    /// Mach-O relocatable object file.
    ///
    /// Has neither install name nor RPATH load commands.
    MachOObject,
    /// Unknown format without NUL bytes in the first few kilobytes.
    Text,
    /// Unknown binary data.
    Other,
}

impl FileFormat {
    /// Mach-O file of any kind.
    pub fn is_macho(self) -> bool {
        matches!(
            self,
            Self::MachODylib | Self::MachOExecutable | Self::MachOObject
        )
    }

    /// Contents have to be rewritten without changing the file length.
    pub fn is_binary(self) -> bool {
        !matches!(self, Self::Text)
    }

    /// File carries RPATH or install name entries that linker tools can rewrite.
    pub fn has_linker_metadata(self) -> bool {
        matches!(self, Self::Elf | Self::MachODylib | Self::MachOExecutable)
    }

    /// Short lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Elf => "elf",
            Self::MachODylib => "mach-o dylib",
            Self::MachOExecutable => "mach-o executable",
            Self::MachOObject => "mach-o object",
            Self::Text => "text",
            Self::Other => "other",
        }
    }
}

/// Detect the format of the file at `path` by looking at its first bytes.
///
/// Only fails when the file can't be read.
pub fn classify<P: AsRef<Path>>(path: P) -> Result<FileFormat, Error> {
    let path = path.as_ref();
    let to_error = |e: std::io::Error| Error::Classification(path.to_path_buf(), e);
    let mut file = File::open(path).map_err(to_error)?;
    let mut bytes = Vec::with_capacity(SNIFF_LEN);
    file.by_ref()
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut bytes)
        .map_err(to_error)?;
    let format = match fat_first_offset(&bytes) {
        Some(offset) => {
            let offset = offset as usize;
            match bytes.get(offset..) {
                Some(slice) if slice.len() >= 16 => {
                    classify_macho_header(slice).unwrap_or(FileFormat::Other)
                }
                _ => {
                    // The first slice lies beyond the sniffed bytes.
                    let mut header = [0_u8; 16];
                    file.seek(SeekFrom::Start(offset as u64)).map_err(to_error)?;
                    match file.read_exact(&mut header[..]) {
                        Ok(()) => classify_macho_header(&header[..]).unwrap_or(FileFormat::Other),
                        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            FileFormat::Other
                        }
                        Err(e) => return Err(to_error(e)),
                    }
                }
            }
        }
        None => classify_bytes(&bytes),
    };
    trace!("Classified {:?} as {}", path, format.as_str());
    Ok(format)
}

/// Detect the format from the first bytes of a file.
///
/// Universal Mach-O files are classified by their first slice only if the slice is within `bytes`.
pub fn classify_bytes(bytes: &[u8]) -> FileFormat {
    if bytes.starts_with(&ELF_MAGIC) {
        return FileFormat::Elf;
    }
    if let Some(format) = classify_macho_header(bytes) {
        return format;
    }
    if let Some(offset) = fat_first_offset(bytes) {
        return bytes
            .get(offset as usize..)
            .and_then(classify_macho_header)
            .unwrap_or(FileFormat::Other);
    }
    if memchr::memchr(0, bytes).is_some() {
        FileFormat::Other
    } else {
        FileFormat::Text
    }
}

fn classify_macho_header(bytes: &[u8]) -> Option<FileFormat> {
    let magic: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let read_u32: fn([u8; 4]) -> u32 = match u32::from_le_bytes(magic) {
        MH_MAGIC | MH_MAGIC_64 => u32::from_le_bytes,
        _ => match u32::from_be_bytes(magic) {
            MH_MAGIC | MH_MAGIC_64 => u32::from_be_bytes,
            _ => return None,
        },
    };
    let file_type = read_u32(bytes.get(12..16)?.try_into().ok()?);
    let format = match file_type {
        MH_DYLIB | MH_BUNDLE => FileFormat::MachODylib,
        MH_EXECUTE => FileFormat::MachOExecutable,
        MH_OBJECT => FileFormat::MachOObject,
        _ => FileFormat::Other,
    };
    Some(format)
}

/// Returns the offset of the first architecture slice of a universal binary.
fn fat_first_offset(bytes: &[u8]) -> Option<u64> {
    let magic = u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?);
    if magic != FAT_MAGIC {
        return None;
    }
    let num_arches = u32::from_be_bytes(bytes.get(4..8)?.try_into().ok()?);
    if num_arches == 0 || num_arches > MAX_FAT_ARCHES {
        return None;
    }
    // fat_arch: cputype, cpusubtype, offset, size, align
    let offset_start = FAT_HEADER_LEN + 8;
    let offset = u32::from_be_bytes(bytes.get(offset_start..offset_start + 4)?.try_into().ok()?);
    Some(offset as u64)
}
