use std::time::Duration;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const FAT_MAGIC: u32 = 0xcafe_babe;
/// Java class files share the fat magic; their "arch count" is the class file version.
pub const MAX_FAT_ARCHES: u32 = 30;
pub const FAT_HEADER_LEN: usize = 8;

pub const MH_OBJECT: u32 = 0x1;
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_BUNDLE: u32 = 0x8;

pub const SNIFF_LEN: usize = 4096;

pub const DEFAULT_SUFFIX_SAFETY_SIZE: usize = 7;
pub const DEFAULT_LOOKAHEAD: usize = 256;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_FIXUP_PASSES: usize = 16;
pub const MIN_STRING_LEN: usize = 4;

pub const ORIGIN: &str = "$ORIGIN";
pub const ORIGIN_BRACES: &str = "${ORIGIN}";
pub const LOADER_PATH: &str = "@loader_path";
pub const EXECUTABLE_PATH: &str = "@executable_path";
pub const RPATH_TOKEN: &str = "@rpath";
