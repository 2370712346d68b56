#![doc = include_str!("../README.md")]

mod check;
pub(crate) mod constants;
mod error;
mod format;
mod links;
mod macho;
mod prefix;
mod process;
mod relocate;
mod replace;
mod rpath;

pub(crate) use fs_err as fs;

pub use self::check::*;
pub use self::error::*;
pub use self::format::*;
pub use self::links::*;
pub use self::macho::*;
pub use self::prefix::*;
pub use self::relocate::*;
pub use self::replace::*;
pub use self::rpath::*;
