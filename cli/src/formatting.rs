use colored::Colorize;
use std::io::BufWriter;
use std::io::Stdout;
use std::io::Write;

use binreloc::Changes;
use binreloc::FileFormat;
use binreloc::FileStatus;

pub struct Printer {
    first_title: bool,
    indent: bool,
    writer: BufWriter<Stdout>,
}

impl Printer {
    pub fn new(indent: bool) -> Self {
        Self {
            first_title: true,
            indent,
            writer: BufWriter::new(std::io::stdout()),
        }
    }

    pub fn title(&mut self, title: &str) {
        let newline = if !self.first_title {
            "\n"
        } else {
            self.first_title = false;
            ""
        };
        let _ = writeln!(self.writer, "{}{}", newline, title.bold().underline());
    }

    pub fn kv<V: std::fmt::Display>(&mut self, key: &str, value: V) {
        let indent = if self.indent { "  " } else { "" };
        let _ = writeln!(self.writer, "{}{}: {}", indent, key.bold().blue(), value);
    }

    pub fn row<V: std::fmt::Display>(&mut self, value: V) {
        let indent = if self.indent { "  " } else { "" };
        let _ = writeln!(self.writer, "{}{}", indent, value);
    }

    pub fn line<V: std::fmt::Display>(&mut self, value: V) {
        let _ = writeln!(self.writer, "{}", value);
    }
}

pub struct FileFormatStr(pub FileFormat);

impl std::fmt::Display for FileFormatStr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = self.0.as_str();
        match self.0 {
            FileFormat::Elf | FileFormat::MachODylib | FileFormat::MachOExecutable => {
                write!(f, "{}", s.green())
            }
            FileFormat::MachOObject | FileFormat::Other => write!(f, "{}", s.yellow()),
            FileFormat::Text => write!(f, "{}", s),
        }
    }
}

pub struct ChangesStr(pub Changes);

impl std::fmt::Display for ChangesStr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut changes_str = [b'-', b'-', b'-', b'-'];
        for flag in self.0.iter() {
            match flag {
                Changes::RPATH => changes_str[0] = b'r',
                Changes::INSTALL_NAME => changes_str[1] = b'i',
                Changes::CONTENTS => changes_str[2] = b'c',
                Changes::LINK => changes_str[3] = b'l',
                _ => {}
            }
        }
        for ch in changes_str {
            write!(f, "{}", ch as char)?;
        }
        Ok(())
    }
}

pub struct FileStatusStr<'a>(pub &'a FileStatus);

impl std::fmt::Display for FileStatusStr<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.0 {
            FileStatus::Unchanged => write!(f, "{} {}", "----".dimmed(), "unchanged".dimmed()),
            FileStatus::Modified(changes) => {
                write!(f, "{} {}", ChangesStr(*changes), "modified".green())
            }
            FileStatus::Failed(..) => write!(f, "{} {}", "----".dimmed(), "failed".red().bold()),
            FileStatus::Skipped => write!(f, "{} {}", "----".dimmed(), "skipped".yellow()),
        }
    }
}
