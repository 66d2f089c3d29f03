//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the linker using `clap`.
//! The option set mirrors the toolchain front end: ordered object and library
//! lists, an export list, and the handful of image parameters the PE header
//! needs.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// The subsystem the output image declares to the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Subsystem {
    /// Character-mode (console) application.
    #[default]
    Console,
    /// Graphical windows application.
    Gui,
}

/// A linker for i386 COFF objects producing PE32 executables and DLLs.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Input object files, linked in the given order
    #[arg(required = true, num_args = 1..)]
    pub objects: Vec<PathBuf>,

    /// Library files searched for unresolved symbols, in the given order
    #[arg(short = 'l', long = "lib")]
    pub libraries: Vec<PathBuf>,

    /// Symbol names to place in the export table
    #[arg(short = 'e', long = "export")]
    pub exports: Vec<String>,

    /// Output file
    #[arg(short, long, default_value = "a.exe", help = "Path to the output image")]
    pub output: PathBuf,

    /// Resource file to include (checked for readability)
    #[arg(long)]
    pub resource: Option<PathBuf>,

    /// Subsystem of the output image
    #[arg(long, value_enum, default_value = "console")]
    pub subsystem: Subsystem,

    /// Build a DLL instead of an executable
    #[arg(long)]
    pub dll: bool,

    /// Target Windows NT (newer OS/subsystem version fields)
    #[arg(long)]
    pub windows_nt: bool,

    /// Emit a COFF symbol table for debuggers
    #[arg(long)]
    pub debug_info: bool,

    /// Stack reserve size in bytes
    #[arg(long, default_value_t = 0x0010_0000)]
    pub stack_size: u32,

    /// Preferred load address of the image
    #[arg(long, default_value_t = 0x0040_0000)]
    pub image_base: u32,

    /// Build one combined symbol index across all libraries instead of one per library
    #[arg(long)]
    pub combined_lib_index: bool,

    /// Startup symbol bound to the image entry point
    #[arg(long, default_value = "mainCRTStartup")]
    pub entry: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::{Config, Subsystem};
    use clap::Parser;

    #[test]
    fn defaults() {
        let config = Config::parse_from(["pelink", "main.obj"]);
        assert_eq!(config.objects.len(), 1);
        assert!(config.libraries.is_empty());
        assert_eq!(config.subsystem, Subsystem::Console);
        assert_eq!(config.entry, "mainCRTStartup");
        assert_eq!(config.image_base, 0x0040_0000);
        assert!(!config.dll);
    }

    #[test]
    fn ordered_lists() {
        let config = Config::parse_from([
            "pelink", "a.obj", "b.obj", "-l", "one.lib", "-l", "two.lib", "-e", "fn_a", "--dll",
        ]);
        assert_eq!(config.objects.len(), 2);
        assert_eq!(config.libraries[0].to_str(), Some("one.lib"));
        assert_eq!(config.libraries[1].to_str(), Some("two.lib"));
        assert_eq!(config.exports, vec!["fn_a".to_string()]);
        assert!(config.dll);
    }
}
