//! Object module handling.
//!
//! An `ObjectModule` wraps the raw bytes of one COFF translation unit,
//! loaded either directly from disk or extracted from a library archive.
//! Analysis feeds the module's public symbols into the global symbol table
//! and its unresolved references onto the resolution worklist. DLL import
//! thunks (short import format) are recognized here and carry an
//! `ImportDescriptor` instead of sections.

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use object::coff::{ImportFile, ImportName};
use object::read::{Object, ObjectSection, ObjectSymbol};
use object::{Architecture as ObjArch, SymbolKind};
use std::fs::File;
use std::path::Path;

use crate::layout::classify_section;
use crate::symbol::SymbolTable;

/// Raw object bytes: mapped for files given on the command line, owned
/// copies for members extracted from a library archive.
pub enum ObjectData {
    Mapped(Mmap),
    Extracted(Vec<u8>),
}

impl ObjectData {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ObjectData::Mapped(mmap) => mmap,
            ObjectData::Extracted(vec) => vec,
        }
    }
}

/// The import named by a DLL import thunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDescriptor {
    /// DLL the import comes from (e.g. "USER32.dll").
    pub dll: String,
    /// Public symbol the thunk defines; empty for descriptor placeholders.
    pub symbol: String,
    /// Imported function name, when importing by name.
    pub name: Option<String>,
    /// Ordinal, when importing by ordinal.
    pub ordinal: Option<u16>,
}

/// One compiled translation unit, loaded from disk or pulled from a library.
pub struct ObjectModule {
    /// Path or `lib(member)` style display name.
    pub name: String,
    /// Owning library path, when extracted from one.
    pub library: Option<String>,
    /// Owning library index, for diagnostics.
    pub library_index: Option<usize>,
    pub from_library: bool,
    pub data: ObjectData,
    /// Number of loadable sections this module contributes.
    pub loaded_sections: usize,
    /// Set when the module is a DLL import thunk.
    pub import: Option<ImportDescriptor>,
}

/// Short import header magic: sig1 = 0, sig2 = 0xFFFF.
pub fn is_import_stub(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == [0x00, 0x00, 0xFF, 0xFF]
}

impl ObjectModule {
    /// Map an object file given on the command line.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map {}", path.display()))?;
        Ok(Self {
            name: path.display().to_string(),
            library: None,
            library_index: None,
            from_library: false,
            data: ObjectData::Mapped(mmap),
            loaded_sections: 0,
            import: None,
        })
    }

    /// Wrap raw bytes extracted from a library archive member.
    pub fn from_library_member(
        member_name: &str,
        library: &str,
        library_index: usize,
        data: Vec<u8>,
    ) -> Self {
        Self {
            name: format!("{library}({member_name})"),
            library: Some(library.to_string()),
            library_index: Some(library_index),
            from_library: true,
            data: ObjectData::Extracted(data),
            loaded_sections: 0,
            import: None,
        }
    }

    /// Parse the module as a COFF file. Import thunks have no COFF payload
    /// and must not be parsed.
    pub fn parse(&self) -> Result<object::File<'_>> {
        object::File::parse(self.data.as_slice())
            .with_context(|| format!("failed to parse object file {}", self.name))
    }

    /// Analyze the module exactly once: verify the machine type, feed
    /// definitions into the public symbol map and references onto the
    /// worklist, and record the contributed section count.
    pub fn analyze(&mut self, index: usize, table: &mut SymbolTable) -> Result<()> {
        if is_import_stub(self.data.as_slice()) {
            let descriptor = parse_import_stub(self.data.as_slice(), &self.name)?;
            if !descriptor.symbol.is_empty() {
                table.define(&descriptor.symbol, index, None, 0, true, false);
            }
            self.import = Some(descriptor);
            return Ok(());
        }

        let mut section_count = 0;
        {
            let file = object::File::parse(self.data.as_slice())
                .with_context(|| format!("failed to parse object file {}", self.name))?;
            if file.architecture() != ObjArch::I386 {
                bail!(
                    "unsupported architecture in {}: {:?}, only i386 COFF is supported",
                    self.name,
                    file.architecture()
                );
            }

            for sym in file.symbols() {
                let name = sym.name().with_context(|| {
                    format!("bad symbol name in object file {}", self.name)
                })?;
                if name.is_empty() {
                    continue;
                }
                match sym.kind() {
                    SymbolKind::File | SymbolKind::Section => continue,
                    _ => {}
                }
                if sym.is_common() {
                    let size = sym.size().max(sym.address());
                    table.define_common(name, index, size);
                    continue;
                }
                if sym.is_undefined() {
                    if sym.is_local() {
                        continue;
                    }
                    table.reference(name, index, sym.is_weak());
                    continue;
                }
                if sym.is_local() {
                    continue;
                }
                if let Some(section_index) = sym.section_index() {
                    table.define(name, index, Some(section_index), sym.address(), false, sym.is_weak());
                } else {
                    table.define(name, index, None, sym.address(), true, sym.is_weak());
                }
            }

            for section in file.sections() {
                if section.size() > 0 && classify_section(section.kind()).is_some() {
                    section_count += 1;
                }
            }
        }
        self.loaded_sections = section_count;
        Ok(())
    }
}

fn parse_import_stub(data: &[u8], name: &str) -> Result<ImportDescriptor> {
    if data.len() < 20 {
        bail!("truncated import thunk {name}");
    }
    // Machine field sits at offset 6 of the import header.
    let machine = u16::from_le_bytes([data[6], data[7]]);
    if machine != object::pe::IMAGE_FILE_MACHINE_I386 {
        bail!("unsupported machine {machine:#x} in import thunk {name}");
    }
    let import = ImportFile::parse(data)
        .with_context(|| format!("failed to parse import thunk {name}"))?;
    let symbol = String::from_utf8_lossy(import.symbol()).into_owned();
    let dll = String::from_utf8_lossy(import.dll()).into_owned();
    let (import_name, ordinal) = match import.import() {
        ImportName::Name(n) => (Some(String::from_utf8_lossy(n).into_owned()), None),
        ImportName::Ordinal(ord) => (None, Some(ord)),
    };
    Ok(ImportDescriptor {
        dll,
        symbol,
        name: import_name,
        ordinal,
    })
}
