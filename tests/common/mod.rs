//! Test fixture builders: i386 COFF objects, short import stubs, and
//! ar-style library archives, written to a temp directory for the session
//! to load.

#![allow(dead_code)]

use object::write::{Object, Relocation, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};
use std::path::{Path, PathBuf};

use pelink::config::{Config, Subsystem};

/// A small i386 COFF object with one .text section.
pub struct TestObj {
    obj: Object<'static>,
    text: object::write::SectionId,
}

impl TestObj {
    pub fn new() -> Self {
        let mut obj = Object::new(BinaryFormat::Coff, Architecture::I386, Endianness::Little);
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        Self { obj, text }
    }

    /// Append code to .text, returning its offset.
    pub fn append_code(&mut self, code: &[u8]) -> u64 {
        self.obj.append_section_data(self.text, code, 16)
    }

    /// Define a global function symbol at `value` within .text.
    pub fn define(&mut self, name: &str, value: u64) -> SymbolId {
        self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(self.text),
            flags: SymbolFlags::None,
        })
    }

    /// Record an undefined external reference.
    pub fn reference(&mut self, name: &str) -> SymbolId {
        self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        })
    }

    /// Record a weak undefined external reference.
    pub fn weak_reference(&mut self, name: &str) -> SymbolId {
        self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: true,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        })
    }

    /// Add a pc-relative call fixup against `symbol` at `offset` in .text.
    pub fn call_reloc(&mut self, offset: u64, symbol: SymbolId) {
        self.obj
            .add_relocation(
                self.text,
                Relocation {
                    offset,
                    symbol,
                    addend: -4,
                    flags: RelocationFlags::Generic {
                        kind: RelocationKind::Relative,
                        encoding: RelocationEncoding::Generic,
                        size: 32,
                    },
                },
            )
            .unwrap();
    }

    pub fn build(self) -> Vec<u8> {
        self.obj.write().unwrap()
    }
}

/// An object defining `name` at offset 0 of a one-return .text section.
pub fn defining_obj(name: &str) -> Vec<u8> {
    let mut obj = TestObj::new();
    obj.append_code(&[0xC3]);
    obj.define(name, 0);
    obj.build()
}

/// A short import stub: machine i386, import by name with the leading
/// underscore stripped (IMPORT_NAME_NOPREFIX).
pub fn import_stub(symbol: &str, dll: &str) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&0u16.to_le_bytes()); // sig1
    data.extend_from_slice(&0xFFFFu16.to_le_bytes()); // sig2
    data.extend_from_slice(&0u16.to_le_bytes()); // version
    data.extend_from_slice(&0x014Cu16.to_le_bytes()); // machine
    data.extend_from_slice(&0u32.to_le_bytes()); // time stamp
    let strings = symbol.len() + dll.len() + 2;
    data.extend_from_slice(&(strings as u32).to_le_bytes());
    data.extend_from_slice(&0u16.to_le_bytes()); // ordinal/hint
    let flags: u16 = 2 << 2; // type = code, name type = noprefix
    data.extend_from_slice(&flags.to_le_bytes());
    data.extend_from_slice(symbol.as_bytes());
    data.push(0);
    data.extend_from_slice(dll.as_bytes());
    data.push(0);
    data
}

/// Build an ar archive from (member name, bytes) pairs. Member names must
/// be short enough for the classic 16-byte header field.
pub fn build_archive(members: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut data = b"!<arch>\n".to_vec();
    for (name, content) in members {
        let mut header = [b' '; 60];
        let name_field = format!("{name}/");
        assert!(name_field.len() <= 16, "member name too long");
        header[..name_field.len()].copy_from_slice(name_field.as_bytes());
        header[16] = b'0'; // date
        header[28] = b'0'; // uid
        header[34] = b'0'; // gid
        header[40..43].copy_from_slice(b"644"); // mode
        let size = content.len().to_string();
        header[48..48 + size.len()].copy_from_slice(size.as_bytes());
        header[58] = b'`';
        header[59] = b'\n';
        data.extend_from_slice(&header);
        data.extend_from_slice(content);
        if content.len() % 2 == 1 {
            data.push(b'\n');
        }
    }
    data
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// A library no test symbol ever references, satisfying the mandatory
/// library list.
pub fn dummy_lib(dir: &Path) -> PathBuf {
    let archive = build_archive(&[("dummy", defining_obj("_dummy_sym"))]);
    write_file(dir, "dummy.lib", &archive)
}

/// A session config over the given inputs writing to `out.exe` in `dir`.
pub fn test_config(dir: &Path, objects: Vec<PathBuf>, libraries: Vec<PathBuf>) -> Config {
    Config {
        objects,
        libraries,
        exports: Vec::new(),
        output: dir.join("out.exe"),
        resource: None,
        subsystem: Subsystem::Console,
        dll: false,
        windows_nt: false,
        debug_info: false,
        stack_size: 0x0010_0000,
        image_base: 0x0040_0000,
        combined_lib_index: false,
        entry: "mainCRTStartup".to_string(),
        log_level: "info".to_string(),
    }
}
