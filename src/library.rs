//! Library archive handling.
//!
//! A `LibraryFile` keeps a static archive mapped for the whole session and
//! exposes its members by byte offset. Loading scans every member once to
//! build a symbol directory: either the library's own map or a combined map
//! shared by all libraries, depending on the session's search mode. Object
//! modules extracted from a library are owned by the session's flat object
//! list; the library only remembers the last accessed member name for
//! diagnostics.

use anyhow::{Context, Result};
use memmap2::Mmap;
use object::read::archive::ArchiveFile;
use object::read::{Object, ObjectSymbol};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::object::is_import_stub;

// Pre-sized like the original library directory hash table.
const LIBRARY_MAP_CAPACITY: usize = 1024;

/// Marks a directory entry with no backing member data.
pub const INVALID_MEMBER_OFFSET: u64 = u64::MAX;

/// Symbol directory shared by all libraries in combined-index mode:
/// name -> (library index, member offset). First library wins.
pub type CombinedSymbolMap = HashMap<String, (usize, u64)>;

/// One static archive loaded from disk.
pub struct LibraryFile {
    pub path: PathBuf,
    /// Position in the session's library list.
    pub index: usize,
    mmap: Mmap,
    /// Per-library symbol directory; None in combined-index mode.
    pub symbols: Option<HashMap<String, u64>>,
    /// Name of the member read most recently, for diagnostics.
    pub last_member: Option<String>,
}

struct MemberPublics {
    offset: u64,
    publics: Vec<String>,
}

impl LibraryFile {
    /// Load a library building its own private symbol directory.
    pub fn load_with_own_index(path: &Path, index: usize) -> Result<Self> {
        let mmap = map_archive(path)?;
        let mut symbols = HashMap::with_capacity(LIBRARY_MAP_CAPACITY);
        for member in scan_members(&mmap, path)? {
            for public in member.publics {
                symbols.entry(public).or_insert(member.offset);
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            index,
            mmap,
            symbols: Some(symbols),
            last_member: None,
        })
    }

    /// Load a library feeding the combined symbol directory. On name
    /// collisions the earlier-loaded library keeps the entry.
    pub fn load_with_combined_index(
        path: &Path,
        index: usize,
        combined: &mut CombinedSymbolMap,
    ) -> Result<Self> {
        let mmap = map_archive(path)?;
        for member in scan_members(&mmap, path)? {
            for public in member.publics {
                combined.entry(public).or_insert((index, member.offset));
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            index,
            mmap,
            symbols: None,
            last_member: None,
        })
    }

    /// Read the raw bytes of the member at `offset`. Returns `Ok(None)` for
    /// the invalid-offset sentinel and for offsets naming no member; archive
    /// corruption is an error.
    pub fn read_member(&mut self, offset: u64) -> Result<Option<Vec<u8>>> {
        if offset == INVALID_MEMBER_OFFSET {
            return Ok(None);
        }
        let archive = ArchiveFile::parse(&*self.mmap)
            .with_context(|| format!("failed to parse library {}", self.path.display()))?;
        let base = self.mmap.as_ptr() as usize;
        for member in archive.members() {
            let member = member
                .with_context(|| format!("bad member in library {}", self.path.display()))?;
            let data = member
                .data(&*self.mmap)
                .with_context(|| format!("bad member data in {}", self.path.display()))?;
            if (data.as_ptr() as usize - base) as u64 == offset {
                self.last_member = Some(String::from_utf8_lossy(member.name()).into_owned());
                return Ok(Some(data.to_vec()));
            }
        }
        Ok(None)
    }
}

fn map_archive(path: &Path) -> Result<Mmap> {
    let file =
        File::open(path).with_context(|| format!("failed to open library {}", path.display()))?;
    unsafe { Mmap::map(&file) }.with_context(|| format!("failed to map {}", path.display()))
}

/// Walk the archive once, collecting every member's public symbol names and
/// byte offset.
fn scan_members(mmap: &Mmap, path: &Path) -> Result<Vec<MemberPublics>> {
    let archive = ArchiveFile::parse(&**mmap)
        .with_context(|| format!("failed to parse library {}", path.display()))?;
    let base = mmap.as_ptr() as usize;
    let mut members = Vec::new();
    for member in archive.members() {
        let member =
            member.with_context(|| format!("bad member in library {}", path.display()))?;
        let name = String::from_utf8_lossy(member.name()).into_owned();
        let data = member
            .data(&**mmap)
            .with_context(|| format!("bad member data in {}", path.display()))?;
        let offset = (data.as_ptr() as usize - base) as u64;
        let publics = member_publics(data)
            .with_context(|| format!("failed to parse member {name} in {}", path.display()))?;
        members.push(MemberPublics { offset, publics });
    }
    tracing::debug!(
        library = %path.display(),
        members = members.len(),
        "scanned library directory"
    );
    Ok(members)
}

fn member_publics(data: &[u8]) -> Result<Vec<String>> {
    if is_import_stub(data) {
        let import = object::coff::ImportFile::parse(data)?;
        let symbol = String::from_utf8_lossy(import.symbol()).into_owned();
        return Ok(if symbol.is_empty() { Vec::new() } else { vec![symbol] });
    }
    let file = object::File::parse(data)?;
    let mut publics = Vec::new();
    for sym in file.symbols() {
        if sym.is_undefined() || sym.is_local() || sym.is_common() {
            continue;
        }
        match sym.kind() {
            object::SymbolKind::File | object::SymbolKind::Section => continue,
            _ => {}
        }
        let name = sym.name()?;
        if !name.is_empty() {
            publics.push(name.to_string());
        }
    }
    Ok(publics)
}
