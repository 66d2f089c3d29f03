//! Library symbol search.
//!
//! One locator abstraction over the two configured search modes: a single
//! combined directory across all libraries, or a walk of each library's own
//! directory in load order. Both perform the same underscore-prefixed retry
//! when the exact name misses, reported as a warning rather than an error.

use anyhow::Result;

use crate::diag::{Diagnostics, Message};
use crate::library::{CombinedSymbolMap, LibraryFile};

/// A member located for an unresolved symbol.
pub struct LocatedMember {
    /// Index of the owning library in the session's library list.
    pub library: usize,
    /// Byte offset of the member within the archive.
    pub offset: u64,
    /// The member's raw bytes, read once per resolution attempt.
    pub data: Vec<u8>,
}

/// Symbol search capability, fixed at session construction.
pub enum SymbolLocator {
    /// One directory across all libraries.
    Combined { map: CombinedSymbolMap },
    /// Each library carries its own directory; first hit in load order wins.
    PerLibrary,
}

impl SymbolLocator {
    /// Search every library for a member defining `name`. An exact-name
    /// miss is retried once with an underscore prefix; a hit on the retry
    /// is recoverable and logged as a warning.
    pub fn find(
        &self,
        libraries: &mut [LibraryFile],
        name: &str,
        diag: &mut Diagnostics,
    ) -> Result<Option<LocatedMember>> {
        if let Some(found) = self.find_exact(libraries, name)? {
            return Ok(Some(found));
        }
        let prefixed = format!("_{name}");
        if let Some(found) = self.find_exact(libraries, &prefixed)? {
            diag.report(Message::UnderscoreFallback, Some(name), Some(&prefixed));
            return Ok(Some(found));
        }
        Ok(None)
    }

    fn find_exact(
        &self,
        libraries: &mut [LibraryFile],
        name: &str,
    ) -> Result<Option<LocatedMember>> {
        match self {
            SymbolLocator::Combined { map } => {
                let Some(&(library, offset)) = map.get(name) else {
                    return Ok(None);
                };
                Ok(libraries[library]
                    .read_member(offset)?
                    .map(|data| LocatedMember {
                        library,
                        offset,
                        data,
                    }))
            }
            SymbolLocator::PerLibrary => {
                for library in libraries.iter_mut() {
                    let Some(offset) = library
                        .symbols
                        .as_ref()
                        .and_then(|map| map.get(name).copied())
                    else {
                        continue;
                    };
                    let index = library.index;
                    return Ok(library.read_member(offset)?.map(|data| LocatedMember {
                        library: index,
                        offset,
                        data,
                    }));
                }
                Ok(None)
            }
        }
    }
}
