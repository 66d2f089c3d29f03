//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates the
//! machine-specific relocation arithmetic. The core pipeline decides when
//! relocations run and against which addresses; the backend decides how the
//! bytes are patched.

use anyhow::Result;
use object::read::Relocation;

pub mod i386;

/// A trait representing a target machine (e.g. i386).
pub trait Architecture {
    /// The PE machine id written to the file header.
    fn machine(&self) -> u16;

    /// Applies a relocation to a buffer.
    ///
    /// # Arguments
    /// * `offset` - The offset within the buffer where the relocation should be applied.
    /// * `reloc` - The relocation entry from the input object file.
    /// * `p` - The runtime address of the location being relocated (P).
    /// * `s` - The value of the symbol (S).
    /// * `image_base` - The image's preferred load address, for image-relative fixups.
    /// * `data` - The mutable buffer representing the section's data.
    fn apply_relocation(
        &self,
        offset: u64,
        reloc: &Relocation,
        p: u64,
        s: u64,
        image_base: u64,
        data: &mut [u8],
    ) -> Result<()>;
}
