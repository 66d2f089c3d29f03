//! i386 architecture backend.
//!
//! Implements the `Architecture` trait for 32-bit x86 COFF relocations.

use super::Architecture;
use anyhow::{anyhow, Result};
use object::read::Relocation;
use object::{pe, RelocationFlags, RelocationKind};

/// The i386 architecture backend.
pub struct I386;

impl Architecture for I386 {
    fn machine(&self) -> u16 {
        pe::IMAGE_FILE_MACHINE_I386
    }

    fn apply_relocation(
        &self,
        offset: u64,
        reloc: &Relocation,
        p: u64, // Place of storage (P) - the VA where the relocation is written
        s: u64, // Symbol value (S)
        image_base: u64,
        data: &mut [u8],
    ) -> Result<()> {
        let offset = offset as usize;

        // COFF stores the addend in place; fold it into the explicit one.
        let mut addend = reloc.addend();
        if reloc.has_implicit_addend() && offset + 4 <= data.len() {
            addend += i64::from(i32::from_le_bytes(
                data[offset..offset + 4].try_into().unwrap(),
            ));
        }

        // DIR32NB may come through as a raw COFF type rather than a mapped kind.
        let is_image_relative = matches!(
            reloc.flags(),
            RelocationFlags::Coff { typ } if typ == pe::IMAGE_REL_I386_DIR32NB
        );

        let val: i64 = match reloc.kind() {
            // IMAGE_REL_I386_DIR32: S + A
            RelocationKind::Absolute => s as i64 + addend,

            // IMAGE_REL_I386_REL32: S + A - P (A carries the -4 displacement bias)
            RelocationKind::Relative => s as i64 + addend - p as i64,

            // IMAGE_REL_I386_DIR32NB: S + A - image base
            RelocationKind::ImageOffset => s as i64 + addend - image_base as i64,

            _ => {
                if is_image_relative {
                    s as i64 + addend - image_base as i64
                } else {
                    tracing::trace!("Unsupported relocation kind: {:?}", reloc.kind());
                    return Ok(());
                }
            }
        };

        match reloc.size() {
            32 => {
                // Relative displacements must fit a signed 32-bit field;
                // absolute addresses an unsigned one.
                if val < i64::from(i32::MIN) || val > i64::from(u32::MAX) {
                    return Err(anyhow!(
                        "relocation overflow at VA {:#x}: value {:#x} exceeds 32-bit range \
                         (S is {:#x}, P is {:#x})",
                        p,
                        val,
                        s,
                        p
                    ));
                }
                let bytes = (val as u32).to_le_bytes();
                if offset + 4 <= data.len() {
                    data[offset..offset + 4].copy_from_slice(&bytes);
                } else {
                    return Err(anyhow!("relocation offset out of bounds at {:#x}", offset));
                }
            }
            _ => return Err(anyhow!("unsupported relocation size: {}", reloc.size())),
        }

        Ok(())
    }
}
