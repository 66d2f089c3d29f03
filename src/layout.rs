//! Output section layout.
//!
//! Defines the structures organizing the output image's sections. Input
//! section fragments from every loaded object module are appended to one of
//! a fixed set of output sections, which later receive their RVAs and file
//! offsets.

use object::read::SectionIndex;
use object::{pe, SectionKind};

/// PE section alignment (one page).
pub const SECTION_ALIGNMENT: u32 = 0x1000;
/// PE file alignment.
pub const FILE_ALIGNMENT: u32 = 0x200;

/// Indices of the fixed fragment-bearing output sections.
pub const TEXT: usize = 0;
pub const RDATA: usize = 1;
pub const DATA: usize = 2;
pub const BSS: usize = 3;

/// Map an input section kind to the output section that collects it.
/// Returns None for sections the image does not load (debug, directives).
pub fn classify_section(kind: SectionKind) -> Option<usize> {
    match kind {
        SectionKind::Text => Some(TEXT),
        SectionKind::ReadOnlyData | SectionKind::ReadOnlyString => Some(RDATA),
        SectionKind::Data => Some(DATA),
        SectionKind::UninitializedData => Some(BSS),
        _ => None,
    }
}

/// One input section's slice of an output section.
pub struct Fragment {
    /// Index of the object module in the session's object list.
    pub object_index: usize,
    /// Index of the section in that object.
    pub section_index: SectionIndex,
    /// Offset of this fragment within the output section.
    pub offset: u32,
}

/// One section of the output image, aggregating same-kind input fragments.
pub struct OutputSection {
    /// Section name as it appears in the section header (e.g. ".text").
    pub name: String,
    /// The section kind used for classifying input sections.
    pub kind: SectionKind,
    /// PE section characteristics flags.
    pub characteristics: u32,
    /// Input fragments making up this section.
    pub fragments: Vec<Fragment>,
    /// Total size in memory.
    pub virtual_size: u32,
    /// RVA assigned during layout.
    pub rva: u32,
    /// File offset of the raw data, 0 for zero-fill sections.
    pub file_offset: u32,
    /// Raw contents (empty for zero-fill sections).
    pub data: Vec<u8>,
}

impl OutputSection {
    pub fn new(name: &str, kind: SectionKind) -> Self {
        let characteristics = match kind {
            SectionKind::Text => {
                pe::IMAGE_SCN_CNT_CODE | pe::IMAGE_SCN_MEM_EXECUTE | pe::IMAGE_SCN_MEM_READ
            }
            SectionKind::ReadOnlyData => {
                pe::IMAGE_SCN_CNT_INITIALIZED_DATA | pe::IMAGE_SCN_MEM_READ
            }
            SectionKind::Data => {
                pe::IMAGE_SCN_CNT_INITIALIZED_DATA
                    | pe::IMAGE_SCN_MEM_READ
                    | pe::IMAGE_SCN_MEM_WRITE
            }
            SectionKind::UninitializedData => {
                pe::IMAGE_SCN_CNT_UNINITIALIZED_DATA
                    | pe::IMAGE_SCN_MEM_READ
                    | pe::IMAGE_SCN_MEM_WRITE
            }
            _ => pe::IMAGE_SCN_CNT_INITIALIZED_DATA | pe::IMAGE_SCN_MEM_READ,
        };
        Self {
            name: name.to_string(),
            kind,
            characteristics,
            fragments: Vec::new(),
            virtual_size: 0,
            rva: 0,
            file_offset: 0,
            data: Vec::new(),
        }
    }

    /// True for sections that occupy no space in the file.
    pub fn is_zero_fill(&self) -> bool {
        self.kind == SectionKind::UninitializedData
    }

    /// Size of the raw data as stored in the file, aligned for the header.
    pub fn raw_data_size(&self) -> u32 {
        if self.is_zero_fill() {
            0
        } else {
            crate::utils::align_up32(self.virtual_size, FILE_ALIGNMENT)
        }
    }
}
