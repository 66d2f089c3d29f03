//! PE file writer.
//!
//! This module handles writing the final PE32 image file: DOS header, NT
//! headers, data directories, section headers, raw section data and, when
//! debug info is enabled, the trailing COFF symbol table.

use anyhow::{Context, Result};
use object::endian::{LittleEndian, U16, U32};
use object::pe;
use object::pod::bytes_of;

use crate::config::Subsystem;
use crate::image::ExecutableImage;
use crate::layout::{OutputSection, FILE_ALIGNMENT, SECTION_ALIGNMENT};

fn u16c(v: u16) -> U16<LittleEndian> {
    U16::new(LittleEndian, v)
}
fn u32c(v: u32) -> U32<LittleEndian> {
    U32::new(LittleEndian, v)
}

/// Write the assembled image to its target path.
pub fn write_image(image: &ExecutableImage, machine: u16) -> Result<()> {
    let emitted: Vec<&OutputSection> = image.emitted_sections().collect();
    let symtab_pointer = if image.debug_symbols.is_empty() {
        0
    } else {
        image.file_end()
    };

    let mut buffer = Vec::with_capacity(image.file_end() as usize);

    // DOS header, no stub: e_lfanew points directly past it.
    let dos_header = pe::ImageDosHeader {
        e_magic: u16c(pe::IMAGE_DOS_SIGNATURE),
        e_cblp: u16c(0),
        e_cp: u16c(0),
        e_crlc: u16c(0),
        e_cparhdr: u16c(4),
        e_minalloc: u16c(0),
        e_maxalloc: u16c(0),
        e_ss: u16c(0),
        e_sp: u16c(0),
        e_csum: u16c(0),
        e_ip: u16c(0),
        e_cs: u16c(0),
        e_lfarlc: u16c(0),
        e_ovno: u16c(0),
        e_res: [u16c(0); 4],
        e_oemid: u16c(0),
        e_oeminfo: u16c(0),
        e_res2: [u16c(0); 10],
        e_lfanew: u32c(64),
    };
    buffer.extend_from_slice(bytes_of(&dos_header));
    buffer.extend_from_slice(&pe::IMAGE_NT_SIGNATURE.to_le_bytes());

    let mut characteristics = pe::IMAGE_FILE_EXECUTABLE_IMAGE
        | pe::IMAGE_FILE_32BIT_MACHINE
        | pe::IMAGE_FILE_LINE_NUMS_STRIPPED
        | pe::IMAGE_FILE_RELOCS_STRIPPED;
    if image.build_dll {
        characteristics |= pe::IMAGE_FILE_DLL;
    }
    if image.debug_symbols.is_empty() {
        characteristics |= pe::IMAGE_FILE_LOCAL_SYMS_STRIPPED;
    }

    let file_header = pe::ImageFileHeader {
        machine: u16c(machine),
        number_of_sections: u16c(emitted.len() as u16),
        time_date_stamp: u32c(0),
        pointer_to_symbol_table: u32c(symtab_pointer),
        number_of_symbols: u32c(image.debug_symbol_count),
        size_of_optional_header: u16c(0xE0),
        characteristics: u16c(characteristics),
    };
    buffer.extend_from_slice(bytes_of(&file_header));

    let size_of_code: u32 = emitted
        .iter()
        .filter(|s| s.characteristics & pe::IMAGE_SCN_CNT_CODE != 0)
        .map(|s| s.raw_data_size())
        .sum();
    let size_of_initialized_data: u32 = emitted
        .iter()
        .filter(|s| s.characteristics & pe::IMAGE_SCN_CNT_INITIALIZED_DATA != 0)
        .map(|s| s.raw_data_size())
        .sum();
    let size_of_uninitialized_data: u32 = emitted
        .iter()
        .filter(|s| s.is_zero_fill())
        .map(|s| s.virtual_size)
        .sum();
    let base_of_code = emitted
        .iter()
        .find(|s| s.characteristics & pe::IMAGE_SCN_CNT_CODE != 0)
        .map_or(0, |s| s.rva);
    let base_of_data = emitted
        .iter()
        .find(|s| s.characteristics & pe::IMAGE_SCN_CNT_CODE == 0)
        .map_or(0, |s| s.rva);

    let (os_version, subsystem_version) = if image.windows_nt { (4, 0) } else { (3, 10) };
    let subsystem = match image.subsystem {
        Subsystem::Console => pe::IMAGE_SUBSYSTEM_WINDOWS_CUI,
        Subsystem::Gui => pe::IMAGE_SUBSYSTEM_WINDOWS_GUI,
    };

    let optional_header = pe::ImageOptionalHeader32 {
        magic: u16c(pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC),
        major_linker_version: 1,
        minor_linker_version: 0,
        size_of_code: u32c(size_of_code),
        size_of_initialized_data: u32c(size_of_initialized_data),
        size_of_uninitialized_data: u32c(size_of_uninitialized_data),
        address_of_entry_point: u32c(image.entry_rva),
        base_of_code: u32c(base_of_code),
        base_of_data: u32c(base_of_data),
        image_base: u32c(image.image_base),
        section_alignment: u32c(SECTION_ALIGNMENT),
        file_alignment: u32c(FILE_ALIGNMENT),
        major_operating_system_version: u16c(os_version),
        minor_operating_system_version: u16c(subsystem_version),
        major_image_version: u16c(0),
        minor_image_version: u16c(0),
        major_subsystem_version: u16c(os_version),
        minor_subsystem_version: u16c(subsystem_version),
        win32_version_value: u32c(0),
        size_of_image: u32c(image.image_size),
        size_of_headers: u32c(image.headers_size),
        check_sum: u32c(0),
        subsystem: u16c(subsystem),
        dll_characteristics: u16c(0),
        size_of_stack_reserve: u32c(image.stack_size),
        size_of_stack_commit: u32c(0x1000),
        size_of_heap_reserve: u32c(0x0010_0000),
        size_of_heap_commit: u32c(0x1000),
        loader_flags: u32c(0),
        number_of_rva_and_sizes: u32c(16),
    };
    buffer.extend_from_slice(bytes_of(&optional_header));

    let mut directories = [pe::ImageDataDirectory {
        virtual_address: u32c(0),
        size: u32c(0),
    }; 16];
    directories[pe::IMAGE_DIRECTORY_ENTRY_EXPORT] = pe::ImageDataDirectory {
        virtual_address: u32c(image.export_dir.rva),
        size: u32c(image.export_dir.size),
    };
    directories[pe::IMAGE_DIRECTORY_ENTRY_IMPORT] = pe::ImageDataDirectory {
        virtual_address: u32c(image.import_dir.rva),
        size: u32c(image.import_dir.size),
    };
    directories[pe::IMAGE_DIRECTORY_ENTRY_IAT] = pe::ImageDataDirectory {
        virtual_address: u32c(image.iat_dir.rva),
        size: u32c(image.iat_dir.size),
    };
    for directory in &directories {
        buffer.extend_from_slice(bytes_of(directory));
    }

    for section in &emitted {
        let mut name = [0u8; 8];
        let bytes = section.name.as_bytes();
        let len = bytes.len().min(8);
        name[..len].copy_from_slice(&bytes[..len]);
        let header = pe::ImageSectionHeader {
            name,
            virtual_size: u32c(section.virtual_size),
            virtual_address: u32c(section.rva),
            size_of_raw_data: u32c(section.raw_data_size()),
            pointer_to_raw_data: u32c(section.file_offset),
            pointer_to_relocations: u32c(0),
            pointer_to_linenumbers: u32c(0),
            number_of_relocations: u16c(0),
            number_of_linenumbers: u16c(0),
            characteristics: u32c(section.characteristics),
        };
        buffer.extend_from_slice(bytes_of(&header));
    }

    buffer.resize(image.headers_size as usize, 0);

    for section in &emitted {
        if section.is_zero_fill() {
            continue;
        }
        buffer.resize(section.file_offset as usize, 0);
        buffer.extend_from_slice(&section.data);
        buffer.resize((section.file_offset + section.raw_data_size()) as usize, 0);
    }

    if !image.debug_symbols.is_empty() {
        buffer.resize(symtab_pointer as usize, 0);
        buffer.extend_from_slice(&image.debug_symbols);
    }

    std::fs::write(&image.output_path, &buffer)
        .with_context(|| format!("failed to write {}", image.output_path.display()))?;

    tracing::info!(
        path = %image.output_path.display(),
        size = buffer.len(),
        "wrote output image"
    );
    Ok(())
}
