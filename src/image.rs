//! The output image under construction.
//!
//! `ExecutableImage` aggregates everything the later phases need: the
//! merged output sections, the fragment map used to translate (object,
//! section) pairs to image addresses, the import and export tables, and
//! the layout numbers the PE writer serializes. Phases run strictly in
//! order: assemble, relocate, optional debug info, raw-image build, write.

use anyhow::{anyhow, Context, Result};
use object::read::{Object, ObjectSection, ObjectSymbol, RelocationTarget, SectionIndex};
use object::{pe, SectionKind, SymbolKind};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::arch::Architecture;
use crate::config::{Config, Subsystem};
use crate::layout::{
    classify_section, Fragment, OutputSection, BSS, FILE_ALIGNMENT, SECTION_ALIGNMENT,
};
use crate::object::{ImportDescriptor, ObjectModule};
use crate::symbol::{Resolution, SymbolId, SymbolTable};
use crate::utils::{align_up, align_up32};

const IMPORT_DESCRIPTOR_SIZE: u32 = 20;
const EXPORT_DIRECTORY_SIZE: u32 = 40;
const COFF_SYMBOL_SIZE: usize = 18;

/// Index of a registered DLL import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImportId(pub usize);

/// One function imported from a DLL, with its IAT slot once laid out.
#[derive(Debug, Clone)]
pub struct DllImport {
    pub dll: String,
    /// Public symbol the import thunk defined.
    pub symbol: String,
    /// Import by name, or by ordinal when None.
    pub name: Option<String>,
    pub ordinal: Option<u16>,
    /// RVA of this import's address-table slot; assigned during assembly.
    pub iat_rva: u32,
}

/// One export-table entry, tagged with the originally requested name.
#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub name: String,
    pub symbol: SymbolId,
}

/// RVA/size pair for a PE data directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryExtent {
    pub rva: u32,
    pub size: u32,
}

/// The in-progress output binary.
pub struct ExecutableImage {
    pub output_path: PathBuf,
    pub subsystem: Subsystem,
    pub image_base: u32,
    pub stack_size: u32,
    pub build_dll: bool,
    pub windows_nt: bool,
    pub include_debug_info: bool,
    pub entry_symbol: Option<SymbolId>,
    pub exports: Vec<ExportEntry>,
    pub imports: Vec<DllImport>,
    /// Count of object modules that contributed loaded sections.
    pub loaded_objects: usize,
    pub(crate) sections: Vec<OutputSection>,
    section_map: HashMap<(usize, SectionIndex), (usize, u32)>,
    common_map: HashMap<String, u32>,
    idata_section: Option<usize>,
    edata_section: Option<usize>,
    pub(crate) import_dir: DirectoryExtent,
    pub(crate) iat_dir: DirectoryExtent,
    pub(crate) export_dir: DirectoryExtent,
    pub(crate) headers_size: u32,
    pub(crate) image_size: u32,
    pub(crate) entry_rva: u32,
    pub(crate) debug_symbols: Vec<u8>,
    pub(crate) debug_symbol_count: u32,
}

impl ExecutableImage {
    pub fn new(config: &Config) -> Self {
        Self {
            output_path: config.output.clone(),
            subsystem: config.subsystem,
            image_base: config.image_base,
            stack_size: config.stack_size,
            build_dll: config.dll,
            windows_nt: config.windows_nt,
            include_debug_info: config.debug_info,
            entry_symbol: None,
            exports: Vec::new(),
            imports: Vec::new(),
            loaded_objects: 0,
            sections: Vec::new(),
            section_map: HashMap::new(),
            common_map: HashMap::new(),
            idata_section: None,
            edata_section: None,
            import_dir: DirectoryExtent::default(),
            iat_dir: DirectoryExtent::default(),
            export_dir: DirectoryExtent::default(),
            headers_size: 0,
            image_size: 0,
            entry_rva: 0,
            debug_symbols: Vec::new(),
            debug_symbol_count: 0,
        }
    }

    /// Register one DLL import with the import table.
    pub fn register_import(&mut self, descriptor: &ImportDescriptor) -> ImportId {
        let id = ImportId(self.imports.len());
        self.imports.push(DllImport {
            dll: descriptor.dll.clone(),
            symbol: descriptor.symbol.clone(),
            name: descriptor.name.clone(),
            ordinal: descriptor.ordinal,
            iat_rva: 0,
        });
        id
    }

    /// Merge every loaded module's raw section fragments into the output
    /// sections, allocate common symbols, synthesize the import and export
    /// sections, and assign RVAs and file offsets.
    pub fn assemble_sections(
        &mut self,
        objects: &[ObjectModule],
        symbols: &SymbolTable,
    ) -> Result<()> {
        self.sections.push(OutputSection::new(".text", SectionKind::Text));
        self.sections
            .push(OutputSection::new(".rdata", SectionKind::ReadOnlyData));
        self.sections.push(OutputSection::new(".data", SectionKind::Data));
        self.sections
            .push(OutputSection::new(".bss", SectionKind::UninitializedData));

        let parsed = parse_loaded(objects)?;
        for (object_index, file) in parsed.iter().enumerate() {
            let Some(file) = file else { continue };
            for section in file.sections() {
                let size = section.size();
                if size == 0 {
                    continue;
                }
                let Some(target) = classify_section(section.kind()) else {
                    tracing::debug!(
                        "Skipping section {} (kind: {:?}, size: {})",
                        section.name().unwrap_or("?"),
                        section.kind(),
                        size
                    );
                    continue;
                };
                let out = &mut self.sections[target];
                let start = align_up(u64::from(out.virtual_size), section.align().max(1)) as u32;
                out.virtual_size = start + size as u32;
                if !out.is_zero_fill() {
                    out.data.resize(start as usize, 0);
                    out.data.extend_from_slice(section.data()?);
                }
                out.fragments.push(Fragment {
                    object_index,
                    section_index: section.index(),
                    offset: start,
                });
                self.section_map
                    .insert((object_index, section.index()), (target, start));
            }
        }

        // Common symbols take the tail of the zero-fill section.
        let mut commons: Vec<SymbolId> = symbols.common_symbols().collect();
        commons.sort_by_key(|id| id.0);
        for id in commons {
            let entry = symbols.entry(id);
            let bss = &mut self.sections[BSS];
            let start = align_up(u64::from(bss.virtual_size), 8) as u32;
            bss.virtual_size = start + entry.offset as u32;
            self.common_map.insert(entry.name.clone(), start);
        }

        let import_layout = if self.imports.is_empty() {
            None
        } else {
            let layout = self.layout_imports();
            let mut section = OutputSection::new(".idata", SectionKind::Data);
            section.virtual_size = layout.total_size;
            self.idata_section = Some(self.sections.len());
            self.sections.push(section);
            Some(layout)
        };

        if !self.exports.is_empty() {
            let mut section = OutputSection::new(".edata", SectionKind::ReadOnlyData);
            section.virtual_size = self.edata_size();
            self.edata_section = Some(self.sections.len());
            self.sections.push(section);
        }

        self.layout_sections();

        if let (Some(layout), Some(index)) = (import_layout, self.idata_section) {
            let rva = self.sections[index].rva;
            for (import_index, slot) in layout.slot_offsets.iter().enumerate() {
                self.imports[import_index].iat_rva = rva + slot;
            }
            self.sections[index].data = self.build_idata(&layout, rva);
            self.import_dir = DirectoryExtent {
                rva,
                size: layout.descriptors_size,
            };
            self.iat_dir = DirectoryExtent {
                rva: rva + layout.iat_offset,
                size: layout.iat_size,
            };
        }
        if let Some(index) = self.edata_section {
            self.export_dir = DirectoryExtent {
                rva: self.sections[index].rva,
                size: self.sections[index].virtual_size,
            };
        }

        let section_total: usize = objects.iter().map(|o| o.loaded_sections).sum();
        tracing::debug!(
            objects = self.loaded_objects,
            input_sections = section_total,
            image_size = self.image_size,
            "assembled output sections"
        );
        Ok(())
    }

    fn layout_sections(&mut self) {
        let emitted = self.sections.iter().filter(|s| s.virtual_size > 0).count() as u32;
        // DOS header + NT signature + file header + optional header (with
        // data directories) + section headers, rounded to the file alignment.
        let raw_headers = 64 + 4 + 20 + 0xE0 + 40 * emitted;
        self.headers_size = align_up32(raw_headers, FILE_ALIGNMENT);

        let mut rva = SECTION_ALIGNMENT;
        let mut file_offset = self.headers_size;
        for section in &mut self.sections {
            if section.virtual_size == 0 {
                continue;
            }
            section.rva = rva;
            if !section.is_zero_fill() {
                section.file_offset = file_offset;
                file_offset += section.raw_data_size();
            }
            rva = align_up32(rva + section.virtual_size, SECTION_ALIGNMENT);
        }
        self.image_size = rva;
    }

    /// Resolve every fragment's relocations against the final layout and
    /// patch the section data through the architecture backend.
    pub fn resolve_relocations<A: Architecture>(
        &mut self,
        objects: &[ObjectModule],
        symbols: &SymbolTable,
        arch: &A,
    ) -> Result<()> {
        let parsed = parse_loaded(objects)?;
        for section_index in 0..self.sections.len() {
            if self.sections[section_index].is_zero_fill() {
                continue;
            }
            let mut patches = Vec::new();
            {
                let out = &self.sections[section_index];
                for fragment in &out.fragments {
                    let Some(file) = parsed[fragment.object_index].as_ref() else {
                        continue;
                    };
                    let section = file.section_by_index(fragment.section_index)?;
                    let site_base =
                        u64::from(self.image_base) + u64::from(out.rva + fragment.offset);
                    for (offset, reloc) in section.relocations() {
                        let Some(target_va) = self.relocation_target_va(
                            fragment.object_index,
                            file,
                            &reloc,
                            symbols,
                        )?
                        else {
                            continue;
                        };
                        patches.push((
                            u64::from(fragment.offset) + offset,
                            reloc,
                            site_base + offset,
                            target_va,
                        ));
                    }
                }
            }
            let image_base = u64::from(self.image_base);
            let data = &mut self.sections[section_index].data;
            for (offset, reloc, p, s) in patches {
                arch.apply_relocation(offset, &reloc, p, s, image_base, data)?;
            }
        }
        Ok(())
    }

    fn relocation_target_va(
        &self,
        object_index: usize,
        file: &object::File<'_>,
        reloc: &object::read::Relocation,
        symbols: &SymbolTable,
    ) -> Result<Option<u64>> {
        match reloc.target() {
            RelocationTarget::Symbol(index) => {
                let sym = file.symbol_by_index(index)?;
                if sym.kind() == SymbolKind::Section {
                    let section = sym.section_index().context("section symbol without index")?;
                    return Ok(Some(self.section_va(object_index, section).unwrap_or(0)));
                }
                if sym.is_local() {
                    if let Some(section) = sym.section_index() {
                        let base = self.section_va(object_index, section).unwrap_or(0);
                        return Ok(Some(base + sym.address()));
                    }
                    return Ok(Some(sym.address()));
                }
                let name = sym.name()?;
                let va = self
                    .lookup_va(name, symbols)
                    .ok_or_else(|| anyhow!("symbol missing in relocation: {name}"))?;
                Ok(Some(va))
            }
            RelocationTarget::Section(section) => {
                Ok(Some(self.section_va(object_index, section).unwrap_or(0)))
            }
            _ => Ok(None),
        }
    }

    /// Final virtual address of a resolved symbol entry.
    pub fn symbol_va(&self, id: SymbolId, symbols: &SymbolTable) -> Option<u64> {
        let entry = symbols.entry(id);
        match entry.resolution {
            Resolution::Local { target } => {
                let def = symbols.entry(target);
                if def.is_common {
                    let offset = self.common_map.get(&def.name)?;
                    return Some(
                        u64::from(self.image_base)
                            + u64::from(self.sections[BSS].rva)
                            + u64::from(*offset),
                    );
                }
                if def.is_absolute {
                    return Some(def.offset);
                }
                let (section, offset) = self
                    .section_map
                    .get(&(def.defining_object?, def.section?))?;
                Some(
                    u64::from(self.image_base)
                        + u64::from(self.sections[*section].rva)
                        + u64::from(*offset)
                        + def.offset,
                )
            }
            Resolution::DllImport { import, .. } => {
                Some(u64::from(self.image_base) + u64::from(self.imports[import.0].iat_rva))
            }
            Resolution::Weak => Some(0),
            Resolution::Unresolved => None,
        }
    }

    fn lookup_va(&self, name: &str, symbols: &SymbolTable) -> Option<u64> {
        let id = symbols.lookup(name)?;
        self.symbol_va(id, symbols)
    }

    fn section_va(&self, object_index: usize, section: SectionIndex) -> Option<u64> {
        let (out, offset) = self.section_map.get(&(object_index, section))?;
        Some(
            u64::from(self.image_base)
                + u64::from(self.sections[*out].rva)
                + u64::from(*offset),
        )
    }

    /// Emit a COFF symbol table for debuggers: every public symbol with its
    /// image RVA and output section number.
    pub fn build_debug_info(&mut self, symbols: &SymbolTable) -> Result<()> {
        if !self.include_debug_info {
            return Ok(());
        }
        let mut publics: Vec<(&str, SymbolId)> = symbols.public_entries().collect();
        publics.sort_by_key(|(name, _)| *name);

        let mut records = Vec::new();
        let mut strings = vec![0u8; 4];
        let mut count = 0u32;
        for (name, id) in publics {
            let Some(va) = self.symbol_va(id, symbols) else {
                continue;
            };
            let rva = va.saturating_sub(u64::from(self.image_base)) as u32;
            let section_number = self
                .emitted_sections()
                .position(|s| rva >= s.rva && rva < s.rva + s.virtual_size)
                .map_or(0u16, |index| index as u16 + 1);

            let mut record = [0u8; COFF_SYMBOL_SIZE];
            if name.len() <= 8 {
                record[..name.len()].copy_from_slice(name.as_bytes());
            } else {
                record[4..8].copy_from_slice(&(strings.len() as u32).to_le_bytes());
                strings.extend_from_slice(name.as_bytes());
                strings.push(0);
            }
            record[8..12].copy_from_slice(&rva.to_le_bytes());
            record[12..14].copy_from_slice(&section_number.to_le_bytes());
            record[16] = pe::IMAGE_SYM_CLASS_EXTERNAL;
            records.extend_from_slice(&record);
            count += 1;
        }
        let strings_len = strings.len() as u32;
        strings[0..4].copy_from_slice(&strings_len.to_le_bytes());

        records.extend_from_slice(&strings);
        self.debug_symbols = records;
        self.debug_symbol_count = count;
        Ok(())
    }

    /// Fill the export section and resolve the entry-point RVA; after this
    /// the image is ready to serialize.
    pub fn build_raw_image(&mut self, symbols: &SymbolTable) -> Result<()> {
        let entry = self
            .entry_symbol
            .ok_or_else(|| anyhow!("entry point was never bound"))?;
        let entry_va = self
            .symbol_va(entry, symbols)
            .ok_or_else(|| anyhow!("entry point symbol has no address"))?;
        self.entry_rva = entry_va
            .checked_sub(u64::from(self.image_base))
            .ok_or_else(|| anyhow!("entry point resolves below the image base"))?
            as u32;

        if let Some(index) = self.edata_section {
            let data = self.build_edata(self.sections[index].rva, symbols)?;
            self.sections[index].data = data;
        }
        Ok(())
    }

    /// Serialize the image to the target path.
    pub fn write_to_file(&self, machine: u16) -> Result<()> {
        crate::writer::write_image(self, machine)
    }

    /// File offset just past the last section's raw data.
    pub(crate) fn file_end(&self) -> u32 {
        self.sections
            .iter()
            .filter(|s| s.virtual_size > 0 && !s.is_zero_fill())
            .map(|s| s.file_offset + s.raw_data_size())
            .max()
            .unwrap_or(self.headers_size)
    }

    pub(crate) fn emitted_sections(&self) -> impl Iterator<Item = &OutputSection> {
        self.sections.iter().filter(|s| s.virtual_size > 0)
    }

    fn dll_groups(&self) -> Vec<(String, Vec<usize>)> {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (index, import) in self.imports.iter().enumerate() {
            match groups.iter_mut().find(|(dll, _)| *dll == import.dll) {
                Some((_, members)) => members.push(index),
                None => groups.push((import.dll.clone(), vec![index])),
            }
        }
        groups
    }

    fn layout_imports(&self) -> ImportLayout {
        let groups = self.dll_groups();
        let descriptors_size = (groups.len() as u32 + 1) * IMPORT_DESCRIPTOR_SIZE;
        let mut offset = descriptors_size;

        let mut ilt_offsets = Vec::with_capacity(groups.len());
        for (_, members) in &groups {
            ilt_offsets.push(offset);
            offset += (members.len() as u32 + 1) * 4;
        }

        let iat_offset = offset;
        let mut slot_offsets = vec![0u32; self.imports.len()];
        for (_, members) in &groups {
            for &import in members {
                slot_offsets[import] = offset;
                offset += 4;
            }
            offset += 4; // null terminator
        }
        let iat_size = offset - iat_offset;

        let mut hint_offsets = vec![0u32; self.imports.len()];
        for (index, import) in self.imports.iter().enumerate() {
            if let Some(name) = &import.name {
                hint_offsets[index] = offset;
                offset += 2 + name.len() as u32 + 1;
                offset += offset & 1;
            }
        }

        let mut name_offsets = Vec::with_capacity(groups.len());
        for (dll, _) in &groups {
            name_offsets.push(offset);
            offset += dll.len() as u32 + 1;
            offset += offset & 1;
        }

        ImportLayout {
            groups,
            descriptors_size,
            ilt_offsets,
            iat_offset,
            iat_size,
            slot_offsets,
            hint_offsets,
            name_offsets,
            total_size: offset,
        }
    }

    fn build_idata(&self, layout: &ImportLayout, rva: u32) -> Vec<u8> {
        let mut data = vec![0u8; layout.total_size as usize];
        for (group_index, (_, members)) in layout.groups.iter().enumerate() {
            let descriptor = group_index as u32 * IMPORT_DESCRIPTOR_SIZE;
            put_u32(
                &mut data,
                descriptor,
                rva + layout.ilt_offsets[group_index],
            );
            put_u32(
                &mut data,
                descriptor + 12,
                rva + layout.name_offsets[group_index],
            );
            put_u32(
                &mut data,
                descriptor + 16,
                rva + layout.slot_offsets[members[0]],
            );

            for (position, &import) in members.iter().enumerate() {
                let thunk = match (self.imports[import].ordinal, &self.imports[import].name) {
                    (Some(ordinal), _) => pe::IMAGE_ORDINAL_FLAG32 | u32::from(ordinal),
                    (None, Some(_)) => rva + layout.hint_offsets[import],
                    (None, None) => 0,
                };
                put_u32(
                    &mut data,
                    layout.ilt_offsets[group_index] + position as u32 * 4,
                    thunk,
                );
                put_u32(&mut data, layout.slot_offsets[import], thunk);
            }
        }
        for (index, import) in self.imports.iter().enumerate() {
            if let Some(name) = &import.name {
                let at = layout.hint_offsets[index] as usize;
                data[at + 2..at + 2 + name.len()].copy_from_slice(name.as_bytes());
            }
        }
        for (group_index, (dll, _)) in layout.groups.iter().enumerate() {
            let at = layout.name_offsets[group_index] as usize;
            data[at..at + dll.len()].copy_from_slice(dll.as_bytes());
        }
        data
    }

    fn output_file_name(&self) -> String {
        self.output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn edata_size(&self) -> u32 {
        let count = self.exports.len() as u32;
        let names: u32 = self
            .exports
            .iter()
            .map(|e| e.name.len() as u32 + 1)
            .sum();
        EXPORT_DIRECTORY_SIZE
            + count * 4 // address table
            + count * 4 // name pointer table
            + count * 2 // ordinal table
            + self.output_file_name().len() as u32
            + 1
            + names
    }

    fn build_edata(&self, rva: u32, symbols: &SymbolTable) -> Result<Vec<u8>> {
        let mut entries: Vec<(&ExportEntry, u32)> = Vec::with_capacity(self.exports.len());
        for export in &self.exports {
            let va = self
                .symbol_va(export.symbol, symbols)
                .ok_or_else(|| anyhow!("export {} has no address", export.name))?;
            let export_rva = va
                .checked_sub(u64::from(self.image_base))
                .ok_or_else(|| anyhow!("export {} has no image address", export.name))?;
            entries.push((export, export_rva as u32));
        }
        // The loader binary-searches the name pointer table.
        entries.sort_by(|a, b| a.0.name.cmp(&b.0.name));

        let count = entries.len() as u32;
        let functions_rva = rva + EXPORT_DIRECTORY_SIZE;
        let names_rva = functions_rva + count * 4;
        let ordinals_rva = names_rva + count * 4;
        let strings_offset = EXPORT_DIRECTORY_SIZE + count * 10;

        let mut data = vec![0u8; self.edata_size() as usize];
        let mut string_at = strings_offset;

        put_u32(&mut data, 12, rva + string_at); // directory name
        put_u32(&mut data, 16, 1); // ordinal base
        put_u32(&mut data, 20, count);
        put_u32(&mut data, 24, count);
        put_u32(&mut data, 28, functions_rva);
        put_u32(&mut data, 32, names_rva);
        put_u32(&mut data, 36, ordinals_rva);

        let file_name = self.output_file_name();
        data[string_at as usize..string_at as usize + file_name.len()]
            .copy_from_slice(file_name.as_bytes());
        string_at += file_name.len() as u32 + 1;

        for (position, (export, export_rva)) in entries.iter().enumerate() {
            let position = position as u32;
            put_u32(
                &mut data,
                EXPORT_DIRECTORY_SIZE + position * 4,
                *export_rva,
            );
            put_u32(
                &mut data,
                EXPORT_DIRECTORY_SIZE + count * 4 + position * 4,
                rva + string_at,
            );
            let ordinal_at = (EXPORT_DIRECTORY_SIZE + count * 8 + position * 2) as usize;
            data[ordinal_at..ordinal_at + 2].copy_from_slice(&(position as u16).to_le_bytes());

            data[string_at as usize..string_at as usize + export.name.len()]
                .copy_from_slice(export.name.as_bytes());
            string_at += export.name.len() as u32 + 1;
        }
        Ok(data)
    }
}

struct ImportLayout {
    groups: Vec<(String, Vec<usize>)>,
    descriptors_size: u32,
    ilt_offsets: Vec<u32>,
    iat_offset: u32,
    iat_size: u32,
    slot_offsets: Vec<u32>,
    hint_offsets: Vec<u32>,
    name_offsets: Vec<u32>,
    total_size: u32,
}

fn put_u32(data: &mut [u8], offset: u32, value: u32) {
    let offset = offset as usize;
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Parse every loaded module once; import thunks carry no COFF payload.
fn parse_loaded<'a>(objects: &'a [ObjectModule]) -> Result<Vec<Option<object::File<'a>>>> {
    objects
        .iter()
        .map(|module| {
            if module.import.is_some() {
                Ok(None)
            } else {
                module.parse().map(Some)
            }
        })
        .collect()
}
