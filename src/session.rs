//! The link session.
//!
//! `LinkSession` owns every collection of the pipeline - libraries, object
//! modules, the symbol table, the locator, the output image and the
//! diagnostics sink - and drives the phases in order: load inputs, resolve
//! symbols, build the export table, probe output paths, then hand the
//! loaded modules to the image for assembly, relocation and serialization.
//! Teardown is scoped: dropping the session releases everything.

use anyhow::{bail, Result};
use std::fs::File;
use std::path::PathBuf;

use crate::arch::Architecture;
use crate::config::Config;
use crate::diag::{Diagnostics, Message};
use crate::image::{ExecutableImage, ExportEntry};
use crate::library::{CombinedSymbolMap, LibraryFile};
use crate::locate::{LocatedMember, SymbolLocator};
use crate::object::ObjectModule;
use crate::symbol::{Resolution, SymbolId, SymbolTable};

pub struct LinkSession<A: Architecture> {
    arch: A,
    entry_name: String,
    export_names: Vec<String>,
    resource: Option<PathBuf>,
    library_paths: Vec<PathBuf>,
    object_paths: Vec<PathBuf>,
    libraries: Vec<LibraryFile>,
    objects: Vec<ObjectModule>,
    symbols: SymbolTable,
    locator: SymbolLocator,
    image: ExecutableImage,
    diag: Diagnostics,
}

impl<A: Architecture> LinkSession<A> {
    pub fn new(arch: A, config: &Config) -> Self {
        let locator = if config.combined_lib_index {
            SymbolLocator::Combined {
                map: CombinedSymbolMap::with_capacity(1024),
            }
        } else {
            SymbolLocator::PerLibrary
        };
        Self {
            arch,
            entry_name: config.entry.clone(),
            export_names: config.exports.clone(),
            resource: config.resource.clone(),
            library_paths: config.libraries.clone(),
            object_paths: config.objects.clone(),
            libraries: Vec::new(),
            objects: Vec::new(),
            symbols: SymbolTable::new(),
            locator,
            image: ExecutableImage::new(config),
            diag: Diagnostics::new(),
        }
    }

    /// Run the whole pipeline, stopping at the first failed phase.
    pub fn link(&mut self) -> Result<()> {
        self.load_inputs()?;
        self.resolve_symbols()?;
        self.build_exports()?;
        self.probe_output_paths()?;
        self.dump_symbols();
        self.image.assemble_sections(&self.objects, &self.symbols)?;
        self.image
            .resolve_relocations(&self.objects, &self.symbols, &self.arch)?;
        self.image.build_debug_info(&self.symbols)?;
        self.image.build_raw_image(&self.symbols)?;
        self.image.write_to_file(self.arch.machine())?;
        Ok(())
    }

    /// Load every library and object module, then locate the startup
    /// routine and bind it to the entry point.
    pub fn load_inputs(&mut self) -> Result<()> {
        let mut ok = true;

        for (index, path) in self.library_paths.clone().iter().enumerate() {
            let loaded = match &mut self.locator {
                SymbolLocator::Combined { map } => {
                    LibraryFile::load_with_combined_index(path, index, map)
                }
                SymbolLocator::PerLibrary => LibraryFile::load_with_own_index(path, index),
            };
            match loaded {
                Ok(library) => self.libraries.push(library),
                Err(err) => {
                    tracing::error!("{err:#}");
                    ok = false;
                }
            }
        }
        if self.library_paths.is_empty() {
            self.diag.report(Message::NoLibraries, None, None);
            bail!("no library files given");
        }

        for path in self.object_paths.clone() {
            let mut module = match ObjectModule::from_file(&path) {
                Ok(module) => module,
                Err(err) => {
                    tracing::error!("{err:#}");
                    ok = false;
                    continue;
                }
            };
            let index = self.objects.len();
            match module.analyze(index, &mut self.symbols) {
                Ok(()) => {
                    self.image.loaded_objects += 1;
                    self.objects.push(module);
                }
                Err(err) => {
                    tracing::error!("{err:#}");
                    ok = false;
                }
            }
        }
        if !ok {
            bail!("failed to load input files");
        }
        if self.objects.is_empty() {
            self.diag.report(Message::NoObjects, None, None);
            bail!("no object files given");
        }

        self.bind_startup()
    }

    /// Look up the startup symbol, pulling its defining module from the
    /// libraries if necessary, and bind the entry point via the bare name
    /// or its underscore-prefixed spelling.
    fn bind_startup(&mut self) -> Result<()> {
        let entry = self.entry_name.clone();
        if self.symbols.lookup(&entry).is_none() {
            if let Some(found) = self
                .locator
                .find(&mut self.libraries, &entry, &mut self.diag)?
            {
                self.add_library_module(found)?;
            }
        }

        if let Some(id) = self.symbols.lookup(&entry) {
            self.image.entry_symbol = Some(id);
            return Ok(());
        }
        let prefixed = format!("_{entry}");
        if let Some(id) = self.symbols.lookup(&prefixed) {
            self.diag
                .report(Message::UnderscoreFallback, Some(&entry), Some(&prefixed));
            self.image.entry_symbol = Some(id);
            return Ok(());
        }
        self.diag.report(Message::NoStartupSymbol, Some(&entry), None);
        bail!("startup symbol {entry} not found")
    }

    /// Materialize a located library member as an object module and analyze
    /// it exactly like a user-supplied object.
    fn add_library_module(&mut self, found: LocatedMember) -> Result<usize> {
        let library = &self.libraries[found.library];
        let member_name = library.last_member.clone().unwrap_or_default();
        let library_path = library.path.display().to_string();
        let mut module = ObjectModule::from_library_member(
            &member_name,
            &library_path,
            found.library,
            found.data,
        );
        let index = self.objects.len();
        module.analyze(index, &mut self.symbols)?;
        self.image.loaded_objects += 1;
        self.objects.push(module);
        Ok(index)
    }

    /// Drain the unresolved-symbol worklist in FIFO order. Failures are
    /// accumulated so every missing symbol is reported in one run; failed
    /// entries go back on the worklist before the phase returns.
    pub fn resolve_symbols(&mut self) -> Result<()> {
        let mut failed: Vec<SymbolId> = Vec::new();
        let mut drained = 0usize;

        while let Some(current) = self.symbols.pop_unresolved() {
            drained += 1;
            let name = self.symbols.entry(current).name.clone();

            if let Some(target) = self.symbols.lookup(&name) {
                self.symbols.bind(current, target);
                continue;
            }

            let located = self
                .locator
                .find(&mut self.libraries, &name, &mut self.diag)?;
            let Some(found) = located else {
                if self.symbols.entry(current).is_weak {
                    // Weak externals tolerate staying unbound.
                    self.symbols.accept_weak(current);
                } else {
                    let referencing = self.referencing_name(current);
                    self.diag
                        .report(Message::SymbolNotFound, Some(&name), referencing.as_deref());
                    failed.push(current);
                }
                continue;
            };

            let index = self.add_library_module(found)?;
            if let Some(descriptor) = self.objects[index].import.clone() {
                // Placeholder descriptors name no symbol and are discarded
                // without touching the import table.
                let import = if descriptor.symbol.is_empty() {
                    None
                } else {
                    Some(self.image.register_import(&descriptor))
                };
                match self.symbols.lookup(&name) {
                    Some(target) => match import {
                        Some(import) => self.symbols.bind_import(current, target, import),
                        None => self.symbols.bind(current, target),
                    },
                    None => {
                        self.diag.report(Message::NoDllSymbol, Some(&name), None);
                        failed.push(current);
                    }
                }
            } else {
                match self.symbols.lookup(&name) {
                    Some(target) => self.symbols.bind(current, target),
                    None => {
                        let prefixed = format!("_{name}");
                        if let Some(target) = self.symbols.lookup(&prefixed) {
                            self.diag.report(
                                Message::UnderscoreFallback,
                                Some(&name),
                                Some(&prefixed),
                            );
                            self.symbols.bind(current, target);
                            self.symbols.alias(&name, target);
                        } else {
                            let referencing = self.referencing_name(current);
                            self.diag.report(
                                Message::SymbolNotFound,
                                Some(&name),
                                referencing.as_deref(),
                            );
                            failed.push(current);
                        }
                    }
                }
            }
        }

        tracing::debug!(drained, "drained resolution worklist");
        if failed.is_empty() {
            Ok(())
        } else {
            let count = failed.len();
            self.symbols.requeue_failed(failed);
            bail!("{count} unresolved symbol(s)")
        }
    }

    /// Cross-reference the requested export names against the resolved
    /// symbol table and register the export-table entries.
    pub fn build_exports(&mut self) -> Result<()> {
        if self.export_names.is_empty() {
            return Ok(());
        }
        let mut ok = true;
        for requested in self.export_names.clone() {
            let Some(id) = self.match_export(&requested) else {
                self.diag.report(Message::ExportNotFound, Some(&requested), None);
                ok = false;
                continue;
            };
            if self.defined_in_library(id) {
                self.diag
                    .report(Message::ExportFromLibrary, Some(&requested), None);
                ok = false;
                continue;
            }
            self.image.exports.push(ExportEntry {
                name: requested,
                symbol: id,
            });
        }
        if ok {
            Ok(())
        } else {
            bail!("export table construction failed")
        }
    }

    /// The four export match strategies, in order: exact, key-part, then
    /// both again with an underscore prefix.
    fn match_export(&self, requested: &str) -> Option<SymbolId> {
        if let Some(id) = self.symbols.lookup(requested) {
            return Some(id);
        }
        if let Some(id) = self.key_part_match(requested) {
            return Some(id);
        }
        let prefixed = format!("_{requested}");
        if let Some(id) = self.symbols.lookup(&prefixed) {
            return Some(id);
        }
        self.key_part_match(&prefixed)
    }

    /// The object format may embed an export name inside a longer decorated
    /// symbol; match any public name containing the requested one. Ties go
    /// to the shortest, then lexicographically smallest, candidate.
    fn key_part_match(&self, requested: &str) -> Option<SymbolId> {
        self.symbols
            .public_entries()
            .filter(|(name, _)| name.contains(requested))
            .min_by_key(|(name, _)| (name.len(), name.to_string()))
            .map(|(_, id)| id)
    }

    fn defined_in_library(&self, id: SymbolId) -> bool {
        let target = match self.symbols.entry(id).resolution {
            Resolution::Local { target } | Resolution::DllImport { target, .. } => target,
            _ => id,
        };
        self.symbols
            .entry(target)
            .defining_object
            .is_some_and(|index| self.objects[index].from_library)
    }

    fn referencing_name(&self, id: SymbolId) -> Option<String> {
        self.symbols
            .entry(id)
            .referencing_object
            .map(|index| self.objects[index].name.clone())
    }

    /// Verify the output path is creatable and, for DLL builds, pre-create
    /// the companion import-library and export-definition files. Every
    /// probe opens and immediately closes its file.
    pub fn probe_output_paths(&mut self) -> Result<()> {
        if let Some(resource) = self.resource.clone() {
            if File::open(&resource).is_err() {
                self.diag.report(
                    Message::CannotOpenResource,
                    Some(&resource.display().to_string()),
                    None,
                );
                bail!("cannot open resource file {}", resource.display());
            }
        }

        if self.image.build_dll {
            let import_lib = self.image.output_path.with_extension("lib");
            if File::create(&import_lib).is_err() {
                self.diag.report(
                    Message::CannotCreateImportLib,
                    Some(&import_lib.display().to_string()),
                    None,
                );
            }
            let export_file = self.image.output_path.with_extension("exp");
            if File::create(&export_file).is_err() {
                self.diag.report(
                    Message::CannotCreateExportFile,
                    Some(&export_file.display().to_string()),
                    None,
                );
            }
        }

        if File::create(&self.image.output_path).is_err() {
            self.diag.report(
                Message::CannotCreateOutput,
                Some(&self.image.output_path.display().to_string()),
                None,
            );
            bail!(
                "cannot create output file {}",
                self.image.output_path.display()
            );
        }
        Ok(())
    }

    fn dump_symbols(&self) {
        for (name, id) in self.symbols.public_entries() {
            tracing::trace!(
                symbol = name,
                resolution = ?self.symbols.entry(id).resolution,
                "public symbol"
            );
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn objects(&self) -> &[ObjectModule] {
        &self.objects
    }

    pub fn libraries(&self) -> &[LibraryFile] {
        &self.libraries
    }

    pub fn image(&self) -> &ExecutableImage {
        &self.image
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }
}
