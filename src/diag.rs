//! Diagnostics sink.
//!
//! The linker reports every hard error and recoverable warning through one
//! `Diagnostics` value. Reporting is fire-and-forget: messages go to the
//! `tracing` output and bump a counter, and the phase driver decides at the
//! end of each phase whether accumulated errors fail the session.

/// One diagnostic message category, mirroring the toolchain's message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// No library files were supplied.
    NoLibraries,
    /// No object files were supplied.
    NoObjects,
    /// The startup symbol could not be bound to the entry point.
    NoStartupSymbol,
    /// An unresolved reference matched nothing in any input.
    SymbolNotFound,
    /// A DLL import thunk was pulled in but its symbol never became visible.
    NoDllSymbol,
    /// A requested export name matched no public symbol.
    ExportNotFound,
    /// A requested export resolved only inside a library-sourced module.
    ExportFromLibrary,
    /// The resource file could not be opened for reading.
    CannotOpenResource,
    /// The output image path could not be created.
    CannotCreateOutput,
    /// The companion import-library path could not be created.
    CannotCreateImportLib,
    /// The companion export-definition path could not be created.
    CannotCreateExportFile,
    /// An exact-name miss was recovered by an underscore-prefixed retry.
    UnderscoreFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Error,
    Warning,
}

impl Message {
    fn severity(self) -> Severity {
        match self {
            Message::CannotCreateImportLib
            | Message::CannotCreateExportFile
            | Message::UnderscoreFallback => Severity::Warning,
            _ => Severity::Error,
        }
    }

    fn text(self) -> &'static str {
        match self {
            Message::NoLibraries => "no library files given",
            Message::NoObjects => "no object files given",
            Message::NoStartupSymbol => "startup symbol not found",
            Message::SymbolNotFound => "unresolved symbol",
            Message::NoDllSymbol => "DLL symbol not found",
            Message::ExportNotFound => "export symbol not found",
            Message::ExportFromLibrary => "symbol not eligible for export",
            Message::CannotOpenResource => "cannot open resource file",
            Message::CannotCreateOutput => "cannot create output file",
            Message::CannotCreateImportLib => "cannot create import library",
            Message::CannotCreateExportFile => "cannot create export file",
            Message::UnderscoreFallback => "resolved via underscore-prefixed name",
        }
    }
}

/// Counting sink for linker messages.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: usize,
    warnings: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report one message. `primary` and `secondary` name the symbol, file,
    /// or path the message is about.
    pub fn report(&mut self, msg: Message, primary: Option<&str>, secondary: Option<&str>) {
        let primary = primary.unwrap_or("");
        let secondary = secondary.unwrap_or("");
        match msg.severity() {
            Severity::Error => {
                self.errors += 1;
                tracing::error!(primary, secondary, "{}", msg.text());
            }
            Severity::Warning => {
                self.warnings += 1;
                tracing::warn!(primary, secondary, "{}", msg.text());
            }
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }
}
