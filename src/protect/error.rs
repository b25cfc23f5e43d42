//! Pipeline errors and the optional diagnostic sink.
//!
//! Without a sink every degradable condition aborts the run. With one, the
//! condition is reported, recorded in the returned [`Outcome`] and the run
//! continues in best-effort mode.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::android::{ApkZipError, ManifestError};
use crate::dex::DexError;

/// Error type returned by collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ProtectError {
    #[error("{} is not an application package: AndroidManifest.xml is missing", .0.display())]
    NotAPackage(PathBuf),

    #[error("{} contains no classes*.dex units", .0.display())]
    NoBinaryUnits(PathBuf),

    #[error("unit {unit} could not be packed: {reason}")]
    InjectionFailure { unit: usize, reason: String },

    #[error("main chain class {0} is not defined in any unit")]
    MissingMainChainClass(String),

    #[error("failed to read input archive: {0}")]
    InputArchive(#[source] ApkZipError),

    #[error("failed to write output archive: {0}")]
    ArchiveWriteFailure(#[source] ApkZipError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Dex(#[from] DexError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{stage} failed: {source}")]
    Collaborator {
        stage: &'static str,
        #[source]
        source: BoxError,
    },
}

impl ProtectError {
    /// Whether a registered sink may turn this error into a diagnostic.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            ProtectError::NotAPackage(_)
                | ProtectError::NoBinaryUnits(_)
                | ProtectError::InjectionFailure { .. }
                | ProtectError::MissingMainChainClass(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A condition the run recovered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// Receiver for recovered conditions. Registering one enables best-effort mode.
pub trait DiagnosticSink {
    fn report(&self, diagnostic: &Diagnostic);
}

/// Forwards diagnostics to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&self, diagnostic: &Diagnostic) {
        match diagnostic.severity {
            Severity::Warning => log::warn!("{}", diagnostic.message),
            Severity::Error => log::error!("{}", diagnostic.message),
        }
    }
}

/// A result that may have been reached in best-effort mode.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> Outcome<T> {
    pub fn clean(value: T) -> Self {
        Outcome {
            value,
            diagnostics: Vec::new(),
        }
    }

    /// True when anything was skipped or left out along the way; the value is
    /// then unverified.
    pub fn is_degraded(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            diagnostics: self.diagnostics,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Collects diagnostics for one run and decides between degrading and failing.
pub struct Diagnostics<'s> {
    sink: Option<&'s dyn DiagnosticSink>,
    recorded: Vec<Diagnostic>,
}

impl<'s> Diagnostics<'s> {
    pub fn new(sink: Option<&'s dyn DiagnosticSink>) -> Self {
        Diagnostics {
            sink,
            recorded: Vec::new(),
        }
    }

    pub fn best_effort(&self) -> bool {
        self.sink.is_some()
    }

    /// Record `error` as a diagnostic when a sink is registered, otherwise
    /// hand it back as fatal.
    pub fn degrade(&mut self, severity: Severity, error: ProtectError) -> Result<(), ProtectError> {
        if self.sink.is_none() || !error.is_degradable() {
            return Err(error);
        }
        self.record(Diagnostic {
            severity,
            message: error.to_string(),
        });
        Ok(())
    }

    /// Record a condition that never aborts the run.
    pub fn record(&mut self, diagnostic: Diagnostic) {
        match self.sink {
            Some(sink) => sink.report(&diagnostic),
            None => LogSink.report(&diagnostic),
        }
        self.recorded.push(diagnostic);
    }

    pub fn finish<T>(self, value: T) -> Outcome<T> {
        Outcome {
            value,
            diagnostics: self.recorded,
        }
    }
}
