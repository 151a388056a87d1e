//! The errors a solve can end with.

use std::fmt::{self, Display, Formatter};

use spackle_config::ConfigurationError;
use thiserror::Error;

use crate::engine::EngineError;

/// Where internal errors should be reported.
pub const BUG_REPORT_URL: &str = "https://github.com/spackle-rs/spackle/issues";

/// Writes a header followed by an enumerated list of reasons.
fn write_reasons(f: &mut Formatter<'_>, header: &str, reasons: &[String]) -> fmt::Result {
    write!(f, "{header}")?;
    for (idx, reason) in reasons.iter().enumerate() {
        write!(f, "\n    {}. {}", idx + 1, reason.replace('\n', "\n       "))?;
    }
    Ok(())
}

/// A problem with the request itself that was found before solving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputError {
    /// What was requested.
    pub header: String,
    /// Why it cannot be solved.
    pub reasons: Vec<String>,
}

impl InputError {
    pub(crate) fn new(header: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            reasons: vec![reason.into()],
        }
    }
}

impl Display for InputError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_reasons(f, &self.header, &self.reasons)
    }
}

/// The search finished without an error-free model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsatisfiableSpecError {
    /// What was requested.
    pub header: String,
    /// The explanation, one entry per error of the best model, highest priority first. An entry
    /// spans several lines when it carries a cause tree.
    pub reasons: Vec<String>,
}

impl Display for UnsatisfiableSpecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_reasons(f, &self.header, &self.reasons)
    }
}

/// A failure that indicates a bug in the concretizer rather than a problem with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalSolverError {
    /// What went wrong.
    pub header: String,
    /// Details, including the original explanation when building it failed.
    pub reasons: Vec<String>,
}

impl InternalSolverError {
    pub(crate) fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            reasons: Vec::new(),
        }
    }

    pub(crate) fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    /// Where to report the problem.
    pub fn bug_report_url(&self) -> &'static str {
        BUG_REPORT_URL
    }
}

impl Display for InternalSolverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_reasons(f, &self.header, &self.reasons)?;
        write!(
            f,
            "\n\nThis is a bug in the concretizer. Please report it at {BUG_REPORT_URL}"
        )
    }
}

/// The error returned by every solve.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SolveError {
    /// The request names something that does not exist or cannot be valid.
    #[error("{0}")]
    Input(InputError),

    /// No configuration satisfies the request.
    #[error("{0}")]
    Unsatisfiable(UnsatisfiableSpecError),

    /// The concretizer is in an inconsistent state.
    #[error("{0}")]
    Internal(InternalSolverError),

    /// The site configuration cannot be used.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl SolveError {
    pub(crate) fn input(header: impl Into<String>, reason: impl Into<String>) -> Self {
        SolveError::Input(InputError::new(header, reason))
    }

    pub(crate) fn internal(header: impl Into<String>, reason: impl Into<String>) -> Self {
        SolveError::Internal(InternalSolverError::new(header).with_reason(reason))
    }

    /// The header of the error.
    pub fn header(&self) -> &str {
        match self {
            SolveError::Input(e) => &e.header,
            SolveError::Unsatisfiable(e) => &e.header,
            SolveError::Internal(e) => &e.header,
            SolveError::Configuration(e) => &e.path,
        }
    }

    /// The reasons of the error.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            SolveError::Input(e) => e.reasons.clone(),
            SolveError::Unsatisfiable(e) => e.reasons.clone(),
            SolveError::Internal(e) => e.reasons.clone(),
            SolveError::Configuration(e) => vec![e.message.clone()],
        }
    }
}

impl From<EngineError> for SolveError {
    fn from(err: EngineError) -> Self {
        SolveError::internal("the logic engine failed", err.to_string())
    }
}
