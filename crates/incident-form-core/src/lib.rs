//! Field-mapping engine that renders one incident into a frozen form layout.
//!
//! The engine is driven by two pieces of data:
//! - a [`TargetSchema`] describing the named, typed fields of the form, and
//! - a [`MappingTable`] holding one [`MappingRule`] per target field.
//!
//! [`MappingEngine::new`] validates the table against the schema once; every
//! subsequent [`MappingEngine::run`] resolves, coerces and writes each field
//! independently and summarizes the outcome in a [`CoverageReport`].

use time::{OffsetDateTime, UtcOffset};

pub mod bundle;
pub mod coerce;
pub mod coverage;
pub mod document;
pub mod engine;
pub mod mapping;
pub mod resolve;
pub mod schema;

pub use bundle::{Record, Section, SubjectBundle, SubjectId};
pub use coerce::{coerce, Coerced, CoercionWarning};
pub use coverage::{compare, CoverageRegression, CoverageReport, FieldOutcome, FieldStatus};
pub use document::{write, FieldValue, FormDocument, TemplateDocument, WriteFailure};
pub use engine::{render, MappingEngine, SourceReader};
pub use mapping::{Coercion, ExtractionSpec, MappingRule, MappingTable};
pub use resolve::{resolve, Origin, Resolution};
pub use schema::{FieldKind, SchemaField, TargetSchema};

pub const REPORT_VERSION: &str = "coverage_report.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MappingError {
    #[error("source unreachable for subject {subject}: {reason}")]
    SourceUnreachable { subject: String, reason: String },
    #[error("mapping table invalid: {}", .0.join("; "))]
    MappingTableInvalid(Vec<String>),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("document error: {0}")]
    Document(String),
}

impl MappingError {
    /// Only these two kinds abort a run; everything else is reported as data.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SourceUnreachable { .. } | Self::MappingTableInvalid(_)
        )
    }
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`MappingError::Configuration`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, MappingError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            MappingError::Configuration(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
