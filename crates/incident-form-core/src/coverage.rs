use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::resolve::Origin;
use crate::schema::FieldKind;
use crate::{now_utc, MappingError, REPORT_VERSION};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    Resolved,
    CoercedWithWarning,
    Absent,
    WriteFailed,
}

impl FieldStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::CoercedWithWarning => "coerced_with_warning",
            Self::Absent => "absent",
            Self::WriteFailed => "write_failed",
        }
    }

    /// Whether the field ended up carrying a value in the document.
    #[must_use]
    pub fn is_populated(self) -> bool {
        matches!(self, Self::Resolved | Self::CoercedWithWarning)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldOutcome {
    pub field: String,
    pub kind: FieldKind,
    pub status: FieldStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shadowed: Vec<usize>,
    #[serde(default)]
    pub conflict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageReport {
    pub report_version: String,
    pub run_id: Ulid,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub subject_id: String,
    pub schema_version: String,
    pub table_version: String,
    pub total_fields: usize,
    pub resolved: usize,
    pub coerced_with_warning: usize,
    pub absent: usize,
    pub write_failed: usize,
    pub defaulted: usize,
    pub coverage_ratio: f64,
    pub absent_fields: Vec<String>,
    pub warned_fields: Vec<String>,
    pub write_failed_fields: Vec<String>,
    pub template_drift: Vec<String>,
    pub conflicts: Vec<String>,
    pub outcomes: Vec<FieldOutcome>,
}

impl CoverageReport {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_outcomes(
        subject_id: &str,
        schema_version: &str,
        table_version: &str,
        template_drift: Vec<String>,
        outcomes: Vec<FieldOutcome>,
    ) -> Self {
        let names_with = |status: FieldStatus| -> Vec<String> {
            outcomes
                .iter()
                .filter(|outcome| outcome.status == status)
                .map(|outcome| outcome.field.clone())
                .collect()
        };

        let absent_fields = names_with(FieldStatus::Absent);
        let warned_fields = names_with(FieldStatus::CoercedWithWarning);
        let write_failed_fields = names_with(FieldStatus::WriteFailed);
        let resolved = outcomes
            .iter()
            .filter(|outcome| outcome.status == FieldStatus::Resolved)
            .count();
        let defaulted = outcomes
            .iter()
            .filter(|outcome| outcome.origin == Some(Origin::Default))
            .count();
        let conflicts = outcomes
            .iter()
            .filter(|outcome| outcome.conflict)
            .map(|outcome| outcome.field.clone())
            .collect();

        let total_fields = outcomes.len();
        let populated = resolved + warned_fields.len();
        let coverage_ratio = if total_fields == 0 {
            0.0
        } else {
            populated as f64 / total_fields as f64
        };

        Self {
            report_version: REPORT_VERSION.to_string(),
            run_id: Ulid::new(),
            generated_at: now_utc(),
            subject_id: subject_id.to_string(),
            schema_version: schema_version.to_string(),
            table_version: table_version.to_string(),
            total_fields,
            resolved,
            coerced_with_warning: warned_fields.len(),
            absent: absent_fields.len(),
            write_failed: write_failed_fields.len(),
            defaulted,
            coverage_ratio,
            absent_fields,
            warned_fields,
            write_failed_fields,
            template_drift,
            conflicts,
            outcomes,
        }
    }

    #[must_use]
    pub fn populated(&self) -> usize {
        self.resolved + self.coerced_with_warning
    }

    #[must_use]
    pub fn outcome(&self, field: &str) -> Option<&FieldOutcome> {
        self.outcomes.iter().find(|outcome| outcome.field == field)
    }

    #[must_use]
    pub fn populated_fields(&self) -> BTreeSet<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status.is_populated())
            .map(|outcome| outcome.field.as_str())
            .collect()
    }

    /// Decodes a previously emitted report, typically a stored baseline.
    ///
    /// # Errors
    /// Returns [`MappingError::Configuration`] when the JSON does not decode.
    pub fn from_json(input: &str) -> Result<Self, MappingError> {
        serde_json::from_str(input)
            .map_err(|err| MappingError::Configuration(format!("invalid coverage report: {err}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoverageRegression {
    pub baseline_resolved: usize,
    pub current_resolved: usize,
    pub baseline_populated: usize,
    pub current_populated: usize,
    /// Populated in the baseline, not populated now.
    pub regressed_fields: Vec<String>,
    /// Populated now, not populated in the baseline.
    pub recovered_fields: Vec<String>,
}

impl CoverageRegression {
    #[must_use]
    pub fn is_regression(&self) -> bool {
        self.current_resolved < self.baseline_resolved
            || self.current_populated < self.baseline_populated
            || !self.regressed_fields.is_empty()
    }
}

/// Diffs two reports produced from the same fixture bundle.
#[must_use]
pub fn compare(baseline: &CoverageReport, current: &CoverageReport) -> CoverageRegression {
    let before = baseline.populated_fields();
    let after = current.populated_fields();

    CoverageRegression {
        baseline_resolved: baseline.resolved,
        current_resolved: current.resolved,
        baseline_populated: baseline.populated(),
        current_populated: current.populated(),
        regressed_fields: before
            .difference(&after)
            .map(|field| (*field).to_string())
            .collect(),
        recovered_fields: after
            .difference(&before)
            .map(|field| (*field).to_string())
            .collect(),
    }
}
