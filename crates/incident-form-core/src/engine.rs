use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::bundle::{SubjectBundle, SubjectId};
use crate::coerce::{coerce, Coerced};
use crate::coverage::{CoverageReport, FieldOutcome, FieldStatus};
use crate::document::{write, FormDocument, TemplateDocument};
use crate::mapping::{MappingRule, MappingTable};
use crate::resolve::{resolve, Resolution};
use crate::schema::TargetSchema;
use crate::MappingError;

/// Fetches the raw record set for one subject.
///
/// Missing optional sections are an empty bundle section, never an error;
/// only a primary record that cannot be fetched at all is fatal.
pub trait SourceReader {
    /// # Errors
    /// Returns [`MappingError::SourceUnreachable`] when the primary record
    /// cannot be fetched.
    fn read_bundle(&self, subject: &SubjectId) -> Result<SubjectBundle, MappingError>;
}

/// A validated schema/table pair, ready to map any number of subjects.
#[derive(Debug, Clone)]
pub struct MappingEngine {
    schema: TargetSchema,
    table_version: String,
    /// One rule per schema field, in schema order.
    rules: Vec<MappingRule>,
}

/// A field after resolution and coercion, before it touches the document.
struct Prepared<'a> {
    rule: &'a MappingRule,
    resolution: Resolution,
    coerced: Option<Coerced>,
}

impl MappingEngine {
    /// Validates the mapping table against the schema.
    ///
    /// # Errors
    /// Returns [`MappingError::Configuration`] for an invalid schema and
    /// [`MappingError::MappingTableInvalid`] when the table does not cover
    /// the schema exactly once per field.
    pub fn new(schema: TargetSchema, table: MappingTable) -> Result<Self, MappingError> {
        schema.validate()?;
        table.validate_against(&schema)?;

        let rules = schema
            .fields
            .iter()
            .filter_map(|field| table.rule(&field.name).cloned())
            .collect();

        info!(
            schema_version = %schema.schema_version,
            table_version = %table.table_version,
            fields = schema.len(),
            "mapping table loaded"
        );

        Ok(Self {
            schema,
            table_version: table.table_version,
            rules,
        })
    }

    /// Loads both configuration documents from JSON text.
    ///
    /// # Errors
    /// Returns the decoding or validation error of either document.
    pub fn from_json(schema_json: &str, table_json: &str) -> Result<Self, MappingError> {
        let schema = TargetSchema::from_json(schema_json)?;
        let table = MappingTable::from_json(table_json)?;
        Self::new(schema, table)
    }

    #[must_use]
    pub fn schema(&self) -> &TargetSchema {
        &self.schema
    }

    #[must_use]
    pub fn table_version(&self) -> &str {
        &self.table_version
    }

    #[must_use]
    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    /// A fresh document laid out exactly as the contract schema.
    #[must_use]
    pub fn blank_document(&self) -> TemplateDocument {
        TemplateDocument::from_schema(&self.schema)
    }

    /// Maps one bundle into `document`, one field at a time.
    #[tracing::instrument(skip_all, fields(subject = %bundle.subject_id))]
    pub fn run(&self, bundle: &SubjectBundle, document: &mut dyn FormDocument) -> CoverageReport {
        let drift = self.template_drift(document);
        let outcomes = self
            .rules
            .iter()
            .map(|rule| prepare(bundle, rule))
            .map(|prepared| apply(document, prepared))
            .collect();
        self.finish(bundle, drift, outcomes)
    }

    /// Resolves and coerces every field on the rayon pool, then applies the
    /// results from this thread only. The document is never shared.
    #[tracing::instrument(skip_all, fields(subject = %bundle.subject_id))]
    pub fn run_parallel(
        &self,
        bundle: &SubjectBundle,
        document: &mut dyn FormDocument,
    ) -> CoverageReport {
        let drift = self.template_drift(document);
        let prepared: Vec<Prepared<'_>> = self
            .rules
            .par_iter()
            .map(|rule| prepare(bundle, rule))
            .collect();
        let outcomes = prepared
            .into_iter()
            .map(|prepared| apply(document, prepared))
            .collect();
        self.finish(bundle, drift, outcomes)
    }

    fn template_drift(&self, document: &dyn FormDocument) -> Vec<String> {
        let drift: Vec<String> = self
            .rules
            .iter()
            .filter(|rule| document.field_kind(&rule.field) != Some(rule.kind))
            .map(|rule| rule.field.clone())
            .collect();
        if !drift.is_empty() {
            warn!(fields = ?drift, "template does not match mapping table");
        }
        drift
    }

    fn finish(
        &self,
        bundle: &SubjectBundle,
        drift: Vec<String>,
        outcomes: Vec<FieldOutcome>,
    ) -> CoverageReport {
        let report = CoverageReport::from_outcomes(
            bundle.subject_id.as_str(),
            &self.schema.schema_version,
            &self.table_version,
            drift,
            outcomes,
        );
        info!(
            total = report.total_fields,
            resolved = report.resolved,
            warned = report.coerced_with_warning,
            absent = report.absent,
            write_failed = report.write_failed,
            "mapping run complete"
        );
        report
    }
}

fn prepare<'a>(bundle: &SubjectBundle, rule: &'a MappingRule) -> Prepared<'a> {
    let resolution = resolve(bundle, rule);
    let coerced = resolution
        .value
        .as_ref()
        .map(|raw| coerce(Some(raw), rule));
    Prepared {
        rule,
        resolution,
        coerced,
    }
}

fn apply(document: &mut dyn FormDocument, prepared: Prepared<'_>) -> FieldOutcome {
    let Prepared {
        rule,
        resolution,
        coerced,
    } = prepared;

    let mut outcome = FieldOutcome {
        field: rule.field.clone(),
        kind: rule.kind,
        status: FieldStatus::Absent,
        origin: resolution.origin,
        value: None,
        warnings: Vec::new(),
        reason: None,
        shadowed: resolution.shadowed,
        conflict: resolution.conflict,
    };

    let Some(coerced) = coerced else {
        debug!(field = %rule.field, "field absent");
        return outcome;
    };

    if let Some(warning) = &coerced.warning {
        warn!(field = %rule.field, %warning, "coercion warning");
        outcome.warnings.push(warning.to_string());
    }

    match write(document, &rule.field, rule.kind, &coerced.value) {
        Ok(()) => {
            outcome.status = if coerced.warning.is_some() {
                FieldStatus::CoercedWithWarning
            } else {
                FieldStatus::Resolved
            };
            outcome.value = Some(coerced.value.to_json());
            debug!(field = %rule.field, status = outcome.status.as_str(), "field written");
        }
        Err(failure) => {
            warn!(field = %rule.field, %failure, "field write failed");
            outcome.status = FieldStatus::WriteFailed;
            outcome.reason = Some(failure.to_string());
        }
    }

    outcome
}

/// Fetches the subject and maps it. A failed fetch aborts before any field
/// work; once the bundle exists a report is always produced.
///
/// # Errors
/// Returns [`MappingError::SourceUnreachable`] from the reader.
pub fn render(
    reader: &dyn SourceReader,
    engine: &MappingEngine,
    subject: &SubjectId,
    document: &mut dyn FormDocument,
) -> Result<CoverageReport, MappingError> {
    let bundle = reader.read_bundle(subject)?;
    debug!(
        subject = %subject,
        vehicles = bundle.vehicles.len(),
        witnesses = bundle.witnesses.len(),
        documents = bundle.documents.len(),
        transcription = bundle.transcription.is_some(),
        "bundle fetched"
    );
    Ok(engine.run(&bundle, document))
}
