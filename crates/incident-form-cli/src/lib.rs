//! Stable embedded command surface for the incident form mapper.
//!
//! Hosts embed the mapper through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_form_with_db`] for a single [`FormCommand`] against a DB path with
//!   the bundled schema, mapping table and source layout.
//! - [`run_form`] for execution against an existing engine and reader.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use incident_form_core::{
    compare, render, CoverageRegression, CoverageReport, FormDocument, MappingEngine,
    MappingTable, SourceReader, SubjectId, TargetSchema, TemplateDocument,
};
use incident_form_store_sqlite::{
    describe_sources, open_read_only, SourceLayout, SqliteSourceReader,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

const BUNDLED_SCHEMA: &str = include_str!("../../../mappings/target_schema.v1.json");
const BUNDLED_TABLE: &str = include_str!("../../../mappings/mapping_table.v1.json");

#[derive(Debug, Parser)]
#[command(name = "ifm")]
#[command(about = "Incident form mapper CLI")]
pub struct Cli {
    #[arg(long, default_value = "./incidents.sqlite3")]
    db: PathBuf,

    /// Contract schema JSON; the bundled v1 schema when omitted.
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Mapping table JSON; the bundled v1 table when omitted.
    #[arg(long)]
    mapping: Option<PathBuf>,

    /// Source layout JSON; the default incident layout when omitted.
    #[arg(long)]
    layout: Option<PathBuf>,

    #[command(subcommand)]
    command: FormCommand,
}

#[derive(Debug, Subcommand)]
pub enum FormCommand {
    /// Fill a form for one incident.
    Render(RenderArgs),
    /// Measure field coverage for one incident and gate on it.
    Coverage(CoverageArgs),
    /// Check the mapping table against the contract schema.
    Validate,
    /// Describe the tables in the incident database.
    Introspect,
}

#[derive(Debug, Args)]
pub struct RenderArgs {
    #[arg(long)]
    subject: String,
    /// Live template JSON to fill instead of a blank contract layout.
    #[arg(long)]
    template: Option<PathBuf>,
    /// Write the filled document here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    parallel: bool,
    /// Print the coverage report instead of the document.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct CoverageArgs {
    #[arg(long)]
    subject: String,
    /// A previously emitted coverage report for the same fixture.
    #[arg(long)]
    baseline: Option<PathBuf>,
    #[arg(long)]
    min_ratio: Option<f64>,
    #[arg(long)]
    parallel: bool,
}

#[derive(Debug, Serialize)]
pub struct CoverageCheck {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regression: Option<CoverageRegression>,
    pub report: CoverageReport,
}

#[derive(Debug, Serialize)]
struct ValidationSummary<'a> {
    valid: bool,
    schema_version: &'a str,
    table_version: &'a str,
    fields: usize,
}

/// Installs the stderr `tracing` subscriber. `RUST_LOG` overrides the
/// default `warn` filter.
///
/// # Errors
/// Returns an error when a global subscriber is already installed.
pub fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration fails to load or validate, the
/// database cannot be opened, or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    if matches!(cli.command, FormCommand::Introspect) {
        return run_introspect(&cli.db);
    }

    let engine = load_engine(cli.schema.as_deref(), cli.mapping.as_deref())?;
    if matches!(cli.command, FormCommand::Validate) {
        return run_validate(&engine);
    }

    let layout = load_layout(cli.layout.as_deref())?;
    let reader = SqliteSourceReader::open(&cli.db, layout)?;
    run_form(cli.command, &engine, &reader)
}

/// Executes one command against `db_path` with the bundled configuration.
///
/// # Errors
/// Returns an error when the database cannot be opened or the command fails.
pub fn run_form_with_db(db_path: &Path, command: FormCommand) -> Result<()> {
    if matches!(command, FormCommand::Introspect) {
        return run_introspect(db_path);
    }

    let engine = load_engine(None, None)?;
    let reader = SqliteSourceReader::open(db_path, SourceLayout::default())?;
    run_form(command, &engine, &reader)
}

/// Executes one command against an existing engine and reader.
///
/// # Errors
/// Returns an error when the subject cannot be read, output cannot be
/// written, or a coverage gate fails.
pub fn run_form(
    command: FormCommand,
    engine: &MappingEngine,
    reader: &dyn SourceReader,
) -> Result<()> {
    match command {
        FormCommand::Render(args) => {
            let mut document = match &args.template {
                Some(path) => TemplateDocument::from_json(&read_file(path)?)?,
                None => engine.blank_document(),
            };
            let subject = parse_subject(&args.subject)?;
            let report = map_subject(reader, engine, &subject, &mut document, args.parallel)?;
            let bytes = document.to_bytes()?;

            if let Some(path) = &args.output {
                std::fs::write(path, &bytes).with_context(|| {
                    format!("failed writing document to {}", path.display())
                })?;
                info!(path = %path.display(), bytes = bytes.len(), "document written");
            }

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if args.output.is_some() {
                print_summary(&report);
            } else {
                println!("{}", String::from_utf8_lossy(&bytes));
            }
            Ok(())
        }
        FormCommand::Coverage(args) => {
            let subject = parse_subject(&args.subject)?;
            let mut document = engine.blank_document();
            let report = map_subject(reader, engine, &subject, &mut document, args.parallel)?;

            let regression = match &args.baseline {
                Some(path) => {
                    let baseline = CoverageReport::from_json(&read_file(path)?)?;
                    Some(compare(&baseline, &report))
                }
                None => None,
            };
            let check = evaluate_coverage(report, regression, args.min_ratio)?;
            println!("{}", serde_json::to_string_pretty(&check)?);

            if check.passed {
                Ok(())
            } else {
                Err(anyhow!("coverage gate failed: {}", gate_failures(&check).join("; ")))
            }
        }
        FormCommand::Validate => run_validate(engine),
        FormCommand::Introspect => Err(anyhow!(
            "internal dispatch error: introspect should be handled before reader initialization"
        )),
    }
}

/// Loads and cross-validates the schema and mapping table.
///
/// # Errors
/// Returns an error when a file cannot be read or the table does not cover
/// the schema exactly.
pub fn load_engine(schema: Option<&Path>, mapping: Option<&Path>) -> Result<MappingEngine> {
    let schema = match schema {
        Some(path) => TargetSchema::from_json(&read_file(path)?)?,
        None => TargetSchema::from_json(BUNDLED_SCHEMA)?,
    };
    let table = match mapping {
        Some(path) => MappingTable::from_json(&read_file(path)?)?,
        None => MappingTable::from_json(BUNDLED_TABLE)?,
    };
    Ok(MappingEngine::new(schema, table)?)
}

/// # Errors
/// Returns an error when the layout file cannot be read or names an unsafe
/// identifier.
pub fn load_layout(path: Option<&Path>) -> Result<SourceLayout> {
    match path {
        Some(path) => SourceLayout::from_json(&read_file(path)?),
        None => Ok(SourceLayout::default()),
    }
}

fn map_subject(
    reader: &dyn SourceReader,
    engine: &MappingEngine,
    subject: &SubjectId,
    document: &mut dyn FormDocument,
    parallel: bool,
) -> Result<CoverageReport> {
    if parallel {
        let bundle = reader.read_bundle(subject)?;
        Ok(engine.run_parallel(&bundle, document))
    } else {
        Ok(render(reader, engine, subject, document)?)
    }
}

fn evaluate_coverage(
    report: CoverageReport,
    regression: Option<CoverageRegression>,
    min_ratio: Option<f64>,
) -> Result<CoverageCheck> {
    if let Some(ratio) = min_ratio {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(anyhow!("--min-ratio must be within [0, 1], got {ratio}"));
        }
    }

    let below_ratio = min_ratio.is_some_and(|ratio| report.coverage_ratio < ratio);
    let regressed = regression
        .as_ref()
        .is_some_and(CoverageRegression::is_regression);

    Ok(CoverageCheck {
        passed: !below_ratio && !regressed,
        min_ratio,
        regression,
        report,
    })
}

fn gate_failures(check: &CoverageCheck) -> Vec<String> {
    let mut failures = Vec::new();
    if let Some(ratio) = check.min_ratio {
        if check.report.coverage_ratio < ratio {
            failures.push(format!(
                "coverage ratio {:.3} below minimum {ratio:.3}",
                check.report.coverage_ratio
            ));
        }
    }
    if let Some(regression) = check.regression.as_ref().filter(|r| r.is_regression()) {
        failures.push(format!(
            "populated fields dropped from {} to {} (regressed: {})",
            regression.baseline_populated,
            regression.current_populated,
            regression.regressed_fields.join(", ")
        ));
    }
    failures
}

fn run_validate(engine: &MappingEngine) -> Result<()> {
    let summary = ValidationSummary {
        valid: true,
        schema_version: &engine.schema().schema_version,
        table_version: engine.table_version(),
        fields: engine.rules().len(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_introspect(db_path: &Path) -> Result<()> {
    let conn = open_read_only(db_path)?;
    let tables = describe_sources(&conn)?;
    println!("{}", serde_json::to_string_pretty(&tables)?);
    Ok(())
}

fn print_summary(report: &CoverageReport) {
    println!("subject={}", report.subject_id);
    println!(
        "fields={} resolved={} warned={} absent={} write_failed={}",
        report.total_fields,
        report.resolved,
        report.coerced_with_warning,
        report.absent,
        report.write_failed
    );
    println!("coverage_ratio={:.3}", report.coverage_ratio);
    if !report.template_drift.is_empty() {
        println!("template_drift={}", report.template_drift.join(","));
    }
}

fn parse_subject(raw: &str) -> Result<SubjectId> {
    Ok(SubjectId::parse(raw)?)
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
