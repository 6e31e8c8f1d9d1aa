#![allow(clippy::missing_errors_doc)]

//! SQLite-backed [`SourceReader`] for incident bundles.
//!
//! The reader assumes nothing about the upstream schema beyond the table and
//! key names in [`SourceLayout`]: missing secondary tables or columns yield
//! empty bundle sections, and only an unreadable primary record is fatal.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use incident_form_core::resolve::is_blank;
use incident_form_core::{MappingError, Record, SourceReader, SubjectBundle, SubjectId};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::{debug, warn};

const MAX_SLOT: i64 = 1_000;
const RETRY_BACKOFF_MS: u64 = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectionLayout {
    pub table: String,
    pub subject_column: String,
    /// Stable secondary key that fixes list order; `rowid` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_column: Option<String>,
    /// 1-based position column; rows land in their slot, gaps stay empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_column: Option<String>,
    /// Soft-delete marker; deleted rows become empty slots in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_column: Option<String>,
}

impl SectionLayout {
    fn new(table: &str, subject_column: &str) -> Self {
        Self {
            table: table.to_string(),
            subject_column: subject_column.to_string(),
            order_column: None,
            slot_column: None,
            deleted_column: None,
        }
    }

    fn identifiers(&self) -> impl Iterator<Item = &str> {
        [Some(&self.table), Some(&self.subject_column)]
            .into_iter()
            .chain([
                self.order_column.as_ref(),
                self.slot_column.as_ref(),
                self.deleted_column.as_ref(),
            ])
            .flatten()
            .map(String::as_str)
    }
}

/// Where each bundle section lives in the incident database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceLayout {
    pub primary: SectionLayout,
    pub vehicles: SectionLayout,
    pub witnesses: SectionLayout,
    pub documents: SectionLayout,
    pub transcription: SectionLayout,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for SourceLayout {
    fn default() -> Self {
        let mut vehicles = SectionLayout::new("incident_vehicles", "incident_id");
        vehicles.order_column = Some("created_at".to_string());

        let mut witnesses = SectionLayout::new("incident_witnesses", "incident_id");
        witnesses.order_column = Some("created_at".to_string());
        witnesses.slot_column = Some("witness_number".to_string());
        witnesses.deleted_column = Some("deleted_at".to_string());

        let mut documents = SectionLayout::new("incident_documents", "incident_id");
        documents.order_column = Some("created_at".to_string());
        documents.deleted_column = Some("deleted_at".to_string());

        let mut transcription = SectionLayout::new("incident_transcriptions", "incident_id");
        transcription.order_column = Some("created_at".to_string());

        Self {
            primary: SectionLayout::new("incident_reports", "id"),
            vehicles,
            witnesses,
            documents,
            transcription,
            max_attempts: default_max_attempts(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl SourceLayout {
    /// Every name here is spliced into SQL, so only plain identifiers pass.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts MUST be >= 1"));
        }
        for section in [
            &self.primary,
            &self.vehicles,
            &self.witnesses,
            &self.documents,
            &self.transcription,
        ] {
            for identifier in section.identifiers() {
                if !is_plain_identifier(identifier) {
                    return Err(anyhow!(
                        "layout identifier {identifier:?} MUST match [A-Za-z_][A-Za-z0-9_]*"
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn from_json(input: &str) -> Result<Self> {
        let layout: Self = serde_json::from_str(input).context("invalid source layout json")?;
        layout.validate()?;
        Ok(layout)
    }
}

fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// The mapper never writes to the incident database.
pub fn open_read_only(path: &Path) -> Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open sqlite database at {}", path.display()))
}

pub struct SqliteSourceReader {
    conn: Connection,
    layout: SourceLayout,
}

impl SqliteSourceReader {
    /// Opens the incident database read-only.
    pub fn open(path: &Path, layout: SourceLayout) -> Result<Self> {
        Self::from_connection(open_read_only(path)?, layout)
    }

    pub fn from_connection(conn: Connection, layout: SourceLayout) -> Result<Self> {
        layout.validate()?;
        conn.busy_timeout(Duration::from_millis(layout.busy_timeout_ms))
            .context("failed to configure sqlite busy timeout")?;
        Ok(Self { conn, layout })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn fetch_primary(&self, subject: &SubjectId) -> Result<Record, String> {
        let section = &self.layout.primary;
        let exists = with_retries(self.layout.max_attempts, || {
            table_exists(&self.conn, &section.table)
        })
        .map_err(|err| format!("failed to inspect {}: {err}", section.table))?;
        if !exists {
            return Err(format!("primary table {} does not exist", section.table));
        }

        let sql = format!(
            "SELECT * FROM \"{}\" WHERE \"{}\" = ?1 LIMIT 1",
            section.table, section.subject_column
        );
        let row = with_retries(self.layout.max_attempts, || {
            self.conn
                .query_row(&sql, params![subject.as_str()], row_to_record)
                .optional()
        })
        .map_err(|err| format!("primary query failed: {err}"))?;

        row.ok_or_else(|| format!("no row in {} for this subject", section.table))
    }

    /// Reads a secondary section. Anything short of rows degrades to empty.
    fn fetch_rows(&self, section: &SectionLayout, subject: &SubjectId) -> Vec<Record> {
        match self.try_fetch_rows(section, subject) {
            Ok(rows) => {
                debug!(table = %section.table, rows = rows.len(), "secondary section read");
                rows
            }
            Err(err) => {
                warn!(table = %section.table, error = %err, "secondary section unavailable");
                Vec::new()
            }
        }
    }

    fn try_fetch_rows(&self, section: &SectionLayout, subject: &SubjectId) -> Result<Vec<Record>> {
        if !with_retries(self.layout.max_attempts, || {
            table_exists(&self.conn, &section.table)
        })? {
            debug!(table = %section.table, "secondary table missing");
            return Ok(Vec::new());
        }

        let columns = table_columns(&self.conn, &section.table)?;
        if !columns.contains(&section.subject_column) {
            return Err(anyhow!(
                "missing subject column {}.{}",
                section.table,
                section.subject_column
            ));
        }

        let order = match &section.order_column {
            Some(column) if columns.contains(column) => format!("\"{column}\" ASC, rowid ASC"),
            _ => "rowid ASC".to_string(),
        };
        let sql = format!(
            "SELECT * FROM \"{}\" WHERE \"{}\" = ?1 ORDER BY {order}",
            section.table, section.subject_column
        );

        let rows = with_retries(self.layout.max_attempts, || {
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![subject.as_str()], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .with_context(|| format!("failed to read {}", section.table))?;

        Ok(rows)
    }
}

impl SourceReader for SqliteSourceReader {
    #[tracing::instrument(skip_all, fields(subject = %subject))]
    fn read_bundle(&self, subject: &SubjectId) -> Result<SubjectBundle, MappingError> {
        let primary =
            self.fetch_primary(subject)
                .map_err(|reason| MappingError::SourceUnreachable {
                    subject: subject.to_string(),
                    reason,
                })?;

        let mut bundle = SubjectBundle::new(subject.clone(), primary);
        bundle.vehicles = place_rows(
            self.fetch_rows(&self.layout.vehicles, subject),
            &self.layout.vehicles,
        );
        bundle.witnesses = place_rows(
            self.fetch_rows(&self.layout.witnesses, subject),
            &self.layout.witnesses,
        );
        bundle.documents = place_rows(
            self.fetch_rows(&self.layout.documents, subject),
            &self.layout.documents,
        );
        // Most recent transcription wins.
        bundle.transcription = self
            .fetch_rows(&self.layout.transcription, subject)
            .into_iter()
            .rev()
            .find(|row| !is_deleted(row, &self.layout.transcription));

        Ok(bundle)
    }
}

/// Lays ordered rows out as index-significant slots.
///
/// With a slot column every row, deleted or not, must carry a usable slot
/// number; otherwise placement falls back to row order so that a deleted row
/// still holds its position.
fn place_rows(rows: Vec<Record>, section: &SectionLayout) -> Vec<Option<Record>> {
    let slotted = section.slot_column.as_ref().and_then(|column| {
        rows.iter()
            .map(|row| row.get(column).and_then(slot_number))
            .collect::<Option<Vec<usize>>>()
    });
    if section.slot_column.is_some() && slotted.is_none() && !rows.is_empty() {
        warn!(table = %section.table, "slot column missing or unusable; placing rows by order");
    }

    let mut slots: Vec<Option<Record>> = Vec::new();
    match slotted {
        Some(positions) => {
            for (row, slot) in rows.into_iter().zip(positions) {
                if slots.len() <= slot {
                    slots.resize(slot + 1, None);
                }
                if is_deleted(&row, section) {
                    continue;
                }
                if slots[slot].is_some() {
                    warn!(table = %section.table, slot = slot + 1, "duplicate slot; keeping first row");
                } else {
                    slots[slot] = Some(row);
                }
            }
        }
        None => {
            for row in rows {
                let deleted = is_deleted(&row, section);
                slots.push((!deleted).then_some(row));
            }
        }
    }

    while matches!(slots.last(), Some(None)) {
        slots.pop();
    }
    slots
}

fn slot_number(value: &Value) -> Option<usize> {
    let number = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    if (1..=MAX_SLOT).contains(&number) {
        usize::try_from(number - 1).ok()
    } else {
        None
    }
}

fn is_deleted(row: &Record, section: &SectionLayout) -> bool {
    let Some(column) = &section.deleted_column else {
        return false;
    };
    match row.get(column) {
        None => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64() != Some(0),
        Some(value) => !is_blank(value),
    }
}

fn with_retries<T>(
    max_attempts: u32,
    mut operation: impl FnMut() -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let mut attempt = 1;
    loop {
        match operation() {
            Err(err) if attempt < max_attempts && is_transient(&err) => {
                warn!(attempt, error = %err, "sqlite busy; retrying");
                std::thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt)));
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let statement = row.as_ref();
    let mut record = Record::new();
    for index in 0..statement.column_count() {
        let name = statement.column_name(index)?.to_string();
        record.insert(name, sql_to_json(row.get_ref(index)?));
    }
    Ok(record)
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        // Media bytes live in object storage; only references are mapped.
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(number) => Value::Number(number.into()),
        ValueRef::Real(number) => Number::from_f64(number).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> rusqlite::Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type IN ('table', 'view') AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    Ok(exists)
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    Ok(column_info(conn, table_name)?
        .into_iter()
        .map(|column| column.name)
        .collect())
}

fn column_info(conn: &Connection, table_name: &str) -> Result<Vec<ColumnDescription>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{table_name}\")"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(ColumnDescription {
            name: row.get(1)?,
            declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            not_null: row.get::<_, i64>(3)? != 0,
            primary_key: row.get::<_, i64>(5)? != 0,
        });
    }

    Ok(columns)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDescription {
    pub name: String,
    pub row_count: i64,
    pub columns: Vec<ColumnDescription>,
}

/// Lists every user table with its columns and row count. Used while
/// authoring mapping tables, never by the mapping engine itself.
pub fn describe_sources(conn: &Connection) -> Result<Vec<TableDescription>> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name ASC",
        )
        .context("failed to list tables")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let row_count = conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{name}\""), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count rows in {name}"))?;
        tables.push(TableDescription {
            columns: column_info(conn, &name)?,
            name,
            row_count,
        });
    }
    Ok(tables)
}

/// Creates the default-layout tables and one representative incident:
/// one vehicle, witnesses 1 and 3 with witness 2 soft-deleted, two
/// documents and a transcription.
pub fn seed_fixture_incident(conn: &Connection, subject: &str) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS incident_reports (
            id TEXT PRIMARY KEY,
            full_name TEXT,
            phone TEXT,
            is_safe TEXT,
            are_you_safe INTEGER,
            accident_date TEXT,
            accident_time TEXT,
            location TEXT,
            weather_conditions TEXT,
            road_type TEXT,
            police_attended INTEGER,
            ambulance_called TEXT,
            accident_description TEXT,
            submitted_at TEXT
         );
         CREATE TABLE IF NOT EXISTS incident_vehicles (
            id INTEGER PRIMARY KEY,
            incident_id TEXT NOT NULL,
            make TEXT,
            model TEXT,
            license_plate TEXT,
            is_driveable TEXT,
            created_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS incident_witnesses (
            id INTEGER PRIMARY KEY,
            incident_id TEXT NOT NULL,
            witness_number INTEGER,
            witness_name TEXT,
            witness_phone TEXT,
            witness_statement TEXT,
            created_at TEXT NOT NULL,
            deleted_at TEXT
         );
         CREATE TABLE IF NOT EXISTS incident_documents (
            id INTEGER PRIMARY KEY,
            incident_id TEXT NOT NULL,
            document_type TEXT NOT NULL,
            storage_path TEXT,
            public_url TEXT,
            content BLOB,
            created_at TEXT NOT NULL,
            deleted_at TEXT
         );
         CREATE TABLE IF NOT EXISTS incident_transcriptions (
            id INTEGER PRIMARY KEY,
            incident_id TEXT NOT NULL,
            transcription_text TEXT,
            safety_status TEXT,
            created_at TEXT NOT NULL
         );",
    )
    .context("failed to create fixture incident tables")?;

    conn.execute(
        "INSERT OR REPLACE INTO incident_reports(
            id, full_name, phone, is_safe, are_you_safe, accident_date, accident_time,
            location, weather_conditions, road_type, police_attended, ambulance_called,
            accident_description, submitted_at
         ) VALUES (?1, 'Dana Reyes', '07700 900123', 'yes', 1, '2025-01-01', '17:45',
            'A38 northbound, junction 4', 'Rain, fog', 'motorway', 0, 'false',
            'Rear-ended while queueing at the junction', '2025-01-01T18:30:00Z')",
        params![subject],
    )
    .context("failed to seed incident_reports row")?;

    conn.execute(
        "INSERT INTO incident_vehicles(incident_id, make, model, license_plate, is_driveable, created_at)
         VALUES (?1, 'Ford', 'Focus', 'AB12 CDE', 'no', '2025-01-01T18:31:00Z')",
        params![subject],
    )
    .context("failed to seed incident_vehicles row")?;

    for (number, name, deleted_at) in [
        (1_i64, "Ann Ortiz", None),
        (2_i64, "Bob Okafor", Some("2025-01-02T09:00:00Z")),
        (3_i64, "Cy Lindqvist", None),
    ] {
        conn.execute(
            "INSERT INTO incident_witnesses(
                incident_id, witness_number, witness_name, witness_phone, witness_statement,
                created_at, deleted_at
             ) VALUES (?1, ?2, ?3, '07700 900456', 'Saw the second car brake late', ?4, ?5)",
            params![
                subject,
                number,
                name,
                format!("2025-01-01T18:3{number}:00Z"),
                deleted_at
            ],
        )
        .context("failed to seed incident_witnesses row")?;
    }

    for (document_type, path) in [
        ("driving_license", "uploads/license-front.jpg"),
        ("scene_photo", "uploads/scene-1.jpg"),
    ] {
        conn.execute(
            "INSERT INTO incident_documents(incident_id, document_type, storage_path, created_at)
             VALUES (?1, ?2, ?3, '2025-01-01T18:40:00Z')",
            params![subject, document_type, path],
        )
        .context("failed to seed incident_documents row")?;
    }

    conn.execute(
        "INSERT INTO incident_transcriptions(incident_id, transcription_text, safety_status, created_at)
         VALUES (?1, 'I was stopped when the other car hit me.', 'safe', '2025-01-01T18:45:00Z')",
        params![subject],
    )
    .context("failed to seed incident_transcriptions row")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use incident_form_core::{FieldStatus, FieldValue, MappingEngine};
    use serde_json::json;

    const SCHEMA_V1: &str = include_str!("../../../mappings/target_schema.v1.json");
    const TABLE_V1: &str = include_str!("../../../mappings/mapping_table.v1.json");

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn subject(raw: &str) -> SubjectId {
        match SubjectId::parse(raw) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture subject: {err}"),
        }
    }

    fn memory_conn() -> Connection {
        match Connection::open_in_memory() {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open in-memory sqlite: {err}"),
        }
    }

    fn fixture_reader() -> SqliteSourceReader {
        let conn = memory_conn();
        must(seed_fixture_incident(&conn, "inc-0001"));
        must(SqliteSourceReader::from_connection(conn, SourceLayout::default()))
    }

    fn read(reader: &SqliteSourceReader, raw: &str) -> SubjectBundle {
        match reader.read_bundle(&subject(raw)) {
            Ok(bundle) => bundle,
            Err(err) => panic!("expected bundle: {err}"),
        }
    }

    #[test]
    fn fixture_incident_reads_into_slot_addressed_bundle() {
        let bundle = read(&fixture_reader(), "inc-0001");

        assert_eq!(bundle.primary.get("is_safe"), Some(&json!("yes")));
        assert_eq!(bundle.primary.get("are_you_safe"), Some(&json!(1)));
        assert_eq!(bundle.vehicles.len(), 1);
        assert_eq!(bundle.witnesses.len(), 3);
        assert!(bundle.witnesses[1].is_none());
        assert_eq!(
            bundle.witnesses[2]
                .as_ref()
                .and_then(|row| row.get("witness_name")),
            Some(&json!("Cy Lindqvist"))
        );
        assert_eq!(bundle.documents.len(), 2);
        assert_eq!(
            bundle.documents[0]
                .as_ref()
                .and_then(|row| row.get("content")),
            Some(&Value::Null)
        );
        assert!(bundle.transcription.is_some());
    }

    #[test]
    fn missing_secondary_tables_are_empty_sections() {
        let conn = memory_conn();
        must(
            conn.execute_batch(
                "CREATE TABLE incident_reports (id TEXT PRIMARY KEY, is_safe TEXT);
                 INSERT INTO incident_reports VALUES ('inc-9', 'yes');",
            )
            .map_err(Into::into),
        );
        let reader = must(SqliteSourceReader::from_connection(conn, SourceLayout::default()));

        let bundle = read(&reader, "inc-9");
        assert!(bundle.vehicles.is_empty());
        assert!(bundle.witnesses.is_empty());
        assert!(bundle.documents.is_empty());
        assert!(bundle.transcription.is_none());
    }

    #[test]
    fn secondary_table_without_subject_column_degrades_to_empty() {
        let conn = memory_conn();
        must(
            conn.execute_batch(
                "CREATE TABLE incident_reports (id TEXT PRIMARY KEY);
                 INSERT INTO incident_reports VALUES ('inc-9');
                 CREATE TABLE incident_vehicles (report_ref TEXT, make TEXT);
                 INSERT INTO incident_vehicles VALUES ('inc-9', 'Kia');",
            )
            .map_err(Into::into),
        );
        let reader = must(SqliteSourceReader::from_connection(conn, SourceLayout::default()));
        assert!(read(&reader, "inc-9").vehicles.is_empty());
    }

    #[test]
    fn missing_primary_row_or_table_is_unreachable() {
        let reader = fixture_reader();
        match reader.read_bundle(&subject("inc-404")) {
            Err(MappingError::SourceUnreachable { reason, .. }) => {
                assert!(reason.contains("no row"));
            }
            other => panic!("expected SourceUnreachable, got {other:?}"),
        }

        let empty = must(SqliteSourceReader::from_connection(
            memory_conn(),
            SourceLayout::default(),
        ));
        match empty.read_bundle(&subject("inc-0001")) {
            Err(MappingError::SourceUnreachable { reason, .. }) => {
                assert!(reason.contains("does not exist"));
            }
            other => panic!("expected SourceUnreachable, got {other:?}"),
        }
    }

    fn witness_names(bundle: &SubjectBundle) -> Vec<Option<Value>> {
        bundle
            .witnesses
            .iter()
            .map(|slot| slot.as_ref().and_then(|row| row.get("witness_name").cloned()))
            .collect()
    }

    fn witness_reader(witness_table: &str, rows: &str) -> SqliteSourceReader {
        let conn = memory_conn();
        must(
            conn.execute_batch(&format!(
                "CREATE TABLE incident_reports (id TEXT PRIMARY KEY);
                 INSERT INTO incident_reports VALUES ('inc-7');
                 {witness_table}
                 {rows}"
            ))
            .map_err(Into::into),
        );
        must(SqliteSourceReader::from_connection(conn, SourceLayout::default()))
    }

    #[test]
    fn missing_slot_column_keeps_deleted_witness_position() {
        let reader = witness_reader(
            "CREATE TABLE incident_witnesses (
                incident_id TEXT, witness_name TEXT, created_at TEXT, deleted_at TEXT
             );",
            "INSERT INTO incident_witnesses VALUES ('inc-7', 'Ann', '2025-01-01T10:00:00Z', NULL);
             INSERT INTO incident_witnesses VALUES ('inc-7', 'Bob', '2025-01-01T10:01:00Z', '2025-01-02T00:00:00Z');
             INSERT INTO incident_witnesses VALUES ('inc-7', 'Cy', '2025-01-01T10:02:00Z', NULL);",
        );

        assert_eq!(
            witness_names(&read(&reader, "inc-7")),
            vec![Some(json!("Ann")), None, Some(json!("Cy"))]
        );
    }

    #[test]
    fn null_slot_values_fall_back_to_row_order() {
        let reader = witness_reader(
            "CREATE TABLE incident_witnesses (
                incident_id TEXT, witness_number INTEGER, witness_name TEXT,
                created_at TEXT, deleted_at TEXT
             );",
            "INSERT INTO incident_witnesses VALUES ('inc-7', 1, 'Ann', '2025-01-01T10:00:00Z', NULL);
             INSERT INTO incident_witnesses VALUES ('inc-7', NULL, 'Bob', '2025-01-01T10:01:00Z', '2025-01-02T00:00:00Z');
             INSERT INTO incident_witnesses VALUES ('inc-7', NULL, 'Cy', '2025-01-01T10:02:00Z', NULL);",
        );

        assert_eq!(
            witness_names(&read(&reader, "inc-7")),
            vec![Some(json!("Ann")), None, Some(json!("Cy"))]
        );
    }

    #[test]
    fn unslotted_lists_keep_deleted_rows_as_gaps_and_follow_order_column() {
        let conn = memory_conn();
        must(seed_fixture_incident(&conn, "inc-0001"));
        must(
            conn.execute_batch(
                "INSERT INTO incident_documents(incident_id, document_type, storage_path, created_at, deleted_at)
                 VALUES ('inc-0001', 'scene_photo', 'uploads/old.jpg', '2025-01-01T18:39:00Z', '2025-01-03T00:00:00Z');
                 INSERT INTO incident_documents(incident_id, document_type, storage_path, created_at)
                 VALUES ('inc-0001', 'vehicle_damage', 'uploads/dent.jpg', '2025-01-01T18:38:00Z');",
            )
            .map_err(Into::into),
        );
        let reader = must(SqliteSourceReader::from_connection(conn, SourceLayout::default()));
        let bundle = read(&reader, "inc-0001");

        let paths: Vec<Option<Value>> = bundle
            .documents
            .iter()
            .map(|slot| slot.as_ref().and_then(|row| row.get("storage_path").cloned()))
            .collect();
        assert_eq!(
            paths,
            vec![
                Some(json!("uploads/dent.jpg")),
                None,
                Some(json!("uploads/license-front.jpg")),
                Some(json!("uploads/scene-1.jpg")),
            ]
        );
    }

    #[test]
    fn layout_rejects_identifiers_that_would_break_sql() {
        let mut layout = SourceLayout::default();
        layout.witnesses.table = "witnesses; DROP TABLE x".to_string();
        assert!(layout.validate().is_err());

        let raw = match serde_json::to_string(&SourceLayout::default()) {
            Ok(value) => value,
            Err(err) => panic!("layout should encode: {err}"),
        };
        assert_eq!(must(SourceLayout::from_json(&raw)), SourceLayout::default());
    }

    #[test]
    fn describe_sources_lists_tables_columns_and_counts() {
        let reader = fixture_reader();
        let tables = must(describe_sources(reader.connection()));

        let names: Vec<&str> = tables.iter().map(|table| table.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "incident_documents",
                "incident_reports",
                "incident_transcriptions",
                "incident_vehicles",
                "incident_witnesses",
            ]
        );
        let witnesses = &tables[4];
        assert_eq!(witnesses.row_count, 3);
        assert!(witnesses
            .columns
            .iter()
            .any(|column| column.name == "witness_number" && column.declared_type == "INTEGER"));
    }

    #[test]
    fn fixture_incident_maps_end_to_end_through_v1_table() {
        let engine = match MappingEngine::from_json(SCHEMA_V1, TABLE_V1) {
            Ok(value) => value,
            Err(err) => panic!("bundled mapping should load: {err}"),
        };
        let bundle = read(&fixture_reader(), "inc-0001");
        let mut document = engine.blank_document();
        let report = engine.run(&bundle, &mut document);

        assert_eq!(report.write_failed, 0);
        assert_eq!(
            document.value("witness_1_name"),
            Some(&FieldValue::Text("Ann Ortiz".to_string()))
        );
        assert_eq!(
            report.outcome("witness_2_name").map(|outcome| outcome.status),
            Some(FieldStatus::Absent)
        );
        assert_eq!(
            document.value("witness_3_name"),
            Some(&FieldValue::Text("Cy Lindqvist".to_string()))
        );
        assert_eq!(
            document.value("vehicle_1_registration"),
            Some(&FieldValue::Text("AB12 CDE".to_string()))
        );
        assert_eq!(
            document.value("photo_scene"),
            Some(&FieldValue::Image("uploads/scene-1.jpg".to_string()))
        );
        assert_eq!(
            document.value("road_type_motorway"),
            Some(&FieldValue::Checkbox(true))
        );
        assert_eq!(
            document.value("ambulance_called"),
            Some(&FieldValue::Text("no".to_string()))
        );
        // "safe" in the transcription is not a recognized checkbox value, but
        // the primary record wins so it is only a shadowed conflict.
        assert_eq!(
            report.outcome("reporter_safe").map(|outcome| outcome.conflict),
            Some(true)
        );
    }
}
