use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bundle::Section;
use crate::schema::{FieldKind, TargetSchema};
use crate::MappingError;

/// One candidate lookup in a fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionSpec {
    pub section: Section,
    /// Slot index within list sections, after `filter` is applied.
    #[serde(default)]
    pub index: usize,
    /// Column equality filter applied to list sections before indexing.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filter: BTreeMap<String, Value>,
    /// Dotted key path; numeric segments index into arrays. Column names
    /// that themselves contain `.` cannot be addressed.
    pub path: String,
}

impl ExtractionSpec {
    #[must_use]
    pub fn new(section: Section, path: &str) -> Self {
        Self {
            section,
            index: 0,
            filter: BTreeMap::new(),
            path: path.to_string(),
        }
    }

    #[must_use]
    pub fn at(section: Section, index: usize, path: &str) -> Self {
        Self {
            index,
            ..Self::new(section, path)
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('.')
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Coercion {
    Truthy,
    Equals { value: String },
    YesNo,
    IsoDate,
    IsoDatetime,
    IsoTime,
    Split { delimiter: String },
    Join { separator: String },
}

impl Coercion {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Truthy => "truthy",
            Self::Equals { .. } => "equals",
            Self::YesNo => "yes_no",
            Self::IsoDate => "iso_date",
            Self::IsoDatetime => "iso_datetime",
            Self::IsoTime => "iso_time",
            Self::Split { .. } => "split",
            Self::Join { .. } => "join",
        }
    }

    #[must_use]
    pub fn applies_to(&self, kind: FieldKind) -> bool {
        match self {
            Self::Truthy | Self::Equals { .. } => kind == FieldKind::Checkbox,
            Self::YesNo | Self::IsoDate | Self::IsoDatetime | Self::IsoTime | Self::Join { .. } => {
                kind == FieldKind::Text
            }
            Self::Split { .. } => kind == FieldKind::CheckboxGroup,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingRule {
    pub field: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub candidates: Vec<ExtractionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coercion: Option<Coercion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Valid sub-field names for checkbox groups.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Normalized source token to sub-field name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aliases: BTreeMap<String, String>,
}

impl MappingRule {
    #[must_use]
    pub fn new(field: &str, kind: FieldKind, candidates: Vec<ExtractionSpec>) -> Self {
        Self {
            field: field.to_string(),
            kind,
            candidates,
            coercion: None,
            default: None,
            options: Vec::new(),
            aliases: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_coercion(mut self, coercion: Coercion) -> Self {
        self.coercion = Some(coercion);
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|option| (*option).to_string()).collect();
        self
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.candidates.is_empty() && self.default.is_none() {
            problems.push(format!(
                "rule {} has neither candidates nor a default",
                self.field
            ));
        }

        for (position, candidate) in self.candidates.iter().enumerate() {
            if candidate.segments().any(|segment| segment.trim().is_empty()) {
                problems.push(format!(
                    "rule {} candidate {position} has an empty path segment",
                    self.field
                ));
            }
            if !candidate.section.is_list() && (candidate.index != 0 || !candidate.filter.is_empty())
            {
                problems.push(format!(
                    "rule {} candidate {position} uses index/filter on single-record section {}",
                    self.field,
                    candidate.section.as_str()
                ));
            }
        }

        if let Some(coercion) = &self.coercion {
            if !coercion.applies_to(self.kind) {
                problems.push(format!(
                    "rule {} coercion {} cannot target {} fields",
                    self.field,
                    coercion.as_str(),
                    self.kind.as_str()
                ));
            }
            if let Coercion::Split { delimiter } = coercion {
                if delimiter.is_empty() {
                    problems.push(format!("rule {} split delimiter is empty", self.field));
                }
            }
        }

        if self.kind == FieldKind::CheckboxGroup {
            if self.options.is_empty() {
                problems.push(format!(
                    "checkbox_group rule {} MUST declare options",
                    self.field
                ));
            }
            for target in self.aliases.values() {
                if !self.options.contains(target) {
                    problems.push(format!(
                        "rule {} alias points at undeclared option {target}",
                        self.field
                    ));
                }
            }
        } else if !self.options.is_empty() || !self.aliases.is_empty() {
            problems.push(format!(
                "rule {} declares options but is not a checkbox_group",
                self.field
            ));
        }

        problems
    }
}

/// Versioned, declarative list of mapping rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingTable {
    pub table_version: String,
    pub rules: Vec<MappingRule>,
}

impl MappingTable {
    /// Decodes a mapping table from JSON. Schema coverage is checked later by
    /// [`MappingTable::validate_against`].
    ///
    /// # Errors
    /// Returns [`MappingError::MappingTableInvalid`] when JSON decoding fails.
    pub fn from_json(input: &str) -> Result<Self, MappingError> {
        serde_json::from_str(input).map_err(|err| {
            MappingError::MappingTableInvalid(vec![format!("invalid mapping table json: {err}")])
        })
    }

    /// Checks that the table covers the schema exactly once per field and
    /// that every rule is internally consistent with its schema field.
    ///
    /// # Errors
    /// Returns [`MappingError::MappingTableInvalid`] listing duplicate rules,
    /// uncovered schema fields, orphan rules, kind mismatches and malformed
    /// rules together.
    pub fn validate_against(&self, schema: &TargetSchema) -> Result<(), MappingError> {
        let mut problems = Vec::new();
        if self.table_version.trim().is_empty() {
            problems.push("table_version MUST be provided".to_string());
        }

        let mut seen = BTreeSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.field.as_str()) {
                problems.push(format!("duplicate rule for field {}", rule.field));
            }

            match schema.field(&rule.field) {
                None => problems.push(format!("orphan rule {} has no schema field", rule.field)),
                Some(field) => {
                    if field.kind != rule.kind {
                        problems.push(format!(
                            "rule {} kind {} does not match schema kind {}",
                            rule.field,
                            rule.kind.as_str(),
                            field.kind.as_str()
                        ));
                    }
                    for option in &rule.options {
                        if !field.options.contains(option) {
                            problems.push(format!(
                                "rule {} option {option} is not a schema option",
                                rule.field
                            ));
                        }
                    }
                }
            }

            problems.extend(rule.problems());
        }

        for name in schema.field_names() {
            if !seen.contains(name) {
                problems.push(format!("schema field {name} has no mapping rule"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MappingError::MappingTableInvalid(problems))
        }
    }

    #[must_use]
    pub fn rule(&self, field: &str) -> Option<&MappingRule> {
        self.rules.iter().find(|rule| rule.field == field)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaField;
    use serde_json::json;

    fn schema() -> TargetSchema {
        TargetSchema {
            schema_version: "v1".to_string(),
            fields: vec![
                SchemaField::new("safe", FieldKind::Checkbox),
                SchemaField::new("accident_date", FieldKind::Text),
                SchemaField::group("weather", &["rain", "fog"]),
            ],
        }
    }

    fn complete_table() -> MappingTable {
        MappingTable {
            table_version: "t1".to_string(),
            rules: vec![
                MappingRule::new(
                    "safe",
                    FieldKind::Checkbox,
                    vec![ExtractionSpec::new(Section::Primary, "is_safe")],
                ),
                MappingRule::new(
                    "accident_date",
                    FieldKind::Text,
                    vec![ExtractionSpec::new(Section::Primary, "accident_date")],
                )
                .with_coercion(Coercion::IsoDate),
                MappingRule::new(
                    "weather",
                    FieldKind::CheckboxGroup,
                    vec![ExtractionSpec::new(Section::Primary, "weather")],
                )
                .with_options(&["rain", "fog"]),
            ],
        }
    }

    fn invalid_problems(table: &MappingTable) -> Vec<String> {
        match table.validate_against(&schema()) {
            Err(MappingError::MappingTableInvalid(problems)) => problems,
            Err(other) => panic!("unexpected error kind: {other}"),
            Ok(()) => panic!("expected the mapping table to be rejected"),
        }
    }

    #[test]
    fn complete_table_matches_schema_field_set() {
        let table = complete_table();
        if let Err(err) = table.validate_against(&schema()) {
            panic!("complete table should validate: {err}");
        }
        let rule_names: BTreeSet<&str> = table.rules.iter().map(|rule| rule.field.as_str()).collect();
        assert_eq!(rule_names, schema().field_names());
    }

    #[test]
    fn gaps_duplicates_and_orphans_are_reported_together() {
        let mut table = complete_table();
        table.rules.remove(1);
        let duplicate = table.rules[0].clone();
        table.rules.push(duplicate);
        table.rules.push(MappingRule::new(
            "signature",
            FieldKind::Image,
            vec![ExtractionSpec::new(Section::Document, "url")],
        ));

        let problems = invalid_problems(&table);
        assert!(problems.iter().any(|p| p.contains("duplicate rule for field safe")));
        assert!(problems
            .iter()
            .any(|p| p.contains("schema field accident_date has no mapping rule")));
        assert!(problems.iter().any(|p| p.contains("orphan rule signature")));
    }

    #[test]
    fn kind_and_directive_mismatches_are_rejected() {
        let mut table = complete_table();
        table.rules[0].kind = FieldKind::Text;
        table.rules[1].coercion = Some(Coercion::Truthy);

        let problems = invalid_problems(&table);
        assert!(problems
            .iter()
            .any(|p| p.contains("rule safe kind text does not match schema kind checkbox")));
        assert!(problems
            .iter()
            .any(|p| p.contains("coercion truthy cannot target text")));
    }

    #[test]
    fn group_options_must_exist_in_schema() {
        let mut table = complete_table();
        table.rules[2] = table.rules[2].clone().with_options(&["rain", "hail"]);

        let problems = invalid_problems(&table);
        assert!(problems
            .iter()
            .any(|p| p.contains("option hail is not a schema option")));
    }

    #[test]
    fn table_json_uses_tagged_coercions() {
        let raw = json!({
            "table_version": "t1",
            "rules": [{
                "field": "weather",
                "kind": "checkbox_group",
                "candidates": [{"section": "primary", "path": "weather"}],
                "coercion": {"type": "split", "delimiter": ";"},
                "options": ["rain"]
            }]
        })
        .to_string();

        let table = match MappingTable::from_json(&raw) {
            Ok(value) => value,
            Err(err) => panic!("table should decode: {err}"),
        };
        assert_eq!(
            table.rules[0].coercion,
            Some(Coercion::Split {
                delimiter: ";".to_string()
            })
        );
    }

    #[test]
    fn bundled_v1_table_covers_bundled_schema() {
        let schema = match TargetSchema::from_json(include_str!(
            "../../../mappings/target_schema.v1.json"
        )) {
            Ok(value) => value,
            Err(err) => panic!("bundled schema should load: {err}"),
        };
        let table = match MappingTable::from_json(include_str!(
            "../../../mappings/mapping_table.v1.json"
        )) {
            Ok(value) => value,
            Err(err) => panic!("bundled table should decode: {err}"),
        };
        if let Err(err) = table.validate_against(&schema) {
            panic!("bundled table should cover bundled schema: {err}");
        }
    }
}
