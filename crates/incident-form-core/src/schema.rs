use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::MappingError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Checkbox,
    CheckboxGroup,
    Image,
}

impl FieldKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Checkbox => "checkbox",
            Self::CheckboxGroup => "checkbox_group",
            Self::Image => "image",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub kind: FieldKind,
    /// Sub-field names of a checkbox group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl SchemaField {
    #[must_use]
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            options: Vec::new(),
            max_length: None,
        }
    }

    #[must_use]
    pub fn group(name: &str, options: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::CheckboxGroup,
            options: options.iter().map(|option| (*option).to_string()).collect(),
            max_length: None,
        }
    }
}

/// The frozen field contract of the output form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetSchema {
    pub schema_version: String,
    pub fields: Vec<SchemaField>,
}

impl TargetSchema {
    /// Validates field names, uniqueness and per-kind attributes.
    ///
    /// # Errors
    /// Returns [`MappingError::Configuration`] listing every violation.
    pub fn validate(&self) -> Result<(), MappingError> {
        let mut problems = Vec::new();
        if self.schema_version.trim().is_empty() {
            problems.push("schema_version MUST be provided".to_string());
        }
        if self.fields.is_empty() {
            problems.push("schema MUST declare at least one field".to_string());
        }

        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                problems.push("field names MUST be non-empty".to_string());
                continue;
            }
            if !seen.insert(field.name.as_str()) {
                problems.push(format!("duplicate schema field {}", field.name));
            }
            match field.kind {
                FieldKind::CheckboxGroup if field.options.is_empty() => problems.push(format!(
                    "checkbox_group {} MUST declare at least one option",
                    field.name
                )),
                FieldKind::Text | FieldKind::Checkbox | FieldKind::Image
                    if !field.options.is_empty() =>
                {
                    problems.push(format!(
                        "{} field {} cannot declare options",
                        field.kind.as_str(),
                        field.name
                    ));
                }
                _ => {}
            }
            if field.max_length.is_some() && field.kind != FieldKind::Text {
                problems.push(format!(
                    "max_length is only valid on text fields ({})",
                    field.name
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MappingError::Configuration(problems.join("; ")))
        }
    }

    /// Decodes and validates a target schema from JSON.
    ///
    /// # Errors
    /// Returns [`MappingError::Configuration`] when JSON decoding fails or
    /// the decoded schema violates [`TargetSchema::validate`].
    pub fn from_json(input: &str) -> Result<Self, MappingError> {
        let schema: Self = serde_json::from_str(input).map_err(|err| {
            MappingError::Configuration(format!("invalid target schema json: {err}"))
        })?;
        schema.validate()?;
        Ok(schema)
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|field| field.name == name)
    }

    #[must_use]
    pub fn field_names(&self) -> BTreeSet<&str> {
        self.fields.iter().map(|field| field.name.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_and_malformed_fields_are_all_reported() {
        let schema = TargetSchema {
            schema_version: "v1".to_string(),
            fields: vec![
                SchemaField::new("safe", FieldKind::Checkbox),
                SchemaField::new("safe", FieldKind::Checkbox),
                SchemaField::new("weather", FieldKind::CheckboxGroup),
            ],
        };

        let err = match schema.validate() {
            Ok(()) => panic!("expected schema validation failure"),
            Err(err) => err.to_string(),
        };
        assert!(err.contains("duplicate schema field safe"));
        assert!(err.contains("checkbox_group weather"));
    }

    #[test]
    fn kind_names_match_serialized_form() {
        for kind in [
            FieldKind::Text,
            FieldKind::Checkbox,
            FieldKind::CheckboxGroup,
            FieldKind::Image,
        ] {
            match serde_json::to_value(kind) {
                Ok(value) => assert_eq!(value, serde_json::json!(kind.as_str())),
                Err(err) => panic!("kind should encode: {err}"),
            }
        }
        assert!(serde_json::from_str::<FieldKind>("\"signature\"").is_err());
    }

    #[test]
    fn bundled_v1_schema_is_valid() {
        let raw = include_str!("../../../mappings/target_schema.v1.json");
        match TargetSchema::from_json(raw) {
            Ok(schema) => assert!(schema.len() > 20),
            Err(err) => panic!("bundled schema should load: {err}"),
        }
    }
}
