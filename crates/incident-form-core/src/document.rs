use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::schema::{FieldKind, SchemaField, TargetSchema};
use crate::MappingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Checkbox(bool),
    CheckboxGroup(BTreeSet<String>),
    Image(String),
}

impl FieldValue {
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Text(_) => FieldKind::Text,
            Self::Checkbox(_) => FieldKind::Checkbox,
            Self::CheckboxGroup(_) => FieldKind::CheckboxGroup,
            Self::Image(_) => FieldKind::Image,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Checkbox(checked) => Value::Bool(*checked),
            Self::CheckboxGroup(selected) => Value::Array(
                selected
                    .iter()
                    .map(|option| Value::String(option.clone()))
                    .collect(),
            ),
            Self::Image(reference) => {
                let mut map = Map::new();
                map.insert("image_ref".to_string(), Value::String(reference.clone()));
                Value::Object(map)
            }
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WriteFailure {
    #[error("field {field} does not exist in the loaded template")]
    MissingField { field: String },
    #[error("field {field} is {actual} in the template, not {expected}")]
    KindMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("field {field} has no options named {}", .options.join(", "))]
    UnknownOptions { field: String, options: Vec<String> },
    #[error("field {field} accepts at most {max} characters, got {actual}")]
    TooLong {
        field: String,
        max: usize,
        actual: usize,
    },
}

/// Named-field access to one loaded form template.
///
/// Implementations wrap whatever concrete document format is in use; the
/// field set they expose is authoritative over the mapping table.
pub trait FormDocument {
    fn field_kind(&self, name: &str) -> Option<FieldKind>;

    /// Sets one field. Writing the same value twice leaves the document
    /// unchanged.
    ///
    /// # Errors
    /// Returns a [`WriteFailure`] when the field is missing, has a different
    /// kind, or rejects the value.
    fn write_field(&mut self, name: &str, kind: FieldKind, value: &FieldValue)
        -> Result<(), WriteFailure>;

    /// Serializes the document in its current state.
    ///
    /// # Errors
    /// Returns [`MappingError::Document`] when serialization fails.
    fn to_bytes(&self) -> Result<Vec<u8>, MappingError>;
}

/// Applies one coerced value, turning every failure into data.
///
/// # Errors
/// Returns the document's [`WriteFailure`]; callers record it and move on.
pub fn write(
    document: &mut dyn FormDocument,
    field: &str,
    kind: FieldKind,
    value: &FieldValue,
) -> Result<(), WriteFailure> {
    if value.kind() != kind {
        return Err(WriteFailure::KindMismatch {
            field: field.to_string(),
            expected: kind.as_str(),
            actual: value.kind().as_str(),
        });
    }
    document.write_field(field, kind, value)
}

#[derive(Debug, Clone)]
struct Slot {
    spec: SchemaField,
    value: Option<FieldValue>,
}

/// In-memory form built from a template field list. Serializes to canonical
/// JSON in template order.
#[derive(Debug, Clone)]
pub struct TemplateDocument {
    template_version: String,
    slots: Vec<Slot>,
}

impl TemplateDocument {
    #[must_use]
    pub fn from_schema(template: &TargetSchema) -> Self {
        Self {
            template_version: template.schema_version.clone(),
            slots: template
                .fields
                .iter()
                .map(|spec| Slot {
                    spec: spec.clone(),
                    value: None,
                })
                .collect(),
        }
    }

    /// Loads a live template, which may have drifted from the contract schema.
    ///
    /// # Errors
    /// Returns [`MappingError::Configuration`] when the template is not a
    /// valid field list.
    pub fn from_json(input: &str) -> Result<Self, MappingError> {
        let template = TargetSchema::from_json(input)?;
        Ok(Self::from_schema(&template))
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.slots
            .iter()
            .find(|slot| slot.spec.name == name)
            .and_then(|slot| slot.value.as_ref())
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut fields = Map::new();
        for slot in &self.slots {
            let value = slot.value.as_ref().map_or_else(
                || blank_value(&slot.spec),
                FieldValue::to_json,
            );
            fields.insert(slot.spec.name.clone(), value);
        }

        let mut document = Map::new();
        document.insert(
            "template_version".to_string(),
            Value::String(self.template_version.clone()),
        );
        document.insert("fields".to_string(), Value::Object(fields));
        Value::Object(document)
    }
}

fn blank_value(spec: &SchemaField) -> Value {
    match spec.kind {
        FieldKind::Text | FieldKind::Image => Value::Null,
        FieldKind::Checkbox => Value::Bool(false),
        FieldKind::CheckboxGroup => Value::Array(Vec::new()),
    }
}

impl FormDocument for TemplateDocument {
    fn field_kind(&self, name: &str) -> Option<FieldKind> {
        self.slots
            .iter()
            .find(|slot| slot.spec.name == name)
            .map(|slot| slot.spec.kind)
    }

    fn write_field(
        &mut self,
        name: &str,
        kind: FieldKind,
        value: &FieldValue,
    ) -> Result<(), WriteFailure> {
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.spec.name == name) else {
            return Err(WriteFailure::MissingField {
                field: name.to_string(),
            });
        };

        if slot.spec.kind != kind {
            return Err(WriteFailure::KindMismatch {
                field: name.to_string(),
                expected: kind.as_str(),
                actual: slot.spec.kind.as_str(),
            });
        }

        match value {
            FieldValue::CheckboxGroup(selected) => {
                let unknown: Vec<String> = selected
                    .iter()
                    .filter(|option| !slot.spec.options.contains(option))
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    return Err(WriteFailure::UnknownOptions {
                        field: name.to_string(),
                        options: unknown,
                    });
                }
            }
            FieldValue::Text(text) => {
                if let Some(max) = slot.spec.max_length {
                    let actual = text.chars().count();
                    if actual > max {
                        return Err(WriteFailure::TooLong {
                            field: name.to_string(),
                            max,
                            actual,
                        });
                    }
                }
            }
            FieldValue::Checkbox(_) | FieldValue::Image(_) => {}
        }

        slot.value = Some(value.clone());
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>, MappingError> {
        serde_json::to_vec_pretty(&self.to_json())
            .map_err(|err| MappingError::Document(format!("failed to serialize document: {err}")))
    }
}
