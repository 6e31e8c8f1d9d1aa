use std::collections::BTreeSet;

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};

use crate::document::FieldValue;
use crate::mapping::{Coercion, MappingRule};
use crate::schema::FieldKind;

const TRUTHY: [&str; 3] = ["true", "yes", "1"];
const FALSY: [&str; 3] = ["false", "no", "0"];
const DEFAULT_GROUP_DELIMITER: &str = ",";
const DEFAULT_JOIN_SEPARATOR: &str = ", ";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoercionWarning {
    #[error("unrecognized checkbox value {raw:?} coerced to unchecked")]
    UnrecognizedCheckbox { raw: String },
    #[error("unrecognized yes/no value {raw:?} passed through")]
    UnrecognizedYesNo { raw: String },
    #[error("unmatched group tokens ignored: {}", .tokens.join(", "))]
    UnmatchedOptions { tokens: Vec<String> },
    #[error("cannot read {raw:?} as {expected}; original text kept")]
    UnparseableTemporal { raw: String, expected: &'static str },
    #[error("{shape} value stringified for {kind} field")]
    UnexpectedShape {
        shape: &'static str,
        kind: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coerced {
    pub value: FieldValue,
    pub warning: Option<CoercionWarning>,
}

impl Coerced {
    fn clean(value: FieldValue) -> Self {
        Self {
            value,
            warning: None,
        }
    }

    fn warned(value: FieldValue, warning: CoercionWarning) -> Self {
        Self {
            value,
            warning: Some(warning),
        }
    }
}

/// Converts a resolved raw value into the value the rule's declared kind
/// requires. Total: malformed input yields a best-effort value plus a
/// warning, never a panic or error.
#[must_use]
pub fn coerce(raw: Option<&Value>, rule: &MappingRule) -> Coerced {
    let coercion = rule.coercion.as_ref();
    match rule.kind {
        FieldKind::Text => coerce_text(raw, coercion),
        FieldKind::Checkbox => coerce_checkbox(raw, coercion),
        FieldKind::CheckboxGroup => coerce_group(raw, rule),
        FieldKind::Image => coerce_image(raw),
    }
}

fn coerce_text(raw: Option<&Value>, coercion: Option<&Coercion>) -> Coerced {
    let Some(raw) = raw else {
        return Coerced::clean(FieldValue::Text(String::new()));
    };

    match coercion {
        Some(Coercion::YesNo) => coerce_yes_no(raw),
        Some(Coercion::IsoDate) => coerce_temporal(raw, TemporalTarget::Date),
        Some(Coercion::IsoDatetime) => coerce_temporal(raw, TemporalTarget::DateTime),
        Some(Coercion::IsoTime) => coerce_temporal(raw, TemporalTarget::Time),
        Some(Coercion::Join { separator }) => plain_text(raw, separator),
        _ => plain_text(raw, DEFAULT_JOIN_SEPARATOR),
    }
}

fn plain_text(raw: &Value, separator: &str) -> Coerced {
    match raw {
        Value::Array(items) if items.iter().all(is_scalar) => Coerced::clean(FieldValue::Text(
            items
                .iter()
                .filter_map(scalar_text)
                .collect::<Vec<_>>()
                .join(separator),
        )),
        Value::Array(_) => Coerced::warned(
            FieldValue::Text(raw.to_string()),
            CoercionWarning::UnexpectedShape {
                shape: "nested array",
                kind: "text",
            },
        ),
        Value::Object(_) => Coerced::warned(
            FieldValue::Text(raw.to_string()),
            CoercionWarning::UnexpectedShape {
                shape: "object",
                kind: "text",
            },
        ),
        scalar => Coerced::clean(FieldValue::Text(
            scalar_text(scalar).unwrap_or_default(),
        )),
    }
}

fn coerce_yes_no(raw: &Value) -> Coerced {
    match truthiness(raw) {
        Some(true) => Coerced::clean(FieldValue::Text("yes".to_string())),
        Some(false) => Coerced::clean(FieldValue::Text("no".to_string())),
        None => {
            let text = scalar_text(raw).unwrap_or_else(|| raw.to_string());
            Coerced::warned(
                FieldValue::Text(text.clone()),
                CoercionWarning::UnrecognizedYesNo { raw: text },
            )
        }
    }
}

fn coerce_checkbox(raw: Option<&Value>, coercion: Option<&Coercion>) -> Coerced {
    let Some(raw) = raw else {
        return Coerced::clean(FieldValue::Checkbox(false));
    };

    if let Some(Coercion::Equals { value }) = coercion {
        let wanted = value.trim();
        let checked = match raw {
            Value::Array(items) => items
                .iter()
                .filter_map(scalar_text)
                .any(|item| item.trim().eq_ignore_ascii_case(wanted)),
            other => scalar_text(other).is_some_and(|item| item.trim().eq_ignore_ascii_case(wanted)),
        };
        return Coerced::clean(FieldValue::Checkbox(checked));
    }

    match (truthiness(raw), raw) {
        (Some(checked), _) => Coerced::clean(FieldValue::Checkbox(checked)),
        // Only free text is worth a warning; other shapes are silently unchecked.
        (None, Value::String(text)) if !text.trim().is_empty() => Coerced::warned(
            FieldValue::Checkbox(false),
            CoercionWarning::UnrecognizedCheckbox {
                raw: text.trim().to_string(),
            },
        ),
        (None, _) => Coerced::clean(FieldValue::Checkbox(false)),
    }
}

/// `Some(true)` / `Some(false)` for recognized values, `None` otherwise.
fn truthiness(raw: &Value) -> Option<bool> {
    match raw {
        Value::Bool(flag) => Some(*flag),
        // SQLite REAL columns surface 1 and 0 as 1.0 and 0.0.
        Value::Number(number) => match number.as_f64() {
            Some(value) if (value - 1.0).abs() < f64::EPSILON => Some(true),
            Some(value) if value.abs() < f64::EPSILON => Some(false),
            _ => None,
        },
        Value::String(text) => {
            let lowered = text.trim().to_ascii_lowercase();
            if TRUTHY.contains(&lowered.as_str()) {
                Some(true)
            } else if FALSY.contains(&lowered.as_str()) {
                Some(false)
            } else {
                None
            }
        }
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn coerce_group(raw: Option<&Value>, rule: &MappingRule) -> Coerced {
    let delimiter = match &rule.coercion {
        Some(Coercion::Split { delimiter }) => delimiter.as_str(),
        _ => DEFAULT_GROUP_DELIMITER,
    };

    let tokens = match raw {
        None => Vec::new(),
        Some(value) => group_tokens(value, delimiter),
    };

    let mut selected = BTreeSet::new();
    let mut unmatched = Vec::new();
    for token in tokens {
        let normalized = normalize_token(&token);
        if normalized.is_empty() {
            continue;
        }
        match match_option(&normalized, rule) {
            Some(option) => {
                selected.insert(option);
            }
            None => unmatched.push(token.trim().to_string()),
        }
    }

    if unmatched.is_empty() {
        Coerced::clean(FieldValue::CheckboxGroup(selected))
    } else {
        Coerced::warned(
            FieldValue::CheckboxGroup(selected),
            CoercionWarning::UnmatchedOptions { tokens: unmatched },
        )
    }
}

fn group_tokens(value: &Value, delimiter: &str) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter(|item| !item.is_null())
            .map(|item| scalar_text(item).unwrap_or_else(|| item.to_string()))
            .collect(),
        Value::String(text) => {
            if text.trim_start().starts_with('[') {
                if let Ok(parsed @ Value::Array(_)) = serde_json::from_str::<Value>(text) {
                    return group_tokens(&parsed, delimiter);
                }
            }
            text.split(delimiter).map(str::to_string).collect()
        }
        Value::Null => Vec::new(),
        other => vec![scalar_text(other).unwrap_or_else(|| other.to_string())],
    }
}

fn match_option(normalized: &str, rule: &MappingRule) -> Option<String> {
    if let Some((_, target)) = rule
        .aliases
        .iter()
        .find(|(alias, _)| normalize_token(alias) == normalized)
    {
        return Some(target.clone());
    }
    rule.options
        .iter()
        .find(|option| normalize_token(option) == normalized)
        .cloned()
}

fn normalize_token(token: &str) -> String {
    token
        .trim()
        .to_lowercase()
        .chars()
        .map(|ch| if ch == ' ' || ch == '-' { '_' } else { ch })
        .collect()
}

fn coerce_image(raw: Option<&Value>) -> Coerced {
    match raw {
        None => Coerced::clean(FieldValue::Image(String::new())),
        Some(Value::String(reference)) => Coerced::clean(FieldValue::Image(reference.trim().to_string())),
        Some(other) => Coerced::warned(
            FieldValue::Image(scalar_text(other).unwrap_or_else(|| other.to_string())),
            CoercionWarning::UnexpectedShape {
                shape: shape_name(other),
                kind: "image",
            },
        ),
    }
}

#[derive(Debug, Clone, Copy)]
enum TemporalTarget {
    Date,
    DateTime,
    Time,
}

impl TemporalTarget {
    fn expected(self) -> &'static str {
        match self {
            Self::Date => "ISO-8601 date",
            Self::DateTime => "ISO-8601 date-time",
            Self::Time => "time of day",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Temporal {
    Date(Date),
    Local(PrimitiveDateTime),
    Zoned(OffsetDateTime),
    TimeOfDay(Time),
}

fn coerce_temporal(raw: &Value, target: TemporalTarget) -> Coerced {
    let text = scalar_text(raw).unwrap_or_else(|| raw.to_string());
    let formatted = parse_temporal(raw).and_then(|parsed| format_temporal(parsed, target));
    match formatted {
        Some(value) => Coerced::clean(FieldValue::Text(value)),
        None => Coerced::warned(
            FieldValue::Text(text.clone()),
            CoercionWarning::UnparseableTemporal {
                raw: text,
                expected: target.expected(),
            },
        ),
    }
}

fn parse_temporal(raw: &Value) -> Option<Temporal> {
    match raw {
        Value::Number(number) => {
            let seconds = number.as_i64()?;
            // Millisecond epochs are common in upstream JSON payloads.
            let seconds = if seconds.unsigned_abs() >= 100_000_000_000 {
                seconds / 1_000
            } else {
                seconds
            };
            OffsetDateTime::from_unix_timestamp(seconds)
                .ok()
                .map(Temporal::Zoned)
        }
        Value::String(text) => parse_temporal_text(text.trim()),
        _ => None,
    }
}

fn parse_temporal_text(text: &str) -> Option<Temporal> {
    if let Ok(parsed) = OffsetDateTime::parse(text, &Rfc3339) {
        return Some(Temporal::Zoned(parsed));
    }
    if let Ok(parsed) = Date::parse(text, format_description!("[year]-[month]-[day]")) {
        return Some(Temporal::Date(parsed));
    }

    let local_formats = [
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]"),
    ];
    for format in local_formats {
        if let Ok(parsed) = PrimitiveDateTime::parse(text, format) {
            return Some(Temporal::Local(parsed));
        }
    }

    let time_formats = [
        format_description!("[hour]:[minute]:[second]"),
        format_description!("[hour]:[minute]"),
    ];
    for format in time_formats {
        if let Ok(parsed) = Time::parse(text, format) {
            return Some(Temporal::TimeOfDay(parsed));
        }
    }

    None
}

fn format_temporal(value: Temporal, target: TemporalTarget) -> Option<String> {
    let date_format = format_description!("[year]-[month]-[day]");
    let time_format = format_description!("[hour]:[minute]");
    match (target, value) {
        (TemporalTarget::Date, Temporal::Date(date)) => date.format(date_format).ok(),
        (TemporalTarget::Date, Temporal::Local(local)) => local.date().format(date_format).ok(),
        // The calendar date where the incident happened, not the UTC date.
        (TemporalTarget::Date, Temporal::Zoned(zoned)) => zoned.date().format(date_format).ok(),
        (TemporalTarget::DateTime, Temporal::Date(date)) => {
            crate::format_rfc3339(date.midnight().assume_utc()).ok()
        }
        (TemporalTarget::DateTime, Temporal::Local(local)) => {
            crate::format_rfc3339(local.assume_utc()).ok()
        }
        (TemporalTarget::DateTime, Temporal::Zoned(zoned)) => crate::format_rfc3339(zoned).ok(),
        (TemporalTarget::Time, Temporal::Local(local)) => local.time().format(time_format).ok(),
        (TemporalTarget::Time, Temporal::Zoned(zoned)) => zoned.time().format(time_format).ok(),
        (TemporalTarget::Time, Temporal::TimeOfDay(time)) => time.format(time_format).ok(),
        (TemporalTarget::Date | TemporalTarget::DateTime, Temporal::TimeOfDay(_))
        | (TemporalTarget::Time, Temporal::Date(_)) => None,
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
