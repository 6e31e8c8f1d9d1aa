use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bundle::{Record, SubjectBundle};
use crate::mapping::{ExtractionSpec, MappingRule};

/// Where a field's raw value came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    Candidate { index: usize },
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: Option<Value>,
    pub origin: Option<Origin>,
    /// Later candidates that would also have matched; bookkeeping only.
    pub shadowed: Vec<usize>,
    /// A shadowed candidate holds a different value than the winner.
    pub conflict: bool,
}

impl Resolution {
    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.value.is_none()
    }
}

/// Walks the rule's fallback chain left to right and returns the first
/// non-absent raw value unchanged, or the rule's default when every
/// candidate is absent.
#[must_use]
pub fn resolve(bundle: &SubjectBundle, rule: &MappingRule) -> Resolution {
    let mut winner: Option<(usize, Value)> = None;
    let mut shadowed = Vec::new();
    let mut conflict = false;

    for (index, candidate) in rule.candidates.iter().enumerate() {
        let Some(found) = lookup(bundle, candidate) else {
            continue;
        };
        match &winner {
            None => winner = Some((index, found)),
            Some((_, chosen)) => {
                if !loose_eq(chosen, &found) {
                    conflict = true;
                }
                shadowed.push(index);
            }
        }
    }

    match winner {
        Some((index, value)) => Resolution {
            value: Some(value),
            origin: Some(Origin::Candidate { index }),
            shadowed,
            conflict,
        },
        None => match rule.default.as_ref().filter(|value| !is_blank(value)) {
            Some(default) => Resolution {
                value: Some(default.clone()),
                origin: Some(Origin::Default),
                shadowed,
                conflict,
            },
            None => Resolution {
                value: None,
                origin: None,
                shadowed,
                conflict,
            },
        },
    }
}

/// Reads one candidate. Missing section, missing slot, missing key and
/// blank values are all the same absence.
#[must_use]
pub fn lookup(bundle: &SubjectBundle, spec: &ExtractionSpec) -> Option<Value> {
    let record = select_record(bundle, spec)?;
    let mut segments = spec.segments();
    let mut current = record.get(segments.next()?)?.clone();
    for segment in segments {
        current = step(&current, segment)?;
    }
    if is_blank(&current) {
        None
    } else {
        Some(current)
    }
}

fn select_record<'a>(bundle: &'a SubjectBundle, spec: &ExtractionSpec) -> Option<&'a Record> {
    if !spec.section.is_list() {
        return bundle.single(spec.section);
    }

    let slots = bundle.list(spec.section)?;
    if spec.filter.is_empty() {
        return slots.get(spec.index)?.as_ref();
    }

    slots
        .iter()
        .flatten()
        .filter(|record| matches_filter(record, &spec.filter))
        .nth(spec.index)
}

fn matches_filter(record: &Record, filter: &BTreeMap<String, Value>) -> bool {
    filter.iter().all(|(column, expected)| {
        record
            .get(column)
            .is_some_and(|actual| loose_eq(actual, expected))
    })
}

fn step(current: &Value, segment: &str) -> Option<Value> {
    match current {
        Value::Object(map) => map.get(segment).cloned(),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|position| items.get(position).cloned()),
        // Text columns frequently carry serialized JSON.
        Value::String(raw) => {
            let trimmed = raw.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                let parsed: Value = serde_json::from_str(raw).ok()?;
                step(&parsed, segment)
            } else {
                None
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => None,
    }
}

#[must_use]
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        (Value::String(text), other) | (other, Value::String(text))
            if matches!(other, Value::Bool(_) | Value::Number(_)) =>
        {
            text.trim().eq_ignore_ascii_case(&other.to_string())
        }
        _ => lhs == rhs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Section, SubjectId};
    use crate::schema::FieldKind;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture record must be an object, got {other}"),
        }
    }

    fn bundle() -> SubjectBundle {
        let subject = match SubjectId::parse("inc-1") {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture subject: {err}"),
        };
        let mut bundle = SubjectBundle::new(
            subject,
            record(json!({
                "is_safe": "",
                "are_you_safe": "SENTINEL_PRIMARY",
                "legacy_safe": "SENTINEL_LEGACY",
                "details": "{\"road\": {\"surface\": \"wet\"}}",
                "missing_marker": null
            })),
        );
        bundle.witnesses = vec![
            Some(record(json!({"name": "Witness One"}))),
            None,
            Some(record(json!({"name": "Witness Three"}))),
        ];
        bundle.documents = vec![
            Some(record(json!({"document_type": "scene_photo", "url": "s3://a"}))),
            Some(record(json!({"document_type": "Driving_License", "url": "s3://b"}))),
        ];
        bundle.transcription = Some(record(json!({"safety_status": "SENTINEL_TRANSCRIPT"})));
        bundle
    }

    fn rule(candidates: Vec<ExtractionSpec>) -> MappingRule {
        MappingRule::new("field", FieldKind::Text, candidates)
    }

    #[test]
    fn first_non_absent_candidate_wins_over_later_sentinels() {
        let resolution = resolve(
            &bundle(),
            &rule(vec![
                ExtractionSpec::new(Section::Primary, "is_safe"),
                ExtractionSpec::new(Section::Primary, "are_you_safe"),
                ExtractionSpec::new(Section::Primary, "legacy_safe"),
                ExtractionSpec::new(Section::Transcription, "safety_status"),
            ]),
        );

        assert_eq!(resolution.value, Some(json!("SENTINEL_PRIMARY")));
        assert_eq!(resolution.origin, Some(Origin::Candidate { index: 1 }));
        assert_eq!(resolution.shadowed, vec![2, 3]);
        assert!(resolution.conflict);
    }

    #[test]
    fn null_empty_and_missing_are_the_same_absence() {
        let resolution = resolve(
            &bundle(),
            &rule(vec![
                ExtractionSpec::new(Section::Primary, "is_safe"),
                ExtractionSpec::new(Section::Primary, "missing_marker"),
                ExtractionSpec::new(Section::Primary, "never_collected"),
                ExtractionSpec::new(Section::Vehicle, "make"),
            ]),
        );
        assert!(resolution.is_absent());
        assert_eq!(resolution.origin, None);
    }

    #[test]
    fn default_applies_only_when_every_candidate_is_absent() {
        let with_default = rule(vec![ExtractionSpec::new(Section::Primary, "is_safe")])
            .with_default(json!("unknown"));
        let resolution = resolve(&bundle(), &with_default);
        assert_eq!(resolution.value, Some(json!("unknown")));
        assert_eq!(resolution.origin, Some(Origin::Default));

        let shadowing = rule(vec![ExtractionSpec::new(Section::Primary, "legacy_safe")])
            .with_default(json!("unknown"));
        assert_eq!(
            resolve(&bundle(), &shadowing).value,
            Some(json!("SENTINEL_LEGACY"))
        );
    }

    #[test]
    fn absent_slots_never_shift_later_records() {
        let second = lookup(&bundle(), &ExtractionSpec::at(Section::Witness, 1, "name"));
        let third = lookup(&bundle(), &ExtractionSpec::at(Section::Witness, 2, "name"));
        assert_eq!(second, None);
        assert_eq!(third, Some(json!("Witness Three")));
    }

    #[test]
    fn filters_select_records_case_insensitively() {
        let mut spec = ExtractionSpec::new(Section::Document, "url");
        spec.filter
            .insert("document_type".to_string(), json!("driving_license"));
        assert_eq!(lookup(&bundle(), &spec), Some(json!("s3://b")));

        spec.index = 1;
        assert_eq!(lookup(&bundle(), &spec), None);
    }

    #[test]
    fn dotted_paths_descend_into_serialized_json_text() {
        let spec = ExtractionSpec::new(Section::Primary, "details.road.surface");
        assert_eq!(lookup(&bundle(), &spec), Some(json!("wet")));
    }

    #[test]
    fn agreeing_candidates_are_shadowed_without_conflict() {
        let resolution = resolve(
            &bundle(),
            &rule(vec![
                ExtractionSpec::new(Section::Primary, "legacy_safe"),
                ExtractionSpec::new(Section::Primary, "legacy_safe"),
            ]),
        );
        assert_eq!(resolution.shadowed, vec![1]);
        assert!(!resolution.conflict);
    }
}
