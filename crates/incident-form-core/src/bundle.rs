use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::MappingError;

/// One source row: column name to raw value, in column order.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    /// Builds a subject identifier from user or caller input.
    ///
    /// # Errors
    /// Returns [`MappingError::Configuration`] when the identifier is blank.
    pub fn parse(raw: &str) -> Result<Self, MappingError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MappingError::Configuration(
                "subject id MUST be non-empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SubjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Primary,
    Vehicle,
    Witness,
    Document,
    Transcription,
}

impl Section {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Vehicle => "vehicle",
            Self::Witness => "witness",
            Self::Document => "document",
            Self::Transcription => "transcription",
        }
    }

    #[must_use]
    pub fn is_list(self) -> bool {
        matches!(self, Self::Vehicle | Self::Witness | Self::Document)
    }
}

/// Everything known about one subject, fetched once and never mutated.
///
/// List sections are slot-addressed: a `None` entry is a record that is
/// known to be missing (deleted, or a gap in explicit slot numbering) and
/// keeps its index so later records never shift into its place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectBundle {
    pub subject_id: SubjectId,
    pub primary: Record,
    #[serde(default)]
    pub vehicles: Vec<Option<Record>>,
    #[serde(default)]
    pub witnesses: Vec<Option<Record>>,
    #[serde(default)]
    pub documents: Vec<Option<Record>>,
    #[serde(default)]
    pub transcription: Option<Record>,
}

impl SubjectBundle {
    #[must_use]
    pub fn new(subject_id: SubjectId, primary: Record) -> Self {
        Self {
            subject_id,
            primary,
            vehicles: Vec::new(),
            witnesses: Vec::new(),
            documents: Vec::new(),
            transcription: None,
        }
    }

    /// Returns the slot list for list-shaped sections, `None` otherwise.
    #[must_use]
    pub fn list(&self, section: Section) -> Option<&[Option<Record>]> {
        match section {
            Section::Vehicle => Some(&self.vehicles),
            Section::Witness => Some(&self.witnesses),
            Section::Document => Some(&self.documents),
            Section::Primary | Section::Transcription => None,
        }
    }

    /// Returns the single record of a non-list section.
    #[must_use]
    pub fn single(&self, section: Section) -> Option<&Record> {
        match section {
            Section::Primary => Some(&self.primary),
            Section::Transcription => self.transcription.as_ref(),
            Section::Vehicle | Section::Witness | Section::Document => None,
        }
    }

    /// Decodes a bundle from JSON, as used by fixtures and offline renders.
    ///
    /// # Errors
    /// Returns [`MappingError::Configuration`] when the JSON does not decode.
    pub fn from_json(input: &str) -> Result<Self, MappingError> {
        serde_json::from_str(input)
            .map_err(|err| MappingError::Configuration(format!("invalid bundle json: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subject_id_rejects_blank_input() {
        assert!(SubjectId::parse("   ").is_err());
        match SubjectId::parse(" inc-42 ") {
            Ok(id) => assert_eq!(id.as_str(), "inc-42"),
            Err(err) => panic!("expected valid subject id: {err}"),
        }
    }

    #[test]
    fn bundle_json_keeps_absent_slots_in_place() {
        let input = json!({
            "subject_id": "inc-1",
            "primary": {"is_safe": "yes"},
            "witnesses": [{"name": "A"}, null, {"name": "C"}]
        })
        .to_string();

        let bundle = match SubjectBundle::from_json(&input) {
            Ok(value) => value,
            Err(err) => panic!("bundle should decode: {err}"),
        };

        assert_eq!(bundle.witnesses.len(), 3);
        assert!(bundle.witnesses[1].is_none());
        assert!(bundle.vehicles.is_empty());
        assert!(bundle.transcription.is_none());
        assert!(bundle.single(Section::Transcription).is_none());
        assert_eq!(bundle.list(Section::Witness).map(<[_]>::len), Some(3));
    }
}
