use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    is_photo_eligible, non_blank, parse_calendar_date, DataError, LocalizedText, MemorialRecord,
    ProminenceTier, RecordIndex, Source, KNOWN_GOVERNORATES,
};

/// What to do with a record that fails load-time validation.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum LoadPolicy {
    /// Reject the whole collection on the first malformed record.
    #[default]
    Strict,
    /// Drop malformed records and list them in [`LoadReport::rejected`].
    SkipInvalid,
}

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Number(i64),
}

/// One dataset entry as it appears on disk, before validation.
#[derive(Debug, Clone, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RawRecord {
    pub id: Option<RawId>,
    pub full_name_ar: Option<String>,
    pub full_name_en: Option<String>,
    pub age: Option<u32>,
    pub hometown_ar: Option<String>,
    pub hometown_en: Option<String>,
    pub date_of_death: Option<String>,
    pub biography_ar: Option<String>,
    pub biography_en: Option<String>,
    pub photo_url: Option<String>,
    pub photo_license: Option<String>,
    pub sources: Option<Vec<Source>>,
    pub tags: Option<Vec<String>>,
    pub governorate: Option<String>,
    pub verified: Option<bool>,
    pub prominence_level: Option<i64>,
}

impl RawRecord {
    /// Validate one entry and convert it into a [`MemorialRecord`].
    ///
    /// # Errors
    /// Returns [`DataError`] when the id or every name variant is missing, when
    /// `date_of_death` is present but not a calendar date, or when
    /// `prominence_level` is outside 1..=5.
    pub fn into_record(self, position: usize) -> Result<MemorialRecord, DataError> {
        let id = match self.id {
            Some(RawId::Text(text)) => non_blank(Some(text)),
            Some(RawId::Number(number)) => Some(number.to_string()),
            None => None,
        }
        .ok_or(DataError::MissingId { position })?;

        let name = LocalizedText::new(self.full_name_ar, self.full_name_en);
        if name.is_empty() {
            return Err(DataError::MissingName { id, position });
        }

        // Only a missing, null or empty date counts as undated.
        let date_of_death = match self.date_of_death.filter(|value| !value.is_empty()) {
            Some(value) => Some(
                parse_calendar_date(&value)
                    .ok_or_else(|| DataError::MalformedDate { id: id.clone(), position, value })?,
            ),
            None => None,
        };

        let prominence_tier = match self.prominence_level {
            Some(level) => u8::try_from(level)
                .ok()
                .and_then(ProminenceTier::from_level)
                .ok_or_else(|| DataError::UnknownTier { id: id.clone(), position, level })?,
            None => ProminenceTier::Civilian,
        };

        Ok(MemorialRecord {
            id,
            name,
            hometown: LocalizedText::new(self.hometown_ar, self.hometown_en),
            biography: LocalizedText::new(self.biography_ar, self.biography_en),
            age: self.age,
            date_of_death,
            governorate: non_blank(self.governorate),
            tags: self
                .tags
                .unwrap_or_default()
                .into_iter()
                .filter(|tag| !tag.trim().is_empty())
                .collect(),
            prominence_tier,
            photo_url: non_blank(self.photo_url),
            photo_license: self.photo_license,
            sources: self.sources.unwrap_or_default(),
            verified: self.verified.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetWarning {
    DuplicateId { id: String, positions: Vec<RecordIndex> },
    PhotoWithoutLicense { id: String, position: RecordIndex },
    UnknownGovernorate { id: String, position: RecordIndex, governorate: String },
}

impl Display for DatasetWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateId { id, positions } => {
                write!(f, "id `{id}` is shared by records at positions {positions:?}")
            }
            Self::PhotoWithoutLicense { id, position } => write!(
                f,
                "record `{id}` at position {position} has a photo_url but no license; the photo will not be shown"
            ),
            Self::UnknownGovernorate { id, position, governorate } => write!(
                f,
                "record `{id}` at position {position} names unknown governorate `{governorate}`"
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct RejectedRecord {
    /// Position of the entry in the dataset file, not in the loaded collection.
    pub source_position: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LoadReport {
    pub records: Vec<MemorialRecord>,
    pub rejected: Vec<RejectedRecord>,
    pub warnings: Vec<DatasetWarning>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DatasetDocument {
    Bare(Vec<Value>),
    Wrapped { records: Vec<Value> },
}

/// Parse a JSON dataset: either an array of records or `{"records": [...]}`.
///
/// # Errors
/// Returns [`DataError::Parse`] when the document is not valid JSON of either
/// shape. Under [`LoadPolicy::Strict`] any invalid record is returned as an
/// error; under [`LoadPolicy::SkipInvalid`] it is listed in the report instead.
pub fn parse_dataset(json: &str, policy: LoadPolicy) -> Result<LoadReport, DataError> {
    let document: DatasetDocument =
        serde_json::from_str(json).map_err(|err| DataError::Parse(err.to_string()))?;
    let entries = match document {
        DatasetDocument::Bare(entries) | DatasetDocument::Wrapped { records: entries } => entries,
    };

    let raw = entries.into_iter().enumerate().map(|(position, value)| {
        serde_json::from_value::<RawRecord>(value)
            .map_err(|err| DataError::Shape { position, message: err.to_string() })
    });
    collect_records(raw, policy)
}

/// Validate already-deserialized entries.
///
/// # Errors
/// Same contract as [`parse_dataset`] for per-record failures.
pub fn load_records(raw: Vec<RawRecord>, policy: LoadPolicy) -> Result<LoadReport, DataError> {
    collect_records(raw.into_iter().map(Ok), policy)
}

fn collect_records(
    entries: impl Iterator<Item = Result<RawRecord, DataError>>,
    policy: LoadPolicy,
) -> Result<LoadReport, DataError> {
    let mut records = Vec::new();
    let mut rejected = Vec::new();

    for (position, entry) in entries.enumerate() {
        match entry.and_then(|raw| raw.into_record(position)) {
            Ok(record) => records.push(record),
            Err(err) if policy == LoadPolicy::SkipInvalid => {
                warn!(source_position = position, error = %err, "excluding malformed record");
                rejected.push(RejectedRecord { source_position: position, reason: err.to_string() });
            }
            Err(err) => return Err(err),
        }
    }

    let warnings = lint_records(&records);
    for warning in &warnings {
        warn!(%warning, "dataset lint warning");
    }
    debug!(
        loaded = records.len(),
        rejected = rejected.len(),
        warnings = warnings.len(),
        "dataset loaded"
    );

    Ok(LoadReport { records, rejected, warnings })
}

/// Content checks that never block loading.
#[must_use]
pub fn lint_records(records: &[MemorialRecord]) -> Vec<DatasetWarning> {
    let mut by_id: BTreeMap<&str, Vec<RecordIndex>> = BTreeMap::new();
    for (position, record) in records.iter().enumerate() {
        by_id.entry(record.id.as_str()).or_default().push(position);
    }

    let mut warnings = by_id
        .into_iter()
        .filter(|(_, positions)| positions.len() > 1)
        .map(|(id, positions)| DatasetWarning::DuplicateId { id: id.to_string(), positions })
        .collect::<Vec<_>>();

    for (position, record) in records.iter().enumerate() {
        if record.photo_url.is_some() && !is_photo_eligible(record) {
            warnings.push(DatasetWarning::PhotoWithoutLicense { id: record.id.clone(), position });
        }

        if let Some(governorate) = &record.governorate {
            let known =
                KNOWN_GOVERNORATES.iter().any(|known| known.eq_ignore_ascii_case(governorate));
            if !known {
                warnings.push(DatasetWarning::UnknownGovernorate {
                    id: record.id.clone(),
                    position,
                    governorate: governorate.clone(),
                });
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{query, FilterCriteria, Language};

    fn load_ok(json: &str, policy: LoadPolicy) -> LoadReport {
        match parse_dataset(json, policy) {
            Ok(report) => report,
            Err(err) => panic!("dataset should load: {err}"),
        }
    }

    fn load_err(json: &str) -> DataError {
        match parse_dataset(json, LoadPolicy::Strict) {
            Ok(report) => panic!("dataset should be rejected, loaded {} records", report.records.len()),
            Err(err) => err,
        }
    }

    const FULL_RECORD: &str = r#"[{
        "id": "shaheed_0001",
        "full_name_ar": "صالح الجعفراوي",
        "full_name_en": "Saleh Al-Jaafrawi",
        "age": 27,
        "hometown_ar": "غزة",
        "hometown_en": "Gaza",
        "date_of_death": "2025-10-12",
        "biography_ar": "صحفي",
        "biography_en": "Journalist",
        "photo_url": "https://example.org/saleh.jpg",
        "photo_license": "Unsplash License",
        "sources": [{"title": "wikipedia", "url": "https://example.org/wiki"}],
        "tags": ["civilian", "Journalist"],
        "governorate": "Gaza",
        "verified": true,
        "prominence_level": 3,
        "extra_field": "ignored"
    }]"#;

    #[test]
    fn full_record_loads_every_field() {
        let report = load_ok(FULL_RECORD, LoadPolicy::Strict);
        assert!(report.rejected.is_empty());
        assert!(report.warnings.is_empty());

        let record = &report.records[0];
        assert_eq!(record.id, "shaheed_0001");
        assert_eq!(record.name.resolve(Language::English), Some("Saleh Al-Jaafrawi"));
        assert_eq!(record.hometown.resolve(Language::Arabic), Some("غزة"));
        assert_eq!(record.age, Some(27));
        assert_eq!(record.date_of_death, parse_calendar_date("2025-10-12"));
        assert_eq!(record.prominence_tier, ProminenceTier::PublicFigure);
        assert_eq!(record.tags, vec!["civilian", "Journalist"]);
        assert_eq!(record.sources[0].title, "wikipedia");
        assert!(record.verified);
        assert!(is_photo_eligible(record));
    }

    #[test]
    fn wrapped_document_and_numeric_ids_are_accepted() {
        let report = load_ok(
            r#"{"records": [{"id": 1, "full_name_en": "A", "date_of_death": "2024-09-16T21:30:00+03:00"}]}"#,
            LoadPolicy::Strict,
        );
        assert_eq!(report.records[0].id, "1");
        assert_eq!(report.records[0].date_of_death, parse_calendar_date("2024-09-16"));
        assert_eq!(report.records[0].prominence_tier, ProminenceTier::Civilian);
    }

    #[test]
    fn blank_optional_fields_load_as_absent() {
        let report = load_ok(
            r#"[{"id": "x", "full_name_ar": "س", "full_name_en": "", "date_of_death": "",
                 "governorate": "", "tags": ["", "Doctor"], "sources": null, "age": null}]"#,
            LoadPolicy::Strict,
        );
        let record = &report.records[0];
        assert_eq!(record.name.en, None);
        assert_eq!(record.date_of_death, None);
        assert_eq!(record.governorate, None);
        assert_eq!(record.tags, vec!["Doctor"]);
        assert!(record.sources.is_empty());
        assert_eq!(record.age, None);
    }

    #[test]
    fn malformed_death_date_rejects_dataset_under_strict_policy() {
        let err = load_err(
            r#"[{"id": "ok", "full_name_en": "A"}, {"id": "bad", "full_name_en": "B", "date_of_death": "12/10/2025"}]"#,
        );
        assert_eq!(
            err,
            DataError::MalformedDate {
                id: "bad".to_string(),
                position: 1,
                value: "12/10/2025".to_string()
            }
        );
    }

    #[test]
    fn whitespace_death_date_is_malformed_not_undated() {
        let json = r#"[{"id": "x", "full_name_en": "A", "date_of_death": "   "}]"#;
        assert_eq!(
            load_err(json),
            DataError::MalformedDate { id: "x".to_string(), position: 0, value: "   ".to_string() }
        );

        let report = load_ok(json, LoadPolicy::SkipInvalid);
        assert!(report.records.is_empty());
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].source_position, 0);
        assert!(report.rejected[0].reason.contains("malformed date_of_death"));
    }

    #[test]
    fn timestamp_death_date_keeps_its_written_calendar_date() {
        let report = load_ok(
            r#"[{"id": "x", "full_name_en": "A", "date_of_death": "2024-01-01T01:00:00+03:00"}]"#,
            LoadPolicy::Strict,
        );
        assert_eq!(report.records[0].date_of_death, parse_calendar_date("2024-01-01"));
    }

    #[test]
    fn skip_invalid_policy_excludes_and_reports_malformed_records() {
        let report = load_ok(
            r#"[
                {"id": "bad-date", "full_name_en": "A", "date_of_death": "2025-13-40"},
                {"id": "ok", "full_name_en": "B", "date_of_death": "2025-01-01"},
                {"id": "bad-age", "full_name_en": "C", "age": -4},
                {"full_name_en": "no id"},
                {"id": "nameless"},
                {"id": "tier", "full_name_en": "D", "prominence_level": 9}
            ]"#,
            LoadPolicy::SkipInvalid,
        );

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].id, "ok");
        let positions =
            report.rejected.iter().map(|rejected| rejected.source_position).collect::<Vec<_>>();
        assert_eq!(positions, vec![0, 2, 3, 4, 5]);
        assert!(report.rejected[0].reason.contains("malformed date_of_death"));
        assert!(report.rejected[1].reason.contains("position 2 is malformed"));
        assert!(report.rejected[2].reason.contains("MUST have a non-empty id"));
        assert!(report.rejected[3].reason.contains("MUST have a name"));
        assert!(report.rejected[4].reason.contains("unknown prominence_level 9"));
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        assert!(matches!(load_err("{not json"), DataError::Parse(_)));
        assert!(matches!(load_err(r#"{"people": []}"#), DataError::Parse(_)));
    }

    #[test]
    fn zero_prominence_level_is_rejected() {
        assert!(matches!(
            load_err(r#"[{"id": "z", "full_name_en": "Z", "prominence_level": 0}]"#),
            DataError::UnknownTier { level: 0, .. }
        ));
    }

    #[test]
    fn duplicate_ids_are_warnings_and_records_stay_distinct() {
        let report = load_ok(
            r#"[
                {"id": "shaheed_0004", "full_name_en": "First", "governorate": "Gaza"},
                {"id": "shaheed_0005", "full_name_en": "Second", "governorate": "rafah"},
                {"id": "shaheed_0004", "full_name_en": "Third", "governorate": "Gaza"}
            ]"#,
            LoadPolicy::Strict,
        );

        assert_eq!(report.records.len(), 3);
        assert_eq!(
            report.warnings,
            vec![DatasetWarning::DuplicateId { id: "shaheed_0004".to_string(), positions: vec![0, 2] }]
        );

        let result = query(&report.records, &FilterCriteria::default());
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn unlicensed_photos_and_unknown_governorates_are_flagged() {
        let report = load_ok(
            r#"[
                {"id": "a", "full_name_en": "A", "photo_url": "https://example.org/a.jpg", "photo_license": "  "},
                {"id": "b", "full_name_en": "B", "governorate": "Atlantis"},
                {"id": "c", "full_name_en": "C", "photo_license": "CC"}
            ]"#,
            LoadPolicy::Strict,
        );

        assert_eq!(
            report.warnings,
            vec![
                DatasetWarning::PhotoWithoutLicense { id: "a".to_string(), position: 0 },
                DatasetWarning::UnknownGovernorate {
                    id: "b".to_string(),
                    position: 1,
                    governorate: "Atlantis".to_string()
                },
            ]
        );
        assert!(report.warnings[0].to_string().contains("will not be shown"));
    }

    #[test]
    fn load_records_validates_in_memory_entries() {
        let raw = vec![
            RawRecord {
                id: Some(RawId::Text("m".to_string())),
                full_name_en: Some("M".to_string()),
                prominence_level: Some(2),
                ..RawRecord::default()
            },
            RawRecord { id: Some(RawId::Text("  ".to_string())), ..RawRecord::default() },
        ];

        assert_eq!(load_records(raw.clone(), LoadPolicy::Strict), Err(DataError::MissingId { position: 1 }));

        let report = match load_records(raw, LoadPolicy::SkipInvalid) {
            Ok(report) => report,
            Err(err) => panic!("skip-invalid load should succeed: {err}"),
        };
        assert_eq!(report.records[0].prominence_tier, ProminenceTier::TopCommander);
        assert_eq!(report.rejected.len(), 1);
    }
}
