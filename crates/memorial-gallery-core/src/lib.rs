use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

mod dataset;

pub use dataset::{
    lint_records, load_records, parse_dataset, DatasetWarning, LoadPolicy, LoadReport, RawId,
    RawRecord, RejectedRecord,
};

/// Position of a record inside the loaded collection.
///
/// Record ids are not unique, so every result refers to records by position.
pub type RecordIndex = usize;

pub const DEFAULT_QUERY_CACHE_CAPACITY: usize = 32;

/// Governorates offered by the gallery's governorate selector.
pub const KNOWN_GOVERNORATES: [&str; 15] = [
    "Gaza",
    "North Gaza",
    "Deir al-Balah",
    "Khan Younis",
    "Rafah",
    "Jerusalem",
    "Hebron",
    "Nablus",
    "Jenin",
    "Tulkarm",
    "Qalqilya",
    "Salfit",
    "Tubas",
    "Bethlehem",
    "West Bank",
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DataError {
    #[error("dataset parse error: {0}")]
    Parse(String),
    #[error("record at position {position} is malformed: {message}")]
    Shape { position: usize, message: String },
    #[error("record at position {position} MUST have a non-empty id")]
    MissingId { position: usize },
    #[error("record `{id}` at position {position} MUST have a name in at least one language")]
    MissingName { id: String, position: usize },
    #[error("record `{id}` at position {position} has malformed date_of_death `{value}`")]
    MalformedDate { id: String, position: usize, value: String },
    #[error("record `{id}` at position {position} has unknown prominence_level {level}")]
    UnknownTier { id: String, position: usize, level: i64 },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum Language {
    #[default]
    #[serde(rename = "ar")]
    Arabic,
    #[serde(rename = "en")]
    English,
}

impl Language {
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Arabic => Self::English,
            Self::English => Self::Arabic,
        }
    }
}

/// A display field with an Arabic and an English variant, either of which may be missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct LocalizedText {
    pub ar: Option<String>,
    pub en: Option<String>,
}

impl LocalizedText {
    /// Build a localized value, dropping blank variants.
    #[must_use]
    pub fn new(ar: Option<String>, en: Option<String>) -> Self {
        Self { ar: non_blank(ar), en: non_blank(en) }
    }

    #[must_use]
    pub fn get(&self, language: Language) -> Option<&str> {
        let value = match language {
            Language::Arabic => self.ar.as_deref(),
            Language::English => self.en.as_deref(),
        };
        value.filter(|value| !value.trim().is_empty())
    }

    /// Prefer the requested language, fall back to the other one, and yield
    /// nothing when both are missing.
    #[must_use]
    pub fn resolve(&self, language: Language) -> Option<&str> {
        self.get(language).or_else(|| self.get(language.other()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.get(Language::Arabic).is_none() && self.get(Language::English).is_none()
    }

    fn variants(&self) -> impl Iterator<Item = &str> {
        self.ar.as_deref().into_iter().chain(self.en.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProminenceTier {
    InternationalLeader,
    TopCommander,
    PublicFigure,
    LocalFigure,
    #[default]
    Civilian,
}

impl ProminenceTier {
    pub const ALL: [Self; 5] = [
        Self::InternationalLeader,
        Self::TopCommander,
        Self::PublicFigure,
        Self::LocalFigure,
        Self::Civilian,
    ];

    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Self::InternationalLeader => 1,
            Self::TopCommander => 2,
            Self::PublicFigure => 3,
            Self::LocalFigure => 4,
            Self::Civilian => 5,
        }
    }

    #[must_use]
    pub fn from_level(level: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|tier| tier.level() == level)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InternationalLeader => "international_leader",
            Self::TopCommander => "top_commander",
            Self::PublicFigure => "public_figure",
            Self::LocalFigure => "local_figure",
            Self::Civilian => "civilian",
        }
    }

    #[must_use]
    pub fn name(self, language: Language) -> &'static str {
        match (self, language) {
            (Self::InternationalLeader, Language::English) => "International Leader",
            (Self::InternationalLeader, Language::Arabic) => "قائد دولي",
            (Self::TopCommander, Language::English) => "Top Commander",
            (Self::TopCommander, Language::Arabic) => "قائد ميداني بارز",
            (Self::PublicFigure, Language::English) => "Public Figure",
            (Self::PublicFigure, Language::Arabic) => "شخصية عامة",
            (Self::LocalFigure, Language::English) => "Local Figure",
            (Self::LocalFigure, Language::Arabic) => "شخصية محلية",
            (Self::Civilian, Language::English) => "Civilian",
            (Self::Civilian, Language::Arabic) => "مدني",
        }
    }
}

impl TryFrom<u8> for ProminenceTier {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::from_level(level).ok_or_else(|| format!("prominence level MUST be in 1..=5, got {level}"))
    }
}

impl From<ProminenceTier> for u8 {
    fn from(tier: ProminenceTier) -> Self {
        tier.level()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Source {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorialRecord {
    pub id: String,
    pub name: LocalizedText,
    pub hometown: LocalizedText,
    pub biography: LocalizedText,
    pub age: Option<u32>,
    pub date_of_death: Option<Date>,
    pub governorate: Option<String>,
    pub tags: Vec<String>,
    pub prominence_tier: ProminenceTier,
    pub photo_url: Option<String>,
    pub photo_license: Option<String>,
    pub sources: Vec<Source>,
    pub verified: bool,
}

/// Parse a calendar date given as `YYYY-MM-DD` or as an RFC 3339 timestamp.
///
/// Timestamps keep the calendar date written in them, whatever their offset.
#[must_use]
pub fn parse_calendar_date(value: &str) -> Option<Date> {
    let value = value.trim();
    if let Ok(date) = Date::parse(value, format_description!("[year]-[month]-[day]")) {
        return Some(date);
    }
    OffsetDateTime::parse(value, &Rfc3339).ok().map(OffsetDateTime::date)
}

#[must_use]
pub fn format_calendar_date(date: Date) -> String {
    date.format(format_description!("[year]-[month]-[day]")).unwrap_or_else(|_| date.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Active search and filter constraints. Every field left empty imposes no constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(default)]
pub struct FilterCriteria {
    pub text: String,
    pub governorate: String,
    pub age_min: Option<u32>,
    pub age_max: Option<u32>,
    pub date_start: Option<String>,
    pub date_end: Option<String>,
    pub tag: String,
}

/// Criteria normalized once per query so the per-record predicate stays cheap.
#[derive(Debug)]
struct CompiledCriteria<'c> {
    text: Option<String>,
    governorate: Option<String>,
    age_min: Option<u32>,
    age_max: Option<u32>,
    date_start: Option<Date>,
    date_end: Option<Date>,
    tag: Option<&'c str>,
}

impl<'c> CompiledCriteria<'c> {
    fn compile(criteria: &'c FilterCriteria) -> Self {
        let text = criteria.text.trim();
        // Malformed bounds degrade to "no bound" instead of failing a live filter.
        let bound = |value: &Option<String>| value.as_deref().and_then(parse_calendar_date);
        Self {
            text: (!text.is_empty()).then(|| text.to_lowercase()),
            governorate: (!criteria.governorate.is_empty())
                .then(|| criteria.governorate.to_lowercase()),
            age_min: criteria.age_min,
            age_max: criteria.age_max,
            date_start: bound(&criteria.date_start),
            date_end: bound(&criteria.date_end),
            tag: (!criteria.tag.is_empty()).then_some(criteria.tag.as_str()),
        }
    }

    fn matches(&self, record: &MemorialRecord) -> bool {
        self.matches_text(record)
            && self.matches_governorate(record)
            && self.matches_age(record)
            && self.matches_date(record)
            && self.matches_tag(record)
    }

    fn matches_text(&self, record: &MemorialRecord) -> bool {
        let Some(needle) = self.text.as_deref() else {
            return true;
        };
        record
            .name
            .variants()
            .chain(record.hometown.variants())
            .any(|field| field.to_lowercase().contains(needle))
    }

    fn matches_governorate(&self, record: &MemorialRecord) -> bool {
        let Some(wanted) = self.governorate.as_deref() else {
            return true;
        };
        record.governorate.as_deref().is_some_and(|value| value.to_lowercase() == wanted)
    }

    fn matches_age(&self, record: &MemorialRecord) -> bool {
        let Some(age) = record.age else {
            return true;
        };
        self.age_min.map_or(true, |min| min <= age) && self.age_max.map_or(true, |max| age <= max)
    }

    fn matches_date(&self, record: &MemorialRecord) -> bool {
        let Some(date) = record.date_of_death else {
            return true;
        };
        self.date_start.map_or(true, |start| start <= date)
            && self.date_end.map_or(true, |end| date <= end)
    }

    fn matches_tag(&self, record: &MemorialRecord) -> bool {
        let Some(tag) = self.tag else {
            return true;
        };
        record.tags.iter().any(|candidate| candidate == tag)
    }
}

/// Matching record positions grouped by prominence tier.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct QueryResult {
    pub groups: BTreeMap<ProminenceTier, Vec<RecordIndex>>,
    pub sorted_tiers: Vec<ProminenceTier>,
}

impl QueryResult {
    #[must_use]
    pub fn members(&self, tier: ProminenceTier) -> &[RecordIndex] {
        self.groups.get(&tier).map(Vec::as_slice).unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sorted_tiers.is_empty()
    }

    /// Every matching position in display order: tiers ascending, newest death first.
    pub fn positions(&self) -> impl Iterator<Item = RecordIndex> + '_ {
        self.sorted_tiers.iter().flat_map(|tier| self.members(*tier).iter().copied())
    }
}

/// Filter, group and sort `records` for display.
///
/// Records pass when the text, governorate, age, date and tag predicates all
/// hold. Passing records are grouped by prominence tier; each group is ordered
/// by death date descending with undated records last and ties kept in
/// collection order. Tiers without matches are omitted.
#[must_use]
pub fn query(records: &[MemorialRecord], criteria: &FilterCriteria) -> QueryResult {
    let compiled = CompiledCriteria::compile(criteria);

    let mut groups: BTreeMap<ProminenceTier, Vec<RecordIndex>> = BTreeMap::new();
    for (index, record) in records.iter().enumerate() {
        if compiled.matches(record) {
            groups.entry(record.prominence_tier).or_default().push(index);
        }
    }

    for members in groups.values_mut() {
        // Stable sort; `None < Some(_)` puts undated records last when reversed.
        members.sort_by(|lhs, rhs| records[*rhs].date_of_death.cmp(&records[*lhs].date_of_death));
    }

    let sorted_tiers = groups.keys().copied().collect();
    QueryResult { groups, sorted_tiers }
}

/// Distinct tags across the collection in order of first occurrence.
#[must_use]
pub fn distinct_tags(records: &[MemorialRecord]) -> Vec<String> {
    first_occurrences(records.iter().flat_map(|record| record.tags.iter().map(String::as_str)))
}

#[must_use]
pub fn distinct_governorates(records: &[MemorialRecord]) -> Vec<String> {
    first_occurrences(records.iter().filter_map(|record| record.governorate.as_deref()))
}

fn first_occurrences<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();
    for value in values {
        if seen.insert(value) {
            ordered.push(value.to_string());
        }
    }
    ordered
}

/// A photo is shown only with a URL and an affirmative, non-blank license.
#[must_use]
pub fn is_photo_eligible(record: &MemorialRecord) -> bool {
    let has_url = record.photo_url.as_deref().is_some_and(|url| !url.is_empty());
    let has_license = record.photo_license.as_deref().is_some_and(|license| !license.trim().is_empty());
    has_url && has_license
}

/// Initials of the first two words of `name`, or an em dash when there are none.
#[must_use]
pub fn placeholder_initials(name: &str) -> String {
    let initials =
        name.split_whitespace().take(2).filter_map(|word| word.chars().next()).collect::<String>();
    if initials.is_empty() {
        "—".to_string()
    } else {
        initials
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhotoView {
    Licensed { url: String, license: String },
    Placeholder { initials: String },
}

impl PhotoView {
    #[must_use]
    pub fn for_record(record: &MemorialRecord) -> Self {
        match (&record.photo_url, &record.photo_license) {
            (Some(url), Some(license)) if is_photo_eligible(record) => {
                Self::Licensed { url: url.clone(), license: license.trim().to_string() }
            }
            // Placeholder glyphs come from the Arabic name when there is one.
            _ => Self::Placeholder {
                initials: placeholder_initials(
                    record.name.resolve(Language::Arabic).unwrap_or_default(),
                ),
            },
        }
    }
}

/// Display projection of one record in a single language.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct RecordCard {
    pub position: RecordIndex,
    pub id: String,
    pub name: Option<String>,
    pub hometown: Option<String>,
    pub biography: Option<String>,
    pub age: Option<u32>,
    pub date_of_death: Option<String>,
    pub governorate: Option<String>,
    pub tags: Vec<String>,
    pub tier: ProminenceTier,
    pub tier_name: &'static str,
    pub photo: PhotoView,
    pub sources: Vec<Source>,
    pub verified: bool,
}

impl RecordCard {
    #[must_use]
    pub fn localize(position: RecordIndex, record: &MemorialRecord, language: Language) -> Self {
        Self {
            position,
            id: record.id.clone(),
            name: record.name.resolve(language).map(str::to_string),
            hometown: record.hometown.resolve(language).map(str::to_string),
            biography: record.biography.resolve(language).map(str::to_string),
            age: record.age,
            date_of_death: record.date_of_death.map(format_calendar_date),
            governorate: record.governorate.clone(),
            tags: record.tags.clone(),
            tier: record.prominence_tier,
            tier_name: record.prominence_tier.name(language),
            photo: PhotoView::for_record(record),
            sources: record.sources.clone(),
            verified: record.verified,
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct TierGroupView {
    pub tier: ProminenceTier,
    pub tier_name: &'static str,
    pub records: Vec<RecordCard>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct GroupedView {
    pub language: Language,
    pub sorted_tiers: Vec<ProminenceTier>,
    pub groups: Vec<TierGroupView>,
    pub total: usize,
}

impl GroupedView {
    /// Localize a query result against the collection it was computed from.
    #[must_use]
    pub fn localize(records: &[MemorialRecord], result: &QueryResult, language: Language) -> Self {
        let groups = result
            .sorted_tiers
            .iter()
            .map(|tier| TierGroupView {
                tier: *tier,
                tier_name: tier.name(language),
                records: result
                    .members(*tier)
                    .iter()
                    .filter_map(|index| {
                        records.get(*index).map(|record| RecordCard::localize(*index, record, language))
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();
        let total = groups.iter().map(|group| group.records.len()).sum();

        Self { language, sorted_tiers: result.sorted_tiers.clone(), groups, total }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Memoizes [`query`] results for a fixed collection, keyed on the criteria value.
///
/// Holds at most `capacity` results and evicts the oldest insertion first.
#[derive(Debug)]
pub struct QueryCache<'a> {
    records: &'a [MemorialRecord],
    capacity: usize,
    entries: HashMap<FilterCriteria, QueryResult>,
    insertion_order: VecDeque<FilterCriteria>,
    hits: u64,
    misses: u64,
}

impl<'a> QueryCache<'a> {
    #[must_use]
    pub fn new(records: &'a [MemorialRecord]) -> Self {
        Self::with_capacity(records, DEFAULT_QUERY_CACHE_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(records: &'a [MemorialRecord], capacity: usize) -> Self {
        Self {
            records,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    #[must_use]
    pub fn records(&self) -> &'a [MemorialRecord] {
        self.records
    }

    pub fn query(&mut self, criteria: &FilterCriteria) -> &QueryResult {
        if self.entries.contains_key(criteria) {
            self.hits += 1;
        } else {
            self.misses += 1;
            while self.entries.len() >= self.capacity {
                let Some(oldest) = self.insertion_order.pop_front() else {
                    break;
                };
                self.entries.remove(&oldest);
            }
            self.insertion_order.push_back(criteria.clone());
        }

        let records = self.records;
        self.entries.entry(criteria.clone()).or_insert_with(|| query(records, criteria))
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats { hits: self.hits, misses: self.misses, entries: self.entries.len() }
    }
}
