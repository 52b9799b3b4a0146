//! Core domain model for the MTBO event archive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mtbo-core";

/// Version tag written into the index and every year partition.
pub const SCHEMA_VERSION: &str = "2.0";

/// Url type attached to a race when a start list was written locally.
pub const LOCAL_STARTLIST_URL_TYPE: &str = "LocalStartList";

/// Ordered class name -> participant count map.
pub type ClassCounts = BTreeMap<String, u32>;

/// A link observed on an event or race page.
///
/// The merge key is the `(type, url, title)` triple; `last_updated_at` records
/// when that exact triple was first observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Url {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub last_updated_at: Option<String>,
}

impl Url {
    pub fn new(kind: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            url: url.into(),
            title: None,
            last_updated_at: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_last_updated_at(mut self, ts: impl Into<String>) -> Self {
        self.last_updated_at = Some(ts.into());
        self
    }

    pub fn same_sighting(&self, other: &Url) -> bool {
        self.kind == other.kind && self.url == other.url && self.title == other.title
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organiser {
    pub name: String,
    #[serde(default)]
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Official {
    pub role: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDeadline {
    #[serde(rename = "type")]
    pub kind: String,
    pub datetimez: Option<String>,
}

/// One race (stage) of an event. `race_number` is 1-based and unique within the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Race {
    pub race_number: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub datetimez: Option<String>,
    #[serde(default)]
    pub discipline: Option<String>,
    #[serde(default)]
    pub night_or_day: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub urls: Vec<Url>,
    #[serde(default)]
    pub entry_counts: Option<ClassCounts>,
    #[serde(default)]
    pub start_counts: Option<ClassCounts>,
    #[serde(default)]
    pub result_counts: Option<ClassCounts>,
    #[serde(default)]
    pub fingerprints: Vec<String>,
}

impl Race {
    pub fn new(race_number: u32) -> Self {
        Self {
            race_number,
            name: None,
            datetimez: None,
            discipline: None,
            night_or_day: None,
            position: None,
            urls: Vec::new(),
            entry_counts: None,
            start_counts: None,
            result_counts: None,
            fingerprints: Vec::new(),
        }
    }
}

/// Canonical persisted event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    /// Primary start date (`YYYY-MM-DD`); drives year partitioning.
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub original_status: String,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub organisers: Vec<Organiser>,
    #[serde(default)]
    pub officials: Vec<Official>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub urls: Vec<Url>,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub information: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub punching_system: Option<String>,
    #[serde(default)]
    pub entry_deadlines: Vec<EntryDeadline>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub races: Vec<Race>,
}

impl Event {
    pub fn new(id: impl Into<String>, name: impl Into<String>, start_time: impl Into<String>) -> Self {
        let start_time = start_time.into();
        Self {
            id: id.into(),
            name: name.into(),
            end_time: start_time.clone(),
            start_time,
            status: String::new(),
            original_status: String::new(),
            types: Vec::new(),
            tags: Vec::new(),
            organisers: Vec::new(),
            officials: Vec::new(),
            classes: Vec::new(),
            url: None,
            urls: Vec::new(),
            documents: Vec::new(),
            information: None,
            region: None,
            punching_system: None,
            entry_deadlines: Vec::new(),
            position: None,
            races: Vec::new(),
        }
    }

    /// Calendar year taken from the event's own start date, never from a race.
    pub fn year(&self) -> Option<&str> {
        year_of(&self.start_time)
    }

    /// Id prefix before the first `_` (`SWE_1234` -> `SWE`).
    pub fn source_prefix(&self) -> &str {
        source_prefix(&self.id)
    }

    pub fn race(&self, race_number: u32) -> Option<&Race> {
        self.races.iter().find(|r| r.race_number == race_number)
    }

    /// Sort and de-duplicate race fingerprints so they persist deterministically.
    pub fn canonicalize(&mut self) {
        for race in &mut self.races {
            race.fingerprints.sort();
            race.fingerprints.dedup();
        }
    }
}

/// 4-character year prefix of an ISO date, if present.
pub fn year_of(start_time: &str) -> Option<&str> {
    let trimmed = start_time.trim();
    match trimmed.get(..4) {
        Some(year) if year.chars().all(|c| c.is_ascii_digit()) => Some(year),
        _ => None,
    }
}

pub fn source_prefix(event_id: &str) -> &str {
    event_id.split_once('_').map(|(prefix, _)| prefix).unwrap_or(event_id)
}

/// Source description written into each partition's `meta.sources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMeta {
    pub country_code: String,
    pub name: String,
    pub url: String,
}

impl SourceMeta {
    pub fn new(country_code: &str, name: &str, url: &str) -> Self {
        Self {
            country_code: country_code.to_string(),
            name: name.to_string(),
            url: url.to_string(),
        }
    }

    pub fn eventor_defaults() -> Vec<Self> {
        vec![
            Self::new("SWE", "Swedish Eventor", "https://eventor.orientering.se"),
            Self::new("IOF", "IOF Eventor", "https://eventor.orienteering.org"),
            Self::new("NOR", "Norwegian Eventor", "https://eventor.orientering.no"),
        ]
    }
}

/// Raw participant row handed over by a list parser. Transient, never persisted in partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub club: String,
    pub class_name: String,
    #[serde(default)]
    pub start_number: Option<u32>,
}

impl Participant {
    pub fn new(name: &str, club: &str, class_name: &str) -> Self {
        Self {
            name: name.to_string(),
            club: club.to_string(),
            class_name: class_name.to_string(),
            start_number: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_comes_from_event_start_not_races() {
        let mut event = Event::new("SWE_1", "New Year Sprint", "2023-12-31");
        let mut race = Race::new(1);
        race.datetimez = Some("2024-01-01T10:00:00+01:00".into());
        event.races.push(race);
        assert_eq!(event.year(), Some("2023"));
    }

    #[test]
    fn missing_or_short_start_has_no_year() {
        assert_eq!(year_of(""), None);
        assert_eq!(year_of("202"), None);
        assert_eq!(year_of("abcd-01-01"), None);
        assert_eq!(year_of(" 2025-05-01"), Some("2025"));
    }

    #[test]
    fn source_prefix_splits_on_first_underscore() {
        assert_eq!(source_prefix("SWE_1234"), "SWE");
        assert_eq!(source_prefix("MAN_a_b"), "MAN");
        assert_eq!(source_prefix("plain"), "plain");
    }

    #[test]
    fn canonicalize_sorts_and_dedups_fingerprints() {
        let mut event = Event::new("IOF_7", "World Cup", "2025-06-01");
        let mut race = Race::new(1);
        race.fingerprints = vec!["bb".into(), "aa".into(), "bb".into()];
        event.races.push(race);
        event.canonicalize();
        assert_eq!(event.races[0].fingerprints, vec!["aa", "bb"]);
    }

    #[test]
    fn url_sighting_key_includes_title() {
        let a = Url::new("Website", "http://example.com").with_title("Old");
        let b = Url::new("Website", "http://example.com").with_title("New");
        let c = Url::new("Website", "http://example.com")
            .with_title("Old")
            .with_last_updated_at("2024-01-01T12:00:00+00:00");
        assert!(!a.same_sighting(&b));
        assert!(a.same_sighting(&c));
    }

    #[test]
    fn url_serializes_kind_as_type() {
        let json = serde_json::to_value(Url::new("StartList", "/x")).expect("serialize");
        assert_eq!(json["type"], "StartList");
        assert!(json.get("kind").is_none());
    }

    #[test]
    fn sparse_event_record_deserializes_with_defaults() {
        let event: Event =
            serde_json::from_str(r#"{"id":"NOR_5","name":"Sparse"}"#).expect("parse");
        assert_eq!(event.start_time, "");
        assert!(event.races.is_empty());
        assert_eq!(event.year(), None);
    }
}
