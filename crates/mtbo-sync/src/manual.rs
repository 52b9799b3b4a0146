//! Hand-maintained events read from `event.yaml` files under a directory tree.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mtbo_core::{Document, EntryDeadline, Event, Official, Organiser, Position, Race, Url};
use serde::Deserialize;
use tokio::fs;
use tracing::{error, info, warn};

use crate::{EventSource, ScrapedEvent, SourceError, SyncWindow};

pub const MANUAL_EVENT_FILE_NAME: &str = "event.yaml";

/// Scalar ids may be written as numbers or strings in YAML.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManualId {
    Text(String),
    Number(i64),
}

impl ManualId {
    fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManualOrganiser {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        country_code: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ManualDocument {
    #[serde(rename = "type", default = "default_document_type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
}

fn default_document_type() -> String {
    "Other".to_string()
}

#[derive(Debug, Deserialize)]
struct ManualRace {
    #[serde(default = "default_race_number")]
    race_number: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    time: Option<String>,
    #[serde(default = "default_discipline")]
    discipline: String,
    #[serde(default = "default_night_or_day")]
    night_or_day: String,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
}

fn default_race_number() -> u32 {
    1
}

fn default_discipline() -> String {
    "Middle".to_string()
}

fn default_night_or_day() -> String {
    "day".to_string()
}

#[derive(Debug, Deserialize)]
struct ManualOfficial {
    role: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ManualDeadline {
    #[serde(rename = "type", default = "default_deadline_type")]
    kind: String,
    #[serde(default)]
    date: Option<String>,
}

fn default_deadline_type() -> String {
    "normal".to_string()
}

#[derive(Debug, Deserialize)]
struct ManualEventFile {
    id: ManualId,
    name: String,
    start_date: String,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    classes: Vec<String>,
    #[serde(default)]
    information: Option<String>,
    #[serde(default)]
    info_text: Option<String>,
    #[serde(default)]
    documents: Vec<ManualDocument>,
    #[serde(default)]
    races: Vec<ManualRace>,
    #[serde(default)]
    organizers: Vec<ManualOrganiser>,
    #[serde(default)]
    officials: Vec<ManualOfficial>,
    #[serde(default)]
    entry_deadlines: Vec<ManualDeadline>,
}

impl ManualEventFile {
    fn into_event(self, event_dir: &Path) -> Event {
        let mut event = Event::new(self.id.render(), self.name, self.start_date.clone());
        event.end_time = self.end_date.unwrap_or(self.start_date);
        event.status = self.status.unwrap_or_else(|| "Sanctioned".to_string());
        event.original_status = "Planned".to_string();
        event.classes = self.classes;
        event.information = self.information.or(self.info_text);

        if let Some(url) = self.url.filter(|u| !u.is_empty()) {
            event.urls.push(Url::new("Website", url));
        }

        event.documents = self
            .documents
            .into_iter()
            .map(|doc| Document {
                kind: doc.kind,
                title: doc.name,
                url: resolve_document_url(&doc.url, event_dir),
                published_at: None,
            })
            .collect();

        let event_position = match (self.lat, self.lon) {
            (Some(lat), Some(lng)) => Some(Position { lat, lng }),
            _ => None,
        };
        event.races = self
            .races
            .into_iter()
            .map(|r| {
                let mut race = Race::new(r.race_number);
                race.name = r.name;
                race.datetimez = match (r.date, r.time) {
                    (Some(date), Some(time)) => Some(format!("{date}T{time}")),
                    (Some(date), None) => Some(date),
                    (None, _) => None,
                };
                race.discipline = Some(r.discipline);
                race.night_or_day = Some(r.night_or_day);
                race.position = match (r.lat, r.lon) {
                    (Some(lat), Some(lng)) => Some(Position { lat, lng }),
                    _ => event_position.clone(),
                };
                race
            })
            .collect();

        let country = self.country;
        event.organisers = self
            .organizers
            .into_iter()
            .map(|org| match org {
                ManualOrganiser::Name(name) => Organiser {
                    name,
                    country_code: country.clone(),
                },
                ManualOrganiser::Detailed { name, country_code } => Organiser {
                    name,
                    country_code: country_code.or_else(|| country.clone()),
                },
            })
            .collect();
        event.officials = self
            .officials
            .into_iter()
            .map(|o| Official {
                role: o.role,
                name: o.name,
            })
            .collect();
        event.entry_deadlines = self
            .entry_deadlines
            .into_iter()
            .map(|d| EntryDeadline {
                kind: d.kind,
                datetimez: d.date,
            })
            .collect();
        event.position = event_position;
        event
    }
}

/// `file://name.pdf` resolves against the directory holding the `event.yaml`.
fn resolve_document_url(url: &str, event_dir: &Path) -> String {
    let Some(file_name) = url.strip_prefix("file://") else {
        return url.to_string();
    };
    let path = event_dir.join(file_name);
    if !path.exists() {
        warn!(path = %path.display(), "manual_document_missing");
    }
    format!("file://{}", path.display())
}

/// Event source over a directory of hand-written `event.yaml` files.
///
/// Files that fail to parse are logged and skipped. The sync window is not
/// applied; manual events are always handed over.
#[derive(Debug, Clone)]
pub struct ManualYamlSource {
    source_id: String,
    base_dir: PathBuf,
}

impl ManualYamlSource {
    pub fn new(source_id: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            base_dir: base_dir.into(),
        }
    }

    async fn event_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let mut found = Vec::new();
        let mut pending = vec![self.base_dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(anyhow::Error::new(err).context(format!("listing {}", dir.display())).into()),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| anyhow::Error::new(err).context(format!("listing {}", dir.display())))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| anyhow::Error::new(err).context(format!("inspecting {}", path.display())))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if entry.file_name() == MANUAL_EVENT_FILE_NAME {
                    found.push(path);
                }
            }
        }
        found.sort();
        Ok(found)
    }

    async fn parse_file(&self, path: &Path) -> anyhow::Result<Option<Event>> {
        let text = fs::read_to_string(path).await?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let file: ManualEventFile = serde_yaml::from_str(&text)?;
        let event_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Some(file.into_event(event_dir)))
    }
}

#[async_trait]
impl EventSource for ManualYamlSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_events(&self, _window: &SyncWindow) -> Result<Vec<ScrapedEvent>, SourceError> {
        if fs::metadata(&self.base_dir).await.is_err() {
            warn!(path = %self.base_dir.display(), "manual_dir_missing");
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        for path in self.event_files().await? {
            match self.parse_file(&path).await {
                Ok(Some(event)) => events.push(ScrapedEvent::from(event)),
                Ok(None) => {}
                Err(err) => error!(path = %path.display(), error = %err, "manual_event_invalid"),
            }
        }
        info!(count = events.len(), path = %self.base_dir.display(), "manual_events_loaded");
        Ok(events)
    }
}
