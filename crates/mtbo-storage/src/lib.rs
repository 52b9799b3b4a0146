//! Year-partitioned event archive behind an umbrella index.
//!
//! The index file holds no events, only pointers to `{data_root}/{year}/events.json`
//! partitions plus per-source counters. Saves merge new observations into the
//! loaded archive and rewrite a partition only when its serialized bytes change,
//! so version-controlled history stays confined to years that actually moved.
//!
//! Single writer only: there is no locking and concurrent runs against the same
//! archive can lose updates.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use mtbo_core::{source_prefix, Event, Race, SourceMeta, Url, SCHEMA_VERSION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, info_span, warn, Dispatch, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mtbo-storage";

pub const PARTITION_FILE_NAME: &str = "events.json";

/// Infix of derived per-race start list files: `{event_id}_startlist_{race_number}.yaml`.
pub const STARTLIST_INFIX: &str = "_startlist_";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event {event_id} has no start_time; cannot assign a year partition")]
    MissingStartTime { event_id: String },
    #[error("unsupported schema version {found:?} in {}", path.display())]
    UnsupportedSchema { path: PathBuf, found: Option<String> },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to; used for reproducible runs.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// RFC 3339 with microseconds and an explicit `+00:00` offset.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub path: String,
    pub count: usize,
    pub last_updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub count: usize,
    pub last_updated_at: String,
}

/// Umbrella index: pointers, counts and timestamps, never event data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub schema_version: String,
    pub last_scraped_at: String,
    pub data_root: String,
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionEntry>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceEntry>,
}

impl IndexDocument {
    pub fn empty(data_root: &Path) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            last_scraped_at: String::new(),
            data_root: data_root.display().to_string(),
            partitions: BTreeMap::new(),
            sources: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub sources: Vec<SourceMeta>,
}

/// One year's events. Carries no timestamps so unchanged years serialize identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDocument {
    pub schema_version: String,
    pub meta: PartitionMeta,
    pub events: Vec<Event>,
}

impl PartitionDocument {
    pub fn new(sources: Vec<SourceMeta>, mut events: Vec<Event>) -> Self {
        events.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            meta: PartitionMeta { sources },
            events,
        }
    }
}

/// Pretty JSON (2-space indent, unescaped UTF-8) with a trailing newline.
pub fn to_canonical_json<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>, StoreError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
        what: what.to_string(),
        source,
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(io_error(&parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let write_result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_error(&temp_path)(err));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_error(path)(err));
    }
    Ok(())
}

fn is_unset(ts: &Option<String>) -> bool {
    ts.as_deref().map_or(true, str::is_empty)
}

/// Carry first-seen timestamps forward for links whose `(type, url, title)` was
/// stored before; stamp `now` on anything new. Links that already carry a
/// timestamp are left alone.
pub fn merge_link_timestamps(new_links: &mut [Url], old_links: &[Url], now: &str) {
    for link in new_links.iter_mut() {
        if !is_unset(&link.last_updated_at) {
            continue;
        }
        let carried = old_links
            .iter()
            .find(|old| old.same_sighting(link))
            .and_then(|old| old.last_updated_at.clone())
            .filter(|ts| !ts.is_empty());
        link.last_updated_at = Some(carried.unwrap_or_else(|| now.to_string()));
    }
}

/// Apply [`merge_link_timestamps`] to the event's links and to every race's
/// links, pairing races with the stored record by `race_number`.
pub fn merge_event_timestamps(event: &mut Event, existing: Option<&Event>, now: &str) {
    let no_links: &[Url] = &[];
    merge_link_timestamps(
        &mut event.urls,
        existing.map_or(no_links, |e| e.urls.as_slice()),
        now,
    );

    for race in &mut event.races {
        let old_links = existing
            .and_then(|e| e.race(race.race_number))
            .map_or(no_links, |r: &Race| r.urls.as_slice());
        merge_link_timestamps(&mut race.urls, old_links, now);
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub index_path: PathBuf,
    pub data_root: PathBuf,
    pub sources: Vec<SourceMeta>,
}

impl StoreConfig {
    pub fn new(index_path: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
            data_root: data_root.into(),
            sources: SourceMeta::eventor_defaults(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("MTBO_INDEX_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/events/mtbo_events.json")),
            std::env::var("MTBO_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/events")),
        )
    }

    pub fn partition_path(&self, year: &str) -> PathBuf {
        self.data_root.join(year).join(PARTITION_FILE_NAME)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("data/events/mtbo_events.json", "data/events")
    }
}

pub struct EventStore {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    dispatch: Option<Dispatch>,
}

impl EventStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            dispatch: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Route this store's log output to `dispatch` instead of the global subscriber.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn now(&self) -> String {
        format_timestamp(self.clock.now())
    }

    async fn scoped<F: Future>(&self, fut: F) -> F::Output {
        match &self.dispatch {
            Some(dispatch) => fut.with_subscriber(dispatch.clone()).await,
            None => fut.await,
        }
    }

    /// Read the index; a missing or malformed file yields an empty index.
    pub async fn load_index(&self) -> Result<IndexDocument, StoreError> {
        self.scoped(self.read_index()).await
    }

    /// Flatten every referenced partition into one id -> event map.
    ///
    /// A missing or corrupt partition is skipped with a warning so damage to one
    /// year never blocks work on the others.
    pub async fn load(&self) -> Result<BTreeMap<String, Event>, StoreError> {
        self.scoped(async {
            let index = self.read_index().await?;
            self.read_partitions(&index).await
        })
        .await
    }

    /// Merge `events_by_source` into the archive and rewrite what changed.
    ///
    /// Returns the complete merged event list, ordered by year then id.
    pub async fn save(
        &self,
        events_by_source: BTreeMap<String, Vec<Event>>,
    ) -> Result<Vec<Event>, StoreError> {
        self.scoped(async move {
            let span = info_span!("event_store_save", sources = events_by_source.len());
            self.save_inner(events_by_source).instrument(span).await
        })
        .await
    }

    /// Remove events by id and delete their derived start list files.
    ///
    /// Returns the ids actually found; unknown ids are ignored and, when nothing
    /// matches, no file is touched.
    pub async fn purge(&self, event_ids: &[String]) -> Result<Vec<String>, StoreError> {
        self.scoped(async move {
            let span = info_span!("event_store_purge", requested = event_ids.len());
            self.purge_inner(event_ids).instrument(span).await
        })
        .await
    }

    async fn read_index(&self) -> Result<IndexDocument, StoreError> {
        let path = &self.config.index_path;
        Ok(self
            .read_document::<IndexDocument>(path)
            .await?
            .unwrap_or_else(|| IndexDocument::empty(&self.config.data_root)))
    }

    async fn read_partitions(
        &self,
        index: &IndexDocument,
    ) -> Result<BTreeMap<String, Event>, StoreError> {
        let mut events = BTreeMap::new();
        for (year, entry) in &index.partitions {
            if entry.path.is_empty() {
                continue;
            }
            let path = PathBuf::from(&entry.path);
            let Some(doc) = self.read_document::<PartitionDocument>(&path).await? else {
                warn!(year = %year, path = %path.display(), "partition_unavailable");
                continue;
            };
            for event in doc.events {
                if !event.id.is_empty() {
                    events.insert(event.id.clone(), event);
                }
            }
        }
        debug!(events = events.len(), "archive_loaded");
        Ok(events)
    }

    /// `Ok(None)` for missing or malformed documents; a well-formed document
    /// with a foreign `schema_version` is refused outright.
    async fn read_document<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "document_read_failed");
                return Ok(None);
            }
        };

        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "document_malformed");
                return Ok(None);
            }
        };

        let found = value
            .get("schema_version")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if found.as_deref() != Some(SCHEMA_VERSION) {
            error!(path = %path.display(), found = ?found, "document_schema_unsupported");
            return Err(StoreError::UnsupportedSchema {
                path: path.to_path_buf(),
                found,
            });
        }

        match serde_json::from_value(value) {
            Ok(doc) => Ok(Some(doc)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "document_malformed");
                Ok(None)
            }
        }
    }

    async fn write_if_changed(&self, path: &Path, bytes: &[u8]) -> Result<bool, StoreError> {
        match fs::read(path).await {
            Ok(current) if current == bytes => return Ok(false),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(path)(err)),
        }
        write_atomic(path, bytes).await?;
        Ok(true)
    }

    async fn save_inner(
        &self,
        events_by_source: BTreeMap<String, Vec<Event>>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut index = self.read_index().await?;
        let mut merged = self.read_partitions(&index).await?;
        let now = self.now();

        let mut changed_sources = BTreeSet::new();
        for (source, events) in events_by_source {
            for mut event in events {
                let existing = merged.get(&event.id);
                merge_event_timestamps(&mut event, existing, &now);
                event.canonicalize();

                let differs = match existing {
                    Some(prev) => {
                        to_canonical_json(prev, &prev.id)? != to_canonical_json(&event, &event.id)?
                    }
                    None => true,
                };
                if differs {
                    debug!(event_id = %event.id, source = %source, "event_changed");
                    changed_sources.insert(source.clone());
                    merged.insert(event.id.clone(), event);
                }
            }
            index
                .sources
                .entry(source)
                .or_insert_with(|| SourceEntry {
                    count: 0,
                    last_updated_at: now.clone(),
                });
        }

        let mut by_year: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        for (id, event) in merged {
            let Some(year) = event.year().map(str::to_string) else {
                error!(event_id = %id, "event_missing_start_time");
                return Err(StoreError::MissingStartTime { event_id: id });
            };
            by_year.entry(year).or_default().push(event);
        }

        for (name, entry) in index.sources.iter_mut() {
            let prefix = format!("{name}_");
            entry.count = by_year
                .values()
                .flatten()
                .filter(|e| e.id.starts_with(&prefix))
                .count();
            if changed_sources.contains(name) {
                entry.last_updated_at = now.clone();
            }
        }

        let mut saved = Vec::new();
        for (year, events) in by_year {
            let path = self.config.partition_path(&year);
            let doc = PartitionDocument::new(self.config.sources.clone(), events);
            let bytes = to_canonical_json(&doc, &format!("partition {year}"))?;
            let changed = self.write_if_changed(&path, &bytes).await?;
            if changed {
                info!(year = %year, path = %path.display(), count = doc.events.len(), "partition_updated");
            }

            let entry = index
                .partitions
                .entry(year)
                .or_insert_with(|| PartitionEntry {
                    path: String::new(),
                    count: 0,
                    last_updated_at: now.clone(),
                });
            entry.path = path.display().to_string();
            entry.count = doc.events.len();
            if changed || entry.last_updated_at.is_empty() {
                entry.last_updated_at = now.clone();
            }

            saved.extend(doc.events);
        }

        index.schema_version = SCHEMA_VERSION.to_string();
        index.last_scraped_at = now;
        index.data_root = self.config.data_root.display().to_string();
        self.write_index(&index).await?;

        Ok(saved)
    }

    async fn purge_inner(&self, event_ids: &[String]) -> Result<Vec<String>, StoreError> {
        let wanted: HashSet<&str> = event_ids.iter().map(String::as_str).collect();
        let mut index = self.read_index().await?;
        let now = self.now();
        let mut removed: Vec<String> = Vec::new();

        for (year, entry) in index.partitions.iter_mut() {
            if entry.path.is_empty() {
                continue;
            }
            let path = PathBuf::from(&entry.path);
            let Some(mut doc) = self.read_document::<PartitionDocument>(&path).await? else {
                continue;
            };

            let (purged, kept): (Vec<Event>, Vec<Event>) = doc
                .events
                .into_iter()
                .partition(|e| wanted.contains(e.id.as_str()));
            doc.events = kept;
            if purged.is_empty() {
                continue;
            }

            let bytes = to_canonical_json(&doc, &format!("partition {year}"))?;
            write_atomic(&path, &bytes).await?;
            entry.count = doc.events.len();
            entry.last_updated_at = now.clone();

            let purged_ids: Vec<String> = purged.into_iter().map(|e| e.id).collect();
            info!(year = %year, purged = ?purged_ids, remaining = doc.events.len(), "events_purged");
            removed.extend(purged_ids);
        }

        if removed.is_empty() {
            debug!("purge_nothing_found");
            return Ok(removed);
        }

        for id in &removed {
            if let Some(source) = index.sources.get_mut(source_prefix(id)) {
                source.count = source.count.saturating_sub(1);
                source.last_updated_at = now.clone();
            }
        }

        self.delete_startlist_artifacts(&removed).await?;

        index.last_scraped_at = now;
        self.write_index(&index).await?;
        Ok(removed)
    }

    async fn write_index(&self, index: &IndexDocument) -> Result<(), StoreError> {
        let bytes = to_canonical_json(index, "index")?;
        write_atomic(&self.config.index_path, &bytes).await?;
        info!(path = %self.config.index_path.display(), "index_updated");
        Ok(())
    }

    /// Delete `{id}_startlist_*.yaml` for each id, anywhere under the data root.
    async fn delete_startlist_artifacts(&self, event_ids: &[String]) -> Result<usize, StoreError> {
        let prefixes: Vec<String> = event_ids
            .iter()
            .map(|id| format!("{id}{STARTLIST_INFIX}"))
            .collect();
        let mut deleted = 0usize;
        let mut pending = vec![self.config.data_root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_error(&dir)(err)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(io_error(&path))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let matches = name.ends_with(".yaml")
                    && prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()));
                if matches {
                    fs::remove_file(&path).await.map_err(io_error(&path))?;
                    info!(path = %path.display(), "startlist_deleted");
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}
