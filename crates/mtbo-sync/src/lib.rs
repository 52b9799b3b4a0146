//! Scrape-pass orchestration: participant fingerprinting, start list artifacts,
//! change statistics and the hand-off into the event store.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use mtbo_core::{year_of, Event, Participant, Race, Url, LOCAL_STARTLIST_URL_TYPE};
use mtbo_storage::{format_timestamp, write_atomic, Clock, EventStore, StoreConfig, SystemClock, STARTLIST_INFIX};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn, Dispatch};
use uuid::Uuid;

mod manual;

pub use manual::{ManualYamlSource, MANUAL_EVENT_FILE_NAME};

pub const CRATE_NAME: &str = "mtbo-sync";

/// Source id (and event id prefix) for hand-maintained events.
pub const MANUAL_SOURCE_ID: &str = "MAN";

/// Longest scrape window accepted, roughly fifteen months.
pub const MAX_WINDOW_DAYS: u64 = 456;

/// Previously seen fingerprints, scoped per calendar year.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownFingerprints {
    by_year: BTreeMap<String, HashSet<String>>,
}

impl KnownFingerprints {
    pub fn for_year(&self, year: &str) -> Option<&HashSet<String>> {
        self.by_year.get(year)
    }

    pub fn insert(&mut self, year: &str, fingerprint: impl Into<String>) {
        self.by_year
            .entry(year.to_string())
            .or_default()
            .insert(fingerprint.into());
    }

    pub fn years(&self) -> impl Iterator<Item = (&str, usize)> {
        self.by_year.iter().map(|(y, set)| (y.as_str(), set.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_year.is_empty()
    }
}

/// Content-addressed participant identity.
///
/// A fingerprint is the hex SHA-256 of `"{name}|{club}"` after trimming and
/// lowercasing both parts. Given the year's known fingerprints, a participant
/// whose name tokens appear in reverse order ("Last First") resolves to the
/// already known hash. The club is never reversed or fuzzed.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    dispatch: Option<Dispatch>,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self { dispatch: None }
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }

    pub fn normalize(input: &str) -> String {
        input.trim().to_lowercase()
    }

    pub fn base_hash(name: &str, club: &str) -> String {
        hash_normalized(&Self::normalize(name), &Self::normalize(club))
    }

    pub fn fingerprint(&self, participant: &Participant, known: Option<&HashSet<String>>) -> String {
        let name = Self::normalize(&participant.name);
        let club = Self::normalize(&participant.club);
        let direct = hash_normalized(&name, &club);

        let Some(known) = known.filter(|k| !k.is_empty()) else {
            return direct;
        };
        if known.contains(&direct) {
            return direct;
        }

        let tokens: Vec<&str> = name.split_whitespace().collect();
        if tokens.len() < 2 {
            return direct;
        }
        let reversed = tokens.iter().rev().copied().collect::<Vec<_>>().join(" ");
        if reversed == name {
            return direct;
        }

        let flipped = hash_normalized(&reversed, &club);
        if known.contains(&flipped) {
            self.in_scope(|| debug!(name = %participant.name, club = %participant.club, "name_order_resolved"));
            return flipped;
        }
        direct
    }

    /// Merge lists in the given order, keeping the first participant seen for
    /// each normalized `(name, club)` pair.
    pub fn merge_participants(lists: &[&[Participant]]) -> Vec<Participant> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut merged = Vec::new();
        for list in lists {
            for participant in *list {
                let key = (Self::normalize(&participant.name), Self::normalize(&participant.club));
                if seen.insert(key) {
                    merged.push(participant.clone());
                }
            }
        }
        merged
    }

    /// Sorted, de-duplicated fingerprints for `participants`.
    pub fn generate_fingerprints(
        &self,
        participants: &[Participant],
        known: Option<&HashSet<String>>,
    ) -> Vec<String> {
        let unique: BTreeSet<String> = participants
            .iter()
            .map(|p| self.fingerprint(p, known))
            .collect();
        unique.into_iter().collect()
    }

    /// Bucket every stored race fingerprint by the year of its event's start date.
    pub fn extract_year_to_fingerprints<'a>(
        events: impl IntoIterator<Item = &'a Event>,
    ) -> KnownFingerprints {
        let mut known = KnownFingerprints::default();
        for event in events {
            let Some(year) = year_of(&event.start_time) else {
                continue;
            };
            for race in &event.races {
                for fp in &race.fingerprints {
                    known.insert(year, fp.clone());
                }
            }
        }
        known
    }
}

fn hash_normalized(name: &str, club: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{name}|{club}").as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    Entry,
    Start,
    Result,
}

impl FromStr for ListKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entry" | "entries" => Ok(Self::Entry),
            "start" | "starts" => Ok(Self::Start),
            "result" | "results" => Ok(Self::Result),
            other => bail!("unknown participant list kind {other:?}"),
        }
    }
}

/// Which participant list wins when the same person appears in several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPrecedence(Vec<ListKind>);

impl ListPrecedence {
    /// Kinds not named keep their default relative order after the named ones.
    pub fn new(order: &[ListKind]) -> Self {
        let mut kinds: Vec<ListKind> = Vec::new();
        for kind in order.iter().chain(Self::default().0.iter()) {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        Self(kinds)
    }

    pub fn kinds(&self) -> &[ListKind] {
        &self.0
    }
}

impl Default for ListPrecedence {
    fn default() -> Self {
        Self(vec![ListKind::Entry, ListKind::Start, ListKind::Result])
    }
}

impl FromStr for ListPrecedence {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let kinds = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(ListKind::from_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(&kinds))
    }
}

/// Raw participant lists scraped for one race.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceParticipants {
    pub race_number: u32,
    #[serde(default)]
    pub entries: Vec<Participant>,
    #[serde(default)]
    pub starts: Vec<Participant>,
    #[serde(default)]
    pub results: Vec<Participant>,
}

impl RaceParticipants {
    pub fn list(&self, kind: ListKind) -> &[Participant] {
        match kind {
            ListKind::Entry => &self.entries,
            ListKind::Start => &self.starts,
            ListKind::Result => &self.results,
        }
    }

    pub fn merged(&self, precedence: &ListPrecedence) -> Vec<Participant> {
        let lists: Vec<&[Participant]> = precedence.kinds().iter().map(|k| self.list(*k)).collect();
        Fingerprinter::merge_participants(&lists)
    }
}

#[derive(Debug, Serialize)]
struct StartlistFile<'a> {
    event_id: &'a str,
    race_number: u32,
    participants: &'a [Participant],
}

/// Writes `{data_root}/{year}/{event_id}_startlist_{race_number}.yaml` and
/// points the race's `LocalStartList` link at it.
#[derive(Debug, Clone)]
pub struct StartlistWriter {
    data_root: PathBuf,
    dispatch: Option<Dispatch>,
}

impl StartlistWriter {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            dispatch: None,
        }
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn artifact_path(&self, event_id: &str, year: &str, race_number: u32) -> PathBuf {
        self.data_root
            .join(year)
            .join(format!("{event_id}{STARTLIST_INFIX}{race_number}.yaml"))
    }

    /// Returns whether the file content changed. An unchanged file leaves the
    /// link timestamp empty so the store carries the earlier one forward.
    pub async fn write(
        &self,
        event_id: &str,
        year: &str,
        race: &mut Race,
        participants: &[Participant],
        now: &str,
    ) -> Result<bool> {
        let fut = self.write_inner(event_id, year, race, participants, now);
        match &self.dispatch {
            Some(dispatch) => fut.with_subscriber(dispatch.clone()).await,
            None => fut.await,
        }
    }

    async fn write_inner(
        &self,
        event_id: &str,
        year: &str,
        race: &mut Race,
        participants: &[Participant],
        now: &str,
    ) -> Result<bool> {
        let path = self.artifact_path(event_id, year, race.race_number);
        let body = serde_yaml::to_string(&StartlistFile {
            event_id,
            race_number: race.race_number,
            participants,
        })
        .with_context(|| format!("serializing start list for {event_id} race {}", race.race_number))?;

        let changed = match fs::read(&path).await {
            Ok(current) => current != body.as_bytes(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        if changed {
            write_atomic(&path, body.as_bytes())
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), participants = participants.len(), "startlist_written");
        }

        attach_local_startlist(race, &path, changed.then_some(now));
        Ok(changed)
    }
}

fn attach_local_startlist(race: &mut Race, path: &Path, stamp: Option<&str>) {
    race.urls.retain(|u| u.kind != LOCAL_STARTLIST_URL_TYPE);
    let mut link = Url::new(LOCAL_STARTLIST_URL_TYPE, path.display().to_string());
    link.last_updated_at = stamp.map(str::to_string);
    race.urls.push(link);
}

/// New / changed / deleted counts between two archive snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub new: usize,
    pub changed: usize,
    pub deleted: usize,
}

impl ChangeSummary {
    pub fn between(old: &[Event], new: &[Event]) -> Self {
        let old_map: BTreeMap<&str, &Event> = old.iter().map(|e| (e.id.as_str(), e)).collect();
        let new_map: BTreeMap<&str, &Event> = new.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut summary = Self::default();
        for (id, event) in &new_map {
            match old_map.get(id) {
                None => summary.new += 1,
                Some(prev) if !same_record(prev, event) => summary.changed += 1,
                Some(_) => {}
            }
        }
        summary.deleted = old_map.keys().filter(|id| !new_map.contains_key(*id)).count();
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.changed == 0 && self.deleted == 0
    }

    pub fn commit_message(
        &self,
        today: NaiveDate,
        window: &SyncWindow,
        sources: &[String],
        refresh: bool,
    ) -> String {
        let mut details = vec![format!("Range: {} to {}", window.start_date, window.end_date)];
        if !sources.is_empty() {
            details.push(format!("Sources: {}", sources.join(", ")));
        }
        if refresh {
            details.push("Refresh: enabled".to_string());
        }
        format!(
            "Update MTBO events: {today}\nNew: {}, Changed: {}, Deleted: {}\n{}",
            self.new,
            self.changed,
            self.deleted,
            details.join(", ")
        )
    }
}

fn same_record(a: &Event, b: &Event) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Inclusive date range handed to sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl SyncWindow {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Result<Self> {
        if end_date < start_date {
            bail!("sync window ends ({end_date}) before it starts ({start_date})");
        }
        let span = (end_date - start_date).num_days();
        if span > MAX_WINDOW_DAYS as i64 {
            bail!("sync window of {span} days exceeds the {MAX_WINDOW_DAYS}-day limit");
        }
        Ok(Self { start_date, end_date })
    }

    /// Four weeks back, fifteen months forward.
    pub fn default_from(today: NaiveDate) -> Self {
        let start_date = today.checked_sub_days(Days::new(28)).unwrap_or(today);
        let end_date = start_date
            .checked_add_days(Days::new(MAX_WINDOW_DAYS))
            .unwrap_or(start_date);
        Self { start_date, end_date }
    }

    pub fn contains(&self, start_time: &str) -> bool {
        match start_time.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()) {
            Some(date) => date >= self.start_date && date <= self.end_date,
            None => true,
        }
    }
}

/// Event plus the raw participant lists of its races, as produced by a parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedEvent {
    pub event: Event,
    #[serde(default)]
    pub participants: Vec<RaceParticipants>,
}

impl From<Event> for ScrapedEvent {
    fn from(event: Event) -> Self {
        Self {
            event,
            participants: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {source_id}: {message}")]
    Message { source_id: String, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Upstream collaborator that hands over fully-formed event records.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_events(&self, window: &SyncWindow) -> Result<Vec<ScrapedEvent>, SourceError>;
}

/// Reads scraped events for one source from a JSON batch file shaped
/// `{"SWE": [ScrapedEvent, ...], "NOR": [...]}`.
#[derive(Debug, Clone)]
pub struct JsonBatchSource {
    source_id: String,
    path: PathBuf,
}

impl JsonBatchSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl EventSource for JsonBatchSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_events(&self, window: &SyncWindow) -> Result<Vec<ScrapedEvent>, SourceError> {
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let mut batch: BTreeMap<String, Vec<ScrapedEvent>> = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        let Some(events) = batch.remove(&self.source_id) else {
            return Ok(Vec::new());
        };

        let prefix = format!("{}_", self.source_id);
        let mut kept = Vec::with_capacity(events.len());
        for scraped in events {
            if !scraped.event.id.starts_with(&prefix) {
                return Err(SourceError::Message {
                    source_id: self.source_id.clone(),
                    message: format!("event id {} lacks the {prefix} prefix", scraped.event.id),
                });
            }
            if window.contains(&scraped.event.start_time) {
                kept.push(scraped);
            }
        }
        Ok(kept)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreConfig,
    pub batch_path: PathBuf,
    pub sources: Vec<String>,
    pub precedence: ListPrecedence,
    pub window: SyncWindow,
    pub write_startlists: bool,
    /// Label only: adds "Refresh: enabled" to the commit message.
    pub refresh: bool,
    /// Root scanned for `event.yaml` files, when set.
    pub manual_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let today = Utc::now().date_naive();
        let start = env_date("MTBO_START_DATE")?;
        let end = env_date("MTBO_END_DATE")?;
        let window = match (start, end) {
            (None, None) => SyncWindow::default_from(today),
            (Some(start), None) => SyncWindow::new(
                start,
                start.checked_add_days(Days::new(MAX_WINDOW_DAYS)).unwrap_or(start),
            )?,
            (None, Some(end)) => SyncWindow::new(SyncWindow::default_from(today).start_date, end)?,
            (Some(start), Some(end)) => SyncWindow::new(start, end)?,
        };

        Ok(Self {
            store: StoreConfig::from_env(),
            batch_path: std::env::var("MTBO_BATCH_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/scraped/batch.json")),
            sources: std::env::var("MTBO_SOURCES")
                .unwrap_or_else(|_| "SWE,NOR,IOF".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            precedence: match std::env::var("MTBO_LIST_PRECEDENCE") {
                Ok(raw) => raw.parse().context("parsing MTBO_LIST_PRECEDENCE")?,
                Err(_) => ListPrecedence::default(),
            },
            window,
            write_startlists: std::env::var("MTBO_WRITE_STARTLISTS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            refresh: std::env::var("MTBO_REFRESH")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            manual_dir: std::env::var("MTBO_MANUAL_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn env_date(key: &str) -> Result<Option<NaiveDate>> {
    match std::env::var(key) {
        Ok(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map(Some)
            .with_context(|| format!("parsing {key}={raw}")),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<String>,
    pub failed_sources: Vec<String>,
    pub fetched_events: usize,
    pub fingerprinted_races: usize,
    pub startlists_written: usize,
    pub archived_events: usize,
    pub changes: ChangeSummary,
    pub commit_message: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: EventStore,
    fingerprinter: Fingerprinter,
    startlists: StartlistWriter,
    clock: Arc<dyn Clock>,
    dispatch: Option<Dispatch>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        let store = EventStore::new(config.store.clone());
        let startlists = StartlistWriter::new(config.store.data_root.clone());
        Self {
            config,
            store,
            fingerprinter: Fingerprinter::new(),
            startlists,
            clock: Arc::new(SystemClock),
            dispatch: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.store = self.store.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    /// Route the pipeline's own logs, and those of its store, fingerprinter
    /// and start list writer, to `dispatch`.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.store = self.store.with_dispatch(dispatch.clone());
        self.fingerprinter = self.fingerprinter.with_dispatch(dispatch.clone());
        self.startlists = self.startlists.with_dispatch(dispatch.clone());
        self.dispatch = Some(dispatch);
        self
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// One scrape pass: fingerprint, write start lists, merge into the archive.
    ///
    /// A failing source is logged and skipped so the others still land.
    pub async fn run_once(&self, sources: &[Box<dyn EventSource>]) -> Result<SyncRunSummary> {
        let fut = self.run_once_inner(sources);
        match &self.dispatch {
            Some(dispatch) => fut.with_subscriber(dispatch.clone()).await,
            None => fut.await,
        }
    }

    async fn run_once_inner(&self, sources: &[Box<dyn EventSource>]) -> Result<SyncRunSummary> {
        let started_at = self.clock.now();
        let run_id = Uuid::new_v4();

        let previous: Vec<Event> = self
            .store
            .load()
            .await
            .context("loading archive snapshot")?
            .into_values()
            .collect();
        let known = Fingerprinter::extract_year_to_fingerprints(&previous);
        let now = format_timestamp(started_at);

        let mut batch: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        let mut source_ids = Vec::new();
        let mut failed_sources = Vec::new();
        let mut fetched_events = 0usize;
        let mut fingerprinted_races = 0usize;
        let mut startlists_written = 0usize;

        for source in sources {
            let source_id = source.source_id().to_string();
            let scraped = match source.fetch_events(&self.config.window).await {
                Ok(scraped) => scraped,
                Err(err) => {
                    warn!(%run_id, source = %source_id, error = %err, "source_failed");
                    failed_sources.push(source_id);
                    continue;
                }
            };
            fetched_events += scraped.len();

            let events = batch.entry(source_id.clone()).or_default();
            for item in scraped {
                let (event, stats) = self.prepare_event(item, &known, &now).await?;
                fingerprinted_races += stats.fingerprinted_races;
                startlists_written += stats.startlists_written;
                events.push(event);
            }
            source_ids.push(source_id);
        }

        let merged = self.store.save(batch).await.context("saving events")?;
        let changes = ChangeSummary::between(&previous, &merged);
        let commit_message = changes.commit_message(
            started_at.date_naive(),
            &self.config.window,
            &source_ids,
            self.config.refresh,
        );
        let finished_at = self.clock.now();
        info!(
            %run_id,
            new = changes.new,
            changed = changes.changed,
            deleted = changes.deleted,
            archived = merged.len(),
            "sync_completed"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            sources: source_ids,
            failed_sources,
            fetched_events,
            fingerprinted_races,
            startlists_written,
            archived_events: merged.len(),
            changes,
            commit_message,
        })
    }

    async fn prepare_event(
        &self,
        scraped: ScrapedEvent,
        known: &KnownFingerprints,
        now: &str,
    ) -> Result<(Event, PrepareStats)> {
        let ScrapedEvent {
            mut event,
            participants,
        } = scraped;
        let mut stats = PrepareStats::default();
        let year = event.year().map(str::to_string);
        let known_for_year = year.as_deref().and_then(|y| known.for_year(y));

        for lists in participants {
            let Some(race) = event.races.iter_mut().find(|r| r.race_number == lists.race_number) else {
                warn!(event_id = %event.id, race_number = lists.race_number, "participants_for_unknown_race");
                continue;
            };

            let merged = lists.merged(&self.config.precedence);
            race.fingerprints = self.fingerprinter.generate_fingerprints(&merged, known_for_year);
            stats.fingerprinted_races += 1;

            if !self.config.write_startlists || lists.starts.is_empty() {
                continue;
            }
            let Some(year) = year.as_deref() else {
                continue;
            };
            if self
                .startlists
                .write(&event.id, year, race, &lists.starts, now)
                .await?
            {
                stats.startlists_written += 1;
            }
        }
        Ok((event, stats))
    }
}

#[derive(Debug, Default)]
struct PrepareStats {
    fingerprinted_races: usize,
    startlists_written: usize,
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(SyncConfig::from_env()?).await
}

pub fn sources_for(config: &SyncConfig) -> Vec<Box<dyn EventSource>> {
    let mut sources: Vec<Box<dyn EventSource>> = config
        .sources
        .iter()
        .map(|id| Box::new(JsonBatchSource::new(id.clone(), config.batch_path.clone())) as Box<dyn EventSource>)
        .collect();
    if let Some(dir) = &config.manual_dir {
        sources.push(Box::new(ManualYamlSource::new(MANUAL_SOURCE_ID, dir.clone())));
    }
    sources
}

/// Run one pass with a [`JsonBatchSource`] per configured source id, plus a
/// [`ManualYamlSource`] when a manual directory is configured.
pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    let sources = sources_for(&config);
    SyncPipeline::new(config).run_once(&sources).await
}
