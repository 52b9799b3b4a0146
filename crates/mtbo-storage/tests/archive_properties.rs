use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use mtbo_core::{Event, Race, Url};
use mtbo_storage::{EventStore, ManualClock, StoreConfig};
use tempfile::{tempdir, TempDir};

fn setup() -> (TempDir, Arc<ManualClock>, EventStore) {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 1, 10, 6, 0, 0).single().expect("ts"),
    ));
    let config = StoreConfig::new(
        dir.path().join("mtbo_events.json"),
        dir.path().join("data").join("events"),
    );
    let store = EventStore::new(config).with_clock(clock.clone());
    (dir, clock, store)
}

fn event(id: &str, name: &str, start: &str) -> Event {
    let mut event = Event::new(id, name, start);
    event.status = "Sanctioned".into();
    let mut race = Race::new(1);
    race.datetimez = Some(format!("{start}T10:00:00+01:00"));
    race.discipline = Some("Middle".into());
    race.urls.push(Url::new("StartList", format!("/Events/StartList?eventId={id}")).with_title("Start list"));
    event.races.push(race);
    event
}

fn batch(source: &str, events: Vec<Event>) -> BTreeMap<String, Vec<Event>> {
    BTreeMap::from([(source.to_string(), events)])
}

#[tokio::test]
async fn first_save_into_empty_archive_creates_partition_and_index() {
    let (_dir, _clock, store) = setup();
    store
        .save(batch("A", vec![event("A_1", "Spring Cup", "2024-03-01")]))
        .await
        .expect("save");

    let partition = store.config().partition_path("2024");
    let doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&partition).expect("partition exists")).expect("json");
    assert_eq!(doc["schema_version"], "2.0");
    assert_eq!(doc["events"].as_array().expect("events").len(), 1);
    assert_eq!(doc["meta"]["sources"].as_array().expect("sources").len(), 3);
    assert!(doc.get("last_updated_at").is_none());

    let index = store.load_index().await.expect("index");
    assert_eq!(index.partitions["2024"].count, 1);
    assert_eq!(index.partitions["2024"].path, partition.display().to_string());
    assert_eq!(index.sources["A"].count, 1);

    let raw = std::fs::read_to_string(&partition).expect("read");
    assert!(raw.ends_with("}\n"));
    assert!(raw.contains("\n  \"schema_version\""));
}

#[tokio::test]
async fn saving_identical_input_twice_is_idempotent() {
    let (_dir, clock, store) = setup();
    let input = || batch("SWE", vec![event("SWE_1", "Sprint", "2025-01-01"), event("SWE_2", "Long", "2024-06-01")]);

    store.save(input()).await.expect("first");
    let first_index = store.load_index().await.expect("index");
    let bytes_2024 = std::fs::read(store.config().partition_path("2024")).expect("2024");
    let bytes_2025 = std::fs::read(store.config().partition_path("2025")).expect("2025");

    clock.advance(Duration::hours(6));
    store.save(input()).await.expect("second");
    let second_index = store.load_index().await.expect("index");

    assert_eq!(std::fs::read(store.config().partition_path("2024")).expect("2024"), bytes_2024);
    assert_eq!(std::fs::read(store.config().partition_path("2025")).expect("2025"), bytes_2025);
    assert_eq!(first_index.partitions, second_index.partitions);
    assert_eq!(first_index.sources, second_index.sources);
    assert_ne!(first_index.last_scraped_at, second_index.last_scraped_at);
}

#[tokio::test]
async fn merge_keeps_unseen_events_and_replaces_changed_ones() {
    let (_dir, clock, store) = setup();
    store
        .save(batch("X", vec![event("X_1", "A", "2025-05-01"), event("X_2", "B", "2024-05-01")]))
        .await
        .expect("seed");
    let before = store.load_index().await.expect("index");

    clock.advance(Duration::minutes(30));
    let merged = store
        .save(batch("X", vec![event("X_1", "A renamed", "2025-05-01"), event("X_3", "C", "2025-07-01")]))
        .await
        .expect("merge");

    let ids: Vec<&str> = merged.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["X_2", "X_1", "X_3"]);
    assert_eq!(merged.iter().find(|e| e.id == "X_1").expect("X_1").name, "A renamed");

    let after = store.load_index().await.expect("index");
    assert_eq!(after.partitions["2024"].last_updated_at, before.partitions["2024"].last_updated_at);
    assert_ne!(after.partitions["2025"].last_updated_at, before.partitions["2025"].last_updated_at);
    assert_eq!(after.partitions["2025"].count, 2);
    assert_eq!(after.sources["X"].count, 3);
}

#[tokio::test]
async fn year_bucket_follows_event_start_not_race_dates() {
    let (_dir, _clock, store) = setup();
    let mut new_year = event("SWE_31", "Midnight MTBO", "2023-12-31");
    new_year.races[0].datetimez = Some("2024-01-01T00:30:00+01:00".into());
    store.save(batch("SWE", vec![new_year])).await.expect("save");

    let index = store.load_index().await.expect("index");
    assert!(index.partitions.contains_key("2023"));
    assert!(!index.partitions.contains_key("2024"));
}

#[tokio::test]
async fn purge_removes_event_partition_entry_and_startlists() {
    let (dir, clock, store) = setup();
    store
        .save(batch("X", vec![event("X_1", "Doomed", "2024-02-01"), event("X_10", "Kept", "2024-03-01"), event("X_2", "Other year", "2025-02-01")]))
        .await
        .expect("seed");
    let before = store.load_index().await.expect("index");
    let bytes_2025 = std::fs::read(store.config().partition_path("2025")).expect("2025");

    let year_dir = store.config().data_root.join("2024");
    std::fs::write(year_dir.join("X_1_startlist_1.yaml"), "race_number: 1\n").expect("artifact");
    let nested = dir.path().join("data").join("events").join("archive").join("old");
    std::fs::create_dir_all(&nested).expect("nested");
    std::fs::write(nested.join("X_1_startlist_2.yaml"), "race_number: 2\n").expect("artifact");
    std::fs::write(year_dir.join("X_10_startlist_1.yaml"), "race_number: 1\n").expect("artifact");

    clock.advance(Duration::minutes(1));
    let removed = store.purge(&["X_1".to_string()]).await.expect("purge");
    assert_eq!(removed, vec!["X_1".to_string()]);

    let after = store.load_index().await.expect("index");
    assert_eq!(after.partitions["2024"].count, before.partitions["2024"].count - 1);
    assert_ne!(after.partitions["2024"].last_updated_at, before.partitions["2024"].last_updated_at);
    assert_eq!(after.partitions["2025"], before.partitions["2025"]);
    assert_eq!(after.sources["X"].count, 2);
    assert_eq!(std::fs::read(store.config().partition_path("2025")).expect("2025"), bytes_2025);

    assert!(!year_dir.join("X_1_startlist_1.yaml").exists());
    assert!(!nested.join("X_1_startlist_2.yaml").exists());
    assert!(year_dir.join("X_10_startlist_1.yaml").exists());

    let remaining = store.load().await.expect("load");
    assert!(!remaining.contains_key("X_1"));
    assert!(remaining.contains_key("X_10"));
}

#[tokio::test]
async fn purging_unknown_id_touches_nothing() {
    let (_dir, clock, store) = setup();
    store
        .save(batch("X", vec![event("X_1", "Still here", "2024-02-01")]))
        .await
        .expect("seed");
    let index_bytes = std::fs::read(&store.config().index_path).expect("index");
    let partition_bytes = std::fs::read(store.config().partition_path("2024")).expect("partition");

    clock.advance(Duration::minutes(1));
    let removed = store.purge(&["X_999".to_string()]).await.expect("purge");

    assert!(removed.is_empty());
    assert_eq!(std::fs::read(&store.config().index_path).expect("index"), index_bytes);
    assert_eq!(std::fs::read(store.config().partition_path("2024")).expect("partition"), partition_bytes);
}

#[tokio::test]
async fn unicode_names_are_written_unescaped() {
    let (_dir, _clock, store) = setup();
    store
        .save(batch("SWE", vec![event("SWE_46200", "O-Ringen Jönköping, MTBO", "2025-07-21")]))
        .await
        .expect("save");
    let raw = std::fs::read_to_string(store.config().partition_path("2025")).expect("read");
    assert!(raw.contains("Jönköping"));
}
