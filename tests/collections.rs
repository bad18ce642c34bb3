//! Live arrays: all-of-type, filtered and query arrays.

mod common;

use common::{registry, store_with, ScriptedAdapter};
use proptest::prelude::*;
use serde_json::json;
use tessera::{
    ArrayKind, FixtureAdapter, RecordData, RecordView, Store, StoreEvent, SubscriptionFilter,
};

fn starts_with_s(record: &RecordView<'_>) -> bool {
    record.str("name").map_or(false, |name| name.starts_with('S'))
}

fn deltas(events: Vec<StoreEvent>) -> Vec<(usize, usize)> {
    events
        .into_iter()
        .filter_map(|event| match event {
            StoreEvent::ArrayChanged { removed, added, .. } => Some((removed.len(), added.len())),
            _ => None,
        })
        .collect()
}

// --- Filtered arrays ---

#[tokio::test]
async fn test_filter_tracks_renames_with_single_deltas() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    store.push("person", RecordData::new("1").attr("name", "Sam")).unwrap();
    let tom = store.push("person", RecordData::new("2").attr("name", "Tom")).unwrap();

    let filtered = store.filter("person", starts_with_s).unwrap();
    assert_eq!(filtered.kind(), ArrayKind::Filtered);
    assert!(filtered.is_loaded());
    assert_eq!(filtered.len(), 1);
    let events = store.subscribe(SubscriptionFilter::arrays(vec![filtered.id()]));

    store
        .update("person", RecordData::new("2").attr("name", "Steve"))
        .unwrap();
    assert_eq!(filtered.len(), 2);
    assert_eq!(filtered.last(), Some(tom.clone()));
    assert_eq!(deltas(events.drain()), vec![(0, 1)]);

    store.set_attr(&tom, "name", "Tomster").unwrap();
    assert_eq!(filtered.len(), 1);
    assert!(!filtered.contains(&tom));
    assert_eq!(deltas(events.drain()), vec![(1, 0)]);

    // An edit that keeps membership produces no delta.
    store.set_attr(&tom, "name", "Thomas").unwrap();
    assert!(events.drain().is_empty());
}

#[tokio::test]
async fn test_filter_drops_renamed_member() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let katz = store
        .filter("person", |person| {
            person.str("name").map_or(false, |name| name.ends_with("Katz"))
        })
        .unwrap();

    let record = store.push("person", RecordData::new(1).attr("name", "Katz")).unwrap();
    assert_eq!(katz.len(), 1);

    store.set_attr(&record, "name", "Katz-Foo").unwrap();
    assert_eq!(katz.len(), 0);
}

#[tokio::test]
async fn test_deleted_record_leaves_every_array() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let sam = store
        .push("person", RecordData::new("1").attr("name", "Sam").attr("age", 40))
        .unwrap();
    store.push("person", RecordData::new("2").attr("name", "Tom")).unwrap();

    let everyone = store.all("person").unwrap();
    let named_s = store.filter("person", starts_with_s).unwrap();
    let adults = store
        .filter("person", |person| {
            person.get("age").and_then(|age| age.as_f64()).map_or(false, |age| age >= 18.0)
        })
        .unwrap();
    assert_eq!((everyone.len(), named_s.len(), adults.len()), (2, 1, 1));

    store.delete_record(&sam).unwrap();

    assert_eq!((everyone.len(), named_s.len(), adults.len()), (1, 0, 0));
    assert!(!everyone.contains(&sam));
}

#[tokio::test]
async fn test_iteration_survives_deleting_every_member() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    store
        .push_many(
            "tag",
            (1..=4).map(|id| RecordData::new(id).attr("label", "x")).collect(),
        )
        .unwrap();
    let tags = store.all("tag").unwrap();

    let mut visited = 0;
    for tag in &tags {
        store.delete_record(&tag).unwrap();
        visited += 1;
    }

    assert_eq!(visited, 4);
    assert!(tags.is_empty());
}

#[tokio::test]
async fn test_set_filter_publishes_one_delta() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    for (id, name) in [(1, "Tom"), (2, "Tina"), (3, "Sam")] {
        store.push("person", RecordData::new(id).attr("name", name)).unwrap();
    }
    let filtered = store
        .filter("person", |person| {
            person.str("name").map_or(false, |name| name.starts_with('T'))
        })
        .unwrap();
    assert_eq!(filtered.len(), 2);
    let events = store.subscribe(SubscriptionFilter::arrays(vec![filtered.id()]));

    filtered.set_filter(starts_with_s).unwrap();

    assert_eq!(filtered.len(), 1);
    assert_eq!(deltas(events.drain()), vec![(2, 1)]);
    assert!(store.all("person").unwrap().set_filter(starts_with_s).is_err());
}

#[tokio::test]
async fn test_destroyed_array_reads_empty() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    store.push("person", RecordData::new("1").attr("name", "Sam")).unwrap();
    let filtered = store.filter("person", starts_with_s).unwrap();
    assert_eq!(filtered.len(), 1);

    filtered.destroy().unwrap();

    assert!(filtered.is_empty());
    assert!(filtered.first().is_none());
    assert!(!filtered.is_loaded());
    store.push("person", RecordData::new("2").attr("name", "Sue")).unwrap();
    assert!(filtered.to_vec().is_empty());
    assert!(filtered.destroy().is_err());
}

// --- Adapter-backed arrays ---

#[tokio::test]
async fn test_find_all_passes_since_token() {
    let adapter = ScriptedAdapter::new();
    adapter.seed("person", RecordData::new("1").attr("name", "Tom"));
    adapter.seed("person", RecordData::new("2").attr("name", "Yehuda"));
    let store = store_with(&adapter);

    let people = store.find_all("person").await.unwrap();
    assert_eq!(people.kind(), ArrayKind::All);
    assert_eq!(people.len(), 2);
    assert!(people.is_loaded());
    assert!(!people.is_updating());
    assert_eq!(people.meta(), Some(json!({ "since": "t1" })));

    let again = store.find_all("person").await.unwrap();
    assert_eq!(again.id(), people.id());
    assert_eq!(people.len(), 2);

    store.unload_all("person").unwrap();
    assert!(people.is_empty());
    store.find_all("person").await.unwrap();

    assert_eq!(
        adapter.calls(),
        vec![
            "find_all person -".to_string(),
            "find_all person t1".to_string(),
            "find_all person -".to_string()
        ]
    );
}

#[tokio::test]
async fn test_all_array_counts_records_pushed_later() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let people = store.all("person").unwrap();
    assert!(people.is_empty());
    assert!(!people.is_loaded());

    store.push("person", RecordData::new("1")).unwrap();
    // Empty placeholders are not members.
    store.record_for("person", "2").unwrap();

    assert_eq!(people.len(), 1);
    assert!(adapter.calls().is_empty());
}

#[tokio::test]
async fn test_query_array_keeps_server_results() {
    let adapter = ScriptedAdapter::new();
    adapter.seed("person", RecordData::new("1").attr("name", "Tom"));
    adapter.seed("person", RecordData::new("2").attr("name", "Yehuda"));
    let store = store_with(&adapter);

    let toms = store
        .find_query("person", json!({ "name": "Tom" }))
        .await
        .unwrap();
    assert_eq!(toms.kind(), ArrayKind::Query);
    assert_eq!(toms.len(), 1);
    assert_eq!(toms.meta(), Some(json!({ "total": 1 })));
    assert_eq!(toms.query(), Some(json!({ "name": "Tom" })));

    // Local records matching the query do not join a query array.
    store.push("person", RecordData::new("3").attr("name", "Tom")).unwrap();
    assert_eq!(toms.len(), 1);

    adapter.seed("person", RecordData::new("4").attr("name", "Tom"));
    toms.update().await.unwrap();
    assert_eq!(toms.len(), 2);
    assert_eq!(toms.meta(), Some(json!({ "total": 2 })));

    let first = toms.first().unwrap();
    store.delete_record(&first).unwrap();
    assert_eq!(toms.len(), 1);
    assert_eq!(adapter.count("find_query person"), 2);
}

#[tokio::test]
async fn test_filter_query_pushes_then_filters_locally() {
    let adapter = ScriptedAdapter::new();
    adapter.seed("person", RecordData::new("1").attr("name", "Sam"));
    adapter.seed("person", RecordData::new("2").attr("name", "Sue"));
    let store = store_with(&adapter);

    let filtered = store
        .filter_query("person", json!({}), starts_with_s)
        .await
        .unwrap();
    assert_eq!(filtered.len(), 2);

    store.push("person", RecordData::new("3").attr("name", "Steve")).unwrap();
    assert_eq!(filtered.len(), 3);
}

#[tokio::test]
async fn test_array_save_saves_members() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    store.push("tag", RecordData::new("1")).unwrap();
    store.push("tag", RecordData::new("2")).unwrap();
    let tags = store.all("tag").unwrap();
    for tag in &tags {
        store.set_attr(&tag, "label", "renamed").unwrap();
    }

    tags.save().await.unwrap();

    assert!(tags.iter().all(|tag| !store.flags(&tag).unwrap().is_dirty));
    assert_eq!(adapter.count("update tag"), 2);
}

// --- Properties ---

fn sync_store() -> Store {
    Store::new(registry(), FixtureAdapter::new())
}

proptest! {
    #[test]
    fn prop_filter_matches_a_full_scan(
        pushes in prop::collection::vec((0u32..8, prop::sample::select(vec!["Sam", "Tom", "Sue", "Ann"])), 1..40)
    ) {
        let store = sync_store();
        let filtered = store.filter("person", starts_with_s).unwrap();
        let everyone = store.all("person").unwrap();

        for (id, name) in pushes {
            store.push("person", RecordData::new(id).attr("name", name)).unwrap();

            let mut expected: Vec<u64> = everyone
                .iter()
                .filter(|person| {
                    store
                        .attr(person, "name")
                        .unwrap()
                        .as_str()
                        .map_or(false, |name| name.starts_with('S'))
                })
                .map(|person| person.client_id().0)
                .collect();
            let mut actual: Vec<u64> = filtered.iter().map(|person| person.client_id().0).collect();
            expected.sort_unstable();
            actual.sort_unstable();
            prop_assert_eq!(actual, expected);
        }
    }
}
