//! Record lifecycle: saving, in-flight edits, rejection, rollback, reload,
//! deletion and unloading.

mod common;

use common::{store_with, ScriptedAdapter};
use serde_json::json;
use tessera::{
    AdapterError, DeletedPhase, DirtyPhase, Errors, Props, RecordData, RecordId, RecordState,
    StoreError, StoreEvent, SubscriptionFilter,
};

// --- Saving ---

#[tokio::test]
async fn test_create_and_save_takes_server_attributes() {
    let adapter = ScriptedAdapter::new();
    adapter.echo(json!({ "name": "Tom Dale" }));
    let store = store_with(&adapter);

    let tom = store
        .create_record("person", Props::new().attr("name", "Tom"))
        .unwrap();
    assert_eq!(store.state(&tom).unwrap(), RecordState::Created(DirtyPhase::Uncommitted));

    let pending = store.save(&tom);
    let flags = store.flags(&tom).unwrap();
    assert!(flags.is_saving && flags.is_new);
    pending.await.unwrap();

    let flags = store.flags(&tom).unwrap();
    assert_eq!(store.id(&tom).unwrap(), Some(RecordId::from("1")));
    assert!(!flags.is_dirty);
    assert!(!flags.is_new);
    assert!(!flags.is_saving);
    assert_eq!(store.attr(&tom, "name").unwrap(), json!("Tom Dale"));
    assert_eq!(adapter.calls(), vec!["create person".to_string()]);
}

#[tokio::test]
async fn test_edits_during_flight_survive_the_save() {
    let adapter = ScriptedAdapter::new();
    adapter.echo(json!({ "name": "Tom Dale" }));
    let store = store_with(&adapter);
    let tom = store
        .push("person", RecordData::new("1").attr("name", "Tom").attr("age", 30))
        .unwrap();

    store.set_attr(&tom, "name", "Tomster").unwrap();
    let pending = store.save(&tom);
    assert_eq!(store.state(&tom).unwrap(), RecordState::Updated(DirtyPhase::InFlight));

    store.set_attr(&tom, "age", 31).unwrap();
    pending.await.unwrap();

    assert_eq!(store.attr(&tom, "name").unwrap(), json!("Tom Dale"));
    assert_eq!(store.attr(&tom, "age").unwrap(), json!(31));
    assert_eq!(store.state(&tom).unwrap(), RecordState::Updated(DirtyPhase::Uncommitted));
    let changed = store.changed_attributes(&tom).unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed["age"], (json!(30), json!(31)));
}

#[tokio::test]
async fn test_saving_twice_while_in_flight_is_rejected() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let tom = store.push("person", RecordData::new("1").attr("name", "Tom")).unwrap();
    store.set_attr(&tom, "name", "Tomster").unwrap();

    let first = store.save(&tom);
    let second = store.save(&tom).await;
    assert!(matches!(second, Err(StoreError::InvalidState { .. })));

    first.await.unwrap();
    assert_eq!(store.state(&tom).unwrap(), RecordState::Saved);
    assert_eq!(adapter.count("update person 1"), 1);
}

#[tokio::test]
async fn test_save_all_saves_every_record() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let first = store.create_record("tag", Props::new().attr("label", "a")).unwrap();
    let second = store.create_record("tag", Props::new().attr("label", "b")).unwrap();

    let saved = store.save_all(vec![first.clone(), second.clone()]).await.unwrap();

    assert_eq!(saved, vec![first.clone(), second.clone()]);
    assert_eq!(store.state(&first).unwrap(), RecordState::Saved);
    assert_eq!(store.state(&second).unwrap(), RecordState::Saved);
    assert_ne!(store.id(&first).unwrap(), store.id(&second).unwrap());
}

// --- Rejected saves ---

#[tokio::test]
async fn test_invalid_save_keeps_errors_until_edited() {
    let adapter = ScriptedAdapter::new();
    adapter.fail_saves(Some(AdapterError::Invalid(
        Errors::new().with("name", "is already taken"),
    )));
    let store = store_with(&adapter);
    let tom = store
        .create_record("person", Props::new().attr("name", "Tom"))
        .unwrap();

    let err = store.save(&tom).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert_eq!(store.state(&tom).unwrap(), RecordState::Created(DirtyPhase::Invalid));
    assert!(!store.flags(&tom).unwrap().is_valid);
    assert_eq!(
        store.errors(&tom).unwrap().get("name"),
        Some(&["is already taken".to_string()][..])
    );
    assert_eq!(store.attr(&tom, "name").unwrap(), json!("Tom"));

    // Saving again without touching the invalid attribute is refused.
    let err = store.save(&tom).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));

    store.set_attr(&tom, "name", "Tomster").unwrap();
    assert!(store.flags(&tom).unwrap().is_valid);
    assert!(store.errors(&tom).unwrap().is_empty());
    assert_eq!(store.state(&tom).unwrap(), RecordState::Created(DirtyPhase::Uncommitted));

    adapter.fail_saves(None);
    store.save(&tom).await.unwrap();
    assert_eq!(store.state(&tom).unwrap(), RecordState::Saved);
    assert_eq!(store.attr(&tom, "name").unwrap(), json!("Tomster"));
}

#[tokio::test]
async fn test_adapter_error_can_be_retried() {
    let adapter = ScriptedAdapter::new();
    adapter.fail_saves(Some(AdapterError::failure("connection reset")));
    let store = store_with(&adapter);
    let tom = store.push("person", RecordData::new("1").attr("name", "Tom")).unwrap();
    store.set_attr(&tom, "name", "Tomster").unwrap();

    let err = store.save(&tom).await.unwrap_err();
    assert!(matches!(err, StoreError::Adapter(_)));
    assert_eq!(store.state(&tom).unwrap(), RecordState::Updated(DirtyPhase::Error));
    assert!(store.flags(&tom).unwrap().is_error);
    assert_eq!(store.attr(&tom, "name").unwrap(), json!("Tomster"));

    adapter.fail_saves(None);
    store.save(&tom).await.unwrap();
    assert_eq!(store.state(&tom).unwrap(), RecordState::Saved);
    assert_eq!(store.attr(&tom, "name").unwrap(), json!("Tomster"));
    assert_eq!(adapter.count("update person 1"), 2);
}

// --- Rollback ---

#[tokio::test]
async fn test_rollback_restores_canonical_values() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let tom = store
        .push("person", RecordData::new("1").attr("name", "Tom").attr("age", 30))
        .unwrap();

    store.set_attr(&tom, "name", "Tomster").unwrap();
    store.set_attr(&tom, "age", 31).unwrap();
    assert!(store.flags(&tom).unwrap().is_dirty);

    store.rollback(&tom).unwrap();
    assert_eq!(store.attr(&tom, "name").unwrap(), json!("Tom"));
    assert_eq!(store.attr(&tom, "age").unwrap(), json!(30));
    assert_eq!(store.state(&tom).unwrap(), RecordState::Saved);

    // Nothing to discard.
    store.rollback(&tom).unwrap();
    assert_eq!(store.state(&tom).unwrap(), RecordState::Saved);
}

#[tokio::test]
async fn test_setting_the_canonical_value_makes_record_clean() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let tom = store.push("person", RecordData::new("1").attr("name", "Tom")).unwrap();

    store.set_attr(&tom, "name", "Tomster").unwrap();
    assert_eq!(store.state(&tom).unwrap(), RecordState::Updated(DirtyPhase::Uncommitted));

    store.set_attr(&tom, "name", "Tom").unwrap();
    assert_eq!(store.state(&tom).unwrap(), RecordState::Saved);
    assert!(store.changed_attributes(&tom).unwrap().is_empty());
}

#[tokio::test]
async fn test_rollback_of_new_record_removes_it() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let people = store.all("person").unwrap();
    let draft = store
        .create_record("person", Props::new().attr("name", "Draft"))
        .unwrap();
    assert_eq!(people.len(), 1);

    store.rollback(&draft).unwrap();

    assert_eq!(store.state(&draft).unwrap(), RecordState::Deleted(DeletedPhase::Saved));
    assert!(people.is_empty());
    assert!(adapter.calls().is_empty());
}

// --- Reload ---

#[tokio::test]
async fn test_reload_replaces_canonical_data() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let tom = store.push("person", RecordData::new("1").attr("name", "Tom")).unwrap();
    adapter.seed("person", RecordData::new("1").attr("name", "Thomas"));

    let first = store.reload(&tom);
    assert!(store.is_reloading(&tom).unwrap());
    let second = store.reload(&tom).await;
    assert!(matches!(second, Err(StoreError::InvalidState { .. })));
    let save = store.save(&tom).await;
    assert!(matches!(save, Err(StoreError::InvalidState { .. })));

    first.await.unwrap();
    assert!(!store.is_reloading(&tom).unwrap());
    assert_eq!(store.attr(&tom, "name").unwrap(), json!("Thomas"));
    assert_eq!(store.state(&tom).unwrap(), RecordState::Saved);
    assert_eq!(adapter.count("find person 1"), 1);
}

#[tokio::test]
async fn test_reload_keeps_local_edits() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let tom = store
        .push("person", RecordData::new("1").attr("name", "Tom").attr("age", 30))
        .unwrap();
    adapter.seed("person", RecordData::new("1").attr("name", "Thomas").attr("age", 30));
    store.set_attr(&tom, "age", 31).unwrap();

    store.reload(&tom).await.unwrap();

    assert_eq!(store.attr(&tom, "name").unwrap(), json!("Thomas"));
    assert_eq!(store.attr(&tom, "age").unwrap(), json!(31));
    assert_eq!(store.state(&tom).unwrap(), RecordState::Updated(DirtyPhase::Uncommitted));
}

#[tokio::test]
async fn test_failed_reload_marks_clean_record_errored() {
    let adapter = ScriptedAdapter::new();
    adapter.fail_finds(Some(AdapterError::failure("offline")));
    let store = store_with(&adapter);
    let tom = store.push("person", RecordData::new("1").attr("name", "Tom")).unwrap();

    let err = store.reload(&tom).await.unwrap_err();
    assert!(matches!(err, StoreError::Adapter(_)));
    assert_eq!(store.state(&tom).unwrap(), RecordState::Error);
    assert!(!store.is_reloading(&tom).unwrap());

    adapter.fail_finds(None);
    adapter.seed("person", RecordData::new("1").attr("name", "Tom"));
    store.reload(&tom).await.unwrap();
    assert_eq!(store.state(&tom).unwrap(), RecordState::Saved);
}

// --- Deletion ---

#[tokio::test]
async fn test_committed_delete_removes_record() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let tom = store.push("person", RecordData::new("1").attr("name", "Tom")).unwrap();
    let people = store.all("person").unwrap();
    assert_eq!(people.len(), 1);

    store.delete_record(&tom).unwrap();
    assert!(store.flags(&tom).unwrap().is_deleted);
    assert!(store.flags(&tom).unwrap().is_dirty);
    assert!(people.is_empty());
    assert_eq!(store.peek("person", "1"), Some(tom.clone()));

    store.save(&tom).await.unwrap();
    assert_eq!(adapter.calls(), vec!["delete person 1".to_string()]);
    assert_eq!(store.state(&tom).unwrap(), RecordState::Deleted(DeletedPhase::Saved));
    assert!(store.peek("person", "1").is_none());

    // Saving the tombstone again is a no-op.
    store.save(&tom).await.unwrap();
    assert_eq!(adapter.count("delete"), 1);
}

#[tokio::test]
async fn test_deleting_unsaved_record_skips_adapter() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let draft = store.create_record("person", Props::new()).unwrap();

    store.destroy_record(&draft).await.unwrap();

    assert_eq!(store.state(&draft).unwrap(), RecordState::Deleted(DeletedPhase::Saved));
    assert!(adapter.calls().is_empty());
    assert!(store.all("person").unwrap().is_empty());
}

#[tokio::test]
async fn test_rolled_back_delete_returns_record() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let tom = store.push("person", RecordData::new("1")).unwrap();
    let people = store.all("person").unwrap();

    store.delete_record(&tom).unwrap();
    assert!(people.is_empty());
    store.rollback(&tom).unwrap();

    assert_eq!(store.state(&tom).unwrap(), RecordState::Saved);
    assert_eq!(people.to_vec(), vec![tom]);
}

// --- Unloading ---

#[tokio::test]
async fn test_unload_requires_clean_record() {
    let adapter = ScriptedAdapter::new();
    adapter.seed("person", RecordData::new("1").attr("name", "Tom"));
    let store = store_with(&adapter);
    let tom = store.find("person", "1").await.unwrap();

    store.set_attr(&tom, "name", "Tomster").unwrap();
    let err = store.unload(&tom).unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));

    store.rollback(&tom).unwrap();
    store.unload(&tom).unwrap();
    assert!(store.peek("person", "1").is_none());
    assert!(store.all("person").unwrap().is_empty());

    let again = store.find("person", "1").await.unwrap();
    assert_ne!(again, tom);
    assert_eq!(adapter.count("find person 1"), 2);
}

#[tokio::test]
async fn test_unload_all_is_all_or_nothing() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let first = store.push("tag", RecordData::new("1")).unwrap();
    let second = store.push("tag", RecordData::new("2")).unwrap();
    store.set_attr(&second, "label", "dirty").unwrap();

    assert!(store.unload_all("tag").is_err());
    assert!(store.has_record_for_id("tag", "1"));

    store.rollback(&second).unwrap();
    store.unload_all("tag").unwrap();
    assert!(!store.has_record_for_id("tag", "1"));
    assert!(!store.has_record_for_id("tag", "2"));
    assert_eq!(store.state(&first).unwrap(), RecordState::Deleted(DeletedPhase::Saved));
}

#[tokio::test]
async fn test_unloaded_record_leaves_placeholder_behind_inverse_less_reference() {
    let adapter = ScriptedAdapter::new();
    adapter.seed("tag", RecordData::new("1").attr("label", "rust"));
    let store = store_with(&adapter);
    let tag = store
        .push("tag", RecordData::new("1").attr("label", "rust"))
        .unwrap();
    let post = store
        .push("post", RecordData::new("1").has_many("tags", ["1"]))
        .unwrap();
    assert_eq!(store.has_many(&post, "tags").unwrap(), vec![tag.clone()]);

    store.unload(&tag).unwrap();

    let placeholder = store.record_for("tag", "1").unwrap();
    assert_ne!(placeholder, tag);
    assert_eq!(store.state(&placeholder).unwrap(), RecordState::Empty);
    let err = store.has_many(&post, "tags").unwrap_err();
    assert!(matches!(err, StoreError::Assertion(_)));

    let reloaded = store.fetch_has_many(&post, "tags").await.unwrap();
    assert_eq!(reloaded, vec![placeholder]);
    assert_eq!(adapter.calls(), vec!["find_many tag 1".to_string()]);
}

#[tokio::test]
async fn test_unload_all_keeps_only_what_is_still_referenced() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let tags = store
        .push_many(
            "tag",
            vec![
                RecordData::new("1").attr("label", "rust"),
                RecordData::new("2").attr("label", "go"),
                RecordData::new("3").attr("label", "zig"),
            ],
        )
        .unwrap();
    store
        .push("post", RecordData::new("1").has_many("tags", ["1", "2"]))
        .unwrap();

    store.unload_all("tag").unwrap();

    for tag in &tags {
        assert_eq!(store.state(tag).unwrap(), RecordState::Deleted(DeletedPhase::Saved));
        let err = store.attr(tag, "label").unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));
        assert!(store.snapshot(tag).is_err());
    }
    let placeholder = store.record_for("tag", "2").unwrap();
    assert_ne!(placeholder, tags[1]);
    assert_eq!(store.state(&placeholder).unwrap(), RecordState::Empty);
    assert!(!store.has_record_for_id("tag", "3"));
    // The post and the placeholders for tags 1 and 2.
    assert!(format!("{:?}", store).contains("records: 3"));
}

// --- Events ---

#[tokio::test]
async fn test_lifecycle_events_are_published() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let events = store.subscribe(SubscriptionFilter::all());

    let tom = store
        .create_record("person", Props::new().attr("name", "Tom"))
        .unwrap();
    store.save(&tom).await.unwrap();

    let events = events.drain();
    let transitions: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            StoreEvent::StateChanged { record, to, .. }
                if record.client_id == tom.client_id() =>
            {
                Some(to.as_str())
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec!["root.loaded.created.inFlight", "root.loaded.saved"]
    );

    let created = events
        .iter()
        .find_map(|event| match event {
            StoreEvent::RecordCreated { record } => Some(record),
            _ => None,
        })
        .unwrap();
    assert_eq!(created.id, Some(RecordId::from("1")));
    assert_eq!(created.state, "root.loaded.saved");
}

#[tokio::test]
async fn test_failed_save_publishes_error_event() {
    let adapter = ScriptedAdapter::new();
    adapter.fail_saves(Some(AdapterError::failure("boom")));
    let store = store_with(&adapter);
    let events = store.subscribe(SubscriptionFilter::lifecycle());
    let tom = store.push("person", RecordData::new("1")).unwrap();

    assert!(store.save(&tom).await.is_err());

    let message = events
        .drain()
        .into_iter()
        .find_map(|event| match event {
            StoreEvent::RecordBecameError { message, .. } => Some(message),
            _ => None,
        })
        .unwrap();
    assert!(message.contains("boom"));
}

#[tokio::test]
async fn test_setting_the_same_value_publishes_nothing() {
    let adapter = ScriptedAdapter::new();
    let store = store_with(&adapter);
    let tom = store.push("person", RecordData::new("1").attr("name", "Tom")).unwrap();
    let events = store.subscribe(SubscriptionFilter::record_types(vec!["person".to_string()]));

    store.set_attr(&tom, "name", "Tom").unwrap();
    assert!(events.drain().is_empty());
    assert_eq!(store.state(&tom).unwrap(), RecordState::Saved);

    store.set_attr(&tom, "name", "Tomster").unwrap();
    store.set_attr(&tom, "name", "Tomster").unwrap();
    let changes = events
        .drain()
        .into_iter()
        .filter(|event| matches!(event, StoreEvent::RecordChanged { .. }))
        .count();
    assert_eq!(changes, 1);
}
