//! Outbox end-to-end: exactly-once production, dispatch with retries, and
//! transactional coupling with business writes.

mod common;

use common::{service, service_with_config};
use ontos::{
    Document, EventSpec, OntosConfig, OntosError, OutboxStatus, IDEMPOTENCY_HEADER,
};
use ontos::DocStore;
use serde_json::json;

#[test]
fn exactly_once_producer_with_explicit_key() {
    let (store, bus, service) = service();
    let outbox = service.outbox();

    // Two publishes with the same idempotency key inside one transaction
    let mut ids = Vec::new();
    store
        .txn(&mut |t| {
            let spec = EventSpec::new("com.oms.schema.created", json!({"name": "Person"}))
                .idempotency_key("k1");
            ids.push(outbox.publish_event(t, spec.clone())?);
            ids.push(outbox.publish_event(t, spec)?);
            Ok(())
        })
        .unwrap();

    assert_eq!(ids[0], ids[1]);
    assert_eq!(store.collection_len("outbox_events"), 1);

    // The dispatcher delivers exactly one message
    let dispatcher = service.dispatcher();
    dispatcher.run_once().unwrap();
    assert_eq!(bus.published_count(), 1);

    let published = bus.published.lock();
    let (_, _, headers) = &published[0];
    assert!(headers.contains(&(IDEMPOTENCY_HEADER.to_string(), "k1".to_string())));
}

#[test]
fn business_rollback_discards_the_event() {
    let (store, bus, service) = service();
    let outbox = service.outbox();

    let result = store.txn(&mut |t| {
        t.insert("schemas", Document::new("s1", json!({"name": "Person"})))?;
        outbox.publish_event(t, EventSpec::new("com.oms.schema.created", json!({})))?;
        Err(OntosError::transient("constraint violation"))
    });
    assert!(result.is_err());

    assert_eq!(store.collection_len("schemas"), 0);
    assert_eq!(store.collection_len("outbox_events"), 0);

    service.dispatcher().run_once().unwrap();
    assert_eq!(bus.published_count(), 0);
}

#[test]
fn business_commit_guarantees_delivery() {
    let (store, bus, service) = service();
    let outbox = service.outbox();

    store
        .txn(&mut |t| {
            t.insert("schemas", Document::new("s1", json!({"name": "Person"})))?;
            outbox.publish_event(
                t,
                EventSpec::new("com.oms.schema.created", json!({"name": "Person"})),
            )?;
            Ok(())
        })
        .unwrap();

    service.dispatcher().run_once().unwrap();
    assert_eq!(bus.published_count(), 1);
    assert_eq!(store.collection_len("schemas"), 1);
}

#[test]
fn transient_bus_failure_retries_until_success() {
    let mut config = OntosConfig::default();
    config.outbox.retry_base_delay_ms = 0;
    config.outbox.retry_cap_ms = 0;
    let (_, bus, service) = service_with_config(config);

    let id = service
        .outbox()
        .publish(EventSpec::new("com.oms.schema.created", json!({})))
        .unwrap();
    let dispatcher = service.dispatcher();

    bus.set_failing(true);
    dispatcher.run_once().unwrap();
    assert_eq!(
        service.outbox().get_record(id).unwrap().unwrap().status,
        OutboxStatus::Failed
    );

    bus.set_failing(false);
    dispatcher.run_once().unwrap();
    assert_eq!(
        service.outbox().get_record(id).unwrap().unwrap().status,
        OutboxStatus::Completed
    );
    assert_eq!(bus.published_count(), 1);
}

#[test]
fn poison_pill_dead_letters_and_audits() {
    let mut config = OntosConfig::default();
    config.outbox.retry_base_delay_ms = 0;
    config.outbox.retry_cap_ms = 0;
    config.outbox.max_retries = 2;
    let (_, bus, service) = service_with_config(config);

    let id = service
        .outbox()
        .publish(EventSpec::new("com.oms.schema.created", json!({})))
        .unwrap();
    bus.set_failing(true);

    let dispatcher = service.dispatcher();
    dispatcher.run_once().unwrap();
    dispatcher.run_once().unwrap();

    let record = service.outbox().get_record(id).unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::DeadLetter);
    assert_eq!(record.retry_count, 2);

    // The dead letter is observable in stats and audited, and the queue
    // is not blocked
    let stats = service.outbox().statistics().unwrap();
    assert_eq!(stats.dead_letter, 1);

    let page = service
        .audit()
        .query(&ontos::AuditFilter {
            actions: vec!["outbox.dead_letter".to_string()],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.total_count, 1);
    assert!(!page.events[0].event.success);

    assert_eq!(dispatcher.run_once().unwrap(), 0);
}

#[test]
fn content_derived_keys_deduplicate_identical_events() {
    let (store, _, service) = service();
    let outbox = service.outbox();

    let first = outbox
        .publish(
            EventSpec::new("com.oms.schema.created", json!({"name": "Person"}))
                .subject("schema/Person"),
        )
        .unwrap();
    let second = outbox
        .publish(
            EventSpec::new("com.oms.schema.created", json!({"name": "Person"}))
                .subject("schema/Person"),
        )
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(store.collection_len("outbox_events"), 1);

    // A different payload is a different event
    let third = outbox
        .publish(
            EventSpec::new("com.oms.schema.created", json!({"name": "Order"}))
                .subject("schema/Order"),
        )
        .unwrap();
    assert_ne!(first, third);
}

#[test]
fn service_operations_stage_events_for_delivery() {
    let (_, bus, service) = service();
    let actor = ontos::Actor::user("u-1", "alice");

    service
        .commit_schema("main", json!({"v": 1}), &actor, "init", None)
        .unwrap();
    service.create_branch("feature", "main", &actor).unwrap();

    service.dispatcher().run_once().unwrap();

    let published = bus.published.lock();
    let subjects: Vec<&str> = published.iter().map(|(s, _, _)| s.as_str()).collect();
    assert!(subjects.contains(&"oms.com_oms_schema_updated"));
    assert!(subjects.contains(&"oms.com_oms_branch_created"));
}

#[test]
fn cleanup_preserves_dead_letters() {
    let mut config = OntosConfig::default();
    config.outbox.max_retries = 0;
    config.outbox.retry_base_delay_ms = 0;
    config.outbox.retry_cap_ms = 0;
    let (store, bus, service) = service_with_config(config);
    let outbox = service.outbox();

    let dispatcher = service.dispatcher();

    let delivered = outbox
        .publish(EventSpec::new("t", json!({"n": 1})))
        .unwrap();
    dispatcher.run_once().unwrap();
    assert_eq!(
        outbox.get_record(delivered).unwrap().unwrap().status,
        OutboxStatus::Completed
    );

    let poisoned = outbox
        .publish(EventSpec::new("t", json!({"n": 2})))
        .unwrap();
    bus.set_failing(true);
    dispatcher.run_once().unwrap();
    assert_eq!(
        outbox.get_record(poisoned).unwrap().unwrap().status,
        OutboxStatus::DeadLetter
    );

    // Backdate the completion so it ages out; the dead letter survives
    let mut record = outbox.get_record(delivered).unwrap().unwrap();
    record.processed_at = Some(ontos::now_utc() - chrono::Duration::hours(48));
    store
        .replace(
            "outbox_events",
            Document::from_record(delivered.to_string(), &record).unwrap(),
        )
        .unwrap();

    assert_eq!(outbox.cleanup_completed(24).unwrap(), 1);
    assert!(outbox.get_record(delivered).unwrap().is_none());
    assert_eq!(
        outbox.get_record(poisoned).unwrap().unwrap().status,
        OutboxStatus::DeadLetter
    );
}
