//! Rollout Scenario Tests
//!
//! Drive a full `FleetCoordinator` run against an in-memory network server
//! and simulated devices. Time is paused, so every pacing delay, settle
//! delay and the 300s watchdog elapse instantly and deterministically.

mod common;

use common::{
    config, count, eui, firmware_store, last_position, position, Event, GatewayKnobs, Harness, SimDevice,
};
use lora_fota::firmware::{checksum, decompress, TextPatch};
use lora_fota::fleet::{RolloutError, RolloutPhase};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAIN_V1: &[u8] = b"import os\n\ndef main():\n    print('v1')\n\nmain()\n";
const MAIN_V2: &[u8] = b"import os\n\ndef main():\n    print('v2 with radio fix')\n\nmain()\n";

fn standard_store() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    let v1: &[(&str, &[u8])] = &[
        ("main.py", MAIN_V1),
        ("lib/legacy.py", b"OLD = True\n".as_slice()),
        ("radio.bin", &[1u8, 2, 3][..]),
        ("pymakr.conf", b"{}".as_slice()),
    ];
    let v2: &[(&str, &[u8])] = &[
        ("main.py", MAIN_V2),
        ("lib/sensors.py", b"def read():\n    return 42\n".as_slice()),
        ("radio.bin", &[1u8, 2, 3, 4][..]),
        ("pymakr.conf", b"{\"changed\": true}".as_slice()),
    ];
    firmware_store(tmp.path(), &[("1.0.0", v1), ("1.1.0", v2)]);
    tmp
}

fn three_devices(version: &str) -> Vec<SimDevice> {
    (1..=3).map(|n| SimDevice::new(n, version, "1.1.0")).collect()
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn rollout_updates_whole_fleet() {
    let store = standard_store();
    let devices = three_devices("1.0.0");
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let report = harness.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.target_version.as_str(), "1.1.0");
    assert_eq!(report.from_version.as_ref().map(|v| v.as_str()), Some("1.0.0"));
    assert_eq!(report.updated, vec![eui(1), eui(2), eui(3)]);
    assert!(report.skipped_current.is_empty());
    assert_eq!(
        report.phases,
        vec![
            RolloutPhase::Init,
            RolloutPhase::AwaitVersion,
            RolloutPhase::Negotiate,
            RolloutPhase::Provision,
            RolloutPhase::Deliver,
            RolloutPhase::AwaitCompletion,
            RolloutPhase::Verify,
            RolloutPhase::Done,
        ]
    );

    let manifest = report.manifest.unwrap();
    assert_eq!((manifest.delete, manifest.update, manifest.new), (1, 2, 1));

    assert_eq!(harness.group_creations(), 1);
    assert_eq!(harness.group_deletions(), 1);
    let log = &harness.log;
    assert!(position(log, |e| *e == Event::CreateGroup("1.0.0-1.1.0".into())).is_some());
    assert_eq!(count(log, |e| matches!(e, Event::AddDevice(_))), 3);
    assert_eq!(count(log, |e| *e == Event::Enqueue(9)), 3);
}

#[tokio::test(start_paused = true)]
async fn provisioning_waits_for_every_version_reply() {
    let store = standard_store();
    let mut devices = three_devices("1.0.0");
    // Device 2 only answers its third query.
    devices[1].ignore_queries = 2;
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    harness.run(CancellationToken::new()).await.unwrap();

    let log = &harness.log;
    let last_reply = last_position(log, |e| matches!(e, Event::Uplink(_, 2))).unwrap();
    let created = position(log, |e| matches!(e, Event::CreateGroup(_))).unwrap();
    assert!(created > last_reply);
    assert_eq!(count(log, |e| *e == Event::Unicast(eui(2), 1)), 3);
    assert_eq!(count(log, |e| matches!(e, Event::Uplink(_, 2))), 3);
}

#[tokio::test(start_paused = true)]
async fn delivery_waits_for_every_listener_and_resends_keys_once() {
    let store = standard_store();
    let mut devices = three_devices("1.0.0");
    // Device 3 misses the first key delivery.
    devices[2].ignore_keys = 1;
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    harness.run(CancellationToken::new()).await.unwrap();

    let log = &harness.log;
    assert_eq!(count(log, |e| *e == Event::Unicast(eui(3), 3)), 2);
    assert_eq!(count(log, |e| *e == Event::Unicast(eui(1), 3)), 1);
    let last_listening = last_position(log, |e| matches!(e, Event::Uplink(_, 4))).unwrap();
    let first_frame = position(log, |e| matches!(e, Event::Enqueue(_))).unwrap();
    assert!(first_frame > last_listening);
}

#[tokio::test(start_paused = true)]
async fn queue_drains_before_group_deletion() {
    let store = standard_store();
    let devices = three_devices("1.0.0");
    let knobs = GatewayKnobs {
        queue_length_failures: 2,
        ..Default::default()
    };
    let mut harness = Harness::new(config(store.path(), &devices), devices, knobs);

    harness.run(CancellationToken::new()).await.unwrap();

    let log = &harness.log;
    let drained = position(log, |e| *e == Event::QueueLength(0)).unwrap();
    let deleted = position(log, |e| matches!(e, Event::DeleteGroup(_))).unwrap();
    let last_enqueue = last_position(log, |e| matches!(e, Event::Enqueue(_))).unwrap();
    assert!(last_enqueue < drained);
    assert!(drained < deleted);
    assert_eq!(harness.group_deletions(), 1);
}

#[tokio::test(start_paused = true)]
async fn devices_receive_patches_that_rebuild_the_target_tree() {
    let store = standard_store();
    let devices = three_devices("1.0.0");
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    harness.run(CancellationToken::new()).await.unwrap();

    let received = harness.received.lock().unwrap().clone();
    assert_eq!(received.deleted, vec!["lib/legacy.py".to_string()]);
    assert_eq!(received.manifests, vec![r#"{"delete":1,"update":2,"new":1}"#.to_string(); 3]);
    assert!(!received.files.contains_key("pymakr.conf"));

    let (full, compressed, digest) = &received.files["main.py"];
    assert!(!full);
    let patch_text = String::from_utf8(decompress(compressed).unwrap()).unwrap();
    assert_eq!(&checksum(patch_text.as_bytes()), digest);
    let rebuilt = TextPatch::from_text(&patch_text)
        .unwrap()
        .apply(std::str::from_utf8(MAIN_V1).unwrap())
        .unwrap();
    assert_eq!(rebuilt.as_bytes(), MAIN_V2);

    let (_, compressed, _) = &received.files["lib/sensors.py"];
    let patch_text = String::from_utf8(decompress(compressed).unwrap()).unwrap();
    let created = TextPatch::from_text(&patch_text).unwrap().apply("").unwrap();
    assert_eq!(created, "def read():\n    return 42\n");

    let (full, compressed, digest) = &received.files["radio.bin"];
    assert!(full);
    let content = decompress(compressed).unwrap();
    assert_eq!(content, vec![1, 2, 3, 4]);
    assert_eq!(&checksum(&content), digest);
}

// ============================================================================
// Already current
// ============================================================================

#[tokio::test(start_paused = true)]
async fn fleet_already_current_ends_without_group() {
    let store = standard_store();
    let devices = three_devices("1.1.0");
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let report = harness.run(CancellationToken::new()).await.unwrap();

    assert!(report.nothing_to_do());
    assert_eq!(report.skipped_current.len(), 3);
    assert!(report.from_version.is_none());
    assert_eq!(harness.group_creations(), 0);
    assert_eq!(harness.group_deletions(), 0);
}

#[tokio::test(start_paused = true)]
async fn current_devices_are_pruned_from_the_rollout() {
    let store = standard_store();
    let mut devices = three_devices("1.0.0");
    devices[0].version = "1.1.0".into();
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let report = harness.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.skipped_current, vec![eui(1)]);
    assert_eq!(report.updated, vec![eui(2), eui(3)]);
    assert_eq!(count(&harness.log, |e| matches!(e, Event::AddDevice(_))), 2);
    assert_eq!(count(&harness.log, |e| *e == Event::Unicast(eui(1), 3)), 0);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn version_disagreement_fails_before_provisioning() {
    let store = standard_store();
    let mut devices = three_devices("1.0.0");
    devices[1].version = "0.9.0".into();
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let err = harness.run(CancellationToken::new()).await.unwrap_err();

    match err {
        RolloutError::VersionDisagreement { divergent, reported } => {
            assert_eq!(divergent, vec![eui(2)]);
            assert_eq!(reported.len(), 3);
        }
        other => panic!("expected disagreement, got {other}"),
    }
    assert_eq!(harness.group_creations(), 0);
    assert_eq!(harness.group_deletions(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_device_trips_the_watchdog() {
    let store = standard_store();
    let mut devices = three_devices("1.0.0");
    devices[2].ignore_queries = usize::MAX;
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let start = tokio::time::Instant::now();
    let err = harness.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        err,
        RolloutError::WatchdogExpired {
            phase: RolloutPhase::AwaitVersion
        }
    ));
    assert!(start.elapsed() >= Duration::from_secs(300));
    assert_eq!(harness.group_creations(), 0);
}

#[tokio::test(start_paused = true)]
async fn watchdog_after_provisioning_deletes_group_exactly_once() {
    let store = standard_store();
    let mut devices = three_devices("1.0.0");
    devices[0].ignore_keys = usize::MAX;
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let err = harness.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        err,
        RolloutError::WatchdogExpired {
            phase: RolloutPhase::Provision
        }
    ));
    assert_eq!(harness.group_creations(), 1);
    assert_eq!(harness.group_deletions(), 1);
    assert_eq!(count(&harness.log, |e| matches!(e, Event::Enqueue(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn watchdog_during_verify_keeps_single_group_deletion() {
    let store = standard_store();
    let mut devices = three_devices("1.0.0");
    // Device 3 never reports its post-update version.
    devices[2].final_version = None;
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let err = harness.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        err,
        RolloutError::WatchdogExpired {
            phase: RolloutPhase::Verify
        }
    ));
    assert_eq!(harness.group_creations(), 1);
    assert_eq!(harness.group_deletions(), 1);
    let drained = position(&harness.log, |e| *e == Event::QueueLength(0)).unwrap();
    let deleted = position(&harness.log, |e| matches!(e, Event::DeleteGroup(_))).unwrap();
    assert!(drained < deleted);
}

#[tokio::test(start_paused = true)]
async fn partial_failure_names_the_failing_device() {
    let store = standard_store();
    let mut devices = three_devices("1.0.0");
    devices[1].final_version = Some("1.0.0".into());
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let err = harness.run(CancellationToken::new()).await.unwrap_err();

    match err {
        RolloutError::PartialFailure { failed } => assert_eq!(failed, vec![eui(2)]),
        other => panic!("expected partial failure, got {other}"),
    }
    assert_eq!(harness.group_deletions(), 1);
}

#[tokio::test(start_paused = true)]
async fn total_failure_is_reported_distinctly() {
    let store = standard_store();
    let devices: Vec<SimDevice> = (1..=2).map(|n| SimDevice::new(n, "1.0.0", "1.0.0")).collect();
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let err = harness.run(CancellationToken::new()).await.unwrap_err();

    match err {
        RolloutError::AllDevicesFailed { devices } => assert_eq!(devices, vec![eui(1), eui(2)]),
        other => panic!("expected total failure, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn enqueue_failure_cleans_up_the_group() {
    let store = standard_store();
    let devices = three_devices("1.0.0");
    let knobs = GatewayKnobs {
        fail_enqueue_at: Some(3),
        ..Default::default()
    };
    let mut harness = Harness::new(config(store.path(), &devices), devices, knobs);

    let err = harness.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, RolloutError::Delivery(_)));
    assert_eq!(count(&harness.log, |e| matches!(e, Event::Enqueue(_))), 3);
    assert_eq!(harness.group_deletions(), 1);
}

#[tokio::test(start_paused = true)]
async fn group_creation_failure_is_fatal_without_deletion() {
    let store = standard_store();
    let devices = three_devices("1.0.0");
    let knobs = GatewayKnobs {
        fail_create: true,
        ..Default::default()
    };
    let mut harness = Harness::new(config(store.path(), &devices), devices, knobs);

    let err = harness.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, RolloutError::Gateway(_)));
    assert_eq!(harness.group_deletions(), 0);
}

#[tokio::test(start_paused = true)]
async fn operator_interrupt_runs_cleanup() {
    let store = standard_store();
    let mut devices = three_devices("1.0.0");
    devices[0].ignore_keys = usize::MAX;
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(120)).await;
        trigger.cancel();
    });

    let err = harness.run(cancel).await.unwrap_err();

    assert!(matches!(err, RolloutError::Cancelled));
    assert_eq!(harness.group_creations(), 1);
    assert_eq!(harness.group_deletions(), 1);
}

// ============================================================================
// Store edge cases
// ============================================================================

#[tokio::test(start_paused = true)]
async fn first_install_sends_every_file() {
    let store = standard_store();
    let devices = three_devices("0.5.0");
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let report = harness.run(CancellationToken::new()).await.unwrap();

    let manifest = report.manifest.unwrap();
    assert_eq!((manifest.delete, manifest.update, manifest.new), (0, 0, 3));
    let received = harness.received.lock().unwrap().clone();
    assert!(received.deleted.is_empty());
    assert_eq!(received.files.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn empty_store_is_fatal() {
    let store = tempfile::tempdir().unwrap();
    let devices = three_devices("1.0.0");
    let mut harness = Harness::new(config(store.path(), &devices), devices, GatewayKnobs::default());

    let err = harness.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, RolloutError::Store(_)));
    assert_eq!(count(&harness.log, |e| matches!(e, Event::Unicast(..))), 0);
}
