//! End-to-end capture: live hash writes flow through the monitor and the
//! storer into the fjall keyspace.

mod common;

use common::{
    fields, open_backup, quiet_config, start_mirror, test_config, wait_for_capture_ready,
    wait_until, AdminClient,
};
use holo_mirror::{LiveClients, MirrorNode};

#[tokio::test]
async fn captured_hash_is_persisted() {
    let mirror = start_mirror(test_config()).await;
    wait_for_capture_ready(&mirror, "warmup").await;

    let record = fields(&[("version", "1"), ("a", "x")]);
    mirror.live.hset("u1", &record);
    wait_until("u1 persisted", || {
        matches!(mirror.backup.load("u1"), Ok(Some(ref f)) if *f == record)
    })
    .await;

    let blob = mirror.backup.load_raw("u1").unwrap().unwrap();
    assert_eq!(blob, br#"{"a":"x","version":"1"}"#.to_vec());
    mirror.node.stop().await.unwrap();
}

#[tokio::test]
async fn repeated_updates_converge_to_latest_state() {
    let mirror = start_mirror(test_config()).await;
    wait_for_capture_ready(&mirror, "warmup").await;

    for v in 1..=20 {
        mirror
            .live
            .hset("counter", &fields(&[("version", &format!("{v:03}"))]));
    }
    wait_until("latest version persisted", || {
        matches!(mirror.backup.version("counter"), Ok(Some(Some(ref v))) if v == "020")
    })
    .await;
    mirror.node.stop().await.unwrap();
}

#[tokio::test]
async fn non_hash_keys_are_not_persisted() {
    let mirror = start_mirror(test_config()).await;
    wait_for_capture_ready(&mirror, "warmup").await;
    let stats = mirror.node.stats();

    mirror.live.set_text("plain", "value");
    wait_until("non-hash skipped", || stats.snapshot().skipped >= 1).await;
    assert!(mirror.backup.load_raw("plain").unwrap().is_none());
    mirror.node.stop().await.unwrap();
}

#[tokio::test]
async fn capture_resumes_after_subscription_loss() {
    let mirror = start_mirror(test_config()).await;
    wait_for_capture_ready(&mirror, "warmup").await;

    mirror.live.fail_next_subscribes(2);
    mirror.live.drop_subscriptions();
    wait_for_capture_ready(&mirror, "after_reconnect").await;

    assert!(mirror.node.stats().snapshot().monitor_reconnects >= 1);
    mirror.node.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_queued_keys() {
    let mirror = start_mirror(quiet_config()).await;
    for i in 0..200 {
        mirror
            .live
            .hset(&format!("user:{i:04}"), &fields(&[("version", "1")]));
    }

    let mut admin = AdminClient::connect(mirror.node.admin_addr()).await;
    assert_eq!(admin.send_command(&["sync_all"]).await.unwrap(), "200");
    drop(admin);
    mirror.node.stop().await.unwrap();

    assert_eq!(mirror.backup.count().unwrap(), 200);
}

#[tokio::test]
async fn backup_survives_restart() {
    let mirror = start_mirror(test_config()).await;
    wait_for_capture_ready(&mirror, "warmup").await;
    mirror.live.hset("u1", &fields(&[("version", "7"), ("name", "ada")]));
    wait_until("u1 persisted", || {
        matches!(mirror.backup.version("u1"), Ok(Some(Some(ref v))) if v == "7")
    })
    .await;

    let common::TestMirror {
        live,
        backup,
        node,
        dir,
    } = mirror;
    node.stop().await.unwrap();
    drop(backup);

    let reopened = open_backup(dir.path());
    assert_eq!(
        reopened.load("u1").unwrap(),
        Some(fields(&[("version", "7"), ("name", "ada")]))
    );

    // A fresh node over the same keyspace restores into an emptied live store.
    live.forget("u1");
    let node = MirrorNode::start(&quiet_config(), LiveClients::shared(live.clone()), reopened)
        .await
        .unwrap();
    let mut admin = AdminClient::connect(node.admin_addr()).await;
    let out = admin.send_command(&["restore_one", "u1"]).await.unwrap();
    assert!(out.starts_with("set key:u1"), "{out}");
    assert_eq!(live.hash("u1"), Some(fields(&[("version", "7"), ("name", "ada")])));
    drop(admin);
    node.stop().await.unwrap();
}
