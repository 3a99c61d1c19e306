//! Closed-group polling through an assembled node.

use std::time::Duration;

use threadlink_protocol::RawMessage;

use crate::harness::{raw_group_message, TestNode};

#[tokio::test(start_paused = true)]
async fn test_start_polls_known_groups_and_enqueues() {
    let t = TestNode::new("me");
    t.storage.get_or_create_group_thread("g1").unwrap();
    t.storage.get_or_create_group_thread("g2").unwrap();
    t.swarm.push("g1", raw_group_message("h1", "g1", "alice"));
    t.swarm.push("g1", raw_group_message("h2", "g1", "bob"));
    t.swarm.push(
        "g1",
        RawMessage {
            hash: "junk".into(),
            data: vec![0xff; 8],
            expiration_ms: None,
        },
    );

    t.node.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(t.node.polling.is_polling("g1").await);
    assert!(t.node.polling.is_polling("g2").await);
    assert_eq!(t.storage.pending_inbound(10).unwrap().len(), 2);
    assert_eq!(
        t.node.polling.poll_state("g1").await.unwrap().cursor.as_deref(),
        Some("junk")
    );

    t.node.shutdown().await;
    assert!(!t.node.polling.is_polling("g1").await);
}

#[tokio::test(start_paused = true)]
async fn test_quiet_group_polls_at_maximum_interval() {
    let t = TestNode::new("me");
    t.node.polling.start_polling("quiet").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(t.swarm.fetches("quiet"), 1);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(t.swarm.fetches("quiet"), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(t.swarm.fetches("quiet"), 2);

    t.node.polling.stop_polling("quiet").await;
}

#[tokio::test(start_paused = true)]
async fn test_active_group_polls_at_minimum_interval() {
    let t = TestNode::new("me");
    t.swarm.push("busy", raw_group_message("h1", "busy", "alice"));
    t.node.polling.start_polling("busy").await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(t.swarm.fetches("busy") >= 3);

    t.node.polling.stop_polling("busy").await;
}

#[tokio::test(start_paused = true)]
async fn test_configured_bounds_apply() {
    let t = TestNode::with_config("me", |cfg| cfg.polling.max_interval_secs = 10);
    t.node.polling.start_polling("g1").await;
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(t.swarm.fetches("g1"), 2);
    t.node.polling.stop_all().await;
}
