//! Outgoing fan-out across linked devices.

use threadlink_node::router::{DestinationOutcome, RouterError};
use threadlink_protocol::{DeviceLink, HandshakeState, MessageKind, OutgoingMessage, HANDSHAKE_BODY};

use crate::harness::TestNode;

#[tokio::test]
async fn test_message_reaches_every_trusted_device() {
    let t = TestNode::new("me");
    t.directory.add(DeviceLink::between("bob", "bob-phone"));
    t.directory.add(DeviceLink::between("bob", "bob-laptop"));
    for id in ["bob", "bob-phone", "bob-laptop"] {
        t.trust(id);
    }

    let msg = OutgoingMessage::to_contact("bob", "hello").with_certificate(vec![7, 7]);
    let report = t.node.router.route_to_all_devices(msg.clone()).await.unwrap();

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.outcomes.iter().filter(|(d, _)| d.is_master).count(), 1);
    for id in ["bob", "bob-phone", "bob-laptop"] {
        let sent = t.sender.sent_to(id);
        assert_eq!(sent.len(), 1, "{id} should receive exactly one copy");
        assert_eq!(sent[0].content, b"hello");
        assert_eq!(sent[0].certificate, Some(vec![7, 7]));
        assert_eq!(sent[0].timestamp_ms, msg.timestamp_ms);
        assert_eq!(sent[0].message_id, msg.message_id);
    }

    // Each device copy is recorded against that device's own thread
    let phone_thread = t.storage.contact_thread("bob-phone").unwrap().unwrap();
    assert_eq!(t.sender.sent_to("bob-phone")[0].thread_id, phone_thread.id);
}

#[tokio::test]
async fn test_sending_to_a_slave_reaches_its_master() {
    let t = TestNode::new("me");
    t.directory.add(DeviceLink::between("bob", "bob-phone"));
    t.trust("bob");
    t.trust("bob-phone");

    t.node
        .router
        .route_to_all_devices(OutgoingMessage::to_contact("bob-phone", "hi"))
        .await
        .unwrap();

    assert_eq!(t.sender.sent_to("bob").len(), 1);
    assert_eq!(t.sender.sent_to("bob-phone").len(), 1);
}

#[tokio::test]
async fn test_first_contact_with_new_device_sends_handshake_once() {
    let t = TestNode::new("me");
    t.directory.add(DeviceLink::between("bob", "bob-phone"));
    t.trust("bob");

    let report = t
        .node
        .router
        .route_to_all_devices(OutgoingMessage::to_contact("bob", "one"))
        .await
        .unwrap();
    assert_eq!(report.outcome_for("bob-phone"), Some(DestinationOutcome::HandshakeSent));

    let handshake = &t.sender.sent_to("bob-phone")[0];
    assert_eq!(handshake.kind, MessageKind::Handshake);
    assert_eq!(handshake.content, HANDSHAKE_BODY.as_bytes());

    // Let the post-send transition land
    for _ in 0..50 {
        if t.storage.handshake_state("bob-phone").unwrap() == HandshakeState::RequestSent {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(t.storage.handshake_state("bob-phone").unwrap(), HandshakeState::RequestSent);

    // A second message while the request is outstanding does not re-send
    let report = t
        .node
        .router
        .route_to_all_devices(OutgoingMessage::to_contact("bob", "two"))
        .await
        .unwrap();
    assert_eq!(
        report.outcome_for("bob-phone"),
        Some(DestinationOutcome::SkippedPendingHandshake)
    );
    assert_eq!(t.sender.sent_to("bob-phone").len(), 1);
    assert_eq!(t.sender.sent_to("bob").len(), 2);
}

#[tokio::test]
async fn test_lapsed_handshake_is_sent_again() {
    let t = TestNode::new("me");
    t.directory.add(DeviceLink::between("bob", "bob-phone"));
    t.trust("bob");
    t.storage.get_or_create_contact_thread("bob-phone", true).unwrap();
    t.storage
        .write_handshake_state("bob-phone", HandshakeState::RequestSent, Some(1))
        .unwrap();

    let report = t
        .node
        .router
        .route_to_all_devices(OutgoingMessage::to_contact("bob", "hi"))
        .await
        .unwrap();

    assert_eq!(report.outcome_for("bob-phone"), Some(DestinationOutcome::HandshakeSent));
    assert_eq!(t.sender.sent_to("bob-phone")[0].kind, MessageKind::Handshake);
}

#[tokio::test]
async fn test_start_expires_lapsed_handshakes() {
    let t = TestNode::new("me");
    for (peer, expires_at) in [("bob-phone", 1), ("bob-laptop", i64::MAX)] {
        t.storage.get_or_create_contact_thread(peer, true).unwrap();
        t.storage
            .write_handshake_state(peer, HandshakeState::RequestSent, Some(expires_at))
            .unwrap();
    }

    t.node.start().await.unwrap();

    assert_eq!(t.storage.handshake_state("bob-phone").unwrap(), HandshakeState::Expired);
    assert_eq!(t.storage.handshake_state("bob-laptop").unwrap(), HandshakeState::RequestSent);
    t.node.shutdown().await;
}

#[tokio::test]
async fn test_new_contact_thread_is_visible() {
    let t = TestNode::new("me");

    let report = t
        .node
        .router
        .route_to_all_devices(OutgoingMessage::to_contact("carol", "hi"))
        .await
        .unwrap();

    assert_eq!(report.outcome_for("carol"), Some(DestinationOutcome::HandshakeSent));
    assert!(!t.storage.contact_thread("carol").unwrap().unwrap().hidden);
}

#[tokio::test]
async fn test_failed_send_to_unlinked_recipient_fails_the_route() {
    let t = TestNode::new("me");
    t.trust("dave");
    t.sender.fail_for("dave");

    let err = t
        .node
        .router
        .route_to_all_devices(OutgoingMessage::to_contact("dave", "hi"))
        .await
        .unwrap_err();

    match err {
        RouterError::SendFailed { destination, .. } => assert_eq!(destination, "dave"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(t.sender.sent().is_empty());
}

#[tokio::test]
async fn test_receipts_do_not_trigger_handshakes() {
    let t = TestNode::new("me");
    t.directory.add(DeviceLink::between("bob", "bob-phone"));

    let mut receipt = OutgoingMessage::to_contact("bob", "read");
    receipt.kind = MessageKind::Receipt;
    t.node.router.route_to_all_devices(receipt).await.unwrap();

    assert!(t.sender.sent().iter().all(|e| e.kind == MessageKind::Receipt));
    assert_eq!(t.sender.sent().len(), 2);
}

#[tokio::test]
async fn test_partial_failure_reports_error_after_all_settle() {
    let t = TestNode::new("me");
    t.directory.add(DeviceLink::between("bob", "bob-phone"));
    t.directory.add(DeviceLink::between("bob", "bob-laptop"));
    for id in ["bob", "bob-phone", "bob-laptop"] {
        t.trust(id);
    }
    t.sender.fail_for("bob-phone");

    let err = t
        .node
        .router
        .route_to_all_devices(OutgoingMessage::to_contact("bob", "hi"))
        .await
        .unwrap_err();

    match err {
        RouterError::SendFailed { destination, .. } => assert_eq!(destination, "bob-phone"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(t.sender.sent().len(), 2);
}

#[tokio::test]
async fn test_directory_outage_falls_back_to_original_destination() {
    let t = TestNode::new("me");
    t.directory.add(DeviceLink::between("bob", "bob-phone"));
    t.directory.set_down(true);

    let report = t
        .node
        .router
        .route_to_all_devices(OutgoingMessage::to_contact("bob", "hi"))
        .await
        .unwrap();

    assert!(!report.fanned_out);
    assert_eq!(t.sender.sent().len(), 1);
    assert_eq!(t.sender.sent()[0].recipient, "bob");
}
