//! Integration tests for group sends through a shared sender key: key
//! distribution, the multi-recipient submission, and the whole-send
//! recoveries its failures trigger.

mod common;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;

use courier_crypto::sealed_sender::MultiRecipientMessage;
use courier_crypto::sender_key::SenderKeyReceiver;
use courier_crypto::{AccessKey, ProtocolAddress, SenderKeyDistributionMessage};
use courier_delivery::relay::{DeviceSelector, MultiRecipientSendResponse};
use courier_delivery::store::{KeyRecipientDevice, RecipientDirectory, SenderKeyStore};
use courier_delivery::{RecipientState, SendError, SendResult, ThreadId};

use common::{address, status, text, Harness, Peer};

const SKDM_TIMESTAMP: u64 = 1_700_000_000_000;

fn sealed() -> Option<RecipientState> {
    Some(RecipientState::Sent {
        sealed_sender: true,
    })
}

/// Pretend `peer` already holds the thread's key on its single device.
fn mark_key_delivered(h: &Harness, thread: &ThreadId, peer: &Peer) {
    h.establish_sessions(peer);
    let devices = BTreeSet::from([KeyRecipientDevice {
        device_id: 1,
        registration_id: 1001,
    }]);
    h.sender_keys
        .record_sent_sender_keys(thread, &HashMap::from([(peer.service_id.clone(), devices)]))
        .expect("record");
}

// ── Planning ───────────────────────────────────────────────────────────

#[tokio::test]
async fn key_goes_only_to_members_without_it() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let thread = h.group_thread("g-split", &[&alice, &bob], true);
    mark_key_delivered(&h, &thread, &alice);

    let result = h
        .sender
        .send_message(&text(100, &thread, &[&alice, &bob]))
        .await;
    assert_eq!(result, SendResult::Success);

    assert!(h.relay.submissions_to(&alice.service_id).is_empty());
    let to_bob = h.relay.submissions_to(&bob.service_id);
    assert_eq!(to_bob.len(), 1);
    assert_eq!(to_bob[0].timestamp, SKDM_TIMESTAMP);
    assert_eq!(
        h.relay.prekey_fetches(),
        vec![(bob.service_id.clone(), DeviceSelector::All)]
    );

    let multi = h.relay.multi_submissions();
    assert_eq!(multi.len(), 1);
    assert_eq!(multi[0].timestamp, 100);
    assert_eq!(
        multi[0].access_key,
        Some(AccessKey::combine([&alice.access_key, &bob.access_key]))
    );

    assert_eq!(h.messages.recipient_state(100, &address(&alice)), sealed());
    assert_eq!(h.messages.recipient_state(100, &address(&bob)), sealed());
}

#[tokio::test]
async fn distributed_key_decrypts_the_multicast() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let thread = h.group_thread("g-e2e", &[&alice, &bob], true);

    assert!(h
        .sender
        .send_message(&text(200, &thread, &[&alice, &bob]))
        .await
        .is_success());

    let to_bob = h.relay.submissions_to(&bob.service_id);
    let skdm = bob.open(1, &to_bob[0].messages[0]);
    let skdm = SenderKeyDistributionMessage::from_bytes(&skdm).expect("skdm");
    let mut receiver = SenderKeyReceiver::from_distribution_message(&skdm);

    let multi = &h.relay.multi_submissions()[0];
    let parsed = MultiRecipientMessage::parse(&multi.payload).expect("parse");
    assert_eq!(parsed.recipients.len(), 2);
    let content = parsed
        .open(&bob.identity, &ProtocolAddress::new("bob", 1))
        .expect("open");
    assert_eq!(content.group_id.as_deref(), Some("g-e2e".as_bytes()));
    assert_eq!(receiver.decrypt(&content.contents).expect("decrypt"), b"hello 200");
}

#[tokio::test]
async fn single_eligible_member_uses_fanout() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let thread = h.group_thread("g-small", &[&alice], true);

    assert!(h.sender.send_message(&text(300, &thread, &[&alice])).await.is_success());
    assert!(h.relay.multi_submissions().is_empty());
    let to_alice = h.relay.submissions_to(&alice.service_id);
    assert_eq!(to_alice.len(), 1);
    assert_eq!(to_alice[0].timestamp, 300);
}

#[tokio::test]
async fn member_without_access_key_is_fanned_out() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let carol = h.add_peer("carol", &[1]);
    let mut record = h
        .recipients
        .recipient(&carol.service_id)
        .expect("lookup")
        .expect("record");
    record.access_key = None;
    h.recipients.insert(record);
    let thread = h.group_thread("g-mixed", &[&alice, &bob, &carol], true);

    assert!(h
        .sender
        .send_message(&text(400, &thread, &[&alice, &bob, &carol]))
        .await
        .is_success());

    assert_eq!(h.relay.multi_submissions().len(), 1);
    let to_carol = h.relay.submissions_to(&carol.service_id);
    assert_eq!(to_carol.len(), 1);
    assert_eq!(to_carol[0].timestamp, 400);
    assert_eq!(
        h.messages.recipient_state(400, &address(&carol)),
        Some(RecipientState::Sent {
            sealed_sender: false
        })
    );
}

#[tokio::test]
async fn key_is_reused_until_it_expires() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let thread = h.group_thread("g-rotate", &[&alice, &bob], true);
    let first = h.sender_keys.distribution_id(&thread).expect("id");

    for timestamp in [500, 501] {
        assert!(h
            .sender
            .send_message(&text(timestamp, &thread, &[&alice, &bob]))
            .await
            .is_success());
    }
    assert_eq!(h.relay.submissions().len(), 2);
    assert_eq!(h.relay.multi_submissions().len(), 2);

    h.clock.advance(h.sender.config().max_sender_key_age);
    assert!(h
        .sender
        .send_message(&text(502, &thread, &[&alice, &bob]))
        .await
        .is_success());
    assert_eq!(h.relay.submissions().len(), 4);
    assert_ne!(h.sender_keys.distribution_id(&thread).expect("id"), first);
}

// ── Multi-recipient failures ───────────────────────────────────────────

#[tokio::test]
async fn rejected_multicast_falls_back_to_fanout() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let thread = h.group_thread("g-401", &[&alice, &bob], true);
    h.relay.queue_multi(Err(status(401, "")));

    assert!(h
        .sender
        .send_message(&text(600, &thread, &[&alice, &bob]))
        .await
        .is_success());

    assert_eq!(h.relay.multi_submissions().len(), 1);
    for peer in [&alice, &bob] {
        let timestamps: Vec<_> = h
            .relay
            .submissions_to(&peer.service_id)
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(timestamps, vec![SKDM_TIMESTAMP, 600]);
    }
}

#[tokio::test]
async fn multicast_device_mismatch_is_corrected_once() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let thread = h.group_thread("g-409", &[&alice, &bob], true);
    // Bob links a second device after we last fetched his keys.
    h.establish_sessions(&bob);
    bob.add_device(2);
    let body = r#"[{"uuid":"bob","devices":{"missingDevices":[2],"extraDevices":[]}}]"#;
    h.relay.queue_multi(Err(status(409, body)));

    assert!(h
        .sender
        .send_message(&text(700, &thread, &[&alice, &bob]))
        .await
        .is_success());

    assert_eq!(h.relay.multi_submissions().len(), 2);
    let to_bob = h.relay.submissions_to(&bob.service_id);
    assert_eq!(to_bob.len(), 2);
    let devices: Vec<_> = to_bob[1]
        .messages
        .iter()
        .map(|m| m.destination_device_id)
        .collect();
    assert_eq!(devices, vec![1, 2]);
    assert_eq!(h.relay.submissions_to(&alice.service_id).len(), 1);
    assert!(h
        .relay
        .prekey_fetches()
        .contains(&(bob.service_id.clone(), DeviceSelector::Device(2))));
}

#[tokio::test]
async fn repeated_multicast_mismatch_exhausts_recovery() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let thread = h.group_thread("g-409x2", &[&alice, &bob], true);
    // Bob links a second device after we last fetched his keys.
    h.establish_sessions(&bob);
    bob.add_device(2);
    let body = r#"[{"uuid":"bob","devices":{"missingDevices":[2],"extraDevices":[]}}]"#;
    h.relay.queue_multi(Err(status(409, body)));
    h.relay.queue_multi(Err(status(409, body)));

    let result = h
        .sender
        .send_message(&text(800, &thread, &[&alice, &bob]))
        .await;
    assert!(matches!(
        result,
        SendResult::OverallFailure(SendError::RecoveryExhausted(_))
    ));
    assert_eq!(h.relay.multi_submissions().len(), 2);
    for peer in [&alice, &bob] {
        assert!(matches!(
            h.messages.recipient_state(800, &address(peer)),
            Some(RecipientState::Failed { .. })
        ));
    }
}

#[tokio::test]
async fn stale_multicast_devices_get_the_key_again() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let thread = h.group_thread("g-410", &[&alice, &bob], true);
    let body = r#"[{"uuid":"bob","devices":{"staleDevices":[1]}}]"#;
    h.relay.queue_multi(Err(status(410, body)));

    assert!(h
        .sender
        .send_message(&text(900, &thread, &[&alice, &bob]))
        .await
        .is_success());

    assert_eq!(h.relay.multi_submissions().len(), 2);
    assert_eq!(h.relay.submissions_to(&bob.service_id).len(), 2);
    assert_eq!(h.relay.submissions_to(&alice.service_id).len(), 1);
    let bob_fetches = h
        .relay
        .prekey_fetches()
        .into_iter()
        .filter(|(recipient, _)| *recipient == bob.service_id)
        .count();
    assert_eq!(bob_fetches, 2);
}

#[tokio::test]
async fn unregistered_multicast_recipient_is_skipped() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let thread = h.group_thread("g-404", &[&alice, &bob], true);
    h.relay.queue_multi(Ok(MultiRecipientSendResponse {
        unregistered: vec![bob.service_id.clone()],
    }));

    assert!(h
        .sender
        .send_message(&text(1000, &thread, &[&alice, &bob]))
        .await
        .is_success());

    assert_eq!(h.messages.recipient_state(1000, &address(&alice)), sealed());
    assert_eq!(
        h.messages.recipient_state(1000, &address(&bob)),
        Some(RecipientState::Skipped)
    );
    let record = h
        .recipients
        .recipient(&bob.service_id)
        .expect("lookup")
        .expect("record");
    assert!(!record.is_registered);
}

#[tokio::test]
async fn resolved_multicast_challenge_is_resubmitted() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let thread = h.group_thread("g-428", &[&alice, &bob], true);
    h.spam.resolves.store(true, Ordering::SeqCst);
    h.relay.queue_multi(Err(status(428, "{}")));

    assert!(h
        .sender
        .send_message(&text(1100, &thread, &[&alice, &bob]))
        .await
        .is_success());
    assert_eq!(h.relay.multi_submissions().len(), 2);
    assert_eq!(h.spam.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_stale_multicast_exhausts_recovery() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let thread = h.group_thread("g-410x2", &[&alice, &bob], true);
    let body = r#"[{"uuid":"bob","devices":{"staleDevices":[1]}}]"#;
    h.relay.queue_multi(Err(status(410, body)));
    h.relay.queue_multi(Err(status(410, body)));

    let result = h
        .sender
        .send_message(&text(1200, &thread, &[&alice, &bob]))
        .await;
    assert_eq!(
        result,
        SendResult::OverallFailure(SendError::RecoveryExhausted("stale devices"))
    );
    assert_eq!(h.relay.multi_submissions().len(), 2);
    for peer in [&alice, &bob] {
        assert!(matches!(
            h.messages.recipient_state(1200, &address(peer)),
            Some(RecipientState::Failed { .. })
        ));
    }
}

#[tokio::test]
async fn sealed_rejection_after_multicast_fallback_sends_identified() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    let thread = h.group_thread("g-401x2", &[&alice, &bob], true);
    mark_key_delivered(&h, &thread, &alice);
    mark_key_delivered(&h, &thread, &bob);
    h.relay.queue_multi(Err(status(401, "")));
    h.relay.fail_submit(&alice.service_id, status(401, ""));

    assert!(h
        .sender
        .send_message(&text(1300, &thread, &[&alice, &bob]))
        .await
        .is_success());

    // The second rejection is absorbed per recipient; the whole send is not
    // rerun and multicast is not tried again.
    assert_eq!(h.relay.multi_submissions().len(), 1);
    assert_eq!(h.relay.submissions_to(&alice.service_id).len(), 2);
    assert_eq!(h.relay.submissions_to(&bob.service_id).len(), 1);
    assert_eq!(
        h.messages.recipient_state(1300, &address(&alice)),
        Some(RecipientState::Sent {
            sealed_sender: false
        })
    );
    assert_eq!(h.messages.recipient_state(1300, &address(&bob)), sealed());
}

#[tokio::test]
async fn out_of_range_registration_id_is_fanned_out() {
    let h = Harness::new();
    let alice = h.add_peer("alice", &[1]);
    let bob = h.add_peer("bob", &[1]);
    // Registration id 1000 + 15384 = 0x4000 does not fit a multicast bundle.
    let carol = h.add_peer("carol", &[15384]);
    let thread = h.group_thread("g-regid", &[&alice, &bob, &carol], true);

    let result = h
        .sender
        .send_message(&text(1400, &thread, &[&alice, &bob, &carol]))
        .await;
    assert_eq!(result, SendResult::Success);

    let multi = h.relay.multi_submissions();
    assert_eq!(multi.len(), 1);
    let parsed = MultiRecipientMessage::parse(&multi[0].payload).expect("parse");
    assert_eq!(parsed.recipients.len(), 2);
    assert_eq!(
        multi[0].access_key,
        Some(AccessKey::combine([&alice.access_key, &bob.access_key]))
    );

    let to_carol: Vec<_> = h
        .relay
        .submissions_to(&carol.service_id)
        .iter()
        .map(|s| s.timestamp)
        .collect();
    assert_eq!(to_carol, vec![SKDM_TIMESTAMP, 1400]);
    for peer in [&alice, &bob, &carol] {
        assert_eq!(h.messages.recipient_state(1400, &address(peer)), sealed());
    }
}
