use std::sync::Arc;

use crate::address::ProtocolAddress;
use crate::error::CryptoError;
use crate::identity::Identity;
use crate::signal::{
    CiphertextMessageType, MemoryIdentityStore, MemoryPreKeyStore, MemorySessionStore,
    SessionOutcome, SignalSessionManager,
};

fn make_manager(identity: &Identity, registration_id: u32) -> SignalSessionManager {
    SignalSessionManager::new(
        Box::new(MemoryIdentityStore::new(identity, registration_id)),
        Box::new(MemoryPreKeyStore::new()),
        Box::new(MemorySessionStore::new()),
    )
}

struct Pair {
    alice: SignalSessionManager,
    bob: SignalSessionManager,
    bob_address: ProtocolAddress,
    alice_address: ProtocolAddress,
}

fn establish_pair() -> Pair {
    let alice = make_manager(&Identity::generate(), 100);
    let bob = make_manager(&Identity::generate(), 200);
    let bundle = bob.generate_prekey_bundle(1, 1, Some(10)).unwrap();
    let bob_address = ProtocolAddress::new("bob", 1);
    assert_eq!(
        alice.process_prekey_bundle(&bob_address, &bundle).unwrap(),
        SessionOutcome::Established
    );
    Pair {
        alice,
        bob,
        bob_address,
        alice_address: ProtocolAddress::new("alice", 1),
    }
}

// ── Establishment ──────────────────────────────────────────────────

#[test]
fn x3dh_handshake_and_encrypt_decrypt() {
    let pair = establish_pair();

    let first = pair.alice.encrypt(&pair.bob_address, b"hello bob").unwrap();
    assert_eq!(first.message_type, CiphertextMessageType::PreKey);
    let plaintext = pair.bob.decrypt(&pair.alice_address, &first).unwrap();
    assert_eq!(plaintext, b"hello bob");

    let reply = pair.bob.encrypt(&pair.alice_address, b"hi alice").unwrap();
    assert_eq!(reply.message_type, CiphertextMessageType::Whisper);
    assert_eq!(
        pair.alice.decrypt(&pair.bob_address, &reply).unwrap(),
        b"hi alice"
    );

    // Alice saw the answer, so she stops sending prekey messages.
    let next = pair.alice.encrypt(&pair.bob_address, b"again").unwrap();
    assert_eq!(next.message_type, CiphertextMessageType::Whisper);
    assert_eq!(pair.bob.decrypt(&pair.alice_address, &next).unwrap(), b"again");
}

#[test]
fn multiple_messages_advance_chain() {
    let pair = establish_pair();
    for i in 0..5u8 {
        let message = pair.alice.encrypt(&pair.bob_address, &[i; 3]).unwrap();
        assert_eq!(
            pair.bob.decrypt(&pair.alice_address, &message).unwrap(),
            vec![i; 3]
        );
    }
}

#[test]
fn second_bundle_is_not_used_when_session_exists() {
    let pair = establish_pair();
    let bundle = pair.bob.generate_prekey_bundle(1, 2, None).unwrap();
    assert_eq!(
        pair.alice
            .process_prekey_bundle(&pair.bob_address, &bundle)
            .unwrap(),
        SessionOutcome::AlreadyPresent
    );
}

#[test]
fn concurrent_establishment_creates_one_session() {
    let alice = Arc::new(make_manager(&Identity::generate(), 1));
    let bob = make_manager(&Identity::generate(), 2);
    let bundle = Arc::new(bob.generate_prekey_bundle(1, 1, None).unwrap());
    let address = ProtocolAddress::new("bob", 1);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let alice = Arc::clone(&alice);
            let bundle = Arc::clone(&bundle);
            let address = address.clone();
            std::thread::spawn(move || alice.process_prekey_bundle(&address, &bundle).unwrap())
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let established = outcomes
        .iter()
        .filter(|outcome| **outcome == SessionOutcome::Established)
        .count();
    assert_eq!(established, 1);
}

#[test]
fn bad_signature_is_rejected() {
    let alice = make_manager(&Identity::generate(), 1);
    let bob = make_manager(&Identity::generate(), 2);
    let mut bundle = bob.generate_prekey_bundle(1, 1, None).unwrap();
    bundle.signed_prekey_signature[0] ^= 0xff;
    let address = ProtocolAddress::new("bob", 1);

    let err = alice.process_prekey_bundle(&address, &bundle).unwrap_err();
    assert!(matches!(err, CryptoError::InvalidSignature(_)));
    assert!(!alice.has_current_session(&address).unwrap());
}

#[test]
fn changed_identity_is_untrusted_for_new_sessions() {
    let pair = establish_pair();
    pair.alice.archive_session(&pair.bob_address).unwrap();

    let reinstalled = make_manager(&Identity::generate(), 201);
    let bundle = reinstalled.generate_prekey_bundle(1, 1, None).unwrap();
    let err = pair
        .alice
        .process_prekey_bundle(&pair.bob_address, &bundle)
        .unwrap_err();
    assert!(matches!(err, CryptoError::UntrustedIdentity(_)));

    // Accepting the new key lets the next attempt through.
    pair.alice
        .save_identity(&pair.bob_address, &bundle.identity_key)
        .unwrap();
    assert_eq!(
        pair.alice
            .process_prekey_bundle(&pair.bob_address, &bundle)
            .unwrap(),
        SessionOutcome::Established
    );
}

// ── Encryption errors ──────────────────────────────────────────────

#[test]
fn encrypt_without_session_fails() {
    let alice = make_manager(&Identity::generate(), 1);
    let err = alice
        .encrypt(&ProtocolAddress::new("nobody", 1), b"hi")
        .unwrap_err();
    assert!(matches!(err, CryptoError::SessionNotFound(_)));
}

#[test]
fn pinned_identity_change_is_a_mismatch() {
    let pair = establish_pair();
    pair.alice
        .save_identity(&pair.bob_address, &Identity::generate().identity_key())
        .unwrap();
    let err = pair.alice.encrypt(&pair.bob_address, b"hi").unwrap_err();
    assert!(matches!(err, CryptoError::IdentityKeyMismatch(_)));
}

#[test]
fn tampered_ciphertext_fails() {
    let pair = establish_pair();
    let mut message = pair.alice.encrypt(&pair.bob_address, b"secret").unwrap();
    let last = message.body.len() - 1;
    message.body[last] ^= 0xff;
    assert!(pair.bob.decrypt(&pair.alice_address, &message).is_err());
}

// ── Records ────────────────────────────────────────────────────────

#[test]
fn archive_keeps_remote_details_out_of_current() {
    let pair = establish_pair();
    let remote = pair.alice.remote_session(&pair.bob_address).unwrap().unwrap();
    assert_eq!(remote.registration_id, 200);

    pair.alice.archive_session(&pair.bob_address).unwrap();
    assert!(!pair.alice.has_current_session(&pair.bob_address).unwrap());
    assert!(pair.alice.remote_session(&pair.bob_address).unwrap().is_none());
}

#[test]
fn prekey_bundle_generation() {
    let identity = Identity::generate();
    let manager = make_manager(&identity, 42);
    let bundle = manager.generate_prekey_bundle(3, 1, Some(5)).unwrap();
    assert_eq!(bundle.device_id, 3);
    assert_eq!(bundle.registration_id, 42);
    assert_eq!(bundle.identity_key, identity.identity_key());
    assert_eq!(bundle.one_time_prekey.as_ref().map(|k| k.id), Some(5));
    assert!(bundle.verify_signature().is_ok());
}
