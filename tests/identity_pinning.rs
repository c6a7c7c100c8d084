//! Identity and handshake tampering
//!
//! Pinning is checked after the key exchange, so these cases also confirm
//! that a rejected peer never ends up holding a usable channel.

mod support;

use crypto::traits::SigningKey;
use crypto::IdentityKeypair;
use pq_channel::{
    memory_pair, AbortReason, ChannelConfig, ChannelError, ChannelState, HandshakeError,
    MemorySink, SecureChannel,
};
use support::{faulty_pair, identities, init_tracing, Fault, TestResult};

#[tokio::test(flavor = "multi_thread")]
async fn matching_pins_on_both_sides() -> TestResult {
    init_tracing();
    let (alice, bob) = identities();
    let (a, b) = memory_pair(16);
    let (initiator, responder) = tokio::join!(
        SecureChannel::connect(a, &alice, Some(bob.fingerprint()), ChannelConfig::default()),
        SecureChannel::accept(b, &bob, Some(alice.fingerprint()), ChannelConfig::default())
    );
    let initiator = initiator?;
    let responder = responder?;
    assert_eq!(initiator.peer_fingerprint(), bob.fingerprint());
    assert_eq!(responder.peer_fingerprint(), alice.fingerprint());
    assert_eq!(initiator.session_id(), responder.session_id());
    assert_eq!(initiator.state(), ChannelState::Ready);
    assert_eq!(responder.state(), ChannelState::Ready);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn initiator_rejects_unexpected_responder() -> TestResult {
    init_tracing();
    let (alice, bob) = identities();
    let mallory = IdentityKeypair::generate();
    let (a, b) = memory_pair(16);
    let (initiator, responder) = tokio::join!(
        SecureChannel::connect(a, &alice, Some(bob.fingerprint()), ChannelConfig::default()),
        SecureChannel::accept(b, &mallory, None, ChannelConfig::default())
    );

    match initiator.unwrap_err() {
        ChannelError::Handshake(HandshakeError::PeerIdentityMismatch { expected, actual }) => {
            assert_eq!(expected, bob.fingerprint());
            assert_eq!(actual, mallory.fingerprint());
        }
        other => panic!("expected identity mismatch, got {other:?}"),
    }

    // The unpinned side finished its half; the ABORT reaches it on first use.
    let mut responder = responder?;
    let mut sink = MemorySink::new();
    let err = responder.receive_stream(&mut sink).await.unwrap_err();
    assert!(matches!(
        err,
        ChannelError::PeerAborted(AbortReason::IdentityMismatch)
    ));
    assert!(sink.committed().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn responder_rejects_unexpected_initiator() -> TestResult {
    init_tracing();
    let (alice, bob) = identities();
    let mallory = IdentityKeypair::generate();
    let (a, b) = memory_pair(16);
    let (initiator, responder) = tokio::join!(
        SecureChannel::connect(a, &mallory, None, ChannelConfig::default()),
        SecureChannel::accept(b, &bob, Some(alice.fingerprint()), ChannelConfig::default())
    );

    assert!(matches!(
        responder.unwrap_err(),
        ChannelError::Handshake(HandshakeError::PeerIdentityMismatch { .. })
    ));

    let mut initiator = initiator?;
    let err = initiator.send_stream(&b"not for you"[..]).await.unwrap_err();
    assert!(matches!(
        err,
        ChannelError::PeerAborted(AbortReason::IdentityMismatch) | ChannelError::Io(_)
    ));
    assert_eq!(initiator.state(), ChannelState::Failed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn tampered_hello_fails_both_sides() -> TestResult {
    init_tracing();
    let (alice, bob) = identities();
    let (a, b) = faulty_pair(Fault::CorruptHello);
    let (initiator, responder) = tokio::join!(
        SecureChannel::connect(a, &alice, Some(bob.fingerprint()), ChannelConfig::default()),
        SecureChannel::accept(b, &bob, Some(alice.fingerprint()), ChannelConfig::default())
    );

    // The two sides derive different keys, so neither identity proof verifies.
    assert!(matches!(initiator.unwrap_err(), ChannelError::Handshake(_)));
    assert!(matches!(responder.unwrap_err(), ChannelError::Handshake(_)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn undecodable_frame_is_a_protocol_violation() -> TestResult {
    init_tracing();
    let (alice, bob) = identities();
    let (a, b) = faulty_pair(Fault::Garbage);
    let (initiator, responder) = tokio::join!(
        SecureChannel::connect(a, &alice, None, ChannelConfig::default()),
        SecureChannel::accept(b, &bob, None, ChannelConfig::default())
    );

    let err = responder.unwrap_err();
    assert!(matches!(err, ChannelError::Frame(_)));
    assert_eq!(err.abort_reason(), AbortReason::ProtocolViolation);
    assert!(matches!(
        initiator.unwrap_err(),
        ChannelError::Handshake(HandshakeError::Aborted(AbortReason::ProtocolViolation))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_handshakes_get_fresh_sessions() -> TestResult {
    init_tracing();
    let (alice, bob) = identities();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let (a, b) = memory_pair(16);
        let (initiator, responder) = tokio::join!(
            SecureChannel::connect(a, &alice, Some(bob.fingerprint()), ChannelConfig::default()),
            SecureChannel::accept(b, &bob, Some(alice.fingerprint()), ChannelConfig::default())
        );
        let initiator = initiator?;
        assert_eq!(initiator.session_id(), responder?.session_id());
        ids.push(initiator.session_id());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    Ok(())
}
