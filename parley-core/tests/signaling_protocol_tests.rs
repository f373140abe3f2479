//! Signaling protocol tests
//!
//! Covers the wire shape the collaborator transport speaks, the addressing
//! rules, the pending-candidate queue, and a property test that throws
//! arbitrary inbound message sequences at a manager and checks the
//! single-session invariant holds.

use parley_core::{
    CallId, CallManager, CallStatus, IceCandidate, InMemorySignaling, LoopbackNetwork, MediaKind,
    PeerIdentityString, SessionDescription, SignalingMessage, SignalingTransport,
    SyntheticMediaSource,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

type Msg = SignalingMessage<PeerIdentityString>;

fn user(name: &str) -> PeerIdentityString {
    PeerIdentityString::new(name)
}

async fn endpoint(
    name: &str,
    hub: &Arc<InMemorySignaling<PeerIdentityString>>,
    links: &LoopbackNetwork,
) -> CallManager<PeerIdentityString> {
    CallManager::builder(
        user(name),
        hub.clone(),
        Arc::new(SyntheticMediaSource::granting()),
        Arc::new(links.clone()),
    )
    .spawn()
    .await
    .unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[test]
fn reject_and_end_wire_shape() {
    let call_id = CallId::new();
    let reject: Msg = SignalingMessage::Reject {
        call_id,
        from: user("bob"),
        to: user("alice"),
    };
    let value = serde_json::to_value(&reject).unwrap();
    assert_eq!(
        value,
        serde_json::json!({
            "type": "reject",
            "callId": call_id,
            "from": "bob",
            "to": "alice",
        })
    );

    let end: Msg = SignalingMessage::End {
        call_id,
        from: user("alice"),
        to: user("bob"),
    };
    let value = serde_json::to_value(&end).unwrap();
    assert_eq!(value["type"], "end");
    let back: Msg = serde_json::from_value(value).unwrap();
    assert_eq!(back, end);
}

/// A transport that delivers every message to every subscriber, modeling a
/// shared broadcast channel. The manager's own addressing check is the only
/// line of defense here.
struct PromiscuousHub {
    subscribers: parking_lot::Mutex<Vec<tokio::sync::mpsc::Sender<Msg>>>,
}

#[async_trait::async_trait]
impl SignalingTransport<PeerIdentityString> for PromiscuousHub {
    async fn publish(&self, message: Msg) -> Result<(), parley_core::SignalingError> {
        let subscribers = self.subscribers.lock().clone();
        for tx in subscribers {
            let _ = tx.send(message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        _local: &PeerIdentityString,
    ) -> Result<tokio::sync::mpsc::Receiver<Msg>, parley_core::SignalingError> {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        self.subscribers.lock().push(tx);
        Ok(rx)
    }
}

#[tokio::test(start_paused = true)]
async fn misaddressed_messages_never_reach_the_state_machine() {
    let hub = Arc::new(PromiscuousHub {
        subscribers: parking_lot::Mutex::new(Vec::new()),
    });
    let links = LoopbackNetwork::new();
    let bob = CallManager::builder(
        user("bob"),
        hub.clone(),
        Arc::new(SyntheticMediaSource::granting()),
        Arc::new(links.clone()),
    )
    .spawn()
    .await
    .unwrap();

    // The broadcast transport lands this in bob's mailbox even though it
    // is addressed to carol; the manager must discard it.
    hub.publish(SignalingMessage::Offer {
        call_id: CallId::new(),
        from: user("alice"),
        to: user("carol"),
        media_kind: MediaKind::Voice,
        description: SessionDescription::offer("v=0"),
    })
    .await
    .unwrap();
    settle().await;
    assert!(bob.call_state().is_idle());

    // A properly addressed offer still rings.
    hub.publish(SignalingMessage::Offer {
        call_id: CallId::new(),
        from: user("alice"),
        to: user("bob"),
        media_kind: MediaKind::Voice,
        description: SessionDescription::offer("v=0"),
    })
    .await
    .unwrap();
    settle().await;
    assert_eq!(bob.call_state().status, CallStatus::Ringing);

    bob.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn answer_for_an_unknown_call_is_dropped() {
    let hub = InMemorySignaling::new();
    let links = LoopbackNetwork::new();
    let bob = endpoint("bob", &hub, &links).await;

    hub.publish(SignalingMessage::Answer {
        call_id: CallId::new(),
        from: user("alice"),
        to: user("bob"),
        description: SessionDescription::answer("v=0"),
    })
    .await
    .unwrap();
    settle().await;
    assert!(bob.call_state().is_idle());

    bob.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn candidates_before_the_description_flush_in_receipt_order() {
    let hub = InMemorySignaling::new();
    let links = LoopbackNetwork::new();
    let bob = endpoint("bob", &hub, &links).await;

    let call_id = CallId::new();
    hub.publish(SignalingMessage::Offer {
        call_id,
        from: user("alice"),
        to: user("bob"),
        media_kind: MediaKind::Voice,
        description: SessionDescription::offer("v=0 scripted-caller m=audio"),
    })
    .await
    .unwrap();

    // Three candidates trickle in while bob is still ringing: no remote
    // description has been applied, so all three must be held.
    for n in 0..3 {
        hub.publish(SignalingMessage::Candidate {
            call_id,
            from: user("alice"),
            to: user("bob"),
            candidate: IceCandidate::new(format!("candidate:{n} 1 udp 1 192.0.2.1 4000 typ host")),
        })
        .await
        .unwrap();
    }
    settle().await;
    assert_eq!(bob.call_state().status, CallStatus::Ringing);
    // No link exists yet, so nothing can have been applied.
    assert!(links.applied_candidates(call_id).is_empty());

    // Accept applies the stored offer and then the held queue, in order.
    bob.accept_call().await.unwrap();
    settle().await;

    let applied = links.applied_candidates(call_id);
    let flushed: Vec<String> = applied[0]
        .iter()
        .filter(|c| c.starts_with("candidate:"))
        .cloned()
        .collect();
    assert_eq!(
        flushed,
        vec![
            "candidate:0 1 udp 1 192.0.2.1 4000 typ host",
            "candidate:1 1 udp 1 192.0.2.1 4000 typ host",
            "candidate:2 1 udp 1 192.0.2.1 4000 typ host",
        ]
    );

    // A candidate arriving after the flush is applied immediately.
    hub.publish(SignalingMessage::Candidate {
        call_id,
        from: user("alice"),
        to: user("bob"),
        candidate: IceCandidate::new("candidate:late 1 udp 1 192.0.2.1 4001 typ host"),
    })
    .await
    .unwrap();
    settle().await;
    let applied = links.applied_candidates(call_id);
    assert!(applied[0].iter().any(|c| c.contains("candidate:late")));

    bob.shutdown().await;
}

// ---------------------------------------------------------------------
// Property: arbitrary inbound traffic never violates the single-session
// invariant or crashes the actor.
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum ScriptStep {
    Offer { pool: usize, to_me: bool },
    Answer { pool: usize },
    Reject { pool: usize },
    End { pool: usize },
    Candidate { pool: usize },
}

fn step_strategy() -> impl Strategy<Value = ScriptStep> {
    let pool = 0usize..3;
    prop_oneof![
        (pool.clone(), any::<bool>()).prop_map(|(pool, to_me)| ScriptStep::Offer { pool, to_me }),
        pool.clone().prop_map(|pool| ScriptStep::Answer { pool }),
        pool.clone().prop_map(|pool| ScriptStep::Reject { pool }),
        pool.clone().prop_map(|pool| ScriptStep::End { pool }),
        pool.prop_map(|pool| ScriptStep::Candidate { pool }),
    ]
}

fn build_message(step: &ScriptStep, ids: &[CallId; 3]) -> Msg {
    let from = user("peer");
    let me = user("me");
    match *step {
        ScriptStep::Offer { pool, to_me } => SignalingMessage::Offer {
            call_id: ids[pool],
            from,
            to: if to_me { me } else { user("someone-else") },
            media_kind: MediaKind::Voice,
            description: SessionDescription::offer("v=0 property"),
        },
        ScriptStep::Answer { pool } => SignalingMessage::Answer {
            call_id: ids[pool],
            from,
            to: me,
            description: SessionDescription::answer("v=0 property"),
        },
        ScriptStep::Reject { pool } => SignalingMessage::Reject {
            call_id: ids[pool],
            from,
            to: me,
        },
        ScriptStep::End { pool } => SignalingMessage::End {
            call_id: ids[pool],
            from,
            to: me,
        },
        ScriptStep::Candidate { pool } => SignalingMessage::Candidate {
            call_id: ids[pool],
            from,
            to: me,
            candidate: IceCandidate::new("candidate:p 1 udp 1 192.0.2.2 4100 typ host"),
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn inbound_traffic_upholds_single_session_invariant(
        steps in proptest::collection::vec(step_strategy(), 0..24)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async move {
            let hub = InMemorySignaling::new();
            let links = LoopbackNetwork::new();
            let manager = endpoint("me", &hub, &links).await;
            let ids = [CallId::new(), CallId::new(), CallId::new()];

            let mut offered_to_me = Vec::new();
            for step in &steps {
                if let ScriptStep::Offer { pool, to_me: true } = step {
                    offered_to_me.push(ids[*pool]);
                }
                hub.publish(build_message(step, &ids)).await.unwrap();
            }
            settle().await;

            // The actor is still alive and its state is internally
            // consistent: any non-idle session was born from an offer
            // actually addressed to this endpoint, and inbound traffic
            // alone can only ever produce incoming sessions.
            let state = manager.call_state();
            if !state.is_idle() {
                let call_id = state.call_id.unwrap();
                prop_assert!(offered_to_me.contains(&call_id));
                prop_assert!(state.is_incoming);
                prop_assert!(state.peer.is_some());
            } else {
                prop_assert!(state.call_id.is_none());
                prop_assert!(state.peer.is_none());
            }

            manager.shutdown().await;
            Ok::<(), proptest::test_runner::TestCaseError>(())
        })?;
    }
}
