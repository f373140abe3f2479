//! Call signaling protocol
//!
//! Defines the addressed wire messages that bootstrap a peer media session
//! and the transport contract they travel over. The transport is one
//! process-wide publish/subscribe channel, not a per-call connection:
//! delivery is best-effort, per-sender ordered on a reliable network, and a
//! send to an unreachable recipient fails silently. Liveness is the
//! manager's problem (ring timeout), never the transport's.

use crate::identity::PeerIdentity;
use crate::types::{CallId, IceCandidate, MediaKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Local subscription is gone
    #[error("signaling channel closed")]
    ChannelClosed,

    /// Transport error
    #[error("transport error: {0}")]
    TransportError(String),
}

/// Signaling message types
///
/// Tagged union carried verbatim on the collaborator transport. Messages
/// are addressed: a receiver must discard anything whose `to` is not its
/// own identity. Every message carries the `callId` of the attempt it
/// belongs to, so stale deliveries are recognized by tag instead of by
/// guesswork.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", bound = "I: PeerIdentity")]
pub enum SignalingMessage<I: PeerIdentity> {
    /// Call offer
    #[serde(rename_all = "camelCase")]
    Offer {
        /// Attempt identifier
        call_id: CallId,
        /// Sender identity
        from: I,
        /// Recipient identity
        to: I,
        /// Voice or video, fixed for the life of the call
        media_kind: MediaKind,
        /// The caller's session description
        description: SessionDescription,
    },

    /// Call answer
    #[serde(rename_all = "camelCase")]
    Answer {
        /// Attempt identifier
        call_id: CallId,
        /// Sender identity
        from: I,
        /// Recipient identity
        to: I,
        /// The callee's session description
        description: SessionDescription,
    },

    /// Callee declined the offer
    #[serde(rename_all = "camelCase")]
    Reject {
        /// Attempt identifier
        call_id: CallId,
        /// Sender identity
        from: I,
        /// Recipient identity
        to: I,
    },

    /// Either side hung up
    #[serde(rename_all = "camelCase")]
    End {
        /// Attempt identifier
        call_id: CallId,
        /// Sender identity
        from: I,
        /// Recipient identity
        to: I,
    },

    /// A discovered network path for the attempt
    #[serde(rename_all = "camelCase")]
    Candidate {
        /// Attempt identifier
        call_id: CallId,
        /// Sender identity
        from: I,
        /// Recipient identity
        to: I,
        /// The candidate payload
        candidate: IceCandidate,
    },
}

impl<I: PeerIdentity> SignalingMessage<I> {
    /// Get the attempt id the message belongs to
    #[must_use]
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::Reject { call_id, .. }
            | Self::End { call_id, .. }
            | Self::Candidate { call_id, .. } => *call_id,
        }
    }

    /// Get the sender identity
    #[must_use]
    pub fn from(&self) -> &I {
        match self {
            Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::Reject { from, .. }
            | Self::End { from, .. }
            | Self::Candidate { from, .. } => from,
        }
    }

    /// Get the recipient identity
    #[must_use]
    pub fn to(&self) -> &I {
        match self {
            Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::Reject { to, .. }
            | Self::End { to, .. }
            | Self::Candidate { to, .. } => to,
        }
    }

    /// Whether the message is addressed to the given identity
    #[must_use]
    pub fn is_addressed_to(&self, id: &I) -> bool {
        self.to().unique_id() == id.unique_id()
    }
}

/// Helper function to extract message type for tracing
pub(crate) fn message_type<I: PeerIdentity>(msg: &SignalingMessage<I>) -> &'static str {
    match msg {
        SignalingMessage::Offer { .. } => "Offer",
        SignalingMessage::Answer { .. } => "Answer",
        SignalingMessage::Reject { .. } => "Reject",
        SignalingMessage::End { .. } => "End",
        SignalingMessage::Candidate { .. } => "Candidate",
    }
}

/// Signaling transport trait
///
/// Implement this for your specific transport (platform realtime channel,
/// gossip, etc.). `publish` is best-effort and must be prompt: buffer and
/// return, never block on the network. No delivery guarantee exists; the
/// manager relies on timeouts to detect a dead peer.
#[async_trait]
pub trait SignalingTransport<I: PeerIdentity>: Send + Sync + 'static {
    /// Attempt delivery of an addressed message to `message.to`
    ///
    /// # Errors
    ///
    /// Returns error only on local transport failure. An unreachable
    /// recipient is not an error.
    async fn publish(&self, message: SignalingMessage<I>) -> Result<(), SignalingError>;

    /// Register the local identity and receive every message addressed to it
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be established.
    async fn subscribe(
        &self,
        local: &I,
    ) -> Result<mpsc::Receiver<SignalingMessage<I>>, SignalingError>;
}

/// Default mailbox depth for hub subscriptions
const DEFAULT_MAILBOX: usize = 64;

/// In-process signaling hub
///
/// One logical channel for the whole process: each endpoint subscribes
/// under its identity and receives exactly the messages addressed to it,
/// in per-sender send order. Publishing to an identity nobody registered
/// is silently dropped, which models the dead-peer case the ring timeout
/// exists for. Used by the demo binary and the integration tests.
pub struct InMemorySignaling<I: PeerIdentity> {
    mailboxes: Mutex<HashMap<String, mpsc::Sender<SignalingMessage<I>>>>,
    capacity: usize,
}

impl<I: PeerIdentity> InMemorySignaling<I> {
    /// Create a hub with the default mailbox depth
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_MAILBOX)
    }

    /// Create a hub with an explicit mailbox depth
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            mailboxes: Mutex::new(HashMap::new()),
            capacity,
        })
    }

    /// Drop an endpoint's mailbox, as if it went offline
    pub fn unregister(&self, id: &I) {
        self.mailboxes.lock().remove(&id.unique_id());
    }
}

#[async_trait]
impl<I: PeerIdentity> SignalingTransport<I> for InMemorySignaling<I> {
    async fn publish(&self, message: SignalingMessage<I>) -> Result<(), SignalingError> {
        let recipient = message.to().unique_id();
        let Some(tx) = self.mailboxes.lock().get(&recipient).cloned() else {
            tracing::debug!(
                recipient = %recipient,
                message_type = message_type(&message),
                "No subscriber for recipient, dropping message"
            );
            return Ok(());
        };

        if tx.send(message).await.is_err() {
            // Receiver went away between lookup and send; same as unreachable.
            self.mailboxes.lock().remove(&recipient);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        local: &I,
    ) -> Result<mpsc::Receiver<SignalingMessage<I>>, SignalingError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.mailboxes.lock().insert(local.unique_id(), tx);
        tracing::debug!(local = %local, "Endpoint subscribed to signaling hub");
        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentityString;
    use crate::types::SdpKind;

    fn offer(call_id: CallId, from: &str, to: &str) -> SignalingMessage<PeerIdentityString> {
        SignalingMessage::Offer {
            call_id,
            from: PeerIdentityString::new(from),
            to: PeerIdentityString::new(to),
            media_kind: MediaKind::Video,
            description: SessionDescription::offer("v=0"),
        }
    }

    #[test]
    fn test_message_accessors() {
        let id = CallId::new();
        let msg = offer(id, "alice", "bob");
        assert_eq!(msg.call_id(), id);
        assert_eq!(msg.from().as_str(), "alice");
        assert_eq!(msg.to().as_str(), "bob");
        assert!(msg.is_addressed_to(&PeerIdentityString::new("bob")));
        assert!(!msg.is_addressed_to(&PeerIdentityString::new("alice")));
    }

    #[test]
    fn test_offer_wire_shape() {
        let msg = offer(CallId::new(), "alice", "bob");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["from"], "alice");
        assert_eq!(value["to"], "bob");
        assert_eq!(value["mediaKind"], "video");
        assert_eq!(value["description"]["kind"], "offer");
        assert!(value["callId"].is_string());

        let back: SignalingMessage<PeerIdentityString> = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_candidate_wire_shape() {
        let msg: SignalingMessage<PeerIdentityString> = SignalingMessage::Candidate {
            call_id: CallId::new(),
            from: PeerIdentityString::new("alice"),
            to: PeerIdentityString::new("bob"),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 192.0.2.7 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "candidate");
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_answer_has_no_media_kind() {
        let msg: SignalingMessage<PeerIdentityString> = SignalingMessage::Answer {
            call_id: CallId::new(),
            from: PeerIdentityString::new("bob"),
            to: PeerIdentityString::new("alice"),
            description: SessionDescription::answer("v=0"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "answer");
        assert!(value.get("mediaKind").is_none());
        assert_eq!(value["description"]["kind"], "answer");
        assert_eq!(
            serde_json::from_value::<SessionDescription>(value["description"].clone())
                .unwrap()
                .kind,
            SdpKind::Answer
        );
    }

    #[tokio::test]
    async fn test_hub_delivers_in_send_order() {
        let hub: Arc<InMemorySignaling<PeerIdentityString>> = InMemorySignaling::new();
        let bob = PeerIdentityString::new("bob");
        let mut rx = hub.subscribe(&bob).await.unwrap();

        let first = CallId::new();
        let second = CallId::new();
        hub.publish(offer(first, "alice", "bob")).await.unwrap();
        hub.publish(offer(second, "alice", "bob")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().call_id(), first);
        assert_eq!(rx.recv().await.unwrap().call_id(), second);
    }

    #[tokio::test]
    async fn test_hub_publish_to_unknown_recipient_is_silent() {
        let hub: Arc<InMemorySignaling<PeerIdentityString>> = InMemorySignaling::new();
        let result = hub.publish(offer(CallId::new(), "alice", "nobody")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_hub_does_not_cross_deliver() {
        let hub: Arc<InMemorySignaling<PeerIdentityString>> = InMemorySignaling::new();
        let bob = PeerIdentityString::new("bob");
        let carol = PeerIdentityString::new("carol");
        let mut bob_rx = hub.subscribe(&bob).await.unwrap();
        let mut carol_rx = hub.subscribe(&carol).await.unwrap();

        hub.publish(offer(CallId::new(), "alice", "bob")).await.unwrap();

        assert!(bob_rx.recv().await.is_some());
        assert!(carol_rx.try_recv().is_err());
    }
}
