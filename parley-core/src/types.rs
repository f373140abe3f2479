//! Call types and data structures

use crate::identity::{PeerIdentity, PeerInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one call attempt
///
/// Every signaling message carries the id of the attempt it belongs to, so
/// late deliveries for a session that has since ended can be recognized and
/// dropped instead of corrupting a successor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the call carries, fixed at offer time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone only
    Voice,
    /// Microphone and camera
    Video,
}

impl MediaKind {
    /// Whether this kind includes a camera track
    #[must_use]
    pub fn wants_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Kind of a local capture track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone capture
    Audio,
    /// Camera capture
    Video,
}

/// One half of the session-description exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Which half of the exchange this is
    pub kind: SdpKind,
    /// Description payload, opaque to the signaling layer
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Offer/answer discriminator for a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// First half of the exchange
    Offer,
    /// Second half of the exchange
    Answer,
}

/// A discovered network path descriptor exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// Media section id the candidate belongs to
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// Media line index the candidate belongs to
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Create a candidate with just the candidate string
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Call status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    /// No active call
    Idle,
    /// Outgoing call waiting for the peer, or incoming call waiting on us
    Ringing,
    /// Descriptions exchanged, connectivity being established
    Connecting,
    /// Media is flowing
    Connected,
    /// Call over; shown briefly before resetting to idle
    Ended,
    /// Outgoing call was rejected by the peer
    Rejected,
    /// Outgoing call rang out
    NoAnswer,
}

impl CallStatus {
    /// Whether this status is a terminal display state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::NoAnswer)
    }

    /// Whether a call attempt is in progress (not idle, not terminal)
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Ringing | Self::Connecting | Self::Connected)
    }
}

/// The single call record owned by the manager
///
/// Published through a watch channel; the presentation adapter only ever
/// observes snapshots of this value, never intermediate mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub struct CallState<I: PeerIdentity> {
    /// Current status
    pub status: CallStatus,
    /// Id of the current attempt; `None` at idle
    pub call_id: Option<CallId>,
    /// Set at creation, immutable for the life of the session
    pub is_incoming: bool,
    /// Fixed at offer time; `None` at idle
    pub kind: Option<MediaKind>,
    /// The other participant; present from ringing onward
    pub peer: Option<PeerInfo<I>>,
    /// Set only on the transition into `Connected`, never altered after
    pub started_at: Option<DateTime<Utc>>,
}

impl<I: PeerIdentity> CallState<I> {
    /// The idle state
    pub fn idle() -> Self {
        Self {
            status: CallStatus::Idle,
            call_id: None,
            is_incoming: false,
            kind: None,
            peer: None,
            started_at: None,
        }
    }

    /// Whether no call attempt exists
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.status == CallStatus::Idle
    }

    /// Seconds the call has been connected, `None` before `Connected`
    #[must_use]
    pub fn duration_seconds(&self) -> Option<u64> {
        let started = self.started_at?;
        let elapsed = (Utc::now() - started).num_seconds();
        Some(elapsed.max(0) as u64)
    }
}

impl<I: PeerIdentity> Default for CallState<I> {
    fn default() -> Self {
        Self::idle()
    }
}

/// How a call attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallOutcome {
    /// Connected, then hung up
    Completed,
    /// Callee declined
    Rejected,
    /// Rang out after the ring timeout
    NoAnswer,
    /// Hung up before the call connected
    Cancelled,
    /// Media, negotiation, or connectivity failure
    Failed,
}

/// Record handed to the call-history collaborator on every terminal transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub struct CallRecord<I: PeerIdentity> {
    /// Who initiated the call
    pub caller: I,
    /// Who was called
    pub receiver: I,
    /// Voice or video
    pub kind: MediaKind,
    /// How the attempt ended
    pub outcome: CallOutcome,
    /// Connected time in seconds; zero if the call never connected
    pub duration_seconds: u64,
}

/// A media track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier assigned by the remote side
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
}

/// Call event for notifications
///
/// Broadcast alongside the state watch so multiple UI surfaces can observe
/// one manager without polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub enum CallEvent<I: PeerIdentity> {
    /// An offer arrived and the call is ringing locally
    IncomingCall {
        /// Attempt identifier
        call_id: CallId,
        /// The caller
        peer: PeerInfo<I>,
        /// Voice or video
        kind: MediaKind,
    },
    /// A local call attempt started ringing the peer
    CallInitiated {
        /// Attempt identifier
        call_id: CallId,
        /// The callee
        peer: PeerInfo<I>,
        /// Voice or video
        kind: MediaKind,
    },
    /// Connectivity established; media is flowing
    Connected {
        /// Attempt identifier
        call_id: CallId,
    },
    /// A remote media track became available for rendering
    RemoteTrack {
        /// Attempt identifier
        call_id: CallId,
        /// The track
        track: RemoteTrack,
    },
    /// The attempt reached a terminal state
    Terminated {
        /// Attempt identifier
        call_id: CallId,
        /// How it ended
        outcome: CallOutcome,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentityString;

    #[test]
    fn test_call_id_unique() {
        assert_ne!(CallId::new(), CallId::new());
    }

    #[test]
    fn test_media_kind() {
        assert!(!MediaKind::Voice.wants_video());
        assert!(MediaKind::Video.wants_video());
    }

    #[test]
    fn test_status_predicates() {
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::NoAnswer.is_terminal());
        assert!(CallStatus::Rejected.is_terminal());
        assert!(!CallStatus::Connected.is_terminal());
        assert!(CallStatus::Ringing.is_active());
        assert!(!CallStatus::Idle.is_active());
        assert!(!CallStatus::Ended.is_active());
    }

    #[test]
    fn test_idle_state() {
        let state: CallState<PeerIdentityString> = CallState::idle();
        assert!(state.is_idle());
        assert!(state.call_id.is_none());
        assert!(state.peer.is_none());
        assert_eq!(state.duration_seconds(), None);
    }

    #[test]
    fn test_duration_counts_from_started_at() {
        let mut state: CallState<PeerIdentityString> = CallState::idle();
        state.status = CallStatus::Connected;
        state.started_at = Some(Utc::now() - chrono::Duration::seconds(42));
        let secs = state.duration_seconds().unwrap();
        assert!((42..=43).contains(&secs));
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&CallStatus::NoAnswer).unwrap();
        assert_eq!(json, "\"no-answer\"");
    }
}
