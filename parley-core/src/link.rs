//! Peer media link abstraction
//!
//! Provides abstraction over the point-to-point media engine so the call
//! machinery never touches engine types directly. One `MediaLink` is one
//! transport session for one call attempt: tracks go in, descriptions and
//! candidates come out, and connectivity changes arrive as events on a
//! channel instead of ad hoc callback assignment.

use crate::media::LocalTrack;
use crate::types::{CallId, IceCandidate, RemoteTrack, SessionDescription, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Media link errors
#[derive(Error, Debug, Clone)]
pub enum LinkError {
    /// The session has been closed
    #[error("media link closed")]
    Closed,

    /// Remote description was rejected by the engine
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    /// Remote candidate was rejected by the engine
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Session could not be created
    #[error("link setup failed: {0}")]
    Setup(String),
}

/// Connectivity of the underlying transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Session created, not yet negotiating
    New,
    /// Descriptions applied, paths being probed
    Connecting,
    /// Media can flow
    Connected,
    /// The peer went away
    Disconnected,
    /// Negotiation or transport failure
    Failed,
}

/// Events emitted by a media link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A locally discovered network path to trickle to the peer
    LocalCandidate(IceCandidate),
    /// A remote media track became available
    RemoteTrack(RemoteTrack),
    /// Connectivity changed
    Connectivity(LinkState),
}

/// One point-to-point media transport session
///
/// The engine behind this trait handles codec selection and NAT traversal;
/// callers only wire tracks and shuttle descriptions/candidates. All
/// asynchronous engine activity surfaces on the event channel handed to
/// [`MediaLinkFactory::open_link`]. After `close` returns, no further
/// event may be emitted.
#[async_trait]
pub trait MediaLink: Send + Sync {
    /// Attach a local capture track to the session
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed.
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), LinkError>;

    /// Create the local offer description
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed or the engine refuses.
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    /// Create the local answer description
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed or the engine refuses.
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    /// Apply the remote peer's description
    ///
    /// # Errors
    ///
    /// Returns error if the description is malformed or the session closed.
    async fn apply_remote_description(&self, desc: &SessionDescription) -> Result<(), LinkError>;

    /// Apply a remote network path candidate
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is malformed or the session closed.
    async fn apply_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), LinkError>;

    /// Tear the session down; idempotent
    async fn close(&self);
}

/// Factory for media links
///
/// `open_link` must construct promptly (no network round-trips); anything
/// slow belongs behind the event channel.
#[async_trait]
pub trait MediaLinkFactory: Send + Sync {
    /// Open a session for one call attempt, wiring its event channel
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot construct a session.
    async fn open_link(
        &self,
        call_id: CallId,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn MediaLink>, LinkError>;
}

/// In-process media link network
///
/// Pairs the two links opened under the same [`CallId`] and resolves
/// negotiation deterministically: a side reports `Connected` once it holds
/// both its own and the remote description, and sees the peer's tracks the
/// moment it applies the peer's description. Used by the demo binary and
/// the integration tests; a production build plugs a real engine in behind
/// the same factory trait.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    links: Arc<Mutex<HashMap<CallId, Vec<Arc<HalfInner>>>>>,
}

impl LoopbackNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Force both halves of a call onto the failed path (test hook)
    pub async fn fail(&self, call_id: CallId) {
        let halves = self
            .links
            .lock()
            .get(&call_id)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        for half in halves {
            half.emit(LinkEvent::Connectivity(LinkState::Failed)).await;
        }
    }

    /// Remote candidates each half has applied so far, in receipt order
    ///
    /// Halves are listed in creation order (caller first for an outgoing
    /// call). Diagnostic surface; the integration tests assert queue
    /// flushing order through it.
    #[must_use]
    pub fn applied_candidates(&self, call_id: CallId) -> Vec<Vec<String>> {
        self.links
            .lock()
            .get(&call_id)
            .map(|halves| {
                halves
                    .iter()
                    .map(|h| h.applied_candidates.lock().clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct HalfInner {
    call_id: CallId,
    events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    closed: AtomicBool,
    announced: AtomicBool,
    local_desc: Mutex<Option<SessionDescription>>,
    remote_desc: Mutex<Option<SessionDescription>>,
    tracks: Mutex<Vec<(String, TrackKind)>>,
    applied_candidates: Mutex<Vec<String>>,
    peer: Mutex<Option<std::sync::Weak<HalfInner>>>,
}

impl HalfInner {
    fn new(call_id: CallId, events: mpsc::Sender<LinkEvent>) -> Arc<Self> {
        Arc::new(Self {
            call_id,
            events: Mutex::new(Some(events)),
            closed: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            local_desc: Mutex::new(None),
            remote_desc: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            applied_candidates: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn emit(&self, event: LinkEvent) {
        if self.is_closed() {
            return;
        }
        let Some(tx) = self.events.lock().clone() else {
            return;
        };
        let _ = tx.send(event).await;
    }

    fn synth_sdp(&self, role: &str) -> String {
        let tracks = self.tracks.lock();
        let media: Vec<&str> = tracks
            .iter()
            .map(|(_, kind)| match kind {
                TrackKind::Audio => "m=audio",
                TrackKind::Video => "m=video",
            })
            .collect();
        format!("v=0 o=loopback-{role} s={} {}", self.call_id, media.join(" "))
    }

    /// Surface the peer's tracks, then announce connectivity if both
    /// descriptions are in place.
    async fn after_description(&self) {
        let peer_tracks = {
            let peer = self.peer.lock().as_ref().and_then(std::sync::Weak::upgrade);
            peer.map(|p| p.tracks.lock().clone()).unwrap_or_default()
        };
        for (id, kind) in peer_tracks {
            self.emit(LinkEvent::RemoteTrack(RemoteTrack { id, kind })).await;
        }
        self.maybe_connected().await;
    }

    async fn maybe_connected(&self) {
        let ready = self.local_desc.lock().is_some() && self.remote_desc.lock().is_some();
        if ready && !self.announced.swap(true, Ordering::AcqRel) {
            self.emit(LinkEvent::Connectivity(LinkState::Connected)).await;
        }
    }
}

/// One half of a loopback pair
pub struct LoopbackLink {
    half: Arc<HalfInner>,
}

#[async_trait]
impl MediaLinkFactory for LoopbackNetwork {
    async fn open_link(
        &self,
        call_id: CallId,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn MediaLink>, LinkError> {
        let half = HalfInner::new(call_id, events);

        let mut links = self.links.lock();
        let halves = links.entry(call_id).or_default();
        if halves.len() >= 2 {
            return Err(LinkError::Setup(format!(
                "call {call_id} already has two link halves"
            )));
        }
        if let Some(other) = halves.first() {
            *other.peer.lock() = Some(Arc::downgrade(&half));
            *half.peer.lock() = Some(Arc::downgrade(other));
        }
        halves.push(Arc::clone(&half));
        drop(links);

        tracing::debug!(call_id = %call_id, "Loopback link opened");
        Ok(Box::new(LoopbackLink { half }))
    }
}

#[async_trait]
impl MediaLink for LoopbackLink {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), LinkError> {
        if self.half.is_closed() {
            return Err(LinkError::Closed);
        }
        self.half
            .tracks
            .lock()
            .push((track.id().to_string(), track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        if self.half.is_closed() {
            return Err(LinkError::Closed);
        }
        let desc = SessionDescription::offer(self.half.synth_sdp("caller"));
        *self.half.local_desc.lock() = Some(desc.clone());

        // Path discovery starts once the local description exists.
        self.half
            .emit(LinkEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:1 1 udp 2122260223 198.51.100.1 50000 typ host generation 0 call {}",
                self.half.call_id
            ))))
            .await;

        Ok(desc)
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        if self.half.is_closed() {
            return Err(LinkError::Closed);
        }
        if self.half.remote_desc.lock().is_none() {
            return Err(LinkError::InvalidDescription(
                "answer requested before a remote offer was applied".to_string(),
            ));
        }
        let desc = SessionDescription::answer(self.half.synth_sdp("callee"));
        *self.half.local_desc.lock() = Some(desc.clone());

        self.half
            .emit(LinkEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:2 1 udp 2122260223 198.51.100.2 50001 typ host generation 0 call {}",
                self.half.call_id
            ))))
            .await;

        self.half.maybe_connected().await;
        Ok(desc)
    }

    async fn apply_remote_description(&self, desc: &SessionDescription) -> Result<(), LinkError> {
        if self.half.is_closed() {
            return Err(LinkError::Closed);
        }
        if desc.sdp.trim().is_empty() {
            return Err(LinkError::InvalidDescription("empty sdp".to_string()));
        }
        *self.half.remote_desc.lock() = Some(desc.clone());
        self.half.after_description().await;
        Ok(())
    }

    async fn apply_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), LinkError> {
        if self.half.is_closed() {
            return Err(LinkError::Closed);
        }
        if candidate.candidate.trim().is_empty() {
            return Err(LinkError::InvalidCandidate("empty candidate".to_string()));
        }
        self.half
            .applied_candidates
            .lock()
            .push(candidate.candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        if self.half.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender guarantees nothing fires after close.
        self.half.events.lock().take();
        tracing::debug!(call_id = %self.half.call_id, "Loopback link closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn drain(rx: &mut mpsc::Receiver<LinkEvent>) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn has_connected(events: &[LinkEvent]) -> bool {
        events
            .iter()
            .any(|e| matches!(e, LinkEvent::Connectivity(LinkState::Connected)))
    }

    #[tokio::test]
    async fn test_offer_answer_converges_both_sides() {
        let network = LoopbackNetwork::new();
        let call_id = CallId::new();
        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);

        let a = network.open_link(call_id, a_tx).await.unwrap();
        let b = network.open_link(call_id, b_tx).await.unwrap();

        let mic = LocalTrack::new("mic-a", TrackKind::Audio, "default-audio");
        a.add_local_track(&mic).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        b.apply_remote_description(&offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.apply_remote_description(&answer).await.unwrap();

        let a_events = drain(&mut a_rx).await;
        let b_events = drain(&mut b_rx).await;
        assert!(has_connected(&a_events), "caller side never connected");
        assert!(has_connected(&b_events), "callee side never connected");

        // Callee saw the caller's track when it applied the offer.
        assert!(b_events
            .iter()
            .any(|e| matches!(e, LinkEvent::RemoteTrack(t) if t.id == "mic-a")));
    }

    #[tokio::test]
    async fn test_remote_tracks_arrive_before_connected() {
        let network = LoopbackNetwork::new();
        let call_id = CallId::new();
        let (a_tx, _a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);

        let a = network.open_link(call_id, a_tx).await.unwrap();
        let b = network.open_link(call_id, b_tx).await.unwrap();

        let cam = LocalTrack::new("cam-a", TrackKind::Video, "default-video");
        a.add_local_track(&cam).await.unwrap();
        let offer = a.create_offer().await.unwrap();
        b.apply_remote_description(&offer).await.unwrap();
        b.create_answer().await.unwrap();

        let events = drain(&mut b_rx).await;
        let track_pos = events
            .iter()
            .position(|e| matches!(e, LinkEvent::RemoteTrack(_)))
            .unwrap();
        let connected_pos = events
            .iter()
            .position(|e| matches!(e, LinkEvent::Connectivity(LinkState::Connected)))
            .unwrap();
        assert!(track_pos < connected_pos);
    }

    #[tokio::test]
    async fn test_malformed_input_is_rejected() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::channel(16);
        let link = network.open_link(CallId::new(), tx).await.unwrap();

        let bad_desc = SessionDescription::offer("   ");
        assert!(matches!(
            link.apply_remote_description(&bad_desc).await,
            Err(LinkError::InvalidDescription(_))
        ));

        let bad_candidate = IceCandidate::new("");
        assert!(matches!(
            link.apply_remote_candidate(&bad_candidate).await,
            Err(LinkError::InvalidCandidate(_))
        ));
    }

    #[tokio::test]
    async fn test_answer_before_offer_is_rejected() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::channel(16);
        let link = network.open_link(CallId::new(), tx).await.unwrap();
        assert!(matches!(
            link.create_answer().await,
            Err(LinkError::InvalidDescription(_))
        ));
    }

    #[tokio::test]
    async fn test_no_events_after_close() {
        let network = LoopbackNetwork::new();
        let call_id = CallId::new();
        let (tx, mut rx) = mpsc::channel(16);
        let link = network.open_link(call_id, tx).await.unwrap();

        link.close().await;
        link.close().await; // idempotent

        network.fail(call_id).await;
        assert!(rx.recv().await.is_none(), "closed link emitted an event");

        assert!(matches!(link.create_offer().await, Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn test_third_half_is_refused() {
        let network = LoopbackNetwork::new();
        let call_id = CallId::new();
        let (tx1, _r1) = mpsc::channel(16);
        let (tx2, _r2) = mpsc::channel(16);
        let (tx3, _r3) = mpsc::channel(16);

        network.open_link(call_id, tx1).await.unwrap();
        network.open_link(call_id, tx2).await.unwrap();
        assert!(network.open_link(call_id, tx3).await.is_err());
    }

    #[tokio::test]
    async fn test_candidates_recorded_in_receipt_order() {
        let network = LoopbackNetwork::new();
        let call_id = CallId::new();
        let (tx, _rx) = mpsc::channel(16);
        let link = network.open_link(call_id, tx).await.unwrap();

        for n in 0..3 {
            link.apply_remote_candidate(&IceCandidate::new(format!("candidate:{n}")))
                .await
                .unwrap();
        }

        let log = network.applied_candidates(call_id);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], vec!["candidate:0", "candidate:1", "candidate:2"]);
    }
}
