//! Call session management
//!
//! One `CallManager` exists per local participant, created at session start
//! and torn down at logout. It owns the single mutable `CallState` and is
//! the only writer: user intents, inbound signaling, link events and timers
//! all funnel through one actor task, so no two transitions are ever
//! applied concurrently.
//!
//! ```text
//!      Idle
//!        │ start_call / inbound offer
//!        ▼
//!     Ringing ──── ring timeout ───► NoAnswer ─┐
//!        │  ▲─ inbound reject ─► Rejected ─────┤
//!        ▼ accept / inbound answer             │
//!    Connecting ── link connected ─► Connected │
//!        │                             │       │ ≈2s hold
//!        └────── end / failure ──► Ended ──────┴──► Idle
//! ```

use crate::identity::{PeerIdentity, PeerInfo, PeerProfile};
use crate::link::{LinkError, LinkEvent, LinkState, MediaLinkFactory};
use crate::media::{LocalMediaHandle, MediaError, MediaSource};
use crate::peer::PeerSession;
use crate::signaling::{message_type, SignalingError, SignalingMessage, SignalingTransport};
use crate::types::{
    CallEvent, CallId, CallOutcome, CallRecord, CallState, CallStatus, IceCandidate, MediaKind,
    RemoteTrack, SdpKind, SessionDescription,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

/// Call manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// How long an unanswered outgoing call rings before giving up
    pub ring_timeout: Duration,
    /// How long a terminal status stays visible before the reset to idle
    pub terminal_hold: Duration,
    /// Depth of the command and internal event channels
    pub channel_capacity: usize,
    /// Depth of the call-event broadcast channel
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            terminal_hold: Duration::from_secs(2),
            channel_capacity: 64,
            event_capacity: 64,
        }
    }
}

/// Call management errors
///
/// Only local misuse surfaces as an error. Remote failures (media denial,
/// negotiation failure, dead peer) are absorbed into status transitions
/// and never thrown at the presentation adapter.
#[derive(Error, Debug)]
pub enum CallError {
    /// A call attempt already exists
    #[error("another call is already in progress")]
    Busy,

    /// No call in a state that allows this operation
    #[error("no call in a state that allows this operation")]
    InvalidState,

    /// The manager task is gone
    #[error("call manager is not running")]
    NotRunning,

    /// Transport failure while setting up the manager
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// User-directory collaborator
///
/// Resolves a peer identity into display metadata. Invoked from a spawned
/// task; a slow or absent directory never blocks a state transition.
#[async_trait]
pub trait UserDirectory<I: PeerIdentity>: Send + Sync {
    /// Resolve display metadata for a user, if known
    async fn lookup(&self, id: &I) -> Option<PeerProfile>;
}

/// Call-history collaborator
///
/// Receives one record per terminal transition. Invoked from a spawned
/// task and never blocks the state machine.
#[async_trait]
pub trait CallHistory<I: PeerIdentity>: Send + Sync {
    /// Persist a finished call attempt
    async fn log_call(&self, record: CallRecord<I>);
}

/// Media handles exposed to the presentation adapter for rendering
#[derive(Debug, Clone, Default)]
pub struct CallMedia {
    /// The local capture handle, while a call attempt holds one
    pub local: Option<LocalMediaHandle>,
    /// The most recent remote track, once media arrived
    pub remote: Option<RemoteTrack>,
}

/// Check whether a call status transition is allowed
///
/// Mirrors the session state machine: one attempt runs `Idle → Ringing →
/// Connecting → Connected`, every terminal display state drains back to
/// `Idle`, and failures can cut in from any active state.
#[must_use]
pub fn is_valid_transition(from: CallStatus, to: CallStatus) -> bool {
    use CallStatus::{Connected, Connecting, Ended, Idle, NoAnswer, Rejected, Ringing};
    matches!(
        (from, to),
        // Starting a call, either direction
        (Idle, Ringing)
            // Progressing through negotiation
            | (Ringing, Connecting)
            | (Connecting, Connected)
            // Ringing endings: local reject, remote reject, ring-out, cancel
            | (Ringing, Idle)
            | (Ringing, Rejected)
            | (Ringing, NoAnswer)
            | (Ringing, Ended)
            // Hang-ups and failures
            | (Connecting, Ended)
            | (Connected, Ended)
            // Terminal displays drain to idle
            | (Ended, Idle)
            | (Rejected, Idle)
            | (NoAnswer, Idle)
    )
}

enum Command<I: PeerIdentity> {
    Start {
        peer: PeerInfo<I>,
        kind: MediaKind,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Accept,
    Reject,
    End,
    ToggleMute {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleVideo {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    SwitchCamera {
        device: String,
    },
    Shutdown,
}

enum Internal {
    MediaReady {
        call_id: CallId,
        result: Result<LocalMediaHandle, MediaError>,
    },
    DescriptionReady {
        call_id: CallId,
        result: Result<SessionDescription, LinkError>,
    },
    Link {
        call_id: CallId,
        event: LinkEvent,
    },
    RingTimeout {
        call_id: CallId,
    },
    HoldElapsed {
        call_id: CallId,
    },
    PeerResolved {
        call_id: CallId,
        profile: PeerProfile,
    },
}

struct Session<I: PeerIdentity> {
    id: CallId,
    peer: PeerInfo<I>,
    kind: MediaKind,
    incoming: bool,
    status: CallStatus,
    remote_offer: Option<SessionDescription>,
    link: Option<Arc<PeerSession>>,
    media: Option<LocalMediaHandle>,
    pending_candidates: Vec<IceCandidate>,
    outbound_candidates: Vec<IceCandidate>,
    remote_described: bool,
    description_sent: bool,
    ring_timer: Option<JoinHandle<()>>,
    connected_at: Option<chrono::DateTime<Utc>>,
    // Monotonic twin of connected_at; wall clocks are for display only.
    connected_instant: Option<tokio::time::Instant>,
    released: bool,
}

impl<I: PeerIdentity> Session<I> {
    fn outgoing(id: CallId, peer: PeerInfo<I>, kind: MediaKind) -> Self {
        Self::new(id, peer, kind, false, None)
    }

    fn incoming(id: CallId, peer: PeerInfo<I>, kind: MediaKind, offer: SessionDescription) -> Self {
        Self::new(id, peer, kind, true, Some(offer))
    }

    fn new(
        id: CallId,
        peer: PeerInfo<I>,
        kind: MediaKind,
        incoming: bool,
        remote_offer: Option<SessionDescription>,
    ) -> Self {
        Self {
            id,
            peer,
            kind,
            incoming,
            status: CallStatus::Ringing,
            remote_offer,
            link: None,
            media: None,
            pending_candidates: Vec::new(),
            outbound_candidates: Vec::new(),
            remote_described: false,
            description_sent: false,
            ring_timer: None,
            connected_at: None,
            connected_instant: None,
            released: false,
        }
    }

    fn record(&self, local: &I, outcome: CallOutcome) -> CallRecord<I> {
        let duration_seconds = self
            .connected_instant
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        let (caller, receiver) = if self.incoming {
            (self.peer.id.clone(), local.clone())
        } else {
            (local.clone(), self.peer.id.clone())
        };
        CallRecord {
            caller,
            receiver,
            kind: self.kind,
            outcome,
            duration_seconds,
        }
    }
}

struct Driver<I: PeerIdentity> {
    local: I,
    config: CallConfig,
    signaling: Arc<dyn SignalingTransport<I>>,
    media_source: Arc<dyn MediaSource>,
    links: Arc<dyn MediaLinkFactory>,
    directory: Option<Arc<dyn UserDirectory<I>>>,
    history: Option<Arc<dyn CallHistory<I>>>,
    state_tx: watch::Sender<CallState<I>>,
    media_tx: watch::Sender<CallMedia>,
    events: broadcast::Sender<CallEvent<I>>,
    internal_tx: mpsc::Sender<Internal>,
    session: Option<Session<I>>,
}

impl<I: PeerIdentity> Driver<I> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command<I>>,
        mut signals: mpsc::Receiver<SignalingMessage<I>>,
        mut internal: mpsc::Receiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(msg) = signals.recv() => self.handle_signal(msg).await,
                Some(ev) = internal.recv() => self.handle_internal(ev).await,
            }
        }
        self.shutdown_teardown().await;
        tracing::debug!(local = %self.local, "Call manager stopped");
    }

    // ------------------------------------------------------------------
    // User intents
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command<I>) {
        match cmd {
            Command::Start { peer, kind, reply } => {
                let result = if self.session.is_some() {
                    Err(CallError::Busy)
                } else {
                    Ok(self.begin_outgoing(peer, kind))
                };
                let _ = reply.send(result);
            }
            Command::Accept => self.accept().await,
            Command::Reject => self.reject().await,
            Command::End => self.end().await,
            Command::ToggleMute { reply } => {
                let result = self.with_media(LocalMediaHandle::toggle_mute);
                let _ = reply.send(result);
            }
            Command::ToggleVideo { reply } => {
                let result = self.with_media(LocalMediaHandle::toggle_video);
                let _ = reply.send(result);
            }
            Command::SwitchCamera { device } => {
                match self.session.as_ref().and_then(|s| s.media.as_ref()) {
                    Some(media) => {
                        media.switch_camera(device);
                    }
                    None => tracing::debug!("Camera switch requested with no live media"),
                }
            }
            // Handled by the run loop before dispatch.
            Command::Shutdown => {}
        }
    }

    fn with_media(
        &self,
        op: impl Fn(&LocalMediaHandle) -> Result<bool, MediaError>,
    ) -> Result<bool, CallError> {
        let media = self
            .session
            .as_ref()
            .and_then(|s| s.media.as_ref())
            .ok_or(CallError::InvalidState)?;
        op(media).map_err(|_| CallError::InvalidState)
    }

    fn begin_outgoing(&mut self, peer: PeerInfo<I>, kind: MediaKind) -> CallId {
        let call_id = CallId::new();
        tracing::info!(call_id = %call_id, peer = %peer.id, kind = ?kind, "Starting outgoing call");

        let mut session = Session::outgoing(call_id, peer.clone(), kind);
        session.ring_timer = Some(self.spawn_ring_timer(call_id));
        self.session = Some(session);
        self.publish_state();
        self.emit(CallEvent::CallInitiated {
            call_id,
            peer,
            kind,
        });
        self.spawn_acquire(call_id, kind);
        call_id
    }

    async fn accept(&mut self) {
        match self.session.as_mut() {
            Some(s) if s.status == CallStatus::Ringing && s.incoming => {
                if s.remote_offer.is_none() {
                    // Caller hung up first; settle into ended, never throw.
                    tracing::warn!(call_id = %s.id, "Accepting a superseded offer");
                    self.begin_teardown(CallStatus::Ended, CallOutcome::Failed).await;
                    return;
                }
                let (call_id, kind) = (s.id, s.kind);
                tracing::info!(call_id = %call_id, "Accepting incoming call");
                self.set_status(CallStatus::Connecting);
                self.publish_state();
                self.spawn_acquire(call_id, kind);
            }
            Some(s) if s.status.is_terminal() => {
                tracing::debug!(call_id = %s.id, "Accept raced call teardown, ignoring");
            }
            _ => tracing::warn!("Accept with no ringing incoming call"),
        }
    }

    async fn reject(&mut self) {
        match self.session.as_ref() {
            Some(s) if s.status == CallStatus::Ringing && s.incoming => {
                let call_id = s.id;
                tracing::info!(call_id = %call_id, "Rejecting incoming call");
                let msg = SignalingMessage::Reject {
                    call_id,
                    from: self.local.clone(),
                    to: s.peer.id.clone(),
                };
                let record = s.record(&self.local, CallOutcome::Rejected);
                self.send_signal(msg).await;
                self.log_history(record);
                self.release_resources();
                self.emit(CallEvent::Terminated {
                    call_id,
                    outcome: CallOutcome::Rejected,
                });
                // Local reject goes straight back to idle, no display hold.
                self.session = None;
                self.publish_state();
            }
            _ => tracing::warn!("Reject with no ringing incoming call"),
        }
    }

    async fn end(&mut self) {
        match self.session.as_ref() {
            Some(s) if s.status == CallStatus::Ringing && s.incoming => {
                tracing::warn!(call_id = %s.id, "End requested on a ringing incoming call, use reject");
            }
            Some(s) if s.status.is_active() => {
                let call_id = s.id;
                tracing::info!(call_id = %call_id, "Ending call");
                let msg = SignalingMessage::End {
                    call_id,
                    from: self.local.clone(),
                    to: s.peer.id.clone(),
                };
                let outcome = if s.connected_at.is_some() {
                    CallOutcome::Completed
                } else {
                    CallOutcome::Cancelled
                };
                self.send_signal(msg).await;
                self.begin_teardown(CallStatus::Ended, outcome).await;
            }
            _ => tracing::debug!("End with no active call"),
        }
    }

    // ------------------------------------------------------------------
    // Inbound signaling
    // ------------------------------------------------------------------

    async fn handle_signal(&mut self, msg: SignalingMessage<I>) {
        if !msg.is_addressed_to(&self.local) {
            tracing::warn!(
                message_type = message_type(&msg),
                to = %msg.to(),
                "Dropping message not addressed to this endpoint"
            );
            return;
        }
        tracing::debug!(
            message_type = message_type(&msg),
            call_id = %msg.call_id(),
            from = %msg.from(),
            "Inbound signaling message"
        );
        match msg {
            SignalingMessage::Offer {
                call_id,
                from,
                media_kind,
                description,
                ..
            } => self.on_offer(call_id, from, media_kind, description).await,
            SignalingMessage::Answer {
                call_id,
                description,
                ..
            } => self.on_answer(call_id, description).await,
            SignalingMessage::Reject { call_id, .. } => self.on_remote_reject(call_id).await,
            SignalingMessage::End { call_id, .. } => self.on_remote_end(call_id).await,
            SignalingMessage::Candidate {
                call_id, candidate, ..
            } => self.on_candidate(call_id, candidate).await,
        }
    }

    async fn on_offer(
        &mut self,
        call_id: CallId,
        from: I,
        kind: MediaKind,
        description: SessionDescription,
    ) {
        if let Some(existing) = &self.session {
            tracing::debug!(
                call_id = %call_id,
                busy_with = %existing.id,
                "Busy, dropping inbound offer"
            );
            return;
        }
        if description.kind != SdpKind::Offer {
            tracing::warn!(call_id = %call_id, "Offer message carried a non-offer description");
            return;
        }

        tracing::info!(call_id = %call_id, from = %from, kind = ?kind, "Incoming call");
        let peer = PeerInfo::unresolved(from);
        // Media is NOT acquired yet; that waits for the user to accept.
        self.session = Some(Session::incoming(call_id, peer.clone(), kind, description));
        self.publish_state();
        self.emit(CallEvent::IncomingCall {
            call_id,
            peer: peer.clone(),
            kind,
        });
        self.spawn_directory_lookup(call_id, peer.id);
    }

    async fn on_answer(&mut self, call_id: CallId, description: SessionDescription) {
        let link = match self.session.as_mut() {
            Some(s)
                if s.id == call_id
                    && !s.incoming
                    && s.status == CallStatus::Ringing
                    && s.link.is_some() =>
            {
                if let Some(timer) = s.ring_timer.take() {
                    timer.abort();
                }
                s.link.clone()
            }
            _ => {
                tracing::debug!(call_id = %call_id, "Dropping answer for unknown or stale call");
                return;
            }
        };
        self.set_status(CallStatus::Connecting);
        self.publish_state();

        let Some(link) = link else { return };
        if link.apply_remote_description(&description).await.is_err() {
            self.begin_teardown(CallStatus::Ended, CallOutcome::Failed).await;
            return;
        }
        if let Some(s) = self.session.as_mut() {
            s.remote_described = true;
        }
        self.flush_pending().await;
    }

    async fn on_remote_reject(&mut self, call_id: CallId) {
        match self.session.as_ref() {
            Some(s) if s.id == call_id && !s.incoming && s.status == CallStatus::Ringing => {
                tracing::info!(call_id = %call_id, "Call rejected by peer");
                self.begin_teardown(CallStatus::Rejected, CallOutcome::Rejected).await;
            }
            _ => tracing::debug!(call_id = %call_id, "Dropping reject for unknown or stale call"),
        }
    }

    async fn on_remote_end(&mut self, call_id: CallId) {
        match self.session.as_ref() {
            Some(s) if s.id == call_id && s.status.is_active() => {
                tracing::info!(call_id = %call_id, "Call ended by peer");
                let outcome = if s.connected_at.is_some() {
                    CallOutcome::Completed
                } else {
                    CallOutcome::Cancelled
                };
                self.begin_teardown(CallStatus::Ended, outcome).await;
            }
            _ => tracing::debug!(call_id = %call_id, "Dropping end for unknown or stale call"),
        }
    }

    async fn on_candidate(&mut self, call_id: CallId, candidate: IceCandidate) {
        let link = match self.session.as_mut() {
            Some(s) if s.id == call_id && s.status.is_active() && !s.released => {
                if s.remote_described {
                    s.link.clone()
                } else {
                    // Remote description not applied yet; hold in receipt order.
                    s.pending_candidates.push(candidate);
                    return;
                }
            }
            _ => {
                // Late delivery for a call this side no longer recognizes.
                tracing::debug!(call_id = %call_id, "Dropping candidate for unknown or finished call");
                return;
            }
        };
        if let Some(link) = link {
            link.apply_remote_candidate(&candidate).await;
        }
    }

    /// Apply the held candidate queue, exactly once per session
    async fn flush_pending(&mut self) {
        let (link, queued) = match self.session.as_mut() {
            Some(s) if s.remote_described => (s.link.clone(), std::mem::take(&mut s.pending_candidates)),
            _ => return,
        };
        let Some(link) = link else { return };
        if queued.is_empty() {
            return;
        }
        tracing::debug!(count = queued.len(), "Flushing pending candidate queue");
        for candidate in queued {
            link.apply_remote_candidate(&candidate).await;
        }
    }

    // ------------------------------------------------------------------
    // Internal events: timers, acquisitions, link callbacks
    // ------------------------------------------------------------------

    async fn handle_internal(&mut self, ev: Internal) {
        match ev {
            Internal::MediaReady { call_id, result } => self.on_media_ready(call_id, result).await,
            Internal::DescriptionReady { call_id, result } => {
                self.on_description_ready(call_id, result).await;
            }
            Internal::Link { call_id, event } => self.on_link_event(call_id, event).await,
            Internal::RingTimeout { call_id } => self.on_ring_timeout(call_id).await,
            Internal::HoldElapsed { call_id } => self.on_hold_elapsed(call_id),
            Internal::PeerResolved { call_id, profile } => self.on_peer_resolved(call_id, profile),
        }
    }

    async fn on_media_ready(
        &mut self,
        call_id: CallId,
        result: Result<LocalMediaHandle, MediaError>,
    ) {
        let stale = match self.session.as_ref() {
            Some(s) => s.id != call_id || !s.status.is_active() || s.released,
            None => true,
        };
        if stale {
            // The attempt died while acquisition was in flight.
            if let Ok(handle) = result {
                tracing::debug!(call_id = %call_id, "Releasing media acquired for a finished attempt");
                handle.release();
            }
            return;
        }

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Media acquisition failed");
                self.begin_teardown(CallStatus::Ended, CallOutcome::Failed).await;
                return;
            }
        };

        let (link_tx, link_rx) = mpsc::channel(self.config.channel_capacity);
        let link = match PeerSession::connect(self.links.as_ref(), call_id, link_tx).await {
            Ok(link) => Arc::new(link),
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Peer session setup failed");
                handle.release();
                self.begin_teardown(CallStatus::Ended, CallOutcome::Failed).await;
                return;
            }
        };
        self.spawn_link_forwarder(call_id, link_rx);

        // Session owns both resources before anything else can fail, so
        // every teardown path releases them.
        let incoming = {
            let Some(s) = self.session.as_mut() else {
                handle.release();
                link.close().await;
                return;
            };
            s.media = Some(handle.clone());
            s.link = Some(Arc::clone(&link));
            s.incoming
        };
        self.media_tx.send_modify(|m| m.local = Some(handle.clone()));

        if link.add_local_tracks(&handle).await.is_err() {
            self.begin_teardown(CallStatus::Ended, CallOutcome::Failed).await;
            return;
        }

        if incoming {
            // Accept path: apply the stored offer, flush held candidates,
            // then answer.
            let offer = self.session.as_mut().and_then(|s| s.remote_offer.take());
            let Some(offer) = offer else {
                self.begin_teardown(CallStatus::Ended, CallOutcome::Failed).await;
                return;
            };
            if link.apply_remote_description(&offer).await.is_err() {
                self.begin_teardown(CallStatus::Ended, CallOutcome::Failed).await;
                return;
            }
            if let Some(s) = self.session.as_mut() {
                s.remote_described = true;
            }
            self.flush_pending().await;
            self.spawn_description(call_id, Arc::clone(&link), SdpKind::Answer);
        } else {
            self.spawn_description(call_id, Arc::clone(&link), SdpKind::Offer);
        }
    }

    async fn on_description_ready(
        &mut self,
        call_id: CallId,
        result: Result<SessionDescription, LinkError>,
    ) {
        let description = match result {
            Ok(desc) => desc,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Local description creation failed");
                if self.session.as_ref().is_some_and(|s| s.id == call_id) {
                    self.begin_teardown(CallStatus::Ended, CallOutcome::Failed).await;
                }
                return;
            }
        };

        let mut outbound = Vec::new();
        {
            let Some(s) = self.session.as_mut() else { return };
            if s.id != call_id || !s.status.is_active() || s.released {
                return;
            }
            let to = s.peer.id.clone();
            let from = self.local.clone();
            outbound.push(match description.kind {
                SdpKind::Offer => SignalingMessage::Offer {
                    call_id,
                    from: from.clone(),
                    to: to.clone(),
                    media_kind: s.kind,
                    description,
                },
                SdpKind::Answer => SignalingMessage::Answer {
                    call_id,
                    from: from.clone(),
                    to: to.clone(),
                    description,
                },
            });
            // Candidates trickled before the description went out follow it
            // in discovery order.
            for candidate in s.outbound_candidates.drain(..) {
                outbound.push(SignalingMessage::Candidate {
                    call_id,
                    from: from.clone(),
                    to: to.clone(),
                    candidate,
                });
            }
            s.description_sent = true;
        }
        for msg in outbound {
            self.send_signal(msg).await;
        }
    }

    async fn on_link_event(&mut self, call_id: CallId, event: LinkEvent) {
        if !self.session.as_ref().is_some_and(|s| s.id == call_id) {
            return;
        }
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let msg = {
                    let Some(s) = self.session.as_mut() else { return };
                    if !s.description_sent {
                        s.outbound_candidates.push(candidate);
                        return;
                    }
                    SignalingMessage::Candidate {
                        call_id,
                        from: self.local.clone(),
                        to: s.peer.id.clone(),
                        candidate,
                    }
                };
                self.send_signal(msg).await;
            }
            LinkEvent::RemoteTrack(track) => {
                tracing::debug!(call_id = %call_id, track_id = %track.id, "Remote track available");
                self.media_tx.send_modify(|m| m.remote = Some(track.clone()));
                self.emit(CallEvent::RemoteTrack { call_id, track });
            }
            LinkEvent::Connectivity(state) => self.on_connectivity(call_id, state).await,
        }
    }

    async fn on_connectivity(&mut self, call_id: CallId, state: LinkState) {
        match state {
            LinkState::Connected => {
                let Some(s) = self.session.as_mut() else { return };
                if s.status != CallStatus::Connecting {
                    return;
                }
                s.connected_at = Some(Utc::now());
                s.connected_instant = Some(tokio::time::Instant::now());
                self.set_status(CallStatus::Connected);
                self.publish_state();
                self.emit(CallEvent::Connected { call_id });
                tracing::info!(call_id = %call_id, "Call connected");
            }
            LinkState::Failed | LinkState::Disconnected => {
                if self.session.as_ref().is_some_and(|s| s.status.is_active()) {
                    tracing::warn!(call_id = %call_id, state = ?state, "Peer unreachable");
                    self.begin_teardown(CallStatus::Ended, CallOutcome::Failed).await;
                }
            }
            LinkState::New | LinkState::Connecting => {}
        }
    }

    async fn on_ring_timeout(&mut self, call_id: CallId) {
        // Only meaningful while the same attempt is still ringing out.
        match self.session.as_ref() {
            Some(s) if s.id == call_id && s.status == CallStatus::Ringing && !s.incoming => {
                tracing::info!(call_id = %call_id, "Ring timeout, no answer");
                self.begin_teardown(CallStatus::NoAnswer, CallOutcome::NoAnswer).await;
            }
            _ => tracing::debug!(call_id = %call_id, "Stale ring timer ignored"),
        }
    }

    fn on_hold_elapsed(&mut self, call_id: CallId) {
        match self.session.as_ref() {
            Some(s) if s.id == call_id && s.status.is_terminal() => {
                self.session = None;
                self.publish_state();
            }
            _ => {}
        }
    }

    fn on_peer_resolved(&mut self, call_id: CallId, profile: PeerProfile) {
        let Some(s) = self.session.as_mut() else { return };
        if s.id != call_id {
            return;
        }
        s.peer.apply_profile(profile);
        self.publish_state();
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Move the attempt to a terminal display state, release everything,
    /// and schedule the reset to idle. Safe to reach from any exit path;
    /// repeated calls are no-ops.
    async fn begin_teardown(&mut self, status: CallStatus, outcome: CallOutcome) {
        let (call_id, record) = {
            let Some(s) = self.session.as_ref() else { return };
            if s.status.is_terminal() {
                return;
            }
            (s.id, s.record(&self.local, outcome))
        };
        self.release_resources();
        self.set_status(status);
        self.publish_state();
        self.emit(CallEvent::Terminated { call_id, outcome });
        self.log_history(record);
        self.spawn_hold_timer(call_id);
        tracing::info!(call_id = %call_id, status = ?status, outcome = ?outcome, "Call torn down");
    }

    /// Release timers, the peer session, and the media handle. Idempotent.
    fn release_resources(&mut self) {
        let Some(s) = self.session.as_mut() else { return };
        if s.released {
            return;
        }
        s.released = true;
        if let Some(timer) = s.ring_timer.take() {
            timer.abort();
        }
        if let Some(link) = s.link.take() {
            tokio::spawn(async move { link.close().await });
        }
        if let Some(media) = s.media.take() {
            media.release();
        }
        s.remote_offer = None;
        s.pending_candidates.clear();
        s.outbound_candidates.clear();
        self.media_tx.send_replace(CallMedia::default());
    }

    async fn shutdown_teardown(&mut self) {
        let farewell = match self.session.as_ref() {
            Some(s) if s.status.is_active() => Some(SignalingMessage::End {
                call_id: s.id,
                from: self.local.clone(),
                to: s.peer.id.clone(),
            }),
            _ => None,
        };
        if let Some(msg) = farewell {
            self.send_signal(msg).await;
        }
        self.release_resources();
        self.session = None;
        self.state_tx.send_replace(CallState::idle());
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn set_status(&mut self, to: CallStatus) {
        let Some(s) = self.session.as_mut() else { return };
        let from = s.status;
        if from == to {
            return;
        }
        if !is_valid_transition(from, to) {
            tracing::warn!(from = ?from, to = ?to, "Unexpected call status transition");
        }
        s.status = to;
    }

    fn publish_state(&self) {
        let state = match self.session.as_ref() {
            Some(s) => CallState {
                status: s.status,
                call_id: Some(s.id),
                is_incoming: s.incoming,
                kind: Some(s.kind),
                peer: Some(s.peer.clone()),
                started_at: s.connected_at,
            },
            None => CallState::idle(),
        };
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: CallEvent<I>) {
        let _ = self.events.send(event);
    }

    async fn send_signal(&self, message: SignalingMessage<I>) {
        tracing::debug!(
            message_type = message_type(&message),
            to = %message.to(),
            "Publishing signaling message"
        );
        if let Err(e) = self.signaling.publish(message).await {
            // Best-effort channel; liveness is the ring timer's job.
            tracing::warn!(error = %e, "Failed to publish signaling message");
        }
    }

    fn log_history(&self, record: CallRecord<I>) {
        let Some(history) = self.history.clone() else { return };
        tokio::spawn(async move { history.log_call(record).await });
    }

    fn spawn_directory_lookup(&self, call_id: CallId, id: I) {
        let Some(directory) = self.directory.clone() else { return };
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Some(profile) = directory.lookup(&id).await {
                let _ = internal.send(Internal::PeerResolved { call_id, profile }).await;
            }
        });
    }

    fn spawn_acquire(&self, call_id: CallId, kind: MediaKind) {
        let source = Arc::clone(&self.media_source);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = source.acquire(kind).await;
            let _ = internal.send(Internal::MediaReady { call_id, result }).await;
        });
    }

    fn spawn_description(&self, call_id: CallId, link: Arc<PeerSession>, kind: SdpKind) {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match kind {
                SdpKind::Offer => link.create_offer().await,
                SdpKind::Answer => link.create_answer().await,
            };
            let _ = internal
                .send(Internal::DescriptionReady { call_id, result })
                .await;
        });
    }

    fn spawn_link_forwarder(&self, call_id: CallId, mut events: mpsc::Receiver<LinkEvent>) {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if internal.send(Internal::Link { call_id, event }).await.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_ring_timer(&self, call_id: CallId) -> JoinHandle<()> {
        let timeout = self.config.ring_timeout;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal.send(Internal::RingTimeout { call_id }).await;
        })
    }

    fn spawn_hold_timer(&self, call_id: CallId) {
        let hold = self.config.terminal_hold;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            let _ = internal.send(Internal::HoldElapsed { call_id }).await;
        });
    }
}

/// Handle to the per-participant call actor
///
/// Cheap to share with every UI surface that needs it; all methods funnel
/// into the single driver task. Dropping the handle does not stop the
/// actor — call [`CallManager::shutdown`] at logout.
pub struct CallManager<I: PeerIdentity> {
    local: I,
    commands: mpsc::Sender<Command<I>>,
    state_rx: watch::Receiver<CallState<I>>,
    media_rx: watch::Receiver<CallMedia>,
    events: broadcast::Sender<CallEvent<I>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<I: PeerIdentity> CallManager<I> {
    /// Create a builder
    #[must_use]
    pub fn builder(
        local: I,
        signaling: Arc<dyn SignalingTransport<I>>,
        media: Arc<dyn MediaSource>,
        links: Arc<dyn MediaLinkFactory>,
    ) -> CallManagerBuilder<I> {
        CallManagerBuilder::new(local, signaling, media, links)
    }

    /// The local participant's identity
    #[must_use]
    pub fn local_identity(&self) -> &I {
        &self.local
    }

    /// Start an outgoing call
    ///
    /// # Errors
    ///
    /// Returns `CallError::Busy` while any call attempt exists, or
    /// `CallError::NotRunning` after shutdown.
    #[tracing::instrument(skip(self, peer), fields(peer = %peer.id, kind = ?kind))]
    pub async fn start_call(
        &self,
        peer: PeerInfo<I>,
        kind: MediaKind,
    ) -> Result<CallId, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { peer, kind, reply })
            .await
            .map_err(|_| CallError::NotRunning)?;
        rx.await.map_err(|_| CallError::NotRunning)?
    }

    /// Accept the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns error only if the manager is not running; races with remote
    /// hang-up settle into the `Ended` state instead of failing.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.send(Command::Accept).await
    }

    /// Decline the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns error only if the manager is not running.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.send(Command::Reject).await
    }

    /// Hang up the current call (or cancel an unanswered outgoing one)
    ///
    /// # Errors
    ///
    /// Returns error only if the manager is not running.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.send(Command::End).await
    }

    /// Flip the microphone mute flag; returns the new muted state
    ///
    /// Only mutates the live track's enable flag, never renegotiates.
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` with no live media.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ToggleMute { reply })
            .await
            .map_err(|_| CallError::NotRunning)?;
        rx.await.map_err(|_| CallError::NotRunning)?
    }

    /// Flip the camera enable flag; returns the new enabled state
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` with no live video track.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ToggleVideo { reply })
            .await
            .map_err(|_| CallError::NotRunning)?;
        rx.await.map_err(|_| CallError::NotRunning)?
    }

    /// Best-effort camera device switch; never changes call state
    ///
    /// # Errors
    ///
    /// Returns error only if the manager is not running.
    pub async fn switch_camera(&self, device: impl Into<String>) -> Result<(), CallError> {
        self.send(Command::SwitchCamera {
            device: device.into(),
        })
        .await
    }

    /// Snapshot of the current call state
    #[must_use]
    pub fn call_state(&self) -> CallState<I> {
        self.state_rx.borrow().clone()
    }

    /// Watch channel carrying every state snapshot
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<CallState<I>> {
        self.state_rx.clone()
    }

    /// Seconds the current call has been connected, if it is
    #[must_use]
    pub fn call_duration_seconds(&self) -> Option<u64> {
        self.state_rx.borrow().duration_seconds()
    }

    /// The local media handle, while a call attempt holds one
    #[must_use]
    pub fn local_media(&self) -> Option<LocalMediaHandle> {
        self.media_rx.borrow().local.clone()
    }

    /// The most recent remote track, once media arrived
    #[must_use]
    pub fn remote_track(&self) -> Option<RemoteTrack> {
        self.media_rx.borrow().remote.clone()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<I>> {
        self.events.subscribe()
    }

    /// Call events as a stream
    #[must_use]
    pub fn event_stream(&self) -> BroadcastStream<CallEvent<I>> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Stop the actor, hanging up politely if a call is active
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn send(&self, cmd: Command<I>) -> Result<(), CallError> {
        self.commands.send(cmd).await.map_err(|_| CallError::NotRunning)
    }
}

/// Call manager builder
pub struct CallManagerBuilder<I: PeerIdentity> {
    local: I,
    config: CallConfig,
    signaling: Arc<dyn SignalingTransport<I>>,
    media: Arc<dyn MediaSource>,
    links: Arc<dyn MediaLinkFactory>,
    directory: Option<Arc<dyn UserDirectory<I>>>,
    history: Option<Arc<dyn CallHistory<I>>>,
}

impl<I: PeerIdentity> CallManagerBuilder<I> {
    /// Create a builder over the three capability surfaces
    #[must_use]
    pub fn new(
        local: I,
        signaling: Arc<dyn SignalingTransport<I>>,
        media: Arc<dyn MediaSource>,
        links: Arc<dyn MediaLinkFactory>,
    ) -> Self {
        Self {
            local,
            config: CallConfig::default(),
            signaling,
            media,
            links,
            directory: None,
            history: None,
        }
    }

    /// Override the configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a user-directory collaborator
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn UserDirectory<I>>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Attach a call-history collaborator
    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn CallHistory<I>>) -> Self {
        self.history = Some(history);
        self
    }

    /// Subscribe to signaling and start the actor task
    ///
    /// # Errors
    ///
    /// Returns error if the signaling subscription cannot be established.
    pub async fn spawn(self) -> Result<CallManager<I>, CallError> {
        let signals = self.signaling.subscribe(&self.local).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.channel_capacity);
        let (internal_tx, internal_rx) = mpsc::channel(self.config.channel_capacity);
        let (state_tx, state_rx) = watch::channel(CallState::idle());
        let (media_tx, media_rx) = watch::channel(CallMedia::default());
        let (event_tx, _) = broadcast::channel(self.config.event_capacity);

        let driver = Driver {
            local: self.local.clone(),
            config: self.config,
            signaling: self.signaling,
            media_source: self.media,
            links: self.links,
            directory: self.directory,
            history: self.history,
            state_tx,
            media_tx,
            events: event_tx.clone(),
            internal_tx,
            session: None,
        };
        let task = tokio::spawn(driver.run(cmd_rx, signals, internal_rx));
        tracing::info!(local = %self.local, "Call manager started");

        Ok(CallManager {
            local: self.local,
            commands: cmd_tx,
            state_rx,
            media_rx,
            events: event_tx,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }
}
