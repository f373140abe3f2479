//! Peer session ownership
//!
//! A `PeerSession` owns exactly one media link for exactly one call
//! attempt. It is the trust boundary for remote input: malformed
//! candidates are logged and dropped (remote peers don't get to crash a
//! call), while a rejected remote description is surfaced to the manager,
//! which ends the call — nothing can progress without one.

use crate::link::{LinkError, LinkEvent, MediaLink, MediaLinkFactory};
use crate::media::LocalMediaHandle;
use crate::types::{CallId, IceCandidate, SessionDescription};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// One live transport session for one call attempt
pub struct PeerSession {
    call_id: CallId,
    link: Box<dyn MediaLink>,
    closed: AtomicBool,
}

impl PeerSession {
    /// Open the underlying session and wire its event channel
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot construct a session.
    pub async fn connect(
        factory: &dyn MediaLinkFactory,
        call_id: CallId,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Self, LinkError> {
        let link = factory.open_link(call_id, events).await?;
        Ok(Self {
            call_id,
            link,
            closed: AtomicBool::new(false),
        })
    }

    /// The attempt this session belongs to
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Attach every track of a local media handle
    ///
    /// # Errors
    ///
    /// Returns error if the session refuses a track.
    pub async fn add_local_tracks(&self, handle: &LocalMediaHandle) -> Result<(), LinkError> {
        for track in handle.tracks() {
            self.link.add_local_track(track).await?;
        }
        Ok(())
    }

    /// Create the local offer description
    ///
    /// # Errors
    ///
    /// Returns error if the engine refuses.
    pub async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.link.create_offer().await
    }

    /// Create the local answer description
    ///
    /// # Errors
    ///
    /// Returns error if the engine refuses.
    pub async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        self.link.create_answer().await
    }

    /// Apply the remote description
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects it; the caller treats that as a
    /// negotiation failure and tears the call down.
    pub async fn apply_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), LinkError> {
        if let Err(e) = self.link.apply_remote_description(desc).await {
            tracing::warn!(
                call_id = %self.call_id,
                error = %e,
                "Remote description rejected"
            );
            return Err(e);
        }
        Ok(())
    }

    /// Apply a remote candidate, dropping malformed input
    ///
    /// Remote input is untrusted; a candidate the engine rejects is logged
    /// and ignored rather than allowed to end the call.
    pub async fn apply_remote_candidate(&self, candidate: &IceCandidate) {
        if let Err(e) = self.link.apply_remote_candidate(candidate).await {
            tracing::warn!(
                call_id = %self.call_id,
                error = %e,
                "Dropping remote candidate"
            );
        }
    }

    /// Close the session; safe to call multiple times
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.close().await;
        tracing::debug!(call_id = %self.call_id, "Peer session closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::link::{LinkState, LoopbackNetwork};
    use crate::media::SyntheticMediaSource;
    use crate::media::MediaSource;
    use crate::types::MediaKind;

    #[tokio::test]
    async fn test_session_roundtrip_over_loopback() {
        let network = LoopbackNetwork::new();
        let call_id = CallId::new();
        let (a_tx, _a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);

        let a = PeerSession::connect(&network, call_id, a_tx).await.unwrap();
        let b = PeerSession::connect(&network, call_id, b_tx).await.unwrap();

        let handle = SyntheticMediaSource::granting()
            .acquire(MediaKind::Voice)
            .await
            .unwrap();
        a.add_local_tracks(&handle).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        b.apply_remote_description(&offer).await.unwrap();
        let _answer = b.create_answer().await.unwrap();

        let mut connected = false;
        while let Ok(ev) = b_rx.try_recv() {
            if matches!(ev, LinkEvent::Connectivity(LinkState::Connected)) {
                connected = true;
            }
        }
        assert!(connected);
    }

    #[tokio::test]
    async fn test_malformed_candidate_is_swallowed() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::channel(16);
        let session = PeerSession::connect(&network, CallId::new(), tx)
            .await
            .unwrap();

        // Must not error or panic.
        session.apply_remote_candidate(&IceCandidate::new("")).await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::channel(16);
        let session = PeerSession::connect(&network, CallId::new(), tx)
            .await
            .unwrap();

        session.close().await;
        session.close().await;
        assert!(session.create_offer().await.is_err());
    }
}
