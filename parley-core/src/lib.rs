//! Parley - real-time call signaling and session state machine
//!
//! This library establishes direct audio/video sessions between two users:
//! call initiation, ringing, offer/answer exchange, candidate exchange,
//! accept/reject/end semantics, timeouts, and teardown under partial
//! failure. It features:
//!
//! - **Single-actor state machine**: one `CallManager` per participant;
//!   user intents, inbound signaling, link callbacks and timers are merged
//!   through one mutation path, so no transition races another
//! - **Capability-surface transports**: the signaling channel, the capture
//!   devices and the media engine sit behind traits; the in-process
//!   implementations pair two endpoints deterministically for demos/tests
//! - **Resource discipline**: the media handle and the peer session are
//!   released on every exit path, and cleanup is idempotent
//!
//! # Examples
//!
//! ```rust,no_run
//! use parley_core::{
//!     CallManager, InMemorySignaling, LoopbackNetwork, MediaKind, PeerIdentityString, PeerInfo,
//!     SyntheticMediaSource,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub: Arc<InMemorySignaling<PeerIdentityString>> = InMemorySignaling::new();
//! let links = LoopbackNetwork::new();
//!
//! let alice = CallManager::builder(
//!     PeerIdentityString::new("alice"),
//!     hub.clone(),
//!     Arc::new(SyntheticMediaSource::granting()),
//!     Arc::new(links.clone()),
//! )
//! .spawn()
//! .await?;
//!
//! // Initiate a video call
//! let call_id = alice
//!     .start_call(
//!         PeerInfo::new(PeerIdentityString::new("bob"), "Bob"),
//!         MediaKind::Video,
//!     )
//!     .await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Call session management and state
pub mod call;

/// Signaling protocol and transports
pub mod signaling;

/// Local media acquisition
pub mod media;

/// Peer media link abstraction
pub mod link;

/// Peer session ownership
pub mod peer;

/// Peer identity abstraction
pub mod identity;

// Re-export main types at crate root
pub use call::{
    is_valid_transition, CallConfig, CallError, CallHistory, CallManager, CallManagerBuilder,
    CallMedia, UserDirectory,
};
pub use identity::{PeerIdentity, PeerIdentityString, PeerInfo, PeerProfile};
pub use link::{
    LinkError, LinkEvent, LinkState, LoopbackLink, LoopbackNetwork, MediaLink, MediaLinkFactory,
};
pub use media::{LocalMediaHandle, LocalTrack, MediaError, MediaSource, SyntheticMediaSource};
pub use peer::PeerSession;
pub use signaling::{InMemorySignaling, SignalingError, SignalingMessage, SignalingTransport};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallConfig, CallError, CallHistory, CallManager, UserDirectory};
    pub use crate::identity::{PeerIdentity, PeerIdentityString, PeerInfo, PeerProfile};
    pub use crate::link::{LoopbackNetwork, MediaLinkFactory};
    pub use crate::media::{MediaSource, SyntheticMediaSource};
    pub use crate::signaling::{InMemorySignaling, SignalingMessage, SignalingTransport};
    pub use crate::types::{
        CallEvent, CallId, CallOutcome, CallState, CallStatus, MediaKind,
    };
}
