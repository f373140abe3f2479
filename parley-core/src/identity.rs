//! Peer identity abstraction
//!
//! This module provides traits and types for peer identity in the call
//! system. It allows the library to work with whatever user-id scheme the
//! host platform uses, from plain strings to opaque account handles.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Trait for peer identity in the call system
///
/// Implementations must provide a way to uniquely identify users on the
/// signaling channel. The identity must be serializable, comparable, and
/// displayable.
pub trait PeerIdentity:
    Clone + Debug + Display + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Convert the identity to a string representation
    fn to_string_repr(&self) -> String;

    /// Try to create an identity from a string representation
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Get a unique identifier for this peer (for use in hash maps, etc.)
    fn unique_id(&self) -> String {
        self.to_string_repr()
    }
}

/// Simple string-based peer identity
///
/// This is a basic implementation that uses strings as user identifiers.
/// Suitable for testing or platforms whose account ids are already strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentityString(pub String);

impl PeerIdentityString {
    /// Create a new string-based peer identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentityString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerIdentity for PeerIdentityString {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for PeerIdentityString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerIdentityString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Display metadata resolved from the platform's user directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    /// Name shown on the call surface
    pub display_name: String,
    /// Avatar image location, if the user has one
    pub avatar_url: Option<String>,
}

/// Identity plus the display metadata a call surface renders
///
/// Present in `CallState` from ringing onward. For outgoing calls the
/// caller's UI supplies the metadata; for incoming calls it starts out as
/// the raw identity and is refined once the directory lookup resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub struct PeerInfo<I: PeerIdentity> {
    /// The peer's identity on the signaling channel
    pub id: I,
    /// Name shown on the call surface
    pub display_name: String,
    /// Avatar image location, if known
    pub avatar_url: Option<String>,
}

impl<I: PeerIdentity> PeerInfo<I> {
    /// Create peer info with an explicit display name
    pub fn new(id: I, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    /// Attach an avatar location
    #[must_use]
    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }

    /// Peer info for an identity whose profile has not been resolved yet
    pub fn unresolved(id: I) -> Self {
        let display_name = id.to_string_repr();
        Self {
            id,
            display_name,
            avatar_url: None,
        }
    }

    /// Overwrite the display metadata with a resolved directory profile
    pub fn apply_profile(&mut self, profile: PeerProfile) {
        self.display_name = profile.display_name;
        self.avatar_url = profile.avatar_url;
    }
}
