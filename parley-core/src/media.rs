//! Local media acquisition and track handles
//!
//! The capture device layer is consumed through the `MediaSource` trait:
//! the manager asks for a handle matching the call's media kind and owns it
//! exclusively for the life of one attempt. Handles expose per-track enable
//! flags (mute, camera off) and a `release()` that is safe to call any
//! number of times, because every one of the manager's exit paths releases.

use crate::types::{MediaKind, TrackKind};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// Permission denied or no usable device
    #[error("media unavailable: {0}")]
    Unavailable(String),

    /// The handle has no track of the requested kind
    #[error("no {0} track on this handle")]
    TrackMissing(&'static str),
}

/// One local capture track
///
/// Cheap to clone; all clones observe the same enable/stop flags.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    device: RwLock<String>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    /// Create an enabled track bound to a capture device
    pub fn new(id: impl Into<String>, kind: TrackKind, device: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                device: RwLock::new(device.into()),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Audio or video
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Capture device currently feeding this track
    #[must_use]
    pub fn device(&self) -> String {
        self.inner.device.read().clone()
    }

    /// Whether the track is producing media
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable the track without touching the session
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Flip the enable flag, returning the new value
    pub fn toggle(&self) -> bool {
        let enabled = !self.is_enabled();
        self.set_enabled(enabled);
        enabled
    }

    /// Stop the track for good; a stopped track never re-enables
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    /// Whether the track has been stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Point the track at a different capture device
    pub fn set_device(&self, device: impl Into<String>) {
        *self.inner.device.write() = device.into();
    }
}

/// Exclusive handle over the local capture devices for one call attempt
///
/// Clones share the underlying tracks; `release()` is idempotent and stops
/// every track, so calling it from multiple exit paths is harmless.
#[derive(Debug, Clone)]
pub struct LocalMediaHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    tracks: Vec<LocalTrack>,
    released: AtomicBool,
}

impl LocalMediaHandle {
    /// Build a handle over freshly acquired tracks
    #[must_use]
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                tracks,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// All tracks on this handle
    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.inner.tracks
    }

    /// The microphone track, if present
    #[must_use]
    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.inner.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    /// The camera track, if present
    #[must_use]
    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.inner.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Number of tracks that have not been stopped
    #[must_use]
    pub fn active_tracks(&self) -> usize {
        self.inner.tracks.iter().filter(|t| !t.is_stopped()).count()
    }

    /// Whether `release` has run
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Stop all tracks and give the devices back
    ///
    /// Safe to call multiple times; only the first call does work.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for track in &self.inner.tracks {
            track.set_enabled(false);
            track.stop();
        }
        tracing::debug!(tracks = self.inner.tracks.len(), "Local media released");
    }

    /// Flip the microphone enable flag; returns the new muted state
    ///
    /// # Errors
    ///
    /// Returns error if the handle carries no audio track.
    pub fn toggle_mute(&self) -> Result<bool, MediaError> {
        let track = self.audio_track().ok_or(MediaError::TrackMissing("audio"))?;
        Ok(!track.toggle())
    }

    /// Flip the camera enable flag; returns the new enabled state
    ///
    /// # Errors
    ///
    /// Returns error if the handle carries no video track.
    pub fn toggle_video(&self) -> Result<bool, MediaError> {
        let track = self.video_track().ok_or(MediaError::TrackMissing("video"))?;
        Ok(track.toggle())
    }

    /// Best-effort switch of the camera device; never touches call state
    ///
    /// Returns `false` when there is no video track to repoint.
    pub fn switch_camera(&self, device: impl Into<String>) -> bool {
        match self.video_track() {
            Some(track) => {
                let device = device.into();
                tracing::info!(track_id = %track.id(), device = %device, "Switching camera device");
                track.set_device(device);
                true
            }
            None => {
                tracing::debug!("Camera switch requested on a voice-only handle");
                false
            }
        }
    }
}

/// Capture device layer
///
/// Implementations request microphone (and camera for video calls) access
/// from the platform. Acquisition may take arbitrary wall-clock time
/// (permission prompts, device enumeration); the manager never blocks its
/// event loop on it.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a fresh handle for one call attempt
    ///
    /// # Errors
    ///
    /// Returns `MediaError::Unavailable` on permission denial or device
    /// failure; the manager treats that as immediate local termination.
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMediaHandle, MediaError>;
}

/// Synthetic capture source
///
/// Stands in for real device capture in the demo binary and in tests:
/// grants (or deterministically denies) handles backed by fake default
/// devices, optionally after a configurable delay to model permission
/// prompts.
pub struct SyntheticMediaSource {
    grant: bool,
    latency: Duration,
    counter: AtomicU64,
}

impl SyntheticMediaSource {
    /// A source that always grants immediately
    #[must_use]
    pub fn granting() -> Self {
        Self {
            grant: true,
            latency: Duration::ZERO,
            counter: AtomicU64::new(0),
        }
    }

    /// A source that always denies, as if permission were refused
    #[must_use]
    pub fn denying() -> Self {
        Self {
            grant: false,
            latency: Duration::ZERO,
            counter: AtomicU64::new(0),
        }
    }

    /// Delay every acquisition, modeling a slow permission prompt
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMediaHandle, MediaError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if !self.grant {
            return Err(MediaError::Unavailable("capture permission denied".to_string()));
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut tracks = vec![LocalTrack::new(
            format!("mic-{n}"),
            TrackKind::Audio,
            "default-audio",
        )];
        if kind.wants_video() {
            tracks.push(LocalTrack::new(
                format!("cam-{n}"),
                TrackKind::Video,
                "default-video",
            ));
        }

        tracing::debug!(kind = ?kind, tracks = tracks.len(), "Synthetic media acquired");
        Ok(LocalMediaHandle::new(tracks))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_voice_has_audio_only() {
        let source = SyntheticMediaSource::granting();
        let handle = source.acquire(MediaKind::Voice).await.unwrap();
        assert!(handle.audio_track().is_some());
        assert!(handle.video_track().is_none());
        assert_eq!(handle.active_tracks(), 1);
    }

    #[tokio::test]
    async fn test_acquire_video_has_both_tracks() {
        let source = SyntheticMediaSource::granting();
        let handle = source.acquire(MediaKind::Video).await.unwrap();
        assert!(handle.audio_track().is_some());
        assert!(handle.video_track().is_some());
        assert_eq!(handle.active_tracks(), 2);
    }

    #[tokio::test]
    async fn test_denied_source() {
        let source = SyntheticMediaSource::denying();
        let result = source.acquire(MediaKind::Voice).await;
        assert!(matches!(result, Err(MediaError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let source = SyntheticMediaSource::granting();
        let handle = source.acquire(MediaKind::Video).await.unwrap();

        handle.release();
        assert!(handle.is_released());
        assert_eq!(handle.active_tracks(), 0);

        // Second release must not panic or change anything.
        handle.release();
        assert_eq!(handle.active_tracks(), 0);
    }

    #[tokio::test]
    async fn test_toggle_mute_and_video() {
        let source = SyntheticMediaSource::granting();
        let handle = source.acquire(MediaKind::Video).await.unwrap();

        assert!(handle.toggle_mute().unwrap()); // now muted
        assert!(!handle.audio_track().unwrap().is_enabled());
        assert!(!handle.toggle_mute().unwrap()); // unmuted again

        assert!(!handle.toggle_video().unwrap()); // camera off
        assert!(handle.toggle_video().unwrap()); // back on
    }

    #[tokio::test]
    async fn test_toggle_video_on_voice_call_fails() {
        let source = SyntheticMediaSource::granting();
        let handle = source.acquire(MediaKind::Voice).await.unwrap();
        assert!(matches!(
            handle.toggle_video(),
            Err(MediaError::TrackMissing("video"))
        ));
    }

    #[tokio::test]
    async fn test_switch_camera_is_best_effort() {
        let source = SyntheticMediaSource::granting();
        let video = source.acquire(MediaKind::Video).await.unwrap();
        assert!(video.switch_camera("front-cam"));
        assert_eq!(video.video_track().unwrap().device(), "front-cam");

        let voice = source.acquire(MediaKind::Voice).await.unwrap();
        assert!(!voice.switch_camera("front-cam"));
    }
}
