//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Media stream and track handles.
//!
//! The engine owns streams only to gate, stop, and hand them around; it
//! never touches frames.  Tracks are opaque handles into the stack.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::{CallMediaType, Result};
use crate::core::settings::MediaDeviceDefaults;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One capture or playback track owned by a stream.
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> TrackKind;
    /// Enable or disable the track without stopping it (mute/hold).
    fn set_enabled(&self, enabled: bool);
    fn enabled(&self) -> bool;
    /// Stop the track for good.  Idempotent.
    fn stop(&self);
    fn stopped(&self) -> bool;
}

/// A bundle of tracks, local or remote.  Cloning shares the underlying
/// track handles.
#[derive(Clone, Default)]
pub struct MediaStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks
            .iter()
            .any(|track| track.kind() == TrackKind::Video)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            if track.kind() == TrackKind::Audio {
                track.set_enabled(enabled);
            }
        }
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            if track.kind() == TrackKind::Video {
                track.set_enabled(enabled);
            }
        }
    }

    /// Stop every track in the stream.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl fmt::Display for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let audio = self
            .tracks
            .iter()
            .filter(|track| track.kind() == TrackKind::Audio)
            .count();
        let video = self.tracks.len() - audio;
        write!(f, "stream({} audio, {} video)", audio, video)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// What to capture for a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn for_media_type(media_type: CallMediaType) -> Self {
        match media_type {
            CallMediaType::Audio => Self {
                audio: true,
                video: false,
            },
            CallMediaType::Video => Self {
                audio: true,
                video: true,
            },
        }
    }
}

/// Capability boundary to local media acquisition.  Device selection UI
/// and enumeration live behind this trait.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local capture tracks, honoring the process-wide default
    /// device identifiers in effect at call time.
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
        defaults: &MediaDeviceDefaults,
    ) -> Result<MediaStream>;
}
