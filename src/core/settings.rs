//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Process-wide default media device identifiers.
//!
//! Three optional slots, settable at runtime from a user-facing
//! settings surface.  Reads take an atomic snapshot (the record is
//! replaced wholesale) so media acquisition sees a consistent view;
//! changes do not retroactively affect active calls.

use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

/// Default device identifiers read when acquiring local media.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediaDeviceDefaults {
    pub audio_output: Option<String>,
    pub audio_input: Option<String>,
    pub video_input: Option<String>,
}

lazy_static! {
    static ref DEFAULTS: RwLock<Arc<MediaDeviceDefaults>> =
        RwLock::new(Arc::new(MediaDeviceDefaults::default()));
}

/// The defaults in effect right now.
pub fn media_device_defaults() -> Arc<MediaDeviceDefaults> {
    DEFAULTS
        .read()
        .map(|guard| Arc::clone(&guard))
        .unwrap_or_default()
}

fn replace<F>(update: F)
where
    F: FnOnce(&mut MediaDeviceDefaults),
{
    if let Ok(mut guard) = DEFAULTS.write() {
        let mut next = (**guard).clone();
        update(&mut next);
        *guard = Arc::new(next);
    }
}

pub fn set_audio_output_device(device_id: Option<String>) {
    replace(|defaults| defaults.audio_output = device_id);
}

pub fn set_audio_input_device(device_id: Option<String>) {
    replace(|defaults| defaults.audio_input = device_id);
}

pub fn set_video_input_device(device_id: Option<String>) {
    replace(|defaults| defaults.video_input = device_id);
}
