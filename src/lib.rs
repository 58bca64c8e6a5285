//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! # PeerCall -- A Rust Call Signaling Engine
//!
//! This crate drives one-to-one voice and video calls over a room-based
//! signaling transport. It owns the per-call state machine, implements
//! the [perfect negotiation](https://w3c.github.io/webrtc-pc/#perfect-negotiation-example)
//! pattern for offer collisions, batches and retries outbound ICE
//! candidates, and reconciles inbound signaling messages with local user
//! actions (place, answer, reject, mute, hold, hang up).
//!
//! The transport and the WebRTC stack are external collaborators reached
//! through the [`core::transport::SignalingTransport`] and
//! [`webrtc::peer_connection::PeerConnection`] capability traits.

#[macro_use]
extern crate log;

pub mod common;

pub mod error;

/// Core, platform independent functionality.
pub mod core {
    pub mod call;
    pub mod call_fsm;
    pub mod call_manager;
    pub mod call_mutex;
    pub mod candidate_queue;
    pub mod observer;
    pub mod settings;
    pub mod signaling;
    pub mod transport;
    pub mod util;
}

/// Interfaces to the WebRTC stack.
pub mod webrtc {
    pub mod media;
    pub mod peer_connection;
}
