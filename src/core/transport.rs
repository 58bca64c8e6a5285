//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Signaling transport interface.
//!
//! The engine sends typed messages into a room and never learns how
//! they travel.  The transport is shared across calls and is assumed to
//! serialize sends internally, so per-call message order is preserved.

use async_trait::async_trait;
use thiserror::Error;

use crate::common::{CallId, RoomId};
use crate::core::signaling::{MessageType, OutboundMessage};

/// Why a signaling send failed.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The room contains devices the transport cannot deliver to.
    /// Distinguished so the call can end with `UnknownDevices`.
    #[error("unknown devices in the room")]
    UnknownDevices,
    #[error("signaling send failed: {0}")]
    SendFailed(String),
}

/// Capability boundary to the room-based signaling layer.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Deliver one signaling message to the room.
    async fn send(
        &self,
        room_id: &RoomId,
        message: OutboundMessage,
    ) -> std::result::Result<(), TransportError>;

    /// Ask the transport to cancel a pending event of the given type
    /// for deduplication after a failed send.  Best effort.
    async fn cancel_send(&self, room_id: &RoomId, call_id: &CallId, typ: MessageType);

    /// Whether well-known fallback ICE servers may be used when the
    /// caller supplies none.
    fn fallback_ice_allowed(&self) -> bool {
        false
    }
}

/// One TURN or STUN server entry handed to the peer connection factory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}
