//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! WebRTC Peer Connection Interface
//!
//! The engine drives the WebRTC stack exclusively through the
//! [`PeerConnection`] trait; it never sees DTLS, RTP, or the SDP
//! internals.  Concrete implementations wrap a real stack; tests wrap
//! a scripted simulation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::Result;
use crate::core::util::{redact_candidate, redact_sdp};
use crate::webrtc::media::MediaStream;

/// SDP description type, as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A session description as exchanged in signaling payloads.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            sdp,
            sdp_type: SdpType::Offer,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            sdp,
            sdp_type: SdpType::Answer,
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} {}", self.sdp_type, redact_sdp(&self.sdp))
    }
}

impl fmt::Debug for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A single ICE candidate as exchanged in signaling payloads.  An empty
/// `candidate` string denotes the end-of-candidates sentinel.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(
        rename = "sdpMid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: String, sdp_mid: Option<String>, sdp_m_line_index: Option<u16>) -> Self {
        Self {
            candidate,
            sdp_mid,
            sdp_m_line_index,
        }
    }

    /// The sentinel that tells the far side no more candidates are
    /// coming.  Carries an empty mid so receivers that drop
    /// mid-and-index-less candidates still see it.
    pub fn end_of_candidates() -> Self {
        Self {
            candidate: String::new(),
            sdp_mid: Some(String::new()),
            sdp_m_line_index: Some(0),
        }
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", redact_candidate(&self.candidate))
    }
}

impl fmt::Debug for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

/// Negotiated direction of a transceiver, as reported by the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

/// Asynchronous notifications surfaced by the stack.  The call consumes
/// these from a channel handed over at construction.
pub enum PeerConnectionEvent {
    /// (Re)negotiation is required; the call should create an offer.
    NegotiationNeeded,
    /// A local candidate is ready to be signaled.
    IceCandidate(IceCandidate),
    /// The ICE connection state changed.
    IceConnectionStateChange(IceConnectionState),
    /// The remote side added a media stream.
    AddStream(MediaStream),
}

impl fmt::Display for PeerConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerConnectionEvent::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            PeerConnectionEvent::IceCandidate(candidate) => {
                write!(f, "IceCandidate({})", candidate)
            }
            PeerConnectionEvent::IceConnectionStateChange(state) => {
                write!(f, "IceConnectionStateChange({:?})", state)
            }
            PeerConnectionEvent::AddStream(stream) => write!(f, "AddStream({})", stream),
        }
    }
}

impl fmt::Debug for PeerConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Capability boundary to the WebRTC stack.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// The current local description, including any candidates gathered
    /// since it was set.
    fn local_description(&self) -> Option<SessionDescription>;

    fn signaling_state(&self) -> SignalingState;
    fn ice_gathering_state(&self) -> IceGatheringState;
    fn ice_connection_state(&self) -> IceConnectionState;

    /// Currently negotiated transceiver directions, local perspective.
    /// Empty until the first negotiation completes.
    fn transceiver_directions(&self) -> Vec<TransceiverDirection>;

    /// Attach a local capture stream, adding its tracks to the
    /// connection.
    fn add_stream(&self, stream: &MediaStream) -> Result<()>;

    /// Streams the remote side has surfaced so far.
    fn remote_streams(&self) -> Vec<MediaStream>;

    /// Close the connection.  Idempotent.
    fn close(&self);
}
