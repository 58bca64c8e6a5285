//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Common types used throughout the library.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

/// Common Result type, using `anyhow::Error` for Error.
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// Unique call identifier, carried on every signaling message for the call.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh identifier for an outbound call.
    pub fn random() -> Self {
        let suffix: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        Self(format!("c{}", suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable per-device identifier, used to disambiguate when multiple
/// devices of the same user race to answer an invite.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room identifier used by the signaling transport as the routing key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tracks the state of the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    /// Newly constructed, nothing has happened yet.
    Fledgling,
    /// Waiting for local media to be acquired.
    WaitLocalMedia,
    /// Outbound call is creating the SDP offer.
    CreateOffer,
    /// The invite was sent, waiting for an answer.
    InviteSent,
    /// An inbound invite was received, the user has not yet answered.
    Ringing,
    /// Inbound call is creating the SDP answer.
    CreateAnswer,
    /// Both descriptions are exchanged, ICE is connecting.
    Connecting,
    /// Media is flowing.
    Connected,
    /// The call is over.  Terminal and absorbing.
    Ended,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        self == CallState::Ended
    }

    /// Whether `self -> to` is a legal transition.  Unlisted transitions
    /// are programmer errors; callers log and ignore them.
    pub fn can_transition_to(self, to: CallState) -> bool {
        use CallState::*;
        if self == Ended {
            return false;
        }
        if to == Ended {
            return true;
        }
        matches!(
            (self, to),
            (Fledgling, WaitLocalMedia)
                | (Fledgling, Ringing)
                | (WaitLocalMedia, CreateOffer)
                | (WaitLocalMedia, CreateAnswer)
                | (CreateOffer, InviteSent)
                | (InviteSent, Connecting)
                | (Ringing, WaitLocalMedia)
                | (Ringing, CreateAnswer)
                | (CreateAnswer, Connecting)
                | (Connecting, Connected)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The call direction.  Fixed for the life of the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    /// Politeness under the perfect negotiation pattern: the inbound
    /// side yields on an offer collision, the outbound side proceeds.
    pub fn is_polite(self) -> bool {
        self == CallDirection::Inbound
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The call media type at time of origination.  An inbound call starts
/// as Audio and is refined to Video once the remote stream shows a
/// video track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMediaType {
    Audio,
    Video,
}

impl fmt::Display for CallMediaType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Which side ended the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HangupParty {
    Local,
    Remote,
}

impl fmt::Display for HangupParty {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The remote party of a call, three-valued: no partner has committed
/// yet, a partner committed without reporting a party id (a legacy
/// peer), or a partner committed with an id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpponentPartyId {
    Unchosen,
    Chosen(Option<PartyId>),
}

impl OpponentPartyId {
    pub fn is_chosen(&self) -> bool {
        matches!(self, OpponentPartyId::Chosen(_))
    }

    /// Whether a message from `sender` should be accepted once the
    /// opponent is committed.  A missing sender id matches a
    /// null-chosen (legacy) opponent.
    pub fn matches(&self, sender: Option<&PartyId>) -> bool {
        match self {
            OpponentPartyId::Unchosen => true,
            OpponentPartyId::Chosen(chosen) => chosen.as_ref() == sender,
        }
    }
}

impl fmt::Display for OpponentPartyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpponentPartyId::Unchosen => write!(f, "unchosen"),
            OpponentPartyId::Chosen(None) => write!(f, "chosen(legacy)"),
            OpponentPartyId::Chosen(Some(id)) => write!(f, "chosen({})", id),
        }
    }
}
