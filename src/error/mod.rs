//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Common error codes.

use std::fmt;

use thiserror::Error;

use crate::common::CallState;

/// Conditions the engine itself originates.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("mutex poisoned: {0}")]
    MutexPoisoned(String),
    #[error("expecting non-none option value in: {0}, var: {1}")]
    OptionValueNotSet(String, String),
    #[error("cannot {operation} while in state {state}")]
    InvalidCallState {
        operation: &'static str,
        state: CallState,
    },
    #[error("an observer must be registered before placing a call")]
    ObserverRequired,
    #[error("call event queue closed")]
    EventQueueClosed,
    #[error("no remote streams after applying the remote description")]
    NoRemoteStreams,
}

/// Failure classes a call can end with.  Wire-visible only as hangup
/// reasons, where applicable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallErrorCode {
    /// Either side ended the call on purpose.
    UserHangup,
    /// The local offer could not be created.
    LocalOfferFailed,
    /// Local capture devices could not be acquired.
    NoUserMedia,
    /// The transport refused to deliver to unknown devices.
    UnknownDevices,
    /// The invite could not be sent.
    SendInvite,
    /// The local answer could not be created.
    CreateAnswer,
    /// The answer could not be sent.
    SendAnswer,
    /// The remote description could not be applied.
    SetRemoteDescription,
    /// The local description could not be applied.
    SetLocalDescription,
    /// Another of our devices answered first.
    AnsweredElsewhere,
    /// ICE connectivity was lost for good.
    IceFailed,
    /// Nobody answered within the invite lifetime.
    InviteTimeout,
    /// The call was superseded by another call (glare).
    Replaced,
    /// A mid-call signaling send failed.
    SignallingFailed,
}

impl fmt::Display for CallErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
