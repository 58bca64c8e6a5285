//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! The messages we exchange over the signaling transport to establish
//! and tear down a call.
//!
//! Every outbound payload is extended with the envelope fields
//! `version`, `call_id`, and `party_id`.  This implementation emits
//! protocol version `0`; peers reporting a version below `1` are
//! assumed to lack `reject`, `select_answer`, and mid-call
//! renegotiation.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{CallId, PartyId};
use crate::error::CallErrorCode;
use crate::webrtc::peer_connection::{IceCandidate, SessionDescription};

/// The protocol version this implementation reports.
pub const PROTOCOL_VERSION: u32 = 0;

/// Peers reporting at least this version understand `reject`,
/// `select_answer`, and mid-call `negotiate`.
pub const MIN_VERSION_FOR_RENEGOTIATION: u32 = 1;

/// Advisory expiry carried in every invite.
pub const INVITE_LIFETIME: Duration = Duration::from_secs(60);

/// An enum representing the different types of signaling messages that
/// can be sent and received.
#[derive(Clone)]
pub enum Message {
    Invite(Invite),
    Answer(Answer),
    Candidates(Candidates),
    Negotiate(Negotiate),
    SelectAnswer(SelectAnswer),
    Hangup(Hangup),
    Reject,
}

impl Message {
    pub fn typ(&self) -> MessageType {
        match self {
            Self::Invite(_) => MessageType::Invite,
            Self::Answer(_) => MessageType::Answer,
            Self::Candidates(_) => MessageType::Candidates,
            Self::Negotiate(_) => MessageType::Negotiate,
            Self::SelectAnswer(_) => MessageType::SelectAnswer,
            Self::Hangup(_) => MessageType::Hangup,
            Self::Reject => MessageType::Reject,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            Self::Invite(invite) => {
                format!("Invite({}, lifetime {}ms)", invite.offer, invite.lifetime)
            }
            Self::Answer(answer) => format!("Answer({})", answer.answer),
            Self::Candidates(candidates) => {
                format!("Candidates(x{})", candidates.candidates.len())
            }
            Self::Negotiate(negotiate) => format!("Negotiate({})", negotiate.description),
            Self::SelectAnswer(select) => match &select.selected_party_id {
                Some(id) => format!("SelectAnswer({})", id),
                None => "SelectAnswer(legacy)".to_string(),
            },
            Self::Hangup(hangup) => format!("Hangup({:?})", hangup.reason),
            Self::Reject => "Reject".to_string(),
        };
        write!(f, "({})", display)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

// It's convenient to know the type of a message without holding an
// entire message (cancellation asks by type), so we have the related
// MessageType enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Invite,
    Answer,
    Candidates,
    Negotiate,
    SelectAnswer,
    Hangup,
    Reject,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invite => "invite",
            Self::Answer => "answer",
            Self::Candidates => "candidates",
            Self::Negotiate => "negotiate",
            Self::SelectAnswer => "select_answer",
            Self::Hangup => "hangup",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The caller sends this to initiate the call.
#[derive(Clone, Serialize, Deserialize)]
pub struct Invite {
    pub offer: SessionDescription,
    /// Advisory expiry in milliseconds; the callee self-hangs-up if the
    /// invite ages beyond it before being answered.
    pub lifetime: u64,
}

/// The chosen callee device sends this in response to an invite.
#[derive(Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer: SessionDescription,
}

/// Either side sends these after its invite or answer went out.  An
/// empty-string `candidate` denotes end-of-candidates.
#[derive(Clone, Serialize, Deserialize)]
pub struct Candidates {
    pub candidates: Vec<IceCandidate>,
}

/// Mid-call renegotiation, either direction.  Requires version >= 1 on
/// both ends.
#[derive(Clone, Serialize, Deserialize)]
pub struct Negotiate {
    pub description: SessionDescription,
}

/// The caller tells the chosen answerer it won, so other racing
/// devices can learn they lost.
#[derive(Clone, Serialize, Deserialize)]
pub struct SelectAnswer {
    pub selected_party_id: Option<PartyId>,
}

/// Ends the call.  Sent without a reason for a plain user hangup.
#[derive(Clone, Serialize, Deserialize)]
pub struct Hangup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<HangupReason>,
}

/// Wire-visible hangup reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    UserHangup,
    IceFailed,
    InviteTimeout,
    UserMediaFailed,
    Replaced,
    AnsweredElsewhere,
    UnknownError,
}

impl HangupReason {
    /// The wire reason for a call that ended with `code`, or `None`
    /// when a plain reasonless hangup should go out (a v0 peer reads
    /// any reason-bearing hangup the same way).
    pub fn from_error_code(code: CallErrorCode) -> Option<HangupReason> {
        match code {
            CallErrorCode::UserHangup => None,
            CallErrorCode::IceFailed => Some(HangupReason::IceFailed),
            CallErrorCode::InviteTimeout => Some(HangupReason::InviteTimeout),
            CallErrorCode::NoUserMedia => Some(HangupReason::UserMediaFailed),
            CallErrorCode::Replaced => Some(HangupReason::Replaced),
            CallErrorCode::AnsweredElsewhere => Some(HangupReason::AnsweredElsewhere),
            _ => Some(HangupReason::UnknownError),
        }
    }

    /// How a received reason maps onto our error codes.  A missing
    /// reason reads as a plain user hangup.
    pub fn to_error_code(reason: Option<HangupReason>) -> CallErrorCode {
        match reason {
            None | Some(HangupReason::UserHangup) => CallErrorCode::UserHangup,
            Some(HangupReason::IceFailed) => CallErrorCode::IceFailed,
            Some(HangupReason::InviteTimeout) => CallErrorCode::InviteTimeout,
            Some(HangupReason::UserMediaFailed) => CallErrorCode::NoUserMedia,
            Some(HangupReason::Replaced) => CallErrorCode::Replaced,
            Some(HangupReason::AnsweredElsewhere) => CallErrorCode::AnsweredElsewhere,
            Some(HangupReason::UnknownError) => CallErrorCode::UserHangup,
        }
    }
}

/// Envelope fields added to every outbound payload.
#[derive(Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub call_id: CallId,
    pub party_id: PartyId,
}

/// A fully addressed outbound signaling message.
#[derive(Clone)]
pub struct OutboundMessage {
    pub envelope: Envelope,
    pub message: Message,
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "id: {}, party: {}, {}",
            self.envelope.call_id, self.envelope.party_id, self.message
        )
    }
}

/// An invite with extra info specific to receiving.
pub struct ReceivedInvite {
    pub invite: Invite,
    /// The approximate age of the invite, per the transport.
    pub age: Duration,
    pub sender_party_id: Option<PartyId>,
    pub sender_version: u32,
}

/// An answer with extra info specific to receiving.
pub struct ReceivedAnswer {
    pub answer: Answer,
    pub sender_party_id: Option<PartyId>,
    pub sender_version: u32,
}

/// A candidate batch with extra info specific to receiving.
pub struct ReceivedCandidates {
    pub candidates: Vec<IceCandidate>,
    pub sender_party_id: Option<PartyId>,
}

/// A renegotiation description with extra info specific to receiving.
pub struct ReceivedNegotiate {
    pub description: SessionDescription,
    pub sender_party_id: Option<PartyId>,
}

/// A hangup with extra info specific to receiving.
pub struct ReceivedHangup {
    pub reason: Option<HangupReason>,
    pub sender_party_id: Option<PartyId>,
}

/// A reject with extra info specific to receiving.
pub struct ReceivedReject {
    pub sender_party_id: Option<PartyId>,
}

/// A select_answer with extra info specific to receiving.
pub struct ReceivedSelectAnswer {
    pub selected_party_id: Option<PartyId>,
    pub sender_party_id: Option<PartyId>,
}

/// Any inbound signaling message, ready for routing to a call.
pub enum ReceivedMessage {
    Invite(ReceivedInvite),
    Answer(ReceivedAnswer),
    Candidates(ReceivedCandidates),
    Negotiate(ReceivedNegotiate),
    Hangup(ReceivedHangup),
    Reject(ReceivedReject),
    SelectAnswer(ReceivedSelectAnswer),
}

impl ReceivedMessage {
    pub fn typ(&self) -> MessageType {
        match self {
            Self::Invite(_) => MessageType::Invite,
            Self::Answer(_) => MessageType::Answer,
            Self::Candidates(_) => MessageType::Candidates,
            Self::Negotiate(_) => MessageType::Negotiate,
            Self::Hangup(_) => MessageType::Hangup,
            Self::Reject(_) => MessageType::Reject,
            Self::SelectAnswer(_) => MessageType::SelectAnswer,
        }
    }

    pub fn sender_party_id(&self) -> Option<&PartyId> {
        match self {
            Self::Invite(message) => message.sender_party_id.as_ref(),
            Self::Answer(message) => message.sender_party_id.as_ref(),
            Self::Candidates(message) => message.sender_party_id.as_ref(),
            Self::Negotiate(message) => message.sender_party_id.as_ref(),
            Self::Hangup(message) => message.sender_party_id.as_ref(),
            Self::Reject(message) => message.sender_party_id.as_ref(),
            Self::SelectAnswer(message) => message.sender_party_id.as_ref(),
        }
    }
}
