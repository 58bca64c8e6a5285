//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Call Finite State Machine
//!
//! The FSM reconciles the stream of inbound signaling messages with
//! local user actions and peer connection notifications.  Every
//! mutation of a call flows through here.
//!
//! # Asynchronous Inputs:
//!
//! ## From the owner
//!
//! - PlaceCall
//! - LocalAnswer / LocalReject / LocalHangup
//! - SetMicrophoneMuted / SetVideoMuted / SetRemoteOnHold
//! - Replace (glare)
//!
//! ## From the signaling transport
//!
//! - StartIncoming (invite)
//! - ReceivedAnswer / ReceivedCandidates / ReceivedNegotiate
//! - ReceivedHangup / ReceivedReject / ReceivedSelectAnswer
//!
//! ## From the WebRTC stack
//!
//! - NegotiationNeeded
//! - LocalIceCandidate
//! - IceConnectionChange
//! - RemoteStreamAdded
//!
//! ## From internal tasks
//!
//! - MediaAcquired / MediaFailed
//! - InviteTimeout / RingLifetimeExpired / FlushCandidates
//!
//! Dispatch is quick; operations that touch the network or the stack
//! run as spawned tasks and re-check the call state after every await.

use std::fmt;
use std::future::Future;

use tokio::sync::mpsc::Receiver;

use crate::common::{CallState, PartyId, Result};
use crate::core::call::Call;
use crate::core::signaling::{
    MessageType, ReceivedAnswer, ReceivedCandidates, ReceivedHangup, ReceivedInvite,
    ReceivedNegotiate, ReceivedReject, ReceivedSelectAnswer,
};
use crate::webrtc::media::MediaStream;
use crate::webrtc::peer_connection::{IceCandidate, IceConnectionState};

/// The different types of CallEvents.
pub enum CallEvent {
    /// Start the outbound flow (caller only).
    PlaceCall,
    /// Process a received invite (callee only).
    StartIncoming(ReceivedInvite),
    /// The user answered the ringing call.
    LocalAnswer,
    /// The user declined the ringing call.
    LocalReject,
    /// The user hung up.
    LocalHangup,
    /// The user muted or unmuted the microphone.
    SetMicrophoneMuted(bool),
    /// The user muted or unmuted the camera.
    SetVideoMuted(bool),
    /// The user put the remote side on hold, or released it.
    SetRemoteOnHold(bool),
    /// This call lost a glare tiebreak to the carried call.
    Replace(Call),
    /// Glare: a local stream inherited from the predecessor call.
    GotMediaForAnswer(MediaStream),
    /// Receive an answer from the remote peer.
    ReceivedAnswer(ReceivedAnswer),
    /// Receive an ICE candidate batch from the remote peer.
    ReceivedCandidates(ReceivedCandidates),
    /// Receive a renegotiation description from the remote peer.
    ReceivedNegotiate(ReceivedNegotiate),
    /// Receive a hangup from the remote peer.
    ReceivedHangup(ReceivedHangup),
    /// Receive a reject from the remote peer.
    ReceivedReject(ReceivedReject),
    /// Receive a select_answer from the remote peer.
    ReceivedSelectAnswer(ReceivedSelectAnswer),
    /// The stack asked for (re)negotiation.
    NegotiationNeeded,
    /// A local ICE candidate is ready, from the stack.
    LocalIceCandidate(IceCandidate),
    /// The ICE connection state changed, from the stack.
    IceConnectionChange(IceConnectionState),
    /// The remote side added a stream, from the stack.
    RemoteStreamAdded(MediaStream),
    /// Local media acquisition finished.
    MediaAcquired(MediaStream),
    /// Local media acquisition failed.
    MediaFailed(String),
    /// Nobody answered the invite in time.
    InviteTimeout,
    /// The inbound invite aged out while ringing.
    RingLifetimeExpired,
    /// Send the buffered local candidates.
    FlushCandidates,
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            CallEvent::PlaceCall => "PlaceCall".to_string(),
            CallEvent::StartIncoming(_) => "StartIncoming".to_string(),
            CallEvent::LocalAnswer => "LocalAnswer".to_string(),
            CallEvent::LocalReject => "LocalReject".to_string(),
            CallEvent::LocalHangup => "LocalHangup".to_string(),
            CallEvent::SetMicrophoneMuted(muted) => format!("SetMicrophoneMuted({})", muted),
            CallEvent::SetVideoMuted(muted) => format!("SetVideoMuted({})", muted),
            CallEvent::SetRemoteOnHold(on_hold) => format!("SetRemoteOnHold({})", on_hold),
            CallEvent::Replace(new_call) => format!("Replace({})", new_call.call_id()),
            CallEvent::GotMediaForAnswer(stream) => format!("GotMediaForAnswer({})", stream),
            CallEvent::ReceivedAnswer(received) => {
                format!("ReceivedAnswer(from {:?})", received.sender_party_id)
            }
            CallEvent::ReceivedCandidates(received) => {
                format!("ReceivedCandidates(x{})", received.candidates.len())
            }
            CallEvent::ReceivedNegotiate(_) => "ReceivedNegotiate".to_string(),
            CallEvent::ReceivedHangup(received) => {
                format!("ReceivedHangup({:?})", received.reason)
            }
            CallEvent::ReceivedReject(_) => "ReceivedReject".to_string(),
            CallEvent::ReceivedSelectAnswer(received) => {
                format!("ReceivedSelectAnswer({:?})", received.selected_party_id)
            }
            CallEvent::NegotiationNeeded => "NegotiationNeeded".to_string(),
            CallEvent::LocalIceCandidate(candidate) => {
                format!("LocalIceCandidate({})", candidate)
            }
            CallEvent::IceConnectionChange(state) => {
                format!("IceConnectionChange({:?})", state)
            }
            CallEvent::RemoteStreamAdded(stream) => format!("RemoteStreamAdded({})", stream),
            CallEvent::MediaAcquired(stream) => format!("MediaAcquired({})", stream),
            CallEvent::MediaFailed(error) => format!("MediaFailed({})", error),
            CallEvent::InviteTimeout => "InviteTimeout".to_string(),
            CallEvent::RingLifetimeExpired => "RingLifetimeExpired".to_string(),
            CallEvent::FlushCandidates => "FlushCandidates".to_string(),
        };
        write!(f, "({})", display)
    }
}

impl fmt::Debug for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A Receiver for injecting CallEvents into the state machine.
///
/// The event stream is the tuple (Call, CallEvent).
pub type EventStream = Receiver<(Call, CallEvent)>;

/// Run an operation off the dispatch loop, logging a failure.
fn spawn_op<F>(label: &'static str, future: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(error) = future.await {
            error!("{} failed: {}", label, error);
        }
    });
}

/// Consumes CallEvents, filters them, and runs the matching call
/// operation.  Quick reactions happen inline; anything that suspends is
/// spawned so the next event is not held up behind it.
pub struct CallStateMachine {
    event_stream: EventStream,
}

impl CallStateMachine {
    pub fn new(event_stream: EventStream) -> Self {
        Self { event_stream }
    }

    pub async fn run(mut self) {
        while let Some((call, event)) = self.event_stream.recv().await {
            let state = match call.state() {
                Ok(state) => state,
                Err(error) => {
                    error!("state unavailable: {}", error);
                    continue;
                }
            };
            info!(
                "call {}: rx state: {}, event: {}",
                call.call_id(),
                state,
                event
            );
            if let Err(error) = Self::handle_event(call, state, event) {
                error!("handling event failed: {}", error);
            }
        }
        debug!("call state machine: event stream closed");
    }

    /// Top level event dispatch.
    fn handle_event(call: Call, state: CallState, event: CallEvent) -> Result<()> {
        // The terminal state is absorbing.  Media completions still get
        // through: a replaced call delegates them to its successor, and
        // a terminated call must release a late-arriving stream.
        if state.is_terminal()
            && !matches!(
                event,
                CallEvent::MediaAcquired(_) | CallEvent::MediaFailed(_)
            )
        {
            debug!(
                "call {}: dropping {} in terminal state",
                call.call_id(),
                event
            );
            return Ok(());
        }

        // Party-id filter for remote messages.  The invite is exempt:
        // it is what commits the partner in the first place.
        if let Some((sender, typ)) = Self::sender_of(&event) {
            if !call.should_accept_from(sender.as_ref(), typ)? {
                return Ok(());
            }
        }

        match event {
            CallEvent::PlaceCall => {
                spawn_op("PlaceCall", async move { call.handle_place_call().await })
            }
            CallEvent::StartIncoming(received) => spawn_op("StartIncoming", async move {
                call.handle_incoming_invite(received).await
            }),
            CallEvent::LocalAnswer => {
                spawn_op("LocalAnswer", async move { call.handle_local_answer().await })
            }
            CallEvent::LocalReject => {
                spawn_op("LocalReject", async move { call.handle_local_reject().await })
            }
            CallEvent::LocalHangup => {
                spawn_op("LocalHangup", async move { call.handle_local_hangup().await })
            }
            CallEvent::SetMicrophoneMuted(muted) => call.handle_set_microphone_muted(muted)?,
            CallEvent::SetVideoMuted(muted) => call.handle_set_video_muted(muted)?,
            CallEvent::SetRemoteOnHold(on_hold) => call.handle_set_remote_on_hold(on_hold)?,
            CallEvent::Replace(new_call) => spawn_op("Replace", async move {
                call.handle_replace(new_call).await
            }),
            CallEvent::GotMediaForAnswer(stream) => spawn_op("GotMediaForAnswer", async move {
                call.handle_got_media_for_answer(stream).await
            }),
            CallEvent::ReceivedAnswer(received) => spawn_op("ReceivedAnswer", async move {
                call.handle_received_answer(received).await
            }),
            CallEvent::ReceivedCandidates(received) => {
                spawn_op("ReceivedCandidates", async move {
                    call.handle_received_candidates(received).await
                })
            }
            CallEvent::ReceivedNegotiate(received) => spawn_op("ReceivedNegotiate", async move {
                call.handle_received_negotiate(received).await
            }),
            CallEvent::ReceivedHangup(received) => spawn_op("ReceivedHangup", async move {
                call.handle_received_hangup(received).await
            }),
            CallEvent::ReceivedReject(_) => spawn_op("ReceivedReject", async move {
                call.handle_received_reject().await
            }),
            CallEvent::ReceivedSelectAnswer(received) => {
                spawn_op("ReceivedSelectAnswer", async move {
                    call.handle_received_select_answer(received).await
                })
            }
            CallEvent::NegotiationNeeded => spawn_op("NegotiationNeeded", async move {
                call.handle_negotiation_needed().await
            }),
            CallEvent::LocalIceCandidate(candidate) => call.handle_local_candidate(candidate)?,
            CallEvent::IceConnectionChange(ice_state) => {
                spawn_op("IceConnectionChange", async move {
                    call.handle_ice_connection_change(ice_state).await
                })
            }
            CallEvent::RemoteStreamAdded(stream) => call.handle_remote_stream_added(stream)?,
            CallEvent::MediaAcquired(stream) => spawn_op("MediaAcquired", async move {
                call.handle_media_acquired(stream).await
            }),
            CallEvent::MediaFailed(error) => spawn_op("MediaFailed", async move {
                call.handle_media_failed(error).await
            }),
            CallEvent::InviteTimeout => spawn_op("InviteTimeout", async move {
                call.handle_invite_timeout().await
            }),
            CallEvent::RingLifetimeExpired => spawn_op("RingLifetimeExpired", async move {
                call.handle_ring_expired().await
            }),
            CallEvent::FlushCandidates => spawn_op("FlushCandidates", async move {
                call.flush_candidate_queue().await
            }),
        }
        Ok(())
    }

    /// The sender and type of remote messages subject to the party-id
    /// filter.
    fn sender_of(event: &CallEvent) -> Option<(Option<PartyId>, MessageType)> {
        match event {
            CallEvent::ReceivedAnswer(received) => {
                Some((received.sender_party_id.clone(), MessageType::Answer))
            }
            CallEvent::ReceivedCandidates(received) => {
                Some((received.sender_party_id.clone(), MessageType::Candidates))
            }
            CallEvent::ReceivedNegotiate(received) => {
                Some((received.sender_party_id.clone(), MessageType::Negotiate))
            }
            CallEvent::ReceivedHangup(received) => {
                Some((received.sender_party_id.clone(), MessageType::Hangup))
            }
            CallEvent::ReceivedReject(received) => {
                Some((received.sender_party_id.clone(), MessageType::Reject))
            }
            CallEvent::ReceivedSelectAnswer(received) => {
                Some((received.sender_party_id.clone(), MessageType::SelectAnswer))
            }
            _ => None,
        }
    }
}
