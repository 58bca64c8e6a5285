//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! A peer-to-peer call.
//!
//! `Call` is a cheaply cloneable handle over shared per-call state.
//! Public methods validate and inject events into the call's state
//! machine (see [`crate::core::call_fsm`]); the `pub(crate)` methods are
//! the operations the state machine runs.  Long operations suspend at
//! transport sends, description operations, media acquisition, and
//! timer waits; every resumption re-checks for termination.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::{
    CallDirection, CallId, CallMediaType, CallState, HangupParty, OpponentPartyId, PartyId, Result,
    RoomId,
};
use crate::core::call_fsm::{CallEvent, CallStateMachine};
use crate::core::call_mutex::CallMutex;
use crate::core::candidate_queue::{CandidateQueue, EnqueueAction, RetryAction};
use crate::core::observer::CallObserver;
use crate::core::settings;
use crate::core::signaling::{
    self, Envelope, HangupReason, Message, MessageType, OutboundMessage, ReceivedAnswer,
    ReceivedCandidates, ReceivedInvite, ReceivedMessage, ReceivedNegotiate, ReceivedSelectAnswer,
    INVITE_LIFETIME, MIN_VERSION_FOR_RENEGOTIATION, PROTOCOL_VERSION,
};
use crate::core::transport::{SignalingTransport, TransportError};
use crate::error::{CallErrorCode, EngineError};
use crate::webrtc::media::{MediaConstraints, MediaSource, MediaStream};
use crate::webrtc::peer_connection::{
    IceCandidate, IceConnectionState, IceGatheringState, PeerConnection, PeerConnectionEvent,
    SessionDescription, SignalingState, TransceiverDirection,
};

/// How long to wait for first candidates after setting a local
/// description, so the description carries them.  Applied only while
/// gathering is in progress.
const GATHER_GRACE: Duration = Duration::from_millis(200);

/// Perfect-negotiation flags and the candidate release gate.
struct NegotiationState {
    /// We are mid way through creating and applying a local offer.
    making_offer: bool,
    /// We are the impolite side and are ignoring a colliding offer.
    ignore_offer: bool,
    /// Our invite or answer has gone out; candidates may follow it.
    invite_or_answer_sent: bool,
}

/// Who we are talking to, committed at most once.
struct OpponentInfo {
    party_id: OpponentPartyId,
    /// Protocol version the peer reported.  `0` is a legacy peer.
    version: u32,
}

/// Streams and the user-requested track states.
struct MediaState {
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    mic_muted: bool,
    vid_muted: bool,
    remote_on_hold: bool,
}

#[derive(Default)]
struct Timers {
    invite_timeout: Option<JoinHandle<()>>,
    ring_timeout: Option<JoinHandle<()>>,
}

/// Clears `making_offer` on every exit path of an offer operation.
struct MakingOfferGuard {
    negotiation: Arc<CallMutex<NegotiationState>>,
}

impl MakingOfferGuard {
    /// Take the flag, or `None` when an offer is already in progress.
    fn acquire(call: &Call) -> Result<Option<Self>> {
        let mut negotiation = call.negotiation.lock()?;
        if negotiation.making_offer {
            return Ok(None);
        }
        negotiation.making_offer = true;
        Ok(Some(Self {
            negotiation: Arc::clone(&call.negotiation),
        }))
    }
}

impl Drop for MakingOfferGuard {
    fn drop(&mut self) {
        if let Ok(mut negotiation) = self.negotiation.lock() {
            negotiation.making_offer = false;
        }
    }
}

/// Represents one call between the local device and a remote
/// counterparty, possibly reachable on several devices until one of
/// them commits.
pub struct Call {
    /// Unique identifier, carried on every outbound signaling message.
    call_id: CallId,
    /// Routing key for the signaling transport.
    room_id: RoomId,
    /// Stable identifier of this device.
    our_party_id: PartyId,
    /// The call direction, fixed once chosen.
    direction: CallDirection,
    transport: Arc<dyn SignalingTransport>,
    peer_connection: Arc<dyn PeerConnection>,
    media_source: Arc<dyn MediaSource>,
    /// Injects events into the call's state machine.
    fsm_sender: mpsc::Sender<(Call, CallEvent)>,
    /// The current state of the call.
    state: Arc<CallMutex<CallState>>,
    /// Audio or video, refined for inbound calls after the remote
    /// stream is known.
    media_type: Arc<CallMutex<CallMediaType>>,
    opponent: Arc<CallMutex<OpponentInfo>>,
    negotiation: Arc<CallMutex<NegotiationState>>,
    candidate_queue: Arc<CallMutex<CandidateQueue>>,
    /// Remote candidates received before a partner committed, per
    /// sender party.
    remote_candidates: Arc<CallMutex<HashMap<Option<PartyId>, Vec<IceCandidate>>>>,
    media: Arc<CallMutex<MediaState>>,
    /// Set exactly once at termination.
    hangup: Arc<CallMutex<Option<(HangupParty, CallErrorCode)>>>,
    /// The replacement call during glare resolution.
    successor: Arc<CallMutex<Option<Call>>>,
    observer: Arc<CallMutex<Option<Arc<dyn CallObserver>>>>,
    timers: Arc<CallMutex<Timers>>,
    /// Glare: our media arrives from the predecessor call, skip
    /// acquisition when answering.
    inherit_media: Arc<AtomicBool>,
    /// Glare: a stream handed over before our invite finished
    /// processing, adopted once we ring.
    inherited_stream: Arc<CallMutex<Option<MediaStream>>>,
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.state() {
            Ok(state) => format!("{}", state),
            Err(_) => "unavailable".to_string(),
        };
        write!(
            f,
            "direction: {}, call_id: {}, state: {}",
            self.direction, self.call_id, state
        )
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Clone for Call {
    fn clone(&self) -> Self {
        Self {
            call_id: self.call_id.clone(),
            room_id: self.room_id.clone(),
            our_party_id: self.our_party_id.clone(),
            direction: self.direction,
            transport: Arc::clone(&self.transport),
            peer_connection: Arc::clone(&self.peer_connection),
            media_source: Arc::clone(&self.media_source),
            fsm_sender: self.fsm_sender.clone(),
            state: Arc::clone(&self.state),
            media_type: Arc::clone(&self.media_type),
            opponent: Arc::clone(&self.opponent),
            negotiation: Arc::clone(&self.negotiation),
            candidate_queue: Arc::clone(&self.candidate_queue),
            remote_candidates: Arc::clone(&self.remote_candidates),
            media: Arc::clone(&self.media),
            hangup: Arc::clone(&self.hangup),
            successor: Arc::clone(&self.successor),
            observer: Arc::clone(&self.observer),
            timers: Arc::clone(&self.timers),
            inherit_media: Arc::clone(&self.inherit_media),
            inherited_stream: Arc::clone(&self.inherited_stream),
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        // Termination already released every resource; the last drop
        // has nothing left to do.
        if Arc::strong_count(&self.state) == 1 {
            debug!("call {}: dropping last reference", self.call_id);
        }
    }
}

impl Call {
    /// Create a new outbound call.  Must run inside a tokio runtime;
    /// the call's state machine is spawned onto it.
    pub fn new_outbound(
        room_id: RoomId,
        our_party_id: PartyId,
        media_type: CallMediaType,
        transport: Arc<dyn SignalingTransport>,
        peer_connection: Arc<dyn PeerConnection>,
        peer_connection_events: mpsc::Receiver<PeerConnectionEvent>,
        media_source: Arc<dyn MediaSource>,
    ) -> Self {
        Self::new(
            CallId::random(),
            room_id,
            our_party_id,
            CallDirection::Outbound,
            media_type,
            transport,
            peer_connection,
            peer_connection_events,
            media_source,
        )
    }

    /// Create a new inbound call for a received invite.  The call id is
    /// the one the caller generated.  Follow up with
    /// [`Call::start_incoming`].
    #[allow(clippy::too_many_arguments)]
    pub fn new_inbound(
        call_id: CallId,
        room_id: RoomId,
        our_party_id: PartyId,
        transport: Arc<dyn SignalingTransport>,
        peer_connection: Arc<dyn PeerConnection>,
        peer_connection_events: mpsc::Receiver<PeerConnectionEvent>,
        media_source: Arc<dyn MediaSource>,
    ) -> Self {
        Self::new(
            call_id,
            room_id,
            our_party_id,
            CallDirection::Inbound,
            CallMediaType::Audio,
            transport,
            peer_connection,
            peer_connection_events,
            media_source,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        call_id: CallId,
        room_id: RoomId,
        our_party_id: PartyId,
        direction: CallDirection,
        media_type: CallMediaType,
        transport: Arc<dyn SignalingTransport>,
        peer_connection: Arc<dyn PeerConnection>,
        peer_connection_events: mpsc::Receiver<PeerConnectionEvent>,
        media_source: Arc<dyn MediaSource>,
    ) -> Self {
        info!("new(): call_id: {}, direction: {}", call_id, direction);

        let (fsm_sender, fsm_receiver) = mpsc::channel(256);

        let call = Self {
            call_id,
            room_id,
            our_party_id,
            direction,
            transport,
            peer_connection,
            media_source,
            fsm_sender,
            state: Arc::new(CallMutex::new(CallState::Fledgling, "state")),
            media_type: Arc::new(CallMutex::new(media_type, "media_type")),
            opponent: Arc::new(CallMutex::new(
                OpponentInfo {
                    party_id: OpponentPartyId::Unchosen,
                    version: 0,
                },
                "opponent",
            )),
            negotiation: Arc::new(CallMutex::new(
                NegotiationState {
                    making_offer: false,
                    ignore_offer: false,
                    invite_or_answer_sent: false,
                },
                "negotiation",
            )),
            candidate_queue: Arc::new(CallMutex::new(
                CandidateQueue::new(direction),
                "candidate_queue",
            )),
            remote_candidates: Arc::new(CallMutex::new(HashMap::new(), "remote_candidates")),
            media: Arc::new(CallMutex::new(
                MediaState {
                    local_stream: None,
                    remote_stream: None,
                    mic_muted: false,
                    vid_muted: false,
                    remote_on_hold: false,
                },
                "media",
            )),
            hangup: Arc::new(CallMutex::new(None, "hangup")),
            successor: Arc::new(CallMutex::new(None, "successor")),
            observer: Arc::new(CallMutex::new(None, "observer")),
            timers: Arc::new(CallMutex::new(Timers::default(), "timers")),
            inherit_media: Arc::new(AtomicBool::new(false)),
            inherited_stream: Arc::new(CallMutex::new(None, "inherited_stream")),
        };

        tokio::spawn(CallStateMachine::new(fsm_receiver).run());

        let pump = call.clone();
        tokio::spawn(pump.run_peer_connection_pump(peer_connection_events));

        call
    }

    /// Forward peer connection notifications into the state machine.
    async fn run_peer_connection_pump(self, mut events: mpsc::Receiver<PeerConnectionEvent>) {
        while let Some(event) = events.recv().await {
            let event = match event {
                PeerConnectionEvent::NegotiationNeeded => CallEvent::NegotiationNeeded,
                PeerConnectionEvent::IceCandidate(candidate) => {
                    CallEvent::LocalIceCandidate(candidate)
                }
                PeerConnectionEvent::IceConnectionStateChange(state) => {
                    CallEvent::IceConnectionChange(state)
                }
                PeerConnectionEvent::AddStream(stream) => CallEvent::RemoteStreamAdded(stream),
            };
            if self.inject_event(event).is_err() {
                break;
            }
        }
        debug!("call {}: peer connection event pump done", self.call_id);
    }

    // -------------------------------------------------------------------
    // Accessors

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> Result<CallState> {
        Ok(*self.state.lock()?)
    }

    pub fn media_type(&self) -> Result<CallMediaType> {
        Ok(*self.media_type.lock()?)
    }

    pub fn opponent_party_id(&self) -> Result<OpponentPartyId> {
        Ok(self.opponent.lock()?.party_id.clone())
    }

    pub(crate) fn opponent_version(&self) -> Result<u32> {
        Ok(self.opponent.lock()?.version)
    }

    /// Who hung up and why, once terminated.
    pub fn hangup_info(&self) -> Result<Option<(HangupParty, CallErrorCode)>> {
        Ok(*self.hangup.lock()?)
    }

    /// Diagnostic: the retry counter of the candidate flush in
    /// progress, zero when idle.
    pub fn candidate_send_tries(&self) -> Result<u32> {
        Ok(self.candidate_queue.lock()?.send_tries())
    }

    pub fn local_stream(&self) -> Result<Option<MediaStream>> {
        Ok(self.media.lock()?.local_stream.clone())
    }

    pub fn remote_stream(&self) -> Result<Option<MediaStream>> {
        Ok(self.media.lock()?.remote_stream.clone())
    }

    pub fn is_microphone_muted(&self) -> Result<bool> {
        Ok(self.media.lock()?.mic_muted)
    }

    pub fn is_video_muted(&self) -> Result<bool> {
        Ok(self.media.lock()?.vid_muted)
    }

    /// Whether we have put the remote side on hold.
    pub fn is_remote_on_hold(&self) -> Result<bool> {
        Ok(self.media.lock()?.remote_on_hold)
    }

    /// Whether the remote side has put us on hold: connected, we did
    /// not initiate a hold ourselves, and every negotiated transceiver
    /// stopped sending to us.
    pub fn is_local_on_hold(&self) -> bool {
        if !matches!(self.state(), Ok(CallState::Connected)) {
            return false;
        }
        if self.is_remote_on_hold().unwrap_or(false) {
            return false;
        }
        let directions = self.peer_connection.transceiver_directions();
        !directions.is_empty()
            && directions.iter().all(|direction| {
                matches!(
                    direction,
                    TransceiverDirection::Inactive | TransceiverDirection::RecvOnly
                )
            })
    }

    // -------------------------------------------------------------------
    // Public API: user actions and inbound routing

    /// Register the owner's observer.  Required before placing a call.
    pub fn set_observer(&self, observer: Arc<dyn CallObserver>) -> Result<()> {
        *self.observer.lock()? = Some(observer);
        Ok(())
    }

    /// Start an outbound call: acquire media, negotiate, send the
    /// invite.  Fails fast, before any side effect, when no observer is
    /// registered to hear about errors.
    pub fn place_call(&self) -> Result<()> {
        if self.observer.lock()?.is_none() {
            return Err(EngineError::ObserverRequired.into());
        }
        let state = self.state()?;
        if self.direction != CallDirection::Outbound || state != CallState::Fledgling {
            return Err(EngineError::InvalidCallState {
                operation: "place_call",
                state,
            }
            .into());
        }
        self.inject_event(CallEvent::PlaceCall)
    }

    /// Feed the invite into an inbound call, moving it to `Ringing`.
    pub fn start_incoming(&self, received: ReceivedInvite) -> Result<()> {
        let state = self.state()?;
        if self.direction != CallDirection::Inbound || state != CallState::Fledgling {
            return Err(EngineError::InvalidCallState {
                operation: "start_incoming",
                state,
            }
            .into());
        }
        self.inject_event(CallEvent::StartIncoming(received))
    }

    /// Answer a ringing inbound call.
    pub fn answer(&self) -> Result<()> {
        let state = self.state()?;
        if state != CallState::Ringing {
            return Err(EngineError::InvalidCallState {
                operation: "answer",
                state,
            }
            .into());
        }
        self.inject_event(CallEvent::LocalAnswer)
    }

    /// Answer a ringing inbound call with an already-acquired stream
    /// instead of capturing a fresh one.
    pub fn answer_with_stream(&self, stream: MediaStream) -> Result<()> {
        let state = self.state()?;
        if state != CallState::Ringing {
            return Err(EngineError::InvalidCallState {
                operation: "answer_with_stream",
                state,
            }
            .into());
        }
        self.inject_event(CallEvent::GotMediaForAnswer(stream))
    }

    /// Decline a ringing inbound call.
    pub fn reject(&self) -> Result<()> {
        let state = self.state()?;
        if state != CallState::Ringing {
            return Err(EngineError::InvalidCallState {
                operation: "reject",
                state,
            }
            .into());
        }
        self.inject_event(CallEvent::LocalReject)
    }

    /// End the call.  Safe to call repeatedly.
    pub fn hangup(&self) -> Result<()> {
        self.inject_event(CallEvent::LocalHangup)
    }

    pub fn set_microphone_muted(&self, muted: bool) -> Result<()> {
        self.inject_event(CallEvent::SetMicrophoneMuted(muted))
    }

    pub fn set_video_muted(&self, muted: bool) -> Result<()> {
        self.inject_event(CallEvent::SetVideoMuted(muted))
    }

    pub fn set_remote_on_hold(&self, on_hold: bool) -> Result<()> {
        self.inject_event(CallEvent::SetRemoteOnHold(on_hold))
    }

    /// This call lost a glare tiebreak; hand over to `new_call`.
    pub fn replaced_by(&self, new_call: &Call) -> Result<()> {
        self.inject_event(CallEvent::Replace(new_call.clone()))
    }

    /// Route an inbound signaling message to this call.
    pub fn received_message(&self, message: ReceivedMessage) -> Result<()> {
        match message {
            ReceivedMessage::Invite(received) => self.start_incoming(received),
            ReceivedMessage::Answer(received) => {
                self.inject_event(CallEvent::ReceivedAnswer(received))
            }
            ReceivedMessage::Candidates(received) => {
                self.inject_event(CallEvent::ReceivedCandidates(received))
            }
            ReceivedMessage::Negotiate(received) => {
                self.inject_event(CallEvent::ReceivedNegotiate(received))
            }
            ReceivedMessage::Hangup(received) => {
                self.inject_event(CallEvent::ReceivedHangup(received))
            }
            ReceivedMessage::Reject(received) => {
                self.inject_event(CallEvent::ReceivedReject(received))
            }
            ReceivedMessage::SelectAnswer(received) => {
                self.inject_event(CallEvent::ReceivedSelectAnswer(received))
            }
        }
    }

    /// Send a CallEvent to the internal state machine.
    pub(crate) fn inject_event(&self, event: CallEvent) -> Result<()> {
        if self.fsm_sender.is_closed() {
            // The stream is closed, just eat the request.
            debug!("call {}: event stream closed while sending event", self.call_id);
            return Ok(());
        }
        self.fsm_sender
            .try_send((self.clone(), event))
            .map_err(|_| EngineError::EventQueueClosed)?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // State transitions, timers, notifications

    /// Advance to `new_state` if the transition table allows it.
    /// Illegal transitions are programmer errors: logged and ignored.
    /// Emits exactly one state event per actual change.
    pub(crate) fn set_state(&self, new_state: CallState) -> Result<bool> {
        let old_state = {
            let mut state = self.state.lock()?;
            let old_state = *state;
            if old_state == new_state {
                return Ok(false);
            }
            if !old_state.can_transition_to(new_state) {
                warn!(
                    "call {}: illegal transition {} -> {}, ignoring",
                    self.call_id, old_state, new_state
                );
                return Ok(false);
            }
            *state = new_state;
            old_state
        };

        // Any state exit disarms the timer that state armed.
        match old_state {
            CallState::InviteSent => self.disarm_invite_timeout(),
            CallState::Ringing => self.disarm_ring_timeout(),
            _ => {}
        }

        info!(
            "call {}: state {} -> {}",
            self.call_id, old_state, new_state
        );
        if let Some(observer) = self.observer_handle() {
            observer.on_state_changed(&self.call_id, new_state, old_state);
        }
        Ok(true)
    }

    fn observer_handle(&self) -> Option<Arc<dyn CallObserver>> {
        self.observer.lock().ok().and_then(|guard| guard.clone())
    }

    pub(crate) fn notify_error(&self, code: CallErrorCode, message: impl Into<String>) {
        let message = message.into();
        error!("call {}: {}: {}", self.call_id, code, message);
        if let Some(observer) = self.observer_handle() {
            observer.on_error(&self.call_id, code, message);
        }
    }

    fn notify_hold_unhold(&self, on_hold: bool) {
        info!("call {}: local hold: {}", self.call_id, on_hold);
        if let Some(observer) = self.observer_handle() {
            observer.on_hold_unhold(&self.call_id, on_hold);
        }
    }

    fn arm_invite_timeout(&self) -> Result<()> {
        let call = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(INVITE_LIFETIME).await;
            let _ = call.inject_event(CallEvent::InviteTimeout);
        });
        self.timers.lock()?.invite_timeout = Some(handle);
        Ok(())
    }

    fn disarm_invite_timeout(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(handle) = timers.invite_timeout.take() {
                handle.abort();
            }
        }
    }

    fn arm_ring_timeout(&self, remaining: Duration) -> Result<()> {
        let call = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let _ = call.inject_event(CallEvent::RingLifetimeExpired);
        });
        self.timers.lock()?.ring_timeout = Some(handle);
        Ok(())
    }

    fn disarm_ring_timeout(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(handle) = timers.ring_timeout.take() {
                handle.abort();
            }
        }
    }

    // -------------------------------------------------------------------
    // Termination

    /// Tear the call down.  Idempotent: the first caller wins; later
    /// calls are no-ops.  `send_hangup` puts a hangup on the wire when
    /// the far side does not already know; `emit_hangup` raises the
    /// hangup event to the owner.
    pub(crate) async fn terminate(
        &self,
        party: HangupParty,
        code: CallErrorCode,
        send_hangup: bool,
        emit_hangup: bool,
    ) -> Result<()> {
        {
            let mut hangup = self.hangup.lock()?;
            if hangup.is_some() {
                return Ok(());
            }
            *hangup = Some((party, code));
        }
        info!(
            "call {}: terminating, party: {}, code: {}",
            self.call_id, party, code
        );
        self.set_state(CallState::Ended)?;

        let has_successor = self.successor.lock()?.is_some();
        {
            let media = self.media.lock()?;
            // A successor inherited the local stream; it is not ours to
            // stop any more.
            if !has_successor {
                if let Some(stream) = &media.local_stream {
                    stream.stop_all();
                }
            }
            if let Some(stream) = &media.remote_stream {
                stream.stop_all();
            }
        }
        if let Some(stream) = self.inherited_stream.lock()?.take() {
            stream.stop_all();
        }

        if self.peer_connection.signaling_state() != SignalingState::Closed {
            self.peer_connection.close();
        }

        if send_hangup && self.should_send_hangup()? {
            let reason = HangupReason::from_error_code(code);
            if let Err(error) = self
                .send_signaling(Message::Hangup(signaling::Hangup { reason }))
                .await
            {
                warn!("call {}: failed to send hangup: {}", self.call_id, error);
            }
        }

        if emit_hangup {
            if let Some(observer) = self.observer_handle() {
                observer.on_hangup(&self.call_id);
            }
        }
        Ok(())
    }

    /// An outbound call that never sent its invite has nothing to hang
    /// up; an inbound call always answers a hangup (which doubles as a
    /// reject for v0 peers).
    fn should_send_hangup(&self) -> Result<bool> {
        match self.direction {
            CallDirection::Outbound => Ok(self.negotiation.lock()?.invite_or_answer_sent),
            CallDirection::Inbound => Ok(true),
        }
    }

    /// Emit an error and terminate without touching the wire.
    async fn fail(&self, code: CallErrorCode, message: impl Into<String>) -> Result<()> {
        self.notify_error(code, message);
        self.terminate(HangupParty::Local, code, false, false).await
    }

    /// A signaling send failed: ask the transport to cancel the pending
    /// event for deduplication, then fail.
    async fn fail_send(
        &self,
        typ: MessageType,
        code: CallErrorCode,
        message: String,
    ) -> Result<()> {
        self.transport
            .cancel_send(&self.room_id, &self.call_id, typ)
            .await;
        self.fail(code, message).await
    }

    pub(crate) async fn send_signaling(
        &self,
        message: Message,
    ) -> std::result::Result<(), TransportError> {
        info!("call {}: TX {}", self.call_id, message);
        let outbound = OutboundMessage {
            envelope: Envelope {
                version: PROTOCOL_VERSION,
                call_id: self.call_id.clone(),
                party_id: self.our_party_id.clone(),
            },
            message,
        };
        self.transport.send(&self.room_id, outbound).await
    }

    // -------------------------------------------------------------------
    // Party-id filtering

    /// Whether a message from `sender` should be processed.  Once a
    /// partner has committed, only its messages count; before that,
    /// everything but our own reflected messages passes (which also
    /// lets an early v0 hangup act as a reject).
    pub(crate) fn should_accept_from(
        &self,
        sender: Option<&PartyId>,
        typ: MessageType,
    ) -> Result<bool> {
        if sender == Some(&self.our_party_id) {
            debug!(
                "call {}: ignoring our own reflected {}",
                self.call_id, typ
            );
            return Ok(false);
        }
        let opponent = self.opponent.lock()?;
        if opponent.party_id.matches(sender) {
            Ok(true)
        } else {
            info!(
                "call {}: ignoring {} from party {:?}, partner is {}",
                self.call_id, typ, sender, opponent.party_id
            );
            Ok(false)
        }
    }

    // -------------------------------------------------------------------
    // Media orchestration

    /// Start the outbound flow: acquire media, then wait for the stack
    /// to ask for negotiation.
    pub(crate) async fn handle_place_call(&self) -> Result<()> {
        self.set_state(CallState::WaitLocalMedia)?;
        self.spawn_media_acquisition()
    }

    /// The user answered a ringing call.
    pub(crate) async fn handle_local_answer(&self) -> Result<()> {
        if self.state()? != CallState::Ringing {
            warn!("call {}: answer while not ringing, ignoring", self.call_id);
            return Ok(());
        }
        self.set_state(CallState::WaitLocalMedia)?;
        if self.inherit_media.load(Ordering::Acquire) {
            // Glare: the predecessor call's media will arrive shortly.
            info!("call {}: waiting for inherited media", self.call_id);
            return Ok(());
        }
        self.spawn_media_acquisition()
    }

    /// Media acquisition happens off the state machine; completion is
    /// re-injected as an event.
    fn spawn_media_acquisition(&self) -> Result<()> {
        let call = self.clone();
        let media_type = self.media_type()?;
        tokio::spawn(async move {
            let constraints = MediaConstraints::for_media_type(media_type);
            let defaults = settings::media_device_defaults();
            match call
                .media_source
                .get_user_media(constraints, &defaults)
                .await
            {
                Ok(stream) => {
                    let _ = call.inject_event(CallEvent::MediaAcquired(stream));
                }
                Err(error) => {
                    let _ = call.inject_event(CallEvent::MediaFailed(error.to_string()));
                }
            }
        });
        Ok(())
    }

    pub(crate) async fn handle_media_acquired(&self, stream: MediaStream) -> Result<()> {
        // A replaced call hands its media to its successor.
        if let Some(successor) = self.successor.lock()?.clone() {
            info!(
                "call {}: delegating acquired media to successor {}",
                self.call_id,
                successor.call_id()
            );
            return successor.inject_event(CallEvent::GotMediaForAnswer(stream));
        }
        if self.state()?.is_terminal() {
            stream.stop_all();
            return Ok(());
        }

        match self.direction {
            CallDirection::Outbound => {
                // The stack fires negotiation-needed once the tracks are
                // attached; the offer is created then, not eagerly.
                self.set_state(CallState::CreateOffer)?;
                self.adopt_local_stream(&stream)?;
                Ok(())
            }
            CallDirection::Inbound => {
                self.adopt_local_stream(&stream)?;
                self.set_state(CallState::CreateAnswer)?;
                self.proceed_with_answer().await
            }
        }
    }

    pub(crate) async fn handle_media_failed(&self, error: String) -> Result<()> {
        if let Some(successor) = self.successor.lock()?.clone() {
            return successor.inject_event(CallEvent::MediaFailed(error));
        }
        if self.state()?.is_terminal() {
            return Ok(());
        }
        self.fail(CallErrorCode::NoUserMedia, error).await
    }

    /// Glare: a stream inherited from the predecessor call feeds our
    /// answer directly.
    pub(crate) async fn handle_got_media_for_answer(&self, stream: MediaStream) -> Result<()> {
        let state = self.state()?;
        if state.is_terminal() {
            stream.stop_all();
            return Ok(());
        }
        match state {
            CallState::Ringing | CallState::WaitLocalMedia => {
                self.adopt_local_stream(&stream)?;
                self.set_state(CallState::CreateAnswer)?;
                self.proceed_with_answer().await
            }
            CallState::Fledgling => {
                // The invite that created us is still being processed;
                // adopt the stream once we ring.
                info!(
                    "call {}: holding inherited stream until the invite lands",
                    self.call_id
                );
                *self.inherited_stream.lock()? = Some(stream);
                Ok(())
            }
            _ => {
                warn!(
                    "call {}: inherited media in state {}, ignoring",
                    self.call_id, state
                );
                Ok(())
            }
        }
    }

    pub(crate) fn mark_inherits_media(&self) {
        self.inherit_media.store(true, Ordering::Release);
    }

    fn adopt_local_stream(&self, stream: &MediaStream) -> Result<()> {
        self.media.lock()?.local_stream = Some(stream.clone());
        self.apply_track_gating()?;
        self.peer_connection.add_stream(stream)
    }

    /// Outbound tracks are live iff neither muted nor held.
    pub(crate) fn apply_track_gating(&self) -> Result<()> {
        let media = self.media.lock()?;
        if let Some(stream) = &media.local_stream {
            stream.set_audio_enabled(!(media.mic_muted || media.remote_on_hold));
            stream.set_video_enabled(!(media.vid_muted || media.remote_on_hold));
        }
        Ok(())
    }

    pub(crate) fn handle_set_microphone_muted(&self, muted: bool) -> Result<()> {
        self.media.lock()?.mic_muted = muted;
        self.apply_track_gating()
    }

    pub(crate) fn handle_set_video_muted(&self, muted: bool) -> Result<()> {
        self.media.lock()?.vid_muted = muted;
        self.apply_track_gating()
    }

    pub(crate) fn handle_set_remote_on_hold(&self, on_hold: bool) -> Result<()> {
        self.media.lock()?.remote_on_hold = on_hold;
        self.apply_track_gating()
    }

    /// Adopt the first remote stream the stack surfaces.  An inbound
    /// call upgrades to video when the caller is sending it.
    fn adopt_remote_stream(&self, stream: MediaStream) -> Result<()> {
        {
            let mut media = self.media.lock()?;
            if media.remote_stream.is_some() {
                return Ok(());
            }
            media.remote_stream = Some(stream.clone());
        }
        if self.direction == CallDirection::Inbound && stream.has_video() {
            let mut media_type = self.media_type.lock()?;
            if *media_type != CallMediaType::Video {
                info!(
                    "call {}: remote stream carries video, upgrading media type",
                    self.call_id
                );
                *media_type = CallMediaType::Video;
            }
        }
        Ok(())
    }

    pub(crate) fn handle_remote_stream_added(&self, stream: MediaStream) -> Result<()> {
        self.adopt_remote_stream(stream)
    }

    // -------------------------------------------------------------------
    // Negotiation

    /// The stack wants (re)negotiation: create an offer and send it as
    /// an invite or a negotiate, depending on where we are.
    pub(crate) async fn handle_negotiation_needed(&self) -> Result<()> {
        let state = self.state()?;
        if state.is_terminal() {
            return Ok(());
        }
        if state != CallState::CreateOffer
            && self.opponent_version()? < MIN_VERSION_FOR_RENEGOTIATION
        {
            info!(
                "call {}: peer cannot renegotiate, ignoring negotiation-needed",
                self.call_id
            );
            return Ok(());
        }

        let guard = match MakingOfferGuard::acquire(self)? {
            Some(guard) => guard,
            None => {
                debug!("call {}: offer already in progress", self.call_id);
                return Ok(());
            }
        };
        let offer = match self.peer_connection.create_offer().await {
            Ok(offer) => offer,
            Err(error) => {
                drop(guard);
                return self
                    .fail(
                        CallErrorCode::LocalOfferFailed,
                        format!("create_offer: {}", error),
                    )
                    .await;
            }
        };
        let result = self.got_local_offer(offer).await;
        drop(guard);
        result
    }

    /// Apply and send a freshly created local offer.
    async fn got_local_offer(&self, offer: SessionDescription) -> Result<()> {
        if self.state()?.is_terminal() {
            return Ok(());
        }
        if let Err(error) = self
            .peer_connection
            .set_local_description(offer.clone())
            .await
        {
            return self
                .fail(
                    CallErrorCode::SetLocalDescription,
                    format!("set_local_description: {}", error),
                )
                .await;
        }
        self.wait_for_initial_candidates().await;
        if self.state()?.is_terminal() {
            return Ok(());
        }

        // Whatever gathered so far rides inside the description.
        self.candidate_queue.lock()?.discard();
        let description = self
            .peer_connection
            .local_description()
            .unwrap_or(offer);

        let is_invite = self.state()? == CallState::CreateOffer;
        let (message, typ) = if is_invite {
            (
                Message::Invite(signaling::Invite {
                    offer: description,
                    lifetime: INVITE_LIFETIME.as_millis() as u64,
                }),
                MessageType::Invite,
            )
        } else {
            (
                Message::Negotiate(signaling::Negotiate { description }),
                MessageType::Negotiate,
            )
        };

        match self.send_signaling(message).await {
            Ok(()) => {
                if is_invite {
                    self.negotiation.lock()?.invite_or_answer_sent = true;
                    self.set_state(CallState::InviteSent)?;
                    self.arm_invite_timeout()?;
                }
                self.inject_event(CallEvent::FlushCandidates)
            }
            Err(TransportError::UnknownDevices) => {
                self.fail_send(
                    typ,
                    CallErrorCode::UnknownDevices,
                    "unknown devices in the room".to_string(),
                )
                .await
            }
            Err(error) => {
                let code = if is_invite {
                    CallErrorCode::SendInvite
                } else {
                    CallErrorCode::SignallingFailed
                };
                self.fail_send(typ, code, error.to_string()).await
            }
        }
    }

    /// Wait out the gather grace so the description carries initial
    /// candidates, but only if gathering is actually in progress.
    async fn wait_for_initial_candidates(&self) {
        if self.peer_connection.ice_gathering_state() == IceGatheringState::Gathering {
            tokio::time::sleep(GATHER_GRACE).await;
        }
    }

    /// Create, apply, and send our answer.  Runs in `CreateAnswer`.
    async fn proceed_with_answer(&self) -> Result<()> {
        let answer = match self.peer_connection.create_answer().await {
            Ok(answer) => answer,
            Err(error) => {
                return self
                    .fail(
                        CallErrorCode::CreateAnswer,
                        format!("create_answer: {}", error),
                    )
                    .await;
            }
        };
        if self.state()?.is_terminal() {
            return Ok(());
        }
        if let Err(error) = self
            .peer_connection
            .set_local_description(answer.clone())
            .await
        {
            return self
                .fail(
                    CallErrorCode::SetLocalDescription,
                    format!("set_local_description: {}", error),
                )
                .await;
        }
        self.wait_for_initial_candidates().await;
        if self.state()?.is_terminal() {
            return Ok(());
        }

        self.candidate_queue.lock()?.discard();
        let description = self
            .peer_connection
            .local_description()
            .unwrap_or(answer);

        match self
            .send_signaling(Message::Answer(signaling::Answer {
                answer: description,
            }))
            .await
        {
            Ok(()) => {
                self.negotiation.lock()?.invite_or_answer_sent = true;
                self.set_state(CallState::Connecting)?;
                self.inject_event(CallEvent::FlushCandidates)?;
                // ICE may already have finished while the answer was in
                // flight.
                if self.peer_connection.ice_connection_state().is_connected() {
                    self.set_state(CallState::Connected)?;
                }
                Ok(())
            }
            Err(TransportError::UnknownDevices) => {
                self.fail_send(
                    MessageType::Answer,
                    CallErrorCode::UnknownDevices,
                    "unknown devices in the room".to_string(),
                )
                .await
            }
            Err(error) => {
                self.fail_send(
                    MessageType::Answer,
                    CallErrorCode::SendAnswer,
                    error.to_string(),
                )
                .await
            }
        }
    }

    /// Perfect negotiation: apply a remote description, answering when
    /// it is an offer, yielding or ignoring on collision by politeness.
    pub(crate) async fn handle_received_negotiate(
        &self,
        received: ReceivedNegotiate,
    ) -> Result<()> {
        let description = received.description;
        let is_offer = description.is_offer();
        {
            let mut negotiation = self.negotiation.lock()?;
            let collision = is_offer
                && (negotiation.making_offer
                    || self.peer_connection.signaling_state() != SignalingState::Stable);
            negotiation.ignore_offer = !self.direction.is_polite() && collision;
            if negotiation.ignore_offer {
                info!(
                    "call {}: impolite side ignoring colliding offer",
                    self.call_id
                );
                return Ok(());
            }
        }

        let was_on_hold = self.is_local_on_hold();
        if let Err(error) = self
            .peer_connection
            .set_remote_description(description)
            .await
        {
            return self
                .fail(
                    CallErrorCode::SetRemoteDescription,
                    format!("set_remote_description: {}", error),
                )
                .await;
        }

        if is_offer {
            let answer = match self.peer_connection.create_answer().await {
                Ok(answer) => answer,
                Err(error) => {
                    return self
                        .fail(
                            CallErrorCode::CreateAnswer,
                            format!("create_answer: {}", error),
                        )
                        .await;
                }
            };
            if let Err(error) = self
                .peer_connection
                .set_local_description(answer.clone())
                .await
            {
                return self
                    .fail(
                        CallErrorCode::SetLocalDescription,
                        format!("set_local_description: {}", error),
                    )
                    .await;
            }
            let description = self
                .peer_connection
                .local_description()
                .unwrap_or(answer);
            if let Err(error) = self
                .send_signaling(Message::Negotiate(signaling::Negotiate { description }))
                .await
            {
                return self
                    .fail_send(
                        MessageType::Negotiate,
                        CallErrorCode::SignallingFailed,
                        error.to_string(),
                    )
                    .await;
            }
        }

        let now_on_hold = self.is_local_on_hold();
        if now_on_hold != was_on_hold {
            self.notify_hold_unhold(now_on_hold);
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Inbound invite / answer

    /// An invite arrived for this call: apply the offer and ring.
    pub(crate) async fn handle_incoming_invite(&self, received: ReceivedInvite) -> Result<()> {
        info!(
            "call {}: RX invite from {:?}: {}",
            self.call_id, received.sender_party_id, received.invite.offer
        );
        {
            let mut opponent = self.opponent.lock()?;
            opponent.party_id = OpponentPartyId::Chosen(received.sender_party_id.clone());
            opponent.version = received.sender_version;
        }

        if let Err(error) = self
            .peer_connection
            .set_remote_description(received.invite.offer)
            .await
        {
            return self
                .fail(
                    CallErrorCode::SetRemoteDescription,
                    format!("set_remote_description: {}", error),
                )
                .await;
        }
        match self.peer_connection.remote_streams().into_iter().next() {
            Some(stream) => self.adopt_remote_stream(stream)?,
            None => {
                return self
                    .fail(
                        CallErrorCode::SetRemoteDescription,
                        EngineError::NoRemoteStreams.to_string(),
                    )
                    .await;
            }
        }

        self.set_state(CallState::Ringing)?;

        let lifetime = Duration::from_millis(received.invite.lifetime);
        let remaining = lifetime.saturating_sub(received.age);
        if remaining.is_zero() {
            // Already stale in transit; ring and immediately give up.
            info!("call {}: invite expired in transit", self.call_id);
            return self
                .terminate(HangupParty::Remote, CallErrorCode::UserHangup, false, true)
                .await;
        }
        self.arm_ring_timeout(remaining)?;

        // Glare: a stream handed over by the call we replaced answers
        // this one without user action; both users already chose to
        // talk.
        let inherited = self.inherited_stream.lock()?.take();
        if let Some(stream) = inherited {
            return self.handle_got_media_for_answer(stream).await;
        }
        Ok(())
    }

    /// The ring window closed without the user answering.
    pub(crate) async fn handle_ring_expired(&self) -> Result<()> {
        if self.state()? != CallState::Ringing {
            return Ok(());
        }
        info!(
            "call {}: invite lifetime expired while ringing",
            self.call_id
        );
        self.terminate(HangupParty::Remote, CallErrorCode::UserHangup, false, true)
            .await
    }

    /// An answer arrived for our invite.  The first answering device
    /// becomes the committed partner; everyone else is told they lost.
    pub(crate) async fn handle_received_answer(&self, received: ReceivedAnswer) -> Result<()> {
        if self.opponent.lock()?.party_id.is_chosen() {
            info!(
                "call {}: already have an answer, ignoring one from {:?}",
                self.call_id, received.sender_party_id
            );
            return Ok(());
        }
        if self.state()? != CallState::InviteSent {
            warn!(
                "call {}: answer while not awaiting one, ignoring",
                self.call_id
            );
            return Ok(());
        }

        let chosen = received.sender_party_id.clone();
        {
            let mut opponent = self.opponent.lock()?;
            opponent.party_id = OpponentPartyId::Chosen(chosen.clone());
            opponent.version = received.sender_version;
        }
        info!(
            "call {}: RX answer from {:?}: {}",
            self.call_id, chosen, received.answer.answer
        );
        self.set_state(CallState::Connecting)?;

        if let Err(error) = self
            .peer_connection
            .set_remote_description(received.answer.answer)
            .await
        {
            return self
                .fail(
                    CallErrorCode::SetRemoteDescription,
                    format!("set_remote_description: {}", error),
                )
                .await;
        }
        match self.peer_connection.remote_streams().into_iter().next() {
            Some(stream) => self.adopt_remote_stream(stream)?,
            None => {
                return self
                    .fail(
                        CallErrorCode::SetRemoteDescription,
                        EngineError::NoRemoteStreams.to_string(),
                    )
                    .await;
            }
        }

        self.drain_remote_candidate_buffer(&chosen).await?;

        if let Some(selected) = chosen {
            // Losing the select_answer only leaves racing devices
            // ringing; the call itself is fine.
            if let Err(error) = self
                .send_signaling(Message::SelectAnswer(signaling::SelectAnswer {
                    selected_party_id: Some(selected),
                }))
                .await
            {
                warn!(
                    "call {}: failed to send select_answer: {}",
                    self.call_id, error
                );
            }
        }

        if self.peer_connection.ice_connection_state().is_connected() {
            self.set_state(CallState::Connected)?;
        }
        Ok(())
    }

    /// The caller told us which device won the answer race.
    pub(crate) async fn handle_received_select_answer(
        &self,
        received: ReceivedSelectAnswer,
    ) -> Result<()> {
        if self.direction != CallDirection::Inbound {
            warn!(
                "call {}: select_answer on an outbound call, ignoring",
                self.call_id
            );
            return Ok(());
        }
        if received.selected_party_id.as_ref() == Some(&self.our_party_id) {
            info!("call {}: our answer was selected", self.call_id);
            return Ok(());
        }
        info!(
            "call {}: answer selected from {:?}, not us",
            self.call_id, received.selected_party_id
        );
        self.terminate(
            HangupParty::Remote,
            CallErrorCode::AnsweredElsewhere,
            false,
            true,
        )
        .await
    }

    // -------------------------------------------------------------------
    // Hangup / reject

    pub(crate) async fn handle_local_hangup(&self) -> Result<()> {
        self.terminate(HangupParty::Local, CallErrorCode::UserHangup, true, true)
            .await
    }

    pub(crate) async fn handle_local_reject(&self) -> Result<()> {
        if self.state()? != CallState::Ringing {
            warn!("call {}: reject while not ringing, ignoring", self.call_id);
            return Ok(());
        }
        if self.opponent_version()? >= MIN_VERSION_FOR_RENEGOTIATION {
            if let Err(error) = self.send_signaling(Message::Reject).await {
                warn!("call {}: failed to send reject: {}", self.call_id, error);
            }
            self.terminate(HangupParty::Local, CallErrorCode::UserHangup, false, true)
                .await
        } else {
            // Legacy peers read an early hangup as a reject.
            self.terminate(HangupParty::Local, CallErrorCode::UserHangup, true, true)
                .await
        }
    }

    pub(crate) async fn handle_received_hangup(
        &self,
        received: signaling::ReceivedHangup,
    ) -> Result<()> {
        let code = HangupReason::to_error_code(received.reason);
        self.terminate(HangupParty::Remote, code, false, true).await
    }

    pub(crate) async fn handle_received_reject(&self) -> Result<()> {
        // Anywhere else we already hold an answer or a reject.
        if self.state()? != CallState::InviteSent {
            info!(
                "call {}: reject while not awaiting an answer, ignoring",
                self.call_id
            );
            return Ok(());
        }
        self.terminate(HangupParty::Remote, CallErrorCode::UserHangup, false, true)
            .await
    }

    pub(crate) async fn handle_invite_timeout(&self) -> Result<()> {
        if self.state()? != CallState::InviteSent {
            return Ok(());
        }
        info!("call {}: invite timed out", self.call_id);
        self.terminate(HangupParty::Local, CallErrorCode::InviteTimeout, true, true)
            .await
    }

    // -------------------------------------------------------------------
    // ICE

    pub(crate) async fn handle_ice_connection_change(
        &self,
        ice_state: IceConnectionState,
    ) -> Result<()> {
        if ice_state.is_connected() {
            if self.state()? == CallState::Connecting {
                self.set_state(CallState::Connected)?;
            }
            return Ok(());
        }
        match ice_state {
            IceConnectionState::Failed => {
                self.terminate(HangupParty::Local, CallErrorCode::IceFailed, true, true)
                    .await
            }
            IceConnectionState::Disconnected => {
                warn!("call {}: ice disconnected", self.call_id);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// A local candidate surfaced; buffer it and maybe schedule a
    /// flush.  Candidates never precede the description they belong to:
    /// while ringing, or before our invite/answer went out, they wait.
    pub(crate) fn handle_local_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let state = self.state()?;
        if state.is_terminal() {
            return Ok(());
        }
        let hold =
            state == CallState::Ringing || !self.negotiation.lock()?.invite_or_answer_sent;
        let action = self.candidate_queue.lock()?.enqueue(candidate, hold);
        if let EnqueueAction::ScheduleFlush(delay) = action {
            self.schedule_flush(delay);
        }
        Ok(())
    }

    fn schedule_flush(&self, delay: Duration) {
        let call = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = call.inject_event(CallEvent::FlushCandidates);
        });
    }

    /// Send everything buffered, retrying with backoff on failure.
    /// Transient send failures never terminate the call.
    pub(crate) async fn flush_candidate_queue(&self) -> Result<()> {
        let state = self.state()?;
        if state.is_terminal() {
            return Ok(());
        }
        if state == CallState::Ringing || !self.negotiation.lock()?.invite_or_answer_sent {
            // Gate closed again; the candidates ride the description.
            self.candidate_queue.lock()?.cancel_scheduled();
            return Ok(());
        }

        let mut batch = match self.candidate_queue.lock()?.begin_flush() {
            Some(batch) => batch,
            None => return Ok(()),
        };
        loop {
            info!(
                "call {}: sending {} candidates",
                self.call_id,
                batch.len()
            );
            match self
                .send_signaling(Message::Candidates(signaling::Candidates {
                    candidates: batch.clone(),
                }))
                .await
            {
                Ok(()) => match self.candidate_queue.lock()?.on_send_success() {
                    Some(next) => batch = next,
                    None => return Ok(()),
                },
                Err(error) => {
                    warn!(
                        "call {}: candidate send failed: {}",
                        self.call_id, error
                    );
                    match self.candidate_queue.lock()?.on_send_failure(batch) {
                        RetryAction::Retry(delay) => self.schedule_flush(delay),
                        RetryAction::Abandoned => {}
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Remote candidates: buffered until a partner commits, then added
    /// straight to the peer connection.
    pub(crate) async fn handle_received_candidates(
        &self,
        received: ReceivedCandidates,
    ) -> Result<()> {
        if !self.opponent.lock()?.party_id.is_chosen() {
            self.remote_candidates
                .lock()?
                .entry(received.sender_party_id.clone())
                .or_default()
                .extend(received.candidates);
            return Ok(());
        }
        self.add_remote_candidates(received.candidates).await
    }

    async fn add_remote_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()> {
        for candidate in candidates {
            if candidate.sdp_mid.is_none() && candidate.sdp_m_line_index.is_none() {
                debug!(
                    "call {}: ignoring candidate with no sdpMid or sdpMLineIndex",
                    self.call_id
                );
                continue;
            }
            if let Err(error) = self.peer_connection.add_ice_candidate(candidate.clone()).await {
                // While we are ignoring an offer we also swallow its
                // candidates.
                if !self.negotiation.lock()?.ignore_offer {
                    warn!(
                        "call {}: failed to add remote candidate {}: {}",
                        self.call_id, candidate, error
                    );
                }
            }
        }
        Ok(())
    }

    /// Once a partner commits, its buffered candidates are replayed and
    /// everyone else's are dropped.
    async fn drain_remote_candidate_buffer(&self, chosen: &Option<PartyId>) -> Result<()> {
        let buffered = {
            let mut buffers = self.remote_candidates.lock()?;
            let buffered = buffers.remove(chosen);
            buffers.clear();
            buffered
        };
        if let Some(candidates) = buffered {
            info!(
                "call {}: adding {} candidates buffered from the chosen party",
                self.call_id,
                candidates.len()
            );
            self.add_remote_candidates(candidates).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Glare / replacement

    /// Hand this call over to `new_call`, which won the glare tiebreak.
    /// Our media, acquired or in flight, feeds the replacement's answer.
    pub(crate) async fn handle_replace(&self, new_call: Call) -> Result<()> {
        let state = self.state()?;
        if state.is_terminal() {
            warn!("call {}: replace after termination, ignoring", self.call_id);
            return Ok(());
        }
        info!(
            "call {}: replaced by call {}",
            self.call_id,
            new_call.call_id()
        );
        match state {
            CallState::WaitLocalMedia => {
                // Our acquisition is still in flight; the successor
                // adopts the stream when it lands.
                new_call.mark_inherits_media();
            }
            CallState::CreateOffer => {
                if let Some(stream) = self.media.lock()?.local_stream.clone() {
                    new_call.inject_event(CallEvent::GotMediaForAnswer(stream))?;
                }
            }
            _ => {}
        }
        *self.successor.lock()? = Some(new_call.clone());
        if let Some(observer) = self.observer_handle() {
            observer.on_replaced(&self.call_id, &new_call);
        }
        self.terminate(HangupParty::Local, CallErrorCode::Replaced, true, false)
            .await
    }
}
