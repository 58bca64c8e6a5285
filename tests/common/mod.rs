//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Common test utilities: simulated collaborators and a per-test
//! context.  Tests run under a paused tokio clock, so every wall-clock
//! wait in the engine (flush delays, backoff, the 60 s invite timeout)
//! fires deterministically as soon as the runtime goes idle.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use peercall::common::{CallId, CallMediaType, CallState, PartyId, Result, RoomId};
use peercall::core::call::Call;
use peercall::core::observer::CallObserver;
use peercall::core::signaling::{
    Answer, Candidates, Hangup, HangupReason, Invite, MessageType, Negotiate, OutboundMessage,
    ReceivedAnswer, ReceivedCandidates, ReceivedHangup, ReceivedInvite, ReceivedMessage,
    ReceivedNegotiate, ReceivedReject, ReceivedSelectAnswer, SelectAnswer,
};
use peercall::core::transport::{SignalingTransport, TransportError};
use peercall::error::CallErrorCode;
use peercall::webrtc::media::{
    MediaConstraints, MediaSource, MediaStream, MediaTrack, TrackKind,
};
use peercall::webrtc::peer_connection::{
    IceCandidate, IceConnectionState, IceGatheringState, PeerConnection, PeerConnectionEvent,
    SessionDescription, SignalingState, TransceiverDirection,
};

use peercall::core::settings::MediaDeviceDefaults;

pub const ROOM: &str = "!room:example.org";
pub const OUR_PARTY: &str = "D1";
pub const THEIR_PARTY: &str = "D2";

pub fn test_init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------
// Media

pub struct FakeTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for FakeTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub fn fake_stream(audio: usize, video: usize) -> MediaStream {
    let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
    for _ in 0..audio {
        tracks.push(FakeTrack::new(TrackKind::Audio));
    }
    for _ in 0..video {
        tracks.push(FakeTrack::new(TrackKind::Video));
    }
    MediaStream::new(tracks)
}

pub struct SimMediaSource {
    fail_next: AtomicBool,
    acquired: Mutex<Vec<MediaConstraints>>,
    last_stream: Mutex<Option<MediaStream>>,
}

impl SimMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_next: AtomicBool::new(false),
            acquired: Mutex::new(Vec::new()),
            last_stream: Mutex::new(None),
        })
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn acquisitions(&self) -> Vec<MediaConstraints> {
        self.acquired.lock().unwrap().clone()
    }

    pub fn last_stream(&self) -> Option<MediaStream> {
        self.last_stream.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSource for SimMediaSource {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
        _defaults: &MediaDeviceDefaults,
    ) -> Result<MediaStream> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("no capture devices available"));
        }
        self.acquired.lock().unwrap().push(constraints);
        let stream = fake_stream(
            constraints.audio as usize,
            constraints.video as usize,
        );
        *self.last_stream.lock().unwrap() = Some(stream.clone());
        Ok(stream)
    }
}

// ---------------------------------------------------------------------
// Transport

pub struct SimTransport {
    sent_tx: mpsc::UnboundedSender<OutboundMessage>,
    fail_sends: AtomicUsize,
    fail_unknown_devices: AtomicBool,
    cancels: Mutex<Vec<(CallId, MessageType)>>,
    fallback_allowed: AtomicBool,
}

impl SimTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sent_tx,
                fail_sends: AtomicUsize::new(0),
                fail_unknown_devices: AtomicBool::new(false),
                cancels: Mutex::new(Vec::new()),
                fallback_allowed: AtomicBool::new(false),
            }),
            sent_rx,
        )
    }

    /// Fail the next `count` sends with a generic transport error.
    pub fn fail_next_sends(&self, count: usize) {
        self.fail_sends.store(count, Ordering::SeqCst);
    }

    /// Fail the next send with the unknown-devices sentinel.
    pub fn fail_next_with_unknown_devices(&self) {
        self.fail_unknown_devices.store(true, Ordering::SeqCst);
    }

    pub fn cancels(&self) -> Vec<(CallId, MessageType)> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalingTransport for SimTransport {
    async fn send(
        &self,
        _room_id: &RoomId,
        message: OutboundMessage,
    ) -> std::result::Result<(), TransportError> {
        if self.fail_unknown_devices.swap(false, Ordering::SeqCst) {
            return Err(TransportError::UnknownDevices);
        }
        let remaining = self.fail_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::SendFailed("injected failure".to_string()));
        }
        let _ = self.sent_tx.send(message);
        Ok(())
    }

    async fn cancel_send(&self, _room_id: &RoomId, call_id: &CallId, typ: MessageType) {
        self.cancels.lock().unwrap().push((call_id.clone(), typ));
    }

    fn fallback_ice_allowed(&self) -> bool {
        self.fallback_allowed.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------
// Peer connection

pub struct SimPeerConnection {
    events_tx: mpsc::Sender<PeerConnectionEvent>,
    signaling: Mutex<SignalingState>,
    gathering: Mutex<IceGatheringState>,
    ice: Mutex<IceConnectionState>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    /// Streams surfaced on the next successful set_remote_description.
    staged_remote_streams: Mutex<Vec<MediaStream>>,
    /// Directions applied by the next successful set_remote_description.
    staged_transceivers: Mutex<Option<Vec<TransceiverDirection>>>,
    remote_streams: Mutex<Vec<MediaStream>>,
    local_streams: Mutex<Vec<MediaStream>>,
    added_candidates: Mutex<Vec<IceCandidate>>,
    transceivers: Mutex<Vec<TransceiverDirection>>,
    offer_gate: Mutex<Option<Arc<Notify>>>,
    fail_next_set_remote: AtomicBool,
    closed: AtomicBool,
}

impl SimPeerConnection {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<PeerConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                events_tx,
                signaling: Mutex::new(SignalingState::Stable),
                gathering: Mutex::new(IceGatheringState::New),
                ice: Mutex::new(IceConnectionState::New),
                local_description: Mutex::new(None),
                remote_description: Mutex::new(None),
                staged_remote_streams: Mutex::new(Vec::new()),
                staged_transceivers: Mutex::new(None),
                remote_streams: Mutex::new(Vec::new()),
                local_streams: Mutex::new(Vec::new()),
                added_candidates: Mutex::new(Vec::new()),
                transceivers: Mutex::new(Vec::new()),
                offer_gate: Mutex::new(None),
                fail_next_set_remote: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            events_rx,
        )
    }

    /// Stream(s) the remote description will surface.
    pub fn stage_remote_stream(&self, stream: MediaStream) {
        self.staged_remote_streams.lock().unwrap().push(stream);
    }

    /// Make create_offer block until the returned handle is notified,
    /// keeping the call visibly mid-offer.
    pub fn gate_offers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.offer_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_next_set_remote(&self) {
        self.fail_next_set_remote.store(true, Ordering::SeqCst);
    }

    pub fn set_gathering_state(&self, state: IceGatheringState) {
        *self.gathering.lock().unwrap() = state;
    }

    pub fn set_transceiver_directions(&self, directions: Vec<TransceiverDirection>) {
        *self.transceivers.lock().unwrap() = directions;
    }

    /// Directions the next remote description negotiates, the way a
    /// real stack updates transceivers while applying it.
    pub fn stage_transceiver_directions(&self, directions: Vec<TransceiverDirection>) {
        *self.staged_transceivers.lock().unwrap() = Some(directions);
    }

    pub async fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self
            .events_tx
            .send(PeerConnectionEvent::IceCandidate(candidate))
            .await;
    }

    pub async fn emit_ice_state(&self, state: IceConnectionState) {
        *self.ice.lock().unwrap() = state;
        let _ = self
            .events_tx
            .send(PeerConnectionEvent::IceConnectionStateChange(state))
            .await;
    }

    pub async fn emit_remote_stream(&self, stream: MediaStream) {
        self.remote_streams.lock().unwrap().push(stream.clone());
        let _ = self
            .events_tx
            .send(PeerConnectionEvent::AddStream(stream))
            .await;
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.added_candidates.lock().unwrap().clone()
    }

    pub fn local_streams(&self) -> Vec<MediaStream> {
        self.local_streams.lock().unwrap().clone()
    }

    pub fn current_local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().unwrap().clone()
    }

    pub fn current_remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for SimPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let gate = self.offer_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(SessionDescription::offer(
            "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n".to_string(),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(
            "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n".to_string(),
        ))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        *self.signaling.lock().unwrap() = if description.is_offer() {
            SignalingState::HaveLocalOffer
        } else {
            SignalingState::Stable
        };
        *self.local_description.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if self.fail_next_set_remote.swap(false, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected set_remote_description failure"));
        }
        *self.signaling.lock().unwrap() = if description.is_offer() {
            SignalingState::HaveRemoteOffer
        } else {
            SignalingState::Stable
        };
        *self.remote_description.lock().unwrap() = Some(description);
        let mut staged = self.staged_remote_streams.lock().unwrap();
        self.remote_streams.lock().unwrap().append(&mut staged);
        if let Some(directions) = self.staged_transceivers.lock().unwrap().take() {
            *self.transceivers.lock().unwrap() = directions;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.added_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().unwrap().clone()
    }

    fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock().unwrap()
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        *self.gathering.lock().unwrap()
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        *self.ice.lock().unwrap()
    }

    fn transceiver_directions(&self) -> Vec<TransceiverDirection> {
        self.transceivers.lock().unwrap().clone()
    }

    fn add_stream(&self, stream: &MediaStream) -> Result<()> {
        self.local_streams.lock().unwrap().push(stream.clone());
        // The stack asks for negotiation once tracks land, unless an
        // offer/answer exchange is already in progress.
        if *self.signaling.lock().unwrap() == SignalingState::Stable {
            let _ = self.events_tx.try_send(PeerConnectionEvent::NegotiationNeeded);
        }
        Ok(())
    }

    fn remote_streams(&self) -> Vec<MediaStream> {
        self.remote_streams.lock().unwrap().clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.signaling.lock().unwrap() = SignalingState::Closed;
    }
}

// ---------------------------------------------------------------------
// Observer

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObservedEvent {
    State(CallState, CallState),
    HoldUnhold(bool),
    Error(CallErrorCode),
    Hangup,
    Replaced(CallId),
}

pub struct SimObserver {
    events_tx: mpsc::UnboundedSender<ObservedEvent>,
}

impl SimObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ObservedEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events_tx }), events_rx)
    }
}

impl CallObserver for SimObserver {
    fn on_state_changed(&self, _call_id: &CallId, new_state: CallState, old_state: CallState) {
        let _ = self
            .events_tx
            .send(ObservedEvent::State(new_state, old_state));
    }

    fn on_hold_unhold(&self, _call_id: &CallId, on_hold: bool) {
        let _ = self.events_tx.send(ObservedEvent::HoldUnhold(on_hold));
    }

    fn on_error(&self, _call_id: &CallId, code: CallErrorCode, _message: String) {
        let _ = self.events_tx.send(ObservedEvent::Error(code));
    }

    fn on_hangup(&self, _call_id: &CallId) {
        let _ = self.events_tx.send(ObservedEvent::Hangup);
    }

    fn on_replaced(&self, _call_id: &CallId, replacement: &Call) {
        let _ = self
            .events_tx
            .send(ObservedEvent::Replaced(replacement.call_id().clone()));
    }
}

// ---------------------------------------------------------------------
// Test context

/// Everything one simulated call needs, wired together.
pub struct TestContext {
    pub transport: Arc<SimTransport>,
    pub pc: Arc<SimPeerConnection>,
    pub media: Arc<SimMediaSource>,
    pub observer: Arc<SimObserver>,
    pub call: Call,
    pub sent: mpsc::UnboundedReceiver<OutboundMessage>,
    pub events: mpsc::UnboundedReceiver<ObservedEvent>,
}

impl TestContext {
    /// An outbound call, observer registered, nothing placed yet.
    pub fn outgoing(media_type: CallMediaType) -> Self {
        test_init();
        let (transport, sent) = SimTransport::new();
        let (pc, pc_events) = SimPeerConnection::new();
        let media = SimMediaSource::new();
        let (observer, events) = SimObserver::new();

        let call = Call::new_outbound(
            RoomId::from(ROOM),
            PartyId::from(OUR_PARTY),
            media_type,
            transport.clone(),
            pc.clone(),
            pc_events,
            media.clone(),
        );
        call.set_observer(observer.clone()).unwrap();
        Self {
            transport,
            pc,
            media,
            observer,
            call,
            sent,
            events,
        }
    }

    /// An inbound call for `call_id`, observer registered, invite not
    /// yet delivered.  An audio-only remote stream is staged so the
    /// offer applies cleanly.
    pub fn incoming(call_id: &str) -> Self {
        Self::incoming_with_stream(call_id, fake_stream(1, 0))
    }

    /// Like [`TestContext::incoming`], with a caller-chosen remote
    /// stream.
    pub fn incoming_with_stream(call_id: &str, remote_stream: MediaStream) -> Self {
        test_init();
        let (transport, sent) = SimTransport::new();
        let (pc, pc_events) = SimPeerConnection::new();
        pc.stage_remote_stream(remote_stream);
        let media = SimMediaSource::new();
        let (observer, events) = SimObserver::new();

        let call = Call::new_inbound(
            CallId::from(call_id),
            RoomId::from(ROOM),
            PartyId::from(OUR_PARTY),
            transport.clone(),
            pc.clone(),
            pc_events,
            media.clone(),
        );
        call.set_observer(observer.clone()).unwrap();
        Self {
            transport,
            pc,
            media,
            observer,
            call,
            sent,
            events,
        }
    }

    pub fn deliver(&self, message: ReceivedMessage) {
        self.call.received_message(message).unwrap();
    }

    /// The next outbound signaling message.  Panics if none arrives.
    pub async fn next_sent(&mut self) -> OutboundMessage {
        tokio::time::timeout(Duration::from_secs(600), self.sent.recv())
            .await
            .expect("timed out waiting for an outbound message")
            .expect("transport channel closed")
    }

    /// The next observer event.  Panics if none arrives.
    pub async fn next_event(&mut self) -> ObservedEvent {
        tokio::time::timeout(Duration::from_secs(600), self.events.recv())
            .await
            .expect("timed out waiting for an observer event")
            .expect("observer channel closed")
    }

    /// Consume observer events until the call reaches `state`,
    /// returning the states passed through on the way.
    pub async fn wait_for_state(&mut self, state: CallState) -> Vec<CallState> {
        let mut trace = Vec::new();
        loop {
            if let ObservedEvent::State(new_state, _) = self.next_event().await {
                trace.push(new_state);
                if new_state == state {
                    return trace;
                }
            }
        }
    }

    /// Consume observer events until a hangup is seen.
    pub async fn wait_for_hangup(&mut self) {
        loop {
            if self.next_event().await == ObservedEvent::Hangup {
                return;
            }
        }
    }
}

/// Let spawned operations run to their next suspension point.
pub async fn settle() {
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------
// Received message builders

pub fn remote_offer() -> SessionDescription {
    SessionDescription::offer(
        "v=0\r\no=- 2 2 IN IP4 0.0.0.0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n".to_string(),
    )
}

pub fn remote_answer() -> SessionDescription {
    SessionDescription::answer(
        "v=0\r\no=- 3 3 IN IP4 0.0.0.0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n".to_string(),
    )
}

pub fn remote_candidate(n: u32) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{} 1 udp 1 203.0.113.5 {} typ host", n, 50000 + n),
        Some("0".to_string()),
        Some(0),
    )
}

pub fn received_invite(lifetime_ms: u64, age_ms: u64, party: &str, version: u32) -> ReceivedInvite {
    ReceivedInvite {
        invite: Invite {
            offer: remote_offer(),
            lifetime: lifetime_ms,
        },
        age: Duration::from_millis(age_ms),
        sender_party_id: Some(PartyId::from(party)),
        sender_version: version,
    }
}

pub fn received_answer(party: &str) -> ReceivedMessage {
    ReceivedMessage::Answer(ReceivedAnswer {
        answer: Answer {
            answer: remote_answer(),
        },
        sender_party_id: Some(PartyId::from(party)),
        sender_version: 0,
    })
}

pub fn received_candidates(party: &str, candidates: Vec<IceCandidate>) -> ReceivedMessage {
    ReceivedMessage::Candidates(ReceivedCandidates {
        candidates,
        sender_party_id: Some(PartyId::from(party)),
    })
}

pub fn received_negotiate_offer(party: &str) -> ReceivedMessage {
    ReceivedMessage::Negotiate(ReceivedNegotiate {
        description: remote_offer(),
        sender_party_id: Some(PartyId::from(party)),
    })
}

pub fn received_hangup(party: Option<&str>, reason: Option<HangupReason>) -> ReceivedMessage {
    ReceivedMessage::Hangup(ReceivedHangup {
        reason,
        sender_party_id: party.map(PartyId::from),
    })
}

pub fn received_reject(party: &str) -> ReceivedMessage {
    ReceivedMessage::Reject(ReceivedReject {
        sender_party_id: Some(PartyId::from(party)),
    })
}

pub fn received_select_answer(party: &str, selected: &str) -> ReceivedMessage {
    ReceivedMessage::SelectAnswer(ReceivedSelectAnswer {
        selected_party_id: Some(PartyId::from(selected)),
        sender_party_id: Some(PartyId::from(party)),
    })
}

// ---------------------------------------------------------------------
// Message matchers

pub fn expect_invite(message: &OutboundMessage) -> &Invite {
    match &message.message {
        peercall::core::signaling::Message::Invite(invite) => invite,
        other => panic!("expected an invite, got {}", other),
    }
}

pub fn expect_answer(message: &OutboundMessage) -> &Answer {
    match &message.message {
        peercall::core::signaling::Message::Answer(answer) => answer,
        other => panic!("expected an answer, got {}", other),
    }
}

pub fn expect_candidates(message: &OutboundMessage) -> &Candidates {
    match &message.message {
        peercall::core::signaling::Message::Candidates(candidates) => candidates,
        other => panic!("expected candidates, got {}", other),
    }
}

pub fn expect_select_answer(message: &OutboundMessage) -> &SelectAnswer {
    match &message.message {
        peercall::core::signaling::Message::SelectAnswer(select) => select,
        other => panic!("expected a select_answer, got {}", other),
    }
}

pub fn expect_hangup(message: &OutboundMessage) -> &Hangup {
    match &message.message {
        peercall::core::signaling::Message::Hangup(hangup) => hangup,
        other => panic!("expected a hangup, got {}", other),
    }
}

pub fn expect_negotiate(message: &OutboundMessage) -> &Negotiate {
    match &message.message {
        peercall::core::signaling::Message::Negotiate(negotiate) => negotiate,
        other => panic!("expected a negotiate, got {}", other),
    }
}
