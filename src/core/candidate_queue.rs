//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Outbound ICE candidate batching.
//!
//! Local candidates are buffered and sent in batches to reduce
//! transport fan-out.  The queue holds candidates until the describing
//! invite or answer has gone out, aggregates bursts behind a short
//! delay, and retries failed sends with exponential backoff.  Timing is
//! driven by the call state machine; this module only decides.

use std::mem;
use std::time::Duration;

use crate::common::CallDirection;
use crate::webrtc::peer_connection::IceCandidate;

/// How long to aggregate a burst before flushing.  The outbound side
/// waits longer because the callee is still deciding whether to pick
/// up.
const INBOUND_FLUSH_DELAY: Duration = Duration::from_millis(500);
const OUTBOUND_FLUSH_DELAY: Duration = Duration::from_millis(2000);

const RETRY_DELAY_BASE_MS: u64 = 500;

/// A flush that has failed more than this many times is abandoned;
/// future enqueues may start over.
const MAX_SEND_TRIES: u32 = 5;

/// Where the queue is in its send cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing scheduled or in flight.
    Idle,
    /// A flush timer is running to aggregate a burst.
    Scheduled,
    /// A batch is on the wire.
    InFlight { tries: u32 },
    /// The last send failed; waiting out the backoff.
    CoolingDown { tries: u32 },
}

/// What the caller should do after an enqueue.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueAction {
    None,
    /// Start a timer and flush when it fires.
    ScheduleFlush(Duration),
}

/// What the caller should do after a failed send.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryAction {
    /// Start a timer and flush again when it fires.
    Retry(Duration),
    /// Give up on this batch; candidates stay buffered for a future
    /// enqueue to pick up.
    Abandoned,
}

pub struct CandidateQueue {
    direction: CallDirection,
    buffer: Vec<IceCandidate>,
    state: QueueState,
    sent_end_of_candidates: bool,
}

impl CandidateQueue {
    pub fn new(direction: CallDirection) -> Self {
        Self {
            direction,
            buffer: Vec::new(),
            state: QueueState::Idle,
            sent_end_of_candidates: false,
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The retry counter of the flush currently in progress, zero when
    /// none is.
    pub fn send_tries(&self) -> u32 {
        match self.state {
            QueueState::InFlight { tries } | QueueState::CoolingDown { tries } => tries,
            _ => 0,
        }
    }

    /// Buffer a candidate.  With `hold` set the candidate rides the
    /// next description instead of triggering a flush (still ringing,
    /// or no invite/answer sent yet).  The end-of-candidates sentinel
    /// is accepted at most once per call.
    pub fn enqueue(&mut self, candidate: IceCandidate, hold: bool) -> EnqueueAction {
        if candidate.is_end_of_candidates() {
            if self.sent_end_of_candidates {
                debug!("candidate queue: dropping duplicate end-of-candidates");
                return EnqueueAction::None;
            }
            self.sent_end_of_candidates = true;
        }
        self.buffer.push(candidate);

        if hold {
            return EnqueueAction::None;
        }
        match self.state {
            QueueState::Idle => {
                self.state = QueueState::Scheduled;
                EnqueueAction::ScheduleFlush(self.flush_delay())
            }
            // A flush is already pending, in flight, or backing off;
            // this candidate will ride along.
            _ => EnqueueAction::None,
        }
    }

    fn flush_delay(&self) -> Duration {
        match self.direction {
            CallDirection::Inbound => INBOUND_FLUSH_DELAY,
            CallDirection::Outbound => OUTBOUND_FLUSH_DELAY,
        }
    }

    /// Take the whole buffer for sending.  Returns `None` when there is
    /// nothing to send or a send is already in flight.
    pub fn begin_flush(&mut self) -> Option<Vec<IceCandidate>> {
        let tries = match self.state {
            QueueState::InFlight { .. } => return None,
            QueueState::CoolingDown { tries } => tries + 1,
            QueueState::Idle | QueueState::Scheduled => 1,
        };
        if self.buffer.is_empty() {
            self.state = QueueState::Idle;
            return None;
        }
        self.state = QueueState::InFlight { tries };
        Some(mem::take(&mut self.buffer))
    }

    /// The in-flight batch made it out.  Returns the next batch when
    /// new candidates arrived meanwhile, to be sent immediately.
    pub fn on_send_success(&mut self) -> Option<Vec<IceCandidate>> {
        if self.buffer.is_empty() {
            self.state = QueueState::Idle;
            None
        } else {
            self.state = QueueState::InFlight { tries: 1 };
            Some(mem::take(&mut self.buffer))
        }
    }

    /// The in-flight batch failed.  The batch is re-prepended so order
    /// is preserved for the retry.
    pub fn on_send_failure(&mut self, mut batch: Vec<IceCandidate>) -> RetryAction {
        let tries = self.send_tries();
        batch.append(&mut self.buffer);
        self.buffer = batch;

        if tries > MAX_SEND_TRIES {
            warn!(
                "candidate queue: giving up after {} tries, {} candidates remain buffered",
                tries,
                self.buffer.len()
            );
            self.state = QueueState::Idle;
            return RetryAction::Abandoned;
        }
        self.state = QueueState::CoolingDown { tries };
        RetryAction::Retry(Duration::from_millis(
            RETRY_DELAY_BASE_MS * 2u64.pow(tries),
        ))
    }

    /// The flush timer fired but the gate is closed again (back to
    /// ringing or the description has not gone out).  Candidates stay
    /// buffered for the description to carry.
    pub fn cancel_scheduled(&mut self) {
        if self.state == QueueState::Scheduled {
            self.state = QueueState::Idle;
        }
    }

    /// Drop everything buffered; the candidates will be carried inside
    /// the local description about to be sent.  The end-of-candidates
    /// latch survives: the sentinel goes out at most once per call.
    pub fn discard(&mut self) {
        if !self.buffer.is_empty() {
            debug!(
                "candidate queue: discarding {} candidates now embedded in the description",
                self.buffer.len()
            );
        }
        self.buffer.clear();
        if self.state == QueueState::Scheduled {
            self.state = QueueState::Idle;
        }
    }
}
