//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! The call registry.
//!
//! Owns every live call, routes inbound signaling messages by call id,
//! and resolves glare: simultaneous invites between the same two peers,
//! settled by replacing one call with the other.  The transport never
//! holds call references; lookups go through here.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{CallDirection, CallId, CallState, Result, RoomId};
use crate::core::call::Call;
use crate::core::call_mutex::CallMutex;
use crate::core::signaling::{ReceivedInvite, ReceivedMessage};
use crate::core::transport::IceServer;

/// Well-known STUN server, used only when the caller supplies no ICE
/// servers and the transport permits falling back.
pub const FALLBACK_STUN_URL: &str = "stun:turn.matrix.org";

/// The ICE servers a new peer connection should be built with.
pub fn resolve_ice_servers(configured: Vec<IceServer>, fallback_allowed: bool) -> Vec<IceServer> {
    if configured.is_empty() && fallback_allowed {
        info!("no ICE servers configured, falling back to {}", FALLBACK_STUN_URL);
        return vec![IceServer::stun(FALLBACK_STUN_URL)];
    }
    configured
}

/// Glare tiebreak: the pre-existing outbound call yields when it has
/// not yet sent its invite, or when its call id sorts after the
/// incoming one (both sides agree on that order).
fn existing_call_loses_glare(
    existing_state: CallState,
    existing_id: &CallId,
    incoming_id: &CallId,
) -> bool {
    matches!(
        existing_state,
        CallState::WaitLocalMedia | CallState::CreateOffer
    ) || existing_id > incoming_id
}

/// What became of a received invite.
#[derive(Debug, PartialEq, Eq)]
pub enum InviteDisposition {
    /// The invite started a fresh inbound call.
    Accepted,
    /// Glare: the invite replaced our outbound call.
    ReplacedExisting,
    /// Glare loser or duplicate; the caller should drop the candidate
    /// call it built.
    Ignored,
}

#[derive(Clone)]
pub struct CallManager {
    calls: Arc<CallMutex<HashMap<CallId, Call>>>,
}

impl Default for CallManager {
    fn default() -> Self {
        Self {
            calls: Arc::new(CallMutex::new(HashMap::new(), "calls")),
        }
    }
}

impl CallManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_call(&self, call: Call) -> Result<()> {
        self.calls
            .lock()?
            .insert(call.call_id().clone(), call);
        Ok(())
    }

    pub fn remove_call(&self, call_id: &CallId) -> Result<Option<Call>> {
        Ok(self.calls.lock()?.remove(call_id))
    }

    pub fn call(&self, call_id: &CallId) -> Result<Option<Call>> {
        Ok(self.calls.lock()?.get(call_id).cloned())
    }

    /// The live call in `room_id`, if any.
    pub fn active_call_in_room(&self, room_id: &RoomId) -> Result<Option<Call>> {
        let calls = self.calls.lock()?;
        for call in calls.values() {
            if call.room_id() == room_id && !call.state()?.is_terminal() {
                return Ok(Some(call.clone()));
            }
        }
        Ok(None)
    }

    /// Drop terminated calls from the registry.
    pub fn prune_terminated(&self) -> Result<()> {
        let mut calls = self.calls.lock()?;
        calls.retain(|_, call| !matches!(call.state(), Ok(state) if state.is_terminal()));
        Ok(())
    }

    /// Route a non-invite signaling message to its call.  Messages for
    /// unknown calls or the wrong room are dropped with a log line.
    pub fn received_message(
        &self,
        room_id: &RoomId,
        call_id: &CallId,
        message: ReceivedMessage,
    ) -> Result<()> {
        let Some(call) = self.call(call_id)? else {
            info!(
                "received_message(): no call {} for {}, dropping",
                call_id,
                message.typ()
            );
            return Ok(());
        };
        if call.room_id() != room_id {
            warn!(
                "received_message(): call {} is not in room {}, dropping",
                call_id, room_id
            );
            return Ok(());
        }
        call.received_message(message)
    }

    /// Handle a received invite.  `new_call` is the inbound call the
    /// owner constructed for it (the registry cannot build peer
    /// connections).  On glare the losing side is resolved here: either
    /// our outbound call is replaced by `new_call`, or the invite is
    /// ignored and the caller drops `new_call` unused.
    pub fn received_invite(
        &self,
        new_call: Call,
        received: ReceivedInvite,
    ) -> Result<InviteDisposition> {
        self.prune_terminated()?;

        if self.call(new_call.call_id())?.is_some() {
            info!(
                "received_invite(): duplicate invite for call {}, dropping",
                new_call.call_id()
            );
            return Ok(InviteDisposition::Ignored);
        }

        if let Some(existing) = self.active_call_in_room(new_call.room_id())? {
            if existing.direction() == CallDirection::Outbound {
                let state = existing.state()?;
                if existing_call_loses_glare(state, existing.call_id(), new_call.call_id()) {
                    info!(
                        "received_invite(): glare, replacing call {} with {}",
                        existing.call_id(),
                        new_call.call_id()
                    );
                    self.insert_call(new_call.clone())?;
                    new_call.start_incoming(received)?;
                    existing.replaced_by(&new_call)?;
                    return Ok(InviteDisposition::ReplacedExisting);
                }
                info!(
                    "received_invite(): glare, our call {} wins over {}",
                    existing.call_id(),
                    new_call.call_id()
                );
                return Ok(InviteDisposition::Ignored);
            }
        }

        self.insert_call(new_call.clone())?;
        new_call.start_incoming(received)?;
        Ok(InviteDisposition::Accepted)
    }
}
