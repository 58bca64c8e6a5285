//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Events the engine reports to its owner.

use crate::common::{CallId, CallState};
use crate::core::call::Call;
use crate::error::CallErrorCode;

/// Notifications emitted by a call.  Implementations must not call back
/// into the call synchronously.
pub trait CallObserver: Send + Sync {
    /// The call state changed.  Emitted exactly once per transition.
    fn on_state_changed(&self, call_id: &CallId, new_state: CallState, old_state: CallState);

    /// The remote side placed us on hold, or released us.
    fn on_hold_unhold(&self, call_id: &CallId, on_hold: bool);

    /// Something went wrong.  The call is terminating or terminated.
    fn on_error(&self, call_id: &CallId, code: CallErrorCode, message: String);

    /// The call ended.
    fn on_hangup(&self, call_id: &CallId);

    /// The call was superseded by `replacement` during glare
    /// resolution; the owner should adopt the replacement.
    fn on_replaced(&self, call_id: &CallId, replacement: &Call);
}
