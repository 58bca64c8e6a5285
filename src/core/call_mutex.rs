//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Call Mutex
//!
//! Wrapper around `std::sync::Mutex::lock()` that consumes poisoning
//! into a plain error.  Guards must never be held across an `await`.

use std::sync::{Mutex, MutexGuard};

use crate::common::Result;
use crate::error::EngineError;

pub struct CallMutex<T> {
    /// Human readable label for the mutex, for error reporting.
    label: &'static str,
    /// The actual mutex.
    mutex: Mutex<T>,
}

impl<T> CallMutex<T> {
    pub fn new(t: T, label: &'static str) -> CallMutex<T> {
        CallMutex {
            mutex: Mutex::new(t),
            label,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        match self.mutex.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(EngineError::MutexPoisoned(self.label.to_string()).into()),
        }
    }
}
