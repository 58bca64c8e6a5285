//
// Copyright (C) 2023 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Helpers for keeping session descriptions and candidates out of logs.
//!
//! SDP bodies carry addresses and connectivity details.  Log lines show
//! shape, never content.

/// Summarize an SDP body for logging.
pub fn redact_sdp(sdp: &str) -> String {
    let media_sections = sdp.lines().filter(|line| line.starts_with("m=")).count();
    format!("<sdp: {} bytes, {} media sections>", sdp.len(), media_sections)
}

/// Summarize an ICE candidate string for logging.  The candidate type
/// (`host`, `srflx`, `relay`) is safe to show; the rest is not.
pub fn redact_candidate(candidate: &str) -> String {
    if candidate.is_empty() {
        return "<end-of-candidates>".to_string();
    }
    let typ = candidate
        .split_whitespace()
        .skip_while(|token| *token != "typ")
        .nth(1)
        .unwrap_or("unknown");
    format!("<candidate: {} bytes, typ {}>", candidate.len(), typ)
}
