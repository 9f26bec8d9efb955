// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Panic records and tracebacks.
//!
//! A panic is an explicit linked record, not a host exception: nested
//! panics (a deferred call panicking during unwinding) chain, and `TRAP`
//! detaches the suffix above its baseline. Each record snapshots the frame
//! stack at raise time so tracebacks survive unwinding.

use std::sync::LazyLock;

use crate::object::{self, ObjRef};
use crate::vm::frame::Frame;

/// One frame of a traceback snapshot.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub qname: String,
    pub offset: usize,
    pub line: Option<u32>,
}

pub struct PanicRecord {
    pub object: ObjRef,
    pub trace: Vec<TraceEntry>,
    /// Set when the record was consumed by a trap.
    pub aborted: bool,
}

// === impl PanicRecord ===

impl PanicRecord {
    pub fn capture(object: ObjRef, frames: &[Frame]) -> Self {
        let trace = frames
            .iter()
            .map(|frame| TraceEntry {
                qname: frame.qname.clone(),
                offset: frame.ip,
                line: frame.line(),
            })
            .collect();

        Self {
            object,
            trace,
            aborted: false,
        }
    }
}

/// Pre-allocated error reserved for out-of-memory panics, so raising one
/// never allocates.
pub static OOM_PANIC: LazyLock<ObjRef> = LazyLock::new(|| {
    crate::object::error::error_new(
        crate::object::error::KIND_RUNTIME,
        "out of memory".to_string(),
    )
});

/// Render the panic chain the way the CLI prints it on an unhandled panic:
/// newest record first, each with its captured frames.
pub fn render_traceback(panics: &[PanicRecord]) -> String {
    let mut out = String::new();

    for (i, record) in panics.iter().enumerate().rev() {
        if i + 1 < panics.len() {
            out.push_str("during handling of the above panic:\n");
        }

        out.push_str("panic: ");
        match object::repr(&record.object) {
            Ok(repr) => out.push_str(&repr),
            Err(_) => out.push_str("<unprintable>"),
        }
        out.push('\n');

        for entry in record.trace.iter().rev() {
            match entry.line {
                Some(line) => {
                    out.push_str(&format!(
                        "  at {} (line {}, offset {})\n",
                        entry.qname, line, entry.offset
                    ));
                }
                None => {
                    out.push_str(&format!("  at {} (offset {})\n", entry.qname, entry.offset));
                }
            }
        }
    }

    out
}
