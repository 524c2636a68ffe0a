//! Bounded output capture
//!
//! Backends push raw stdout/stderr bytes into an [`OutputSink`] as they are
//! produced. The sink keeps at most a bounded window of text and counts what
//! it throws away, so a run that is killed mid-way still has its partial
//! output, and a program printing gigabytes never grows host memory.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Which end of oversized output is cut
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncateFrom {
    /// Drop the beginning, keep the tail (where tracebacks end up)
    #[default]
    Start,
    /// Drop the end, keep the head
    End,
}

impl fmt::Display for TruncateFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TruncateFrom::Start => f.write_str("start"),
            TruncateFrom::End => f.write_str("end"),
        }
    }
}

/// Text produced by a run, already bounded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    /// Characters dropped to stay within the limit
    pub truncated_chars: usize,
}

struct SinkState {
    buf: String,
    buf_chars: usize,
    dropped: usize,
    /// Trailing bytes of an incomplete UTF-8 sequence
    pending: Vec<u8>,
    closed: bool,
}

/// Shared collector of combined program output
#[derive(Clone)]
pub struct OutputSink {
    limit: usize,
    from: TruncateFrom,
    state: Arc<Mutex<SinkState>>,
}

impl OutputSink {
    pub fn new(limit: usize, from: TruncateFrom) -> Self {
        Self {
            limit,
            from,
            state: Arc::new(Mutex::new(SinkState {
                buf: String::new(),
                buf_chars: 0,
                dropped: 0,
                pending: Vec::new(),
                closed: false,
            })),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append raw bytes, decoding UTF-8 across chunk boundaries
    pub fn write(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return;
        }
        let mut data = std::mem::take(&mut state.pending);
        data.extend_from_slice(bytes);

        let mut rest: &[u8] = &data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.push_locked(&mut state, text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix decodes
                    if let Ok(text) = std::str::from_utf8(valid) {
                        self.push_locked(&mut state, text);
                    }
                    match e.error_len() {
                        Some(len) => {
                            self.push_locked(&mut state, "\u{FFFD}");
                            rest = &after[len..];
                        }
                        None => {
                            state.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    pub fn write_str(&self, text: &str) {
        self.write(text.as_bytes());
    }

    fn push_locked(&self, state: &mut SinkState, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.from {
            TruncateFrom::End => {
                let room = self.limit.saturating_sub(state.buf_chars);
                let mut taken = 0;
                for (i, c) in text.char_indices() {
                    if taken == room {
                        state.dropped += text[i..].chars().count();
                        break;
                    }
                    state.buf.push(c);
                    taken += 1;
                }
                state.buf_chars += taken;
            }
            TruncateFrom::Start => {
                state.buf.push_str(text);
                state.buf_chars += text.chars().count();
                // Compact lazily so each byte is moved O(1) times on average
                if state.buf_chars > self.limit.saturating_mul(2).max(1024) {
                    let excess = state.buf_chars - self.limit;
                    let cut = byte_offset_of_char(&state.buf, excess);
                    state.buf.drain(..cut);
                    state.buf_chars -= excess;
                    state.dropped += excess;
                }
            }
        }
    }

    /// Characters seen so far, kept or dropped
    pub fn total_chars(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.buf_chars + state.dropped
    }

    /// Current bounded text, without closing the sink
    pub fn snapshot(&self) -> CapturedOutput {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (text, truncated_chars) = truncate_output(&state.buf, state.dropped, self.limit, self.from);
        CapturedOutput { text, truncated_chars }
    }

    /// Close the sink and return the final bounded text
    ///
    /// Late writes from a process that is still being torn down are ignored.
    pub fn finish(&self) -> CapturedOutput {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.pending.is_empty() {
                state.pending.clear();
                self.push_locked(&mut state, "\u{FFFD}");
            }
            state.closed = true;
        }
        self.snapshot()
    }
}

fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// Marker inserted where characters were elided
pub fn truncation_marker(dropped: usize, from: TruncateFrom) -> String {
    format!("...[{} characters truncated from the {}]...", dropped, from)
}

/// Bound `text` to `limit` characters, marking what was elided
///
/// `already_dropped` counts characters discarded before `text` was
/// assembled. Returns the final text and the total number of characters
/// elided. The result never exceeds `limit` plus the marker and one newline.
pub fn truncate_output(text: &str, already_dropped: usize, limit: usize, from: TruncateFrom) -> (String, usize) {
    let chars = text.chars().count();
    let excess = chars.saturating_sub(limit);
    let dropped = already_dropped + excess;
    if dropped == 0 {
        return (text.to_string(), 0);
    }

    let marker = truncation_marker(dropped, from);
    let out = match from {
        TruncateFrom::Start => {
            let kept = &text[byte_offset_of_char(text, excess)..];
            format!("{}\n{}", marker, kept)
        }
        TruncateFrom::End => {
            let kept = &text[..byte_offset_of_char(text, chars - excess)];
            format!("{}\n{}", kept, marker)
        }
    };
    (out, dropped)
}
