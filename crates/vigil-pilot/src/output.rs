//! Rolling window of recent, ANSI-stripped output lines.
//!
//! Classification works on whole chunks, but the decision oracle wants the
//! last few screens of context. [`RecentOutput`] keeps that context without
//! growing unbounded.

use std::collections::VecDeque;

/// Longest line kept, in bytes. Longer lines keep their end.
pub const MAX_LINE_BYTES: usize = 4096;

/// Ring buffer of recent output lines plus the unterminated tail.
pub struct RecentOutput {
    lines: VecDeque<String>,
    capacity: usize,
    /// Text after the last newline; completed by the next chunk.
    tail: String,
}

impl RecentOutput {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            tail: String::new(),
        }
    }

    /// Append an already-stripped chunk.
    pub fn push(&mut self, chunk: &str) {
        let mut parts = chunk.split('\n').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                // The last piece has no newline after it.
                self.tail.push_str(part);
                keep_end(&mut self.tail, MAX_LINE_BYTES);
                break;
            }
            let mut line = std::mem::take(&mut self.tail);
            line.push_str(part);
            keep_end(&mut line, MAX_LINE_BYTES);
            self.push_line(line);
        }
    }

    /// The most recent `n` lines, oldest first, including a non-empty tail.
    pub fn context(&self, n: usize) -> Vec<String> {
        let mut out: Vec<String> = self.lines.iter().cloned().collect();
        if !self.tail.is_empty() {
            out.push(self.tail.clone());
        }
        let start = out.len().saturating_sub(n);
        out.split_off(start)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.tail.is_empty()
    }

    fn push_line(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

/// Drop the front of `text` so at most `max` bytes remain.
fn keep_end(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = text.len() - max;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}
