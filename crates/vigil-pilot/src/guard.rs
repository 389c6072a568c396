//! Loop guard: keeps the supervisor from answering its own injections.
//!
//! Whatever we type into the target is usually echoed back on the output
//! stream. Without suppression an injected "yes" followed by the re-printed
//! prompt would trigger another injection, and so on forever.
//!
//! The guard holds three pieces of state:
//! - `awaiting_response`, set when an injection starts and cleared by a fixed
//!   cooldown deadline (not by observing the target),
//! - the most recent injected response,
//! - a bounded ring of recent responses with their send times.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use vigil_types::GuardConfig;

/// Why a chunk was not classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Veto {
    /// An injection is in flight or cooling down.
    AwaitingResponse,
    /// The chunk contains the latest injected response, sent moments ago.
    EchoOfLast,
    /// The chunk contains one of the recently injected responses.
    EchoOfRecent,
}

#[derive(Debug, Clone)]
struct SentResponse {
    text: String,
    at: Instant,
}

/// Per-session suppression state.
#[derive(Debug)]
pub struct LoopGuard {
    cooldown: Duration,
    echo_window: Duration,
    recent_window: Duration,
    capacity: usize,
    awaiting_response: bool,
    cooldown_until: Option<Instant>,
    /// Oldest first; the back is the most recent injection.
    recent: VecDeque<SentResponse>,
}

impl LoopGuard {
    pub fn new(config: &GuardConfig) -> Self {
        let capacity = config.recent_capacity.max(1);
        Self {
            cooldown: config.cooldown(),
            echo_window: config.echo_window(),
            recent_window: config.recent_window(),
            capacity,
            awaiting_response: false,
            cooldown_until: None,
            recent: VecDeque::with_capacity(capacity),
        }
    }

    /// Whether an injection is in flight or its cooldown has not elapsed.
    pub fn awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    /// Check a chunk against the echo rules.
    ///
    /// `awaiting_response` is not checked here; the classifier applies it to
    /// question rules only. Empty responses (a bare Enter) never count as
    /// echoes since every chunk would contain them.
    pub fn echo_veto(&self, text: &str, now: Instant) -> Option<Veto> {
        if let Some(last) = self.recent.back() {
            if !last.text.is_empty()
                && now.saturating_duration_since(last.at) < self.echo_window
                && text.contains(last.text.as_str())
            {
                return Some(Veto::EchoOfLast);
            }
        }

        let echoes_recent = self.recent.iter().any(|sent| {
            !sent.text.is_empty()
                && now.saturating_duration_since(sent.at) < self.recent_window
                && text.contains(sent.text.as_str())
        });
        echoes_recent.then_some(Veto::EchoOfRecent)
    }

    /// Mark an injection as started and arm the cooldown deadline.
    pub fn begin_injection(&mut self, now: Instant) {
        self.awaiting_response = true;
        self.cooldown_until = Some(now + self.cooldown);
    }

    /// Remember a response that was written to the target.
    pub fn record_sent(&mut self, text: &str, now: Instant) {
        if self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(SentResponse {
            text: text.to_string(),
            at: now,
        });
    }

    /// Undo [`begin_injection`](Self::begin_injection) after a failed write.
    pub fn abort_injection(&mut self) {
        self.awaiting_response = false;
        self.cooldown_until = None;
    }

    /// When the cooldown clears, if one is armed.
    pub fn cooldown_deadline(&self) -> Option<Instant> {
        self.cooldown_until
    }

    /// Clear `awaiting_response` once the cooldown deadline has passed.
    /// Returns true if the gate opened on this call.
    pub fn expire_cooldown(&mut self, now: Instant) -> bool {
        match self.cooldown_until {
            Some(deadline) if now >= deadline => {
                self.cooldown_until = None;
                self.awaiting_response = false;
                true
            }
            _ => false,
        }
    }

    /// The most recent injected response.
    pub fn last_response(&self) -> Option<&str> {
        self.recent.back().map(|sent| sent.text.as_str())
    }

    /// Recent responses, oldest first.
    pub fn recent_responses(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(|sent| sent.text.as_str())
    }
}
