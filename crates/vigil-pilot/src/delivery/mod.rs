//! Delivery subsystem: gets a response into the target program's input.
//!
//! A plain write to the terminal reaches whatever currently reads the PTY,
//! which is usually but not always the target. When the target's PID is
//! known, an ordered cascade of [`DeliveryStrategy`] implementations is
//! tried, the whole cascade repeated up to `retry_attempts` times. If every
//! strategy fails, or no PID is known, the response is written straight to
//! the terminal channel. Only a failure of that last write is reported
//! to the caller.

mod clipboard;
mod descriptor;
mod fifo;
mod keystrokes;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use vigil_types::{DeliveryConfig, StrategyKind, VigilError};

use crate::process::ProcessTable;

pub use clipboard::Clipboard;
pub use descriptor::DirectDescriptor;
pub use fifo::NamedPipe;
pub use keystrokes::Keystrokes;

/// Name reported when the guaranteed terminal write delivered the response.
pub const RAW_TERMINAL: &str = "raw_terminal";

/// Carriage return: what Enter sends in a raw-mode terminal.
pub(crate) const ENTER: &[u8] = b"\r";

/// Write side of the controlling terminal of the target's shell.
#[async_trait]
pub trait TerminalChannel: Send + Sync {
    async fn write_all(&self, bytes: &[u8]) -> Result<(), VigilError>;
}

/// Everything a strategy needs for one attempt.
pub struct DeliveryRequest<'a> {
    pub text: &'a str,
    pub pid: u32,
    pub terminal: &'a dyn TerminalChannel,
}

/// One way of getting text into the target's input.
///
/// Failure is routine; the driver moves on to the next strategy.
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, request: &DeliveryRequest<'_>) -> Result<(), VigilError>;

    /// Drop resources held for `pid`.
    fn release(&self, _pid: u32) {}
}

/// Outcome of one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Strategy name, or [`RAW_TERMINAL`].
    pub via: String,
    /// Strategy attempts made before success or the raw fallback.
    pub operations: u32,
    /// Whether the raw terminal write was used.
    pub fallback: bool,
    /// Target liveness after the verification delay, if checked.
    pub target_alive_after: Option<bool>,
}

/// The cascade driver.
pub struct Delivery {
    strategies: Vec<Box<dyn DeliveryStrategy>>,
    attempts: u32,
    pause: Duration,
    verify_after: Option<Duration>,
    table: Arc<dyn ProcessTable>,
}

impl Delivery {
    pub fn new(
        strategies: Vec<Box<dyn DeliveryStrategy>>,
        attempts: u32,
        pause: Duration,
        verify_after: Option<Duration>,
        table: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            strategies,
            attempts: attempts.max(1),
            pause,
            verify_after,
            table,
        }
    }

    /// Build the configured cascade with the stock strategies.
    pub fn from_config(config: &DeliveryConfig, table: Arc<dyn ProcessTable>) -> Self {
        let strategies = config
            .strategies
            .iter()
            .map(|kind| -> Box<dyn DeliveryStrategy> {
                match kind {
                    StrategyKind::DirectDescriptor => Box::new(DirectDescriptor),
                    StrategyKind::Keystrokes => Box::new(Keystrokes::new(
                        config.keystroke_delay(),
                        config.enter_delay(),
                    )),
                    StrategyKind::NamedPipe => Box::new(NamedPipe::new()),
                    StrategyKind::Clipboard => Box::new(Clipboard::new(config.enter_delay())),
                }
            })
            .collect();
        Self::new(
            strategies,
            config.retry_attempts,
            config.retry_pause(),
            config.verify_after(),
            table,
        )
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Most strategy attempts a single delivery can make.
    pub fn max_operations(&self) -> u32 {
        self.attempts * self.strategies.len() as u32
    }

    /// Deliver `text` (without terminator) to the target.
    ///
    /// Returns an error only when the raw terminal write fails.
    pub async fn deliver(
        &self,
        text: &str,
        pid: Option<u32>,
        terminal: &dyn TerminalChannel,
    ) -> Result<DeliveryReport, VigilError> {
        let Some(pid) = pid else {
            write_raw(terminal, text).await?;
            return Ok(DeliveryReport {
                via: RAW_TERMINAL.into(),
                operations: 0,
                fallback: true,
                target_alive_after: None,
            });
        };

        let request = DeliveryRequest { text, pid, terminal };
        let mut operations = 0;
        if !self.strategies.is_empty() {
            for attempt in 1..=self.attempts {
                for strategy in &self.strategies {
                    operations += 1;
                    match strategy.attempt(&request).await {
                        Ok(()) => {
                            info!(pid, strategy = strategy.name(), attempt, "response delivered");
                            let target_alive_after = self.verify(pid).await;
                            return Ok(DeliveryReport {
                                via: strategy.name().into(),
                                operations,
                                fallback: false,
                                target_alive_after,
                            });
                        }
                        Err(e) => {
                            debug!(pid, strategy = strategy.name(), attempt, error = %e, "strategy failed");
                        }
                    }
                }
                if attempt < self.attempts {
                    tokio::time::sleep(self.pause).await;
                }
            }
            warn!(pid, operations, "delivery cascade exhausted, writing to terminal");
        }

        write_raw(terminal, text).await?;
        let target_alive_after = self.verify(pid).await;
        Ok(DeliveryReport {
            via: RAW_TERMINAL.into(),
            operations,
            fallback: true,
            target_alive_after,
        })
    }

    /// Release per-target resources in every strategy.
    pub fn release(&self, pid: u32) {
        for strategy in &self.strategies {
            strategy.release(pid);
        }
    }

    /// Liveness after injection is weak evidence only; death is inconclusive.
    async fn verify(&self, pid: u32) -> Option<bool> {
        let delay = self.verify_after?;
        tokio::time::sleep(delay).await;
        let alive = self.table.is_alive(pid);
        if alive {
            debug!(pid, "target still running after injection");
        } else {
            info!(pid, "target gone after injection, delivery inconclusive");
        }
        Some(alive)
    }
}

async fn write_raw(terminal: &dyn TerminalChannel, text: &str) -> Result<(), VigilError> {
    let mut bytes = Vec::with_capacity(text.len() + ENTER.len());
    bytes.extend_from_slice(text.as_bytes());
    bytes.extend_from_slice(ENTER);
    terminal.write_all(&bytes).await
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::process::ProcessInfo;

    /// Terminal that records writes and can be switched to failing.
    #[derive(Default)]
    pub struct RecordingTerminal {
        pub writes: Mutex<Vec<Vec<u8>>>,
        pub closed: std::sync::atomic::AtomicBool,
        /// Fail this many writes before succeeding again.
        pub fail_next: AtomicU32,
    }

    impl RecordingTerminal {
        pub fn bytes(&self) -> Vec<u8> {
            self.writes.lock().unwrap().concat()
        }
    }

    #[async_trait]
    impl TerminalChannel for RecordingTerminal {
        async fn write_all(&self, bytes: &[u8]) -> Result<(), VigilError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(VigilError::TerminalError("closed".into()));
            }
            if self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(VigilError::TerminalError("write interrupted".into()));
            }
            self.writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    pub struct Scripted {
        pub name: &'static str,
        pub succeed_on: Option<u32>,
        pub calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl DeliveryStrategy for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn attempt(&self, _request: &DeliveryRequest<'_>) -> Result<(), VigilError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.succeed_on == Some(n) {
                Ok(())
            } else {
                Err(VigilError::DeliveryError(format!("{} refused", self.name)))
            }
        }
    }

    pub struct AliveTable;

    impl ProcessTable for AliveTable {
        fn processes(&self) -> Result<Vec<ProcessInfo>, VigilError> {
            Ok(Vec::new())
        }

        fn is_alive(&self, _pid: u32) -> bool {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::testing::*;
    use super::*;

    fn scripted(name: &'static str, succeed_on: Option<u32>) -> (Box<dyn DeliveryStrategy>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Box::new(Scripted {
                name,
                succeed_on,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    fn driver(strategies: Vec<Box<dyn DeliveryStrategy>>) -> Delivery {
        Delivery::new(
            strategies,
            3,
            Duration::from_millis(500),
            None,
            Arc::new(AliveTable),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_target_writes_raw_only() {
        let (a, a_calls) = scripted("a", Some(1));
        let delivery = driver(vec![a]);
        let terminal = RecordingTerminal::default();
        let report = delivery.deliver("1", None, &terminal).await.unwrap();
        assert_eq!(report.via, RAW_TERMINAL);
        assert_eq!(report.operations, 0);
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(terminal.bytes(), b"1\r");
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_stops_cascade() {
        let (a, a_calls) = scripted("a", None);
        let (b, b_calls) = scripted("b", Some(1));
        let (c, c_calls) = scripted("c", Some(1));
        let delivery = driver(vec![a, b, c]);
        let terminal = RecordingTerminal::default();
        let report = delivery.deliver("y", Some(42), &terminal).await.unwrap();
        assert_eq!(report.via, "b");
        assert_eq!(report.operations, 2);
        assert!(!report.fallback);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
        assert!(terminal.bytes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn whole_cascade_is_retried() {
        let (a, _) = scripted("a", None);
        let (b, b_calls) = scripted("b", Some(2));
        let delivery = driver(vec![a, b]);
        let terminal = RecordingTerminal::default();
        let report = delivery.deliver("y", Some(42), &terminal).await.unwrap();
        assert_eq!(report.via, "b");
        assert_eq!(report.operations, 4);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_cascade_falls_back_within_bound() {
        let (a, a_calls) = scripted("a", None);
        let (b, b_calls) = scripted("b", None);
        let delivery = driver(vec![a, b]);
        let terminal = RecordingTerminal::default();
        let started = tokio::time::Instant::now();
        let report = delivery.deliver("yes", Some(42), &terminal).await.unwrap();
        assert!(report.fallback);
        assert_eq!(report.operations, delivery.max_operations());
        assert_eq!(a_calls.load(Ordering::SeqCst) + b_calls.load(Ordering::SeqCst), 6);
        assert_eq!(terminal.bytes(), b"yes\r");
        // Two pauses between three rounds.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_terminal_surfaces_error() {
        let delivery = driver(vec![]);
        let terminal = RecordingTerminal::default();
        terminal.closed.store(true, Ordering::SeqCst);
        let err = delivery.deliver("1", Some(7), &terminal).await.unwrap_err();
        assert!(matches!(err, VigilError::TerminalError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn verification_reports_liveness() {
        let (a, _) = scripted("a", Some(1));
        let delivery = Delivery::new(
            vec![a],
            3,
            Duration::from_millis(500),
            Some(Duration::from_millis(500)),
            Arc::new(AliveTable),
        );
        let terminal = RecordingTerminal::default();
        let report = delivery.deliver("1", Some(9), &terminal).await.unwrap();
        assert_eq!(report.target_alive_after, Some(true));
    }

    #[test]
    fn config_builds_strategies_in_order() {
        let config = DeliveryConfig {
            strategies: vec![StrategyKind::Keystrokes, StrategyKind::DirectDescriptor],
            ..DeliveryConfig::default()
        };
        let delivery = Delivery::from_config(&config, Arc::new(AliveTable));
        assert_eq!(delivery.strategy_names(), vec!["keystrokes", "direct_descriptor"]);
        assert_eq!(delivery.max_operations(), 6);
    }
}
