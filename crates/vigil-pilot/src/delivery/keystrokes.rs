use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use vigil_types::VigilError;

use super::{DeliveryRequest, DeliveryStrategy, ENTER};

/// Types the response into the terminal one character at a time.
///
/// Some TUIs drop input that arrives as a single burst. If a character
/// write fails, the whole response plus Enter is written in one go instead.
pub struct Keystrokes {
    delay: Duration,
    enter_delay: Duration,
}

impl Keystrokes {
    pub fn new(delay: Duration, enter_delay: Duration) -> Self {
        Self { delay, enter_delay }
    }

    async fn type_out(&self, request: &DeliveryRequest<'_>) -> Result<(), VigilError> {
        let mut buf = [0u8; 4];
        for (i, ch) in request.text.chars().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.delay).await;
            }
            request.terminal.write_all(ch.encode_utf8(&mut buf).as_bytes()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryStrategy for Keystrokes {
    fn name(&self) -> &'static str {
        "keystrokes"
    }

    async fn attempt(&self, request: &DeliveryRequest<'_>) -> Result<(), VigilError> {
        if let Err(e) = self.type_out(request).await {
            debug!(pid = request.pid, error = %e, "keystroke write failed, sending in bulk");
            let mut bulk = request.text.as_bytes().to_vec();
            bulk.extend_from_slice(ENTER);
            return request.terminal.write_all(&bulk).await;
        }
        tokio::time::sleep(self.enter_delay).await;
        request.terminal.write_all(ENTER).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::time::Instant;

    use super::*;
    use crate::delivery::testing::RecordingTerminal;

    fn request<'a>(text: &'a str, terminal: &'a RecordingTerminal) -> DeliveryRequest<'a> {
        DeliveryRequest {
            text,
            pid: 1,
            terminal,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn types_each_character_then_enter() {
        let strategy = Keystrokes::new(Duration::from_millis(30), Duration::from_millis(100));
        let terminal = RecordingTerminal::default();
        let started = Instant::now();
        strategy.attempt(&request("yes", &terminal)).await.unwrap();

        let writes = terminal.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![b"y".to_vec(), b"e".to_vec(), b"s".to_vec(), b"\r".to_vec()]);
        assert!(started.elapsed() >= Duration::from_millis(160));
    }

    #[tokio::test(start_paused = true)]
    async fn multibyte_characters_stay_whole() {
        let strategy = Keystrokes::new(Duration::from_millis(1), Duration::from_millis(1));
        let terminal = RecordingTerminal::default();
        strategy.attempt(&request("é", &terminal)).await.unwrap();
        assert_eq!(terminal.bytes(), "é\r".as_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_keystroke_falls_back_to_bulk() {
        let strategy = Keystrokes::new(Duration::from_millis(30), Duration::from_millis(100));
        let terminal = RecordingTerminal::default();
        terminal.fail_next.store(1, Ordering::SeqCst);
        strategy.attempt(&request("1", &terminal)).await.unwrap();
        assert_eq!(terminal.bytes(), b"1\r");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_response_is_just_enter() {
        let strategy = Keystrokes::new(Duration::from_millis(30), Duration::from_millis(100));
        let terminal = RecordingTerminal::default();
        strategy.attempt(&request("", &terminal)).await.unwrap();
        assert_eq!(terminal.bytes(), b"\r");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_terminal_fails() {
        let strategy = Keystrokes::new(Duration::from_millis(30), Duration::from_millis(100));
        let terminal = RecordingTerminal::default();
        terminal.closed.store(true, Ordering::SeqCst);
        assert!(strategy.attempt(&request("1", &terminal)).await.is_err());
    }
}
