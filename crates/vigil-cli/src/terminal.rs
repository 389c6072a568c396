//! The user's own terminal: raw mode and window size.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use nix::pty::Winsize;

/// Puts stdin in raw mode for its lifetime. A no-op when stdin is not a tty.
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    pub fn enable() -> Result<Self> {
        if !std::io::stdin().is_terminal() {
            return Ok(Self { active: false });
        }

        // Restore the terminal before the panic message is printed.
        let original_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = crossterm::terminal::disable_raw_mode();
            original_hook(info);
        }));

        crossterm::terminal::enable_raw_mode().context("failed to enable raw mode")?;
        Ok(Self { active: true })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

/// Current size of the user's terminal, if it has one.
pub fn window_size() -> Option<Winsize> {
    let (cols, rows) = crossterm::terminal::size().ok()?;
    if cols == 0 || rows == 0 {
        return None;
    }
    Some(Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    })
}
