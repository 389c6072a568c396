//! ANSI escape sequence stripping for clean text matching.
//!
//! The target prints colours, cursor movement and window-title updates
//! around its prompts. Rules match against visible text only, so every
//! chunk passes through [`strip_ansi`] before classification.

/// Scanner position inside an escape sequence.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Text,
    /// Just saw ESC.
    Escape,
    /// Inside `ESC [` (or bare `0x9B`) parameters.
    Csi,
    /// Inside `ESC ]` until BEL or `ESC \`.
    Osc,
    /// Saw ESC inside an OSC; a `\` ends the sequence.
    OscEscape,
}

/// An OSC longer than this is abandoned so a stray `ESC ]` cannot hide
/// the rest of the stream.
const MAX_OSC_BYTES: usize = 4096;

/// Incremental stripper for a stream of PTY reads.
///
/// Escape sequences and multi-byte characters may be split across reads;
/// the scanner position and any incomplete character carry over to the
/// next [`feed`](AnsiStripper::feed).
pub struct AnsiStripper {
    scan: Scan,
    /// Continuation bytes still owed to a multi-byte UTF-8 character.
    owed: u8,
    /// Bytes of a character cut off at the end of the last read.
    partial: Vec<u8>,
    osc_len: usize,
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self {
            scan: Scan::Text,
            owed: 0,
            partial: Vec::new(),
            osc_len: 0,
        }
    }

    /// Visible text of the next chunk of raw bytes.
    pub fn feed(&mut self, input: &[u8]) -> String {
        let mut visible = std::mem::take(&mut self.partial);
        visible.reserve(input.len());

        for &byte in input {
            if self.scan == Scan::Text && self.owed > 0 && (0x80..=0xBF).contains(&byte) {
                visible.push(byte);
                self.owed -= 1;
                continue;
            }
            self.owed = 0;
            self.scan = self.step(byte, &mut visible);
        }

        if self.owed > 0 {
            // Hold the unfinished character back for the next read.
            if let Some(lead) = visible.iter().rposition(|b| !(0x80..=0xBF).contains(b)) {
                self.partial = visible.split_off(lead);
            }
        }
        lossy(visible)
    }

    /// Flush a character left incomplete by the final read.
    pub fn finish(&mut self) -> String {
        self.owed = 0;
        lossy(std::mem::take(&mut self.partial))
    }

    fn step(&mut self, byte: u8, visible: &mut Vec<u8>) -> Scan {
        match (self.scan, byte) {
            (Scan::Text, 0x1B) => Scan::Escape,
            (Scan::Text, 0x9B) => Scan::Csi,
            (Scan::Text, b'\r') => Scan::Text,
            (Scan::Text, b) => {
                self.owed = match b {
                    0xC0..=0xDF => 1,
                    0xE0..=0xEF => 2,
                    0xF0..=0xF7 => 3,
                    _ => 0,
                };
                visible.push(b);
                Scan::Text
            }

            (Scan::Escape, b'[') => Scan::Csi,
            (Scan::Escape, b']') => {
                self.osc_len = 0;
                Scan::Osc
            }
            // Any other byte completes a two-byte escape.
            (Scan::Escape, _) => Scan::Text,

            // Parameter and intermediate bytes keep the sequence open.
            (Scan::Csi, 0x20..=0x3F) => Scan::Csi,
            (Scan::Csi, _) => Scan::Text,

            (Scan::Osc, 0x07) => Scan::Text,
            (Scan::Osc, 0x1B) => Scan::OscEscape,
            (Scan::Osc, _) => {
                self.osc_len += 1;
                if self.osc_len > MAX_OSC_BYTES {
                    Scan::Text
                } else {
                    Scan::Osc
                }
            }

            (Scan::OscEscape, b'\\') => Scan::Text,
            (Scan::OscEscape, 0x1B) => Scan::OscEscape,
            (Scan::OscEscape, _) => Scan::Osc,
        }
    }
}

fn lossy(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Strip ANSI escape sequences and carriage returns from raw terminal bytes.
///
/// Recognises CSI (`ESC [ ... final`), bare CSI (`0x9B`), OSC terminated by
/// BEL or `ESC \`, and two-byte escapes such as `ESC 7`. A sequence cut off
/// at the end of the input is dropped. Invalid UTF-8 is replaced with U+FFFD.
/// Use [`AnsiStripper`] for input that arrives in pieces.
pub fn strip_ansi(input: &[u8]) -> String {
    let mut stripper = AnsiStripper::new();
    let mut text = stripper.feed(input);
    text.push_str(&stripper.finish());
    text
}
