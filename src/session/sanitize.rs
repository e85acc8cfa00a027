//! Output sanitization
//!
//! Two flavours:
//! - `sanitize_output` for `execute` results: every escape sequence and
//!   control byte is removed, line endings are normalized to `\n`.
//! - `StreamSanitizer` for interactive terminals: rendering escapes are
//!   kept, but never split across chunks, and the noise a browser terminal
//!   should not see (bracketed paste, repeated SGR, NUL) is dropped.

use vte::{Params, Parser, Perform};

/// Collects printable text, dropping every escape sequence
struct PlainText {
    lines: Vec<String>,
    current: String,
    /// Saw `\r` not yet followed by `\n`
    carriage_return: bool,
}

impl PlainText {
    fn new() -> Self {
        Self {
            lines: Vec::new(),
            current: String::new(),
            carriage_return: false,
        }
    }

    fn finish(mut self) -> String {
        if !self.current.is_empty() {
            self.lines.push(std::mem::take(&mut self.current));
        }
        while self.lines.last().is_some_and(|l| l.trim().is_empty()) {
            self.lines.pop();
        }
        self.lines.join("\n")
    }
}

impl Perform for PlainText {
    fn print(&mut self, c: char) {
        if self.carriage_return {
            // Bare CR: the rest of the line is being redrawn
            self.current.clear();
            self.carriage_return = false;
        }
        self.current.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.carriage_return = false;
                self.lines.push(std::mem::take(&mut self.current));
            }
            b'\r' => self.carriage_return = true,
            b'\t' => self.print('\t'),
            b'\x08' => {
                self.current.pop();
            }
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _c: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _c: char) {}

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

/// Strip escapes and control bytes from captured command output
pub fn sanitize_output(raw: &[u8]) -> String {
    let mut parser = Parser::new();
    let mut performer = PlainText::new();
    parser.advance(&mut performer, raw);
    performer.finish()
}

/// Longest escape sequence buffered while waiting for its terminator
const MAX_PENDING: usize = 4096;

enum Scan {
    Complete(usize),
    Incomplete,
}

/// Length of the escape sequence at the start of `buf` (`buf[0] == ESC`)
fn scan_escape(buf: &[u8]) -> Scan {
    let Some(&kind) = buf.get(1) else {
        return Scan::Incomplete;
    };
    match kind {
        b'[' => {
            for (i, &b) in buf.iter().enumerate().skip(2) {
                match b {
                    0x20..=0x3f => continue,
                    0x40..=0x7e => return Scan::Complete(i + 1),
                    // Malformed: cut before the stray byte
                    _ => return Scan::Complete(i),
                }
            }
            Scan::Incomplete
        }
        b']' | b'P' | b'X' | b'^' | b'_' => {
            let mut i = 2;
            while i < buf.len() {
                match buf[i] {
                    0x07 if kind == b']' => return Scan::Complete(i + 1),
                    0x1b => match buf.get(i + 1) {
                        Some(b'\\') => return Scan::Complete(i + 2),
                        Some(_) => return Scan::Complete(i),
                        None => return Scan::Incomplete,
                    },
                    _ => i += 1,
                }
            }
            Scan::Incomplete
        }
        b'(' | b')' | b'*' | b'+' | b'#' | b'%' => {
            if buf.len() >= 3 {
                Scan::Complete(3)
            } else {
                Scan::Incomplete
            }
        }
        _ => Scan::Complete(2),
    }
}

/// Expected length of a UTF-8 sequence from its lead byte
fn utf8_width(lead: u8) -> usize {
    match lead {
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf7 => 4,
        _ => 1,
    }
}

fn is_bracketed_paste(seq: &[u8]) -> bool {
    matches!(
        seq,
        b"\x1b[200~" | b"\x1b[201~" | b"\x1b[?2004h" | b"\x1b[?2004l"
    )
}

/// Repeating these has no visible effect
fn is_idempotent(seq: &[u8]) -> bool {
    seq.len() > 2 && seq[1] == b'[' && matches!(seq[seq.len() - 1], b'm' | b'h' | b'l')
}

/// Incremental sanitizer for one terminal stream
#[derive(Debug, Default)]
pub struct StreamSanitizer {
    pending: Vec<u8>,
    last_escape: Option<Vec<u8>>,
}

impl StreamSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitize the next chunk. Incomplete trailing sequences are held back
    /// until the following call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        let mut out = Vec::with_capacity(input.len());
        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            if b == 0x1b {
                match scan_escape(&input[i..]) {
                    Scan::Complete(n) => {
                        self.emit_escape(&input[i..i + n], &mut out);
                        i += n;
                    }
                    Scan::Incomplete if input.len() - i <= MAX_PENDING => {
                        self.pending = input[i..].to_vec();
                        break;
                    }
                    Scan::Incomplete => {
                        // Runaway sequence: pass it through rather than buffer forever
                        out.extend_from_slice(&input[i..]);
                        self.last_escape = None;
                        break;
                    }
                }
            } else if b == 0 {
                i += 1;
            } else {
                let width = utf8_width(b);
                if i + width > input.len() {
                    self.pending = input[i..].to_vec();
                    break;
                }
                out.extend_from_slice(&input[i..i + width]);
                self.last_escape = None;
                i += width;
            }
        }
        out
    }

    /// Whatever is still buffered, emitted as-is
    pub fn flush(&mut self) -> Vec<u8> {
        self.last_escape = None;
        std::mem::take(&mut self.pending)
    }

    fn emit_escape(&mut self, seq: &[u8], out: &mut Vec<u8>) {
        if is_bracketed_paste(seq) {
            return;
        }
        if is_idempotent(seq) && self.last_escape.as_deref() == Some(seq) {
            return;
        }
        out.extend_from_slice(seq);
        self.last_escape = Some(seq.to_vec());
    }
}
