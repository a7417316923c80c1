//! Byte-stream framing for the AT protocol: CRLF normalization and
//! response-terminator classification.
//!
//! The modem is free to split its output across reads however it likes (a
//! single `read` may carry half a line, or three whole ones), so the framer
//! is stateful across chunks: every byte is normalized exactly once, and a
//! CRLF pair straddling a chunk boundary still collapses to one LF.

/// Normalizes a raw byte stream into LF-terminated text.
///
/// Every CRLF pair and every lone CR becomes a single LF. Bytes are taken
/// as Latin-1; PDU-mode modem output is plain ASCII in practice.
#[derive(Debug, Default)]
pub(crate) struct LineFramer {
    pending_cr: bool,
}

impl LineFramer {
    pub(crate) fn new() -> Self {
        Self::default()
    }
    /// Feed one chunk, getting back its normalized text.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> String {
        let mut out = String::with_capacity(chunk.len());
        for &b in chunk {
            match b {
                b'\r' => {
                    self.pending_cr = true;
                    out.push('\n');
                }
                b'\n' => {
                    // The LF of a CRLF pair; the CR already produced the LF.
                    if !self.pending_cr {
                        out.push('\n');
                    }
                    self.pending_cr = false;
                }
                b => {
                    self.pending_cr = false;
                    out.push(b as char);
                }
            }
        }
        out
    }
}

/// Strips leading and trailing blank lines from normalized text.
pub(crate) fn trim_blank_lines(text: &str) -> &str {
    text.trim_matches('\n')
}

/// What ended a response buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Terminator {
    /// `OK` at a line start.
    Ok,
    /// `ERROR`, `+CME ERROR:` or `+CMS ERROR:` at a line start.
    Error,
    /// The `> ` continuation prompt after a `CMGS`/`CMGW` length
    /// announcement.
    Prompt,
}

fn terminator_at(line: &str) -> Option<Terminator> {
    if line.starts_with("OK") {
        Some(Terminator::Ok)
    } else if line.starts_with("ERROR")
        || line.starts_with("+CME ERROR")
        || line.starts_with("+CMS ERROR")
    {
        Some(Terminator::Error)
    } else if line.starts_with("> ") {
        Some(Terminator::Prompt)
    } else {
        None
    }
}

/// Tests a normalized response buffer for a terminator, anchored at line
/// starts.
///
/// `scanned` is the caller's last-scanned offset; scanning resumes from the
/// start of the line containing it (a line may have been partial on the
/// previous pass) and the offset is advanced to the end of the buffer, so
/// repeated appends do not rescan the whole buffer.
pub(crate) fn scan_terminator(buf: &str, scanned: &mut usize) -> Option<Terminator> {
    let mut pos = match buf[..*scanned].rfind('\n') {
        Some(i) => i + 1,
        None => 0,
    };
    *scanned = buf.len();
    loop {
        if let Some(t) = terminator_at(&buf[pos..]) {
            return Some(t);
        }
        match buf[pos..].find('\n') {
            Some(i) => pos += i + 1,
            None => return None,
        }
    }
}
