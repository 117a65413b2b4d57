//! Marker framing over a raw output byte stream.
//!
//! The server interleaves free-form log text with framed events of the form
//! `<marker>eventType:eventBody<marker>`. [`FrameDecoder`] is fed arbitrary
//! chunks and yields plain lines and raw frame contents in stream order.
//! Partial lines and partial frames stay buffered until a later chunk (or
//! [`FrameDecoder::finish`]) completes them, so the output does not depend on
//! where the chunk boundaries fall.

use memchr::memmem;

/// A frame whose closing marker has not arrived after this many bytes is
/// abandoned: its body is passed through as plain text and the next marker is
/// taken as its close, so later frames stay aligned.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// One unit of decoded output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A plain text line without its terminator
    Line(String),
    /// The raw contents between two markers, `eventType:eventBody`
    Frame(String),
}

/// Split raw frame contents at the first `:` into `(event_type, event_body)`.
pub fn split_frame(raw: &str) -> Option<(&str, &str)> {
    let (event_type, event_body) = raw.split_once(':')?;
    let event_type = event_type.trim();
    if event_type.is_empty() {
        return None;
    }
    Some((event_type, event_body))
}

/// Incremental decoder for one output stream.
#[derive(Debug)]
pub struct FrameDecoder {
    marker: Option<Vec<u8>>,
    buffer: Vec<u8>,
    max_frame_len: usize,
    // A line break right after a closing marker ends the frame's own line
    after_frame: bool,
    // Inside an abandoned frame; the next marker closes it
    passthrough: bool,
}

impl FrameDecoder {
    /// Decoder that recognises frames bracketed by `marker`.
    pub fn new(marker: &str) -> Self {
        Self {
            marker: (!marker.is_empty()).then(|| marker.as_bytes().to_vec()),
            buffer: Vec::new(),
            max_frame_len: MAX_FRAME_LEN,
            after_frame: false,
            passthrough: false,
        }
    }

    /// Decoder that only splits lines, for streams that never carry frames.
    pub fn lines_only() -> Self {
        Self {
            marker: None,
            buffer: Vec::new(),
            max_frame_len: MAX_FRAME_LEN,
            after_frame: false,
            passthrough: false,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Bytes received but not yet emitted.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Append `chunk` and return everything that is now complete.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        let Some(marker) = self.marker.clone() else {
            self.drain_complete_lines(&mut out);
            return out;
        };

        loop {
            let Some(open) = memmem::find(&self.buffer, &marker) else {
                self.drain_complete_lines(&mut out);
                break;
            };

            if self.passthrough {
                self.flush_text(open, &mut out);
                self.buffer.drain(..marker.len());
                self.passthrough = false;
                self.after_frame = true;
                continue;
            }

            let body_start = open + marker.len();
            match memmem::find(&self.buffer[body_start..], &marker) {
                Some(body_len) => {
                    self.flush_text(open, &mut out);
                    let raw = &self.buffer[marker.len()..marker.len() + body_len];
                    out.push(Decoded::Frame(String::from_utf8_lossy(raw).into_owned()));
                    self.buffer.drain(..2 * marker.len() + body_len);
                    self.after_frame = true;
                }
                None => {
                    self.flush_text(open, &mut out);
                    if self.buffer.len() - marker.len() > self.max_frame_len {
                        tracing::warn!(
                            pending = self.buffer.len(),
                            "Oversized event frame; passing its body through as text"
                        );
                        self.buffer.drain(..marker.len());
                        self.passthrough = true;
                        self.drain_complete_lines(&mut out);
                    }
                    break;
                }
            }
        }

        out
    }

    /// Flush whatever is still buffered as plain text. Call once at end of stream.
    pub fn finish(&mut self) -> Vec<Decoded> {
        let mut out = Vec::new();
        self.passthrough = false;
        let end = self.buffer.len();
        self.flush_text(end, &mut out);
        out
    }

    fn push_line(&mut self, raw: &[u8], out: &mut Vec<Decoded>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.is_empty() && std::mem::take(&mut self.after_frame) {
            return;
        }
        self.after_frame = false;
        out.push(Decoded::Line(String::from_utf8_lossy(raw).into_owned()));
    }

    /// Emit `buffer[..end]` as lines, including a trailing partial line.
    fn flush_text(&mut self, end: usize, out: &mut Vec<Decoded>) {
        if end == 0 {
            return;
        }
        let text: Vec<u8> = self.buffer.drain(..end).collect();
        let mut segments = text.split(|b| *b == b'\n').peekable();
        while let Some(segment) = segments.next() {
            let is_last = segments.peek().is_none();
            // The piece after the final '\n' is empty when the text ended a line
            if is_last && segment.is_empty() {
                break;
            }
            self.push_line(segment, out);
        }
    }

    /// Emit every complete line and keep the unterminated tail buffered.
    fn drain_complete_lines(&mut self, out: &mut Vec<Decoded>) {
        match memchr::memrchr(b'\n', &self.buffer) {
            Some(last_newline) => self.flush_text(last_newline + 1, out),
            None if self.buffer.len() > self.max_frame_len => {
                tracing::warn!(pending = self.buffer.len(), "Overlong output line; flushing");
                // Keep a tail long enough to hold all but the last byte of a marker
                let keep = self
                    .marker
                    .as_ref()
                    .map_or(0, |marker| marker.len().saturating_sub(1));
                let end = self.buffer.len() - keep.min(self.buffer.len());
                self.flush_text(end, out);
            }
            None => {}
        }
    }
}
