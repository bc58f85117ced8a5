use bytes::{Buf, Bytes, BytesMut};

/// Largest read performed while capturing a request.
pub const READ_CHUNK: usize = 1024;

const METHOD: &[u8; 4] = b"GET ";
const HEADERS_END: &[u8; 4] = b"\r\n\r\n";

/// How far an inbound request has been captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// Waiting for the `GET ` prefix.
    Start,
    /// Collecting the path up to the first space.
    Path,
    /// Skipping headers until the blank line.
    RequestEnd,
    /// The blank line has been seen; the selector is ready.
    Complete,
}

/// Last bytes seen while skipping headers, at most four.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderWindow {
    bytes: [u8; 4],
    len: usize,
}

impl HeaderWindow {
    pub fn push(&mut self, data: &[u8]) {
        if data.len() >= 4 {
            self.bytes.copy_from_slice(&data[data.len() - 4..]);
            self.len = 4;
            return;
        }

        let keep = self.len.min(4 - data.len());
        let mut next = [0u8; 4];
        next[..keep].copy_from_slice(&self.bytes[self.len - keep..self.len]);
        next[keep..keep + data.len()].copy_from_slice(data);
        self.bytes = next;
        self.len = keep + data.len();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_headers_end(&self) -> bool {
        self.as_slice() == HEADERS_END
    }
}

/// Incremental capture of `GET <path> ...\r\n...\r\n\r\n`.
///
/// Only the path is kept. Headers are never stored: while skipping them the
/// parser holds at most four bytes, so arbitrarily long headers and a blank
/// line split over many reads cost constant memory.
///
/// A request that does not start with exactly `GET ` never leaves
/// [`RequestPhase::Start`]; there is no rejection.
#[derive(Debug)]
pub struct RequestParser {
    phase: RequestPhase,
    buffer: BytesMut,
    selector: Option<Bytes>,
    window: HeaderWindow,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            phase: RequestPhase::Start,
            buffer: BytesMut::new(),
            selector: None,
            window: HeaderWindow::default(),
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    /// Room for the next read. While skipping headers the carried window and
    /// the new bytes together stay within [`READ_CHUNK`].
    pub fn read_limit(&self) -> usize {
        match self.phase {
            RequestPhase::RequestEnd => READ_CHUNK - self.window.len(),
            _ => READ_CHUNK,
        }
    }

    /// Bytes held for the request so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.window.len()
    }

    /// The first four bytes arrived and are not `GET `.
    pub fn is_stalled(&self) -> bool {
        self.phase == RequestPhase::Start
            && self.buffer.len() >= METHOD.len()
            && &self.buffer[..METHOD.len()] != METHOD
    }

    /// Hand over the selector once the request is complete.
    pub fn take_selector(&mut self) -> Option<Bytes> {
        if self.phase != RequestPhase::Complete {
            return None;
        }
        self.selector.take()
    }

    /// Append freshly read bytes and advance through every phase they allow.
    pub fn feed(&mut self, data: &[u8]) -> RequestPhase {
        match self.phase {
            // Nothing after a wrong prefix can ever matter.
            RequestPhase::Start if self.is_stalled() => {}
            RequestPhase::Start | RequestPhase::Path => self.buffer.extend_from_slice(data),
            RequestPhase::RequestEnd => self.window.push(data),
            RequestPhase::Complete => {}
        }

        if self.phase == RequestPhase::Start
            && self.buffer.len() >= METHOD.len()
            && &self.buffer[..METHOD.len()] == METHOD
        {
            self.buffer.advance(METHOD.len());
            self.phase = RequestPhase::Path;
        }

        if self.phase == RequestPhase::Path {
            if let Some(end) = self.buffer.iter().position(|&b| b == b' ') {
                let mut rest = std::mem::take(&mut self.buffer);
                self.selector = Some(rest.split_to(end).freeze());
                self.window.push(&rest);
                self.phase = RequestPhase::RequestEnd;
            }
        }

        if self.phase == RequestPhase::RequestEnd && self.window.is_headers_end() {
            self.window = HeaderWindow::default();
            self.phase = RequestPhase::Complete;
        }

        self.phase
    }
}
