//! Incremental server-sent-events scanner.
//!
//! Upstream bytes are relayed untouched; the scanner only observes them so the
//! session can pick up the provider's usage report and the generated text.

const DONE: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data == DONE
    }
}

#[derive(Debug, Default)]
pub struct SseScanner {
    buffer: Vec<u8>,
    pos: usize,
    done: bool,
}

impl SseScanner {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            pos: 0,
            done: false,
        }
    }

    /// Whether a `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds a chunk and returns every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        if self.pos > 0 && self.buffer.len() + chunk.len() > 16384 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((end, delimiter)) = find_delimiter(&self.buffer[self.pos..]) {
            let start = self.pos;
            let block = String::from_utf8_lossy(&self.buffer[start..start + end]).into_owned();
            self.pos = start + end + delimiter;
            if let Some(event) = self.parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a trailing block that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.pos >= self.buffer.len() {
            return None;
        }
        let block = String::from_utf8_lossy(&self.buffer[self.pos..]).into_owned();
        self.pos = self.buffer.len();
        self.parse_block(&block)
    }

    fn parse_block(&mut self, block: &str) -> Option<SseEvent> {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                data.push(value.strip_prefix(' ').unwrap_or(value));
            } else if let Some(value) = line.strip_prefix("event:") {
                event = Some(value.trim().to_string());
            }
        }
        if data.is_empty() {
            return None;
        }
        let data = data.join("\n");
        if data.trim() == DONE {
            self.done = true;
        }
        Some(SseEvent { event, data })
    }
}

fn find_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}
