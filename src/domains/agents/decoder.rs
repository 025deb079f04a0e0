use serde::Serialize;
use serde_json::Value;

/// Largest frame kept in memory while waiting for its terminating newline.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One decoded unit of agent output: a JSON event, or a plain text line for agents
/// (or moments) that do not speak JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum AgentMessage {
    Json(Value),
    Text(String),
}

impl AgentMessage {
    fn from_frame(frame: &[u8]) -> Option<Self> {
        let line = String::from_utf8_lossy(frame);
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => Some(AgentMessage::Json(value)),
            Err(_) => Some(AgentMessage::Text(line.to_string())),
        }
    }
}

/// Incremental newline-delimited decoder. Bytes after the last newline stay buffered
/// until a later chunk completes the frame.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn with_limit(max_frame: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<AgentMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        let mut start = 0;
        while let Some(offset) = memchr::memchr(b'\n', &self.buffer[start..]) {
            let end = start + offset;
            messages.extend(AgentMessage::from_frame(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);

        if self.buffer.len() > self.max_frame {
            log::warn!(
                "Agent output frame exceeded {} bytes without a newline; flushing as text",
                self.max_frame
            );
            let oversized = std::mem::take(&mut self.buffer);
            messages.push(AgentMessage::Text(
                String::from_utf8_lossy(&oversized).into_owned(),
            ));
        }
        messages
    }

    /// Decodes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<AgentMessage> {
        let rest = std::mem::take(&mut self.buffer);
        AgentMessage::from_frame(&rest)
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
