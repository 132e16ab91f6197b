use serde::Deserialize;

/// What a completed SSE stream told us about itself: the model that produced
/// it and the concatenated assistant text, ready for token estimation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub model: Option<String>,
    pub content: String,
    pub saw_done: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// Incremental scanner over an OpenAI-style SSE stream.
///
/// The relay forwards raw bytes to the client untouched; this scanner sees the
/// same bytes on the side and accumulates only what usage accounting needs.
/// Non-JSON data lines and unknown event shapes are skipped, never errors.
#[derive(Debug, Default)]
pub struct SseScanner {
    buffer: String,
    data_lines: Vec<String>,
    summary: StreamSummary,
}

impl SseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) {
        // A chunk boundary can split a UTF-8 sequence; lossy decoding keeps
        // the ASCII SSE framing intact either way.
        let text = String::from_utf8_lossy(chunk).to_string();
        self.push_str(&text);
    }

    pub fn push_str(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_event();
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
            // `event:`/`id:` fields carry nothing we account for.
        }
    }

    pub fn finish(mut self) -> StreamSummary {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }
        self.finish_event();
        self.summary
    }

    fn finish_event(&mut self) {
        if self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();

        let trimmed = data.trim();
        if trimmed.is_empty() {
            return;
        }
        if trimmed.eq_ignore_ascii_case("[done]") {
            self.summary.saw_done = true;
            return;
        }

        let Ok(chunk) = serde_json::from_str::<ChatChunk>(trimmed) else {
            return;
        };
        if self.summary.model.is_none() {
            self.summary.model = chunk.model.filter(|m| !m.is_empty());
        }
        if let Some(choice) = chunk.choices.first()
            && let Some(content) = choice.delta.content.as_deref()
        {
            self.summary.content.push_str(content);
        }
    }
}
