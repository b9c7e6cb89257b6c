/// Splits a chunked byte stream into newline-delimited JSON records.
///
/// Engine streams (events, pull progress) arrive in arbitrary chunks that
/// may cut a record anywhere, including inside a multi-byte character.
#[derive(Debug, Default)]
pub struct NdjsonBuffer {
    pending: Vec<u8>,
}

impl NdjsonBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every record it completed, blank lines skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(text) = decode_line(&line) {
                lines.push(text);
            }
        }
        lines
    }

    /// Trailing record left without a final newline when the stream ended.
    pub fn finish(self) -> Option<String> {
        decode_line(&self.pending)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
