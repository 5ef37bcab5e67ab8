//! Line decoding for the stream transport.
//!
//! The transport delivers opaque byte chunks which may contain any number
//! of complete `\n`-terminated lines plus a partial tail. The codec keeps
//! the tail (including a UTF-8 sequence split across chunks) buffered until
//! the rest arrives, and drops empty lines.

/// Incremental splitter of inbound byte chunks into protocol lines.
pub struct LineCodec {
    partial: Vec<u8>,
}

impl LineCodec {
    pub fn new() -> LineCodec {
        LineCodec { partial: Vec::new() }
    }

    /// Appends a chunk and returns every line completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.partial.drain(..=pos).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            if !raw.is_empty() {
                lines.push(String::from_utf8_lossy(&raw).to_string());
            }
        }
        lines
    }

    /// Discards any buffered partial line. Called when the transport drops,
    /// so a fragment from the old connection never prefixes the new one.
    pub fn reset(&mut self) {
        self.partial.clear();
    }
}

impl Default for LineCodec {
    fn default() -> LineCodec {
        LineCodec::new()
    }
}
