/// Out-of-band record telling the reader to close the transport,
/// distinct from `final = true` on the last protocol event so that a
/// dropped connection is distinguishable from a deliberate close.
pub const CLOSE_SENTINEL: &str = "[DONE]";

/// Render one framed record: `data: <payload>\n\n`.
pub fn encode_frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

pub fn close_frame() -> String {
    encode_frame(CLOSE_SENTINEL)
}

/// One decoded record from the framed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseRecord {
    /// The joined `data:` payload of a frame.
    Data(String),
    /// The close sentinel was received; the reader should stop.
    Close,
}

/// Incremental decoder for framed record streams. Accepts records
/// separated by `\n\n`, `\r\n\r\n` or `\r\r`, and tolerates frames
/// split across arbitrary read boundaries.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: String,
}

impl SseFrameDecoder {
    /// Feed bytes into the decoder and drain complete records.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseRecord> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut records = Vec::new();
        while let Some((start, len)) = find_frame_delimiter(&self.buffer) {
            let frame = self.buffer[..start].to_string();
            self.buffer.drain(0..start + len);
            if let Some(payload) = extract_data_payload(&frame) {
                if payload == CLOSE_SENTINEL {
                    records.push(SseRecord::Close);
                } else if !payload.is_empty() {
                    records.push(SseRecord::Data(payload));
                }
            }
        }
        records
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.trim().is_empty()
    }
}

fn find_frame_delimiter(buf: &str) -> Option<(usize, usize)> {
    // Longest first so "\r\n\r\n" is not split by its "\r\r" suffix.
    const DELIMITERS: [&str; 3] = ["\r\n\r\n", "\n\n", "\r\r"];
    let mut best: Option<(usize, usize)> = None;
    for delim in DELIMITERS {
        if let Some(pos) = buf.find(delim) {
            if best.map(|(p, _)| pos < p).unwrap_or(true) {
                best = Some((pos, delim.len()));
            }
        }
    }
    best
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let normalized = frame.replace("\r\n", "\n").replace('\r', "\n");
    let data_lines: Vec<&str> = normalized
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.trim())
        .collect();
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}
