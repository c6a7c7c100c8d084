//! Per-transfer progress, reported as `tracing` events.

/// Running chunk and byte counts for one direction of a transfer.
///
/// Every `interval` chunks (and once at the end) an `INFO` event named
/// `transfer progress` carries the counts and, when the size was declared
/// up front, the percentage done.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    direction: &'static str,
    interval: u64,
    chunks: u64,
    bytes: u64,
    expected_bytes: Option<u64>,
}

impl TransferProgress {
    /// `interval` of 0 keeps only the final event.
    pub fn new(direction: &'static str, interval: u64) -> Self {
        Self {
            direction,
            interval,
            chunks: 0,
            bytes: 0,
            expected_bytes: None,
        }
    }

    pub fn expecting(mut self, expected_bytes: Option<u64>) -> Self {
        self.expected_bytes = expected_bytes;
        self
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn expected_bytes(&self) -> Option<u64> {
        self.expected_bytes
    }

    pub fn percent(&self) -> Option<u8> {
        let expected = self.expected_bytes?;
        if expected == 0 {
            return Some(100);
        }
        let pct = (u128::from(self.bytes) * 100 / u128::from(expected)).min(100);
        Some(pct as u8)
    }

    /// Count one chunk of `bytes` payload. Returns whether an event fired.
    pub fn record_chunk(&mut self, bytes: usize) -> bool {
        self.chunks = self.chunks.saturating_add(1);
        self.bytes = self.bytes.saturating_add(bytes as u64);
        let due = self.interval != 0 && self.chunks % self.interval == 0;
        if due {
            self.emit(false);
        }
        due
    }

    /// Final event, emitted once the transfer verified.
    pub fn finish(&self) {
        self.emit(true);
    }

    fn emit(&self, done: bool) {
        tracing::info!(
            direction = self.direction,
            chunks = self.chunks,
            bytes = self.bytes,
            expected_bytes = ?self.expected_bytes,
            percent = ?self.percent(),
            done,
            "transfer progress"
        );
    }
}
