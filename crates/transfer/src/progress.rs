use std::time::Instant;

use peershare_protocol::{TransferProgress, TransferStatus};

/// Byte/chunk accounting for one transfer.
#[derive(Debug, Clone)]
pub struct ProgressMeter {
    started: Instant,
    total_bytes: u64,
    total_chunks: u64,
    bytes: u64,
    chunks: u64,
}

impl ProgressMeter {
    pub fn new(total_bytes: u64, total_chunks: u64) -> Self {
        Self {
            started: Instant::now(),
            total_bytes,
            total_chunks,
            bytes: 0,
            chunks: 0,
        }
    }

    /// Records one applied chunk of `len` bytes.
    pub fn record(&mut self, len: u64) {
        self.bytes += len;
        self.chunks += 1;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    /// Completion percentage, 0..=100. Byte-based, falling back to chunk
    /// counts for empty files.
    pub fn percent(&self) -> f64 {
        let pct = if self.total_bytes > 0 {
            self.bytes as f64 / self.total_bytes as f64 * 100.0
        } else if self.total_chunks > 0 {
            self.chunks as f64 / self.total_chunks as f64 * 100.0
        } else {
            0.0
        };
        pct.min(100.0)
    }

    /// Average throughput since creation.
    pub fn speed(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self, status: TransferStatus) -> TransferProgress {
        TransferProgress {
            progress: self.percent(),
            speed_bytes_per_sec: self.speed(),
            status,
        }
    }
}
