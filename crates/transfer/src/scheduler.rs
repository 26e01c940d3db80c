use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::TransferError;

/// Client-side bookkeeping for sending one upload's chunks.
///
/// Hands out indices in ascending order with at most `concurrency` in
/// flight. A failed chunk goes back to the front of the queue; once a
/// chunk has failed more than `retries` times the upload fails.
#[derive(Debug)]
pub struct UploadScheduler {
    total_chunks: u64,
    concurrency: usize,
    retries: u32,
    queue: VecDeque<u64>,
    in_flight: BTreeSet<u64>,
    acked: BTreeSet<u64>,
    failures: HashMap<u64, u32>,
}

impl UploadScheduler {
    pub fn new(total_chunks: u64, concurrency: usize, retries: u32) -> Self {
        Self {
            total_chunks,
            concurrency: concurrency.max(1),
            retries,
            queue: (0..total_chunks).collect(),
            in_flight: BTreeSet::new(),
            acked: BTreeSet::new(),
            failures: HashMap::new(),
        }
    }

    /// Next index to send, if the window has room.
    pub fn next(&mut self) -> Option<u64> {
        if self.in_flight.len() >= self.concurrency {
            return None;
        }
        let index = self.queue.pop_front()?;
        self.in_flight.insert(index);
        Some(index)
    }

    /// Marks `index` as acknowledged by the host.
    pub fn ack(&mut self, index: u64) {
        self.in_flight.remove(&index);
        self.acked.insert(index);
    }

    /// Records a failed send of `index`. Returns the failure count so far,
    /// or an error when the retry budget is spent.
    pub fn fail(&mut self, index: u64) -> Result<u32, TransferError> {
        self.in_flight.remove(&index);
        let count = self.failures.entry(index).or_insert(0);
        *count += 1;
        if *count > self.retries {
            return Err(TransferError::RetriesExhausted {
                index,
                attempts: *count,
            });
        }
        Ok(*count)
    }

    /// Puts a failed index back at the front of the queue.
    pub fn requeue(&mut self, index: u64) {
        if !self.acked.contains(&index) && !self.in_flight.contains(&index) {
            self.queue.push_front(index);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn acked(&self) -> u64 {
        self.acked.len() as u64
    }

    pub fn is_done(&self) -> bool {
        self.acked.len() as u64 == self.total_chunks
    }
}
