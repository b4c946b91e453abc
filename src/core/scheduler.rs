//! Transfer scheduling and work distribution
//!
//! A single dispatcher feeds listed entries into a bounded job channel whose
//! capacity equals the worker count, so it blocks instead of racing ahead of
//! the workers. Outcomes flow back through an unbounded result channel.

use crate::error::{Result, XcpError};
use crate::fs::DirEntry;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TryIter};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A single file transfer
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Dispatch sequence number
    pub id: u64,
    /// Listed source entry
    pub entry: DirEntry,
}

/// How a transfer ended
#[derive(Debug)]
pub enum TransferStatus {
    /// Copied, with the number of bytes written
    Copied(u64),
    /// Failed after all attempts
    Failed(XcpError),
    /// Never started because the operation was stopped
    Skipped,
}

/// Report sent by a worker for every job it received
#[derive(Debug)]
pub struct TransferOutcome {
    /// Job ID
    pub job_id: u64,
    /// Relative path of the entry
    pub name: String,
    /// Final status
    pub status: TransferStatus,
    /// Attempts made (0 for skipped jobs)
    pub attempts: u32,
    /// Time spent on the transfer
    pub duration: Duration,
}

/// Counters shared by the dispatcher and the workers
#[derive(Debug, Default)]
pub struct TransferStats {
    /// Jobs handed to the pool
    pub dispatched: AtomicU64,
    /// Jobs copied successfully
    pub copied: AtomicU64,
    /// Jobs that failed
    pub failed: AtomicU64,
    /// Jobs skipped after a stop request
    pub skipped: AtomicU64,
    /// Jobs currently being transferred
    pub in_flight: AtomicUsize,
    /// Bytes written by successful jobs
    pub bytes_copied: AtomicU64,
}

impl TransferStats {
    /// Record the start of a transfer
    pub fn start(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a transfer
    pub fn finish(&self, status: &TransferStatus) {
        match status {
            TransferStatus::Copied(bytes) => {
                self.copied.fetch_add(1, Ordering::Relaxed);
                self.bytes_copied.fetch_add(*bytes, Ordering::Relaxed);
            }
            TransferStatus::Failed(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            TransferStatus::Skipped => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Jobs that have not reported back yet
    pub fn outstanding(&self) -> u64 {
        let done = self.copied.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed)
            + self.skipped.load(Ordering::Relaxed);
        self.dispatched.load(Ordering::Relaxed).saturating_sub(done)
    }

    /// Throughput in bytes/second
    pub fn throughput(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_copied.load(Ordering::Relaxed) as f64 / secs
        } else {
            0.0
        }
    }
}

/// Worker-side ends of the queue
#[derive(Clone)]
pub struct WorkerChannels {
    /// Jobs to run
    pub jobs: Receiver<TransferJob>,
    /// Where to report outcomes
    pub results: Sender<TransferOutcome>,
    /// Shared counters
    pub stats: Arc<TransferStats>,
}

/// Dispatcher side of a bounded job queue with a result channel
pub struct TransferQueue {
    job_sender: Sender<TransferJob>,
    result_receiver: Receiver<TransferOutcome>,
    stats: Arc<TransferStats>,
    next_id: u64,
}

impl TransferQueue {
    /// Create a queue holding at most `capacity` pending jobs, along with
    /// the worker-side channels. Clone the channels once per worker and drop
    /// this one; the result stream ends when the last clone is gone.
    pub fn new(capacity: usize) -> (Self, WorkerChannels) {
        let (job_sender, job_receiver) = bounded(capacity.max(1));
        let (result_sender, result_receiver) = unbounded();
        let stats = Arc::new(TransferStats::default());

        let channels = WorkerChannels {
            jobs: job_receiver,
            results: result_sender,
            stats: Arc::clone(&stats),
        };

        let queue = Self {
            job_sender,
            result_receiver,
            stats,
            next_id: 0,
        };

        (queue, channels)
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<TransferStats> {
        Arc::clone(&self.stats)
    }

    /// Queue an entry, blocking while the queue is full
    pub fn submit(&mut self, entry: DirEntry) -> Result<u64> {
        let id = self.next_id;

        self.job_sender
            .send(TransferJob { id, entry })
            .map_err(|_| XcpError::WorkerPool("all transfer workers have exited".to_string()))?;
        self.next_id += 1;
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);

        Ok(id)
    }

    /// Outcomes already reported, without blocking
    pub fn ready_outcomes(&self) -> TryIter<'_, TransferOutcome> {
        self.result_receiver.try_iter()
    }

    /// Number of jobs waiting for a worker
    pub fn pending(&self) -> usize {
        self.job_sender.len()
    }

    /// Stop accepting jobs. The returned receiver yields the remaining
    /// outcomes and disconnects once every worker has exited.
    pub fn close(self) -> Receiver<TransferOutcome> {
        self.result_receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn entry(name: &str, size: u64) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            size,
            meta: None,
        }
    }

    #[test]
    fn test_submit_blocks_at_capacity() {
        let (mut queue, channels) = TransferQueue::new(2);
        queue.submit(entry("a", 1)).unwrap();
        queue.submit(entry("b", 1)).unwrap();
        assert_eq!(queue.pending(), 2);

        let consumer = thread::spawn(move || {
            let job = channels.jobs.recv().unwrap();
            assert_eq!(job.entry.name, "a");
            // Keep the receiving side connected
            channels
        });

        // Third submit only completes once the consumer took a job
        assert_eq!(queue.submit(entry("c", 1)).unwrap(), 2);
        let _channels = consumer.join().unwrap();
        assert_eq!(queue.stats().dispatched.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_close_drains_and_disconnects() {
        let (mut queue, channels) = TransferQueue::new(4);
        let worker = thread::spawn(move || {
            for job in channels.jobs.iter() {
                channels.stats.start();
                let status = TransferStatus::Copied(job.entry.size);
                channels.stats.finish(&status);
                channels
                    .results
                    .send(TransferOutcome {
                        job_id: job.id,
                        name: job.entry.name,
                        status,
                        attempts: 1,
                        duration: Duration::ZERO,
                    })
                    .unwrap();
            }
        });

        for i in 0..10 {
            queue.submit(entry(&format!("f{}", i), 10)).unwrap();
        }
        let stats = queue.stats();
        let results = queue.close();
        let outcomes: Vec<_> = results.iter().collect();
        worker.join().unwrap();

        assert_eq!(outcomes.len(), 10);
        assert_eq!(stats.bytes_copied.load(Ordering::Relaxed), 100);
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(stats.in_flight.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_submit_fails_without_workers() {
        let (mut queue, channels) = TransferQueue::new(1);
        drop(channels);
        assert!(matches!(
            queue.submit(entry("x", 1)),
            Err(XcpError::WorkerPool(_))
        ));
        assert_eq!(queue.stats().dispatched.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_stats_throughput() {
        let stats = TransferStats::default();
        stats.bytes_copied.store(1000, Ordering::Relaxed);
        assert_eq!(stats.throughput(Duration::from_secs(2)), 500.0);
        assert_eq!(stats.throughput(Duration::ZERO), 0.0);
    }
}
