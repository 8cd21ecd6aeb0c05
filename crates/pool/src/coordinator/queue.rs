//! FIFO request queue for jobs waiting on a free worker

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::driver::{JobPayload, JobResult};
use crate::error::JobError;

/// Identifier of a submitted job
pub type JobId = uuid::Uuid;

/// Channel the coordinator answers a job on
pub(crate) type JobReply = oneshot::Sender<Result<JobResult, JobError>>;

/// A job accepted by the coordinator but not yet finished
#[derive(Debug)]
pub(crate) struct PendingJob {
    pub id: JobId,
    pub payload: JobPayload,
    pub reply: JobReply,
}

impl PendingJob {
    /// Whether the submitter dropped its ticket
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    /// Deliver the job's single reply
    pub fn resolve(self, outcome: Result<JobResult, JobError>) {
        let _ = self.reply.send(outcome);
    }
}

/// A queued job
#[derive(Debug)]
pub(crate) struct QueueEntry {
    pub job: PendingJob,
    /// Diagnostics only; queue position decides service order
    pub enqueued_at: DateTime<Utc>,
}

/// FIFO buffer of jobs waiting for a worker
///
/// Entries go in at the tail and come out at the head. Nothing is reordered;
/// an entry only leaves early when its submitter cancels or the pool shuts
/// down.
#[derive(Debug)]
pub(crate) struct RequestQueue {
    entries: VecDeque<QueueEntry>,
    max_len: Option<usize>,
}

impl RequestQueue {
    pub fn new(max_len: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            max_len,
        }
    }

    /// Append a job at the tail, handing it back if the queue is full
    ///
    /// Abandoned entries do not count against the bound; they are purged
    /// once the raw length reaches it.
    pub fn push(&mut self, job: PendingJob) -> Result<usize, PendingJob> {
        if let Some(max) = self.max_len {
            if self.entries.len() >= max {
                self.entries.retain(|e| !e.job.is_abandoned());
            }
            if self.entries.len() >= max {
                return Err(job);
            }
        }
        self.entries.push_back(QueueEntry {
            job,
            enqueued_at: Utc::now(),
        });
        Ok(self.entries.len())
    }

    /// Take the oldest job whose submitter is still waiting
    pub fn pop_live(&mut self) -> Option<QueueEntry> {
        while let Some(entry) = self.entries.pop_front() {
            if !entry.job.is_abandoned() {
                return Some(entry);
            }
        }
        None
    }

    /// Remove a job by id, wherever it sits
    pub fn remove(&mut self, id: JobId) -> Option<QueueEntry> {
        let index = self.entries.iter().position(|e| e.job.id == id)?;
        self.entries.remove(index)
    }

    /// Number of queued jobs whose submitters are still waiting
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.job.is_abandoned())
            .count()
    }

    pub fn max_len(&self) -> Option<usize> {
        self.max_len
    }

    /// Empty the queue, oldest first
    pub fn drain(&mut self) -> impl Iterator<Item = QueueEntry> + '_ {
        self.entries.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn job(n: u64) -> (PendingJob, oneshot::Receiver<Result<JobResult, JobError>>) {
        let (tx, rx) = oneshot::channel();
        let job = PendingJob {
            id: Uuid::now_v7(),
            payload: json!({ "n": n }),
            reply: tx,
        };
        (job, rx)
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = RequestQueue::new(None);
        let mut receivers = Vec::new();
        for n in 1..=3 {
            let (j, rx) = job(n);
            receivers.push(rx);
            queue.push(j).unwrap();
        }

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_live())
            .map(|e| e.job.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_bounded_queue_rejects_overflow() {
        let mut queue = RequestQueue::new(Some(1));
        let (a, _rx_a) = job(1);
        let (b, _rx_b) = job(2);

        assert_eq!(queue.push(a).unwrap(), 1);
        let rejected = queue.push(b).unwrap_err();
        assert_eq!(rejected.payload["n"], 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_abandoned_entries_are_skipped() {
        let mut queue = RequestQueue::new(None);
        let (a, rx_a) = job(1);
        let (b, _rx_b) = job(2);
        queue.push(a).unwrap();
        queue.push(b).unwrap();

        drop(rx_a);
        assert_eq!(queue.len(), 1);

        let head = queue.pop_live().unwrap();
        assert_eq!(head.job.payload["n"], 2);
        assert!(queue.pop_live().is_none());
    }

    #[test]
    fn test_remove_by_id() {
        let mut queue = RequestQueue::new(None);
        let (a, _rx_a) = job(1);
        let (b, _rx_b) = job(2);
        let id_b = b.id;
        queue.push(a).unwrap();
        queue.push(b).unwrap();

        assert!(queue.remove(id_b).is_some());
        assert!(queue.remove(id_b).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_bounded_push_purges_abandoned_entries() {
        let mut queue = RequestQueue::new(Some(2));
        let (a, rx_a) = job(1);
        let (b, _rx_b) = job(2);
        let (c, _rx_c) = job(3);
        queue.push(a).unwrap();
        queue.push(b).unwrap();

        drop(rx_a);
        assert_eq!(queue.push(c).unwrap(), 2);
        assert_eq!(queue.entries.len(), 2);

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_live())
            .map(|e| e.job.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![2, 3]);
    }
}
