//! Per-TiVo download queue and job table. Structural replacement for the
//! original's global dict-of-lists plus ad hoc thread spawn (§9): one FIFO
//! queue of URLs per TiVo IP, a job table keyed by URL that survives queue
//! drain for status reporting, and a worker-presence set enforcing "at most
//! one worker per TiVo IP at any time" (§3 invariant).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::jobs::DownloadJob;

#[derive(Clone, Default)]
pub(crate) struct ToGoEngine {
    jobs: Arc<RwLock<HashMap<String, DownloadJob>>>,
    queues: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    cancels: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl ToGoEngine {
    pub(crate) fn new() -> ToGoEngine {
        ToGoEngine::default()
    }

    /// Enqueues `job` under its `tivo_ip`. Returns `true` if no worker was
    /// already running for that IP, meaning the caller must spawn one.
    pub(crate) async fn enqueue(&self, job: DownloadJob) -> bool {
        let tivo_ip = job.tivo_ip.clone();
        let url = job.url.clone();
        self.jobs.write().await.insert(url.clone(), job);

        let mut queues = self.queues.lock().await;
        let needs_worker = !queues.contains_key(&tivo_ip);
        queues.entry(tivo_ip.clone()).or_default().push_back(url);
        if needs_worker {
            self.cancels
                .lock()
                .await
                .insert(tivo_ip, CancellationToken::new());
        }
        needs_worker
    }

    /// Reinserts `url` at the head of `tivo_ip`'s queue, for the
    /// retry-under-the-same-worker mechanic described in §4.5.
    pub(crate) async fn requeue_at_head(&self, tivo_ip: &str, url: String) {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get_mut(tivo_ip) {
            queue.push_front(url);
        }
    }

    pub(crate) async fn peek_front(&self, tivo_ip: &str) -> Option<String> {
        self.queues
            .lock()
            .await
            .get(tivo_ip)
            .and_then(|q| q.front().cloned())
    }

    /// Pops the completed head element; if the queue is now empty, removes
    /// the queue entry entirely and reports whether any queues remain (the
    /// worker uses this to decide whether sleep inhibition should release).
    pub(crate) async fn pop_front(&self, tivo_ip: &str) -> bool {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get_mut(tivo_ip) {
            queue.pop_front();
            if queue.is_empty() {
                queues.remove(tivo_ip);
                self.cancels.lock().await.remove(tivo_ip);
            }
        }
        queues.is_empty()
    }

    pub(crate) async fn cancel_token(&self, tivo_ip: &str) -> CancellationToken {
        let mut cancels = self.cancels.lock().await;
        cancels
            .entry(tivo_ip.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    pub(crate) async fn get(&self, url: &str) -> Option<DownloadJob> {
        self.jobs.read().await.get(url).cloned()
    }

    pub(crate) async fn update<F>(&self, url: &str, f: F)
    where
        F: FnOnce(&mut DownloadJob),
    {
        if let Some(job) = self.jobs.write().await.get_mut(url) {
            f(job);
        }
    }

    pub(crate) async fn all_jobs(&self) -> Vec<DownloadJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub(crate) async fn queue_lengths(&self) -> HashMap<String, usize> {
        self.queues
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect()
    }

    /// Cancels every running transfer and clears every queue, per the
    /// `UnqueueAll` control command (§4.5, §5).
    pub(crate) async fn unqueue_all(&self) {
        let mut queues = self.queues.lock().await;
        let mut cancels = self.cancels.lock().await;
        for token in cancels.values() {
            token.cancel();
        }
        cancels.clear();
        queues.clear();
        drop(queues);
        drop(cancels);

        let mut jobs = self.jobs.write().await;
        for job in jobs.values_mut() {
            job.running = false;
            job.queued = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TsErrorMode;

    fn job(url: &str, ip: &str) -> DownloadJob {
        DownloadJob::new(
            url.to_string(),
            ip.to_string(),
            false,
            false,
            false,
            3,
            TsErrorMode::Ignore,
        )
    }

    #[tokio::test]
    async fn test_first_enqueue_requests_worker_spawn() {
        let engine = ToGoEngine::new();
        assert!(engine.enqueue(job("u1", "10.0.0.1")).await);
        assert!(!engine.enqueue(job("u2", "10.0.0.1")).await);
    }

    #[tokio::test]
    async fn test_fifo_order_and_drain() {
        let engine = ToGoEngine::new();
        engine.enqueue(job("u1", "10.0.0.1")).await;
        engine.enqueue(job("u2", "10.0.0.1")).await;
        assert_eq!(engine.peek_front("10.0.0.1").await.as_deref(), Some("u1"));
        engine.pop_front("10.0.0.1").await;
        assert_eq!(engine.peek_front("10.0.0.1").await.as_deref(), Some("u2"));
        let queues_empty = engine.pop_front("10.0.0.1").await;
        assert!(queues_empty);
        assert!(engine.peek_front("10.0.0.1").await.is_none());
    }

    #[tokio::test]
    async fn test_requeue_at_head() {
        let engine = ToGoEngine::new();
        engine.enqueue(job("u1", "10.0.0.1")).await;
        engine.enqueue(job("u2", "10.0.0.1")).await;
        engine.pop_front("10.0.0.1").await; // u1 in flight removed
        engine.requeue_at_head("10.0.0.1", "u1".to_string()).await;
        assert_eq!(engine.peek_front("10.0.0.1").await.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_unqueue_all_clears_everything() {
        let engine = ToGoEngine::new();
        engine.enqueue(job("u1", "10.0.0.1")).await;
        engine.enqueue(job("u2", "10.0.0.2")).await;
        engine.update("u1", |j| j.running = true).await;
        engine.unqueue_all().await;
        assert!(engine.peek_front("10.0.0.1").await.is_none());
        assert!(engine.peek_front("10.0.0.2").await.is_none());
        for job in engine.all_jobs().await {
            assert!(!job.running);
        }
    }
}
