// Optimistic send pipeline
//
// send() puts a pending copy in the store right away and hands the draft to
// a per-conversation worker. Workers persist drafts one at a time in call
// order, then confirm the pending entry in place or mark it failed. A worker
// exits once its queue is empty; the next send starts a new one.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{ChatError, Result};
use crate::models::{Attachment, ConversationId, CorrelationId, Message, MessageDraft, MessageStatus};
use crate::ports::PersistencePort;
use crate::store::{ConversationStore, StoreRegistry};
use crate::utils::lock;

struct SendJob {
    draft: MessageDraft,
    store: Arc<ConversationStore>,
}

/// Everything a worker needs to persist a draft.
#[derive(Clone)]
struct Delivery {
    persistence: Arc<dyn PersistencePort>,
    backoff: Backoff,
    attempts: u32,
    timeout: Duration,
}

impl Delivery {
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<SendJob>, retire: Retire) {
        loop {
            let job = match jobs.try_recv() {
                Ok(job) => job,
                Err(_) => {
                    // Re-check under the map lock so a concurrent enqueue
                    // either lands here or starts a fresh worker
                    let mut workers = lock(&retire.workers);
                    match jobs.try_recv() {
                        Ok(job) => job,
                        Err(_) => {
                            if workers
                                .get(&retire.conversation_id)
                                .map_or(false, |w| w.id == retire.worker_id)
                            {
                                workers.remove(&retire.conversation_id);
                            }
                            debug!("Send worker for {} idle, exiting", retire.conversation_id);
                            return;
                        }
                    }
                }
            };
            self.deliver(job).await;
        }
    }

    async fn deliver(&self, job: SendJob) {
        let correlation_id = job.draft.correlation_id.clone();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.timeout,
                self.persistence.persist_message(&job.draft),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ChatError::Timeout(self.timeout)),
            };

            match result {
                Ok(mut confirmed) => {
                    if confirmed.conversation_id != job.draft.conversation_id {
                        error!(
                            "Backend filed {} under {} instead of {}",
                            correlation_id, confirmed.conversation_id, job.draft.conversation_id
                        );
                        job.store.mark_failed(&correlation_id);
                        return;
                    }
                    confirmed.correlation_id = Some(correlation_id.clone());
                    confirmed.status = MessageStatus::Sent;
                    let id = confirmed.id.clone();
                    match job.store.append(confirmed) {
                        Ok(outcome) => info!("Message {} confirmed as {} ({:?})", correlation_id, id, outcome),
                        Err(e) => {
                            warn!("Could not apply confirmation for {}: {}", correlation_id, e);
                            job.store.mark_failed(&correlation_id);
                        }
                    }
                    return;
                }
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        "Send of {} failed (attempt {}/{}), retrying in {:?}: {}",
                        correlation_id, attempt, self.attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!("Send of {} failed after {} attempt(s): {}", correlation_id, attempt, e);
                    job.store.mark_failed(&correlation_id);
                    return;
                }
            }
        }
    }
}

struct Worker {
    id: u64,
    jobs: mpsc::UnboundedSender<SendJob>,
    task: JoinHandle<()>,
}

type WorkerMap = Arc<Mutex<HashMap<ConversationId, Worker>>>;

/// Lets an idle worker remove its own entry.
struct Retire {
    workers: WorkerMap,
    conversation_id: ConversationId,
    worker_id: u64,
}

pub struct OutboundQueue {
    stores: Arc<StoreRegistry>,
    clock: Arc<dyn Clock>,
    delivery: Delivery,
    workers: WorkerMap,
    next_worker: AtomicU64,
}

impl OutboundQueue {
    pub fn new(
        persistence: Arc<dyn PersistencePort>,
        stores: Arc<StoreRegistry>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        OutboundQueue {
            stores,
            clock,
            delivery: Delivery {
                persistence,
                backoff: Backoff::from_config(config),
                attempts: config.send_attempts.max(1),
                timeout: config.send_timeout(),
            },
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_worker: AtomicU64::new(1),
        }
    }

    /// Queue a message and show it as pending immediately.
    ///
    /// Bad input is rejected here and never queued. Delivery failures are
    /// reported through the store (the entry turns `Failed`), not as errors.
    pub fn send(
        &self,
        conversation_id: &str,
        sender_id: &str,
        body: &str,
        attachment: Option<Attachment>,
    ) -> Result<CorrelationId> {
        if sender_id.is_empty() {
            return Err(ChatError::NotSignedIn);
        }
        validate(conversation_id, body, attachment.as_ref())?;

        let draft = MessageDraft {
            correlation_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            attachment,
        };

        let store = self.stores.get_or_create(conversation_id);
        store.append(Message::pending(&draft, self.clock.now()))?;
        debug!("Queued {} for {}", draft.correlation_id, conversation_id);

        let correlation_id = draft.correlation_id.clone();
        self.enqueue(SendJob { draft, store });
        Ok(correlation_id)
    }

    /// Re-send a failed message as a brand new pending entry.
    /// The failed entry stays where it is.
    pub fn retry(
        &self,
        conversation_id: &str,
        sender_id: &str,
        correlation_id: &str,
    ) -> Result<CorrelationId> {
        let failed = self
            .stores
            .get(conversation_id)
            .and_then(|store| store.find_by_correlation(correlation_id))
            .ok_or_else(|| {
                ChatError::Validation(format!("no message {} in {}", correlation_id, conversation_id))
            })?;
        if failed.status != MessageStatus::Failed {
            return Err(ChatError::Validation(format!(
                "message {} is {:?}, only failed messages can be retried",
                correlation_id, failed.status
            )));
        }
        self.send(conversation_id, sender_id, &failed.body, failed.attachment)
    }

    /// Stop all workers. Undelivered drafts stay pending in their stores.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = lock(&self.workers).drain().collect();
        for (conversation_id, worker) in drained {
            debug!("Stopping send worker for {}", conversation_id);
            worker.task.abort();
        }
    }

    pub fn active_workers(&self) -> usize {
        lock(&self.workers).len()
    }

    fn enqueue(&self, job: SendJob) {
        let mut workers = lock(&self.workers);
        let conversation_id = job.draft.conversation_id.clone();

        let job = match workers.get(&conversation_id) {
            Some(worker) => match worker.jobs.send(job) {
                Ok(()) => return,
                // Worker is gone (aborted or panicked); start a fresh one
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // Queued before the task can look; it cannot retire while we hold the lock
        if let Err(mpsc::error::SendError(job)) = tx.send(job) {
            job.store.mark_failed(&job.draft.correlation_id);
            return;
        }
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let retire = Retire {
            workers: self.workers.clone(),
            conversation_id: conversation_id.clone(),
            worker_id: id,
        };
        let task = tokio::spawn(self.delivery.clone().run(rx, retire));
        workers.insert(conversation_id, Worker { id, jobs: tx, task });
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn validate(conversation_id: &str, body: &str, attachment: Option<&Attachment>) -> Result<()> {
    if conversation_id.trim().is_empty() {
        return Err(ChatError::Validation("empty conversation id".to_string()));
    }
    if let Some(attachment) = attachment {
        if attachment.url.trim().is_empty() {
            return Err(ChatError::Validation("attachment without url".to_string()));
        }
    } else if body.trim().is_empty() {
        return Err(ChatError::Validation("message body is empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::MemoryBackend;

    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_workers_exit_when_queue_drains() {
        let backend = Arc::new(MemoryBackend::default());
        let stores = Arc::new(StoreRegistry::new(100));
        let queue = OutboundQueue::new(
            backend.clone(),
            stores.clone(),
            Arc::new(SystemClock),
            &SyncConfig::default(),
        );

        backend.pause_persistence();
        queue.send("g1", "mom", "one", None).unwrap();
        queue.send("g1", "mom", "two", None).unwrap();
        queue.send("g2", "mom", "three", None).unwrap();
        assert_eq!(queue.active_workers(), 2);

        backend.resume_persistence();
        assert!(wait_for(|| queue.active_workers() == 0).await);
        assert_eq!(backend.messages("g1").len(), 2);
        assert_eq!(backend.messages("g2").len(), 1);

        // A later send starts a fresh worker
        queue.send("g1", "mom", "four", None).unwrap();
        assert!(wait_for(|| backend.messages("g1").len() == 3).await);
        assert!(wait_for(|| queue.active_workers() == 0).await);
        let bodies: Vec<_> = backend.messages("g1").into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["one", "two", "four"]);
    }

    #[test]
    fn test_validation_rules() {
        assert!(validate("g1", "hi", None).is_ok());
        assert!(matches!(validate("g1", "   ", None), Err(ChatError::Validation(_))));
        assert!(matches!(validate("", "hi", None), Err(ChatError::Validation(_))));

        let photo = Attachment {
            url: "https://cdn/x.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            file_name: "x.jpg".to_string(),
        };
        assert!(validate("g1", "", Some(&photo)).is_ok());

        let broken = Attachment {
            url: String::new(),
            ..photo
        };
        assert!(matches!(validate("g1", "caption", Some(&broken)), Err(ChatError::Validation(_))));
    }
}
