//! Retry Scheduler
//!
//! Delayed re-enqueue of correlation keys. At most one timer exists per key;
//! a new request for a key that already has a timer keeps whichever deadline
//! is earlier.

use crate::observer::correlation::CorrelationKey;
use crate::reconciler::queue::WorkQueue;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, trace};

#[derive(Debug)]
enum Command {
    Schedule { key: CorrelationKey, delay: Duration },
    Cancel { key: CorrelationKey },
}

/// Handle used by workers to request retries
#[derive(Clone)]
pub struct RetryScheduler {
    commands: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
}

/// Timer loop owned by the controller
pub struct SchedulerLoop {
    commands: mpsc::UnboundedReceiver<Command>,
    queue: Arc<WorkQueue>,
    pending: Arc<AtomicUsize>,
}

impl RetryScheduler {
    pub fn new(queue: Arc<WorkQueue>) -> (Self, SchedulerLoop) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        (
            Self {
                commands,
                pending: pending.clone(),
            },
            SchedulerLoop {
                commands: receiver,
                queue,
                pending,
            },
        )
    }

    /// Re-enqueue `key` after `delay`
    pub fn schedule(&self, key: CorrelationKey, delay: Duration) {
        // Send only fails once the loop has stopped during shutdown
        let _ = self.commands.send(Command::Schedule { key, delay });
    }

    /// Drop any pending timer for `key`
    pub fn cancel(&self, key: CorrelationKey) {
        let _ = self.commands.send(Command::Cancel { key });
    }

    /// Keys currently waiting on a timer
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

impl SchedulerLoop {
    /// Run until cancelled or every handle is dropped
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut timers: DelayQueue<CorrelationKey> = DelayQueue::new();
        let mut index: HashMap<CorrelationKey, (Key, Instant)> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Schedule { key, delay }) => {
                        let deadline = Instant::now() + delay;
                        match index.get_mut(&key) {
                            Some((_, existing)) if *existing <= deadline => {
                                trace!(volume = %key, "earlier retry already scheduled");
                            }
                            Some((timer, existing)) => {
                                timers.reset_at(timer, deadline);
                                *existing = deadline;
                            }
                            None => {
                                let timer = timers.insert_at(key.clone(), deadline);
                                index.insert(key, (timer, deadline));
                            }
                        }
                    }
                    Some(Command::Cancel { key }) => {
                        if let Some((timer, _)) = index.remove(&key) {
                            timers.remove(&timer);
                        }
                    }
                    None => break,
                },
                Some(expired) = timers.next(), if !timers.is_empty() => {
                    let key = expired.into_inner();
                    index.remove(&key);
                    debug!(volume = %key, "retry timer fired");
                    self.queue.enqueue(key);
                }
            }
            self.pending.store(index.len(), Ordering::Relaxed);
        }

        debug!(pending = index.len(), "retry scheduler stopped");
    }
}
