//! Timer scheduler for timer nodes
//!
//! Each pending timer is a one-shot job in tokio-cron-scheduler. The
//! `pending` map owns the (instance, node) → job uuid relation: a job only
//! runs its callback if it is still the registered job for its key, so a
//! timer that was canceled or replaced can never re-enter the engine even if
//! its job was already in flight.

use anyhow::Result;
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Future run when a timer fires
pub type TimerTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Callback producing the fire future
pub type TimerCallback = Arc<dyn Fn() -> TimerTask + Send + Sync>;

/// Identity of a pending timer: at most one per (instance, node)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub instance_id: String,
    pub node_id: String,
}

impl TimerKey {
    pub fn new(instance_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            node_id: node_id.into(),
        }
    }
}

impl std::fmt::Display for TimerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.instance_id, self.node_id)
    }
}

pub struct TimerScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    pending: Arc<RwLock<HashMap<TimerKey, Uuid>>>,
}

impl TimerScheduler {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            pending: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let scheduler = self.scheduler.read().await;
        scheduler.start().await?;
        tracing::info!("⏰ Timer scheduler started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.pending.write().await.clear();
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await?;
        tracing::info!("⏹️ Timer scheduler stopped");
        Ok(())
    }

    /// Schedule `on_fire` after `delay`, replacing any timer already pending
    /// for the same key
    pub async fn schedule(&self, key: TimerKey, delay: Duration, on_fire: TimerCallback) -> Result<()> {
        self.cancel(&key).await;

        let pending = Arc::clone(&self.pending);
        let job_key = key.clone();
        let job = Job::new_one_shot_async(delay, move |job_id, _l| {
            let pending = Arc::clone(&pending);
            let key = job_key.clone();
            let on_fire = Arc::clone(&on_fire);

            Box::pin(async move {
                let still_registered = {
                    let mut pending = pending.write().await;
                    if pending.get(&key) == Some(&job_id) {
                        pending.remove(&key);
                        true
                    } else {
                        false
                    }
                };

                if still_registered {
                    tracing::debug!("🔔 Timer fired: {}", key);
                    on_fire().await;
                } else {
                    tracing::debug!("⏭️ Ignoring stale timer: {}", key);
                }
            })
        })?;

        let job_id = job.guid();
        // Register before the job can possibly run
        self.pending.write().await.insert(key.clone(), job_id);

        let added = {
            let scheduler = self.scheduler.read().await;
            scheduler.add(job).await
        };
        if let Err(e) = added {
            self.pending.write().await.remove(&key);
            return Err(e.into());
        }

        tracing::debug!("⏰ Timer scheduled: {} in {:?}", key, delay);
        Ok(())
    }

    /// Cancel the timer for one key; returns whether one was pending
    pub async fn cancel(&self, key: &TimerKey) -> bool {
        let job_id = self.pending.write().await.remove(key);
        match job_id {
            Some(job_id) => {
                self.remove_job(key, job_id).await;
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer of an instance; returns how many were pending
    pub async fn cancel_instance(&self, instance_id: &str) -> usize {
        let removed: Vec<(TimerKey, Uuid)> = {
            let mut pending = self.pending.write().await;
            let keys: Vec<TimerKey> = pending
                .keys()
                .filter(|key| key.instance_id == instance_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|job_id| (key, job_id)))
                .collect()
        };

        for (key, job_id) in &removed {
            self.remove_job(key, *job_id).await;
        }
        removed.len()
    }

    pub async fn is_pending(&self, key: &TimerKey) -> bool {
        self.pending.read().await.contains_key(key)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    async fn remove_job(&self, key: &TimerKey, job_id: Uuid) {
        let scheduler = self.scheduler.read().await;
        if let Err(e) = scheduler.remove(&job_id).await {
            tracing::warn!("⚠️ Failed to remove timer job {} from scheduler: {}", key, e);
        } else {
            tracing::debug!("🛑 Timer canceled: {}", key);
        }
    }
}
