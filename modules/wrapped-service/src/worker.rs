//! Waitlist worker pool.
//!
//! At most one run is active per process: the trigger compare-and-sets
//! Idle -> Running, recovers stuck jobs, launches a fixed set of workers per
//! mode, and flips back to Idle once every worker has drained its queue.
//! Each worker claims one job at a time, scrapes it, persists the outcome,
//! and notifies the user over a direct message.

use crate::config::Config;
use crate::db::Db;
use crate::scraper;
use crate::slack_api::{SlackApi, SlackApiError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use wrapped_types::{Job, JobMode, WrappedStats};

#[repr(u8)]
enum RunState {
    Idle = 0,
    Running = 1,
}

pub struct WorkerPool {
    db: Arc<Db>,
    api: Arc<SlackApi>,
    cfg: Config,
    state: AtomicU8,
    /// Serializes `claim_next` across workers: the claim is a read-then-
    /// write against a store with no native atomic dequeue.
    claim_lock: Mutex<()>,
}

impl WorkerPool {
    pub fn new(db: Arc<Db>, api: Arc<SlackApi>, cfg: Config) -> Arc<Self> {
        Arc::new(Self {
            db,
            api,
            cfg,
            state: AtomicU8::new(RunState::Idle as u8),
            claim_lock: Mutex::new(()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RunState::Running as u8
    }

    /// Start a processing run unless one is already active. Returns false
    /// when a run was in progress (the call is then a no-op).
    pub fn start_run(self: &Arc<Self>) -> bool {
        if self
            .state
            .compare_exchange(
                RunState::Idle as u8,
                RunState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.run().await;
            pool.state.store(RunState::Idle as u8, Ordering::Release);
        });
        true
    }

    async fn run(&self) {
        match self.db.recover_stuck() {
            Ok(0) => {}
            Ok(n) => log::info!("[WORKER] Recovered {} stuck jobs", n),
            Err(e) => log::error!("[WORKER] Stuck-job recovery failed: {}", e),
        }

        let default_workers =
            (1..=self.cfg.workers_default).map(|i| self.worker_loop(i, JobMode::Default));
        let restricted_workers = (1..=self.cfg.workers_restricted)
            .map(|i| self.worker_loop(self.cfg.workers_default + i, JobMode::Restricted));

        futures_util::future::join_all(default_workers.chain(restricted_workers)).await;
        log::info!("[WORKER] All queues drained, run complete");
    }

    async fn worker_loop(&self, worker_id: usize, mode: JobMode) {
        log::info!("[WORKER] Worker {} ({}) started", worker_id, mode.as_str());
        loop {
            let claimed = {
                let _guard = self.claim_lock.lock().await;
                self.db.claim_next(Some(mode))
            };
            let job = match claimed {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    log::error!("[WORKER] Claim failed: {}", e);
                    break;
                }
            };

            log::info!(
                "[WORKER] Worker {} ({}) processing user {}",
                worker_id,
                mode.as_str(),
                job.user_id
            );

            match self.process_job(&job).await {
                Ok(stats) => {
                    if let Err(e) = self.db.complete(&job.user_id, Some(&stats)) {
                        log::error!("[WORKER] Failed to mark {} completed: {}", job.user_id, e);
                    }
                    if let Err(e) = self.db.update_global_stats(&job.user_id, stats.total_messages)
                    {
                        log::warn!(
                            "[WORKER] Global stats update failed for {}: {}",
                            job.user_id,
                            e
                        );
                    }
                    self.notify_ready(&job).await;
                }
                Err(e) if e.is_credential_fatal() => {
                    log::warn!(
                        "[WORKER] Credential for {} is invalid ({}), deleting job",
                        job.user_id,
                        e
                    );
                    if let Err(e) = self.db.remove_user(&job.user_id) {
                        log::error!("[WORKER] Failed to delete job for {}: {}", job.user_id, e);
                    }
                    self.notify_revoked(&job).await;
                }
                Err(e) => {
                    // Stays in processing; the next run's recover_stuck()
                    // puts it back in the queue.
                    log::error!("[WORKER] Processing failed for {}: {}", job.user_id, e);
                }
            }

            tokio::time::sleep(Duration::from_millis(self.cfg.job_delay_ms)).await;
        }
        log::info!(
            "[WORKER] Worker {} ({}) exiting, queue empty",
            worker_id,
            mode.as_str()
        );
    }

    async fn process_job(&self, job: &Job) -> Result<WrappedStats, SlackApiError> {
        let conversations = scraper::collect_conversation_stats(
            &self.api,
            &self.cfg,
            &job.platform_user_id,
            &job.credential,
            job.mode,
        )
        .await?;
        let global = scraper::aggregate_global_stats(
            &self.api,
            &self.cfg,
            &job.platform_user_id,
            &job.credential,
            job.mode,
        )
        .await?;

        Ok(WrappedStats {
            top_channels: conversations.top_channels,
            top_dms: conversations.top_dms,
            total_messages: global.total_messages,
            confessions_messages: global.confessions_messages,
            meta_messages: global.meta_messages,
            prox_messages: global.prox_messages,
        })
    }

    /// Success DM, best-effort via the bot pool (user token fallback).
    async fn notify_ready(&self, job: &Job) {
        let token = self
            .api
            .pool()
            .first()
            .map(str::to_string)
            .unwrap_or_else(|| job.credential.clone());
        if token.is_empty() {
            return;
        }

        let channel = match self.api.open_dm(&token, &job.platform_user_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                log::error!("[WORKER] Could not open DM for {}", job.platform_user_id);
                return;
            }
            Err(e) => {
                log::error!("[WORKER] Could not open DM for {}: {}", job.platform_user_id, e);
                return;
            }
        };

        let text = format!(
            "🎉 Your {} Wrapped is ready!\n\nVisit {} to see it!",
            self.cfg.wrapped_year, self.cfg.site_url
        );
        if let Err(e) = self.api.post_message(&token, &channel, &text).await {
            log::error!(
                "[WORKER] Failed to send ready DM to {}: {}",
                job.platform_user_id,
                e
            );
        }
    }

    /// Tell a user their job was deleted because the credential stopped
    /// working, and point at the restricted-mode alternative. Bot pool
    /// only; with no bot token there is no way to reach them.
    async fn notify_revoked(&self, job: &Job) {
        let Some(token) = self.api.pool().first() else {
            return;
        };

        let channel = match self.api.open_dm(token, &job.platform_user_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                log::error!("[WORKER] Could not open DM for {}", job.platform_user_id);
                return;
            }
            Err(e) => {
                log::error!("[WORKER] Could not open DM for {}: {}", job.platform_user_id, e);
                return;
            }
        };

        let text = format!(
            "Hi <@{}>, your waitlist item failed to process because the authorization \
             was revoked, so it has been deleted. If you still want your Wrapped, open \
             the site again to re-join the queue.\n\nWrapped never reads message content \
             and deletes tokens right after counting your messages. If you'd rather not \
             grant private-data access at all, {}/noprivates runs a version that only \
             touches public channels.",
            job.platform_user_id, self.cfg.site_url
        );
        if let Err(e) = self.api.post_message(token, &channel, &text).await {
            log::error!(
                "[WORKER] Failed to send revocation DM to {}: {}",
                job.platform_user_id,
                e
            );
        }
    }
}
