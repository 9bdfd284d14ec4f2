//! Synchronous and background scheduling of generation work.

use anyhow::{Context, Result};
use common::{Config, PersonaScope};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::generator::InterpretationGenerator;
use crate::models::{Interpretation, Persona, Tier};
use crate::storage::{interpretations, personas};

/// One unit of background work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub article_id: i64,
    pub persona_id: i64,
    pub tier: Tier,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub quick_retries: u32,
    pub detailed_retries: u32,
    /// First retry waits this long; each further retry doubles it
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            quick_retries: 2,
            detailed_retries: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn retries_for(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Quick => self.quick_retries,
            Tier::Detailed => self.detailed_retries,
        }
    }

    /// Wait before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut settings = Self::default();
        if let Some(d) = &config.dispatcher {
            if let Some(n) = d.workers.filter(|n| *n > 0) {
                settings.workers = n;
            }
            if let Some(n) = d.queue_capacity.filter(|n| *n > 0) {
                settings.queue_capacity = n;
            }
            if let Some(n) = d.quick_retries {
                settings.retry.quick_retries = n;
            }
            if let Some(n) = d.detailed_retries {
                settings.retry.detailed_retries = n;
            }
            if let Some(secs) = d.backoff_seconds {
                settings.retry.backoff = Duration::from_secs(secs);
            }
        }
        settings
    }
}

/// Cheap to clone. Background workers stop once every clone is dropped and the
/// queue has drained.
#[derive(Clone)]
pub struct Dispatcher {
    pool: SqlitePool,
    generator: Arc<InterpretationGenerator>,
    sender: mpsc::Sender<Job>,
}

impl Dispatcher {
    /// Create the queue and spawn `settings.workers` tasks draining it
    pub fn start(
        pool: SqlitePool,
        generator: Arc<InterpretationGenerator>,
        settings: DispatcherSettings,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..settings.workers.max(1))
            .map(|worker_id| {
                let receiver = receiver.clone();
                let generator = generator.clone();
                let retry = settings.retry.clone();
                tokio::spawn(async move {
                    run_queue_worker(worker_id, receiver, generator, retry).await;
                })
            })
            .collect();

        info!(workers = settings.workers.max(1), capacity = settings.queue_capacity, "dispatcher started");
        (
            Self {
                pool,
                generator,
                sender,
            },
            handles,
        )
    }

    /// Run inline and hand the result (or error) back to the caller
    pub async fn generate_now(&self, article_id: i64, persona_id: i64, tier: Tier) -> Result<Interpretation> {
        self.generator.generate(article_id, persona_id, tier).await
    }

    /// Queue a unit of work; waits for room when the queue is full
    pub async fn enqueue(&self, job: Job) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("dispatcher queue is closed"))?;
        debug!(article_id = job.article_id, persona_id = job.persona_id, tier = %job.tier, "job queued");
        Ok(())
    }

    /// One quick-take job per persona in `scope` that has no interpretation yet
    pub async fn fan_out(&self, article_id: i64, scope: PersonaScope) -> Result<usize> {
        let targets = personas::list_personas(&self.pool, scope)
            .await
            .context("failed to list personas for fan-out")?;
        self.fan_out_to(article_id, &targets).await
    }

    /// Same as `fan_out` for a caller-chosen subset of personas
    pub async fn fan_out_to(&self, article_id: i64, targets: &[Persona]) -> Result<usize> {
        let mut queued = 0;
        for persona in targets {
            if interpretations::find_interpretation(&self.pool, article_id, persona.id)
                .await?
                .is_some()
            {
                continue;
            }
            self.enqueue(Job {
                article_id,
                persona_id: persona.id,
                tier: Tier::Quick,
            })
            .await?;
            queued += 1;
        }

        info!(article_id, queued, personas = targets.len(), "fanned out article");
        Ok(queued)
    }
}

async fn run_queue_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    generator: Arc<InterpretationGenerator>,
    retry: RetryPolicy,
) {
    debug!(worker_id, "queue worker started");
    loop {
        let job = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };
        process_job(worker_id, &generator, &retry, job).await;
    }
    debug!(worker_id, "queue worker stopped");
}

/// Attempt, then retry with exponential backoff; an exhausted job is logged and dropped
async fn process_job(worker_id: usize, generator: &InterpretationGenerator, retry: &RetryPolicy, job: Job) {
    let retries = retry.retries_for(job.tier);

    for attempt in 0..=retries {
        if attempt > 0 {
            let delay = retry.delay(attempt);
            info!(worker_id, article_id = job.article_id, persona_id = job.persona_id, attempt, ?delay, "retrying job");
            tokio::time::sleep(delay).await;
        }

        match generator.generate(job.article_id, job.persona_id, job.tier).await {
            Ok(interpretation) => {
                debug!(worker_id, interpretation_id = interpretation.id, tier = %job.tier, "job done");
                return;
            }
            Err(e) if attempt < retries => {
                warn!(
                    worker_id,
                    article_id = job.article_id,
                    persona_id = job.persona_id,
                    tier = %job.tier,
                    error = %format!("{:#}", e),
                    "job failed"
                );
            }
            Err(e) => {
                error!(
                    worker_id,
                    article_id = job.article_id,
                    persona_id = job.persona_id,
                    tier = %job.tier,
                    attempts = retries + 1,
                    error = %format!("{:#}", e),
                    "job failed after retries, dropping it"
                );
            }
        }
    }
}
