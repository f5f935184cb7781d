// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tiered delayed retry for durable writes.
//!
//! Items whose save failed are tracked in retry generations. Each generation
//! has a failure ceiling and a delay; while it holds items, one timer is
//! armed for it. When the timer fires, every item of the generation is saved
//! again, newest first:
//!
//! - success: the item is done and removed;
//! - failure below the ceiling: the item stays for the next sweep;
//! - failure reaching the ceiling: the failures are reported and the item
//!   moves to the next generation with a fresh counter, or is dropped when
//!   this was the last generation.
//!
//! Generation membership and armed timers are guarded by one mutex; saves
//! are serialized by a separate async lock and never run while the
//! membership lock is held. A sweep result only applies to the payload it
//! saved: an item updated meanwhile stays pending for the next sweep.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::reporter::ErrorReporter;
use crate::sink::DurableStore;

/// Failure ceiling and sweep delay of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Failures after which an item leaves the generation. 0 means the first
    /// failure already does.
    pub retry_limit: u32,
    pub delay: Duration,
}

impl GenerationConfig {
    pub const fn new(retry_limit: u32, delay: Duration) -> Self {
        Self { retry_limit, delay }
    }
}

/// Outcome of the current sweep for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    Pending,
    Succeeded,
    Promote,
}

#[derive(Debug, Clone)]
struct TrackedObject {
    id: String,
    data: Value,
    /// Bumped by every payload replacement.
    revision: u64,
    /// Errors collected in the current generation.
    failures: Vec<String>,
    processed: Processed,
}

impl TrackedObject {
    fn new(id: String, data: Value) -> Self {
        Self {
            id,
            data,
            revision: 0,
            failures: Vec::new(),
            processed: Processed::Pending,
        }
    }
}

#[derive(Debug)]
struct Generation {
    config: GenerationConfig,
    objects: Vec<TrackedObject>,
    timer: Option<CancellationToken>,
}

/// A tracked item as seen by [`RetryEngine::snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedSnapshot {
    pub id: String,
    pub failures: u32,
    pub data: Value,
}

/// One generation as seen by [`RetryEngine::snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSnapshot {
    pub config: GenerationConfig,
    pub timer_armed: bool,
    /// In insertion order.
    pub objects: Vec<TrackedSnapshot>,
}

struct EngineInner {
    generations: Mutex<Vec<Generation>>,
    store: Arc<dyn DurableStore>,
    reporter: ErrorReporter,
    save_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl EngineInner {
    fn generations(&self) -> MutexGuard<'_, Vec<Generation>> {
        self.generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Multi-generation retry scheduler; see the module docs.
#[derive(Clone)]
pub struct RetryEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine")
            .field("generations", &self.inner.generations().len())
            .field("stopped", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RetryEngine {
    /// 10 retries every 30 minutes, then 10 every 3 hours, then one last
    /// attempt after 24 hours.
    pub fn default_generations() -> Vec<GenerationConfig> {
        vec![
            GenerationConfig::new(10, Duration::from_secs(30 * 60)),
            GenerationConfig::new(10, Duration::from_secs(3 * 60 * 60)),
            GenerationConfig::new(0, Duration::from_secs(24 * 60 * 60)),
        ]
    }

    /// Generations must be non-empty with strictly increasing delays.
    pub fn new(
        generations: Vec<GenerationConfig>,
        store: Arc<dyn DurableStore>,
        reporter: ErrorReporter,
    ) -> Result<Self> {
        if generations.is_empty() {
            return Err(RuntimeError::Setup(
                "at least one retry generation is required".to_string(),
            ));
        }
        if generations.windows(2).any(|pair| pair[1].delay <= pair[0].delay) {
            return Err(RuntimeError::Setup(
                "retry generation delays must strictly increase".to_string(),
            ));
        }

        let generations = generations
            .into_iter()
            .map(|config| Generation {
                config,
                objects: Vec::new(),
                timer: None,
            })
            .collect();

        Ok(Self {
            inner: Arc::new(EngineInner {
                generations: Mutex::new(generations),
                store,
                reporter,
                save_lock: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Replaces the payload of an already tracked item (its counter stays)
    /// or starts tracking it in the first generation.
    ///
    /// Returns whether the item was already tracked.
    pub fn update(&self, id: &str, data: Value) -> bool {
        let mut generations = self.inner.generations();
        for generation in generations.iter_mut() {
            if let Some(object) = generation.objects.iter_mut().find(|o| o.id == id) {
                object.data = data;
                object.revision += 1;
                return true;
            }
        }
        generations[0]
            .objects
            .push(TrackedObject::new(id.to_string(), data));
        false
    }

    /// Stops tracking `id`. Returns whether it was tracked.
    pub fn mark_processed(&self, id: &str) -> bool {
        let mut generations = self.inner.generations();
        for generation in generations.iter_mut() {
            if let Some(pos) = generation.objects.iter().position(|o| o.id == id) {
                generation.objects.remove(pos);
                return true;
            }
        }
        false
    }

    /// Saves a copy of `data` through the store, one save at a time.
    pub async fn save(&self, id: &str, data: &Value) -> anyhow::Result<()> {
        save_serialized(&self.inner, id, data).await
    }

    /// Arms a timer for every generation that holds items and has none yet.
    pub fn check_errors(&self) {
        arm_timers(&self.inner);
    }

    /// Cancels every armed timer and keeps new ones from being armed.
    /// Safe to call repeatedly and while a sweep is running.
    pub fn stop(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        for generation in self.inner.generations().iter_mut() {
            generation.timer = None;
        }
        info!("Retry timers stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Generation index and failure count of `id`, if tracked.
    pub fn locate(&self, id: &str) -> Option<(usize, u32)> {
        let generations = self.inner.generations();
        generations.iter().enumerate().find_map(|(index, generation)| {
            generation
                .objects
                .iter()
                .find(|o| o.id == id)
                .map(|o| (index, o.failures.len() as u32))
        })
    }

    pub fn tracked(&self) -> usize {
        self.inner
            .generations()
            .iter()
            .map(|generation| generation.objects.len())
            .sum()
    }

    pub fn snapshot(&self) -> Vec<GenerationSnapshot> {
        self.inner
            .generations()
            .iter()
            .map(|generation| GenerationSnapshot {
                config: generation.config,
                timer_armed: generation.timer.is_some(),
                objects: generation
                    .objects
                    .iter()
                    .map(|o| TrackedSnapshot {
                        id: o.id.clone(),
                        failures: o.failures.len() as u32,
                        data: o.data.clone(),
                    })
                    .collect(),
            })
            .collect()
    }
}

async fn save_serialized(inner: &EngineInner, id: &str, data: &Value) -> anyhow::Result<()> {
    let _guard = inner.save_lock.lock().await;
    let payload = data.clone();
    match inner.store.save(&payload).await {
        Ok(()) => {
            info!(data_id = id, "Data saved");
            Ok(())
        }
        Err(e) => {
            warn!(data_id = id, error = %format!("{e:#}"), "Saving failed");
            Err(e)
        }
    }
}

fn arm_timers(inner: &Arc<EngineInner>) {
    if inner.cancel.is_cancelled() {
        return;
    }
    let mut generations = inner.generations();
    for (index, generation) in generations.iter_mut().enumerate() {
        if generation.timer.is_some() || generation.objects.is_empty() {
            continue;
        }
        let token = inner.cancel.child_token();
        generation.timer = Some(token.clone());
        let delay = generation.config.delay;
        debug!(
            generation = index,
            delay_secs = delay.as_secs(),
            objects = generation.objects.len(),
            "Retry timer armed"
        );

        let engine = inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => sweep(engine, index, token).await,
            }
        });
    }
}

fn exhausted_report(object: &TrackedObject, last: bool) -> (String, String) {
    let failures = object.failures.len();
    let errors = object.failures.join("\n");
    let text = if last {
        format!(
            "Giving up on {} after {failures} failed attempts in the last retry generation:\n{errors}",
            object.id
        )
    } else {
        format!(
            "Error occurred {failures} times in saving {}:\n{errors}",
            object.id
        )
    };
    (text, object.data.to_string())
}

async fn sweep(inner: Arc<EngineInner>, index: usize, token: CancellationToken) {
    let batch: Vec<(String, Value, u64)> = {
        let generations = inner.generations();
        match generations.get(index) {
            Some(generation) => generation
                .objects
                .iter()
                .rev()
                .map(|o| (o.id.clone(), o.data.clone(), o.revision))
                .collect(),
            None => Vec::new(),
        }
    };
    info!(generation = index, objects = batch.len(), "Retrying failed saves");

    let mut outcomes = Vec::with_capacity(batch.len());
    for (id, data, revision) in batch {
        if token.is_cancelled() {
            break;
        }
        let result = save_serialized(&inner, &id, &data).await;
        outcomes.push((id, revision, result.err()));
    }

    let mut reports = Vec::new();
    {
        let mut generations = inner.generations();
        let last = index + 1 >= generations.len();
        let generation = &mut generations[index];
        let limit = generation.config.retry_limit as usize;

        for (id, revision, error) in outcomes {
            // Items marked processed during the sweep are gone already.
            let Some(object) = generation.objects.iter_mut().find(|o| o.id == id) else {
                continue;
            };
            if object.revision != revision {
                debug!(data_id = %id, "Payload replaced during the retry, keeping it pending");
                continue;
            }
            match error {
                None => object.processed = Processed::Succeeded,
                Some(err) => {
                    object.failures.push(format!("{err:#}"));
                    if object.failures.len() >= limit {
                        object.processed = Processed::Promote;
                        reports.push(exhausted_report(object, last));
                    }
                }
            }
        }

        let mut promoted = Vec::new();
        for object in std::mem::take(&mut generation.objects) {
            match object.processed {
                Processed::Pending => generation.objects.push(object),
                Processed::Succeeded => {}
                Processed::Promote => promoted.push(object),
            }
        }
        generation.timer = None;

        if last {
            for object in &promoted {
                warn!(data_id = %object.id, "Dropping item after the last retry generation");
            }
        } else {
            let next = &mut generations[index + 1];
            for mut object in promoted {
                debug!(data_id = %object.id, generation = index + 1, "Item promoted");
                object.failures.clear();
                object.processed = Processed::Pending;
                next.objects.push(object);
            }
        }
    }

    for (text, cause) in reports {
        inner.reporter.report(text, Some(&cause)).await;
    }
    arm_timers(&inner);
}
