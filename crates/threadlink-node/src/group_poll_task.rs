//! Closed-group polling -- one self-rescheduling loop per group.
//!
//! Each loop:
//!   1. Picks a random node from the group's swarm
//!   2. Fetches raw messages since the last cursor
//!   3. Decodes and enqueues accepted envelopes (bad payloads are skipped)
//!   4. Sleeps for an interval derived from the group's last activity
//!
//! Quiet groups back off linearly from the minimum to the maximum interval
//! over the idle limit. Stopping a group cancels its token; an in-flight
//! network call is not aborted but its result is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use threadlink_protocol::{decode_envelope, now_ms, GroupId, ERA_0};
use threadlink_storage::Storage;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::services::{SwarmClient, SwarmError};

/// Interval bounds for adaptive polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    pub min: Duration,
    pub max: Duration,
    /// Inactivity after which the interval saturates at `max`.
    pub idle_limit: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(ERA_0.poll_min_interval_secs),
            max: Duration::from_secs(ERA_0.poll_max_interval_secs),
            idle_limit: Duration::from_secs(ERA_0.poll_idle_limit_secs),
        }
    }
}

/// `min + (max - min) * clamp(idle, 0, limit) / limit`.
///
/// `None` means no activity was ever observed and yields `max`.
pub fn next_poll_interval(since_last_activity: Option<Duration>, timing: &PollTiming) -> Duration {
    let span = timing.max.saturating_sub(timing.min);
    let ratio = match since_last_activity {
        None => 1.0,
        Some(_) if timing.idle_limit.is_zero() => 1.0,
        Some(idle) => idle.min(timing.idle_limit).as_secs_f64() / timing.idle_limit.as_secs_f64(),
    };
    timing.min + span.mul_f64(ratio)
}

/// Snapshot of one group's polling state.
#[derive(Debug, Clone, Default)]
pub struct PollState {
    pub is_active: bool,
    pub last_scheduled_deadline: Option<Instant>,
    /// Newest message timestamp (ms) seen for the group.
    pub last_observed_activity: Option<i64>,
    /// Hash of the newest swarm message fetched.
    pub cursor: Option<String>,
    pub polls: u64,
}

struct PollEntry {
    state: PollState,
    cancel: CancellationToken,
    generation: u64,
}

struct SchedulerInner {
    swarm: Arc<dyn SwarmClient>,
    storage: Arc<dyn Storage>,
    timing: PollTiming,
    entries: Mutex<HashMap<GroupId, PollEntry>>,
    next_generation: AtomicU64,
}

/// Owns one polling loop per active group.
#[derive(Clone)]
pub struct GroupPollScheduler {
    inner: Arc<SchedulerInner>,
}

impl GroupPollScheduler {
    pub fn new(swarm: Arc<dyn SwarmClient>, storage: Arc<dyn Storage>, timing: PollTiming) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                swarm,
                storage,
                timing,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start polling `group_id`. Returns false if it is already polling.
    pub async fn start_polling(&self, group_id: &str) -> bool {
        let cancel = CancellationToken::new();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.inner.entries.lock().await;
            if entries.contains_key(group_id) {
                tracing::debug!(group = %group_id, "poll: already polling");
                return false;
            }
            entries.insert(
                group_id.to_string(),
                PollEntry {
                    state: PollState {
                        is_active: true,
                        ..Default::default()
                    },
                    cancel: cancel.clone(),
                    generation,
                },
            );
        }

        tracing::info!(group = %group_id, "poll: started");
        tokio::spawn(run_poll_loop(
            self.inner.clone(),
            group_id.to_string(),
            cancel,
            generation,
        ));
        true
    }

    /// Stop polling `group_id`. Returns false if it was not polling.
    pub async fn stop_polling(&self, group_id: &str) -> bool {
        let entry = self.inner.entries.lock().await.remove(group_id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(group = %group_id, polls = entry.state.polls, "poll: stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_polling(&self, group_id: &str) -> bool {
        self.inner.entries.lock().await.contains_key(group_id)
    }

    pub async fn poll_state(&self, group_id: &str) -> Option<PollState> {
        self.inner
            .entries
            .lock()
            .await
            .get(group_id)
            .map(|e| e.state.clone())
    }

    /// Start a loop for every group thread in storage. Returns how many
    /// loops were newly started.
    pub async fn start_all_from_storage(&self) -> threadlink_storage::Result<usize> {
        let groups = self.inner.storage.list_group_threads()?;
        let mut started = 0;
        for thread in groups {
            if self.start_polling(&thread.peer).await {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Stop every loop. Returns how many were running.
    pub async fn stop_all(&self) -> usize {
        let entries: Vec<(GroupId, PollEntry)> = self.inner.entries.lock().await.drain().collect();
        for (_, entry) in &entries {
            entry.cancel.cancel();
        }
        if !entries.is_empty() {
            tracing::info!(groups = entries.len(), "poll: all stopped");
        }
        entries.len()
    }
}

async fn run_poll_loop(inner: Arc<SchedulerInner>, group_id: GroupId, cancel: CancellationToken, generation: u64) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        inner.poll_once(&group_id, &cancel, generation).await;

        if cancel.is_cancelled() {
            break;
        }

        let delay = inner.next_delay(&group_id);
        let deadline = Instant::now() + delay;
        inner
            .update_state(&group_id, generation, |s| s.last_scheduled_deadline = Some(deadline))
            .await;
        tracing::trace!(group = %group_id, delay_ms = delay.as_millis() as u64, "poll: rescheduled");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
    tracing::debug!(group = %group_id, "poll: loop exited");
}

impl SchedulerInner {
    async fn poll_once(&self, group_id: &str, cancel: &CancellationToken, generation: u64) {
        let nodes = match self.swarm.get_swarm(group_id).await {
            Ok(nodes) if !nodes.is_empty() => nodes,
            Ok(_) | Err(SwarmError::InsufficientNodes) => {
                tracing::debug!(group = %group_id, "poll: no swarm nodes available");
                return;
            }
            Err(SwarmError::Canceled) => return,
            Err(e) => {
                tracing::warn!(group = %group_id, error = %e, "poll: swarm lookup failed");
                return;
            }
        };
        if cancel.is_cancelled() {
            return;
        }

        let index = rand::thread_rng().gen_range(0..nodes.len());
        let node = &nodes[index];
        let cursor = self
            .entries
            .lock()
            .await
            .get(group_id)
            .and_then(|e| e.state.cursor.clone());

        let batch = match self.swarm.get_raw_messages(node, group_id, cursor.as_deref()).await {
            Ok(batch) => batch,
            Err(SwarmError::Canceled) => return,
            Err(e) => {
                tracing::warn!(group = %group_id, node = %node, error = %e, "poll: fetch failed");
                return;
            }
        };
        if cancel.is_cancelled() {
            tracing::debug!(group = %group_id, "poll: stopped during fetch, discarding batch");
            return;
        }

        let mut accepted = 0usize;
        for raw in &batch.messages {
            let mut envelope = match decode_envelope(raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(group = %group_id, hash = %raw.hash, error = %e, "poll: skipping undecodable message");
                    continue;
                }
            };
            // Anything fetched from this group's swarm belongs to this group
            if let Some(claimed) = envelope.group_id.as_deref().filter(|g| *g != group_id) {
                tracing::warn!(group = %group_id, claimed = %claimed, hash = %raw.hash, "poll: envelope names another group, reattributing");
            }
            envelope.group_id = Some(group_id.to_string());
            match self.storage.enqueue_inbound(&envelope) {
                Ok(Some(_)) => accepted += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!(group = %group_id, error = %e, "poll: failed to enqueue"),
            }
        }

        let newest_cursor = batch
            .cursor
            .clone()
            .or_else(|| batch.messages.last().map(|m| m.hash.clone()));
        let activity = self.storage.group_last_message_at(group_id).ok().flatten();
        self.update_state(group_id, generation, |s| {
            s.polls += 1;
            if newest_cursor.is_some() {
                s.cursor = newest_cursor;
            }
            s.last_observed_activity = activity;
        })
        .await;

        if accepted > 0 {
            tracing::debug!(group = %group_id, node = %node, accepted, "poll: enqueued messages");
        }
    }

    fn next_delay(&self, group_id: &str) -> Duration {
        let last = match self.storage.group_last_message_at(group_id) {
            Ok(last) => last,
            Err(e) => {
                tracing::warn!(group = %group_id, error = %e, "poll: cannot read activity, backing off");
                None
            }
        };
        let idle = last.map(|ts| Duration::from_millis(now_ms().saturating_sub(ts).max(0) as u64));
        next_poll_interval(idle, &self.timing)
    }

    /// Apply `f` to the group's state if the entry still belongs to this loop.
    async fn update_state(&self, group_id: &str, generation: u64, f: impl FnOnce(&mut PollState)) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(group_id) {
            if entry.generation == generation {
                f(&mut entry.state);
            }
        }
    }
}
