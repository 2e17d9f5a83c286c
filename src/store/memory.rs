use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::{QueueError, Result};
use crate::scheduler::job::fields;
use crate::store::{ActiveChange, ClaimAttempt, JobStore};

#[derive(Debug, Default)]
struct State {
    records: HashMap<String, HashMap<String, String>>,
    queue: VecDeque<String>,
    active: HashSet<String>,
}

/// In-process job store.
///
/// Every operation runs under one lock, which gives the same per-operation atomicity
/// as the shared store. Suitable for a single process hosting both the queue client
/// and the workers, and for tests. `set_online(false)` simulates an unreachable store.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
    online: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            pushed: Notify::new(),
            online: AtomicBool::new(true),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::StoreUnavailable(
                "memory store is offline".to_string(),
            ))
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn enqueue(&self, job_id: &str, fields: &[(&str, String)]) -> Result<()> {
        self.check_online()?;
        {
            let mut state = self.state.lock().await;
            let record = state.records.entry(job_id.to_string()).or_default();
            for (name, value) in fields {
                record.insert(name.to_string(), value.clone());
            }
            state.queue.push_back(job_id.to_string());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn get_record(&self, job_id: &str) -> Result<HashMap<String, String>> {
        self.check_online()?;
        let state = self.state.lock().await;
        Ok(state.records.get(job_id).cloned().unwrap_or_default())
    }

    async fn transition(
        &self,
        job_id: &str,
        expected_status: &str,
        updates: &[(&str, String)],
        active: ActiveChange,
    ) -> Result<bool> {
        self.check_online()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(record) = state.records.get_mut(job_id) else {
            return Ok(false);
        };
        if record.get(fields::STATUS).map(String::as_str) != Some(expected_status) {
            return Ok(false);
        }
        for (name, value) in updates {
            record.insert(name.to_string(), value.clone());
        }

        match active {
            ActiveChange::Keep => {}
            ActiveChange::Add => {
                state.active.insert(job_id.to_string());
            }
            ActiveChange::Remove => {
                state.active.remove(job_id);
            }
        }
        Ok(true)
    }

    async fn claim_head(
        &self,
        expected_status: &str,
        updates: &[(&str, String)],
    ) -> Result<ClaimAttempt> {
        self.check_online()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(job_id) = state.queue.pop_front() else {
            return Ok(ClaimAttempt::Empty);
        };
        match state.records.get_mut(&job_id) {
            Some(record)
                if record.get(fields::STATUS).map(String::as_str) == Some(expected_status) =>
            {
                for (name, value) in updates {
                    record.insert(name.to_string(), value.clone());
                }
            }
            _ => return Ok(ClaimAttempt::Discarded(job_id)),
        }
        state.active.insert(job_id.clone());
        Ok(ClaimAttempt::Claimed(job_id))
    }

    async fn wait_for_work(&self, timeout: Duration) -> Result<()> {
        self.check_online()?;
        // Register before checking so a push between the check and the wait is seen.
        let pushed = self.pushed.notified();
        if !self.state.lock().await.queue.is_empty() {
            return Ok(());
        }
        let _ = tokio::time::timeout(timeout, pushed).await;
        Ok(())
    }

    async fn dequeue(
        &self,
        job_id: &str,
        expected_status: &str,
        updates: &[(&str, String)],
    ) -> Result<bool> {
        self.check_online()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(record) = state.records.get_mut(job_id) else {
            return Ok(false);
        };
        if record.get(fields::STATUS).map(String::as_str) != Some(expected_status) {
            return Ok(false);
        }
        let Some(idx) = state.queue.iter().position(|id| id == job_id) else {
            return Ok(false);
        };
        state.queue.remove(idx);
        for (name, value) in updates {
            record.insert(name.to_string(), value.clone());
        }
        Ok(true)
    }

    async fn queued_ids(&self) -> Result<Vec<String>> {
        self.check_online()?;
        Ok(self.state.lock().await.queue.iter().cloned().collect())
    }

    async fn active_ids(&self) -> Result<Vec<String>> {
        self.check_online()?;
        Ok(self.state.lock().await.active.iter().cloned().collect())
    }

    async fn remove_active(&self, job_id: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.state.lock().await.active.remove(job_id))
    }
}
