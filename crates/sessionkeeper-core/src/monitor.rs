//! Expiry timers for the live session.
//!
//! `SessionMonitor` keeps at most one schedule: a warning some lead time
//! before the credential expires and a terminal signal at expiry. Signals go
//! out over a channel to whoever owns the session; the monitor itself never
//! refreshes or tears anything down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::auth::{Credential, CredentialValidator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Armed,
    Warning,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSignal {
    Warning { arm_id: u64, seconds_remaining: i64 },
    Expired { arm_id: u64 },
}

impl MonitorSignal {
    pub fn arm_id(&self) -> u64 {
        match self {
            MonitorSignal::Warning { arm_id, .. } | MonitorSignal::Expired { arm_id } => *arm_id,
        }
    }
}

struct Schedule {
    state: MonitorState,
    arm_id: u64,
    task: Option<JoinHandle<()>>,
}

pub struct SessionMonitor {
    schedule: Arc<Mutex<Schedule>>,
    signals: mpsc::UnboundedSender<MonitorSignal>,
    validator: CredentialValidator,
    warning_lead_secs: u64,
}

impl SessionMonitor {
    pub fn new(
        validator: CredentialValidator,
        warning_lead_secs: u64,
        signals: mpsc::UnboundedSender<MonitorSignal>,
    ) -> Self {
        Self {
            schedule: Arc::new(Mutex::new(Schedule {
                state: MonitorState::Idle,
                arm_id: 0,
                task: None,
            })),
            signals,
            validator,
            warning_lead_secs,
        }
    }

    /// Replace any existing schedule with one aligned to `credential`'s expiry.
    ///
    /// Unreadable claims schedule an immediate terminal signal. Must be called
    /// from within a tokio runtime.
    pub fn arm(&self, credential: &Credential, now: i64) -> u64 {
        let remaining = self
            .validator
            .seconds_until_expiry(credential, now)
            .unwrap_or(0)
            .max(0) as u64;
        let warn_after = remaining.saturating_sub(self.warning_lead_secs);

        let mut schedule = lock(&self.schedule);
        if let Some(task) = schedule.task.take() {
            task.abort();
        }
        schedule.arm_id += 1;
        schedule.state = MonitorState::Armed;
        let arm_id = schedule.arm_id;

        let shared = Arc::clone(&self.schedule);
        let tx = self.signals.clone();
        schedule.task = Some(tokio::spawn(async move {
            if remaining > 0 {
                tokio::time::sleep(Duration::from_secs(warn_after)).await;
                if !advance(&shared, arm_id, MonitorState::Warning) {
                    return;
                }
                let _ = tx.send(MonitorSignal::Warning {
                    arm_id,
                    seconds_remaining: (remaining - warn_after) as i64,
                });
                tokio::time::sleep(Duration::from_secs(remaining - warn_after)).await;
            }
            if advance(&shared, arm_id, MonitorState::Expired) {
                let _ = tx.send(MonitorSignal::Expired { arm_id });
            }
        }));

        debug!(arm_id, remaining, warn_after, "Session monitor armed");
        arm_id
    }

    /// Cancel pending timers. Signals already sent for earlier arms become stale.
    pub fn disarm(&self) {
        let mut schedule = lock(&self.schedule);
        if let Some(task) = schedule.task.take() {
            task.abort();
        }
        schedule.arm_id += 1;
        schedule.state = MonitorState::Idle;
    }

    pub fn state(&self) -> MonitorState {
        lock(&self.schedule).state
    }

    /// Whether `arm_id` names the schedule currently in force.
    pub fn is_current(&self, arm_id: u64) -> bool {
        lock(&self.schedule).arm_id == arm_id
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.schedule).task.take() {
            task.abort();
        }
    }
}

fn lock(schedule: &Mutex<Schedule>) -> std::sync::MutexGuard<'_, Schedule> {
    schedule.lock().unwrap_or_else(|e| e.into_inner())
}

/// Move to `next` unless the schedule was replaced in the meantime.
fn advance(schedule: &Mutex<Schedule>, arm_id: u64, next: MonitorState) -> bool {
    let mut schedule = lock(schedule);
    if schedule.arm_id != arm_id {
        return false;
    }
    schedule.state = next;
    true
}
