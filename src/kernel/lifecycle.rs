//! Agent lifecycle records.
//!
//! One record per registered agent, owned exclusively by the kernel and
//! mutated only through `Kernel::update_lifecycle`. The pipeline describes
//! the transition it wants as a partial [`LifecycleUpdate`]; the kernel
//! merges it into the stored record and performs the agent calls the
//! merged flags ask for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, Priority};

/// Lifecycle flags and notification intent for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLifecycle {
    pub agent_id: AgentId,
    pub should_start: bool,
    pub should_stop: bool,
    pub should_pause: bool,
    pub should_resume: bool,
    pub needs_notification: bool,
    pub notification_priority: Priority,
    pub last_activity: DateTime<Utc>,
    pub reason: String,
}

impl AgentLifecycle {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            should_start: false,
            should_stop: false,
            should_pause: false,
            should_resume: false,
            needs_notification: false,
            notification_priority: Priority::Low,
            last_activity: Utc::now(),
            reason: String::new(),
        }
    }

    /// Merge a partial update. Setting a flag clears its opposite so the
    /// record never asks for both directions at once.
    pub fn apply(&mut self, update: &LifecycleUpdate) {
        if let Some(start) = update.should_start {
            self.should_start = start;
            if start {
                self.should_stop = false;
            }
        }
        if let Some(stop) = update.should_stop {
            self.should_stop = stop;
            if stop {
                self.should_start = false;
            }
        }
        if let Some(pause) = update.should_pause {
            self.should_pause = pause;
            if pause {
                self.should_resume = false;
            }
        }
        if let Some(resume) = update.should_resume {
            self.should_resume = resume;
            if resume {
                self.should_pause = false;
            }
        }
        if let Some(notify) = update.needs_notification {
            self.needs_notification = notify;
        }
        if let Some(priority) = update.notification_priority {
            self.notification_priority = priority;
        }
        if let Some(reason) = &update.reason {
            self.reason = reason.clone();
        }
        self.last_activity = Utc::now();
    }
}

/// Partial lifecycle mutation; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleUpdate {
    pub should_start: Option<bool>,
    pub should_stop: Option<bool>,
    pub should_pause: Option<bool>,
    pub should_resume: Option<bool>,
    pub needs_notification: Option<bool>,
    pub notification_priority: Option<Priority>,
    pub reason: Option<String>,
}

impl LifecycleUpdate {
    pub fn start() -> Self {
        Self {
            should_start: Some(true),
            ..Default::default()
        }
    }

    pub fn stop() -> Self {
        Self {
            should_stop: Some(true),
            ..Default::default()
        }
    }

    pub fn pause() -> Self {
        Self {
            should_pause: Some(true),
            ..Default::default()
        }
    }

    pub fn resume() -> Self {
        Self {
            should_resume: Some(true),
            ..Default::default()
        }
    }

    pub fn notify(priority: Priority) -> Self {
        Self {
            needs_notification: Some(true),
            notification_priority: Some(priority),
            ..Default::default()
        }
    }

    /// Suppress the pending notification without touching its priority.
    pub fn silence() -> Self {
        Self {
            needs_notification: Some(false),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Combine two partial updates, fields set on `other` winning.
    pub fn merge(mut self, other: LifecycleUpdate) -> Self {
        self.should_start = other.should_start.or(self.should_start);
        self.should_stop = other.should_stop.or(self.should_stop);
        self.should_pause = other.should_pause.or(self.should_pause);
        self.should_resume = other.should_resume.or(self.should_resume);
        self.needs_notification = other.needs_notification.or(self.needs_notification);
        self.notification_priority = other.notification_priority.or(self.notification_priority);
        self.reason = other.reason.or(self.reason);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.should_start.is_none()
            && self.should_stop.is_none()
            && self.should_pause.is_none()
            && self.should_resume.is_none()
            && self.needs_notification.is_none()
            && self.notification_priority.is_none()
            && self.reason.is_none()
    }
}
