use std::fmt::{self, Display};

use tokio::sync::watch;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Read-only view of a component's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub component: String,
    pub status: HealthStatus,
    /// What made the component unhealthy.
    pub issue: Option<String>,
}

impl HealthReport {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            issue: None,
        }
    }

    pub fn unhealthy(component: impl Into<String>, issue: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            issue: Some(issue.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.issue {
            Some(issue) => write!(f, "{} is {:?}: {}", self.component, self.status, issue),
            None => write!(f, "{} is {:?}", self.component, self.status),
        }
    }
}

/// Owner side of a health signal. Health only ever moves from healthy to unhealthy.
pub(crate) struct HealthTracker {
    tx: watch::Sender<HealthReport>,
}

impl HealthTracker {
    pub fn new(component: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(HealthReport::healthy(component));
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthReport> {
        self.tx.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        self.tx.borrow().is_healthy()
    }

    /// Marks the component unhealthy. Returns false if it already was.
    pub fn mark_unhealthy(&self, issue: impl Into<String>) -> bool {
        let issue = issue.into();
        let changed = self.tx.send_if_modified(|report| {
            if !report.is_healthy() {
                return false;
            }
            report.status = HealthStatus::Unhealthy;
            report.issue = Some(issue.clone());
            true
        });

        if changed {
            error!("Health changed: {}", self.tx.borrow().clone());
        }
        changed
    }
}
