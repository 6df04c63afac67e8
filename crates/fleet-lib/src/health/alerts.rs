//! Bounded operator alert log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::models::NodeId;

/// Default number of alerts retained
pub const DEFAULT_ALERT_LOG_CAPACITY: usize = 100;

/// Alert severity levels, ordered by urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Error => write!(f, "error"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Well-known alert origins
pub mod components {
    pub const LIFECYCLE: &str = "Lifecycle";
    pub const PROVISIONER: &str = "Provisioner";
    pub const ALLOCATOR: &str = "Allocator";
}

/// An operator-visible event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Position in append order, starting at 1
    pub sequence: u64,
    pub severity: AlertSeverity,
    pub component: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only alert log; oldest entries are evicted past capacity
#[derive(Debug)]
pub struct AlertLog {
    entries: VecDeque<Alert>,
    capacity: usize,
    next_sequence: u64,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_sequence: 1,
        }
    }

    pub fn push(
        &mut self,
        severity: AlertSeverity,
        component: impl Into<String>,
        message: impl Into<String>,
        node_id: Option<NodeId>,
    ) -> Alert {
        let alert = Alert {
            sequence: self.next_sequence,
            severity,
            component: component.into(),
            message: message.into(),
            node_id,
            timestamp: Utc::now(),
        };
        self.next_sequence += 1;

        while self.entries.len() >= self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(alert.clone());
        alert
    }

    /// Newest first
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.entries.iter().take(limit).cloned().collect()
    }

    pub fn all(&self) -> Vec<Alert> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_first() {
        let mut log = AlertLog::new(10);
        log.push(AlertSeverity::Info, components::LIFECYCLE, "first", None);
        log.push(AlertSeverity::Warning, components::LIFECYCLE, "second", None);

        let alerts = log.all();
        assert_eq!(alerts[0].message, "second");
        assert_eq!(alerts[1].message, "first");
        assert!(alerts[0].sequence > alerts[1].sequence);
    }

    #[test]
    fn test_oldest_evicted() {
        let mut log = AlertLog::new(3);
        for i in 0..5 {
            log.push(AlertSeverity::Info, components::ALLOCATOR, format!("alert-{}", i), None);
        }

        assert_eq!(log.len(), 3);
        let messages: Vec<_> = log.all().into_iter().map(|a| a.message).collect();
        assert_eq!(messages, vec!["alert-4", "alert-3", "alert-2"]);
    }

    #[test]
    fn test_recent_limit() {
        let mut log = AlertLog::default();
        for _ in 0..10 {
            log.push(AlertSeverity::Info, components::LIFECYCLE, "x", None);
        }
        assert_eq!(log.recent(4).len(), 4);
        assert_eq!(log.len(), 10);
    }
}
