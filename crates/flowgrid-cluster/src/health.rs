//! Heartbeat health tracking.
//!
//! A node that keeps failing to refresh its registry record is about to be
//! declared dead by its peers while still running. `HeartbeatTracker`
//! counts consecutive failures and flips to `Degraded` once the configured
//! threshold is reached; one successful write restores `Healthy`.
//!
//! `Fenced` is terminal: a peer has already recorded this node as dead and
//! failed over its work, so the process must stop instead of resuming.

use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    /// Heartbeat writes are failing; peers may soon treat this node as dead.
    Degraded,
    /// This node has been declared dead by a failover pass.
    Fenced,
}

#[derive(Debug)]
pub struct HeartbeatTracker {
    status: NodeHealth,
    consecutive_failures: u32,
    failure_threshold: u32,
}

impl HeartbeatTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            status: NodeHealth::Healthy,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn record_success(&mut self) -> NodeHealth {
        if self.status == NodeHealth::Fenced {
            return self.status;
        }
        if self.status == NodeHealth::Degraded {
            debug!(failures = self.consecutive_failures, "heartbeat recovered");
        }
        self.consecutive_failures = 0;
        self.status = NodeHealth::Healthy;
        self.status
    }

    pub fn record_failure(&mut self) -> NodeHealth {
        if self.status == NodeHealth::Fenced {
            return self.status;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.failure_threshold {
            if self.status != NodeHealth::Degraded {
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.failure_threshold,
                    "heartbeat degraded"
                );
            }
            self.status = NodeHealth::Degraded;
        }
        self.status
    }

    pub fn fence(&mut self) -> NodeHealth {
        if self.status != NodeHealth::Fenced {
            error!("node has been declared dead by a peer");
        }
        self.status = NodeHealth::Fenced;
        self.status
    }

    pub fn status(&self) -> NodeHealth {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrades_at_threshold() {
        let mut tracker = HeartbeatTracker::new(3);
        assert_eq!(tracker.record_failure(), NodeHealth::Healthy);
        assert_eq!(tracker.record_failure(), NodeHealth::Healthy);
        assert_eq!(tracker.record_failure(), NodeHealth::Degraded);
        assert_eq!(tracker.consecutive_failures(), 3);
    }

    #[test]
    fn single_success_recovers() {
        let mut tracker = HeartbeatTracker::new(1);
        assert_eq!(tracker.record_failure(), NodeHealth::Degraded);
        assert_eq!(tracker.record_success(), NodeHealth::Healthy);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn success_resets_the_count() {
        let mut tracker = HeartbeatTracker::new(2);
        tracker.record_failure();
        tracker.record_success();
        assert_eq!(tracker.record_failure(), NodeHealth::Healthy);
    }

    #[test]
    fn fenced_is_terminal() {
        let mut tracker = HeartbeatTracker::new(3);
        tracker.fence();
        assert_eq!(tracker.record_success(), NodeHealth::Fenced);
        assert_eq!(tracker.record_failure(), NodeHealth::Fenced);
        assert_eq!(tracker.status(), NodeHealth::Fenced);
    }
}
