//! Checkpoint trigger: decides when a partition consumer must commit
//! progress, after N messages or T elapsed since the last commit. All
//! consumers sharing a `(path, group)` must declare the same policy; the
//! startup check enumerates any mismatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::MessageBusError;
use crate::time::SharedClock;

use super::EndpointDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    /// Commit after this many messages since the last commit.
    pub max_count: u32,
    /// Commit once this much time elapsed since the last commit.
    pub max_interval_ms: u64,
}

impl CheckpointPolicy {
    pub fn new(max_count: u32, max_interval: Duration) -> Self {
        Self {
            max_count,
            max_interval_ms: max_interval.as_millis() as u64,
        }
    }
}

impl fmt::Display for CheckpointPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{after: {} messages, every: {}ms}}",
            self.max_count, self.max_interval_ms
        )
    }
}

/// Counter plus wall-clock window. Driven by exactly one partition at a
/// time; the partition processor owns it.
pub struct CheckpointTrigger {
    policy: CheckpointPolicy,
    clock: SharedClock,
    count: u32,
    window_start_ms: u64,
}

impl CheckpointTrigger {
    pub fn new(policy: CheckpointPolicy, clock: SharedClock) -> Self {
        let window_start_ms = clock.now_ms();
        Self {
            policy,
            clock,
            count: 0,
            window_start_ms,
        }
    }

    /// Count one processed message. Returns true when a commit is due.
    pub fn increment(&mut self) -> bool {
        self.count += 1;
        self.count >= self.policy.max_count
            || self
                .clock
                .now_ms()
                .saturating_sub(self.window_start_ms)
                >= self.policy.max_interval_ms
    }

    /// Clear the counter and restart the window; called after each commit.
    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start_ms = self.clock.now_ms();
    }
}

/// Startup check: every subscriber sharing a `(path, group)` must declare
/// an identical checkpoint policy. Returns the policy per group for the
/// partition processors to use.
pub fn validate_checkpoint_consistency(
    endpoints: &[Arc<EndpointDescriptor>],
) -> Result<(), MessageBusError> {
    let mut observed: HashMap<(String, Option<String>), Vec<CheckpointPolicy>> = HashMap::new();

    for endpoint in endpoints {
        let key = (endpoint.path.clone(), endpoint.group.clone());
        let policies = observed.entry(key).or_default();
        for subscriber in &endpoint.subscribers {
            if let Some(policy) = subscriber.checkpoint
                && !policies.contains(&policy)
            {
                policies.push(policy);
            }
        }
    }

    for ((path, group), policies) in observed {
        if policies.len() > 1 {
            let rendered = policies
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(MessageBusError::configuration(format!(
                "checkpoint settings must be identical for all consumers on (path: '{}', group: {:?}); observed: {}",
                path, group, rendered
            )));
        }
    }
    Ok(())
}
