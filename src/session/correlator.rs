use serde::Deserialize;

use super::message::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationPolicy {
    /// Only the most recently received request is answered.
    Latest,
    /// Every frame is answered in receipt order.
    Unconditional,
}

/// Per-connection staleness tracking.
///
/// `observe` runs the moment a message is received; `is_current` runs after
/// decoding and again right before the response goes out. A request without
/// an id is never stale.
#[derive(Debug)]
pub struct RequestCorrelator {
    policy: CorrelationPolicy,
    latest_seen: Option<RequestId>,
}

impl RequestCorrelator {
    pub fn new(policy: CorrelationPolicy) -> Self {
        Self {
            policy,
            latest_seen: None,
        }
    }

    pub fn latest_seen(&self) -> Option<&RequestId> {
        self.latest_seen.as_ref()
    }

    pub fn observe(&mut self, request_id: Option<&RequestId>) {
        if self.policy == CorrelationPolicy::Unconditional {
            return;
        }
        if let Some(id) = request_id {
            self.latest_seen = Some(id.clone());
        }
    }

    pub fn is_current(&self, request_id: Option<&RequestId>) -> bool {
        match (self.policy, request_id) {
            (CorrelationPolicy::Unconditional, _) | (_, None) => true,
            (CorrelationPolicy::Latest, Some(id)) => self.latest_seen.as_ref() == Some(id),
        }
    }
}
