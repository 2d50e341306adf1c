//! Subscription data model

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event name emitted for every transfer mutation
pub const TRANSFER_UPDATE: &str = "transfer.update";

/// Subject matching every account
pub const ANY_SUBJECT: &str = "*";

/// Interest of `owner` in events about `subject`, delivered to `target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub owner: String,
    /// Exact event, a `prefix.*` wildcard or `*`
    pub event: String,
    /// Account of interest, or `*`
    pub subject: String,
    pub target: String,
    /// Tombstone: deleted subscriptions keep their id reserved
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_deleted: bool,
}

impl Subscription {
    pub fn new(owner: &str, event: &str, subject: &str, target: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_lowercase(),
            event: event.to_string(),
            subject: subject.to_lowercase(),
            target: target.to_string(),
            is_deleted: false,
        }
    }

    pub fn matches_event(&self, event: &str) -> bool {
        event_matches(&self.event, event)
    }
}

/// Does `pattern` (`*`, `transfer.*` or an exact name) cover `event`?
pub fn event_matches(pattern: &str, event: &str) -> bool {
    if pattern == "*" || pattern == event {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_patterns() {
        assert!(event_matches("*", TRANSFER_UPDATE));
        assert!(event_matches("transfer.*", TRANSFER_UPDATE));
        assert!(event_matches("transfer.update", TRANSFER_UPDATE));

        assert!(!event_matches("transfer.create", TRANSFER_UPDATE));
        assert!(!event_matches("account.*", TRANSFER_UPDATE));
        assert!(!event_matches("trans.*", TRANSFER_UPDATE));
        assert!(!event_matches("transfer.*", "transfer"));
    }

    #[test]
    fn test_new_canonicalizes_accounts() {
        let sub = Subscription::new("Alice", "transfer.*", "ALICE", "http://a.example/hook");
        assert_eq!(sub.owner, "alice");
        assert_eq!(sub.subject, "alice");
        assert!(sub.matches_event(TRANSFER_UPDATE));
        assert!(!sub.is_deleted);
    }
}
