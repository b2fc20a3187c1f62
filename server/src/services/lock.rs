//! Element lock arbitration — cooperative exclusive edit reservations.
//!
//! DESIGN
//! ======
//! Locks are advisory: mutation handlers only consult them when one exists.
//! Grant versions are monotonic per element id and survive release, so a
//! re-grant after release continues the sequence instead of restarting at 1.

use std::collections::HashMap;

/// An exclusive edit reservation on one element id.
#[derive(Debug, Clone)]
pub struct ElementLock {
    pub holder: String,
    pub version: u64,
}

/// Outcome of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockDecision {
    Granted { version: u64 },
    Denied { locked_by: String },
}

/// Grant rule: free or self-held locks are (re-)granted with the next
/// version; a lock held by someone else is denied with the holder's id.
pub fn request(
    locks: &mut HashMap<String, ElementLock>,
    grant_versions: &mut HashMap<String, u64>,
    element_id: &str,
    user_id: &str,
) -> LockDecision {
    if let Some(existing) = locks.get(element_id) {
        if existing.holder != user_id {
            return LockDecision::Denied { locked_by: existing.holder.clone() };
        }
    }

    let version = grant_versions
        .entry(element_id.to_string())
        .and_modify(|v| *v += 1)
        .or_insert(1);
    locks.insert(element_id.to_string(), ElementLock { holder: user_id.to_string(), version: *version });
    LockDecision::Granted { version: *version }
}

/// Release a lock if the caller holds it. Returns whether a lock was removed.
pub fn release(locks: &mut HashMap<String, ElementLock>, element_id: &str, user_id: &str) -> bool {
    match locks.get(element_id) {
        Some(lock) if lock.holder == user_id => {
            locks.remove(element_id);
            true
        }
        _ => false,
    }
}

/// Release every lock held by a user (disconnect path). Returns the freed
/// element ids.
pub fn release_all(locks: &mut HashMap<String, ElementLock>, user_id: &str) -> Vec<String> {
    let freed: Vec<String> = locks
        .iter()
        .filter(|(_, lock)| lock.holder == user_id)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &freed {
        locks.remove(id);
    }
    freed
}

/// Whether an existing lock on this element belongs to someone else.
#[must_use]
pub fn held_by_other(locks: &HashMap<String, ElementLock>, element_id: &str, user_id: &str) -> bool {
    locks.get(element_id).is_some_and(|lock| lock.holder != user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_grant_starts_at_version_one() {
        let mut locks = HashMap::new();
        let mut versions = HashMap::new();
        let decision = request(&mut locks, &mut versions, "b1", "u1");
        assert_eq!(decision, LockDecision::Granted { version: 1 });
        assert_eq!(locks.get("b1").unwrap().holder, "u1");
    }

    #[test]
    fn regrant_by_holder_increments_version() {
        let mut locks = HashMap::new();
        let mut versions = HashMap::new();
        request(&mut locks, &mut versions, "b1", "u1");
        let decision = request(&mut locks, &mut versions, "b1", "u1");
        assert_eq!(decision, LockDecision::Granted { version: 2 });
    }

    #[test]
    fn contended_request_is_denied_with_holder() {
        let mut locks = HashMap::new();
        let mut versions = HashMap::new();
        request(&mut locks, &mut versions, "b1", "u1");
        let decision = request(&mut locks, &mut versions, "b1", "u2");
        assert_eq!(decision, LockDecision::Denied { locked_by: "u1".into() });
    }

    #[test]
    fn version_continues_after_release() {
        let mut locks = HashMap::new();
        let mut versions = HashMap::new();
        request(&mut locks, &mut versions, "b1", "u1");
        assert!(release(&mut locks, "b1", "u1"));

        let decision = request(&mut locks, &mut versions, "b1", "u2");
        assert_eq!(decision, LockDecision::Granted { version: 2 });
    }

    #[test]
    fn release_by_non_holder_is_refused() {
        let mut locks = HashMap::new();
        let mut versions = HashMap::new();
        request(&mut locks, &mut versions, "b1", "u1");
        assert!(!release(&mut locks, "b1", "u2"));
        assert!(locks.contains_key("b1"));
        assert!(!release(&mut locks, "missing", "u1"));
    }

    #[test]
    fn release_all_frees_only_the_users_locks() {
        let mut locks = HashMap::new();
        let mut versions = HashMap::new();
        request(&mut locks, &mut versions, "b1", "u1");
        request(&mut locks, &mut versions, "b2", "u1");
        request(&mut locks, &mut versions, "s1", "u2");

        let mut freed = release_all(&mut locks, "u1");
        freed.sort();
        assert_eq!(freed, vec!["b1".to_string(), "b2".to_string()]);
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key("s1"));
    }

    #[test]
    fn held_by_other_distinguishes_holders() {
        let mut locks = HashMap::new();
        let mut versions = HashMap::new();
        request(&mut locks, &mut versions, "b1", "u1");
        assert!(held_by_other(&locks, "b1", "u2"));
        assert!(!held_by_other(&locks, "b1", "u1"));
        assert!(!held_by_other(&locks, "free", "u2"));
    }
}
