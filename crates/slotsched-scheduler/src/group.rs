//! Per-group scheduling policy state

use slotsched_core::{GroupHandle, DEFAULT_PRIORITY};
use std::collections::BTreeMap;

/// Policy state of one submitter group
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub handle: GroupHandle,
    /// Fair-share weight
    pub weight: f64,
    /// Upper bound on slots the group may hold
    pub max_slots: Option<usize>,
    /// Priority, lower is more important
    pub priority: Option<i32>,
    /// Position within its priority once the job was moved in the queue
    pub queue_position: Option<f64>,
    seq: u64,
}

impl Group {
    /// Registration order among the pool's groups
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Groups of a pool, created lazily on first reference
#[derive(Debug, Clone, Default)]
pub struct Groups {
    groups: BTreeMap<GroupHandle, Group>,
    next_seq: u64,
    default_priority: Option<i32>,
}

impl Groups {
    /// Create an empty group map; new groups get `default_priority`
    pub fn new(default_priority: Option<i32>) -> Self {
        Self {
            groups: BTreeMap::new(),
            next_seq: 0,
            default_priority,
        }
    }

    /// Get a group, creating it with default policy if unseen
    pub fn get_or_create(&mut self, handle: GroupHandle) -> &mut Group {
        let default_priority = self.default_priority;
        let next_seq = &mut self.next_seq;
        self.groups.entry(handle).or_insert_with(|| {
            let seq = *next_seq;
            *next_seq += 1;
            Group {
                handle,
                weight: 1.0,
                max_slots: None,
                priority: default_priority,
                queue_position: None,
                seq,
            }
        })
    }

    pub fn get(&self, handle: &GroupHandle) -> Option<&Group> {
        self.groups.get(handle)
    }

    /// Forget a group's policy state
    pub fn remove(&mut self, handle: &GroupHandle) -> Option<Group> {
        self.groups.remove(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn weight(&self, handle: &GroupHandle) -> f64 {
        self.get(handle).map(|g| g.weight).unwrap_or(1.0)
    }

    pub fn max_slots(&self, handle: &GroupHandle) -> Option<usize> {
        self.get(handle).and_then(|g| g.max_slots)
    }

    /// Effective priority of a group
    pub fn priority(&self, handle: &GroupHandle) -> i32 {
        self.get(handle)
            .and_then(|g| g.priority)
            .or(self.default_priority)
            .unwrap_or(DEFAULT_PRIORITY)
    }

    /// Registration order; unknown groups sort last
    pub fn seq(&self, handle: &GroupHandle) -> u64 {
        self.get(handle).map(|g| g.seq).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_creation_with_defaults() {
        let mut groups = Groups::new(Some(42));
        let handle = GroupHandle::new();

        let group = groups.get_or_create(handle);
        assert_eq!(group.weight, 1.0);
        assert_eq!(group.priority, Some(42));
        assert!(group.max_slots.is_none());

        group.weight = 3.0;
        assert_eq!(groups.get_or_create(handle).weight, 3.0);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_registration_order() {
        let mut groups = Groups::new(None);
        let first = GroupHandle::new();
        let second = GroupHandle::new();
        groups.get_or_create(first);
        groups.get_or_create(second);

        assert!(groups.seq(&first) < groups.seq(&second));
        assert_eq!(groups.seq(&GroupHandle::new()), u64::MAX);
    }

    #[test]
    fn test_fallbacks_for_unknown_groups() {
        let groups = Groups::new(None);
        let handle = GroupHandle::new();
        assert_eq!(groups.weight(&handle), 1.0);
        assert_eq!(groups.priority(&handle), DEFAULT_PRIORITY);
        assert!(groups.max_slots(&handle).is_none());
    }

    #[test]
    fn test_remove_group() {
        let mut groups = Groups::new(None);
        let handle = GroupHandle::new();
        groups.get_or_create(handle).max_slots = Some(2);

        assert_eq!(groups.remove(&handle).and_then(|g| g.max_slots), Some(2));
        assert!(groups.is_empty());
    }
}
