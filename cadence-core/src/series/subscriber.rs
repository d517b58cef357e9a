//! Subscriber sets.
//!
//! An output is observed by the nodes whose active inputs are bound to it. A
//! node may reach the same output through more than one input (for example
//! `a + a`), so subscriptions are counted per subscriber: the node stays
//! subscribed until every path that subscribed it has unsubscribed.

use std::hash::Hash;

use indexmap::IndexMap;

/// Reference-counted, insertion-ordered set of subscribers.
#[derive(Debug, Clone)]
pub struct SubscriberSet<K> {
    counts: IndexMap<K, usize>,
}

impl<K: Copy + Eq + Hash> SubscriberSet<K> {
    pub fn new() -> Self {
        Self {
            counts: IndexMap::new(),
        }
    }

    /// Add one subscription path for `subscriber`.
    ///
    /// Returns `true` if this is the subscriber's first path.
    pub fn subscribe(&mut self, subscriber: K) -> bool {
        let count = self.counts.entry(subscriber).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop one subscription path.
    ///
    /// Returns `true` once the subscriber has no paths left.
    pub fn un_subscribe(&mut self, subscriber: K) -> bool {
        match self.counts.get_mut(&subscriber) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.shift_remove(&subscriber);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, subscriber: K) -> bool {
        self.counts.contains_key(&subscriber)
    }

    pub fn count(&self, subscriber: K) -> usize {
        self.counts.get(&subscriber).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Distinct subscribers, each listed once.
    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.counts.keys().copied()
    }

    pub fn to_vec(&self) -> Vec<K> {
        self.iter().collect()
    }
}

impl<K: Copy + Eq + Hash> Default for SubscriberSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_paths_are_counted() {
        let mut set = SubscriberSet::new();
        assert!(set.subscribe(7u32));
        assert!(!set.subscribe(7));
        assert_eq!(set.len(), 1);
        assert_eq!(set.count(7), 2);

        assert!(!set.un_subscribe(7));
        assert!(set.contains(7));
        assert!(set.un_subscribe(7));
        assert!(set.is_empty());
    }

    #[test]
    fn unknown_subscriber_is_ignored() {
        let mut set: SubscriberSet<u32> = SubscriberSet::new();
        assert!(!set.un_subscribe(3));
    }

    #[test]
    fn iteration_keeps_subscription_order() {
        let mut set = SubscriberSet::new();
        for id in [3u32, 1, 2, 1] {
            set.subscribe(id);
        }
        assert_eq!(set.to_vec(), vec![3, 1, 2]);
    }
}
