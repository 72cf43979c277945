//! Live subscriptions and the index used to match durable events against them.
//!
//! Each filter is filed under the most selective set of exact keys it
//! constrains (full ids, then full author keys, then one tag, then kinds).
//! Filters constraining none of these go to a scan bucket. A lookup for an
//! event visits only the buckets its own id, author, kind and tags map to,
//! and evaluates the full filter there.

use crate::error::SubscriptionError;
use crate::fanout::DeliveryQueue;
use crate::metrics::gauges;
use dashmap::DashMap;
use ostrich_common::types::HEX_ID_LEN;
use ostrich_common::{Event, Filter};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Relay-assigned connection identity.
pub type ConnId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Id(String),
    Author(String),
    Tag(char, String),
    Kind(u16),
    Scan,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FilterKey {
    conn: ConnId,
    sub_id: Arc<str>,
    slot: usize,
}

fn full_keys(values: &[String]) -> bool {
    values.iter().all(|v| v.len() == HEX_ID_LEN)
}

fn index_keys(filter: &Filter) -> Option<Vec<IndexKey>> {
    let lists_empty = filter.ids.as_ref().is_some_and(Vec::is_empty)
        || filter.authors.as_ref().is_some_and(Vec::is_empty)
        || filter.kinds.as_ref().is_some_and(Vec::is_empty)
        || filter.tags.values().any(Vec::is_empty);
    if lists_empty {
        return None;
    }

    if let Some(ids) = filter.ids.as_ref().filter(|ids| full_keys(ids)) {
        return Some(ids.iter().map(|id| IndexKey::Id(id.to_ascii_lowercase())).collect());
    }
    if let Some(authors) = filter.authors.as_ref().filter(|a| full_keys(a)) {
        return Some(
            authors
                .iter()
                .map(|a| IndexKey::Author(a.to_ascii_lowercase()))
                .collect(),
        );
    }
    if let Some((name, values)) = filter.tags.iter().next() {
        return Some(values.iter().map(|v| IndexKey::Tag(*name, v.clone())).collect());
    }
    if let Some(kinds) = &filter.kinds {
        return Some(kinds.iter().map(|k| IndexKey::Kind(*k)).collect());
    }
    Some(vec![IndexKey::Scan])
}

fn event_keys(event: &Event) -> Vec<IndexKey> {
    let mut keys = vec![
        IndexKey::Id(event.id.to_ascii_lowercase()),
        IndexKey::Author(event.pubkey.to_ascii_lowercase()),
        IndexKey::Kind(event.kind),
        IndexKey::Scan,
    ];
    for tag in &event.tags {
        let mut name = tag.first().map(|n| n.chars()).into_iter().flatten();
        if let (Some(c), None, Some(value)) = (name.next(), name.next(), tag.get(1)) {
            keys.push(IndexKey::Tag(c, value.clone()));
        }
    }
    keys
}

struct Subscriber {
    queue: DeliveryQueue,
    subs: HashMap<Arc<str>, Vec<(IndexKey, FilterKey)>>,
}

/// All live subscriptions, keyed by connection.
pub struct SubscriptionRegistry {
    index: DashMap<IndexKey, HashMap<FilterKey, Arc<Filter>>>,
    connections: DashMap<ConnId, Subscriber>,
    max_subscriptions: usize,
    max_filters: usize,
}

impl SubscriptionRegistry {
    /// Creates an empty registry with per-connection limits.
    #[must_use]
    pub fn new(max_subscriptions: usize, max_filters: usize) -> Self {
        Self {
            index: DashMap::new(),
            connections: DashMap::new(),
            max_subscriptions,
            max_filters,
        }
    }

    /// Registers a connection and the queue its deliveries go to.
    pub fn connect(&self, conn: ConnId, queue: DeliveryQueue) {
        let previous = self.connections.insert(
            conn,
            Subscriber {
                queue,
                subs: HashMap::new(),
            },
        );
        if let Some(previous) = previous {
            self.unindex_all(previous);
        }
    }

    /// Removes a connection and every subscription it owns.
    pub fn disconnect(&self, conn: ConnId) {
        if let Some((_, subscriber)) = self.connections.remove(&conn) {
            debug!(cid = conn, subs = subscriber.subs.len(), "subscriptions removed");
            self.unindex_all(subscriber);
        }
    }

    /// The delivery queue of `conn`, if connected.
    #[must_use]
    pub fn queue(&self, conn: ConnId) -> Option<DeliveryQueue> {
        self.connections.get(&conn).map(|s| s.queue.clone())
    }

    /// Adds or replaces subscription `sub_id` on `conn`.
    ///
    /// Returns the handle deliveries for this registration will carry. A
    /// replacement gets a fresh handle, so deliveries matched by the old
    /// filters can be told apart with [`Arc::ptr_eq`].
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError`] when a per-connection limit would be
    /// exceeded. An existing subscription with the same id is left intact in
    /// that case.
    pub fn register(
        &self,
        conn: ConnId,
        sub_id: &str,
        filters: Vec<Filter>,
    ) -> Result<Arc<str>, SubscriptionError> {
        if filters.len() > self.max_filters {
            return Err(SubscriptionError::TooManyFilters(self.max_filters));
        }
        let sub_id: Arc<str> = Arc::from(sub_id);
        let Some(mut subscriber) = self.connections.get_mut(&conn) else {
            return Ok(sub_id);
        };

        let replaced = subscriber.subs.remove(&sub_id);
        if replaced.is_none() && subscriber.subs.len() >= self.max_subscriptions {
            return Err(SubscriptionError::TooManySubscriptions(self.max_subscriptions));
        }
        if let Some(entries) = replaced {
            self.unindex(entries);
        } else {
            gauges::subscriptions_delta(1.0);
        }

        let mut entries = Vec::new();
        for (slot, filter) in filters.into_iter().enumerate() {
            let Some(keys) = index_keys(&filter) else {
                continue;
            };
            let filter = Arc::new(filter);
            let fkey = FilterKey {
                conn,
                sub_id: sub_id.clone(),
                slot,
            };
            for key in keys {
                self.index
                    .entry(key.clone())
                    .or_default()
                    .insert(fkey.clone(), filter.clone());
                entries.push((key, fkey.clone()));
            }
        }
        subscriber.subs.insert(sub_id.clone(), entries);
        Ok(sub_id)
    }

    /// Cancels subscription `sub_id` on `conn`. Returns `false` if unknown.
    pub fn unregister(&self, conn: ConnId, sub_id: &str) -> bool {
        let removed = self
            .connections
            .get_mut(&conn)
            .and_then(|mut s| s.subs.remove(sub_id));
        match removed {
            Some(entries) => {
                gauges::subscriptions_delta(-1.0);
                self.unindex(entries);
                true
            }
            None => false,
        }
    }

    /// Subscriptions whose filters match `event`, one entry per
    /// (connection, subscription), ordered by connection.
    #[must_use]
    pub fn matching(&self, event: &Event) -> Vec<(ConnId, Arc<str>)> {
        let mut seen: HashSet<(ConnId, Arc<str>)> = HashSet::new();
        for key in event_keys(event) {
            let Some(bucket) = self.index.get(&key) else {
                continue;
            };
            for (fkey, filter) in bucket.iter() {
                let id = (fkey.conn, fkey.sub_id.clone());
                if !seen.contains(&id) && filter.matches(event) {
                    seen.insert(id);
                }
            }
        }
        let mut out: Vec<_> = seen.into_iter().collect();
        out.sort_unstable_by_key(|(conn, _)| *conn);
        out
    }

    /// Number of subscriptions `conn` holds.
    #[must_use]
    pub fn subscriptions_of(&self, conn: ConnId) -> usize {
        self.connections.get(&conn).map_or(0, |s| s.subs.len())
    }

    /// Total live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.connections.iter().map(|s| s.subs.len()).sum()
    }

    /// Number of connected subscribers.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn unindex_all(&self, subscriber: Subscriber) {
        gauges::subscriptions_delta(-(subscriber.subs.len() as f64));
        for (_, entries) in subscriber.subs {
            self.unindex(entries);
        }
    }

    fn unindex(&self, entries: Vec<(IndexKey, FilterKey)>) {
        for (key, fkey) in entries {
            if let Some(mut bucket) = self.index.get_mut(&key) {
                bucket.remove(&fkey);
            }
            self.index.remove_if(&key, |_, bucket| bucket.is_empty());
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::channel;

    fn event(id: char, author: char, kind: u16, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: id.to_string().repeat(64),
            pubkey: author.to_string().repeat(64),
            created_at: 1_700_000_000,
            kind,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    fn registry() -> SubscriptionRegistry {
        let r = SubscriptionRegistry::new(3, 2);
        for conn in 1..=3 {
            let (q, _rx) = channel(4);
            r.connect(conn, q);
        }
        r
    }

    fn subs(matches: &[(ConnId, Arc<str>)]) -> Vec<(ConnId, &str)> {
        let mut v: Vec<_> = matches.iter().map(|(c, s)| (*c, &**s)).collect();
        v.sort();
        v
    }

    #[test]
    fn matches_by_author_kind_and_tag() {
        let r = registry();
        r.register(1, "a", vec![Filter::new().authors(["b".repeat(64)])])
            .unwrap();
        r.register(2, "k", vec![Filter::new().kinds([7])]).unwrap();
        r.register(3, "t", vec![Filter::new().tag('e', ["x"])]).unwrap();

        let e = event('a', 'b', 7, vec![vec!["e", "x"]]);
        assert_eq!(subs(&r.matching(&e)), vec![(1, "a"), (2, "k"), (3, "t")]);

        let other = event('a', 'c', 1, vec![]);
        assert!(r.matching(&other).is_empty());
    }

    #[test]
    fn prefix_filters_land_in_scan_bucket() {
        let r = registry();
        r.register(1, "p", vec![Filter::new().authors(["bb"])]).unwrap();
        assert_eq!(subs(&r.matching(&event('a', 'b', 1, vec![]))), vec![(1, "p")]);
        assert!(r.matching(&event('a', 'c', 1, vec![])).is_empty());
    }

    #[test]
    fn full_filter_is_evaluated_in_bucket() {
        let r = registry();
        let f = Filter::new().kinds([1]).since(1_800_000_000);
        r.register(1, "future", vec![f]).unwrap();
        assert!(r.matching(&event('a', 'b', 1, vec![])).is_empty());
    }

    #[test]
    fn two_matching_filters_yield_one_delivery() {
        let r = registry();
        r.register(
            1,
            "s",
            vec![Filter::new().kinds([1]), Filter::new().authors(["b".repeat(64)])],
        )
        .unwrap();
        assert_eq!(r.matching(&event('a', 'b', 1, vec![])).len(), 1);
    }

    #[test]
    fn empty_list_matches_nothing() {
        let r = registry();
        r.register(1, "none", vec![Filter::new().kinds(Vec::<u16>::new())])
            .unwrap();
        assert!(r.matching(&event('a', 'b', 1, vec![])).is_empty());
        assert_eq!(r.subscriptions_of(1), 1);
    }

    #[test]
    fn replacing_a_subscription_drops_old_filters() {
        let r = registry();
        r.register(1, "s", vec![Filter::new().kinds([1])]).unwrap();
        r.register(1, "s", vec![Filter::new().kinds([2])]).unwrap();
        assert_eq!(r.subscriptions_of(1), 1);
        assert!(r.matching(&event('a', 'b', 1, vec![])).is_empty());
        assert_eq!(r.matching(&event('a', 'b', 2, vec![])).len(), 1);
    }

    #[test]
    fn replacement_gets_a_fresh_handle() {
        let r = registry();
        let first = r.register(1, "s", vec![Filter::new()]).unwrap();
        let second = r.register(1, "s", vec![Filter::new()]).unwrap();
        assert_eq!(first, second);
        assert!(!Arc::ptr_eq(&first, &second));

        let matches = r.matching(&event('a', 'b', 1, vec![]));
        assert_eq!(matches.len(), 1);
        assert!(Arc::ptr_eq(&matches[0].1, &second));
    }

    #[test]
    fn limits() {
        let r = registry();
        for id in ["a", "b", "c"] {
            r.register(1, id, vec![Filter::new()]).unwrap();
        }
        assert_eq!(
            r.register(1, "d", vec![Filter::new()]),
            Err(SubscriptionError::TooManySubscriptions(3))
        );
        // replacing an existing id is not a new subscription
        r.register(1, "a", vec![Filter::new().kinds([1])]).unwrap();
        assert_eq!(
            r.register(2, "x", vec![Filter::new(); 3]),
            Err(SubscriptionError::TooManyFilters(2))
        );
    }

    #[test]
    fn unregister_and_disconnect_clean_the_index() {
        let r = registry();
        r.register(1, "a", vec![Filter::new().kinds([1])]).unwrap();
        r.register(1, "b", vec![Filter::new().tag('p', ["x", "y"])])
            .unwrap();
        r.register(2, "c", vec![Filter::new()]).unwrap();

        assert!(r.unregister(1, "a"));
        assert!(!r.unregister(1, "a"));
        assert_eq!(r.subscription_count(), 2);

        r.disconnect(1);
        r.disconnect(2);
        assert_eq!(r.subscription_count(), 0);
        assert_eq!(r.bucket_count(), 0);
        assert!(r.queue(1).is_none());
        assert_eq!(r.connection_count(), 1);
    }
}
