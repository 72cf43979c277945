//! NIP-01 subscription filters.
//!
//! A filter matches an event when every predicate it sets matches:
//! - `ids` / `authors`: any listed value is a prefix of the event id / pubkey
//! - `kinds`: the event kind is listed
//! - `since` / `until`: inclusive bounds on `created_at`
//! - `#x`: the event has an `x` tag whose value is listed
//!
//! An explicitly empty list matches nothing. `limit` only applies to the
//! historical query and is ignored by [`Filter::matches`].

use crate::event::Event;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A NIP-01 filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Event id prefixes.
    pub ids: Option<Vec<String>>,
    /// Author pubkey prefixes.
    pub authors: Option<Vec<String>>,
    /// Event kinds.
    pub kinds: Option<Vec<u16>>,
    /// Lower bound on `created_at` (inclusive).
    pub since: Option<u64>,
    /// Upper bound on `created_at` (inclusive).
    pub until: Option<u64>,
    /// Maximum number of stored events to return.
    pub limit: Option<u64>,
    /// Tag queries keyed by single-letter tag name (without the `#`).
    pub tags: BTreeMap<char, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter (matches all events).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event id prefixes.
    #[must_use]
    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by author prefixes.
    #[must_use]
    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by kinds.
    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Events created at or after `timestamp`.
    #[must_use]
    pub const fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Events created at or before `timestamp`.
    #[must_use]
    pub const fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit the number of historical results.
    #[must_use]
    pub const fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag query.
    #[must_use]
    pub fn tag(mut self, name: char, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags
            .insert(name, values.into_iter().map(Into::into).collect());
        self
    }

    /// Whether this filter asks for too little to be anything but a crawl.
    ///
    /// Filters naming ids are always narrow; otherwise at least two of
    /// `authors`, `kinds` and tags must be set.
    #[must_use]
    pub fn is_broad(&self) -> bool {
        if self.ids.is_some() {
            return false;
        }
        let narrowing = [
            self.authors.is_some(),
            self.kinds.is_some(),
            !self.tags.is_empty(),
        ];
        narrowing.iter().filter(|set| **set).count() < 2
    }

    /// Returns `true` if `event` satisfies every predicate of this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|p| event.id.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|p| event.pubkey.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        self.tags.iter().all(|(name, values)| {
            let mut buf = [0u8; 4];
            let name: &str = name.encode_utf8(&mut buf);
            let found = event
                .tag_values(name)
                .any(|v| values.iter().any(|wanted| wanted == v));
            found
        })
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        for (name, values) in &self.tags {
            map.serialize_entry(&format!("#{name}"), values)?;
        }
        map.end()
    }
}

fn string_list<E: de::Error>(key: &str, value: Value) -> Result<Vec<String>, E> {
    serde_json::from_value(value).map_err(|_| E::custom(format!("{key} must be a list of strings")))
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = serde_json::Map::<String, Value>::deserialize(deserializer)?;
        let mut filter = Self::default();
        for (key, value) in object {
            match key.as_str() {
                "ids" => filter.ids = Some(string_list(&key, value)?),
                "authors" => filter.authors = Some(string_list(&key, value)?),
                "kinds" => {
                    filter.kinds = Some(
                        serde_json::from_value(value)
                            .map_err(|_| de::Error::custom("kinds must be a list of integers"))?,
                    );
                }
                "since" => filter.since = Some(value.as_u64().ok_or_else(|| de::Error::custom("since must be an integer"))?),
                "until" => filter.until = Some(value.as_u64().ok_or_else(|| de::Error::custom("until must be an integer"))?),
                "limit" => filter.limit = Some(value.as_u64().ok_or_else(|| de::Error::custom("limit must be an integer"))?),
                other => {
                    let mut chars = other.chars();
                    if let (Some('#'), Some(name), None) = (chars.next(), chars.next(), chars.next()) {
                        filter.tags.insert(name, string_list(other, value)?);
                    }
                    // unknown keys are ignored
                }
            }
        }
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event(id: &str, pubkey: &str, kind: u16, created_at: u64) -> Event {
        make_event_with_tags(id, pubkey, kind, created_at, vec![])
    }

    fn make_event_with_tags(
        id: &str,
        pubkey: &str,
        kind: u16,
        created_at: u64,
        tags: Vec<Vec<String>>,
    ) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags,
            content: "test".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn empty_filter_matches_all() {
        assert!(Filter::new().matches(&make_event("abc", "xyz", 1, 1000)));
    }

    #[test]
    fn empty_list_matches_nothing() {
        let filter = Filter::new().kinds([]);
        assert!(!filter.matches(&make_event("abc", "xyz", 1, 1000)));
    }

    #[test]
    fn kinds() {
        let filter = Filter::new().kinds([1, 7]);
        assert!(filter.matches(&make_event("id", "pk", 1, 1000)));
        assert!(filter.matches(&make_event("id", "pk", 7, 1000)));
        assert!(!filter.matches(&make_event("id", "pk", 2, 1000)));
    }

    #[test]
    fn authors_and_ids_match_by_prefix() {
        let filter = Filter::new().authors(["abc"]).ids(["ff"]);
        assert!(filter.matches(&make_event("ff01", "abc123", 1, 1000)));
        assert!(!filter.matches(&make_event("ee01", "abc123", 1, 1000)));
        assert!(!filter.matches(&make_event("ff01", "xyz123", 1, 1000)));
    }

    #[test]
    fn since_and_until_are_inclusive() {
        let filter = Filter::new().since(1000).until(2000);
        assert!(!filter.matches(&make_event("id", "pk", 1, 999)));
        assert!(filter.matches(&make_event("id", "pk", 1, 1000)));
        assert!(filter.matches(&make_event("id", "pk", 1, 2000)));
        assert!(!filter.matches(&make_event("id", "pk", 1, 2001)));
    }

    #[test]
    fn tag_values_match_exactly() {
        let filter = Filter::new().tag('e', ["event123"]);
        let tagged = make_event_with_tags(
            "id",
            "pk",
            1,
            1000,
            vec![vec!["e".to_string(), "event123".to_string()]],
        );
        let prefix_only = make_event_with_tags(
            "id",
            "pk",
            1,
            1000,
            vec![vec!["e".to_string(), "event1234".to_string()]],
        );
        assert!(filter.matches(&tagged));
        assert!(!filter.matches(&prefix_only));
        assert!(!filter.matches(&make_event("id", "pk", 1, 1000)));
    }

    #[test]
    fn broad_filters_need_two_constraints() {
        assert!(Filter::new().is_broad());
        assert!(Filter::new().kinds([1]).since(5).is_broad());
        assert!(!Filter::new().kinds([1]).authors(["ab"]).is_broad());
        assert!(!Filter::new().kinds([4]).tag('p', ["pk"]).is_broad());
        assert!(!Filter::new().ids(["ff"]).is_broad());
    }

    #[test]
    fn deserialize_nip01_json() {
        let filter: Filter = serde_json::from_str(
            r##"{"kinds":[1,7],"authors":["ab"],"#p":["pk1"],"since":5,"limit":10,"search":"x","#long":["y"]}"##,
        )
        .unwrap();
        assert_eq!(filter.kinds, Some(vec![1, 7]));
        assert_eq!(filter.authors, Some(vec!["ab".to_string()]));
        assert_eq!(filter.tags.get(&'p'), Some(&vec!["pk1".to_string()]));
        assert_eq!(filter.since, Some(5));
        assert_eq!(filter.limit, Some(10));
        assert_eq!(filter.tags.len(), 1);
    }

    #[test]
    fn deserialize_rejects_wrong_types() {
        assert!(serde_json::from_str::<Filter>(r#"{"kinds":["one"]}"#).is_err());
        assert!(serde_json::from_str::<Filter>(r#"{"since":"yesterday"}"#).is_err());
        assert!(serde_json::from_str::<Filter>(r##"{"#e":"abc"}"##).is_err());
    }

    #[test]
    fn serialize_uses_hash_keys() {
        let filter = Filter::new().kinds([1]).limit(10).tag('p', ["pubkey1"]);
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains("\"kinds\":[1]"));
        assert!(json.contains("\"limit\":10"));
        assert!(json.contains("\"#p\":[\"pubkey1\"]"));
    }
}
