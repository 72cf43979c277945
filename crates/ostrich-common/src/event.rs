//! Nostr event model.

use crate::types::{KIND_METADATA, PRIVATE_KINDS};
use serde::{Deserialize, Serialize};

/// A signed, timestamped Nostr event.
///
/// ```json
/// {
///   "id": "4376c65d...",
///   "pubkey": "6e468422...",
///   "created_at": 1673347337,
///   "kind": 1,
///   "tags": [["e", "3da979..."], ["p", "bf2376..."]],
///   "content": "hello",
///   "sig": "908a15e4..."
/// }
/// ```
///
/// Events are immutable once validated; the relay shares them behind an
/// `Arc` between the persistence path and every subscriber queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex-encoded SHA-256 of the canonical serialization.
    pub id: String,
    /// Hex-encoded x-only public key of the author.
    pub pubkey: String,
    /// Unix timestamp (seconds) chosen by the author.
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Tags, each a non-empty array of strings.
    pub tags: Vec<Vec<String>>,
    /// Arbitrary content.
    pub content: String,
    /// Hex-encoded BIP-340 signature over `id`.
    pub sig: String,
}

impl Event {
    /// Short id prefix for log lines.
    #[must_use]
    pub fn id_prefix(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }

    /// Values (second element) of every tag whose name matches `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    /// Whether this is a private message only its parties should read.
    #[must_use]
    pub fn is_private(&self) -> bool {
        PRIVATE_KINDS.contains(&self.kind)
    }

    /// Whether `pubkey` is the author or the first `p`-tagged recipient.
    #[must_use]
    pub fn is_party(&self, pubkey: &str) -> bool {
        self.pubkey.eq_ignore_ascii_case(pubkey)
            || self
                .tag_values("p")
                .next()
                .is_some_and(|recipient| recipient.eq_ignore_ascii_case(pubkey))
    }

    /// NIP-40 expiration timestamp, if the event carries a parseable one.
    #[must_use]
    pub fn expiration(&self) -> Option<u64> {
        self.tag_values("expiration")
            .next()
            .and_then(|v| v.parse().ok())
    }

    /// Returns `true` if the event carries an expiration at or before `now`.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration().is_some_and(|exp| exp <= now)
    }

    /// Ephemeral events (kinds 20000–29999) are relayed but never stored.
    #[must_use]
    pub const fn is_ephemeral(&self) -> bool {
        self.kind >= 20_000 && self.kind < 30_000
    }

    /// The `nip05` identifier claimed in a metadata event, if any.
    #[must_use]
    pub fn metadata_nip05(&self) -> Option<String> {
        if self.kind != KIND_METADATA {
            return None;
        }
        let content: serde_json::Value = serde_json::from_str(&self.content).ok()?;
        content
            .get("nip05")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: u16, tags: Vec<Vec<&str>>, content: &str) -> Event {
        Event {
            id: "a".repeat(64),
            pubkey: "b".repeat(64),
            created_at: 1_700_000_000,
            kind,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: content.to_string(),
            sig: "c".repeat(128),
        }
    }

    #[test]
    fn tag_values_filters_by_name() {
        let ev = event(1, vec![vec!["e", "x"], vec!["p", "y"], vec!["e", "z"], vec!["e"]], "");
        let values: Vec<&str> = ev.tag_values("e").collect();
        assert_eq!(values, vec!["x", "z"]);
    }

    #[test]
    fn expiration_in_past_is_expired() {
        let ev = event(1, vec![vec!["expiration", "100"]], "");
        assert!(ev.is_expired(100));
        assert!(!ev.is_expired(99));
    }

    #[test]
    fn unparseable_expiration_is_ignored() {
        let ev = event(1, vec![vec!["expiration", "soon"]], "");
        assert!(!ev.is_expired(u64::MAX));
    }

    #[test]
    fn private_message_parties() {
        let (to, cc) = ("d".repeat(64), "e".repeat(64));
        let dm = event(4, vec![vec!["p", to.as_str()], vec!["p", cc.as_str()]], "");
        assert!(dm.is_private());
        assert!(dm.is_party(&"b".repeat(64)));
        assert!(dm.is_party(&"D".repeat(64)));
        // only the first recipient counts
        assert!(!dm.is_party(&"e".repeat(64)));
        assert!(!event(1, vec![], "").is_private());
    }

    #[test]
    fn ephemeral_range() {
        assert!(event(20_000, vec![], "").is_ephemeral());
        assert!(event(29_999, vec![], "").is_ephemeral());
        assert!(!event(30_000, vec![], "").is_ephemeral());
        assert!(!event(1, vec![], "").is_ephemeral());
    }

    #[test]
    fn metadata_nip05_only_for_kind_zero() {
        let content = r#"{"name":"bob","nip05":"bob@example.com"}"#;
        assert_eq!(
            event(0, vec![], content).metadata_nip05().as_deref(),
            Some("bob@example.com")
        );
        assert!(event(1, vec![], content).metadata_nip05().is_none());
        assert!(event(0, vec![], "not json").metadata_nip05().is_none());
        assert!(event(0, vec![], r#"{"nip05":"  "}"#).metadata_nip05().is_none());
    }

    #[test]
    fn id_prefix_is_short() {
        let ev = event(1, vec![], "");
        assert_eq!(ev.id_prefix(), "aaaaaaaa");
    }
}
