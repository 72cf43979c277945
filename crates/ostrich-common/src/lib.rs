//! Common types and utilities shared across the ostrich relay.
//!
//! This crate provides:
//! - The Nostr event model ([`event`])
//! - Event id hashing and Schnorr signature checks ([`crypto`])
//! - NIP-01 subscription filters ([`filter`])
//! - Client and relay wire messages ([`message`])
//! - Protocol constants and reason prefixes ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod event;
pub mod filter;
pub mod message;
pub mod types;

pub use crypto::ValidationError;
pub use event::Event;
pub use filter::Filter;
pub use message::{ClientMessage, MessageError, RelayMessage};
