//! Core types for linkhub.
//!
//! Links (bot frontends and similar processes) talk to each other through a
//! central hub. This crate holds what both sides agree on: identifiers, the
//! identification frame, the [`Package`] envelope and its [`Message`]
//! payloads. It also carries [`KeyedLock`], which both sides use to
//! serialize work per key.

mod identity;
pub mod lock;
mod message;
mod package;

pub use identity::{Identification, IdentifyParseError, LinkType, Nid, is_link_type, is_nid};
pub use lock::{KeyedGuard, KeyedLock};
pub use message::{Message, MessageTag, RequestErrorKind};
pub use package::{CodecError, Package};

/// Source of every package the hub sends. Packages addressed here are for
/// the hub itself and are never routed.
pub const HUB_NID: &str = "__master__";

/// Destination meaning "do not route".
pub const NULL_DESTINATION: &str = "NULL";
