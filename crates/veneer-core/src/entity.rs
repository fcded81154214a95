//! Identity types shared by the overlay, the queue and the listener.
//!
//! Veneer never looks inside the entities it tracks. An entity is a key within
//! a category, its state is an open JSON map, and the authoritative-cache
//! lookups that describe it are opaque JSON values handed back verbatim to the
//! cache collaborator.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An open map of attribute values, as held by the authoritative cache or
/// speculated by an overlay entry.
pub type Record = serde_json::Map<String, Value>;

// ─── Category ────────────────────────────────────────────────────────────────

/// Tag distinguishing entity kinds (e.g. `listing`, `booking`). Overlay state
/// is never shared across categories, even when keys collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
  pub fn new(name: impl Into<String>) -> Self { Self(name.into()) }

  /// The catch-all category for callers that do not partition their state.
  pub fn generic() -> Self { Self("generic".to_owned()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for Category {
  fn from(s: &str) -> Self { Self::new(s) }
}

impl From<String> for Category {
  fn from(s: String) -> Self { Self(s) }
}

// ─── EntityRef ───────────────────────────────────────────────────────────────

/// A category-qualified entity identity, as carried by change events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
  pub category: Category,
  pub key:      String,
}

impl EntityRef {
  pub fn new(category: impl Into<Category>, key: impl Into<String>) -> Self {
    Self { category: category.into(), key: key.into() }
  }
}

impl fmt::Display for EntityRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.category, self.key)
  }
}

// ─── Invalidation targets ────────────────────────────────────────────────────

/// An opaque authoritative-cache lookup descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvalidationTarget(Value);

impl InvalidationTarget {
  pub fn new(descriptor: impl Into<Value>) -> Self { Self(descriptor.into()) }
}

impl fmt::Display for InvalidationTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Options passed alongside every invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateOptions {
  /// Match the target exactly rather than as a prefix of cached lookups.
  pub exact:          bool,
  /// Refetch lookups that are currently being observed right away.
  pub refetch_active: bool,
}

impl InvalidateOptions {
  /// Options used by the reconciliation queue.
  pub const EXACT: Self = Self { exact: true, refetch_active: true };

  /// Default options used by the event listener.
  pub const PREFIX: Self = Self { exact: false, refetch_active: true };
}

impl Default for InvalidateOptions {
  fn default() -> Self { Self::PREFIX }
}
