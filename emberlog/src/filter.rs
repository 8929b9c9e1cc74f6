//! Boolean predicates over a [`Record`], composable with AND/OR/NOT.
//!
//! A per-target filter gates `submit` after the level check and before
//! formatting (§4.3).

use std::sync::Arc;

use crate::level::LogLevel;
use crate::record::Record;
use crate::source::SourceId;

pub trait Filter: Send + Sync {
  fn matches(&self, record: &Record) -> bool;
}

/// Matches records at least as severe as `level` (numerically `<=`).
pub struct LevelAtLeast(pub LogLevel);

impl Filter for LevelAtLeast {
  fn matches(&self, record: &Record) -> bool {
    record.level <= self.0
  }
}

/// Matches records originating from one specific source.
pub struct SourceIs(pub SourceId);

impl Filter for SourceIs {
  fn matches(&self, record: &Record) -> bool {
    record.source_id == self.0
  }
}

/// Matches records whose message contains a substring.
pub struct MessageContains(pub String);

impl Filter for MessageContains {
  fn matches(&self, record: &Record) -> bool {
    record.message.contains(&self.0)
  }
}

/// Wraps an arbitrary closure as a [`Filter`], for callers that don't
/// need a named predicate type.
pub struct Predicate<F>(pub F)
where
  F: Fn(&Record) -> bool + Send + Sync;

impl<F> Filter for Predicate<F>
where
  F: Fn(&Record) -> bool + Send + Sync,
{
  fn matches(&self, record: &Record) -> bool {
    (self.0)(record)
  }
}

pub struct And(pub Vec<Arc<dyn Filter>>);

impl Filter for And {
  fn matches(&self, record: &Record) -> bool {
    self.0.iter().all(|f| f.matches(record))
  }
}

pub struct Or(pub Vec<Arc<dyn Filter>>);

impl Filter for Or {
  fn matches(&self, record: &Record) -> bool {
    self.0.iter().any(|f| f.matches(record))
  }
}

pub struct Not(pub Arc<dyn Filter>);

impl Filter for Not {
  fn matches(&self, record: &Record) -> bool {
    !self.0.matches(record)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record_at(level: LogLevel, message: &str) -> Record {
    Record::new(0, level, 0, SourceId(0), "f.rs", 1, "f", message.to_string())
  }

  #[test]
  fn level_at_least_gates_on_severity() {
    let filter = LevelAtLeast(LogLevel::Warn);
    assert!(filter.matches(&record_at(LogLevel::Error, "x")));
    assert!(!filter.matches(&record_at(LogLevel::Info, "x")));
  }

  #[test]
  fn message_contains_matches_substring() {
    let filter = MessageContains("disk".to_string());
    assert!(filter.matches(&record_at(LogLevel::Info, "disk at 90%")));
    assert!(!filter.matches(&record_at(LogLevel::Info, "network ok")));
  }

  #[test]
  fn and_requires_all_children() {
    let filter = And(vec![
      Arc::new(LevelAtLeast(LogLevel::Warn)),
      Arc::new(MessageContains("disk".to_string())),
    ]);
    assert!(filter.matches(&record_at(LogLevel::Error, "disk full")));
    assert!(!filter.matches(&record_at(LogLevel::Info, "disk full")));
  }

  #[test]
  fn or_requires_any_child() {
    let filter = Or(vec![
      Arc::new(MessageContains("disk".to_string())),
      Arc::new(MessageContains("network".to_string())),
    ]);
    assert!(filter.matches(&record_at(LogLevel::Info, "network down")));
    assert!(!filter.matches(&record_at(LogLevel::Info, "cpu spike")));
  }

  #[test]
  fn not_inverts_child() {
    let filter = Not(Arc::new(LevelAtLeast(LogLevel::Warn)));
    assert!(filter.matches(&record_at(LogLevel::Info, "x")));
    assert!(!filter.matches(&record_at(LogLevel::Error, "x")));
  }
}
