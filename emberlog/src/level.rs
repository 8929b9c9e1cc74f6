//! Log severity levels.
//!
//! `LogLevel` is a total order over eight severities, from the quietest
//! (`Fatal`) to the noisiest (`Diag`). Ordering is numeric: a record is
//! emitted when `requested_level <= source.effective_level()` (lower
//! discriminant = more severe = always let through).

use std::fmt;
use std::str::FromStr;

/// Severity of a single log record.
///
/// # Ordering
///
/// `Fatal < Error < Warn < Notice < Info < Trace < Debug < Diag` — the
/// discriminant doubles as "how loud". A source configured at `Info` lets
/// `Fatal`..`Info` through and gates `Trace`/`Debug`/`Diag`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
  Fatal = 0,
  Error = 1,
  Warn = 2,
  Notice = 3,
  Info = 4,
  Trace = 5,
  Debug = 6,
  Diag = 7,
}

impl LogLevel {
  pub const ALL: [LogLevel; 8] = [
    LogLevel::Fatal,
    LogLevel::Error,
    LogLevel::Warn,
    LogLevel::Notice,
    LogLevel::Info,
    LogLevel::Trace,
    LogLevel::Debug,
    LogLevel::Diag,
  ];

  /// Name used by the format engine's `${level}` field and by `FromStr`.
  #[inline]
  pub const fn name(self) -> &'static str {
    match self {
      LogLevel::Fatal => "FATAL",
      LogLevel::Error => "ERROR",
      LogLevel::Warn => "WARN",
      LogLevel::Notice => "NOTICE",
      LogLevel::Info => "INFO",
      LogLevel::Trace => "TRACE",
      LogLevel::Debug => "DEBUG",
      LogLevel::Diag => "DIAG",
    }
  }

  /// Convert from the raw discriminant, saturating unknown values to the
  /// quietest level rather than panicking (mirrors `LogEvent::from_u8`'s
  /// "always return a valid level" stance in the teacher).
  #[inline]
  pub fn from_u8(raw: u8) -> LogLevel {
    match raw {
      0 => LogLevel::Fatal,
      1 => LogLevel::Error,
      2 => LogLevel::Warn,
      3 => LogLevel::Notice,
      4 => LogLevel::Info,
      5 => LogLevel::Trace,
      6 => LogLevel::Debug,
      _ => LogLevel::Diag,
    }
  }

  /// Least-severe (i.e. numerically greatest) of two levels.
  #[inline]
  pub fn loosest(self, other: LogLevel) -> LogLevel {
    std::cmp::max(self, other)
  }

  /// Most-severe (i.e. numerically smallest) of two levels.
  #[inline]
  pub fn strictest(self, other: LogLevel) -> LogLevel {
    std::cmp::min(self, other)
  }
}

impl fmt::Display for LogLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Error returned by [`LogLevel::from_str`] for an unrecognized name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError(pub String);

impl fmt::Display for ParseLevelError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "unrecognized log level {:?}", self.0)
  }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for LogLevel {
  type Err = ParseLevelError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "FATAL" => Ok(LogLevel::Fatal),
      "ERROR" => Ok(LogLevel::Error),
      "WARN" | "WARNING" => Ok(LogLevel::Warn),
      "NOTICE" => Ok(LogLevel::Notice),
      "INFO" => Ok(LogLevel::Info),
      "TRACE" => Ok(LogLevel::Trace),
      "DEBUG" => Ok(LogLevel::Debug),
      "DIAG" | "DIAGNOSTIC" => Ok(LogLevel::Diag),
      _ => Err(ParseLevelError(s.to_string())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_names() {
    for level in LogLevel::ALL {
      let parsed: LogLevel = level.name().parse().unwrap();
      assert_eq!(parsed, level);
    }
  }

  #[test]
  fn ordering_is_severity_first() {
    assert!(LogLevel::Fatal < LogLevel::Error);
    assert!(LogLevel::Error < LogLevel::Diag);
  }

  #[test]
  fn unknown_string_is_rejected() {
    assert!("bogus".parse::<LogLevel>().is_err());
  }

  #[test]
  fn from_u8_saturates() {
    assert_eq!(LogLevel::from_u8(200), LogLevel::Diag);
    assert_eq!(LogLevel::from_u8(0), LogLevel::Fatal);
  }
}
