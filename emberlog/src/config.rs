//! Configuration ingestion (§6, ambient addition).
//!
//! The core only consumes an already-parsed value tree — turning a
//! TOML/YAML/JSON/property-file string into [`ConfigValue`] is the
//! external loader's job (§1 non-goal: "the CLI / configuration file
//! loader"). [`configure`] recognizes exactly the keys §6 lists and
//! builds a [`SourceTree`] level/propagation layout plus a populated
//! [`Registry`] of started targets.
//!
//! Has no direct teacher analogue (`ttlog` takes a `TraceConfig` struct
//! built in Rust, not ingested from an external map); grounded on
//! `mixalturek-spirit`'s `spirit-log` crate, the other pack repo with a
//! declarative "target list keyed by scheme" config surface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::filter::{self, Filter};
use crate::flush_policy::{self, FlushPolicy};
use crate::formatter::{FieldRegistry, Formatter, StructuredFormatter};
use crate::level::LogLevel;
use crate::source::{PropagationMode, SourceTree};
use crate::target::deferred::DeferredBackend;
use crate::target::file::FileBackend;
use crate::target::quantum::{CongestionPolicy, QuantumBackend};
use crate::target::segmented_file::SegmentedFileBackend;
use crate::target::stdout::StdoutBackend;
use crate::target::{Registry, SinkBackend, Target};

/// A deserialized, scheme-agnostic configuration value (§6: "a flat
/// key→value map OR a tree of maps/arrays/scalars").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
  Scalar(String),
  Seq(Vec<ConfigValue>),
  Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      ConfigValue::Scalar(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_map(&self) -> Option<&BTreeMap<String, ConfigValue>> {
    match self {
      ConfigValue::Map(m) => Some(m),
      _ => None,
    }
  }

  /// A single map is treated as a one-element sequence (§6: "`log_target`:
  /// either a single target config or an array").
  pub fn as_seq_of_maps(&self) -> Vec<&BTreeMap<String, ConfigValue>> {
    match self {
      ConfigValue::Seq(items) => items.iter().filter_map(ConfigValue::as_map).collect(),
      ConfigValue::Map(m) => vec![m],
      ConfigValue::Scalar(_) => Vec::new(),
    }
  }
}

fn config_error(message: impl Into<String>) -> Error {
  Error::new(ErrorKind::ConfigParse, message)
}

fn semantics_error(message: impl Into<String>) -> Error {
  Error::new(ErrorKind::ConfigSemantics, message)
}

/// Splits a `log_level` value's trailing propagation suffix (`*`/`+`/`-`)
/// from the level name itself (§6).
fn parse_level_with_propagation(raw: &str) -> Result<(LogLevel, Option<PropagationMode>)> {
  let (level_str, mode) = match raw.chars().last() {
    Some('*') => (&raw[..raw.len() - 1], Some(PropagationMode::Set)),
    Some('+') => (&raw[..raw.len() - 1], Some(PropagationMode::Loose)),
    Some('-') => (&raw[..raw.len() - 1], Some(PropagationMode::Restrict)),
    _ => (raw, None),
  };
  let level = level_str
    .trim()
    .parse::<LogLevel>()
    .map_err(|e| config_error(format!("invalid log_level {:?}: {}", raw, e)))?;
  Ok((level, mode))
}

fn build_formatter(template: &str, registry: &FieldRegistry) -> Result<StructuredFormatter> {
  let formatter = Formatter::parse(template, registry).map_err(|e| config_error(e.to_string()))?;
  Ok(StructuredFormatter::Plain(formatter))
}

/// `filter` config grammar: a single-key map naming one predicate, or
/// `and`/`or`/`not` combining nested filter maps.
fn build_filter(value: &ConfigValue) -> Result<Arc<dyn Filter>> {
  let map = value.as_map().ok_or_else(|| config_error("filter must be a map"))?;
  let (key, inner) = map
    .iter()
    .next()
    .ok_or_else(|| config_error("filter map must have exactly one key"))?;
  Ok(match key.as_str() {
    "level_at_least" => {
      let level = inner.as_str().ok_or_else(|| config_error("level_at_least expects a scalar"))?;
      Arc::new(filter::LevelAtLeast(
        level.parse().map_err(|e: crate::level::ParseLevelError| config_error(e.to_string()))?,
      ))
    },
    "message_contains" => Arc::new(filter::MessageContains(
      inner.as_str().ok_or_else(|| config_error("message_contains expects a scalar"))?.to_string(),
    )),
    "and" => {
      let children = match inner {
        ConfigValue::Seq(items) => items.iter().map(build_filter).collect::<Result<Vec<_>>>()?,
        _ => return Err(config_error("and expects a sequence of filters")),
      };
      Arc::new(filter::And(children))
    },
    "or" => {
      let children = match inner {
        ConfigValue::Seq(items) => items.iter().map(build_filter).collect::<Result<Vec<_>>>()?,
        _ => return Err(config_error("or expects a sequence of filters")),
      };
      Arc::new(filter::Or(children))
    },
    "not" => Arc::new(filter::Not(build_filter(inner)?)),
    other => return Err(semantics_error(format!("unknown filter kind {:?}", other))),
  })
}

/// `flush_policy` config grammar, analogous to [`build_filter`].
fn build_flush_policy(value: &ConfigValue) -> Result<Arc<dyn FlushPolicy>> {
  let map = value.as_map().ok_or_else(|| config_error("flush_policy must be a map"))?;
  let (key, inner) = map
    .iter()
    .next()
    .ok_or_else(|| config_error("flush_policy map must have exactly one key"))?;
  Ok(match key.as_str() {
    "immediate" => Arc::new(flush_policy::Immediate),
    "never" => Arc::new(flush_policy::Never),
    "count_every" => {
      let n: u64 = inner
        .as_str()
        .ok_or_else(|| config_error("count_every expects a scalar"))?
        .parse()
        .map_err(|_| config_error("count_every expects an integer"))?;
      Arc::new(flush_policy::CountEvery::new(n))
    },
    "size_every_bytes" => {
      let b: u64 = inner
        .as_str()
        .ok_or_else(|| config_error("size_every_bytes expects a scalar"))?
        .parse()
        .map_err(|_| config_error("size_every_bytes expects an integer"))?;
      Arc::new(flush_policy::SizeEvery::new(b))
    },
    "timer_every_millis" => {
      let ms: u64 = inner
        .as_str()
        .ok_or_else(|| config_error("timer_every_millis expects a scalar"))?
        .parse()
        .map_err(|_| config_error("timer_every_millis expects an integer"))?;
      Arc::new(flush_policy::TimerEvery::new(Duration::from_millis(ms)))
    },
    "and" => {
      let children = match inner {
        ConfigValue::Seq(items) => items.iter().map(build_flush_policy).collect::<Result<Vec<_>>>()?,
        _ => return Err(config_error("and expects a sequence of flush policies")),
      };
      Arc::new(flush_policy::And(children))
    },
    "or" => {
      let children = match inner {
        ConfigValue::Seq(items) => items.iter().map(build_flush_policy).collect::<Result<Vec<_>>>()?,
        _ => return Err(config_error("or expects a sequence of flush policies")),
      };
      Arc::new(flush_policy::Or(children))
    },
    other => return Err(semantics_error(format!("unknown flush_policy kind {:?}", other))),
  })
}

fn build_backend(map: &BTreeMap<String, ConfigValue>) -> Result<Box<dyn SinkBackend>> {
  let scheme = map
    .get("scheme")
    .and_then(ConfigValue::as_str)
    .ok_or_else(|| semantics_error("log_target entry missing `scheme`"))?;

  let mut backend: Box<dyn SinkBackend> = match scheme {
    "stdout" => Box::new(StdoutBackend::new()),
    "file" => {
      let path = map
        .get("path")
        .and_then(ConfigValue::as_str)
        .ok_or_else(|| semantics_error("file target missing `path`"))?;
      Box::new(FileBackend::new(path))
    },
    "segmented-file" => {
      let path = map
        .get("path")
        .and_then(ConfigValue::as_str)
        .ok_or_else(|| semantics_error("segmented-file target missing `path`"))?;
      let limit: u64 = map
        .get("segment_limit_mb")
        .and_then(ConfigValue::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(64);
      Box::new(SegmentedFileBackend::new(path, limit))
    },
    other => return Err(semantics_error(format!("unknown target scheme {:?}", other))),
  };

  if let Some(ConfigValue::Scalar(flag)) = map.get("deferred") {
    if flag == "true" {
      let batch: usize = map
        .get("queue_batch_size")
        .and_then(ConfigValue::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(64);
      let timeout_ms: u64 = map
        .get("queue_timeout_millis")
        .and_then(ConfigValue::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);
      backend = Box::new(DeferredBackend::new(backend, batch, Duration::from_millis(timeout_ms)));
    }
  }

  if let Some(size) = map.get("quantum_buffer_size").and_then(ConfigValue::as_str) {
    let ring_size: usize = size.parse().map_err(|_| config_error("quantum_buffer_size expects an integer"))?;
    let congestion = match map.get("quantum-congestion-policy").and_then(ConfigValue::as_str) {
      Some("discard-log") => CongestionPolicy::DiscardLog,
      Some("discard-all") => CongestionPolicy::DiscardAll,
      Some("wait") | None => CongestionPolicy::Wait,
      Some(other) => return Err(semantics_error(format!("unknown quantum congestion policy {:?}", other))),
    };
    backend = Box::new(QuantumBackend::new(backend, ring_size, congestion));
  }

  Ok(backend)
}

/// Applies a parsed configuration tree to a log-source tree and produces
/// a populated, started [`Registry`] (§6, §4.10).
pub struct Configurator {
  tree: Arc<SourceTree>,
  error_sink: Arc<crate::error::ErrorSink>,
  field_registry: FieldRegistry,
}

impl Configurator {
  pub fn new(tree: Arc<SourceTree>, error_sink: Arc<crate::error::ErrorSink>) -> Self {
    Self {
      tree,
      error_sink,
      field_registry: FieldRegistry::new(),
    }
  }

  pub fn configure(&self, config: &ConfigValue) -> Result<Registry> {
    let map = config.as_map().ok_or_else(|| config_error("top-level config must be a map"))?;
    let registry = Registry::new();
    let mut default_formatter: Option<Arc<StructuredFormatter>> = None;

    if let Some(format) = map.get("log_format").and_then(ConfigValue::as_str) {
      default_formatter = Some(Arc::new(build_formatter(format, &self.field_registry)?));
    }

    if let Some(level_value) = map.get("log_level").and_then(ConfigValue::as_str) {
      let (level, mode) = parse_level_with_propagation(level_value)?;
      if let Some(mode) = mode {
        self.tree.set_propagation(self.tree.root(), mode);
      }
      self.tree.set_level(self.tree.root(), level);
    }

    for (key, value) in map {
      let Some(qualified_name) = key.strip_suffix(".log_level") else {
        continue;
      };
      let level_value = value.as_str().ok_or_else(|| config_error(format!("{} expects a scalar", key)))?;
      let (level, mode) = parse_level_with_propagation(level_value)?;
      let source_id = self
        .tree
        .define(qualified_name, true)
        .map_err(semantics_error)?;
      if let Some(mode) = mode {
        self.tree.set_propagation(source_id, mode);
      }
      self.tree.set_level(source_id, level);
    }

    if let Some(targets) = map.get("log_target") {
      for target_map in targets.as_seq_of_maps() {
        let name = target_map.get("name").and_then(ConfigValue::as_str).unwrap_or("target").to_string();
        let backend = build_backend(target_map)?;
        let mut target = Target::new(name, backend, Arc::clone(&self.error_sink));

        if let Some(level_value) = target_map.get("log_level").and_then(ConfigValue::as_str) {
          let (level, _) = parse_level_with_propagation(level_value)?;
          target = target.with_level(level);
        }
        if let Some(format) = target_map.get("log_format").and_then(ConfigValue::as_str) {
          target = target.with_formatter(Arc::new(build_formatter(format, &self.field_registry)?));
        } else if let Some(formatter) = &default_formatter {
          target = target.with_formatter(Arc::clone(formatter));
        }
        if let Some(filter_value) = target_map.get("filter") {
          target = target.with_filter(build_filter(filter_value)?);
        }
        if let Some(policy_value) = target_map.get("flush_policy") {
          target = target.with_flush_policy(build_flush_policy(policy_value)?);
        }

        let target = Arc::new(target);
        target.start()?;
        registry.add(target);
      }
    }

    Ok(registry)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn scalar(s: &str) -> ConfigValue {
    ConfigValue::Scalar(s.to_string())
  }

  #[test]
  fn log_level_suffix_sets_propagation_and_level() {
    let tree = Arc::new(SourceTree::new());
    let error_sink = Arc::new(crate::error::ErrorSink::stderr(Duration::from_secs(1)));
    let configurator = Configurator::new(Arc::clone(&tree), error_sink);

    let mut top = BTreeMap::new();
    top.insert("log_level".to_string(), scalar("WARN*"));
    let config = ConfigValue::Map(top);

    configurator.configure(&config).unwrap();
    assert_eq!(tree.get(tree.root()).unwrap().effective_level(), LogLevel::Warn);
  }

  #[test]
  fn per_source_override_defines_missing_path() {
    let tree = Arc::new(SourceTree::new());
    let error_sink = Arc::new(crate::error::ErrorSink::stderr(Duration::from_secs(1)));
    let configurator = Configurator::new(Arc::clone(&tree), error_sink);

    let mut top = BTreeMap::new();
    top.insert("app.db.log_level".to_string(), scalar("DIAG"));
    let config = ConfigValue::Map(top);

    configurator.configure(&config).unwrap();
    let id = tree.lookup("app.db").unwrap();
    assert_eq!(tree.get(id).unwrap().effective_level(), LogLevel::Diag);
  }

  #[test]
  fn stdout_target_is_built_and_started() {
    let tree = Arc::new(SourceTree::new());
    let error_sink = Arc::new(crate::error::ErrorSink::stderr(Duration::from_secs(1)));
    let configurator = Configurator::new(tree, error_sink);

    let mut target_map = BTreeMap::new();
    target_map.insert("scheme".to_string(), scalar("stdout"));
    target_map.insert("name".to_string(), scalar("console"));
    let mut top = BTreeMap::new();
    top.insert("log_target".to_string(), ConfigValue::Seq(vec![ConfigValue::Map(target_map)]));
    let config = ConfigValue::Map(top);

    let registry = configurator.configure(&config).unwrap();
    assert_eq!(registry.all().len(), 1);
  }

  #[test]
  fn unknown_scheme_is_a_semantics_error() {
    let tree = Arc::new(SourceTree::new());
    let error_sink = Arc::new(crate::error::ErrorSink::stderr(Duration::from_secs(1)));
    let configurator = Configurator::new(tree, error_sink);

    let mut target_map = BTreeMap::new();
    target_map.insert("scheme".to_string(), scalar("carrier-pigeon"));
    let mut top = BTreeMap::new();
    top.insert("log_target".to_string(), ConfigValue::Seq(vec![ConfigValue::Map(target_map)]));
    let config = ConfigValue::Map(top);

    let err = configurator.configure(&config).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConfigSemantics);
  }
}
