//! The sink-side interface a [`Formatter`](crate::formatter::Formatter)
//! drives to emit a record's fields.
//!
//! Generalizes the teacher's `listener::LogListener`/`LogFormatter` pair:
//! where the teacher had one `format(&self, event, interner, out: &mut
//! String)` method, a `FieldReceptor` is driven once per field so that
//! sinks which want structured output (JSON, DB bind parameters, protobuf)
//! can intercept individual typed values instead of re-parsing a rendered
//! string.

use crate::field_spec::FieldSpec;
use crate::level::LogLevel;

/// Per-field callbacks a formatter invokes while walking its selector
/// list against a [`Record`](crate::record::Record).
///
/// Every method has a name-aware default so a receptor only needs to
/// override the handful of builtins it cares about; unrecognized/custom
/// field names always arrive through [`string_field`](Self::string_field).
pub trait FieldReceptor {
  /// A literal run of template text between two `${...}` tokens.
  fn static_text(&mut self, text: &str);

  /// Generic string-valued field (also the fallback for builtins whose
  /// specialized callback isn't overridden).
  fn string_field(&mut self, spec: &FieldSpec, value: &str);

  /// Generic integer-valued field.
  fn int_field(&mut self, spec: &FieldSpec, value: i64) {
    self.string_field(spec, &value.to_string());
  }

  /// A timestamp field, given both the raw nanosecond value and the
  /// pre-formatted `YYYY-MM-DD HH:MM:SS.mmm` string so receptors that
  /// want raw epoch nanos (e.g. a DB column) don't have to re-parse text.
  fn time_field(&mut self, spec: &FieldSpec, raw_nanos: u64, formatted: &str) {
    let _ = raw_nanos;
    self.string_field(spec, formatted);
  }

  /// A log-level field.
  fn level_field(&mut self, spec: &FieldSpec, level: LogLevel) {
    self.string_field(spec, level.name());
  }

  // --- "by name" builtin callbacks -------------------------------------
  // Each defaults to the generic typed method above; sinks that need
  // structured output for a specific builtin (e.g. always emit `pid` as
  // a JSON number, or bind `tid` as a protobuf `uint64`) override just
  // that one hook.

  fn host_name(&mut self, spec: &FieldSpec, value: &str) {
    self.string_field(spec, value);
  }

  fn record_id(&mut self, spec: &FieldSpec, value: u64) {
    self.int_field(spec, value as i64);
  }

  fn process_id(&mut self, spec: &FieldSpec, value: u32) {
    self.int_field(spec, value as i64);
  }

  fn thread_id(&mut self, spec: &FieldSpec, value: u64) {
    self.int_field(spec, value as i64);
  }

  fn line(&mut self, spec: &FieldSpec, value: u32) {
    self.int_field(spec, value as i64);
  }
}

/// A [`FieldReceptor`] that renders everything into a single string
/// buffer, applying justification and (unless `begin_only`) an automatic
/// reset after each colored field. This is the receptor behind the
/// `plain` formatter variant (§4.1) and is reused by every other variant
/// for rendering an individual field's text before it is embedded in
/// JSON/CSV/column output.
pub struct TextReceptor<'a> {
  pub out: &'a mut String,
}

impl<'a> TextReceptor<'a> {
  pub fn new(out: &'a mut String) -> Self {
    Self { out }
  }

  fn emit(&mut self, spec: &FieldSpec, value: &str) {
    if let Some(text) = &spec.text {
      self.out.push_str(text.escape_code());
    }
    spec.justify.apply(value, self.out);
    if let Some(text) = &spec.text {
      if !text.begin_only && !text.is_empty() {
        self.out.push_str(crate::field_spec::ANSI_RESET);
      }
    }
  }
}

impl<'a> FieldReceptor for TextReceptor<'a> {
  fn static_text(&mut self, text: &str) {
    self.out.push_str(text);
  }

  fn string_field(&mut self, spec: &FieldSpec, value: &str) {
    self.emit(spec, value);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::field_spec::{Color, NamedColor, TextSpec};

  #[test]
  fn plain_field_passes_through() {
    let mut out = String::new();
    let mut receptor = TextReceptor::new(&mut out);
    receptor.static_text("hello ");
    receptor.string_field(&FieldSpec::new("msg"), "world");
    assert_eq!(out, "hello world");
  }

  #[test]
  fn colored_field_auto_resets() {
    let mut out = String::new();
    let mut receptor = TextReceptor::new(&mut out);
    let mut spec = FieldSpec::new("level");
    spec.text = Some(TextSpec::empty().with_fg(Color::Named(NamedColor::Red)));
    receptor.string_field(&spec, "ERROR");
    assert_eq!(out, "\x1b[31mERROR\x1b[0m");
  }

  #[test]
  fn begin_only_spec_skips_auto_reset() {
    let mut out = String::new();
    let mut receptor = TextReceptor::new(&mut out);
    let mut spec = FieldSpec::new("level");
    let mut text = TextSpec::empty().with_fg(Color::Named(NamedColor::Red));
    text.begin_only = true;
    spec.text = Some(text);
    receptor.string_field(&spec, "ERROR");
    assert_eq!(out, "\x1b[31mERROR");
  }
}
