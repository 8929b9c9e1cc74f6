//! The format engine: parses `${name[:spec[:spec…]]}` templates into an
//! ordered list of field selectors and drives a [`FieldReceptor`] over a
//! record.
//!
//! The teacher has no direct analogue (`ttlog` formats everything through
//! `tracing_subscriber`'s own layer), so this module is grounded on the
//! *shape* of the teacher's `listener::LogListener::format` contract
//! (accept an event, write into a caller buffer) generalized into a
//! proper parsed-template engine, plus the ANSI color table already
//! established in `field_spec`.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::field_spec::{Color, FieldSpec, Justify, JustifyMode, NamedColor, TextAttr, TextSpec};
use crate::level::LogLevel;
use crate::receptor::{FieldReceptor, TextReceptor};
use crate::record::Record;

/// The fixed built-in field names §4.1 recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
  Rid,
  Time,
  Host,
  User,
  Prog,
  Pid,
  Tid,
  Tname,
  File,
  Line,
  Func,
  Level,
  Src,
  Mod,
  Msg,
}

impl Builtin {
  fn parse(name: &str) -> Option<Builtin> {
    Some(match name {
      "rid" => Builtin::Rid,
      "time" => Builtin::Time,
      "host" => Builtin::Host,
      "user" => Builtin::User,
      "prog" => Builtin::Prog,
      "pid" => Builtin::Pid,
      "tid" => Builtin::Tid,
      "tname" => Builtin::Tname,
      "file" => Builtin::File,
      "line" => Builtin::Line,
      "func" => Builtin::Func,
      "level" => Builtin::Level,
      "src" => Builtin::Src,
      "mod" => Builtin::Mod,
      "msg" => Builtin::Msg,
      _ => return None,
    })
  }
}

/// A value produced by a user-defined field resolver, typed so the
/// dispatch to a [`FieldReceptor`] uses the same typed callbacks builtins
/// use.
pub enum FieldValue {
  Str(String),
  Int(i64),
  Level(LogLevel),
}

/// A user-registered field resolver.
pub type CustomResolver = Arc<dyn Fn(&RenderContext<'_>) -> FieldValue + Send + Sync>;

enum FieldKind {
  Builtin(Builtin),
  Custom(CustomResolver),
}

impl fmt::Debug for FieldKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FieldKind::Builtin(builtin) => f.debug_tuple("Builtin").field(builtin).finish(),
      FieldKind::Custom(_) => f.debug_tuple("Custom").field(&"..").finish(),
    }
  }
}

/// Extensible field-name lookup: the fixed built-in set plus
/// caller-registered names (§4.1).
#[derive(Clone, Default)]
pub struct FieldRegistry {
  custom: std::collections::HashMap<String, CustomResolver>,
}

impl FieldRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, name: impl Into<String>, resolver: CustomResolver) {
    self.custom.insert(name.into(), resolver);
  }

  fn resolve(&self, name: &str) -> Option<FieldKind> {
    if let Some(builtin) = Builtin::parse(name) {
      return Some(FieldKind::Builtin(builtin));
    }
    self.custom.get(name).cloned().map(FieldKind::Custom)
  }
}

#[derive(Debug)]
enum Selector {
  Static(String),
  Field(FieldSpec, FieldKind),
}

/// Ambient, per-render context a [`Formatter`] consults for fields that
/// don't live on a [`Record`] (process identity, the logical source
/// name, the enclosing module/thread, local-vs-UTC policy).
///
/// Module and thread-name are captured at the call site but — since
/// `Record` deliberately carries only the fields §3 names — are not
/// guaranteed to survive onto an async sink's consumer thread; callers
/// building a `RenderContext` for deferred/quantum delivery pass `""` for
/// those two and accept the degraded rendering.
pub struct RenderContext<'a> {
  pub record: &'a Record,
  pub source_name: &'a str,
  pub module: &'a str,
  pub thread_name: &'a str,
  pub utc: bool,
}

impl<'a> RenderContext<'a> {
  pub fn new(record: &'a Record, source_name: &'a str, utc: bool) -> Self {
    Self {
      record,
      source_name,
      module: "",
      thread_name: "",
      utc,
    }
  }

  pub fn with_module(mut self, module: &'a str) -> Self {
    self.module = module;
    self
  }

  pub fn with_thread_name(mut self, thread_name: &'a str) -> Self {
    self.thread_name = thread_name;
    self
  }
}

struct AmbientInfo {
  host: String,
  user: String,
  prog: String,
  pid: u32,
}

static AMBIENT: OnceLock<AmbientInfo> = OnceLock::new();

fn ambient() -> &'static AmbientInfo {
  AMBIENT.get_or_init(|| AmbientInfo {
    host: gethostname::gethostname().to_string_lossy().into_owned(),
    user: std::env::var("USER")
      .or_else(|_| std::env::var("USERNAME"))
      .unwrap_or_else(|_| "unknown".to_string()),
    prog: std::env::args().next().unwrap_or_else(|| "unknown".to_string()),
    pid: std::process::id(),
  })
}

/// A located parse error: byte offset into the template plus a rendered
/// marker line (§4.1: "identify location ... 'HERE ===>>>' marker").
#[derive(Debug, Clone)]
pub struct FormatError {
  pub offset: usize,
  pub message: String,
  template: String,
}

impl fmt::Display for FormatError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let offset = self.offset.min(self.template.len());
    let (before, after) = self.template.split_at(offset);
    write!(
      f,
      "{} (byte {}): {}| HERE ===>>> |{}",
      self.message, self.offset, before, after
    )
  }
}

impl std::error::Error for FormatError {}

fn err(offset: usize, message: String, template: &str) -> FormatError {
  FormatError {
    offset,
    message,
    template: template.to_string(),
  }
}

/// An immutable, parsed format template: an ordered list of field
/// selectors, safe to share across threads once parsed (§3 invariant).
#[derive(Debug)]
pub struct Formatter {
  selectors: Vec<Selector>,
}

impl Formatter {
  /// Parse `template` against `registry`. Parsing is total: every
  /// template either parses fully or fails with a located
  /// [`FormatError`] (§4.1 invariant).
  pub fn parse(template: &str, registry: &FieldRegistry) -> Result<Formatter, FormatError> {
    let mut selectors = Vec::new();
    let mut literal_start = 0usize;
    let bytes = template.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
      if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
        if i > literal_start {
          selectors.push(Selector::Static(template[literal_start..i].to_string()));
        }
        let token_start = i + 2;
        let end = template[token_start..].find('}').map(|p| token_start + p).ok_or_else(|| {
          err(i, "unterminated ${...} field token".to_string(), template)
        })?;
        let token = &template[token_start..end];
        selectors.push(parse_token(token, token_start, registry, template)?);
        i = end + 1;
        literal_start = i;
      } else {
        i += 1;
      }
    }
    if literal_start < bytes.len() {
      selectors.push(Selector::Static(template[literal_start..].to_string()));
    }
    Ok(Formatter { selectors })
  }

  /// Drive `receptor` over every selector for `ctx`.
  pub fn render_into(&self, ctx: &RenderContext<'_>, receptor: &mut dyn FieldReceptor) {
    for selector in &self.selectors {
      match selector {
        Selector::Static(text) => receptor.static_text(text),
        Selector::Field(spec, kind) => dispatch_field(ctx, spec, kind, receptor),
      }
    }
  }

  /// Render to a plain string via [`TextReceptor`] — the plain-text
  /// formatter variant, and the value renderer every structured variant
  /// uses per field (§3: "structured properties ... values are
  /// sub-formatters").
  pub fn render_text(&self, ctx: &RenderContext<'_>) -> String {
    let mut out = String::new();
    let mut receptor = TextReceptor::new(&mut out);
    self.render_into(ctx, &mut receptor);
    out
  }
}

fn dispatch_field(
  ctx: &RenderContext<'_>,
  spec: &FieldSpec,
  kind: &FieldKind,
  receptor: &mut dyn FieldReceptor,
) {
  match kind {
    FieldKind::Builtin(builtin) => dispatch_builtin(ctx, spec, *builtin, receptor),
    FieldKind::Custom(resolver) => match resolver(ctx) {
      FieldValue::Str(s) => receptor.string_field(spec, &s),
      FieldValue::Int(n) => receptor.int_field(spec, n),
      FieldValue::Level(l) => receptor.level_field(spec, l),
    },
  }
}

fn dispatch_builtin(
  ctx: &RenderContext<'_>,
  spec: &FieldSpec,
  builtin: Builtin,
  receptor: &mut dyn FieldReceptor,
) {
  let record = ctx.record;
  match builtin {
    Builtin::Rid => receptor.record_id(spec, record.record_id),
    Builtin::Time => {
      let formatted = crate::time::format_epoch_nanos(record.timestamp_nanos, ctx.utc);
      receptor.time_field(spec, record.timestamp_nanos, &formatted);
    },
    Builtin::Host => receptor.host_name(spec, &ambient().host),
    Builtin::User => receptor.string_field(spec, &ambient().user),
    Builtin::Prog => receptor.string_field(spec, &ambient().prog),
    Builtin::Pid => receptor.process_id(spec, ambient().pid),
    Builtin::Tid => receptor.thread_id(spec, record.thread_id),
    Builtin::Tname => receptor.string_field(spec, ctx.thread_name),
    Builtin::File => receptor.string_field(spec, record.file),
    Builtin::Line => receptor.line(spec, record.line),
    Builtin::Func => receptor.string_field(spec, record.function),
    Builtin::Level => receptor.level_field(spec, record.level),
    Builtin::Src => receptor.string_field(spec, ctx.source_name),
    Builtin::Mod => receptor.string_field(spec, ctx.module),
    Builtin::Msg => receptor.string_field(spec, &record.message),
  }
}

fn parse_token(
  token: &str,
  token_offset: usize,
  registry: &FieldRegistry,
  template: &str,
) -> Result<Selector, FormatError> {
  let mut parts = token.split(':');
  let name = parts.next().unwrap_or("");
  let kind = registry
    .resolve(name)
    .ok_or_else(|| err(token_offset, format!("unknown field name {:?}", name), template))?;

  let mut justify = Justify::NONE;
  let mut attrs: Vec<TextAttr> = Vec::new();
  let mut fg: Option<Color> = None;
  let mut bg: Option<Color> = None;
  let mut begin_only = false;
  let mut is_reset = false;

  let mut offset = token_offset + name.len() + 1;
  for part in parts {
    apply_spec_token(
      part, offset, &mut justify, &mut attrs, &mut fg, &mut bg, &mut begin_only, &mut is_reset, template,
    )?;
    offset += part.len() + 1;
  }

  let text = if is_reset {
    Some(TextSpec::reset())
  } else if !attrs.is_empty() || fg.is_some() || bg.is_some() {
    let mut spec = TextSpec::empty();
    for attr in attrs {
      spec = spec.with_attr(attr);
    }
    if let Some(color) = fg {
      spec = spec.with_fg(color);
    }
    if let Some(color) = bg {
      spec = spec.with_bg(color);
    }
    spec.begin_only = begin_only;
    Some(spec)
  } else {
    None
  };

  let mut spec = FieldSpec::new(name);
  spec.justify = justify;
  spec.text = text;
  Ok(Selector::Field(spec, kind))
}

#[allow(clippy::too_many_arguments)]
fn apply_spec_token(
  raw: &str,
  offset: usize,
  justify: &mut Justify,
  attrs: &mut Vec<TextAttr>,
  fg: &mut Option<Color>,
  bg: &mut Option<Color>,
  begin_only: &mut bool,
  is_reset: &mut bool,
  template: &str,
) -> Result<(), FormatError> {
  let (token, is_begin) = match raw.strip_prefix("begin-") {
    Some(rest) => (rest, true),
    None => (raw, false),
  };
  if is_begin {
    *begin_only = true;
  }

  if token == "default" || token == "reset" {
    *is_reset = true;
    return Ok(());
  }
  if let Ok(n) = token.parse::<i64>() {
    *justify = Justify::from_legacy_width(n);
    return Ok(());
  }
  if let Some(value) = token.strip_prefix("justify-left=") {
    let width: usize = value
      .parse()
      .map_err(|_| err(offset, format!("invalid justify-left width {:?}", value), template))?;
    *justify = Justify {
      mode: JustifyMode::Left,
      width,
    };
    return Ok(());
  }
  if let Some(value) = token.strip_prefix("justify-right=") {
    let width: usize = value
      .parse()
      .map_err(|_| err(offset, format!("invalid justify-right width {:?}", value), template))?;
    *justify = Justify {
      mode: JustifyMode::Right,
      width,
    };
    return Ok(());
  }
  if let Some(value) = token.strip_prefix("fg-color=") {
    *fg = Some(
      parse_color(value).ok_or_else(|| err(offset, format!("invalid color {:?}", value), template))?,
    );
    return Ok(());
  }
  if let Some(value) = token.strip_prefix("bg-color=") {
    *bg = Some(
      parse_color(value).ok_or_else(|| err(offset, format!("invalid color {:?}", value), template))?,
    );
    return Ok(());
  }
  if let Some(value) = token.strip_prefix("text=") {
    for attr_name in value.split(',') {
      let attr = TextAttr::parse(attr_name)
        .ok_or_else(|| err(offset, format!("invalid text attribute {:?}", attr_name), template))?;
      attrs.push(attr);
    }
    return Ok(());
  }
  Err(err(offset, format!("unrecognized field spec {:?}", raw), template))
}

fn parse_color(value: &str) -> Option<Color> {
  if let Some(hex) = value.strip_prefix('#') {
    return parse_hex6(hex).map(|(r, g, b)| Color::TrueColor(r, g, b));
  }
  if let Some(hex) = value.strip_prefix("vga#") {
    return parse_hex6(hex).map(|(r, g, b)| Color::Vga(r, g, b));
  }
  if let Some(n) = value.strip_prefix("grey#") {
    return n.parse::<u8>().ok().map(Color::Grey);
  }
  if let Some(name) = value.strip_prefix("bright-") {
    return NamedColor::parse(name).map(Color::BrightNamed);
  }
  NamedColor::parse(value).map(Color::Named)
}

fn parse_hex6(hex: &str) -> Option<(u8, u8, u8)> {
  if hex.len() != 6 {
    return None;
  }
  let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
  let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
  let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
  Some((r, g, b))
}

/// What a [`StructuredFormatter`] variant produces; sinks match on this
/// instead of re-parsing a rendered string (§3: JSON / column / CSV /
/// message-queue-header variants).
pub enum RenderedOutput {
  Text(String),
  Json(serde_json::Value),
  Row(Vec<String>),
  Headers(Vec<(String, String)>),
}

/// The formatter variants §3 describes, layered on top of [`Formatter`]:
/// each named value is itself an independently parsed plain template.
#[derive(Debug)]
pub enum StructuredFormatter {
  Plain(Formatter),
  Properties(Vec<(String, Formatter)>),
  Json(Vec<(String, Formatter)>),
  Column(Vec<Formatter>),
  Csv(Vec<Formatter>),
  MqHeaders(Vec<(String, Formatter)>),
}

impl StructuredFormatter {
  pub fn render(&self, ctx: &RenderContext<'_>) -> RenderedOutput {
    match self {
      StructuredFormatter::Plain(formatter) => RenderedOutput::Text(formatter.render_text(ctx)),
      StructuredFormatter::Properties(fields) => {
        let joined = fields
          .iter()
          .map(|(name, formatter)| format!("{}={}", name, formatter.render_text(ctx)))
          .collect::<Vec<_>>()
          .join(" ");
        RenderedOutput::Text(joined)
      },
      StructuredFormatter::Json(fields) => {
        let mut map = serde_json::Map::with_capacity(fields.len());
        for (name, formatter) in fields {
          map.insert(name.clone(), serde_json::Value::String(formatter.render_text(ctx)));
        }
        RenderedOutput::Json(serde_json::Value::Object(map))
      },
      StructuredFormatter::Column(fields) => {
        RenderedOutput::Row(fields.iter().map(|f| f.render_text(ctx)).collect())
      },
      StructuredFormatter::Csv(fields) => {
        let joined = fields.iter().map(|f| f.render_text(ctx)).collect::<Vec<_>>().join(",");
        RenderedOutput::Text(joined)
      },
      StructuredFormatter::MqHeaders(fields) => RenderedOutput::Headers(
        fields
          .iter()
          .map(|(name, formatter)| (name.clone(), formatter.render_text(ctx)))
          .collect(),
      ),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::Record;
  use crate::source::SourceId;

  fn sample_record() -> Record {
    Record::new(
      1_700_000_000_000_000_000,
      LogLevel::Warn,
      42,
      SourceId(0),
      "src/main.rs",
      17,
      "do_thing",
      "disk at 90%".to_string(),
    )
  }

  #[test]
  fn plain_template_renders_static_and_fields() {
    let registry = FieldRegistry::new();
    let formatter = Formatter::parse("[${level}] ${msg}", &registry).unwrap();
    let record = sample_record();
    let ctx = RenderContext::new(&record, "app.disk", true);
    assert_eq!(formatter.render_text(&ctx), "[WARN] disk at 90%");
  }

  #[test]
  fn justify_and_color_spec_compose() {
    let registry = FieldRegistry::new();
    let formatter = Formatter::parse("${level:justify-right=7:fg-color=red}", &registry).unwrap();
    let record = sample_record();
    let ctx = RenderContext::new(&record, "app", true);
    assert_eq!(formatter.render_text(&ctx), "\x1b[31m   WARN\x1b[0m");
  }

  #[test]
  fn unknown_field_name_fails_parse() {
    let registry = FieldRegistry::new();
    let err = Formatter::parse("${bogus}", &registry).unwrap_err();
    assert!(err.to_string().contains("unknown field name"));
  }

  #[test]
  fn unterminated_token_fails_parse() {
    let registry = FieldRegistry::new();
    let err = Formatter::parse("${msg", &registry).unwrap_err();
    assert!(err.to_string().contains("unterminated"));
  }

  #[test]
  fn custom_field_resolves_through_registry() {
    let mut registry = FieldRegistry::new();
    registry.register(
      "team",
      Arc::new(|_ctx: &RenderContext<'_>| FieldValue::Str("platform".to_string())),
    );
    let formatter = Formatter::parse("${team}/${msg}", &registry).unwrap();
    let record = sample_record();
    let ctx = RenderContext::new(&record, "app", true);
    assert_eq!(formatter.render_text(&ctx), "platform/disk at 90%");
  }

  #[test]
  fn properties_variant_renders_key_value_pairs() {
    let registry = FieldRegistry::new();
    let level = Formatter::parse("${level}", &registry).unwrap();
    let msg = Formatter::parse("${msg}", &registry).unwrap();
    let structured = StructuredFormatter::Properties(vec![
      ("level".to_string(), level),
      ("msg".to_string(), msg),
    ]);
    let record = sample_record();
    let ctx = RenderContext::new(&record, "app", true);
    match structured.render(&ctx) {
      RenderedOutput::Text(text) => assert_eq!(text, "level=WARN msg=disk at 90%"),
      _ => panic!("expected text output"),
    }
  }

  #[test]
  fn json_variant_renders_object() {
    let registry = FieldRegistry::new();
    let msg = Formatter::parse("${msg}", &registry).unwrap();
    let structured = StructuredFormatter::Json(vec![("msg".to_string(), msg)]);
    let record = sample_record();
    let ctx = RenderContext::new(&record, "app", true);
    match structured.render(&ctx) {
      RenderedOutput::Json(value) => assert_eq!(value["msg"], "disk at 90%"),
      _ => panic!("expected json output"),
    }
  }

  #[test]
  fn csv_variant_joins_with_commas() {
    let registry = FieldRegistry::new();
    let rid = Formatter::parse("${rid}", &registry).unwrap();
    let level = Formatter::parse("${level}", &registry).unwrap();
    let structured = StructuredFormatter::Csv(vec![rid, level]);
    let record = sample_record();
    let ctx = RenderContext::new(&record, "app", true);
    match structured.render(&ctx) {
      RenderedOutput::Text(text) => assert!(text.ends_with(",WARN")),
      _ => panic!("expected text output"),
    }
  }
}
