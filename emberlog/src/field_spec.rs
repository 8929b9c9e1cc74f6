//! Parsed `${name:spec...}` tokens: field name, justification, and
//! terminal text attributes/colors.
//!
//! The ANSI escape-code table here generalizes the teacher's
//! `stdout_listener` module, which hand-rolled a handful of constant
//! escape codes (`RED`, `GREEN`, ...) and a `color_level` match. Here the
//! equivalent codes are *computed* from a parsed [`TextSpec`] so that any
//! of the spec's named/bright/truecolor/vga-cube/greyscale colors and
//! attribute lists resolve to one precomputed string at parse time (§4.1:
//! "Precomputed at parse time: the terminal escape code").

use std::fmt;

/// Horizontal justification applied to a field's rendered text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JustifyMode {
  None,
  Left,
  Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Justify {
  pub mode: JustifyMode,
  pub width: usize,
}

impl Justify {
  pub const NONE: Justify = Justify {
    mode: JustifyMode::None,
    width: 0,
  };

  /// Parse the legacy integer form: positive = left, negative = right.
  pub fn from_legacy_width(n: i64) -> Justify {
    if n > 0 {
      Justify {
        mode: JustifyMode::Left,
        width: n as usize,
      }
    } else if n < 0 {
      Justify {
        mode: JustifyMode::Right,
        width: (-n) as usize,
      }
    } else {
      Justify::NONE
    }
  }

  /// Apply justification to `text`, writing into `out`.
  pub fn apply(&self, text: &str, out: &mut String) {
    let len = text.chars().count();
    match self.mode {
      JustifyMode::None => out.push_str(text),
      JustifyMode::Left => {
        out.push_str(text);
        for _ in len..self.width {
          out.push(' ');
        }
      },
      JustifyMode::Right => {
        for _ in len..self.width {
          out.push(' ');
        }
        out.push_str(text);
      },
    }
  }
}

/// A named 8-color ANSI color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedColor {
  Black,
  Red,
  Green,
  Yellow,
  Blue,
  Magenta,
  Cyan,
  White,
}

impl NamedColor {
  fn base_code(self) -> u8 {
    match self {
      NamedColor::Black => 0,
      NamedColor::Red => 1,
      NamedColor::Green => 2,
      NamedColor::Yellow => 3,
      NamedColor::Blue => 4,
      NamedColor::Magenta => 5,
      NamedColor::Cyan => 6,
      NamedColor::White => 7,
    }
  }

  pub fn parse(name: &str) -> Option<NamedColor> {
    Some(match name.to_ascii_lowercase().as_str() {
      "black" => NamedColor::Black,
      "red" => NamedColor::Red,
      "green" => NamedColor::Green,
      "yellow" => NamedColor::Yellow,
      "blue" => NamedColor::Blue,
      "magenta" => NamedColor::Magenta,
      "cyan" => NamedColor::Cyan,
      "white" => NamedColor::White,
      _ => return None,
    })
  }
}

/// A resolved color, in any of the forms §4.1 recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
  Named(NamedColor),
  BrightNamed(NamedColor),
  TrueColor(u8, u8, u8),
  /// 216-cube indexed color; components are expected in `0..=0x1F`.
  Vga(u8, u8, u8),
  /// 24-step grayscale ramp, `0..=23`.
  Grey(u8),
}

impl Color {
  fn write_escape(self, out: &mut String, foreground: bool) {
    match self {
      Color::Named(c) => {
        let base = if foreground { 30 } else { 40 };
        out.push_str(&format!("{}", base + c.base_code()));
      },
      Color::BrightNamed(c) => {
        let base = if foreground { 90 } else { 100 };
        out.push_str(&format!("{}", base + c.base_code()));
      },
      Color::TrueColor(r, g, b) => {
        let tag = if foreground { 38 } else { 48 };
        out.push_str(&format!("{};2;{};{};{}", tag, r, g, b));
      },
      Color::Vga(r, g, b) => {
        let tag = if foreground { 38 } else { 48 };
        let scale = |c: u8| ((c.min(0x1F) as u16 * 5) / 0x1F) as u16;
        let code = 16 + 36 * scale(r) + 6 * scale(g) + scale(b);
        out.push_str(&format!("{};5;{}", tag, code));
      },
      Color::Grey(n) => {
        let tag = if foreground { 38 } else { 48 };
        let code = 232 + n.min(23) as u16;
        out.push_str(&format!("{};5;{}", tag, code));
      },
    }
  }
}

/// A single SGR text attribute (`text=bold,underline`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAttr {
  Bold,
  Faint,
  Normal,
  Italic,
  NoItalic,
  Underline,
  NoUnderline,
  CrossOut,
  NoCrossOut,
  BlinkSlow,
  BlinkRapid,
  NoBlink,
}

impl TextAttr {
  fn code(self) -> u8 {
    match self {
      TextAttr::Bold => 1,
      TextAttr::Faint => 2,
      TextAttr::Normal => 22,
      TextAttr::Italic => 3,
      TextAttr::NoItalic => 23,
      TextAttr::Underline => 4,
      TextAttr::NoUnderline => 24,
      TextAttr::CrossOut => 9,
      TextAttr::NoCrossOut => 29,
      TextAttr::BlinkSlow => 5,
      TextAttr::BlinkRapid => 6,
      TextAttr::NoBlink => 25,
    }
  }

  pub fn parse(name: &str) -> Option<TextAttr> {
    Some(match name.to_ascii_lowercase().as_str() {
      "bold" => TextAttr::Bold,
      "faint" => TextAttr::Faint,
      "normal" => TextAttr::Normal,
      "italic" => TextAttr::Italic,
      "no-italic" => TextAttr::NoItalic,
      "underline" => TextAttr::Underline,
      "no-underline" => TextAttr::NoUnderline,
      "cross-out" => TextAttr::CrossOut,
      "no-cross-out" => TextAttr::NoCrossOut,
      "blink-slow" => TextAttr::BlinkSlow,
      "blink-rapid" => TextAttr::BlinkRapid,
      "no-blink" => TextAttr::NoBlink,
      _ => return None,
    })
  }
}

pub const ANSI_RESET: &str = "\x1b[0m";

/// A fully-resolved text spec: attributes plus foreground/background
/// color, precomputed into a single escape-code string at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpec {
  pub attrs: Vec<TextAttr>,
  pub fg: Option<Color>,
  pub bg: Option<Color>,
  /// `begin-*` form: apply without auto-reset at field end, so the
  /// styling can span multiple subsequent fields.
  pub begin_only: bool,
  /// `default`/`reset`: emit a bare terminal reset and ignore everything
  /// else accumulated in this spec.
  pub is_reset: bool,
  escape_code: String,
}

impl TextSpec {
  pub fn empty() -> Self {
    Self {
      attrs: Vec::new(),
      fg: None,
      bg: None,
      begin_only: false,
      is_reset: false,
      escape_code: String::new(),
    }
  }

  fn recompute(&mut self) {
    if self.is_reset {
      self.escape_code = ANSI_RESET.to_string();
      return;
    }
    let mut codes: Vec<String> = self.attrs.iter().map(|a| a.code().to_string()).collect();
    let mut color_buf = String::new();
    if let Some(fg) = self.fg {
      fg.write_escape(&mut color_buf, true);
      codes.push(color_buf.clone());
    }
    if let Some(bg) = self.bg {
      color_buf.clear();
      bg.write_escape(&mut color_buf, false);
      codes.push(color_buf.clone());
    }
    if codes.is_empty() {
      self.escape_code.clear();
    } else {
      self.escape_code = format!("\x1b[{}m", codes.join(";"));
    }
  }

  pub fn with_attr(mut self, attr: TextAttr) -> Self {
    self.attrs.push(attr);
    self.recompute();
    self
  }

  pub fn with_fg(mut self, color: Color) -> Self {
    self.fg = Some(color);
    self.recompute();
    self
  }

  pub fn with_bg(mut self, color: Color) -> Self {
    self.bg = Some(color);
    self.recompute();
    self
  }

  pub fn reset() -> Self {
    let mut spec = Self::empty();
    spec.is_reset = true;
    spec.recompute();
    spec
  }

  /// The precomputed escape sequence, or `""` if this spec is empty.
  pub fn escape_code(&self) -> &str {
    &self.escape_code
  }

  pub fn is_empty(&self) -> bool {
    self.escape_code.is_empty()
  }
}

impl fmt::Display for TextSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.escape_code)
  }
}

/// A parsed `${name[:spec...]}` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
  pub name: String,
  pub justify: Justify,
  pub text: Option<TextSpec>,
}

impl FieldSpec {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      justify: Justify::NONE,
      text: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn legacy_width_picks_direction() {
    assert_eq!(Justify::from_legacy_width(6).mode, JustifyMode::Left);
    assert_eq!(Justify::from_legacy_width(-6).mode, JustifyMode::Right);
    assert_eq!(Justify::from_legacy_width(-6).width, 6);
  }

  #[test]
  fn justify_pads_correctly() {
    let mut out = String::new();
    Justify {
      mode: JustifyMode::Right,
      width: 6,
    }
    .apply("7", &mut out);
    assert_eq!(out, "     7");
  }

  #[test]
  fn named_color_resolves_to_sgr() {
    let spec = TextSpec::empty().with_fg(Color::Named(NamedColor::Red));
    assert_eq!(spec.escape_code(), "\x1b[31m");
  }

  #[test]
  fn bright_color_uses_90_base() {
    let spec = TextSpec::empty().with_fg(Color::BrightNamed(NamedColor::Green));
    assert_eq!(spec.escape_code(), "\x1b[92m");
  }

  #[test]
  fn truecolor_emits_38_2() {
    let spec = TextSpec::empty().with_fg(Color::TrueColor(0x10, 0x20, 0x30));
    assert_eq!(spec.escape_code(), "\x1b[38;2;16;32;48m");
  }

  #[test]
  fn grey_ramp_offsets_from_232() {
    let spec = TextSpec::empty().with_fg(Color::Grey(5));
    assert_eq!(spec.escape_code(), "\x1b[38;5;237m");
  }

  #[test]
  fn reset_ignores_other_specs() {
    let spec = TextSpec::reset();
    assert_eq!(spec.escape_code(), ANSI_RESET);
  }

  #[test]
  fn multiple_attrs_join_with_semicolons() {
    let spec = TextSpec::empty()
      .with_attr(TextAttr::Bold)
      .with_attr(TextAttr::Underline)
      .with_fg(Color::Named(NamedColor::Blue));
    assert_eq!(spec.escape_code(), "\x1b[1;4;34m");
  }
}
