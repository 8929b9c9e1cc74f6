//! Level-gated logging macros (§4.9, ambient addition).
//!
//! Grounded on `ttlog-event`'s `generate_log_call` — same "parse the call
//! site into an AST, splice into a guarded `quote!` block" shape — but
//! finished: the teacher's macro only ever emitted the `Info` arm (the
//! `match` had a `_ => Info` fallback) and left the structured-event
//! builder call commented out rather than wired through. Here every
//! `LogLevel` variant gets its own macro, and the body actually calls
//! into the logger rather than `println!`-ing a placeholder.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Expr, Result as SynResult, Token};

/// `logger, "format string", args...` — the shape every level macro and
/// `log_append!` share.
struct LogCall {
  logger: Expr,
  rest: TokenStream2,
}

impl Parse for LogCall {
  fn parse(input: ParseStream) -> SynResult<Self> {
    let logger: Expr = input.parse()?;
    if input.peek(Token![,]) {
      input.parse::<Token![,]>()?;
    }
    let rest: TokenStream2 = input.parse()?;
    Ok(LogCall { logger, rest })
  }
}

/// `logger, level_expr, "format string", args...` — `log_begin!`'s shape.
struct LogBeginCall {
  logger: Expr,
  level: Expr,
  rest: TokenStream2,
}

impl Parse for LogBeginCall {
  fn parse(input: ParseStream) -> SynResult<Self> {
    let logger: Expr = input.parse()?;
    input.parse::<Token![,]>()?;
    let level: Expr = input.parse()?;
    if input.peek(Token![,]) {
      input.parse::<Token![,]>()?;
    }
    let rest: TokenStream2 = input.parse()?;
    Ok(LogBeginCall { logger, level, rest })
  }
}

/// A bare `logger` expression, for `log_end!`.
struct LoggerOnly {
  logger: Expr,
}

impl Parse for LoggerOnly {
  fn parse(input: ParseStream) -> SynResult<Self> {
    Ok(LoggerOnly { logger: input.parse()? })
  }
}

/// Synthesizes a `'static` function-name string the way
/// `function_name!`-style crates do, since Rust has no `function!()`.
fn function_name_expr() -> TokenStream2 {
  quote! {
    {
      fn __emberlog_marker() {}
      fn __emberlog_type_name_of<T>(_: T) -> &'static str {
        std::any::type_name::<T>()
      }
      __emberlog_type_name_of(__emberlog_marker)
    }
  }
}

fn generate_level_call(input: TokenStream, level: TokenStream2) -> TokenStream {
  let call = syn::parse_macro_input!(input as LogCall);
  let logger = &call.logger;
  let rest = &call.rest;
  let function_name = function_name_expr();
  let expanded = quote! {
    {
      let __emberlog_logger = &(#logger);
      if __emberlog_logger.is_level_enabled(::emberlog::level::LogLevel::#level) {
        __emberlog_logger.log_at(
          ::emberlog::level::LogLevel::#level,
          file!(),
          line!(),
          #function_name,
          format_args!(#rest),
        );
      }
    }
  };
  expanded.into()
}

macro_rules! level_macro {
  ($name:ident, $level:ident) => {
    #[proc_macro]
    pub fn $name(input: TokenStream) -> TokenStream {
      generate_level_call(input, quote! { $level })
    }
  };
}

level_macro!(fatal, Fatal);
level_macro!(error, Error);
level_macro!(warn, Warn);
level_macro!(notice, Notice);
level_macro!(info, Info);
level_macro!(trace, Trace);
level_macro!(debug, Debug);
level_macro!(diag, Diag);

/// `log_begin!(logger, level, "fmt", args...)` — opens this thread's
/// partial-record builder (§4.8 step 6).
#[proc_macro]
pub fn log_begin(input: TokenStream) -> TokenStream {
  let call = syn::parse_macro_input!(input as LogBeginCall);
  let logger = &call.logger;
  let level = &call.level;
  let rest = &call.rest;
  let function_name = function_name_expr();
  let expanded = quote! {
    (#logger).log_begin(#level, file!(), line!(), #function_name, format_args!(#rest))
  };
  expanded.into()
}

/// `log_append!(logger, "fmt", args...)` — formats into the open partial
/// record.
#[proc_macro]
pub fn log_append(input: TokenStream) -> TokenStream {
  let call = syn::parse_macro_input!(input as LogCall);
  let logger = &call.logger;
  let rest = &call.rest;
  let expanded = quote! {
    (#logger).log_append(format_args!(#rest))
  };
  expanded.into()
}

/// `log_append_nf!(logger, text_expr)` — appends `text_expr` verbatim,
/// skipping `format_args!` for call sites with nothing to interpolate.
#[proc_macro]
pub fn log_append_nf(input: TokenStream) -> TokenStream {
  let call = syn::parse_macro_input!(input as LogCall);
  let logger = &call.logger;
  let rest = &call.rest;
  let expanded = quote! {
    (#logger).log_append_nf(#rest)
  };
  expanded.into()
}

/// `log_end!(logger)` — promotes the open partial record to a normal
/// submit.
#[proc_macro]
pub fn log_end(input: TokenStream) -> TokenStream {
  let call = syn::parse_macro_input!(input as LoggerOnly);
  let logger = &call.logger;
  let expanded = quote! {
    (#logger).log_end()
  };
  expanded.into()
}
