//! Source rewriting that retargets a function's listener to an assigned port
//!
//! Functions are written against the std `serve(handler)` helper (or
//! `Deno.serve(handler)`), which listens on a default port. Before a worker is
//! launched its source is rewritten so that every such call becomes
//! `Deno.serve({ port: N }, handler)` and the std import is dropped.
//!
//! This is plain text rewriting, not parsing. Call shapes that cannot be
//! retargeted textually are reported as errors instead of producing a worker
//! that listens on the wrong port.

use regex::Regex;
use std::fmt::Write;
use std::sync::OnceLock;
use thiserror::Error;

/// Replacement left where the std `serve` import used to be
pub const IMPORT_REMOVED_MARKER: &str = "// serve import removed - using Deno.serve";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("no serve() entry point found in function source")]
    NoEntryPoint,
    #[error("serve() call on line {line} passes an options object and cannot be retargeted")]
    UnsupportedCallShape { line: usize },
}

fn serve_import() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"import\s*\{\s*serve\s*\}\s*from\s*["']https://deno\.land/std[^"']*/http/server\.ts["'];?"#)
            .expect("valid serve import regex")
    })
}

fn serve_call() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `lead` keeps member calls on other receivers (`app.serve(`) and longer
    // identifiers (`observe(`) out of the match.
    RE.get_or_init(|| {
        Regex::new(r"(?m)(?P<lead>^|[^.\w$])(?:Deno\s*\.\s*)?serve\s*\(")
            .expect("valid serve call regex")
    })
}

/// Rewrite `source` so that its listener binds `port`
pub fn transform(source: &str, port: u16) -> Result<String, TransformError> {
    let source = serve_import().replace_all(source, IMPORT_REMOVED_MARKER);

    let mut out = String::with_capacity(source.len() + 64);
    let mut last = 0;
    let mut rewritten = 0usize;

    for caps in serve_call().captures_iter(&source) {
        let call = caps.get(0).expect("group 0 is always present");
        let lead = caps.name("lead").map_or("", |m| m.as_str());
        if source[call.end()..].trim_start().starts_with('{') {
            let line = source[..call.start() + lead.len()].matches('\n').count() + 1;
            return Err(TransformError::UnsupportedCallShape { line });
        }

        out.push_str(&source[last..call.start()]);
        out.push_str(lead);
        let _ = write!(out, "Deno.serve({{ port: {} }}, ", port);
        last = call.end();
        rewritten += 1;
    }

    if rewritten == 0 {
        return Err(TransformError::NoEntryPoint);
    }

    out.push_str(&source[last..]);
    Ok(out)
}
