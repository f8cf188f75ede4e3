//! Source-to-ESM transform boundary
//!
//! The core consumes a [`Transformer`] and treats its `deps` list as the
//! single authority for graph edges. The shipped [`EsmTransformer`] is a
//! deterministic line scanner: it collects static and dynamic import
//! specifiers, resolves relative ones against the importing file, and
//! extracts exported names. Anything smarter (a real AST pipeline) plugs in
//! behind the same trait.

use std::path::Path;

use crate::error::{HmrError, Result};
use crate::graph::ModuleId;

// FNV-1a constants for the 64-bit content hash
const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Stable FNV-1a hash of transformed content, hex-encoded.
pub fn content_hash(code: &str) -> String {
    let mut hash = FNV_OFFSET;
    for byte in code.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

/// Result of transforming one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    /// Browser-executable code
    pub code: String,
    /// Resolved module ids this module statically or dynamically imports
    pub deps: Vec<ModuleId>,
    /// Exported names (`default` for default exports)
    pub exports: Vec<String>,
    /// Optional source map
    pub map: Option<String>,
}

/// Transform boundary. Implementations must be deterministic: identical
/// inputs yield identical outputs.
pub trait Transformer: Send + Sync {
    fn transform(&self, file: &ModuleId, code: &str, hmr_enabled: bool)
        -> Result<TransformOutput>;
}

/// Hot API usage found in a module's source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HotDirectives {
    pub accepts: bool,
    pub accept_callbacks: usize,
    pub declines: bool,
    pub dispose_callbacks: usize,
}

impl HotDirectives {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Scan source for `import.meta.hot` declarations so the server-side graph
/// mirrors what the module will declare once it runs in the browser.
pub fn detect_hot_directives(code: &str) -> HotDirectives {
    let mut directives = HotDirectives::default();
    let mut rest = code;
    while let Some(pos) = rest.find("import.meta.hot.") {
        let tail = &rest[pos + "import.meta.hot.".len()..];
        if let Some(args) = tail.strip_prefix("accept(") {
            if args.trim_start().starts_with(')') {
                directives.accepts = true;
            } else {
                directives.accept_callbacks += 1;
            }
        } else if tail.starts_with("decline(") {
            directives.declines = true;
        } else if tail.starts_with("dispose(") {
            directives.dispose_callbacks += 1;
        }
        rest = &rest[pos + 1..];
    }
    directives
}

/// Line-scanning ESM transformer.
///
/// Relative specifiers (`./x`, `../y`) resolve against the importing file
/// to project-relative ids; an extensionless specifier gets `.js`. Bare
/// specifiers are external packages and produce no edge. The code passes
/// through unchanged.
#[derive(Debug, Default)]
pub struct EsmTransformer;

impl EsmTransformer {
    pub fn new() -> Self {
        Self
    }

    fn scan(&self, file: &ModuleId, code: &str) -> Result<(Vec<ModuleId>, Vec<String>)> {
        let mut deps = Vec::new();
        let mut exports = Vec::new();

        for (line_no, raw_line) in code.lines().enumerate() {
            let line = raw_line.trim();
            if line.starts_with("//") {
                continue;
            }

            if line.starts_with("import ") || line.starts_with("import'")
                || line.starts_with("import\"")
            {
                match extract_specifier(file, line, line_no) {
                    Ok(specifier) => push_resolved(&mut deps, file, &specifier),
                    // A `from` clause with no specifier is broken syntax; a
                    // bare `import {` is a statement continuing on the next
                    // line and carries its specifier there
                    Err(e) if requires_specifier(line) => return Err(e),
                    Err(_) => {}
                }
            } else if line.starts_with("export ") && line.contains(" from ") {
                let specifier = extract_specifier(file, line, line_no)?;
                push_resolved(&mut deps, file, &specifier);
                collect_export_names(line, &mut exports);
            } else if line.starts_with("export ") {
                collect_export_names(line, &mut exports);
            } else if line.starts_with('}') && line.contains(" from ") {
                // Closing line of a multi-line import/export statement
                if let Some(pos) = line.find(" from ") {
                    if let Some(spec) = read_quoted(&line[pos + " from ".len()..]) {
                        push_resolved(&mut deps, file, spec);
                    }
                }
            }

            // Dynamic imports can appear anywhere on the line
            let mut rest = line;
            while let Some(pos) = rest.find("import(") {
                let tail = &rest[pos + "import(".len()..];
                if let Some(spec) = read_quoted(tail) {
                    push_resolved(&mut deps, file, spec);
                }
                rest = &rest[pos + 1..];
            }
        }

        deps.sort();
        deps.dedup();
        exports.dedup();
        Ok((deps, exports))
    }
}

impl Transformer for EsmTransformer {
    fn transform(
        &self,
        file: &ModuleId,
        code: &str,
        _hmr_enabled: bool,
    ) -> Result<TransformOutput> {
        let (deps, exports) = self.scan(file, code)?;
        Ok(TransformOutput {
            code: code.to_string(),
            deps,
            exports,
            map: None,
        })
    }
}

/// Whether an import line must carry a quoted specifier to be well-formed.
fn requires_specifier(line: &str) -> bool {
    line.contains(" from ") || line.trim_end().ends_with(" from")
}

/// Pull the quoted specifier out of an import/re-export line.
fn extract_specifier(file: &ModuleId, line: &str, line_no: usize) -> Result<String> {
    // `import './x'` and `import defaultExport from './x'` both carry the
    // specifier as the only quoted string on the line.
    let after = match line.find(" from ") {
        Some(pos) => &line[pos + " from ".len()..],
        None => &line["import".len()..],
    };
    match read_quoted(after) {
        Some(spec) => Ok(spec.to_string()),
        None => Err(HmrError::Parse {
            file: file.to_string(),
            message: format!("missing module specifier on line {}", line_no + 1),
        }),
    }
}

fn read_quoted(s: &str) -> Option<&str> {
    let s = s.trim_start();
    let quote = s.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let rest = &s[1..];
    let end = rest.find(quote)?;
    Some(&rest[..end])
}

fn push_resolved(deps: &mut Vec<ModuleId>, file: &ModuleId, specifier: &str) {
    if let Some(resolved) = resolve_specifier(file, specifier) {
        deps.push(resolved);
    }
}

/// Resolve a relative specifier against the importing file. Bare specifiers
/// resolve to `None`.
pub fn resolve_specifier(file: &ModuleId, specifier: &str) -> Option<ModuleId> {
    if !specifier.starts_with("./") && !specifier.starts_with("../") {
        return None;
    }

    let dir = Path::new(file.as_str()).parent().unwrap_or(Path::new(""));
    let mut segments: Vec<&str> = dir
        .to_str()
        .unwrap_or("")
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    for segment in specifier.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut joined = segments.join("/");
    let has_extension = joined
        .rsplit('/')
        .next()
        .map(|last| last.contains('.'))
        .unwrap_or(false);
    if !has_extension {
        joined.push_str(".js");
    }
    Some(ModuleId::new(joined))
}

fn collect_export_names(line: &str, exports: &mut Vec<String>) {
    let rest = &line["export ".len()..];

    if rest.starts_with("default") {
        exports.push("default".to_string());
        return;
    }

    for prefix in ["async function ", "function ", "class ", "const ", "let ", "var "] {
        if let Some(tail) = rest.strip_prefix(prefix) {
            if let Some(name) = read_identifier(tail) {
                exports.push(name.to_string());
            }
            return;
        }
    }

    if let Some(tail) = rest.trim_start().strip_prefix('{') {
        let inner = match tail.find('}') {
            Some(end) => &tail[..end],
            None => tail,
        };
        for part in inner.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            // `a as b` exports `b`
            let name = match part.rsplit(" as ").next() {
                Some(aliased) => aliased.trim(),
                None => part,
            };
            if !name.is_empty() {
                exports.push(name.to_string());
            }
        }
    }
}

fn read_identifier(s: &str) -> Option<&str> {
    let end = s
        .find(|c: char| !c.is_alphanumeric() && c != '_' && c != '$')
        .unwrap_or(s.len());
    (end > 0).then(|| &s[..end])
}
