//! TypeScript challenges: types are stripped with the oxc transformer and the
//! emitted JavaScript goes through the same loop guard and harness as any
//! JavaScript challenge.
//!
//! Codegen reprints the program, so positions in guest errors and loop abort
//! messages refer to the emitted JavaScript.

use std::path::Path;

use oxc_allocator::Allocator;
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;
use oxc_transformer::{TransformOptions, Transformer};

use crate::error::SandboxError;

/// Strip TypeScript syntax from `source`, returning plain JavaScript.
///
/// Enums and namespaces are lowered, type-only declarations disappear.
/// Empty input stays empty.
pub fn strip_types(source: &str) -> Result<String, SandboxError> {
    if source.trim().is_empty() {
        return Ok(String::new());
    }

    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, source, SourceType::ts()).parse();
    if ret.panicked || !ret.errors.is_empty() {
        return Err(SandboxError::Transpile {
            reason: ret
                .errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "parser gave up on malformed input".into()),
        });
    }

    let mut program = ret.program;
    let (symbols, scopes) = SemanticBuilder::new()
        .build(&program)
        .semantic
        .into_symbol_table_and_scope_tree();
    let transformed = Transformer::new(
        &allocator,
        Path::new("challenge.ts"),
        &TransformOptions::default(),
    )
    .build_with_symbols_and_scopes(symbols, scopes, &mut program);
    if let Some(error) = transformed.errors.first() {
        return Err(SandboxError::Transpile {
            reason: error.to_string(),
        });
    }

    let code = Codegen::new().build(&program).code;
    tracing::debug!(ts_len = source.len(), js_len = code.len(), "typescript stripped");
    Ok(code)
}
