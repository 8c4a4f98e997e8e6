//! Loop protection: a source-to-source transform that puts a time budget on
//! every `while`, `for` and `do-while` loop.
//!
//! The source is parsed with `oxc_parser` and walked for loop statements. Each
//! loop gets a uniquely named timestamp binding declared just before it, and a
//! guard as the first statement of its body:
//!
//! ```text
//! let __pairwise_loop_0 = Date.now(); while (x) {if (Date.now() - __pairwise_loop_0 > 100) { ... } ...}
//! ```
//!
//! Edits are collected as typed [`Injection`]s anchored at AST span offsets and
//! spliced into the original text in one pass. No newlines are ever inserted,
//! so line numbers in guest stack traces still match the learner's editor.
//!
//! By default the source is parsed the way the harness runs it: as the body
//! of a sloppy-mode async function in a script. Module sources (with `import`
//! and `export`) need [`LoopGuardConfig::module`].

use std::borrow::Cow;
use std::time::Duration;

use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType, Span};
use regex::Regex;
use thiserror::Error;

/// Prefix of every injected timestamp binding. Guest code may not use it.
pub const GUARD_PREFIX: &str = "__pairwise_loop_";

/// Default loop budget.
pub const DEFAULT_LOOP_TIMEOUT: Duration = Duration::from_millis(100);

// Script sources are parsed inside this wrapper. The opener has no newline,
// so only columns on the first line need the offset.
const SCRIPT_OPEN: &str = "(async () => {";
const SCRIPT_CLOSE: &str = "\n});";

/// Errors raised by the transform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopGuardError {
    /// The source does not parse.
    #[error("SyntaxError: {0}")]
    Parse(String),

    /// The source already contains guard bindings.
    #[error("code already contains loop guards (identifiers starting with `{GUARD_PREFIX}` are reserved)")]
    AlreadyInstrumented,

    /// The abort callback is not a plain identifier path.
    #[error("invalid loop abort callback `{0}`: expected an identifier path such as `report` or `host.onLoop`")]
    InvalidCallback(String),
}

/// Transform configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopGuardConfig {
    /// Wall-clock budget per loop, measured from the moment the loop is entered.
    pub timeout: Duration,
    /// Function called with `(line, column)` before breaking out of the loop.
    /// When `None`, the guard throws an `InfiniteLoopError` instead.
    pub callback: Option<String>,
    /// Parse as a strict ES module instead of a function body.
    pub module: bool,
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_LOOP_TIMEOUT)
    }
}

impl LoopGuardConfig {
    /// A config with the given budget and the default throwing abort.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            callback: None,
            module: false,
        }
    }

    /// Set the abort callback.
    pub fn callback(mut self, name: impl Into<String>) -> Self {
        self.callback = Some(name.into());
        self
    }

    /// Treat sources as ES modules.
    pub fn module(mut self) -> Self {
        self.module = true;
        self
    }

    fn validate(&self) -> Result<(), LoopGuardError> {
        let Some(callback) = &self.callback else {
            return Ok(());
        };
        let path = Regex::new(r"^[A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)*$")
            .map_err(|e| LoopGuardError::InvalidCallback(e.to_string()))?;
        if path.is_match(callback) {
            Ok(())
        } else {
            Err(LoopGuardError::InvalidCallback(callback.clone()))
        }
    }
}

/// Syntactic kind of an instrumented loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// `while (test) body`
    While,
    /// `for (init; test; update) body`
    For,
    /// `do body while (test)`
    DoWhile,
}

/// A loop the transform instrumented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSite {
    /// Loop kind.
    pub kind: LoopKind,
    /// 1-based line of the loop keyword.
    pub line: u32,
    /// 0-based column of the loop keyword, in characters.
    pub column: u32,
    /// Name of the timestamp binding guarding this loop.
    pub guard: String,
}

/// Result of [`instrument`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrumented {
    /// The rewritten source.
    pub code: String,
    /// Every instrumented loop, in source order.
    pub loops: Vec<LoopSite>,
}

/// A piece of code inserted into the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    /// `let <ident> = Date.now();`, placed before the loop and its labels.
    GuardDeclaration {
        /// The timestamp binding.
        ident: String,
    },
    /// The budget check placed first in the loop body.
    Guard {
        /// The timestamp binding.
        ident: String,
        /// Line reported on abort.
        line: u32,
        /// Column reported on abort.
        column: u32,
    },
    /// `{`, opening a synthesized block.
    BlockOpen,
    /// `}`, closing a synthesized block.
    BlockClose,
}

impl Injection {
    fn render(&self, config: &LoopGuardConfig) -> String {
        match self {
            Self::GuardDeclaration { ident } => format!("let {ident} = Date.now(); "),
            Self::Guard {
                ident,
                line,
                column,
            } => {
                let ms = config.timeout.as_millis();
                let abort = match &config.callback {
                    Some(callback) => format!("{callback}({line}, {column}); break;"),
                    None => format!(
                        "throw Object.assign(new Error(\"Potential infinite loop detected at line {line}, column {column}\"), {{ name: \"InfiniteLoopError\" }});"
                    ),
                };
                format!("if (Date.now() - {ident} > {ms}) {{ {abort} }} ")
            }
            Self::BlockOpen => "{".into(),
            Self::BlockClose => "}".into(),
        }
    }
}

/// An injection anchored at a byte offset.
///
/// `depth` is the nesting level of the synthesized construct: a loop at loop
/// depth `d` wraps itself at `2d` and its body at `2d + 1`. At a shared
/// offset, closing braces go first (innermost first), then openers and
/// statements (outermost first).
#[derive(Debug)]
struct Placed {
    pos: u32,
    depth: u32,
    injection: Injection,
}

impl Placed {
    fn sort_key(&self) -> (u32, u8, u32, u8) {
        match self.injection {
            Injection::BlockClose => (self.pos, 0, u32::MAX - self.depth, 0),
            Injection::BlockOpen => (self.pos, 1, self.depth, 0),
            _ => (self.pos, 1, self.depth, 1),
        }
    }
}

/// Instrument one source text. Guard names start at `__pairwise_loop_0`.
pub fn instrument(code: &str, config: &LoopGuardConfig) -> Result<Instrumented, LoopGuardError> {
    LoopGuard::new(config.clone())?.instrument(code)
}

/// A transform that keeps numbering guards across calls.
///
/// Code and test code run in one scope, so instrumenting both with the same
/// `LoopGuard` keeps their guard bindings from colliding.
#[derive(Debug, Clone)]
pub struct LoopGuard {
    config: LoopGuardConfig,
    next_id: usize,
}

impl LoopGuard {
    /// Create a transform, validating the callback name.
    pub fn new(config: LoopGuardConfig) -> Result<Self, LoopGuardError> {
        config.validate()?;
        Ok(Self { config, next_id: 0 })
    }

    /// The active configuration.
    pub fn config(&self) -> &LoopGuardConfig {
        &self.config
    }

    /// Instrument `code`, continuing the guard numbering of earlier calls.
    pub fn instrument(&mut self, code: &str) -> Result<Instrumented, LoopGuardError> {
        if code.contains(GUARD_PREFIX) {
            return Err(LoopGuardError::AlreadyInstrumented);
        }

        let (source, base, source_type) = if self.config.module {
            (Cow::Borrowed(code), 0, SourceType::mjs())
        } else {
            (
                Cow::Owned(format!("{SCRIPT_OPEN}{code}{SCRIPT_CLOSE}")),
                SCRIPT_OPEN.len() as u32,
                SourceType::cjs(),
            )
        };

        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, &source, source_type).parse();
        if ret.panicked || !ret.errors.is_empty() {
            return Err(LoopGuardError::Parse(
                ret.errors
                    .first()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "parser gave up on malformed input".into()),
            ));
        }

        let mut collector = LoopCollector {
            source: &source,
            base,
            next_id: self.next_id,
            placed: Vec::new(),
            loops: Vec::new(),
        };
        collector.walk_statements(&ret.program.body, 0);
        self.next_id = collector.next_id;

        let LoopCollector {
            mut placed, loops, ..
        } = collector;
        placed.sort_by_key(Placed::sort_key);

        let mut out = String::with_capacity(code.len() + placed.len() * 96);
        let mut cursor = 0usize;
        for p in &placed {
            let pos = (p.pos - base) as usize;
            out.push_str(&code[cursor..pos]);
            out.push_str(&p.injection.render(&self.config));
            cursor = pos;
        }
        out.push_str(&code[cursor..]);

        Ok(Instrumented { code: out, loops })
    }
}

/// Where a loop statement sits, so its declaration has somewhere to go.
#[derive(Debug, Clone, Copy)]
struct Placement {
    /// Start of the statement including any labels.
    start: u32,
    /// End of the statement.
    end: u32,
    /// Whether the statement is directly inside a statement list.
    in_list: bool,
}

struct LoopCollector<'s> {
    /// The parsed text, which may include the script wrapper.
    source: &'s str,
    /// Offset of the guest code within `source`.
    base: u32,
    next_id: usize,
    placed: Vec<Placed>,
    loops: Vec<LoopSite>,
}

impl LoopCollector<'_> {
    fn place(&mut self, pos: u32, depth: u32, injection: Injection) {
        self.placed.push(Placed {
            pos,
            depth,
            injection,
        });
    }

    /// 1-based line, 0-based character column of a byte offset.
    fn position(&self, offset: u32) -> (u32, u32) {
        let before = &self.source[self.base as usize..offset as usize];
        let line = before.matches('\n').count() as u32 + 1;
        let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let column = before[line_start..].chars().count() as u32;
        (line, column)
    }

    fn instrument_loop(
        &mut self,
        kind: LoopKind,
        span: Span,
        body: &Statement<'_>,
        depth: u32,
        placement: Placement,
    ) {
        // Synthesized nodes carry an empty span and have no text to anchor on.
        if span.start == 0 && span.end == 0 {
            self.walk_statement(body, depth + 1, false);
            return;
        }

        let ident = format!("{GUARD_PREFIX}{}", self.next_id);
        self.next_id += 1;
        let (line, column) = self.position(span.start);
        self.loops.push(LoopSite {
            kind,
            line,
            column,
            guard: ident.clone(),
        });

        let outer = depth * 2;
        if !placement.in_list {
            self.place(placement.start, outer, Injection::BlockOpen);
            self.place(placement.end, outer, Injection::BlockClose);
        }
        self.place(
            placement.start,
            outer,
            Injection::GuardDeclaration {
                ident: ident.clone(),
            },
        );

        let guard = Injection::Guard {
            ident,
            line,
            column,
        };
        let inner = outer + 1;
        match body {
            Statement::BlockStatement(block) => {
                self.place(block.span.start + 1, inner, guard);
                self.walk_statements(&block.body, depth + 1);
            }
            other => {
                let body_span = other.span();
                self.place(body_span.start, inner, Injection::BlockOpen);
                self.place(body_span.start, inner, guard);
                self.place(body_span.end, inner, Injection::BlockClose);
                // The synthesized block is a statement list for whatever the body holds.
                self.walk_statement(other, depth + 1, true);
            }
        }
    }

    fn walk_statements(&mut self, statements: &[Statement<'_>], depth: u32) {
        for stmt in statements {
            self.walk_statement(stmt, depth, true);
        }
    }

    fn walk_statement(&mut self, stmt: &Statement<'_>, depth: u32, in_list: bool) {
        let span = stmt.span();
        self.walk_statement_at(
            stmt,
            depth,
            Placement {
                start: span.start,
                end: span.end,
                in_list,
            },
        );
    }

    fn walk_statement_at(&mut self, stmt: &Statement<'_>, depth: u32, placement: Placement) {
        match stmt {
            Statement::WhileStatement(ws) => {
                self.walk_expression(&ws.test, depth);
                self.instrument_loop(LoopKind::While, ws.span, &ws.body, depth, placement);
            }
            Statement::DoWhileStatement(dws) => {
                self.walk_expression(&dws.test, depth);
                self.instrument_loop(LoopKind::DoWhile, dws.span, &dws.body, depth, placement);
            }
            Statement::ForStatement(fs) => {
                if let Some(init) = &fs.init {
                    match init {
                        ForStatementInit::VariableDeclaration(decl) => {
                            self.walk_declaration(decl, depth)
                        }
                        _ => {
                            if let Some(expr) = init.as_expression() {
                                self.walk_expression(expr, depth);
                            }
                        }
                    }
                }
                if let Some(test) = &fs.test {
                    self.walk_expression(test, depth);
                }
                if let Some(update) = &fs.update {
                    self.walk_expression(update, depth);
                }
                self.instrument_loop(LoopKind::For, fs.span, &fs.body, depth, placement);
            }
            // Labels stay attached to their loop; the declaration goes before them.
            Statement::LabeledStatement(ls) => self.walk_statement_at(&ls.body, depth, placement),
            Statement::ForInStatement(fis) => {
                self.walk_expression(&fis.right, depth);
                self.walk_statement(&fis.body, depth, false);
            }
            Statement::ForOfStatement(fos) => {
                self.walk_expression(&fos.right, depth);
                self.walk_statement(&fos.body, depth, false);
            }
            Statement::BlockStatement(block) => self.walk_statements(&block.body, depth),
            Statement::IfStatement(ifs) => {
                self.walk_expression(&ifs.test, depth);
                self.walk_statement(&ifs.consequent, depth, false);
                if let Some(alt) = &ifs.alternate {
                    self.walk_statement(alt, depth, false);
                }
            }
            Statement::SwitchStatement(ss) => {
                self.walk_expression(&ss.discriminant, depth);
                for case in &ss.cases {
                    if let Some(test) = &case.test {
                        self.walk_expression(test, depth);
                    }
                    self.walk_statements(&case.consequent, depth);
                }
            }
            Statement::TryStatement(ts) => {
                self.walk_statements(&ts.block.body, depth);
                if let Some(handler) = &ts.handler {
                    if let Some(param) = &handler.param {
                        self.walk_binding(&param.pattern, depth);
                    }
                    self.walk_statements(&handler.body.body, depth);
                }
                if let Some(finalizer) = &ts.finalizer {
                    self.walk_statements(&finalizer.body, depth);
                }
            }
            Statement::ExpressionStatement(es) => self.walk_expression(&es.expression, depth),
            Statement::ReturnStatement(ret) => {
                if let Some(arg) = &ret.argument {
                    self.walk_expression(arg, depth);
                }
            }
            Statement::ThrowStatement(ts) => self.walk_expression(&ts.argument, depth),
            Statement::VariableDeclaration(decl) => self.walk_declaration(decl, depth),
            Statement::FunctionDeclaration(fd) => self.walk_function(fd, depth),
            Statement::ClassDeclaration(cd) => self.walk_class(cd, depth),
            Statement::WithStatement(ws) => {
                self.walk_expression(&ws.object, depth);
                self.walk_statement(&ws.body, depth, false);
            }
            Statement::ExportNamedDeclaration(export) => match &export.declaration {
                Some(Declaration::VariableDeclaration(decl)) => self.walk_declaration(decl, depth),
                Some(Declaration::FunctionDeclaration(fd)) => self.walk_function(fd, depth),
                Some(Declaration::ClassDeclaration(cd)) => self.walk_class(cd, depth),
                _ => {}
            },
            Statement::ExportDefaultDeclaration(export) => match &export.declaration {
                ExportDefaultDeclarationKind::FunctionDeclaration(fd) => {
                    self.walk_function(fd, depth)
                }
                ExportDefaultDeclarationKind::ClassDeclaration(cd) => self.walk_class(cd, depth),
                other => {
                    if let Some(expr) = other.as_expression() {
                        self.walk_expression(expr, depth);
                    }
                }
            },
            _ => {}
        }
    }

    fn walk_declaration(&mut self, decl: &VariableDeclaration<'_>, depth: u32) {
        for declarator in &decl.declarations {
            self.walk_binding(&declarator.id, depth);
            if let Some(init) = &declarator.init {
                self.walk_expression(init, depth);
            }
        }
    }

    /// Default values and computed keys inside a binding pattern.
    fn walk_binding(&mut self, pattern: &BindingPattern<'_>, depth: u32) {
        match &pattern.kind {
            BindingPatternKind::BindingIdentifier(_) => {}
            BindingPatternKind::AssignmentPattern(assign) => {
                self.walk_binding(&assign.left, depth);
                self.walk_expression(&assign.right, depth);
            }
            BindingPatternKind::ObjectPattern(obj) => {
                for prop in &obj.properties {
                    self.walk_key(&prop.key, depth);
                    self.walk_binding(&prop.value, depth);
                }
                if let Some(rest) = &obj.rest {
                    self.walk_binding(&rest.argument, depth);
                }
            }
            BindingPatternKind::ArrayPattern(arr) => {
                for elem in arr.elements.iter().flatten() {
                    self.walk_binding(elem, depth);
                }
                if let Some(rest) = &arr.rest {
                    self.walk_binding(&rest.argument, depth);
                }
            }
        }
    }

    fn walk_params(&mut self, params: &FormalParameters<'_>, depth: u32) {
        for param in &params.items {
            self.walk_binding(&param.pattern, depth);
        }
        if let Some(rest) = &params.rest {
            self.walk_binding(&rest.argument, depth);
        }
    }

    /// Computed keys are the only keys that hold expressions worth walking.
    fn walk_key(&mut self, key: &PropertyKey<'_>, depth: u32) {
        if let Some(expr) = key.as_expression() {
            self.walk_expression(expr, depth);
        }
    }

    fn walk_function(&mut self, func: &Function<'_>, depth: u32) {
        self.walk_params(&func.params, depth);
        if let Some(body) = &func.body {
            self.walk_statements(&body.statements, depth);
        }
    }

    fn walk_class(&mut self, class: &Class<'_>, depth: u32) {
        if let Some(super_class) = &class.super_class {
            self.walk_expression(super_class, depth);
        }
        for element in &class.body.body {
            match element {
                ClassElement::MethodDefinition(md) => {
                    self.walk_key(&md.key, depth);
                    self.walk_function(&md.value, depth);
                }
                ClassElement::PropertyDefinition(pd) => {
                    self.walk_key(&pd.key, depth);
                    if let Some(value) = &pd.value {
                        self.walk_expression(value, depth);
                    }
                }
                ClassElement::AccessorProperty(ap) => {
                    self.walk_key(&ap.key, depth);
                    if let Some(value) = &ap.value {
                        self.walk_expression(value, depth);
                    }
                }
                ClassElement::StaticBlock(sb) => self.walk_statements(&sb.body, depth),
                _ => {}
            }
        }
    }

    fn walk_arguments(&mut self, args: &[Argument<'_>], depth: u32) {
        for arg in args {
            match arg {
                Argument::SpreadElement(spread) => self.walk_expression(&spread.argument, depth),
                _ => {
                    if let Some(expr) = arg.as_expression() {
                        self.walk_expression(expr, depth);
                    }
                }
            }
        }
    }

    fn walk_expression(&mut self, expr: &Expression<'_>, depth: u32) {
        match expr {
            Expression::FunctionExpression(func) => self.walk_function(func, depth),
            Expression::ArrowFunctionExpression(arrow) => {
                self.walk_params(&arrow.params, depth);
                self.walk_statements(&arrow.body.statements, depth);
            }
            Expression::ClassExpression(class) => self.walk_class(class, depth),
            Expression::CallExpression(call) => {
                self.walk_expression(&call.callee, depth);
                self.walk_arguments(&call.arguments, depth);
            }
            Expression::NewExpression(new_expr) => {
                self.walk_expression(&new_expr.callee, depth);
                self.walk_arguments(&new_expr.arguments, depth);
            }
            Expression::StaticMemberExpression(member) => {
                self.walk_expression(&member.object, depth)
            }
            Expression::ComputedMemberExpression(member) => {
                self.walk_expression(&member.object, depth);
                self.walk_expression(&member.expression, depth);
            }
            Expression::TaggedTemplateExpression(tagged) => {
                self.walk_expression(&tagged.tag, depth);
                for e in &tagged.quasi.expressions {
                    self.walk_expression(e, depth);
                }
            }
            Expression::TemplateLiteral(tl) => {
                for e in &tl.expressions {
                    self.walk_expression(e, depth);
                }
            }
            Expression::AssignmentExpression(assign) => self.walk_expression(&assign.right, depth),
            Expression::BinaryExpression(bin) => {
                self.walk_expression(&bin.left, depth);
                self.walk_expression(&bin.right, depth);
            }
            Expression::LogicalExpression(log) => {
                self.walk_expression(&log.left, depth);
                self.walk_expression(&log.right, depth);
            }
            Expression::ConditionalExpression(cond) => {
                self.walk_expression(&cond.test, depth);
                self.walk_expression(&cond.consequent, depth);
                self.walk_expression(&cond.alternate, depth);
            }
            Expression::UnaryExpression(unary) => self.walk_expression(&unary.argument, depth),
            Expression::AwaitExpression(aw) => self.walk_expression(&aw.argument, depth),
            Expression::YieldExpression(y) => {
                if let Some(arg) = &y.argument {
                    self.walk_expression(arg, depth);
                }
            }
            Expression::SequenceExpression(seq) => {
                for e in &seq.expressions {
                    self.walk_expression(e, depth);
                }
            }
            Expression::ParenthesizedExpression(paren) => {
                self.walk_expression(&paren.expression, depth)
            }
            Expression::ArrayExpression(arr) => {
                for elem in &arr.elements {
                    match elem {
                        ArrayExpressionElement::SpreadElement(spread) => {
                            self.walk_expression(&spread.argument, depth)
                        }
                        ArrayExpressionElement::Elision(_) => {}
                        _ => {
                            if let Some(e) = elem.as_expression() {
                                self.walk_expression(e, depth);
                            }
                        }
                    }
                }
            }
            Expression::ObjectExpression(obj) => {
                for prop in &obj.properties {
                    match prop {
                        ObjectPropertyKind::ObjectProperty(p) => {
                            self.walk_key(&p.key, depth);
                            self.walk_expression(&p.value, depth);
                        }
                        ObjectPropertyKind::SpreadProperty(spread) => {
                            self.walk_expression(&spread.argument, depth)
                        }
                    }
                }
            }
            Expression::ChainExpression(chain) => {
                if let ChainElement::CallExpression(call) = &chain.expression {
                    self.walk_expression(&call.callee, depth);
                    self.walk_arguments(&call.arguments, depth);
                }
            }
            _ => {}
        }
    }
}
