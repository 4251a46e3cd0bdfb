//! Static analysis of preflight scripts.
//!
//! Scripts are parsed with `oxc` and the AST is walked for constructs that
//! generate code at runtime or load modules. Nothing is executed here.

use oxc::allocator::Allocator;
use oxc::ast::ast::{
    Argument, AssignmentTargetPropertyIdentifier, AssignmentTargetPropertyProperty,
    BindingProperty, CallExpression, ComputedMemberExpression, Expression, ExportAllDeclaration,
    ExportDefaultDeclaration, ExportNamedDeclaration, IdentifierReference, ImportDeclaration,
    ImportExpression, NewExpression, PropertyKey, StaticMemberExpression,
    TaggedTemplateExpression, WithStatement,
};
use oxc::ast_visit::{Visit, walk};
use oxc::parser::Parser;
use oxc::span::{GetSpan, SourceType, Span};
use std::collections::HashSet;
use tracing::debug;

use crate::error::{Diagnostic, DiagnosticKind, PreflightError, PreflightResult};

/// Message reported for `eval`, `Function` and their aliases
pub const DANGEROUS_STATEMENT_MESSAGE: &str =
    "Usage of dangerous statement like eval() or Function(\"\").";

/// Message reported for `import`, `export` and `require`
pub const MODULE_LOADING_MESSAGE: &str = "Loading modules is not available in preflight scripts.";

/// Names that reach a code-generating constructor
const CODEGEN_NAMES: &[&str] = &["eval", "Function"];

/// Timers that accept a source string instead of a callback
const STRING_TIMERS: &[&str] = &["setTimeout", "setInterval"];

/// Parses scripts and reports dangerous constructs
#[derive(Debug, Clone)]
pub struct StaticAnalyzer {
    max_source_len: usize,
}

impl Default for StaticAnalyzer {
    fn default() -> Self {
        Self {
            max_source_len: 5000,
        }
    }
}

impl StaticAnalyzer {
    pub fn new(max_source_len: usize) -> Self {
        Self { max_source_len }
    }

    pub fn max_source_len(&self) -> usize {
        self.max_source_len
    }

    /// Parse `source` and return every diagnostic found.
    ///
    /// A parse failure yields exactly one `SyntaxError`; otherwise one
    /// `SecurityViolation` per offending construct, in source order.
    pub fn analyze(&self, source: &str) -> Vec<Diagnostic> {
        let allocator = Allocator::default();
        // Module goal so top-level `await` parses; import/export are rejected below
        let ret = Parser::new(&allocator, source, SourceType::mjs()).parse();

        if let Some(error) = ret.errors.first() {
            let offset = error
                .labels
                .as_ref()
                .and_then(|labels| labels.first())
                .map(|label| label.offset())
                .unwrap_or(0);
            let (line, column) = line_column(source, offset);
            debug!(line, column, "Preflight script failed to parse");
            return vec![Diagnostic::syntax(error.message.to_string(), line, column)];
        }
        if ret.panicked {
            return vec![Diagnostic::syntax("Unexpected end of input", 1, 1)];
        }

        let mut visitor = DangerousConstructVisitor {
            source,
            seen: HashSet::new(),
            diagnostics: Vec::new(),
        };
        visitor.visit_program(&ret.program);

        let mut diagnostics = visitor.diagnostics;
        diagnostics.sort_by_key(|d| (d.line, d.column));
        // Strict-mode grammar errors found while walking count as parse failures
        if let Some(syntax) = diagnostics
            .iter()
            .find(|d| d.kind == DiagnosticKind::SyntaxError)
        {
            return vec![syntax.clone()];
        }
        if !diagnostics.is_empty() {
            debug!(count = diagnostics.len(), "Preflight script rejected");
        }
        diagnostics
    }

    /// Length guard followed by [`StaticAnalyzer::analyze`], as an error
    pub fn validate(&self, source: &str) -> PreflightResult<()> {
        let actual = source.chars().count();
        if actual > self.max_source_len {
            return Err(PreflightError::SourceTooLong {
                actual,
                max: self.max_source_len,
            });
        }
        match PreflightError::from_diagnostics(self.analyze(source)) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// 1-indexed line and column (in characters) of a byte offset
pub fn line_column(source: &str, offset: usize) -> (u32, u32) {
    let mut offset = offset.min(source.len());
    while !source.is_char_boundary(offset) {
        offset -= 1;
    }
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = before[line_start..].chars().count() + 1;
    (line as u32, column as u32)
}

/// One `console.<method>(...)` call, as 1-indexed (line, column) positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub start: (u32, u32),
    pub end: (u32, u32),
}

/// Every `console.<method>(...)` call in `source`, in source order. Empty
/// when the source does not parse.
pub fn console_call_sites(source: &str) -> Vec<CallSite> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, source, SourceType::mjs()).parse();
    if !ret.errors.is_empty() || ret.panicked {
        return Vec::new();
    }
    let mut visitor = ConsoleCallVisitor {
        source,
        sites: Vec::new(),
    };
    visitor.visit_program(&ret.program);
    visitor.sites.sort_by_key(|site| site.start);
    visitor.sites
}

struct ConsoleCallVisitor<'s> {
    source: &'s str,
    sites: Vec<CallSite>,
}

impl<'a> Visit<'a> for ConsoleCallVisitor<'_> {
    fn visit_call_expression(&mut self, it: &CallExpression<'a>) {
        if let Expression::StaticMemberExpression(member) = unwrap_callee(&it.callee)
            && matches!(&member.object, Expression::Identifier(object) if object.name.as_str() == "console")
        {
            self.sites.push(CallSite {
                start: line_column(self.source, it.span.start as usize),
                end: line_column(self.source, it.span.end as usize),
            });
        }
        walk::walk_call_expression(self, it);
    }
}

struct DangerousConstructVisitor<'s> {
    source: &'s str,
    /// Span starts already reported, so nested matches report once
    seen: HashSet<u32>,
    diagnostics: Vec<Diagnostic>,
}

impl DangerousConstructVisitor<'_> {
    fn report(&mut self, span: Span, message: &str) {
        if !self.seen.insert(span.start) {
            return;
        }
        let (line, column) = line_column(self.source, span.start as usize);
        self.diagnostics
            .push(Diagnostic::security(message, line, column));
    }
}

/// Literal property name of a computed member key, if it is static
fn static_key<'a>(expression: &'a Expression<'_>) -> Option<&'a str> {
    match expression {
        Expression::StringLiteral(literal) => Some(literal.value.as_str()),
        Expression::TemplateLiteral(template) if template.expressions.is_empty() => template
            .quasis
            .first()
            .and_then(|quasi| quasi.value.cooked.as_ref())
            .map(|cooked| cooked.as_str()),
        _ => None,
    }
}

/// Strip parentheses and `(0, x)` sequences around a callee
fn unwrap_callee<'b, 'a>(expression: &'b Expression<'a>) -> &'b Expression<'a> {
    match expression {
        Expression::ParenthesizedExpression(inner) => unwrap_callee(&inner.expression),
        Expression::SequenceExpression(sequence) => match sequence.expressions.last() {
            Some(last) => unwrap_callee(last),
            None => expression,
        },
        _ => expression,
    }
}

/// Whether `expression` reads a `constructor` property
fn is_constructor_access(expression: &Expression<'_>) -> bool {
    match unwrap_callee(expression) {
        Expression::StaticMemberExpression(member) => member.property.name.as_str() == "constructor",
        Expression::ComputedMemberExpression(member) => {
            static_key(&member.expression) == Some("constructor")
        }
        _ => false,
    }
}

/// Calling any `constructor` property: on a function value it is the
/// `Function` constructor, which cannot be ruled out statically
fn reaches_function_constructor(callee: &Expression<'_>) -> bool {
    is_constructor_access(callee)
}

/// `Reflect.construct(x.constructor, ...)` and `Reflect.apply(x.constructor, ...)`
fn reflects_function_constructor(callee: &Expression<'_>, arguments: &[Argument<'_>]) -> bool {
    let Expression::StaticMemberExpression(member) = unwrap_callee(callee) else {
        return false;
    };
    matches!(&member.object, Expression::Identifier(object) if object.name.as_str() == "Reflect")
        && matches!(member.property.name.as_str(), "construct" | "apply")
        && arguments
            .first()
            .and_then(|argument| argument.as_expression())
            .is_some_and(is_constructor_access)
}

fn is_constructor_key(key: &PropertyKey<'_>) -> bool {
    key.is_specific_static_name("constructor")
}

fn first_argument_is_source<'a>(arguments: &[Argument<'a>]) -> bool {
    matches!(
        arguments.first().and_then(|argument| argument.as_expression()),
        Some(Expression::StringLiteral(_) | Expression::TemplateLiteral(_))
    )
}

fn callee_name<'b>(callee: &'b Expression<'_>) -> Option<&'b str> {
    match unwrap_callee(callee) {
        Expression::Identifier(identifier) => Some(identifier.name.as_str()),
        Expression::StaticMemberExpression(member) => Some(member.property.name.as_str()),
        Expression::ComputedMemberExpression(member) => static_key(&member.expression),
        _ => None,
    }
}

impl<'a> Visit<'a> for DangerousConstructVisitor<'_> {
    fn visit_identifier_reference(&mut self, it: &IdentifierReference<'a>) {
        // Any reference, not just calls, so aliases like `const e = eval` are caught
        if CODEGEN_NAMES.contains(&it.name.as_str()) {
            self.report(it.span, DANGEROUS_STATEMENT_MESSAGE);
        }
        walk::walk_identifier_reference(self, it);
    }

    fn visit_static_member_expression(&mut self, it: &StaticMemberExpression<'a>) {
        if CODEGEN_NAMES.contains(&it.property.name.as_str()) {
            self.report(it.span, DANGEROUS_STATEMENT_MESSAGE);
        }
        walk::walk_static_member_expression(self, it);
    }

    fn visit_computed_member_expression(&mut self, it: &ComputedMemberExpression<'a>) {
        if let Some(key) = static_key(&it.expression)
            && CODEGEN_NAMES.contains(&key)
        {
            self.report(it.span, DANGEROUS_STATEMENT_MESSAGE);
        }
        walk::walk_computed_member_expression(self, it);
    }

    fn visit_call_expression(&mut self, it: &CallExpression<'a>) {
        if reaches_function_constructor(&it.callee)
            || reflects_function_constructor(&it.callee, &it.arguments)
        {
            self.report(it.span, DANGEROUS_STATEMENT_MESSAGE);
        }
        match callee_name(&it.callee) {
            Some(name) if STRING_TIMERS.contains(&name) && first_argument_is_source(&it.arguments) => {
                self.report(it.span, DANGEROUS_STATEMENT_MESSAGE);
            }
            Some("require") if matches!(unwrap_callee(&it.callee), Expression::Identifier(_)) => {
                self.report(it.span, MODULE_LOADING_MESSAGE);
            }
            _ => {}
        }
        walk::walk_call_expression(self, it);
    }

    fn visit_new_expression(&mut self, it: &NewExpression<'a>) {
        if reaches_function_constructor(&it.callee) {
            self.report(it.span, DANGEROUS_STATEMENT_MESSAGE);
        }
        walk::walk_new_expression(self, it);
    }

    fn visit_tagged_template_expression(&mut self, it: &TaggedTemplateExpression<'a>) {
        if reaches_function_constructor(&it.tag) {
            self.report(it.span, DANGEROUS_STATEMENT_MESSAGE);
        }
        walk::walk_tagged_template_expression(self, it);
    }

    // Destructuring `constructor` out of a function value yields `Function`
    fn visit_binding_property(&mut self, it: &BindingProperty<'a>) {
        if is_constructor_key(&it.key) {
            self.report(it.span, DANGEROUS_STATEMENT_MESSAGE);
        }
        walk::walk_binding_property(self, it);
    }

    fn visit_assignment_target_property_property(
        &mut self,
        it: &AssignmentTargetPropertyProperty<'a>,
    ) {
        if is_constructor_key(&it.name) {
            self.report(it.span, DANGEROUS_STATEMENT_MESSAGE);
        }
        walk::walk_assignment_target_property_property(self, it);
    }

    fn visit_assignment_target_property_identifier(
        &mut self,
        it: &AssignmentTargetPropertyIdentifier<'a>,
    ) {
        if it.binding.name.as_str() == "constructor" {
            self.report(it.span, DANGEROUS_STATEMENT_MESSAGE);
        }
        walk::walk_assignment_target_property_identifier(self, it);
    }

    fn visit_with_statement(&mut self, it: &WithStatement<'a>) {
        let (line, column) = line_column(self.source, it.span.start as usize);
        self.diagnostics.push(Diagnostic::syntax(
            "'with' statements are not allowed in strict mode",
            line,
            column,
        ));
        walk::walk_with_statement(self, it);
    }

    fn visit_import_expression(&mut self, it: &ImportExpression<'a>) {
        self.report(it.span, MODULE_LOADING_MESSAGE);
        walk::walk_import_expression(self, it);
    }

    fn visit_import_declaration(&mut self, it: &ImportDeclaration<'a>) {
        self.report(it.span, MODULE_LOADING_MESSAGE);
    }

    fn visit_export_named_declaration(&mut self, it: &ExportNamedDeclaration<'a>) {
        self.report(it.span, MODULE_LOADING_MESSAGE);
        walk::walk_export_named_declaration(self, it);
    }

    fn visit_export_default_declaration(&mut self, it: &ExportDefaultDeclaration<'a>) {
        self.report(it.span, MODULE_LOADING_MESSAGE);
        walk::walk_export_default_declaration(self, it);
    }

    fn visit_export_all_declaration(&mut self, it: &ExportAllDeclaration<'a>) {
        self.report(it.span(), MODULE_LOADING_MESSAGE);
    }
}
