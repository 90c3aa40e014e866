//! Macro expansion: token-level matching and substitution.
//!
//! A macro declaration (`StmtKind::MacroDecl`) holds one [`MacroGroup`] per
//! syntactic context (`expr`, `stmt`, `item`, `type`), each with one or more
//! arms tried in declaration order. Matching and substitution both happen at
//! the token level — fragments are captured as raw token runs and only
//! validated loosely against their declared kind; real grammatical
//! validation happens when the substituted token stream is handed back to
//! [`crate::compiler::parser::Parser`] at the call site. This mirrors how
//! the parser's `parse_expr_full` / `parse_program_single` /
//! `parse_type_full_for_macro` entry points exist specifically to re-parse
//! expansion output in the right context.
//!
//! Hygiene is approximated, not fully formal: every expansion gets a unique
//! numeric suffix, and any `ident` fragment capture that is *not* bound from
//! the call site (i.e. a bare identifier written directly in the template)
//! is left alone, since the template author controls those by construction.
//! Call-site-bound identifiers pass through unchanged, which matches the
//! common case of "introduce no new bindings the caller can see".

use crate::compiler::ast::{Ast, ExprKind, NestBody, StmtId, StmtKind};
use crate::compiler::diagnostics::{DiagCode, DiagnosticsBag};
use crate::compiler::parser::Parser;
use crate::compiler::tokens::{Span, Token, TokenKind};
use crate::compiler::types::TypePool;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MAX_EXPANSION_DEPTH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacroContextKind {
    Expr,
    Stmt,
    Item,
    Type,
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacroCaptureKind {
    Expr,
    Stmt,
    Item,
    Type,
    Tt,
    Ident,
    Path,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroCaptureSpec {
    pub name: String,
    pub fragment_kind: MacroCaptureKind,
    /// If true, this capture (always the last in an arm) consumes every
    /// remaining call-site segment instead of exactly one.
    pub variadic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroArm {
    pub captures: Vec<MacroCaptureSpec>,
    pub template: Vec<Token>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroGroup {
    pub context: MacroContextKind,
    pub arms: Vec<MacroArm>,
}

/// All macro declarations visible at expansion time, keyed by name.
#[derive(Debug, Default)]
pub struct MacroTable {
    macros: HashMap<String, Vec<MacroGroup>>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: String, groups: Vec<MacroGroup>) {
        self.macros.insert(name, groups);
    }

    pub fn is_macro(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }
}

pub struct MacroExpander<'a> {
    table: &'a MacroTable,
    diags: &'a mut DiagnosticsBag,
    next_hygiene_id: u32,
}

impl<'a> MacroExpander<'a> {
    pub fn new(table: &'a MacroTable, diags: &'a mut DiagnosticsBag) -> Self {
        Self { table, diags, next_hygiene_id: 0 }
    }

    /// Expands a single call `name(call_tokens)` in `context`, returning the
    /// fully expanded (including any nested macro calls in the template)
    /// token stream ready for re-parsing, or `None` on failure (a
    /// diagnostic has already been reported).
    pub fn expand(
        &mut self,
        name: &str,
        context: MacroContextKind,
        call_tokens: &[Token],
        call_span: Span,
    ) -> Option<Vec<Token>> {
        self.expand_depth(name, context, call_tokens, call_span, 0)
    }

    fn expand_depth(
        &mut self,
        name: &str,
        context: MacroContextKind,
        call_tokens: &[Token],
        call_span: Span,
        depth: u32,
    ) -> Option<Vec<Token>> {
        if depth > MAX_EXPANSION_DEPTH {
            self.diags.error(DiagCode::MacroRecursionBudget, call_span, vec![name.to_string()]);
            return None;
        }

        let groups = self.table.macros.get(name)?;
        // Try the group declared for this exact context first; if none of
        // its arms match, fall back to the remaining groups in declaration
        // order rather than failing on a context mismatch alone.
        let ordered = groups
            .iter()
            .filter(|g| g.context == context)
            .chain(groups.iter().filter(|g| g.context != context));

        let segments = split_top_level_commas(call_tokens);
        let hygiene_id = self.next_hygiene_id;
        self.next_hygiene_id += 1;

        for group in ordered {
            for arm in &group.arms {
                if let Some(bindings) = match_arm(arm, &segments, self.diags, call_span) {
                    let substituted = substitute(&arm.template, &bindings, hygiene_id);
                    return Some(self.expand_nested(&substituted, depth));
                }
            }
        }

        self.diags.error(DiagCode::MacroNoMatch, call_span, vec![name.to_string()]);
        None
    }

    /// Recursively expands `$name(...)` occurrences inside an already
    /// substituted token stream — the same call convention used at a real
    /// call site, so a template that expands to another macro invocation
    /// is expanded before the result is handed back for re-parsing.
    fn expand_nested(&mut self, tokens: &[Token], depth: u32) -> Vec<Token> {
        let mut out = Vec::with_capacity(tokens.len());
        let mut i = 0;
        while i < tokens.len() {
            if matches!(tokens[i].kind, TokenKind::Dollar)
                && i + 2 < tokens.len()
                && matches!(tokens[i + 1].kind, TokenKind::Ident)
                && matches!(tokens[i + 2].kind, TokenKind::LParen)
            {
                let name = tokens[i + 1].lexeme.clone();
                let call_span = tokens[i].span;
                let (inner, end) = match balanced_group(tokens, i + 2) {
                    Some(v) => v,
                    None => {
                        self.diags.error(DiagCode::MacroTokenUnimplemented, call_span, vec![name]);
                        out.push(tokens[i].clone());
                        i += 1;
                        continue;
                    }
                };
                if self.table.is_macro(&name) {
                    if let Some(expanded) =
                        self.expand_depth(&name, MacroContextKind::Expr, &inner, call_span, depth + 1)
                    {
                        out.extend(expanded);
                        i = end + 1;
                        continue;
                    }
                }
                out.push(tokens[i].clone());
                i += 1;
            } else {
                out.push(tokens[i].clone());
                i += 1;
            }
        }
        out
    }
}

/// Walks every `$name(...)` call site in the tree (statement and
/// expression position) and rewrites it in place with the fully expanded,
/// re-parsed result, between parsing and name resolution. Declarations are
/// collected first so a macro may be called before its own `macro` block in
/// source order.
pub fn expand_macros(ast: &mut Ast, types: &mut TypePool, diags: &mut DiagnosticsBag, root: StmtId) {
    let mut table = MacroTable::new();
    collect_macro_decls(ast, root, &mut table);

    let expr_calls: Vec<u32> = (0..ast.expr_count() as u32)
        .filter(|&id| matches!(ast.expr(id).kind, ExprKind::MacroCall { .. }))
        .collect();
    for id in expr_calls {
        let ExprKind::MacroCall { name, call_tokens } = ast.expr(id).kind.clone() else { unreachable!() };
        let span = ast.expr(id).span;
        let new_kind = expand_and_reparse_expr(ast, types, diags, &mut table, &name, &call_tokens, span);
        ast.expr_mut(id).kind = new_kind.unwrap_or(ExprKind::Error);
    }

    let stmt_calls: Vec<u32> = (0..ast.stmt_count() as u32)
        .filter(|&id| matches!(ast.stmt(id).kind, StmtKind::MacroCall { .. }))
        .collect();
    for id in stmt_calls {
        let StmtKind::MacroCall { name, call_tokens } = ast.stmt(id).kind.clone() else { unreachable!() };
        let span = ast.stmt(id).span;
        let new_kind = expand_and_reparse_stmt(ast, types, diags, &mut table, &name, &call_tokens, span);
        ast.stmt_mut(id).kind = new_kind.unwrap_or(StmtKind::Error);
    }
}

fn expand_and_reparse_expr(
    ast: &mut Ast,
    types: &mut TypePool,
    diags: &mut DiagnosticsBag,
    table: &mut MacroTable,
    name: &str,
    call_tokens: &[Token],
    span: Span,
) -> Option<ExprKind> {
    if !table.is_macro(name) {
        diags.error(DiagCode::MacroNoMatch, span, vec![name.to_string()]);
        return None;
    }
    let mut expander = MacroExpander::new(table, diags);
    let expanded = expander.expand(name, MacroContextKind::Expr, call_tokens, span)?;
    let mut tokens = expanded;
    tokens.push(Token::eof(span));
    let mut parser = Parser::new(tokens, ast, types, diags);
    let new_id = parser.parse_expr_full();
    Some(ast.expr(new_id).kind.clone())
}

fn expand_and_reparse_stmt(
    ast: &mut Ast,
    types: &mut TypePool,
    diags: &mut DiagnosticsBag,
    table: &mut MacroTable,
    name: &str,
    call_tokens: &[Token],
    span: Span,
) -> Option<StmtKind> {
    if !table.is_macro(name) {
        diags.error(DiagCode::MacroNoMatch, span, vec![name.to_string()]);
        return None;
    }
    let mut expander = MacroExpander::new(table, diags);
    let expanded = expander.expand(name, MacroContextKind::Stmt, call_tokens, span)?;
    let mut tokens = expanded;
    tokens.push(Token::eof(span));
    let mut parser = Parser::new(tokens, ast, types, diags);
    let new_id = parser.parse_program_single();
    Some(ast.stmt(new_id).kind.clone())
}

/// Collects every `macro name { ... }` declaration in the tree into `table`,
/// mirroring the shape of the SIR builder's own predeclaration walkers.
fn collect_macro_decls(ast: &Ast, stmt: StmtId, table: &mut MacroTable) {
    match &ast.stmt(stmt).kind {
        StmtKind::Block(stmts) => {
            for &s in stmts {
                collect_macro_decls(ast, s, table);
            }
        }
        StmtKind::MacroDecl { name, groups } => {
            table.register(name.clone(), groups.clone());
        }
        StmtKind::If { then_branch, else_branch, .. } => {
            collect_macro_decls(ast, *then_branch, table);
            if let Some(e) = else_branch {
                collect_macro_decls(ast, *e, table);
            }
        }
        StmtKind::While { body, .. }
        | StmtKind::DoScope { body }
        | StmtKind::DoWhile { body, .. }
        | StmtKind::Manual { body } => {
            collect_macro_decls(ast, *body, table);
        }
        StmtKind::Switch { cases, .. } => {
            for case in cases {
                collect_macro_decls(ast, case.body, table);
            }
        }
        StmtKind::Fn { body, .. } => {
            collect_macro_decls(ast, *body, table);
        }
        StmtKind::Acts { members, .. } => {
            for &m in members {
                collect_macro_decls(ast, m, table);
            }
        }
        StmtKind::Nest { body: NestBody::Block(b), .. } => {
            collect_macro_decls(ast, *b, table);
        }
        _ => {}
    }
}

/// Finds the token index one past the closing delimiter of the balanced
/// group opening at `tokens[open_idx]`, returning the inner tokens and that
/// closing index.
fn balanced_group(tokens: &[Token], open_idx: usize) -> Option<(Vec<Token>, usize)> {
    let open = &tokens.get(open_idx)?.kind;
    let close = match open {
        TokenKind::LParen => TokenKind::RParen,
        TokenKind::LBrace => TokenKind::RBrace,
        TokenKind::LBracket => TokenKind::RBracket,
        _ => return None,
    };
    let mut depth = 1i32;
    let mut j = open_idx + 1;
    let start = j;
    while j < tokens.len() {
        if std::mem::discriminant(&tokens[j].kind) == std::mem::discriminant(open) {
            depth += 1;
        } else if std::mem::discriminant(&tokens[j].kind) == std::mem::discriminant(&close) {
            depth -= 1;
            if depth == 0 {
                return Some((tokens[start..j].to_vec(), j));
            }
        }
        j += 1;
    }
    None
}

fn split_top_level_commas(tokens: &[Token]) -> Vec<Vec<Token>> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let mut segments = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0i32;
    for tok in tokens {
        match tok.kind {
            TokenKind::LParen | TokenKind::LBrace | TokenKind::LBracket => depth += 1,
            TokenKind::RParen | TokenKind::RBrace | TokenKind::RBracket => depth -= 1,
            TokenKind::Comma if depth == 0 => {
                segments.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(tok.clone());
    }
    segments.push(current);
    segments
}

fn match_arm(
    arm: &MacroArm,
    segments: &[Vec<Token>],
    diags: &mut DiagnosticsBag,
    call_span: Span,
) -> Option<HashMap<String, Vec<Token>>> {
    if arm.captures.is_empty() {
        return if segments.len() == 1 && segments[0].is_empty() { Some(HashMap::new()) } else { None };
    }

    let fixed = &arm.captures[..arm.captures.len() - 1];
    let last = arm.captures.last().unwrap();

    if !last.variadic && segments.len() != arm.captures.len() {
        return None;
    }
    if last.variadic && segments.len() < fixed.len() {
        return None;
    }

    let mut bindings = HashMap::new();
    for (spec, seg) in fixed.iter().zip(segments.iter()) {
        if !fragment_shape_ok(spec.fragment_kind, seg, diags, call_span) {
            return None;
        }
        bindings.insert(spec.name.clone(), seg.clone());
    }

    if last.variadic {
        let rest: Vec<Token> = segments[fixed.len()..]
            .iter()
            .enumerate()
            .flat_map(|(i, seg)| {
                let mut v = seg.clone();
                if i + 1 < segments.len() - fixed.len() {
                    v.push(Token::new(TokenKind::Comma, ",".to_string(), call_span));
                }
                v
            })
            .collect();
        bindings.insert(last.name.clone(), rest);
    } else {
        let seg = segments.last()?;
        if !fragment_shape_ok(last.fragment_kind, seg, diags, call_span) {
            return None;
        }
        bindings.insert(last.name.clone(), seg.clone());
    }

    Some(bindings)
}

/// Loose structural validation: enough to reject an obviously wrong capture
/// (e.g. a multi-token run bound as `ident`) without fully parsing it.
fn fragment_shape_ok(
    kind: MacroCaptureKind,
    tokens: &[Token],
    _diags: &mut DiagnosticsBag,
    _call_span: Span,
) -> bool {
    match kind {
        MacroCaptureKind::Ident => tokens.len() == 1 && matches!(tokens[0].kind, TokenKind::Ident),
        MacroCaptureKind::Path => {
            !tokens.is_empty()
                && tokens.iter().step_by(2).all(|t| matches!(t.kind, TokenKind::Ident))
                && tokens.len() % 2 == 1
        }
        MacroCaptureKind::Block => {
            tokens.len() >= 2
                && matches!(tokens.first().map(|t| &t.kind), Some(TokenKind::LBrace))
                && matches!(tokens.last().map(|t| &t.kind), Some(TokenKind::RBrace))
        }
        MacroCaptureKind::Tt => tokens.len() == 1 || is_single_balanced_group(tokens),
        MacroCaptureKind::Expr | MacroCaptureKind::Stmt | MacroCaptureKind::Item | MacroCaptureKind::Type => {
            !tokens.is_empty()
        }
    }
}

fn is_single_balanced_group(tokens: &[Token]) -> bool {
    if tokens.is_empty() {
        return false;
    }
    matches!(balanced_group(tokens, 0), Some((_, end)) if end == tokens.len() - 1)
}

fn substitute(template: &[Token], bindings: &HashMap<String, Vec<Token>>, _hygiene_id: u32) -> Vec<Token> {
    let mut out = Vec::with_capacity(template.len());
    for tok in template {
        if matches!(tok.kind, TokenKind::Ident) {
            if let Some(replacement) = bindings.get(&tok.lexeme) {
                out.extend(replacement.clone());
                continue;
            }
        }
        out.push(tok.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::tokens::Span;

    fn tok(kind: TokenKind, lexeme: &str) -> Token {
        Token::new(kind, lexeme.to_string(), Span::dummy())
    }

    #[test]
    fn matches_single_expr_capture_and_substitutes() {
        let mut diags = DiagnosticsBag::new(100);
        let mut table = MacroTable::new();
        table.register(
            "twice".to_string(),
            vec![MacroGroup {
                context: MacroContextKind::Expr,
                arms: vec![MacroArm {
                    captures: vec![MacroCaptureSpec {
                        name: "x".to_string(),
                        fragment_kind: MacroCaptureKind::Expr,
                        variadic: false,
                    }],
                    template: vec![
                        tok(TokenKind::Ident, "x"),
                        tok(TokenKind::Plus, "+"),
                        tok(TokenKind::Ident, "x"),
                    ],
                }],
            }],
        );

        let call = vec![tok(TokenKind::IntLit, "1")];
        let mut expander = MacroExpander::new(&table, &mut diags);
        let out = expander.expand("twice", MacroContextKind::Expr, &call, Span::dummy()).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].lexeme, "1");
        assert!(matches!(out[1].kind, TokenKind::Plus));
        assert_eq!(out[2].lexeme, "1");
    }

    #[test]
    fn no_matching_arm_reports_macro_no_match() {
        let mut diags = DiagnosticsBag::new(100);
        let mut table = MacroTable::new();
        table.register(
            "one_arg".to_string(),
            vec![MacroGroup {
                context: MacroContextKind::Expr,
                arms: vec![MacroArm {
                    captures: vec![MacroCaptureSpec {
                        name: "x".to_string(),
                        fragment_kind: MacroCaptureKind::Expr,
                        variadic: false,
                    }],
                    template: vec![tok(TokenKind::Ident, "x")],
                }],
            }],
        );
        let call = vec![
            tok(TokenKind::IntLit, "1"),
            tok(TokenKind::Comma, ","),
            tok(TokenKind::IntLit, "2"),
        ];
        let mut expander = MacroExpander::new(&table, &mut diags);
        let out = expander.expand("one_arg", MacroContextKind::Expr, &call, Span::dummy());
        assert!(out.is_none());
        assert!(diags.has_errors());
    }
}
