//! Recursive-descent parser with Pratt-style expression parsing, bounded
//! lookahead, and an explicit recovery protocol.
//!
//! On any unexpected token the parser emits a diagnostic and synchronizes to
//! one of a small set of boundary tokens. Every recovery attempt is
//! guaranteed forward progress: if a full statement attempt leaves the
//! cursor where it started, the driver consumes one token itself. A hard
//! `max_errors` cap aborts the parser (and every later stage) with a fatal
//! `TooManyErrors` diagnostic.

use crate::compiler::ast::*;
use crate::compiler::diagnostics::{DiagCode, DiagnosticsBag};
use crate::compiler::macros::{MacroArm, MacroCaptureKind, MacroCaptureSpec, MacroContextKind, MacroGroup};
use crate::compiler::tokens::{Span, Token, TokenKind};
use crate::compiler::types::TypePool;

const BOUNDARY_TOKENS: &[TokenKind] = &[
    TokenKind::Semi,
    TokenKind::RBrace,
    TokenKind::Let,
    TokenKind::Set,
    TokenKind::Static,
    TokenKind::If,
    TokenKind::While,
    TokenKind::Return,
    TokenKind::Break,
    TokenKind::Continue,
    TokenKind::Fn,
    TokenKind::Field,
    TokenKind::Acts,
    TokenKind::Use,
    TokenKind::Nest,
    TokenKind::Switch,
    TokenKind::Do,
    TokenKind::Manual,
    TokenKind::MacroKw,
    TokenKind::Dollar,
];

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ast: &'a mut Ast,
    types: &'a mut TypePool,
    diags: &'a mut DiagnosticsBag,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, ast: &'a mut Ast, types: &'a mut TypePool, diags: &'a mut DiagnosticsBag) -> Self {
        Self { tokens, pos: 0, ast, types, diags }
    }

    // ---- cursor ----

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_at(&self, n: usize) -> &Token {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn at(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind)
    }

    fn bump(&mut self) -> Token {
        let tok = self.peek().clone();
        if !tok.is_eof() {
            self.pos += 1;
        }
        tok
    }

    fn span(&self) -> Span {
        self.peek().span
    }

    fn should_abort(&self) -> bool {
        self.diags.should_abort()
    }

    fn expect(&mut self, kind: TokenKind, code: DiagCode) -> Token {
        if self.at(&kind) {
            self.bump()
        } else {
            let sp = self.span();
            self.diags.error(code, sp, vec![kind.to_string(), self.peek_kind().to_string()]);
            Token::new(kind, String::new(), sp)
        }
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(&kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Emits a diagnostic and synchronizes to the next boundary token,
    /// guaranteeing at least one token of progress.
    fn recover(&mut self, code: DiagCode) {
        let sp = self.span();
        self.diags.error(code, sp, vec![self.peek_kind().to_string()]);
        let start = self.pos;
        while !self.peek().is_eof() && !BOUNDARY_TOKENS.iter().any(|k| self.at(k)) {
            self.bump();
        }
        if self.pos == start && !self.peek().is_eof() {
            self.bump();
        }
    }

    // ---- entry points ----

    pub fn parse_program(&mut self) -> StmtId {
        let first = self.span();
        let mut stmts = Vec::new();
        while !self.peek().is_eof() && !self.should_abort() {
            stmts.push(self.parse_stmt_any());
        }
        let last = if stmts.is_empty() { first } else { self.ast.stmt_span(*stmts.last().unwrap()) };
        self.ast.add_stmt(StmtKind::Block(stmts), first.join(last))
    }

    /// Secondary entry used by macro re-parsing: a single-statement block.
    pub fn parse_program_single(&mut self) -> StmtId {
        self.parse_program()
    }

    pub fn parse_expr_full(&mut self) -> ExprId {
        let e = self.parse_expr();
        e
    }

    pub fn parse_type_full_for_macro(&mut self) -> TypeNodeId {
        self.parse_type()
    }

    // ---- statements ----

    fn parse_stmt_any(&mut self) -> StmtId {
        match self.peek_kind() {
            TokenKind::Let | TokenKind::Set | TokenKind::Static => self.parse_var_decl(),
            TokenKind::If => self.parse_if_stmt(),
            TokenKind::While => self.parse_while_stmt(),
            TokenKind::Do => self.parse_do_stmt(),
            TokenKind::Manual => self.parse_manual_stmt(),
            TokenKind::Switch => self.parse_switch_stmt(),
            TokenKind::Return => self.parse_return_stmt(),
            TokenKind::Break => self.parse_break_stmt(),
            TokenKind::Continue => {
                let sp = self.span();
                self.bump();
                self.eat(TokenKind::Semi);
                self.ast.add_stmt(StmtKind::Continue, sp)
            }
            TokenKind::Use => self.parse_use_stmt(),
            TokenKind::Nest => self.parse_nest_stmt(),
            TokenKind::Fn => self.parse_fn_decl(false, false, false),
            TokenKind::Extern => self.parse_extern_fn_decl(),
            TokenKind::Field => self.parse_field_decl(),
            TokenKind::Acts => self.parse_acts_decl(),
            TokenKind::MacroKw => self.parse_macro_decl(),
            TokenKind::Dollar => self.parse_macro_call_stmt(),
            TokenKind::LBrace => {
                let sp = self.span();
                self.diags.warning(DiagCode::BareBlockScopePreferDo, sp, vec![]);
                self.parse_block()
            }
            TokenKind::Semi => {
                let sp = self.span();
                self.bump();
                self.ast.add_stmt(StmtKind::Empty, sp)
            }
            _ => self.parse_expr_stmt(),
        }
    }

    fn parse_block(&mut self) -> StmtId {
        let open = self.span();
        self.expect(TokenKind::LBrace, DiagCode::ExpectedToken);
        let mut stmts = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.peek().is_eof() && !self.should_abort() {
            stmts.push(self.parse_stmt_any());
        }
        let close = self.span();
        self.expect(TokenKind::RBrace, DiagCode::ExpectedToken);
        self.ast.add_stmt(StmtKind::Block(stmts), open.join(close))
    }

    fn parse_var_decl(&mut self) -> StmtId {
        let start = self.span();
        let is_static = self.eat(TokenKind::Static);
        let is_set = if self.eat(TokenKind::Set) {
            true
        } else {
            self.expect(TokenKind::Let, DiagCode::VarDeclNameExpected);
            false
        };
        let is_mut = self.eat(TokenKind::Mut);

        if !self.at(&TokenKind::Ident) {
            self.diags.error(DiagCode::VarDeclNameExpected, self.span(), vec![]);
        }
        let name = self.bump().lexeme;

        let declared_ty = if self.eat(TokenKind::Colon) {
            Some(self.parse_type())
        } else {
            if !is_set {
                self.diags.error(DiagCode::VarDeclTypeAnnotationRequired, self.span(), vec![name.clone()]);
            }
            None
        };

        let init = if self.eat(TokenKind::Eq) {
            Some(self.parse_expr())
        } else if is_set {
            self.diags.error(DiagCode::SetInitializerRequired, self.span(), vec![name.clone()]);
            None
        } else {
            self.diags.error(DiagCode::VarDeclInitializerExpected, self.span(), vec![name.clone()]);
            None
        };
        let end = self.span();
        self.eat(TokenKind::Semi);
        self.ast.add_stmt(
            StmtKind::VarDecl { name, is_set, is_mut, is_static, declared_ty, init },
            start.join(end),
        )
    }

    fn parse_if_stmt(&mut self) -> StmtId {
        let start = self.span();
        self.bump(); // if
        self.expect(TokenKind::LParen, DiagCode::ExpectedToken);
        let cond = self.parse_expr();
        self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
        let then_branch = self.parse_block();
        let else_branch = self.parse_else_tail();
        let end = self.ast.stmt_span(else_branch.unwrap_or(then_branch));
        self.ast.add_stmt(StmtKind::If { cond, then_branch, else_branch }, start.join(end))
    }

    /// `elif` desugars to a nested `if` inside the `else` branch.
    fn parse_else_tail(&mut self) -> Option<StmtId> {
        if self.eat(TokenKind::Elif) {
            let start = self.span();
            self.expect(TokenKind::LParen, DiagCode::ExpectedToken);
            let cond = self.parse_expr();
            self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
            let then_branch = self.parse_block();
            let else_branch = self.parse_else_tail();
            let end = self.ast.stmt_span(else_branch.unwrap_or(then_branch));
            Some(self.ast.add_stmt(StmtKind::If { cond, then_branch, else_branch }, start.join(end)))
        } else if self.eat(TokenKind::Else) {
            Some(self.parse_block())
        } else {
            None
        }
    }

    fn parse_while_stmt(&mut self) -> StmtId {
        let start = self.span();
        self.bump();
        self.expect(TokenKind::LParen, DiagCode::ExpectedToken);
        let cond = self.parse_expr();
        self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
        if !self.at(&TokenKind::LBrace) {
            self.diags.error(DiagCode::WhileBodyExpectedBlock, self.span(), vec![]);
        }
        let body = self.parse_block();
        let end = self.ast.stmt_span(body);
        self.ast.add_stmt(StmtKind::While { cond, body }, start.join(end))
    }

    fn parse_do_stmt(&mut self) -> StmtId {
        let start = self.span();
        self.bump(); // do
        let body = self.parse_block();
        if self.eat(TokenKind::While) {
            self.expect(TokenKind::LParen, DiagCode::ExpectedToken);
            let cond = self.parse_expr();
            self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
            let end = self.span();
            self.eat(TokenKind::Semi);
            self.ast.add_stmt(StmtKind::DoWhile { body, cond }, start.join(end))
        } else {
            let end = self.ast.stmt_span(body);
            self.ast.add_stmt(StmtKind::DoScope { body }, start.join(end))
        }
    }

    fn parse_manual_stmt(&mut self) -> StmtId {
        let start = self.span();
        self.bump();
        let body = self.parse_block();
        let end = self.ast.stmt_span(body);
        self.ast.add_stmt(StmtKind::Manual { body }, start.join(end))
    }

    fn parse_switch_stmt(&mut self) -> StmtId {
        let start = self.span();
        self.bump();
        self.expect(TokenKind::LParen, DiagCode::ExpectedToken);
        let scrutinee = self.parse_expr();
        self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
        self.expect(TokenKind::LBrace, DiagCode::ExpectedToken);

        let mut cases = Vec::new();
        let mut seen_default = false;
        while !self.at(&TokenKind::RBrace) && !self.peek().is_eof() && !self.should_abort() {
            let case_start = self.span();
            let is_default = self.eat(TokenKind::Default);
            let pattern = if is_default {
                if seen_default {
                    self.diags.error(DiagCode::UnexpectedToken, case_start, vec!["duplicate default".into()]);
                }
                seen_default = true;
                None
            } else {
                self.expect(TokenKind::Case, DiagCode::SwitchCaseExpectedColon);
                Some(self.parse_expr())
            };
            if !self.eat(TokenKind::Colon) {
                self.diags.error(DiagCode::SwitchCaseExpectedColon, self.span(), vec![]);
            }
            let body = self.parse_block();
            let case_end = self.ast.stmt_span(body);
            cases.push(SwitchCase { is_default, pattern, body, span: case_start.join(case_end) });
        }
        let end = self.span();
        self.expect(TokenKind::RBrace, DiagCode::ExpectedToken);
        self.ast.add_stmt(StmtKind::Switch { scrutinee, cases }, start.join(end))
    }

    fn parse_return_stmt(&mut self) -> StmtId {
        let start = self.span();
        self.bump();
        let value = if self.at(&TokenKind::Semi) || self.at(&TokenKind::RBrace) {
            None
        } else {
            Some(self.parse_expr())
        };
        let end = self.span();
        self.eat(TokenKind::Semi);
        self.ast.add_stmt(StmtKind::Return(value), start.join(end))
    }

    fn parse_break_stmt(&mut self) -> StmtId {
        let start = self.span();
        self.bump();
        let value = if self.at(&TokenKind::Semi) || self.at(&TokenKind::RBrace) {
            None
        } else {
            Some(self.parse_expr())
        };
        let end = self.span();
        self.eat(TokenKind::Semi);
        self.ast.add_stmt(StmtKind::Break(value), start.join(end))
    }

    fn parse_expr_stmt(&mut self) -> StmtId {
        let start = self.span();
        if !is_expr_start(self.peek_kind()) {
            self.recover(DiagCode::UnexpectedToken);
            return self.ast.add_stmt(StmtKind::Error, start);
        }
        let e = self.parse_expr();
        let end = self.ast.expr_span(e);
        self.eat(TokenKind::Semi);
        self.ast.add_stmt(StmtKind::ExprStmt(e), start.join(end))
    }

    fn parse_use_stmt(&mut self) -> StmtId {
        let start = self.span();
        self.bump(); // use

        // FFI forms: `use func::ffi<Sig> name;` / `use struct::ffi name { ... }`
        if self.at(&TokenKind::Func) {
            self.bump();
            self.expect(TokenKind::ColonColon, DiagCode::ExpectedToken);
            self.expect(TokenKind::Ffi, DiagCode::ExpectedToken);
            self.expect(TokenKind::Lt, DiagCode::ExpectedToken);
            let sig = self.parse_type();
            self.expect(TokenKind::Gt, DiagCode::ExpectedToken);
            let name = self.expect(TokenKind::Ident, DiagCode::FnNameExpected).lexeme;
            let end = self.span();
            self.eat(TokenKind::Semi);
            return self.ast.add_stmt(StmtKind::Use(UseDecl::FfiFunc { sig, name }), start.join(end));
        }
        if self.at(&TokenKind::Struct) {
            self.bump();
            self.expect(TokenKind::ColonColon, DiagCode::ExpectedToken);
            self.expect(TokenKind::Ffi, DiagCode::ExpectedToken);
            let name = self.expect(TokenKind::Ident, DiagCode::FieldMemberNameExpected).lexeme;
            self.expect(TokenKind::LBrace, DiagCode::ExpectedToken);
            let mut fields = Vec::new();
            while !self.at(&TokenKind::RBrace) && !self.peek().is_eof() {
                let fstart = self.span();
                let fname = self.expect(TokenKind::Ident, DiagCode::FieldMemberNameExpected).lexeme;
                self.expect(TokenKind::Colon, DiagCode::ExpectedToken);
                let fty = self.parse_type();
                self.eat(TokenKind::Comma);
                let fend = self.span();
                fields.push(FieldMember { name: fname, ty: fty, span: fstart.join(fend) });
            }
            let end = self.span();
            self.expect(TokenKind::RBrace, DiagCode::ExpectedToken);
            return self.ast.add_stmt(StmtKind::Use(UseDecl::FfiStruct { name, fields }), start.join(end));
        }

        // `use a::b::c;` import, optionally `as alias`
        // `use type Name = <type>;` alias (Name recognized via following `=`)
        // `use Name = a::b::c;` path alias
        // `use Name(tokens...);` textual substitution — recognized by a
        // following `(` token stream captured verbatim.
        if self.at(&TokenKind::Ident) && matches!(self.peek_at(1).kind, TokenKind::Eq) {
            let name = self.bump().lexeme;
            self.bump(); // =
            let mut path = vec![self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme];
            while self.eat(TokenKind::ColonColon) {
                path.push(self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme);
            }
            let end = self.span();
            self.eat(TokenKind::Semi);
            return self.ast.add_stmt(StmtKind::Use(UseDecl::PathAlias { name, target: path }), start.join(end));
        }

        let mut path = vec![self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme];
        while self.eat(TokenKind::ColonColon) {
            path.push(self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme);
        }
        let alias = if self.eat(TokenKind::As) {
            Some(self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme)
        } else {
            None
        };
        let end = self.span();
        self.eat(TokenKind::Semi);
        self.ast.add_stmt(StmtKind::Use(UseDecl::Import { path, alias }), start.join(end))
    }

    fn parse_nest_stmt(&mut self) -> StmtId {
        let start = self.span();
        self.bump();
        let name = self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme;
        if self.at(&TokenKind::LBrace) {
            let body = self.parse_block();
            let end = self.ast.stmt_span(body);
            self.ast.add_stmt(StmtKind::Nest { name, body: NestBody::Block(body) }, start.join(end))
        } else {
            let end = self.span();
            self.eat(TokenKind::Semi);
            self.ast.add_stmt(StmtKind::Nest { name, body: NestBody::Directive }, start.join(end))
        }
    }

    fn parse_params(&mut self) -> Vec<Param> {
        self.expect(TokenKind::LParen, DiagCode::ExpectedToken);
        let mut params = Vec::new();
        while !self.at(&TokenKind::RParen) && !self.peek().is_eof() {
            let pstart = self.span();
            let label = if matches!(self.peek_kind(), TokenKind::Ident)
                && matches!(self.peek_at(1).kind, TokenKind::Colon)
                && matches!(self.peek_at(2).kind, TokenKind::Ident)
            {
                None
            } else {
                None
            };
            let name = self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme;
            self.expect(TokenKind::Colon, DiagCode::ExpectedToken);
            let ty = self.parse_type();
            let (has_default, default) = if self.eat(TokenKind::Eq) {
                (true, Some(self.parse_expr()))
            } else {
                (false, None)
            };
            let pend = self.span();
            params.push(Param { name, ty, has_default, default, label, span: pstart.join(pend) });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
        params
    }

    fn parse_fn_decl(&mut self, is_pure: bool, is_comptime: bool, is_extern: bool) -> StmtId {
        let start = self.span();
        self.bump(); // fn
        if !self.at(&TokenKind::Ident) {
            self.diags.error(DiagCode::FnNameExpected, self.span(), vec![]);
        }
        let name = self.bump().lexeme;
        let params = self.parse_params();
        let ret = if self.eat(TokenKind::Arrow) { Some(self.parse_type()) } else { None };
        let body = self.parse_block();
        let end = self.ast.stmt_span(body);
        self.ast.add_stmt(
            StmtKind::Fn { name, params, ret, body, is_pure, is_comptime, is_extern, abi_name: None },
            start.join(end),
        )
    }

    fn parse_extern_fn_decl(&mut self) -> StmtId {
        self.bump(); // extern
        self.parse_fn_decl(false, false, true)
    }

    fn parse_field_decl(&mut self) -> StmtId {
        let start = self.span();
        self.bump(); // field
        let name = self.expect(TokenKind::Ident, DiagCode::FieldMemberNameExpected).lexeme;
        self.expect(TokenKind::LBrace, DiagCode::ExpectedToken);
        let mut members = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.peek().is_eof() {
            let mstart = self.span();
            if !self.at(&TokenKind::Ident) {
                self.diags.error(DiagCode::FieldMemberNameExpected, self.span(), vec![]);
                break;
            }
            let mname = self.bump().lexeme;
            self.expect(TokenKind::Colon, DiagCode::ExpectedToken);
            let mty = self.parse_type();
            self.eat(TokenKind::Comma);
            let mend = self.span();
            members.push(FieldMember { name: mname, ty: mty, span: mstart.join(mend) });
        }
        let end = self.span();
        self.expect(TokenKind::RBrace, DiagCode::ExpectedToken);
        self.ast.add_stmt(StmtKind::Field { name, members }, start.join(end))
    }

    fn parse_acts_decl(&mut self) -> StmtId {
        let start = self.span();
        self.bump(); // acts

        let (lane, name, for_type) = if self.eat(TokenKind::LBracket) {
            let name = self.expect(TokenKind::Ident, DiagCode::ActsNameExpected).lexeme;
            self.expect(TokenKind::RBracket, DiagCode::ExpectedToken);
            self.expect(TokenKind::For, DiagCode::ExpectedToken);
            let ty = self.parse_type();
            (ActsLane::ForType, name, Some(ty))
        } else if !self.at(&TokenKind::Ident) {
            self.diags.error(DiagCode::ActsNameExpected, self.span(), vec![]);
            (ActsLane::Namespace, String::new(), None)
        } else {
            let name = self.bump().lexeme;
            if self.eat(TokenKind::For) {
                self.diags.error(DiagCode::ActsForNotSupported, self.span(), vec![]);
                let ty = self.parse_type();
                (ActsLane::ForType, name, Some(ty))
            } else {
                (ActsLane::Namespace, name, None)
            }
        };

        self.expect(TokenKind::LBrace, DiagCode::ExpectedToken);
        let mut members = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.peek().is_eof() && !self.should_abort() {
            members.push(self.parse_stmt_any());
        }
        let end = self.span();
        self.expect(TokenKind::RBrace, DiagCode::ExpectedToken);
        self.ast.add_stmt(StmtKind::Acts { lane, name, for_type, members }, start.join(end))
    }

    // ---- types ----

    fn parse_type(&mut self) -> TypeNodeId {
        let start = self.span();
        let mut node = self.parse_type_atom();

        loop {
            if self.eat(TokenKind::Question) {
                let end = self.span();
                node = self.ast.add_type_node(TypeNodeKind::Optional(node), start.join(end));
            } else if self.at(&TokenKind::LBracket) {
                self.bump();
                let size = if self.at(&TokenKind::IntLit) {
                    self.bump().lexeme.parse::<u32>().ok()
                } else {
                    None
                };
                let end = self.span();
                self.expect(TokenKind::RBracket, DiagCode::ExpectedToken);
                node = self.ast.add_type_node(TypeNodeKind::Array { elem: node, size }, start.join(end));
            } else {
                break;
            }
        }
        node
    }

    fn parse_type_atom(&mut self) -> TypeNodeId {
        let start = self.span();
        match self.peek_kind().clone() {
            TokenKind::Amp => {
                self.bump();
                let is_mut = self.eat(TokenKind::Mut);
                let elem = self.parse_type();
                let end = self.ast.type_node(elem).span;
                self.ast.add_type_node(TypeNodeKind::Borrow { elem, is_mut }, start.join(end))
            }
            TokenKind::Caret => {
                self.bump();
                self.expect(TokenKind::Amp, DiagCode::CastTargetTypeExpected);
                let elem = self.parse_type();
                let end = self.ast.type_node(elem).span;
                self.ast.add_type_node(TypeNodeKind::Escape(elem), start.join(end))
            }
            TokenKind::Star => {
                self.bump();
                let is_mut = self.eat(TokenKind::Mut);
                let elem = self.parse_type();
                let end = self.ast.type_node(elem).span;
                self.ast.add_type_node(TypeNodeKind::Ptr { elem, is_mut }, start.join(end))
            }
            TokenKind::Fn => {
                self.bump();
                self.expect(TokenKind::LParen, DiagCode::ExpectedToken);
                let mut params = Vec::new();
                while !self.at(&TokenKind::RParen) && !self.peek().is_eof() {
                    params.push(self.parse_type());
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
                self.expect(TokenKind::Arrow, DiagCode::ExpectedToken);
                let ret = self.parse_type();
                let end = self.ast.type_node(ret).span;
                self.ast.add_type_node(TypeNodeKind::Fn { params, ret }, start.join(end))
            }
            TokenKind::LParen => {
                self.bump();
                let inner = self.parse_type();
                let end = self.span();
                self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
                self.ast.type_node_mut(inner).span = start.join(end);
                inner
            }
            TokenKind::Ident => {
                let mut path = vec![self.bump().lexeme];
                while self.eat(TokenKind::ColonColon) {
                    path.push(self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme);
                }
                let args = if self.eat(TokenKind::Lt) {
                    let mut args = Vec::new();
                    while !self.at(&TokenKind::Gt) && !self.peek().is_eof() {
                        args.push(self.parse_type());
                        if !self.eat(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::Gt, DiagCode::ExpectedToken);
                    args
                } else {
                    Vec::new()
                };
                let end = self.span();
                self.ast.add_type_node(TypeNodeKind::Named { path, args }, start.join(end))
            }
            _ => {
                self.diags.error(DiagCode::CastTargetTypeExpected, start, vec![self.peek_kind().to_string()]);
                self.ast.add_type_node(TypeNodeKind::Named { path: vec!["<error>".into()], args: vec![] }, start)
            }
        }
    }

    // ---- expressions (Pratt) ----

    fn parse_expr(&mut self) -> ExprId {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> ExprId {
        let lhs = self.parse_ternary();
        if self.eat(TokenKind::Eq) {
            let rhs = self.parse_assignment();
            let span = self.ast.expr_span(lhs).join(self.ast.expr_span(rhs));
            return self.ast.add_expr(ExprKind::Assign { target: lhs, value: rhs }, span);
        }
        if self.eat(TokenKind::QuestionQuestionEq) {
            let rhs = self.parse_assignment();
            let span = self.ast.expr_span(lhs).join(self.ast.expr_span(rhs));
            let coalesced = self.ast.add_expr(ExprKind::Binary { op: BinOp::NullCoalesce, lhs, rhs }, span);
            return self.ast.add_expr(ExprKind::Assign { target: lhs, value: coalesced }, span);
        }
        lhs
    }

    fn parse_ternary(&mut self) -> ExprId {
        let cond = self.parse_null_coalesce();
        if self.eat(TokenKind::Question) {
            let then_val = self.parse_assignment();
            self.expect(TokenKind::Colon, DiagCode::ExpectedToken);
            let else_val = self.parse_assignment();
            let then_stmt = self.ast.add_stmt(StmtKind::ExprStmt(then_val), self.ast.expr_span(then_val));
            let else_stmt = self.ast.add_stmt(StmtKind::ExprStmt(else_val), self.ast.expr_span(else_val));
            let span = self.ast.expr_span(cond).join(self.ast.expr_span(else_val));
            return self.ast.add_expr(
                ExprKind::If { cond, then_branch: then_stmt, else_branch: Some(else_stmt) },
                span,
            );
        }
        cond
    }

    fn parse_null_coalesce(&mut self) -> ExprId {
        let mut lhs = self.parse_logical_or();
        while self.eat(TokenKind::QuestionQuestion) {
            let rhs = self.parse_logical_or();
            let span = self.ast.expr_span(lhs).join(self.ast.expr_span(rhs));
            lhs = self.ast.add_expr(ExprKind::Binary { op: BinOp::NullCoalesce, lhs, rhs }, span);
        }
        lhs
    }

    fn parse_logical_or(&mut self) -> ExprId {
        let mut lhs = self.parse_logical_and();
        while self.eat(TokenKind::PipePipe) {
            let rhs = self.parse_logical_and();
            let span = self.ast.expr_span(lhs).join(self.ast.expr_span(rhs));
            lhs = self.ast.add_expr(ExprKind::Binary { op: BinOp::Or, lhs, rhs }, span);
        }
        lhs
    }

    fn parse_logical_and(&mut self) -> ExprId {
        let mut lhs = self.parse_comparison();
        while self.eat(TokenKind::AmpAmp) {
            let rhs = self.parse_comparison();
            let span = self.ast.expr_span(lhs).join(self.ast.expr_span(rhs));
            lhs = self.ast.add_expr(ExprKind::Binary { op: BinOp::And, lhs, rhs }, span);
        }
        lhs
    }

    fn parse_comparison(&mut self) -> ExprId {
        let mut lhs = self.parse_bitwise();
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::BangEq => BinOp::Ne,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_bitwise();
            let span = self.ast.expr_span(lhs).join(self.ast.expr_span(rhs));
            lhs = self.ast.add_expr(ExprKind::Binary { op, lhs, rhs }, span);
        }
        lhs
    }

    fn parse_bitwise(&mut self) -> ExprId {
        let mut lhs = self.parse_shift();
        loop {
            let op = match self.peek_kind() {
                TokenKind::Amp => BinOp::BitAnd,
                TokenKind::Pipe => BinOp::BitOr,
                TokenKind::Caret => BinOp::BitXor,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_shift();
            let span = self.ast.expr_span(lhs).join(self.ast.expr_span(rhs));
            lhs = self.ast.add_expr(ExprKind::Binary { op, lhs, rhs }, span);
        }
        lhs
    }

    fn parse_shift(&mut self) -> ExprId {
        let mut lhs = self.parse_additive();
        loop {
            let op = match self.peek_kind() {
                TokenKind::Shl => BinOp::Shl,
                TokenKind::Shr => BinOp::Shr,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_additive();
            let span = self.ast.expr_span(lhs).join(self.ast.expr_span(rhs));
            lhs = self.ast.add_expr(ExprKind::Binary { op, lhs, rhs }, span);
        }
        lhs
    }

    fn parse_additive(&mut self) -> ExprId {
        let mut lhs = self.parse_multiplicative();
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative();
            let span = self.ast.expr_span(lhs).join(self.ast.expr_span(rhs));
            lhs = self.ast.add_expr(ExprKind::Binary { op, lhs, rhs }, span);
        }
        lhs
    }

    fn parse_multiplicative(&mut self) -> ExprId {
        let mut lhs = self.parse_unary();
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary();
            let span = self.ast.expr_span(lhs).join(self.ast.expr_span(rhs));
            lhs = self.ast.add_expr(ExprKind::Binary { op, lhs, rhs }, span);
        }
        lhs
    }

    fn parse_unary(&mut self) -> ExprId {
        let start = self.span();
        match self.peek_kind() {
            TokenKind::Minus => {
                self.bump();
                let operand = self.parse_unary();
                let span = start.join(self.ast.expr_span(operand));
                self.ast.add_expr(ExprKind::Unary { op: UnaryOp::Neg, operand }, span)
            }
            TokenKind::Bang => {
                self.bump();
                let operand = self.parse_unary();
                let span = start.join(self.ast.expr_span(operand));
                self.ast.add_expr(ExprKind::Unary { op: UnaryOp::Not, operand }, span)
            }
            TokenKind::Tilde => {
                self.bump();
                let operand = self.parse_unary();
                let span = start.join(self.ast.expr_span(operand));
                self.ast.add_expr(ExprKind::Unary { op: UnaryOp::BitNot, operand }, span)
            }
            TokenKind::AmpAmp => {
                // `&&place`: escape. Also guards against the ambiguous
                // `& &place` chain (`&(&place)`), which is rejected rather
                // than silently reinterpreted.
                self.bump();
                let operand = self.parse_unary();
                if matches!(self.ast.expr(operand).kind, ExprKind::Unary { op: UnaryOp::Borrow { .. }, .. }) {
                    self.diags.error(DiagCode::AmbiguousAmpPrefixChain, start, vec![]);
                }
                let span = start.join(self.ast.expr_span(operand));
                self.ast.add_expr(ExprKind::Unary { op: UnaryOp::Escape, operand }, span)
            }
            TokenKind::Amp => {
                self.bump();
                let is_mut = self.eat(TokenKind::Mut);
                let operand = self.parse_unary();
                let span = start.join(self.ast.expr_span(operand));
                self.ast.add_expr(ExprKind::Unary { op: UnaryOp::Borrow { is_mut }, operand }, span)
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> ExprId {
        let mut expr = self.parse_primary();
        loop {
            match self.peek_kind() {
                TokenKind::LParen => {
                    expr = self.parse_call(expr);
                }
                TokenKind::LBracket => {
                    self.bump();
                    let index = self.parse_expr();
                    let end = self.span();
                    self.expect(TokenKind::RBracket, DiagCode::ExpectedToken);
                    let span = self.ast.expr_span(expr).join(end);
                    expr = self.ast.add_expr(ExprKind::Index { base: expr, index }, span);
                }
                TokenKind::Dot => {
                    self.bump();
                    let name = self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme;
                    let span = self.ast.expr_span(expr);
                    expr = self.ast.add_expr(ExprKind::Field { base: expr, name }, span);
                }
                TokenKind::As => {
                    self.bump();
                    let kind = if self.eat(TokenKind::Question) {
                        CastKind::AsQ
                    } else if self.eat(TokenKind::Bang) {
                        CastKind::AsBang
                    } else {
                        CastKind::As
                    };
                    let target = self.parse_type();
                    let span = self.ast.expr_span(expr).join(self.ast.type_node(target).span);
                    expr = self.ast.add_expr(ExprKind::Cast { kind, operand: expr, target }, span);
                }
                TokenKind::DotDotDot => {
                    // postfix increment spelled `++`? Reuse `...`-free path:
                    // no postfix-inc token declared; fallthrough.
                    break;
                }
                _ => break,
            }
        }
        expr
    }

    fn parse_call(&mut self, callee: ExprId) -> ExprId {
        let start = self.ast.expr_span(callee);
        self.bump(); // (
        let mut args = Vec::new();
        let mut saw_named_group = false;
        while !self.at(&TokenKind::RParen) && !self.peek().is_eof() {
            if saw_named_group {
                self.diags.error(DiagCode::CallNoArgsAfterNamedGroup, self.span(), vec![]);
            }
            if self.at(&TokenKind::LBrace) {
                self.bump();
                let mut entries = Vec::new();
                while !self.at(&TokenKind::RBrace) && !self.peek().is_eof() {
                    let label = self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme;
                    self.expect(TokenKind::Colon, DiagCode::ExpectedToken);
                    let value = self.parse_expr();
                    entries.push((label, value));
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace, DiagCode::ExpectedToken);
                args.push(Arg::NamedGroup { entries });
                saw_named_group = true;
            } else if matches!(self.peek_kind(), TokenKind::Ident) && matches!(self.peek_at(1).kind, TokenKind::Colon)
            {
                let label = self.bump().lexeme;
                self.bump(); // colon
                let value = self.parse_expr();
                args.push(Arg::Labeled { label, value });
            } else {
                let value = self.parse_expr();
                args.push(Arg::Positional(value));
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        let end = self.span();
        self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
        self.ast.add_expr(ExprKind::Call { callee, args }, start.join(end))
    }

    fn parse_primary(&mut self) -> ExprId {
        let start = self.span();
        match self.peek_kind().clone() {
            TokenKind::IntLit => {
                let lexeme = self.bump().lexeme;
                let digits: String = lexeme.chars().take_while(|c| c.is_ascii_digit() || *c == '_').collect();
                let value = digits.replace('_', "").parse::<i128>().unwrap_or(0);
                self.ast.add_expr(ExprKind::IntLit(value), start)
            }
            TokenKind::FloatLit => {
                let lexeme = self.bump().lexeme;
                let digits: String = lexeme
                    .chars()
                    .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '_' || *c == 'e' || *c == 'E' || *c == '+' || *c == '-')
                    .collect();
                let value = digits.replace('_', "").parse::<f64>().unwrap_or(0.0);
                self.ast.add_expr(ExprKind::FloatLit(value), start)
            }
            TokenKind::StringLit | TokenKind::RawStringLit | TokenKind::InterpStringLit => {
                let lexeme = self.bump().lexeme;
                self.ast.add_expr(ExprKind::StringLit(lexeme), start)
            }
            TokenKind::CharLit => {
                let lexeme = self.bump().lexeme;
                let c = lexeme.chars().nth(1).unwrap_or('\0');
                self.ast.add_expr(ExprKind::CharLit(c), start)
            }
            TokenKind::BoolLit(b) => {
                self.bump();
                self.ast.add_expr(ExprKind::BoolLit(b), start)
            }
            TokenKind::NullLit => {
                self.bump();
                self.ast.add_expr(ExprKind::NullLit, start)
            }
            TokenKind::Ident | TokenKind::SelfKw => {
                let mut name = self.bump().lexeme;
                while self.at(&TokenKind::ColonColon) {
                    self.bump();
                    let seg = self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme;
                    name.push_str("::");
                    name.push_str(&seg);
                }
                let end = self.span();
                self.ast.add_expr(ExprKind::Ident(name), start.join(end))
            }
            TokenKind::LParen => {
                self.bump();
                let e = self.parse_expr();
                let end = self.span();
                self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
                self.ast.expr_mut(e).span = start.join(end);
                e
            }
            TokenKind::LBracket => {
                self.bump();
                let mut elems = Vec::new();
                while !self.at(&TokenKind::RBracket) && !self.peek().is_eof() {
                    elems.push(self.parse_expr());
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                let end = self.span();
                self.expect(TokenKind::RBracket, DiagCode::ExpectedToken);
                self.ast.add_expr(ExprKind::ArrayLit(elems), start.join(end))
            }
            TokenKind::Do => {
                self.bump();
                let body = self.parse_block();
                let (stmts, tail) = self.split_block_tail(body);
                let inner = self.ast.add_stmt(StmtKind::Block(stmts), self.ast.stmt_span(body));
                let end = self.ast.stmt_span(body);
                self.ast.add_expr(ExprKind::Block { stmts: inner, tail }, start.join(end))
            }
            TokenKind::If => {
                self.bump();
                self.expect(TokenKind::LParen, DiagCode::ExpectedToken);
                let cond = self.parse_expr();
                self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
                let then_branch = self.parse_block();
                self.expect(TokenKind::Else, DiagCode::BlockTailExprRequired);
                let else_branch = self.parse_block();
                let end = self.ast.stmt_span(else_branch);
                self.ast.add_expr(
                    ExprKind::If { cond, then_branch, else_branch: Some(else_branch) },
                    start.join(end),
                )
            }
            TokenKind::Loop => {
                self.bump();
                let body = self.parse_block();
                let end = self.ast.stmt_span(body);
                self.ast.add_expr(ExprKind::Loop { iter: None, body }, start.join(end))
            }
            TokenKind::Dollar => {
                let (name, call_tokens, span) = self.parse_macro_call_head();
                self.ast.add_expr(ExprKind::MacroCall { name, call_tokens }, span)
            }
            _ => {
                self.diags.error(DiagCode::UnexpectedToken, start, vec![self.peek_kind().to_string()]);
                if !self.peek().is_eof() {
                    self.bump();
                }
                self.ast.add_expr(ExprKind::Error, start)
            }
        }
    }

    /// Splits a parsed block's statement list so that a trailing bare
    /// expression statement becomes the block's tail value, matching the
    /// SIR-level `Expr.a = stmts, Expr.b = tail` invariant.
    fn split_block_tail(&mut self, block: StmtId) -> (Vec<StmtId>, Option<ExprId>) {
        let StmtKind::Block(stmts) = self.ast.stmt(block).kind.clone() else {
            return (Vec::new(), None);
        };
        if let Some(&last) = stmts.last() {
            if let StmtKind::ExprStmt(e) = self.ast.stmt(last).kind {
                return (stmts[..stmts.len() - 1].to_vec(), Some(e));
            }
        }
        (stmts, None)
    }

    // ---- macro call sites: `$name(...)` ----

    /// Consumes `$name(` up through the matching `)`, returning the macro
    /// name, the raw argument tokens (not including the parens), and the
    /// call's full span.
    fn parse_macro_call_head(&mut self) -> (String, Vec<Token>, Span) {
        let start = self.span();
        self.bump(); // $
        let name = self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme;
        self.expect(TokenKind::LParen, DiagCode::ExpectedToken);
        let mut depth = 1i32;
        let mut call_tokens = Vec::new();
        while depth > 0 && !self.peek().is_eof() {
            match self.peek_kind() {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            call_tokens.push(self.bump());
        }
        let end = self.span();
        self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
        (name, call_tokens, start.join(end))
    }

    fn parse_macro_call_stmt(&mut self) -> StmtId {
        let (name, call_tokens, span) = self.parse_macro_call_head();
        self.eat(TokenKind::Semi);
        self.ast.add_stmt(StmtKind::MacroCall { name, call_tokens }, span)
    }

    // ---- macro declaration parsing (feeds `crate::compiler::macros`) ----

    fn parse_macro_decl(&mut self) -> StmtId {
        let start = self.span();
        self.bump(); // macro
        let name = self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme;
        self.expect(TokenKind::LBrace, DiagCode::ExpectedToken);
        let mut groups = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.peek().is_eof() {
            groups.push(self.parse_macro_group());
        }
        let end = self.span();
        self.expect(TokenKind::RBrace, DiagCode::ExpectedToken);
        self.ast.add_stmt(StmtKind::MacroDecl { name, groups }, start.join(end))
    }

    fn parse_macro_group(&mut self) -> MacroGroup {
        let context = match self.bump().lexeme.as_str() {
            "expr" => MacroContextKind::Expr,
            "stmt" => MacroContextKind::Stmt,
            "item" => MacroContextKind::Item,
            "type" => MacroContextKind::Type,
            _ => MacroContextKind::Token,
        };
        self.expect(TokenKind::LBrace, DiagCode::ExpectedToken);
        let mut arms = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.peek().is_eof() {
            arms.push(self.parse_macro_arm());
        }
        self.expect(TokenKind::RBrace, DiagCode::ExpectedToken);
        MacroGroup { context, arms }
    }

    fn parse_macro_arm(&mut self) -> MacroArm {
        self.expect(TokenKind::LParen, DiagCode::ExpectedToken);
        let mut captures = Vec::new();
        while !self.at(&TokenKind::RParen) && !self.peek().is_eof() {
            let name = self.expect(TokenKind::Ident, DiagCode::UnexpectedToken).lexeme;
            self.expect(TokenKind::Colon, DiagCode::ExpectedToken);
            let fragment_kind = match self.bump().lexeme.as_str() {
                "expr" => MacroCaptureKind::Expr,
                "stmt" => MacroCaptureKind::Stmt,
                "item" => MacroCaptureKind::Item,
                "type" => MacroCaptureKind::Type,
                "tt" => MacroCaptureKind::Tt,
                "ident" => MacroCaptureKind::Ident,
                "path" => MacroCaptureKind::Path,
                "block" => MacroCaptureKind::Block,
                _ => MacroCaptureKind::Tt,
            };
            let variadic = self.eat(TokenKind::DotDotDot);
            captures.push(MacroCaptureSpec { name, fragment_kind, variadic });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, DiagCode::ExpectedToken);
        self.expect(TokenKind::FatArrow, DiagCode::ExpectedToken);
        self.expect(TokenKind::LBrace, DiagCode::ExpectedToken);
        let mut depth = 1i32;
        let mut template_tokens = Vec::new();
        while depth > 0 && !self.peek().is_eof() {
            let tok = self.bump();
            match tok.kind {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            template_tokens.push(tok);
        }
        MacroArm { captures, template: template_tokens }
    }
}

fn is_expr_start(kind: &TokenKind) -> bool {
    !matches!(
        kind,
        TokenKind::RBrace
            | TokenKind::Eof
            | TokenKind::Case
            | TokenKind::Default
            | TokenKind::Else
            | TokenKind::Elif
    )
}
