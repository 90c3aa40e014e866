//! Lexer: source text + `file_id` -> ordered token sequence terminated by
//! `Eof`. Comments are skipped; unknown characters report a diagnostic and
//! lexing continues (the lexer itself never halts).

use crate::compiler::diagnostics::{DiagCode, DiagnosticsBag, Severity};
use crate::compiler::tokens::{Span, Token, TokenKind};

pub struct Lexer {
    chars: Vec<char>,
    file_id: u32,
    pos: usize,
    byte_pos: u32,
}

impl Lexer {
    pub fn new(src: &str, file_id: u32) -> Self {
        Self { chars: src.chars().collect(), file_id, pos: 0, byte_pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<char> {
        self.chars.get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        self.byte_pos += c.len_utf8() as u32;
        Some(c)
    }

    fn span_from(&self, start: u32) -> Span {
        Span::new(self.file_id, start, self.byte_pos)
    }

    pub fn tokenize(mut self, diags: &mut DiagnosticsBag) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let start = self.byte_pos;
            let Some(c) = self.peek() else {
                tokens.push(Token::eof(self.span_from(start)));
                break;
            };

            if c.is_ascii_digit() {
                tokens.push(self.lex_number(start));
                continue;
            }
            if c == '_' || c.is_alphabetic() {
                tokens.push(self.lex_ident_or_keyword(start));
                continue;
            }
            if c == '"' {
                tokens.push(self.lex_string(start, diags));
                continue;
            }
            if c == '\'' {
                tokens.push(self.lex_char(start, diags));
                continue;
            }
            if c == 'R' && self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') && self.peek_at(3) == Some('"') {
                tokens.push(self.lex_triple_string(start, TokenKind::RawStringLit));
                continue;
            }
            if c == 'F' && self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') && self.peek_at(3) == Some('"') {
                tokens.push(self.lex_triple_string(start, TokenKind::InterpStringLit));
                continue;
            }

            if let Some(tok) = self.lex_punct(start) {
                tokens.push(tok);
                continue;
            }

            self.bump();
            diags.error(
                DiagCode::UnexpectedCharacter,
                self.span_from(start),
                vec![c.to_string()],
            );
        }
        tokens
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            None => break,
                            Some('*') if self.peek_at(1) == Some('/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            _ => {
                                self.bump();
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_number(&mut self, start: u32) -> Token {
        let mut is_float = false;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '_') {
            self.bump();
        }
        if self.peek() == Some('.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '_') {
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.bump();
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        // suffix letters are part of the lexeme, never separate tokens.
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric()) {
            self.bump();
        }
        let lexeme: String = self.chars[(start as usize)..self.pos].iter().collect();
        let kind = if is_float { TokenKind::FloatLit } else { TokenKind::IntLit };
        Token::new(kind, lexeme, self.span_from(start))
    }

    fn lex_ident_or_keyword(&mut self, start: u32) -> Token {
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.bump();
        }
        let lexeme: String = self.chars[(start as usize)..self.pos].iter().collect();
        let kind = keyword_kind(&lexeme).unwrap_or(TokenKind::Ident);
        Token::new(kind, lexeme, self.span_from(start))
    }

    fn lex_string(&mut self, start: u32, diags: &mut DiagnosticsBag) -> Token {
        self.bump(); // opening quote
        let mut closed = false;
        loop {
            match self.peek() {
                None => break,
                Some('"') => {
                    self.bump();
                    closed = true;
                    break;
                }
                Some('\\') => {
                    self.bump();
                    self.bump();
                }
                Some('\n') => break,
                Some(_) => {
                    self.bump();
                }
            }
        }
        if !closed {
            diags.error(DiagCode::UnterminatedString, self.span_from(start), vec![]);
        }
        let lexeme: String = self.chars[(start as usize)..self.pos].iter().collect();
        Token::new(TokenKind::StringLit, lexeme, self.span_from(start))
    }

    fn lex_triple_string(&mut self, start: u32, kind: TokenKind) -> Token {
        self.bump(); // R or F
        self.bump();
        self.bump();
        self.bump(); // consumed `"""` opening (3 quote chars) plus prefix letter
        loop {
            if self.peek().is_none() {
                break;
            }
            if self.peek() == Some('"') && self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') {
                self.bump();
                self.bump();
                self.bump();
                break;
            }
            self.bump();
        }
        let lexeme: String = self.chars[(start as usize)..self.pos].iter().collect();
        Token::new(kind, lexeme, self.span_from(start))
    }

    fn lex_char(&mut self, start: u32, diags: &mut DiagnosticsBag) -> Token {
        self.bump(); // opening quote
        let mut closed = false;
        loop {
            match self.peek() {
                None | Some('\n') => break,
                Some('\'') => {
                    self.bump();
                    closed = true;
                    break;
                }
                Some('\\') => {
                    self.bump();
                    self.bump();
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
        if !closed {
            diags.error(DiagCode::UnterminatedString, self.span_from(start), vec![]);
        }
        let lexeme: String = self.chars[(start as usize)..self.pos].iter().collect();
        Token::new(TokenKind::CharLit, lexeme, self.span_from(start))
    }

    fn lex_punct(&mut self, start: u32) -> Option<Token> {
        use TokenKind::*;
        let three = (self.peek(), self.peek_at(1), self.peek_at(2));
        if three == (Some('?'), Some('?'), Some('=')) {
            self.bump();
            self.bump();
            self.bump();
            return Some(self.finish_punct(start, QuestionQuestionEq));
        }
        if three == (Some('.'), Some('.'), Some('.')) {
            self.bump();
            self.bump();
            self.bump();
            return Some(self.finish_punct(start, DotDotDot));
        }

        let two = (self.peek(), self.peek_at(1));
        let two_kind = match two {
            (Some(':'), Some(':')) => Some(ColonColon),
            (Some('-'), Some('>')) => Some(Arrow),
            (Some('='), Some('>')) => Some(FatArrow),
            (Some('&'), Some('&')) => Some(AmpAmp),
            (Some('|'), Some('|')) => Some(PipePipe),
            (Some('?'), Some('?')) => Some(QuestionQuestion),
            (Some('?'), Some(':')) => Some(QuestionColon),
            (Some('!'), Some('=')) => Some(BangEq),
            (Some('='), Some('=')) => Some(EqEq),
            (Some('<'), Some('=')) => Some(Le),
            (Some('>'), Some('=')) => Some(Ge),
            (Some('<'), Some('<')) => Some(Shl),
            (Some('>'), Some('>')) => Some(Shr),
            (Some('.'), Some('.')) => Some(DotDot),
            _ => None,
        };
        if let Some(kind) = two_kind {
            self.bump();
            self.bump();
            return Some(self.finish_punct(start, kind));
        }

        let one = match self.peek()? {
            '(' => LParen,
            ')' => RParen,
            '{' => LBrace,
            '}' => RBrace,
            '[' => LBracket,
            ']' => RBracket,
            ',' => Comma,
            ':' => Colon,
            ';' => Semi,
            '.' => Dot,
            '&' => Amp,
            '^' => Caret,
            '|' => Pipe,
            '~' => Tilde,
            '?' => Question,
            '!' => Bang,
            '=' => Eq,
            '<' => Lt,
            '>' => Gt,
            '+' => Plus,
            '-' => Minus,
            '*' => Star,
            '/' => Slash,
            '%' => Percent,
            '$' => Dollar,
            _ => return None,
        };
        self.bump();
        Some(self.finish_punct(start, one))
    }

    fn finish_punct(&self, start: u32, kind: TokenKind) -> Token {
        let lexeme: String = self.chars[(start as usize)..self.pos].iter().collect();
        Token::new(kind, lexeme, self.span_from(start))
    }
}

fn keyword_kind(s: &str) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match s {
        "let" => Let,
        "set" => Set,
        "static" => Static,
        "mut" => Mut,
        "if" => If,
        "elif" => Elif,
        "else" => Else,
        "while" => While,
        "do" => Do,
        "manual" => Manual,
        "switch" => Switch,
        "case" => Case,
        "default" => Default,
        "return" => Return,
        "break" => Break,
        "continue" => Continue,
        "use" => Use,
        "nest" => Nest,
        "fn" => Fn,
        "field" => Field,
        "acts" => Acts,
        "for" => For,
        "as" => As,
        "pub" => Pub,
        "sub" => Sub,
        "extern" => Extern,
        "ffi" => Ffi,
        "func" => Func,
        "struct" => Struct,
        "loop" => Loop,
        "self" => SelfKw,
        "macro" => MacroKw,
        "true" => BoolLit(true),
        "false" => BoolLit(false),
        "null" => NullLit,
        _ => return None,
    })
}

/// Runs the lexer over `src`, ignoring the lifetime entanglement of
/// `src` itself — every emitted token owns a copy of its lexeme.
pub fn lex(src: &str, file_id: u32, diags: &mut DiagnosticsBag) -> Vec<Token> {
    Lexer::new(src, file_id).tokenize(diags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<TokenKind> {
        let mut diags = DiagnosticsBag::new(64);
        lex(src, 1, &mut diags).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_keywords_and_idents() {
        let kinds = toks("let x = 1i32;");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Let,
                TokenKind::Ident,
                TokenKind::Eq,
                TokenKind::IntLit,
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_escape_and_borrow_operators() {
        let kinds = toks("&& & &mut");
        assert_eq!(
            kinds,
            vec![TokenKind::AmpAmp, TokenKind::Amp, TokenKind::Amp, TokenKind::Mut, TokenKind::Eof]
        );
    }

    #[test]
    fn reports_unterminated_string() {
        let mut diags = DiagnosticsBag::new(64);
        lex("\"abc", 1, &mut diags);
        assert!(diags.has_errors());
    }

    #[test]
    fn unknown_character_does_not_halt_lexing() {
        let mut diags = DiagnosticsBag::new(64);
        let tokens = lex("let x `= 1;", 1, &mut diags);
        assert!(diags.has_errors());
        assert!(tokens.iter().any(|t| matches!(t.kind, TokenKind::Eof)));
    }
}
