//! The shared, append-only diagnostics bag.
//!
//! Every stage of the pipeline reports through this bag instead of failing
//! fast: the core never throws. Locale-specific rendering and source-context
//! snippets are left to a separate presentation layer; this module only
//! produces `(severity, code, span, args)` tuples plus stable dedup and a
//! fatal abort flag.

use crate::compiler::tokens::Span;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Fatal,
}

/// Stable diagnostic code, grouped by subsystem prefix: lexing, parsing,
/// name resolution, type checking, capability analysis (`Borrow*`/`Escape*`/
/// `Sir*`), and macro expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagCode {
    // lexing
    UnexpectedCharacter,
    UnterminatedString,

    // parsing
    ExpectedToken,
    UnexpectedToken,
    UnexpectedEof,
    TooManyErrors,
    WhileBodyExpectedBlock,
    SwitchCaseExpectedColon,
    VarDeclTypeAnnotationRequired,
    VarDeclNameExpected,
    SetInitializerRequired,
    VarDeclInitializerExpected,
    FnNameExpected,
    FieldMemberNameExpected,
    CastTargetTypeExpected,
    BlockTailExprRequired,
    BareBlockScopePreferDo,
    ActsForNotSupported,
    AmbiguousAmpPrefixChain,
    CallNoArgsAfterNamedGroup,
    PubSubOnlyAllowedInClass,

    // name resolution
    UndefinedName,
    DuplicateDecl,
    Shadowing,
    ShadowingNotAllowed,
    ActsNameExpected,

    // type checking
    TypeMismatch,
    TypeLetInitMismatch,
    SetCannotInferFromNull,
    TypeBreakValueOnlyInLoopExpr,
    TypeBorrowNotAllowedInPureComptime,
    TypeEscapeNotAllowedInPureComptime,

    // capability analysis (SIR)
    BorrowOperandMustBePlace,
    BorrowOperandMustBeOwnedPlace,
    BorrowMutRequiresMutablePlace,
    BorrowMutConflict,
    BorrowMutConflictWithShared,
    BorrowSharedConflictWithMut,
    BorrowSharedWriteConflict,
    BorrowMutDirectAccessConflict,
    BorrowEscapeFromReturn,
    BorrowEscapeToStorage,
    EscapeOperandMustBePlace,
    EscapeOperandMustNotBeBorrow,
    EscapeWhileBorrowActive,
    EscapeWhileMutBorrowActive,
    SirEscapeBoundaryViolation,
    SirEscapeMustNotMaterialize,
    SirUseAfterEscapeMove,

    // macro expansion
    MacroNoMatch,
    MacroReparseFail,
    MacroRecursionBudget,
    MacroTokenUnimplemented,

    // OIR verification
    OirVerifyFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagCode,
    pub span: Span,
    pub args: Vec<String>,
}

/// Append-only diagnostics bag shared by every stage.
///
/// Dedup is two-layered: an exact `(severity, code, span)` hash set, and a
/// "same lo + same code" suppression of adjacent duplicates produced by
/// parser recovery re-entering the same broken construct.
#[derive(Debug, Default)]
pub struct DiagnosticsBag {
    diagnostics: Vec<Diagnostic>,
    seen: HashSet<(Severity, DiagCode, Span)>,
    last_lo_by_code: std::collections::HashMap<DiagCode, u32>,
    abort: bool,
    max_errors: usize,
    error_count: usize,
}

impl DiagnosticsBag {
    pub fn new(max_errors: usize) -> Self {
        Self { max_errors, ..Default::default() }
    }

    pub fn report(&mut self, severity: Severity, code: DiagCode, span: Span, args: Vec<String>) {
        let key = (severity, code, span);
        if self.seen.contains(&key) {
            return;
        }
        if let Some(&last_lo) = self.last_lo_by_code.get(&code) {
            if last_lo == span.lo {
                return;
            }
        }
        self.seen.insert(key);
        self.last_lo_by_code.insert(code, span.lo);

        if matches!(severity, Severity::Error | Severity::Fatal) {
            self.error_count += 1;
        }
        if matches!(severity, Severity::Fatal) {
            self.abort = true;
        }
        self.diagnostics.push(Diagnostic { severity, code, span, args });

        if self.max_errors > 0 && self.error_count > self.max_errors {
            self.abort = true;
            let key2 = (Severity::Fatal, DiagCode::TooManyErrors, Span::dummy());
            if !self.seen.contains(&key2) {
                self.seen.insert(key2);
                self.diagnostics.push(Diagnostic {
                    severity: Severity::Fatal,
                    code: DiagCode::TooManyErrors,
                    span: Span::dummy(),
                    args: vec![self.max_errors.to_string()],
                });
            }
        }
    }

    pub fn error(&mut self, code: DiagCode, span: Span, args: Vec<String>) {
        self.report(Severity::Error, code, span, args);
    }

    pub fn warning(&mut self, code: DiagCode, span: Span, args: Vec<String>) {
        self.report(Severity::Warning, code, span, args);
    }

    pub fn fatal(&mut self, code: DiagCode, span: Span, args: Vec<String>) {
        self.report(Severity::Fatal, code, span, args);
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn should_abort(&self) -> bool {
        self.abort
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }
}
