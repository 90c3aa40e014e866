//! Source-to-OIR compiler core.
//!
//! This crate drives the full pipeline — lexing, parsing, name resolution,
//! type checking, SIR lowering, capability analysis, OIR lowering, and
//! textual LLVM-IR emission — without ever failing fast: every stage reports
//! into a shared [`compiler::diagnostics::DiagnosticsBag`] and later stages
//! still run on a best-effort basis so a caller gets as complete a picture
//! as possible from a single pass. [`compile`] is the only entry point most
//! callers need; the individual stages remain public for tooling that wants
//! to stop partway (an LSP wants tokens and the AST; a linter wants just
//! diagnostics).

pub mod compiler;

use compiler::ast::Ast;
use compiler::capability;
use compiler::diagnostics::{Diagnostic, DiagnosticsBag, Severity};
use compiler::emit::Emitter;
use compiler::oir::{self, OirModule};
use compiler::resolve::{Resolver, ShadowPolicy, SymbolTable};
use compiler::sir::{self, SirBuilder, SirModule};
use compiler::source::SourceManager;
use compiler::tokens::Span;
use compiler::typecheck::TypeChecker;
use compiler::types::TypePool;
use thiserror::Error;

/// Ceiling passed to [`DiagnosticsBag::new`]; past this many errors a
/// `TooManyErrors` fatal diagnostic is raised and later stages are skipped.
const MAX_ERRORS: usize = 200;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation failed with {0} diagnostic(s)")]
    Diagnostics(usize),
}

/// Everything produced by a single [`compile`] call, kept around so a
/// caller can inspect any intermediate stage (useful for golden tests and
/// for tools that want to print SIR/OIR without re-running the pipeline).
pub struct CompileOutput {
    pub ast: Ast,
    pub types: TypePool,
    pub symbols: SymbolTable,
    pub sir: SirModule,
    pub oir: OirModule,
    pub llvm_ir: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// Runs every stage of the pipeline over a single compilation unit.
///
/// Returns `Ok` with whatever was produced even when warnings were
/// reported; only a fatal/abort condition (unrecoverable parse failure, an
/// error count over [`MAX_ERRORS`], or a capability-analysis failure) turns
/// into `Err`. The diagnostics bag's contents are always available on the
/// success path via [`CompileOutput::diagnostics`], and on the error path
/// by constructing a bag yourself with the lower-level stage functions.
pub fn compile(source_name: &str, source: &str) -> Result<CompileOutput, CompileError> {
    let mut sources = SourceManager::new();
    let file_id = sources.add_file(source_name, source);

    let mut diags = DiagnosticsBag::new(MAX_ERRORS);
    let tokens = compiler::lexer::lex(sources.text(file_id), file_id, &mut diags);
    if diags.should_abort() {
        return Err(CompileError::Diagnostics(diags.error_count()));
    }

    let mut ast = Ast::new();
    let mut types = TypePool::new();
    let root = {
        let mut parser = compiler::parser::Parser::new(tokens, &mut ast, &mut types, &mut diags);
        parser.parse_program()
    };
    if diags.should_abort() {
        return Err(CompileError::Diagnostics(diags.error_count()));
    }

    compiler::macros::expand_macros(&mut ast, &mut types, &mut diags, root);
    if diags.should_abort() {
        return Err(CompileError::Diagnostics(diags.error_count()));
    }

    let symbols = Resolver::new(&ast, &mut diags, ShadowPolicy::Warn).resolve_program(root);
    if diags.should_abort() {
        return Err(CompileError::Diagnostics(diags.error_count()));
    }

    let (symbol_types, fn_sigs) = {
        let mut checker = TypeChecker::new(&mut ast, &mut types, &symbols, &mut diags);
        checker.check_program(root);
        (checker.symbol_types().clone(), checker.fn_sigs().clone())
    };
    if diags.should_abort() {
        return Err(CompileError::Diagnostics(diags.error_count()));
    }

    let mut sir_module = {
        let builder = SirBuilder::new(&ast, &mut types, &symbols, &symbol_types, &fn_sigs, &mut diags);
        builder.build(root)
    };
    sir::canonicalize_for_capability(&mut sir_module);
    if !sir::has_clean_verify(&sir_module, &mut diags, Span::dummy()) {
        return Err(CompileError::Diagnostics(diags.error_count()));
    }

    let capability_clean = capability::run_capability_analysis(&mut sir_module, &types, &mut diags);
    if !capability_clean || diags.has_errors() {
        return Err(CompileError::Diagnostics(diags.error_count()));
    }

    let oir_module = oir::OirBuilder::new(&sir_module, &mut types, &mut diags).build();
    if !oir::has_clean_verify(&oir_module, &mut diags, Span::dummy()) {
        return Err(CompileError::Diagnostics(diags.error_count()));
    }

    let llvm_ir = Emitter::new(&oir_module, &types).emit();

    Ok(CompileOutput {
        ast,
        types,
        symbols,
        sir: sir_module,
        oir: oir_module,
        llvm_ir,
        diagnostics: diags.diagnostics().to_vec(),
    })
}

/// True if any diagnostic in `diags` is at or above [`Severity::Error`].
pub fn has_blocking_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| matches!(d.severity, Severity::Error | Severity::Fatal))
}
