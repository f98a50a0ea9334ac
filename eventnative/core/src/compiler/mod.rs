//! Expression compiler.
//!
//! Expressions inside a small JavaScript subset (property paths over `$`,
//! object and array literals with spreads, scalar literals) compile into a
//! [`NativePlan`]. Everything else is reported as
//! [`Compilation::NotRepresentable`] and runs in a template worker.

pub mod lexer;
pub mod parser;
pub mod plan;

pub use plan::{Element, Member, NativePlan, Node, Segment};

use crate::error::Error;
use tracing::debug;

/// Outcome of compiling one expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Compilation {
    /// The expression runs in-process.
    Native(NativePlan),
    /// The expression needs the scripting runtime; carries the reason.
    NotRepresentable(String),
}

impl Compilation {
    pub fn is_native(&self) -> bool {
        matches!(self, Compilation::Native(_))
    }
}

/// Compiles an expression. Only blank input is an error; anything outside
/// the native grammar comes back as `NotRepresentable`.
pub fn compile(source: &str) -> Result<Compilation, Error> {
    ensure_not_blank(source)?;

    let tokens = match lexer::tokenize(source) {
        Ok(tokens) => tokens,
        Err(span) => {
            let reason = format!("unsupported syntax at {}..{}", span.start, span.end);
            debug!(%reason, "expression left to runtime");
            return Ok(Compilation::NotRepresentable(reason));
        }
    };

    match parser::Parser::new(source, &tokens).parse_program() {
        Ok(root) => Ok(Compilation::Native(NativePlan::new(root))),
        Err(rejection) => {
            debug!(reason = %rejection.reason, "expression left to runtime");
            Ok(Compilation::NotRepresentable(rejection.reason))
        }
    }
}

pub(crate) fn ensure_not_blank(source: &str) -> Result<(), Error> {
    if source.trim().is_empty() {
        return Err(Error::Compilation {
            message: "expression is empty".to_string(),
        });
    }
    Ok(())
}
