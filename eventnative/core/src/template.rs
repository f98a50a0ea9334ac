//! Registered templates.

use crate::compiler::{self, Compilation, NativePlan};
use crate::error::Error;

/// A named transformation expression, compiled when the native grammar allows it.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    /// Registration name, used in logs and error reports.
    pub name: String,
    /// Expression text exactly as supplied.
    pub source: String,
    /// Native plan, absent when the expression needs the scripting runtime.
    pub compiled: Option<NativePlan>,
}

impl Template {
    /// Compiles `source` and records the outcome.
    ///
    /// Expressions outside the native grammar are not an error; they simply
    /// carry no plan.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Result<Self, Error> {
        let source = source.into();
        let compiled = match compiler::compile(&source)? {
            Compilation::Native(plan) => Some(plan),
            Compilation::NotRepresentable(_) => None,
        };
        Ok(Self {
            name: name.into(),
            source,
            compiled,
        })
    }

    /// A template that always goes through the scripting runtime.
    pub fn raw(name: impl Into<String>, source: impl Into<String>) -> Result<Self, Error> {
        let source = source.into();
        compiler::ensure_not_blank(&source)?;
        Ok(Self {
            name: name.into(),
            source,
            compiled: None,
        })
    }

    pub fn is_native(&self) -> bool {
        self.compiled.is_some()
    }
}
