//! Line-level error taxonomy.
//!
//! Everything here aborts only the line that caused it; the session keeps
//! going. Hardware faults in generated code are a different animal and are
//! handled by [`crate::runtime::fault`], which ends the process.

use crate::jit::CompileError;
use crate::runtime::MemoryError;
use crate::token::TokenError;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
	#[error(transparent)]
	Token(#[from] TokenError),
	#[error(transparent)]
	Compile(#[from] CompileError),
	#[error(transparent)]
	Memory(#[from] MemoryError),
}

impl Error {
	/// The class tag the REPL prefixes messages with.
	pub fn category(&self) -> &'static str {
		match self {
			Self::Token(_) => "TokenError",
			Self::Compile(_) => "SyntaxError",
			Self::Memory(_) => "MemoryError",
		}
	}
}
