//! The evaluation loop's engine.

use crate::error::Error;
use crate::jit;
use crate::runtime::ExecMemory;
use crate::table::Table;
use crate::token;
use std::io;

/// A calculator session. Definitions accumulate in the table and the code
/// arena; expressions are staged in the arena's scratch area, run once and
/// overwritten by the next line.
pub struct Shell {
	table: Table,
	memory: ExecMemory,
	/// Dump each compiled chunk to stderr before running it.
	pub disassemble: bool,
}

impl Shell {
	pub fn new() -> io::Result<Self> {
		Ok(Self {
			table: Table::new(),
			memory: ExecMemory::new()?,
			disassemble: false,
		})
	}

	/// The compiled-code region, for fault-handler installation.
	pub fn memory(&self) -> &ExecMemory {
		&self.memory
	}

	/// Compile and run one line. A definition yields `None`, an expression
	/// its value.
	pub fn evaluate(&mut self, line: &str) -> Result<Option<f32>, Error> {
		let tokens = token::tokenize(line, &self.table)?;
		let chunk = jit::compile(&tokens, &mut self.table, &self.memory)?;
		if self.disassemble {
			eprintln!("{:?}", chunk);
		}
		match &chunk.function {
			Some(name) => {
				if let Err(e) = self.memory.commit(&chunk.code) {
					// The name was registered during compilation; a block
					// that never made it into the arena must not stay
					// callable.
					self.table.remove(name);
					return Err(e.into());
				}
				Ok(None)
			}
			None => {
				let offset = self.memory.stage(&chunk.code)?;
				// SAFETY: `offset` is the entry of the block staged on the
				// line above, built for this arena state.
				let value = unsafe { self.memory.expr_entry(offset)(chunk.constants.as_ptr()) };
				Ok(Some(value))
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::jit::CompileError;
	use crate::token::TokenError;

	#[test]
	fn expressions_do_not_consume_the_arena() {
		let mut s = Shell::new().unwrap();
		let before = s.memory().occupied();
		s.evaluate("1 + 2 * 3").unwrap();
		s.evaluate("sqrt 16").unwrap();
		assert_eq!(s.memory().occupied(), before);
	}

	#[test]
	fn definitions_consume_the_arena() {
		let mut s = Shell::new().unwrap();
		let before = s.memory().occupied();
		s.evaluate("function double(x) = x + x").unwrap();
		let after_first = s.memory().occupied();
		assert!(after_first > before);
		s.evaluate("function triple(x) = x + x + x").unwrap();
		assert!(s.memory().occupied() > after_first);
		// Both stay callable; expressions between them change nothing.
		assert_eq!(s.evaluate("double(3)").unwrap(), Some(6.0));
		assert_eq!(s.evaluate("triple(3)").unwrap(), Some(9.0));
	}

	#[test]
	fn redefinition_is_rejected() {
		let mut s = Shell::new().unwrap();
		s.evaluate("function f(x) = x").unwrap();
		assert_eq!(
			s.evaluate("function f(x) = x + 1").unwrap_err(),
			Error::Token(TokenError::Aliases("f".into()))
		);
		// The original still answers.
		assert_eq!(s.evaluate("f(5)").unwrap(), Some(5.0));
	}

	#[test]
	fn arena_exhaustion_rolls_the_name_back() {
		let mut s = Shell::new().unwrap();
		// Letter-only names, the lexer accepts nothing else.
		let name = |mut n: usize| {
			let mut s = String::from("f");
			loop {
				s.push((b'a' + (n % 26) as u8) as char);
				n /= 26;
				if n == 0 {
					break s;
				}
			}
		};
		let mut failed = None;
		for i in 0..4000 {
			let line = format!("function {}(x) = x + 1", name(i));
			match s.evaluate(&line) {
				Ok(None) => (),
				Err(e) => {
					assert_eq!(e.category(), "MemoryError", "{}", e);
					failed = Some(i);
					break;
				}
				Ok(Some(_)) => panic!("a definition produced a value"),
			}
		}
		let failed = failed.expect("a 64 KiB arena cannot hold 4000 definitions");
		// The failed name must not remain callable...
		assert_eq!(
			s.evaluate(&format!("{}(1)", name(failed))).unwrap_err(),
			Error::Compile(CompileError::Undefined(name(failed).into()))
		);
		// ...while every earlier one stays registered. Running one needs
		// scratch space the full arena may no longer have, so both
		// outcomes are legitimate here.
		match s.evaluate(&format!("{}(41)", name(failed - 1))) {
			Ok(value) => assert_eq!(value, Some(42.0)),
			Err(e) => assert_eq!(e.category(), "MemoryError", "{}", e),
		}
	}
}
