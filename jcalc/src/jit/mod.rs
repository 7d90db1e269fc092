//! Compiling a token list to native code.

#[cfg(target_arch = "x86_64")]
mod x64;
#[cfg(not(target_arch = "x86_64"))]
compile_error!("only x86-64 code generation is implemented");

use crate::runtime::ExecMemory;
use crate::table::Table;
use crate::token::TokenList;
use thiserror::Error;

/// A finished block of machine code, not yet placed in the arena.
pub struct Chunk {
	/// Instruction bytes; a definition's backfilled literals follow them.
	pub code: Vec<u8>,
	/// Length of the instruction bytes alone.
	pub text: usize,
	/// Literal pool a top-level expression receives through its argument.
	pub constants: Vec<f32>,
	/// Name this block was registered under, if it is a definition.
	pub function: Option<Box<str>>,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum CompileError {
	#[error("expected expression")]
	ExpectedExpression,
	#[error("expected '(' after the function name")]
	DefMissingParen,
	#[error("functions take exactly one argument")]
	DefArity,
	#[error("expected an argument name in the definition")]
	DefMissingParam,
	#[error("expected ')' closing the argument list")]
	DefUnclosed,
	#[error("expected '=' after the function definition")]
	DefMissingEquals,
	#[error("function '{0}' is not defined")]
	Undefined(Box<str>),
	#[error("a call's argument must be parenthesized")]
	CallMissingParen,
	#[error("expected ')' after the call's argument")]
	CallUnclosed,
	#[error("expected closing ')'")]
	UnclosedGroup,
	#[error("expected 'then'")]
	ExpectedThen,
	#[error("expected 'else'")]
	ExpectedElse,
	#[error("trailing tokens after the expression")]
	TrailingTokens,
	#[error("expression needs too many registers")]
	RegisterPressure,
	#[error("a conditional arm is too large to branch over")]
	BranchRange,
}

/// Compile one line of tokens against the current session state.
///
/// A definition registers its name in `table` before its body is parsed,
/// which is what makes recursion work; on failure the registration is
/// rolled back before the error is returned. Nothing is written to
/// `memory` here, the caller decides whether to stage or commit the chunk.
pub fn compile(
	tokens: &TokenList,
	table: &mut Table,
	memory: &ExecMemory,
) -> Result<Chunk, CompileError> {
	x64::compile(tokens, table, memory)
}

#[cfg(not(feature = "iced"))]
impl core::fmt::Debug for Chunk {
	fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
		f.debug_struct(stringify!(Chunk))
			.field("text", &self.text)
			.field("len", &self.code.len())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::error::Error;
	use crate::shell::Shell;
	use crate::token::tokenize;
	use proptest::prelude::*;

	fn shell() -> Shell {
		Shell::new().unwrap()
	}

	fn eval(shell: &mut Shell, line: &str) -> f32 {
		shell.evaluate(line).unwrap().unwrap()
	}

	fn eval1(line: &str) -> f32 {
		eval(&mut shell(), line)
	}

	#[test]
	fn literals() {
		assert_eq!(eval1("42"), 42.0);
		assert_eq!(eval1("1.5"), 1.5);
	}

	#[test]
	fn arithmetic() {
		assert_eq!(eval1("1 + 2"), 3.0);
		assert_eq!(eval1("10 - 4"), 6.0);
		assert_eq!(eval1("6 * 7"), 42.0);
		assert_eq!(eval1("1 / 2"), 0.5);
	}

	#[test]
	fn precedence() {
		assert_eq!(eval1("1 + 2 * 3"), 7.0);
		assert_eq!(eval1("1 * 2 + 3"), 5.0);
		assert_eq!(eval1("2 * 3 - 4 / 2"), 4.0);
	}

	#[test]
	fn left_associativity() {
		assert_eq!(eval1("10 - 4 - 3"), 3.0);
		assert_eq!(eval1("16 / 4 / 2"), 2.0);
	}

	#[test]
	fn grouping() {
		assert_eq!(eval1("(1 + 2) * 3"), 9.0);
		assert_eq!(eval1("((4))"), 4.0);
	}

	#[test]
	fn negation() {
		assert_eq!(eval1("-5 + 2"), -3.0);
		assert_eq!(eval1("-(1 + 2)"), -3.0);
		assert_eq!(eval1("--3"), 3.0);
	}

	#[test]
	fn square_root() {
		assert_eq!(eval1("sqrt 16"), 4.0);
		assert_eq!(eval1("sqrt(2 + 2) + 1"), 3.0);
	}

	#[test]
	fn division_by_zero_is_infinite() {
		assert_eq!(eval1("1 / 0"), f32::INFINITY);
		assert_eq!(eval1("-1 / 0"), f32::NEG_INFINITY);
	}

	#[test]
	fn equality() {
		assert_eq!(eval1("2 == 2"), 1.0);
		assert_eq!(eval1("2 == 3"), 0.0);
		assert_eq!(eval1("1 + 1 == 2"), 1.0);
	}

	#[test]
	fn modulo_is_floor_based() {
		assert_eq!(eval1("7 % 3"), 1.0);
		assert_eq!(eval1("8 % 4"), 0.0);
		assert_eq!(eval1("7.5 % 2"), 1.5);
		// Follows the sign of the divisor, like floor division.
		assert_eq!(eval1("(0 - 7) % 3"), 2.0);
		// The unary operand is parsed at factor level, so '%' folds into
		// the negated value: -7 % 3 reads as -(7 % 3).
		assert_eq!(eval1("-7 % 3"), -1.0);
	}

	#[test]
	fn conditionals() {
		assert_eq!(eval1("if 1 == 1 then 10 else 20"), 10.0);
		assert_eq!(eval1("if 1 == 2 then 10 else 20"), 20.0);
		// Truth is equality with 1.0.
		assert_eq!(eval1("if 2 then 3 else 4"), 4.0);
		assert_eq!(eval1("1 + if 0 == 0 then 1 else 2"), 2.0);
	}

	#[test]
	fn nested_conditionals() {
		let mut s = shell();
		let pick = "if x == 1 then 10 else if x == 2 then 20 else 30";
		assert!(s.evaluate(&format!("function pick(x) = {pick}")).unwrap().is_none());
		assert_eq!(eval(&mut s, "pick(1)"), 10.0);
		assert_eq!(eval(&mut s, "pick(2)"), 20.0);
		assert_eq!(eval(&mut s, "pick(3)"), 30.0);
	}

	#[test]
	fn oversized_conditional_arm_is_reported() {
		let mut s = shell();
		// 26 fused adds put the then arm past what a rel8 branch reaches.
		let sum = (1..=26).map(|i| i.to_string()).collect::<Vec<_>>().join(" + ");
		assert_eq!(
			s.evaluate(&format!("if 1 == 1 then {sum} else 0")).unwrap_err(),
			Error::Compile(CompileError::BranchRange)
		);
		// Two recursive calls plus a spill in an else arm trip it too, and
		// the definition rolls back like any other failed line.
		let fib = "function fib(n) = if n == 0 then 0 \
			else if n == 1 then 1 \
			else fib(n - 1) + fib(n - 2) + fib(n - 2)";
		assert_eq!(
			s.evaluate(fib).unwrap_err(),
			Error::Compile(CompileError::BranchRange)
		);
		assert_eq!(
			s.evaluate("fib(1)").unwrap_err(),
			Error::Compile(CompileError::Undefined("fib".into()))
		);
	}

	#[test]
	fn definitions_and_calls() {
		let mut s = shell();
		assert_eq!(s.evaluate("function double(x) = x + x").unwrap(), None);
		assert_eq!(eval(&mut s, "double(21)"), 42.0);
		assert_eq!(eval(&mut s, "double(double(10))"), 40.0);
	}

	#[test]
	fn definition_bodies_may_hold_literals() {
		let mut s = shell();
		s.evaluate("function inc(x) = x + 1").unwrap();
		s.evaluate("function poly(x) = 2 * x * x - 3 * x + 1").unwrap();
		assert_eq!(eval(&mut s, "inc(41)"), 42.0);
		assert_eq!(eval(&mut s, "poly(3)"), 10.0);
	}

	#[test]
	fn functions_may_call_earlier_functions() {
		let mut s = shell();
		s.evaluate("function double(x) = x + x").unwrap();
		s.evaluate("function quad(x) = double(double(x))").unwrap();
		assert_eq!(eval(&mut s, "quad(5)"), 20.0);
	}

	#[test]
	fn temporaries_survive_a_call() {
		let mut s = shell();
		s.evaluate("function double(x) = x + x").unwrap();
		assert_eq!(eval(&mut s, "2 + double(3)"), 8.0);
		assert_eq!(eval(&mut s, "double(2) + double(3) * double(1)"), 16.0);
	}

	#[test]
	fn parameter_survives_a_call() {
		let mut s = shell();
		s.evaluate("function double(x) = x + x").unwrap();
		s.evaluate("function g(x) = double(x) + x").unwrap();
		assert_eq!(eval(&mut s, "g(3)"), 9.0);
	}

	#[test]
	fn recursion() {
		let mut s = shell();
		s.evaluate("function fact(n) = if n == 0 then 1 else n * fact(n - 1)")
			.unwrap();
		assert_eq!(eval(&mut s, "fact(0)"), 1.0);
		assert_eq!(eval(&mut s, "fact(5)"), 120.0);
		assert_eq!(eval(&mut s, "fact(7)"), 5040.0);
	}

	#[test]
	fn undefined_function() {
		let e = shell().evaluate("nosuch(1)").unwrap_err();
		assert_eq!(
			e,
			Error::Compile(CompileError::Undefined("nosuch".into()))
		);
		assert_eq!(e.category(), "SyntaxError");
	}

	#[test]
	fn failed_definition_is_rolled_back() {
		let mut s = shell();
		assert!(s.evaluate("function bad(x) = + 2").is_err());
		// The half-registered name must be gone again...
		assert_eq!(
			s.evaluate("bad(1)").unwrap_err(),
			Error::Compile(CompileError::Undefined("bad".into()))
		);
		// ...and free for a correct retry.
		assert_eq!(s.evaluate("function bad(x) = x + 2").unwrap(), None);
		assert_eq!(eval(&mut s, "bad(1)"), 3.0);
	}

	#[test]
	fn malformed_definitions() {
		let mut s = shell();
		let cases = [
			("function f", CompileError::DefMissingParen),
			("function f()", CompileError::DefArity),
			("function f(x y) = x", CompileError::DefArity),
			("function f(x = x", CompileError::DefUnclosed),
			("function f(x) x", CompileError::DefMissingEquals),
			("function f(x) =", CompileError::ExpectedExpression),
		];
		for (line, want) in cases {
			assert_eq!(s.evaluate(line).unwrap_err(), Error::Compile(want), "{line}");
		}
	}

	#[test]
	fn malformed_expressions() {
		let mut s = shell();
		s.evaluate("function double(x) = x + x").unwrap();
		let cases = [
			("1 +", CompileError::ExpectedExpression),
			("(1 + 2", CompileError::UnclosedGroup),
			("1 2", CompileError::TrailingTokens),
			("if 1 then 2", CompileError::ExpectedElse),
			("if 1 2 else 3", CompileError::ExpectedThen),
			("double 3", CompileError::CallMissingParen),
			("double(3", CompileError::CallUnclosed),
		];
		for (line, want) in cases {
			assert_eq!(s.evaluate(line).unwrap_err(), Error::Compile(want), "{line}");
		}
	}

	#[test]
	fn register_exhaustion_is_an_error_not_a_fault() {
		// Each nested right operand keeps one more register live.
		let line = "1 + (2 + (3 + (4 + (5 + (6 + (7 + (8 + 9)))))))";
		assert_eq!(
			shell().evaluate(line).unwrap_err(),
			Error::Compile(CompileError::RegisterPressure)
		);
	}

	#[test]
	fn expression_chunks_fuse_trailing_loads() {
		let s = shell();
		let mut table = Table::new();
		let t = tokenize("1 + 2", &table).unwrap();
		let chunk = compile(&t, &mut table, s.memory()).unwrap();
		// movss xmm0, [rdi]; addss xmm0, [rdi+4]; ret
		assert_eq!(
			chunk.code,
			[0xf3, 0x0f, 0x10, 0x07, 0xf3, 0x0f, 0x58, 0x47, 0x04, 0xc3]
		);
		assert_eq!(chunk.constants, [1.0, 2.0]);
		assert_eq!(chunk.text, chunk.code.len());
		assert!(chunk.function.is_none());
	}

	#[test]
	fn definition_chunks_carry_their_literals() {
		let s = shell();
		let mut table = Table::new();
		let t = tokenize("function inc(x) = x + 1", &table).unwrap();
		let chunk = compile(&t, &mut table, s.memory()).unwrap();
		assert_eq!(chunk.function.as_deref(), Some("inc"));
		// One f32 appended past the instructions.
		assert_eq!(chunk.code.len(), chunk.text + 4);
		assert_eq!(chunk.code[chunk.text..], 1.0f32.to_le_bytes());
		// No placeholder nops survive the backfill.
		assert!(!chunk.code[..chunk.text].contains(&0x90));
		assert_eq!(table.get("inc").map(|f| f.offset), Some(s.memory().occupied()));
	}

	proptest! {
		#[test]
		fn additive_ops_match_native_floats(a in -1.0e6f32..1.0e6, b in -1.0e6f32..1.0e6) {
			let mut s = shell();
			prop_assert_eq!(eval(&mut s, &format!("{a} + {b}")), a + b);
			prop_assert_eq!(eval(&mut s, &format!("{a} - {b}")), a - b);
			prop_assert_eq!(eval(&mut s, &format!("{a} * {b}")), a * b);
		}

		#[test]
		fn division_matches_native_floats(a in -1.0e6f32..1.0e6, b in -1.0e6f32..1.0e6) {
			prop_assume!(b != 0.0);
			prop_assert_eq!(eval(&mut shell(), &format!("{a} / {b}")), a / b);
		}

		#[test]
		fn modulo_matches_floor_division(a in 0.001f32..1.0e4, b in 0.001f32..1.0e4) {
			let want = a - (a / b).floor() * b;
			prop_assert_eq!(eval(&mut shell(), &format!("{a} % {b}")), want);
		}

		#[test]
		fn equality_of_a_value_with_itself(a in -1.0e6f32..1.0e6) {
			prop_assert_eq!(eval(&mut shell(), &format!("{a} == {a}")), 1.0);
		}
	}
}
