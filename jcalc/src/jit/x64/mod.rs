//! Operator-precedence parser that emits x86-64 scalar-SSE code as it
//! recognizes productions. There is no syntax tree: each prefix or infix
//! handler appends instructions the moment its production completes.
//!
//! Values live in a stack of xmm registers. A handler that produces a
//! value claims the next register; a binary fold consumes the top two and
//! leaves its result one lower. Only xmm0..=xmm7 are used, which keeps
//! every encoding REX-free.

#[cfg(feature = "iced")]
mod debug;
pub(super) mod encode;

use super::{Chunk, CompileError};
use crate::runtime::ExecMemory;
use crate::table::{CompiledFn, Table};
use crate::token::{Token, TokenList};
use encode::Op;

/// Registers usable without a REX prefix.
const MAX_REG: u8 = 8;

/// Binding strength, weakest first. An infix handler parses its right
/// operand one level tighter than itself, giving left associativity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
	None,
	Number,
	Equality,
	Term,
	Factor,
	Call,
	Defun,
}

impl Prec {
	fn tighter(self) -> Self {
		match self {
			Prec::None => Prec::Number,
			Prec::Number => Prec::Equality,
			Prec::Equality => Prec::Term,
			Prec::Term => Prec::Factor,
			Prec::Factor => Prec::Call,
			Prec::Call | Prec::Defun => Prec::Defun,
		}
	}
}

type Handler<'a> = fn(&mut Compiler<'a>) -> Result<(), CompileError>;

struct Rule<'a> {
	prefix: Option<Handler<'a>>,
	infix: Option<Handler<'a>>,
	prec: Prec,
}

fn rule<'a>(token: &Token) -> Rule<'a> {
	fn r<'a>(prefix: Option<Handler<'a>>, infix: Option<Handler<'a>>, prec: Prec) -> Rule<'a> {
		Rule { prefix, infix, prec }
	}
	match token {
		Token::Number(_) => r(Some(Compiler::number), None, Prec::Number),
		Token::Param => r(Some(Compiler::param), None, Prec::Number),
		Token::Call(_) => r(Some(Compiler::call), None, Prec::Number),
		Token::Func(_) => r(Some(Compiler::function), None, Prec::Defun),
		Token::LParen => r(Some(Compiler::grouping), None, Prec::None),
		Token::If => r(Some(Compiler::conditional), None, Prec::Number),
		Token::Sqrt => r(Some(Compiler::unary), None, Prec::Call),
		Token::Minus => r(Some(Compiler::unary), Some(Compiler::binary), Prec::Term),
		Token::Plus => r(None, Some(Compiler::binary), Prec::Term),
		Token::Star | Token::Slash | Token::Percent => {
			r(None, Some(Compiler::binary), Prec::Factor)
		}
		Token::DblEquals => r(None, Some(Compiler::binary), Prec::Equality),
		_ => r(None, None, Prec::None),
	}
}

/// The last emitted load from the expression's literal pool, still sitting
/// at the end of the code buffer. A binary fold whose right operand is
/// exactly this load rewinds it and uses the memory operand directly.
#[derive(Clone, Copy)]
struct LoadSite {
	start: usize,
	end: usize,
	index: usize,
	reg: u8,
}

struct Compiler<'a> {
	tokens: &'a [Token],
	pos: usize,
	code: Vec<u8>,
	constants: Vec<f32>,
	/// Placeholder sites inside a definition, parallel to `constants`.
	patches: Vec<usize>,
	/// Length of the instruction bytes, before any appended constants.
	text: usize,
	/// Next free xmm register.
	reg: u8,
	/// Compiling a definition body: literals go through placeholders and
	/// load fusion is off, since their offsets are not final yet.
	function: bool,
	/// Name registered at the definition head, for rollback on failure.
	defined: Option<Box<str>>,
	fused: Option<LoadSite>,
	table: &'a mut Table,
	memory: &'a ExecMemory,
}

pub(super) fn compile(
	tokens: &TokenList,
	table: &mut Table,
	memory: &ExecMemory,
) -> Result<Chunk, CompileError> {
	let mut c = Compiler {
		tokens: &tokens.tokens,
		pos: 0,
		code: Vec::with_capacity(64),
		constants: Vec::with_capacity(tokens.num_constants),
		patches: Vec::new(),
		text: 0,
		reg: 0,
		function: false,
		defined: None,
		fused: None,
		table,
		memory,
	};
	match c.run() {
		Ok(()) => Ok(Chunk {
			code: c.code,
			text: c.text,
			constants: c.constants,
			function: c.defined,
		}),
		Err(e) => {
			// A definition registers its name before its body compiles so
			// it can call itself; take that back.
			if let Some(name) = c.defined.take() {
				c.table.remove(&name);
			}
			Err(e)
		}
	}
}

impl Compiler<'_> {
	fn run(&mut self) -> Result<(), CompileError> {
		self.parse(Prec::Number)?;
		if *self.current() != Token::End {
			return Err(CompileError::TrailingTokens);
		}
		if self.function {
			encode::add_rsp(&mut self.code, 8);
		}
		encode::ret(&mut self.code);
		self.text = self.code.len();
		if self.function {
			self.backfill();
		}
		Ok(())
	}

	fn current(&self) -> &Token {
		&self.tokens[self.pos]
	}

	fn advance(&mut self) {
		// The list is End-terminated and End is never consumed by parse().
		if self.pos + 1 < self.tokens.len() {
			self.pos += 1;
		}
	}

	fn expect(&mut self, token: &Token, e: CompileError) -> Result<(), CompileError> {
		if self.current() == token {
			self.advance();
			Ok(())
		} else {
			Err(e)
		}
	}

	/// Parse everything binding at least as tightly as `min`.
	fn parse(&mut self, min: Prec) -> Result<(), CompileError> {
		let prefix = rule(self.current())
			.prefix
			.ok_or(CompileError::ExpectedExpression)?;
		prefix(self)?;
		loop {
			let r = rule(self.current());
			if r.prec < min {
				break;
			}
			let Some(infix) = r.infix else { break };
			infix(self)?;
		}
		Ok(())
	}

	/// Claim the next value register.
	fn alloc(&mut self) -> Result<u8, CompileError> {
		if self.reg >= MAX_REG {
			return Err(CompileError::RegisterPressure);
		}
		self.reg += 1;
		Ok(self.reg - 1)
	}

	/// The `n`th scratch register above the value stack.
	fn scratch(&self, n: u8) -> Result<u8, CompileError> {
		let reg = self.reg + n;
		if reg >= MAX_REG {
			return Err(CompileError::RegisterPressure);
		}
		Ok(reg)
	}

	/// movss from one of the arena's well-known constants, rip-relative
	/// against where this block will land.
	fn load_arena_const(&mut self, target: usize, reg: u8) {
		encode::instr(&mut self.code, Op::Mov);
		let next = self.memory.occupied() + self.code.len() + 5;
		encode::rip_rel(&mut self.code, reg, (target as i64 - next as i64) as i32);
	}

	fn number(&mut self) -> Result<(), CompileError> {
		let value = match *self.current() {
			Token::Number(v) => v,
			_ => return Err(CompileError::ExpectedExpression),
		};
		self.advance();
		let index = self.constants.len();
		self.constants.push(value);
		let reg = self.alloc()?;
		if self.function {
			self.patches
				.push(encode::const_placeholder(&mut self.code, reg));
		} else {
			let start = self.code.len();
			encode::instr(&mut self.code, Op::Mov);
			encode::mem(&mut self.code, reg, index);
			self.fused = Some(LoadSite {
				start,
				end: self.code.len(),
				index,
				reg,
			});
		}
		Ok(())
	}

	fn param(&mut self) -> Result<(), CompileError> {
		self.advance();
		let reg = self.alloc()?;
		encode::load_param(&mut self.code, reg);
		Ok(())
	}

	fn grouping(&mut self) -> Result<(), CompileError> {
		self.advance();
		self.parse(Prec::Number)?;
		self.expect(&Token::RParen, CompileError::UnclosedGroup)
	}

	fn unary(&mut self) -> Result<(), CompileError> {
		let op = self.current().clone();
		self.advance();
		self.parse(rule(&op).prec.tighter())?;
		match op {
			Token::Minus => {
				let mask = self.scratch(0)?;
				self.load_arena_const(self.memory.sign_offset(), mask);
				encode::instr(&mut self.code, Op::Xor);
				encode::reg_reg(&mut self.code, self.reg - 1, mask);
			}
			Token::Sqrt => {
				encode::instr(&mut self.code, Op::Sqrt);
				encode::reg_reg(&mut self.code, self.reg - 1, self.reg - 1);
			}
			_ => (),
		}
		Ok(())
	}

	fn binary(&mut self) -> Result<(), CompileError> {
		let op = self.current().clone();
		self.advance();
		self.parse(rule(&op).prec.tighter())?;

		let alu = match op {
			Token::Plus => Op::Add,
			Token::Minus => Op::Sub,
			Token::Star => Op::Mul,
			Token::Slash => Op::Div,
			Token::Percent => return self.modulo(),
			Token::DblEquals => return self.equality(),
			_ => return Err(CompileError::ExpectedExpression),
		};

		let dst = self.reg - 2;
		let src = self.reg - 1;
		let fused = match self.fused {
			Some(l) if !self.function && l.end == self.code.len() && l.reg == src => Some(l),
			_ => None,
		};
		if let Some(l) = fused {
			// The right operand was loaded straight into `src` by the last
			// instruction; feed the ALU op the memory operand instead.
			self.code.truncate(l.start);
			encode::instr(&mut self.code, alu);
			encode::mem(&mut self.code, dst, l.index);
		} else {
			encode::instr(&mut self.code, alu);
			encode::reg_reg(&mut self.code, dst, src);
		}
		self.fused = None;
		self.reg -= 1;
		Ok(())
	}

	/// a % b as a - floor(a / b) * b, in two scratch registers.
	fn modulo(&mut self) -> Result<(), CompileError> {
		let a = self.reg - 2;
		let b = self.reg - 1;
		let quot = self.scratch(0)?;
		let tmp = self.scratch(1)?;
		let code = &mut self.code;
		encode::instr(code, Op::Mov);
		encode::reg_reg(code, quot, a);
		encode::instr(code, Op::Mov);
		encode::reg_reg(code, tmp, b);
		encode::instr(code, Op::Div);
		encode::reg_reg(code, quot, tmp);
		encode::instr(code, Op::Round);
		encode::reg_reg(code, quot, quot);
		code.push(0x01); // round toward negative infinity
		encode::instr(code, Op::Mul);
		encode::reg_reg(code, b, quot);
		encode::instr(code, Op::Sub);
		encode::reg_reg(code, a, b);
		self.fused = None;
		self.reg -= 1;
		Ok(())
	}

	/// a == b yields 1.0 or 0.0: the all-ones compare mask ANDed with the
	/// arena's 1.0.
	fn equality(&mut self) -> Result<(), CompileError> {
		let a = self.reg - 2;
		let b = self.reg - 1;
		encode::instr(&mut self.code, Op::Cmp);
		encode::reg_reg(&mut self.code, a, b);
		self.code.push(0x00); // predicate: equal
		self.load_arena_const(self.memory.one_offset(), b);
		encode::instr(&mut self.code, Op::And);
		encode::reg_reg(&mut self.code, a, b);
		self.fused = None;
		self.reg -= 1;
		Ok(())
	}

	/// if C then A else B. C counts as true when it equals 1.0; both arms
	/// deliver into the same register.
	fn conditional(&mut self) -> Result<(), CompileError> {
		self.advance();
		self.parse(Prec::Number)?;
		let one = self.scratch(0)?;
		self.load_arena_const(self.memory.one_offset(), one);
		encode::instr(&mut self.code, Op::Comis);
		encode::reg_reg(&mut self.code, self.reg - 1, one);
		self.reg -= 1;
		let to_else = encode::jne8(&mut self.code);

		self.expect(&Token::Then, CompileError::ExpectedThen)?;
		let base = self.reg;
		self.parse(Prec::Number)?;
		let past_else = encode::jmp8(&mut self.code);
		encode::patch8(&mut self.code, to_else)?;

		self.reg = base;
		self.expect(&Token::Else, CompileError::ExpectedElse)?;
		self.parse(Prec::Number)?;
		encode::patch8(&mut self.code, past_else)?;
		self.fused = None;
		Ok(())
	}

	fn call(&mut self) -> Result<(), CompileError> {
		let name = match self.current() {
			Token::Call(n) => n.clone(),
			_ => return Err(CompileError::ExpectedExpression),
		};
		let target = self
			.table
			.get(&name)
			.ok_or(CompileError::Undefined(name))?
			.offset;
		self.advance();
		self.expect(&Token::LParen, CompileError::CallMissingParen)?;
		self.parse(Prec::Number)?;
		self.expect(&Token::RParen, CompileError::CallUnclosed)?;

		let arg = self.reg - 1;
		if arg == 0 {
			self.emit_call(target);
		} else {
			// xmm registers are caller-saved; live temporaries below the
			// argument survive the call on the stack. The frame stays
			// 8-aligned so the callee's own spill slot math holds up.
			let frame = (arg * 4 + 7) & !7;
			encode::sub_rsp(&mut self.code, frame);
			for r in 0..arg {
				encode::store_stack(&mut self.code, r * 4, r);
			}
			encode::instr(&mut self.code, Op::Mov);
			encode::reg_reg(&mut self.code, 0, arg);
			self.emit_call(target);
			encode::instr(&mut self.code, Op::Mov);
			encode::reg_reg(&mut self.code, arg, 0);
			for r in 0..arg {
				encode::load_stack(&mut self.code, r * 4, r);
			}
			encode::add_rsp(&mut self.code, frame);
		}
		// The argument register now holds the result; the stack depth is
		// unchanged.
		self.fused = None;
		Ok(())
	}

	fn emit_call(&mut self, target: usize) {
		let next = self.memory.occupied() + self.code.len() + 5;
		encode::call_rel(&mut self.code, (target as i64 - next as i64) as i32);
	}

	fn function(&mut self) -> Result<(), CompileError> {
		let name = match self.current() {
			Token::Func(n) => n.clone(),
			_ => return Err(CompileError::ExpectedExpression),
		};
		self.advance();
		// Registered before the body parses so the body can call itself.
		// compile() removes it again if anything below fails.
		self.table.insert(
			name.clone(),
			CompiledFn {
				offset: self.memory.occupied(),
			},
		);
		self.defined = Some(name);
		self.function = true;

		self.expect(&Token::LParen, CompileError::DefMissingParen)?;
		match self.current() {
			Token::Param => self.advance(),
			Token::RParen => return Err(CompileError::DefArity),
			_ => return Err(CompileError::DefMissingParam),
		}
		match self.current() {
			Token::RParen => self.advance(),
			Token::Param | Token::Call(_) => return Err(CompileError::DefArity),
			_ => return Err(CompileError::DefUnclosed),
		}
		self.expect(&Token::Equals, CompileError::DefMissingEquals)?;

		encode::sub_rsp(&mut self.code, 8);
		encode::store_param(&mut self.code);
		self.parse(Prec::Number)
	}

	/// Append each pending literal after the code and rewrite its
	/// placeholder into a rip-relative load of where it landed.
	fn backfill(&mut self) {
		for (&site, value) in self.patches.iter().zip(&self.constants) {
			let at = self.code.len();
			self.code.extend(value.to_le_bytes());
			let reg = self.code[site];
			let disp = at as i64 - (site + encode::CONST_LOAD_LEN) as i64;
			encode::patch_const(&mut self.code, site, reg, disp as i32);
		}
	}
}
