//! x86-64 instruction encoding.
//!
//! One function per encoding concern: [`instr`] maps an abstract opcode to
//! its exact escape/opcode bytes, the remaining helpers append ModRM/SIB
//! operands, displacements and control transfers. The byte patterns are the
//! System V contract that lets a finished block be called through a plain
//! `extern "C"` pointer, so they must not drift.

use crate::jit::CompileError;

/// Abstract scalar-SSE opcode selected by the code generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
	/// movss (load form; the store forms have their own helpers below).
	Mov,
	Add,
	Sub,
	Mul,
	Div,
	Sqrt,
	/// xorps, used with the sign-bit mask to negate.
	Xor,
	/// andps, masks a compare result into 0.0/1.0.
	And,
	/// roundss; the rounding-mode immediate follows the operands.
	Round,
	/// cmpss; the predicate immediate follows the operands.
	Cmp,
	/// comiss, compare into EFLAGS for branching.
	Comis,
}

/// Emit the opcode bytes for `op`. Operands follow separately.
pub fn instr(code: &mut Vec<u8>, op: Op) {
	match op {
		Op::Mov => code.extend([0xf3, 0x0f, 0x10]),
		Op::Add => code.extend([0xf3, 0x0f, 0x58]),
		Op::Sub => code.extend([0xf3, 0x0f, 0x5c]),
		Op::Mul => code.extend([0xf3, 0x0f, 0x59]),
		Op::Div => code.extend([0xf3, 0x0f, 0x5e]),
		Op::Sqrt => code.extend([0xf3, 0x0f, 0x51]),
		Op::Cmp => code.extend([0xf3, 0x0f, 0xc2]),
		Op::Xor => code.extend([0x0f, 0x57]),
		Op::And => code.extend([0x0f, 0x54]),
		Op::Comis => code.extend([0x0f, 0x2f]),
		Op::Round => code.extend([0x66, 0x0f, 0x3a, 0x0a]),
	}
}

/// xmm `dst` <- xmm `src`.
pub fn reg_reg(code: &mut Vec<u8>, dst: u8, src: u8) {
	code.push(0xc0 | dst << 3 | src);
}

/// xmm `dst` <- dword at [rdi + 4 * `index`], the constants argument of a
/// top-level expression. Picks the shortest displacement encoding.
pub fn mem(code: &mut Vec<u8>, dst: u8, index: usize) {
	let offset = index * 4;
	if offset == 0 {
		code.push(0x07 | dst << 3);
	} else if offset < 128 {
		code.push(0x47 | dst << 3);
		code.push(offset as u8);
	} else {
		code.push(0x87 | dst << 3);
		code.extend((offset as u32).to_le_bytes());
	}
}

/// xmm `dst` <- dword at [rip + `disp`].
pub fn rip_rel(code: &mut Vec<u8>, dst: u8, disp: i32) {
	code.push(0x05 | dst << 3);
	code.extend(disp.to_le_bytes());
}

/// movss [rsp], xmm0: park the incoming argument in its stack slot.
pub fn store_param(code: &mut Vec<u8>) {
	code.extend([0xf3, 0x0f, 0x11, 0x04, 0x24]);
}

/// xmm `dst` <- the parameter's stack slot at [rsp].
pub fn load_param(code: &mut Vec<u8>, dst: u8) {
	code.extend([0xf3, 0x0f, 0x10]);
	code.push(0x04 | dst << 3);
	code.push(0x24);
}

/// movss [rsp + `offset`], xmm `src`, spilling around a call.
pub fn store_stack(code: &mut Vec<u8>, offset: u8, src: u8) {
	code.extend([0xf3, 0x0f, 0x11]);
	code.push(0x44 | src << 3);
	code.push(0x24);
	code.push(offset);
}

/// xmm `dst` <- dword at [rsp + `offset`].
pub fn load_stack(code: &mut Vec<u8>, offset: u8, dst: u8) {
	code.extend([0xf3, 0x0f, 0x10]);
	code.push(0x44 | dst << 3);
	code.push(0x24);
	code.push(offset);
}

pub fn sub_rsp(code: &mut Vec<u8>, n: u8) {
	code.extend([0x48, 0x83, 0xec, n]);
}

pub fn add_rsp(code: &mut Vec<u8>, n: u8) {
	code.extend([0x48, 0x83, 0xc4, n]);
}

/// call rel32; the displacement counts from the end of the instruction.
pub fn call_rel(code: &mut Vec<u8>, disp: i32) {
	code.push(0xe8);
	code.extend(disp.to_le_bytes());
}

pub fn ret(code: &mut Vec<u8>) {
	code.push(0xc3);
}

/// jne with a rel8 placeholder. Returns the patch site.
pub fn jne8(code: &mut Vec<u8>) -> usize {
	code.extend([0x75, 0x00]);
	code.len() - 2
}

/// Unconditional jmp with a rel8 placeholder. Returns the patch site.
pub fn jmp8(code: &mut Vec<u8>) -> usize {
	code.extend([0xeb, 0x00]);
	code.len() - 2
}

/// Point the rel8 branch at `site` to the current end of `code`.
pub fn patch8(code: &mut [u8], site: usize) -> Result<(), CompileError> {
	let disp = code.len() - (site + 2);
	match i8::try_from(disp) {
		Ok(d) => {
			code[site + 1] = d as u8;
			Ok(())
		}
		Err(_) => Err(CompileError::BranchRange),
	}
}

/// Length of a constant-load placeholder and of its patched rip-relative
/// form; the rewrite must not shift any bytes.
pub const CONST_LOAD_LEN: usize = 8;

/// Reserve space for a constant load whose final address is still unknown:
/// the destination register byte followed by nop padding. Returns the site
/// for [`patch_const`].
pub fn const_placeholder(code: &mut Vec<u8>, reg: u8) -> usize {
	let site = code.len();
	code.push(reg);
	code.extend([0x90; CONST_LOAD_LEN - 1]);
	site
}

/// Rewrite the placeholder at `site` into movss xmm `reg`, [rip + `disp`].
pub fn patch_const(code: &mut [u8], site: usize, reg: u8, disp: i32) {
	code[site..site + 3].copy_from_slice(&[0xf3, 0x0f, 0x10]);
	code[site + 3] = 0x05 | reg << 3;
	code[site + 4..site + 8].copy_from_slice(&disp.to_le_bytes());
}
