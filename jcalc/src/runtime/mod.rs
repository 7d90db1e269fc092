//! Executable memory and the native-call boundary.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod fault;

use core::ptr;
use std::io;
use thiserror::Error;

/// Size of the mapping. The constant pool, every committed definition and
/// the expression scratch area all share it.
const ARENA_SIZE: usize = 1 << 16;

/// Byte offsets of the well-known constants written at creation. Generated
/// code reaches them rip-relatively, so they must precede all code.
const ZERO_OFFSET: usize = 0;
const ONE_OFFSET: usize = 4;
const SIGN_OFFSET: usize = 8;
const POOL_SIZE: usize = 12;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum MemoryError {
	#[error("code arena is full ({needed} bytes needed, {free} free)")]
	Full { needed: usize, free: usize },
}

/// Signature of a top-level expression: the argument is the line's literal
/// pool, indexed by the order the literals appeared.
pub type ExprFn = unsafe extern "C" fn(*const f32) -> f32;

/// Signature of a defined function: one float in xmm0, result in xmm0.
pub type FuncFn = unsafe extern "C" fn(f32) -> f32;

/// One read+write+execute mapping holding the constant pool and all
/// compiled code. Committed blocks are never moved or freed, so relative
/// displacements into earlier blocks stay valid for the session lifetime.
pub struct ExecMemory {
	base: *mut u8,
	size: usize,
	occupied: usize,
}

impl ExecMemory {
	pub fn new() -> io::Result<Self> {
		// SAFETY: fresh anonymous mapping, unobservable until written.
		let base = unsafe {
			libc::mmap(
				ptr::null_mut(),
				ARENA_SIZE,
				libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
				libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
				-1,
				0,
			)
		};
		if base == libc::MAP_FAILED {
			return Err(io::Error::last_os_error());
		}
		let mut memory = Self {
			base: base.cast(),
			size: ARENA_SIZE,
			occupied: 0,
		};
		memory.write(ZERO_OFFSET, &0.0f32.to_le_bytes());
		memory.write(ONE_OFFSET, &1.0f32.to_le_bytes());
		memory.write(SIGN_OFFSET, &0x8000_0000u32.to_le_bytes());
		memory.occupied = POOL_SIZE;
		Ok(memory)
	}

	/// End of the committed region; also where the next block will land.
	pub fn occupied(&self) -> usize {
		self.occupied
	}

	pub fn size(&self) -> usize {
		self.size
	}

	pub fn base(&self) -> *const u8 {
		self.base
	}

	/// Offset of the constant 1.0.
	pub fn one_offset(&self) -> usize {
		ONE_OFFSET
	}

	/// Offset of the sign-bit mask 0x8000_0000.
	pub fn sign_offset(&self) -> usize {
		SIGN_OFFSET
	}

	/// Append a definition's block. It becomes permanent and callable;
	/// returns the offset of its entry point.
	pub fn commit(&mut self, code: &[u8]) -> Result<usize, MemoryError> {
		let offset = self.stage(code)?;
		self.occupied += code.len();
		Ok(offset)
	}

	/// Place a top-level expression past the last committed block without
	/// claiming the space. The next staged or committed block overwrites it.
	pub fn stage(&mut self, code: &[u8]) -> Result<usize, MemoryError> {
		let free = self.size - self.occupied;
		if code.len() > free {
			return Err(MemoryError::Full {
				needed: code.len(),
				free,
			});
		}
		let offset = self.occupied;
		self.write(offset, code);
		Ok(offset)
	}

	fn write(&mut self, offset: usize, bytes: &[u8]) {
		// SAFETY: callers bound-check against `size`.
		unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), bytes.len()) }
	}

	/// Read back a window of the mapping, clamped to its bounds.
	pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
		let offset = offset.min(self.size);
		let len = len.min(self.size - offset);
		// SAFETY: in bounds of the live mapping.
		unsafe { core::slice::from_raw_parts(self.base.add(offset), len) }
	}

	/// Whether an absolute address points into the mapping.
	pub fn contains(&self, addr: usize) -> bool {
		let base = self.base as usize;
		(base..base + self.size).contains(&addr)
	}

	/// The entry point of a staged expression, as something callable.
	///
	/// # Safety
	/// `offset` must be the entry of a complete expression block placed by
	/// [`Self::stage`] and not yet overwritten.
	pub unsafe fn expr_entry(&self, offset: usize) -> ExprFn {
		debug_assert!(offset < self.size);
		unsafe { core::mem::transmute(self.base.add(offset)) }
	}

	/// The entry point of a committed definition.
	///
	/// # Safety
	/// `offset` must be the entry of a committed definition block.
	pub unsafe fn func_entry(&self, offset: usize) -> FuncFn {
		debug_assert!(offset < self.occupied);
		unsafe { core::mem::transmute(self.base.add(offset)) }
	}
}

impl Drop for ExecMemory {
	fn drop(&mut self) {
		// SAFETY: exclusively owned mapping; entry pointers do not outlive
		// the owning session.
		unsafe { libc::munmap(self.base.cast(), self.size) };
	}
}
