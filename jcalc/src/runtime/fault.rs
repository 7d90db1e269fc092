//! Crash diagnosis for generated code.
//!
//! There is no verifier: an encoding bug surfaces as a hardware fault
//! inside the arena. The SIGSEGV handler maps the faulting instruction
//! pointer back to an arena offset, hex-dumps the bytes around it and
//! exits. Everything in the handler sticks to async-signal-safe calls:
//! raw `write` to stderr and `_exit`.
//!
//! The handler runs on the faulting thread's own stack, so a SIGSEGV
//! caused by stack exhaustion (runaway generated recursion) kills the
//! process before it can run; diagnosing that case would need an
//! alternate signal stack (`sigaltstack` + `SA_ONSTACK`).

use super::ExecMemory;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::io;

static ARENA_BASE: AtomicUsize = AtomicUsize::new(0);
static ARENA_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Install the process-wide SIGSEGV handler and capture the arena bounds
/// it reports against. Call once, before running any generated code.
pub fn install(memory: &ExecMemory) -> io::Result<()> {
	ARENA_BASE.store(memory.base() as usize, Ordering::Relaxed);
	ARENA_SIZE.store(memory.size(), Ordering::Relaxed);
	let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) = on_segv;
	// SAFETY: sigaction with a handler that only performs signal-safe work.
	unsafe {
		let mut action: libc::sigaction = mem::zeroed();
		action.sa_sigaction = handler as usize;
		action.sa_flags = libc::SA_SIGINFO;
		libc::sigemptyset(&mut action.sa_mask);
		if libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut()) != 0 {
			return Err(io::Error::last_os_error());
		}
	}
	Ok(())
}

extern "C" fn on_segv(_sig: libc::c_int, _info: *mut libc::siginfo_t, context: *mut libc::c_void) {
	// SAFETY: the kernel hands a ucontext_t through the third argument
	// when SA_SIGINFO is set.
	let rip = unsafe {
		(*context.cast::<libc::ucontext_t>()).uc_mcontext.gregs[libc::REG_RIP as usize]
	} as usize;

	let mut out = Out::new();
	out.text("FatalError: SIGSEGV at 0x");
	out.hex(rip as u64, 16);
	out.text("\n");

	let base = ARENA_BASE.load(Ordering::Relaxed);
	let size = ARENA_SIZE.load(Ordering::Relaxed);
	if base != 0 && (base..base + size).contains(&rip) {
		let offset = rip - base;
		out.text("faulting instruction at arena offset +0x");
		out.hex(offset as u64, 4);
		out.text(":\n");
		let low = offset.saturating_sub(0x20) & !0xf;
		let high = ((offset + 0x20) & !0xf).min(size);
		for row in (low..high).step_by(16) {
			out.text("  ");
			out.hex((base + row) as u64, 16);
			out.text(":");
			for i in row..(row + 16).min(high) {
				out.text(" ");
				// SAFETY: in bounds of the still-mapped arena.
				out.hex(u64::from(unsafe { *(base as *const u8).add(i) }), 2);
			}
			out.text("\n");
		}
	} else {
		out.text("faulting instruction is outside the code arena\n");
	}
	out.flush();

	// SAFETY: plain process exit.
	unsafe { libc::_exit(1) }
}

/// Fixed-size stderr buffer; no allocation, no formatting machinery.
struct Out {
	buf: [u8; 1024],
	len: usize,
}

impl Out {
	fn new() -> Self {
		Self {
			buf: [0; 1024],
			len: 0,
		}
	}

	fn byte(&mut self, b: u8) {
		if self.len < self.buf.len() {
			self.buf[self.len] = b;
			self.len += 1;
		}
	}

	fn text(&mut self, s: &str) {
		for &b in s.as_bytes() {
			self.byte(b);
		}
	}

	/// Zero-padded lowercase hex, `width` digits.
	fn hex(&mut self, value: u64, width: u32) {
		for shift in (0..width).rev() {
			let digit = (value >> (shift * 4)) & 0xf;
			self.byte(b"0123456789abcdef"[digit as usize]);
		}
	}

	fn flush(&mut self) {
		let mut done = 0;
		while done < self.len {
			// SAFETY: writing an initialized buffer slice to stderr.
			let n = unsafe {
				libc::write(
					libc::STDERR_FILENO,
					self.buf[done..].as_ptr().cast(),
					self.len - done,
				)
			};
			if n <= 0 {
				break;
			}
			done += n as usize;
		}
		self.len = 0;
	}
}
