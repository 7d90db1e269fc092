use crate::jit::Chunk;
use core::fmt;

impl fmt::Debug for Chunk {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		use iced_x86::{Decoder, Formatter, IntelFormatter};
		let mut dec = Decoder::new(64, &self.code[..self.text], 0);

		let mut fmt = IntelFormatter::new();
		fmt.options_mut().set_digit_separator("_");
		fmt.options_mut().set_hex_prefix("0x");
		fmt.options_mut().set_hex_suffix("");
		fmt.options_mut().set_uppercase_hex(false);
		fmt.options_mut().set_rip_relative_addresses(true);

		if let Some(name) = &self.function {
			writeln!(f, "\n{}:", name)?;
		} else {
			writeln!(f)?;
		}
		let mut s = String::new();
		while dec.can_decode() {
			s.clear();
			let instr = dec.decode();
			fmt.format(&instr, &mut s);
			write!(f, "{:4x}  ", instr.ip())?;
			for b in &self.code[instr.ip() as usize..][..instr.len()] {
				write!(f, "{:02x}", b)?;
			}
			(instr.len()..15).try_for_each(|_| f.write_str("  "))?;
			writeln!(f, "  {}", s)?;
		}
		for (i, value) in self.constants.iter().enumerate() {
			if self.function.is_some() {
				writeln!(f, "{:4x}  {}", self.text + i * 4, value)?;
			} else {
				writeln!(f, "      [rdi+{}]  {}", i * 4, value)?;
			}
		}
		Ok(())
	}
}
