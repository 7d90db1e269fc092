//! Open-addressing table mapping function names to compiled code.
//!
//! Linear probing with tombstone deletion. A hit found behind a tombstone
//! is swapped forward into it during lookup, so hot probe chains shorten
//! themselves over time.

use core::mem;

/// Where a compiled function lives: its entry point as a byte offset from
/// the arena base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompiledFn {
	pub offset: usize,
}

const MIN_CAPACITY: usize = 8;

const FNV_OFFSET: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

fn fnv1a(key: &str) -> u32 {
	let mut hash = FNV_OFFSET;
	for byte in key.bytes() {
		hash ^= u32::from(byte);
		hash = hash.wrapping_mul(FNV_PRIME);
	}
	hash
}

#[derive(Clone, Debug, Default)]
enum Slot {
	#[default]
	Empty,
	/// Deleted; probe chains continue across it.
	Tombstone,
	Full(Box<str>, CompiledFn),
}

pub struct Table {
	slots: Box<[Slot]>,
	len: usize,
}

impl Table {
	pub fn new() -> Self {
		Self {
			slots: vec![Slot::Empty; MIN_CAPACITY].into(),
			len: 0,
		}
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Always a power of two, so probe positions can be masked.
	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	/// Register a compiled function. The lexer's alias check is the only
	/// duplicate guard; inserting an existing key would shadow it.
	pub fn insert(&mut self, key: Box<str>, value: CompiledFn) {
		if (self.len + 1) * 100 / self.capacity() > 70 {
			self.resize(self.capacity() * 2);
		}
		let mask = self.capacity() - 1;
		let mut i = fnv1a(&key) as usize & mask;
		while let Slot::Full(..) = self.slots[i] {
			i = (i + 1) & mask;
		}
		self.slots[i] = Slot::Full(key, value);
		self.len += 1;
	}

	/// Look up a function, moving a hit into the first tombstone crossed
	/// on the way to it.
	pub fn get(&mut self, key: &str) -> Option<CompiledFn> {
		let mask = self.capacity() - 1;
		let mut i = fnv1a(key) as usize & mask;
		let mut vacancy = None;
		for _ in 0..self.capacity() {
			match &self.slots[i] {
				Slot::Empty => return None,
				Slot::Tombstone => {
					if vacancy.is_none() {
						vacancy = Some(i);
					}
				}
				Slot::Full(k, v) if **k == *key => {
					let v = *v;
					if let Some(vacancy) = vacancy {
						self.slots.swap(vacancy, i);
					}
					return Some(v);
				}
				Slot::Full(..) => (),
			}
			i = (i + 1) & mask;
		}
		None
	}

	/// Check whether `name` is taken, without relocating anything. Used by
	/// the lexer's alias check.
	pub fn find_key(&self, name: &str) -> Option<&str> {
		self.probe(name).map(|i| match &self.slots[i] {
			Slot::Full(k, _) => &**k,
			_ => unreachable!(),
		})
	}

	pub fn remove(&mut self, key: &str) -> Option<CompiledFn> {
		let i = self.probe(key)?;
		let value = match mem::replace(&mut self.slots[i], Slot::Tombstone) {
			Slot::Full(_, v) => v,
			_ => unreachable!(),
		};
		self.len -= 1;
		if self.capacity() > MIN_CAPACITY && self.len * 100 / self.capacity() < 15 {
			self.resize(self.capacity() / 2);
		}
		Some(value)
	}

	/// Slot index of `key`, if present.
	fn probe(&self, key: &str) -> Option<usize> {
		let mask = self.capacity() - 1;
		let mut i = fnv1a(key) as usize & mask;
		for _ in 0..self.capacity() {
			match &self.slots[i] {
				Slot::Empty => return None,
				Slot::Full(k, _) if **k == *key => return Some(i),
				_ => (),
			}
			i = (i + 1) & mask;
		}
		None
	}

	/// Rehash into a table of `new_cap` slots, dropping tombstones.
	fn resize(&mut self, new_cap: usize) {
		let old = mem::replace(&mut self.slots, vec![Slot::Empty; new_cap].into());
		self.len = 0;
		for slot in old.into_vec() {
			if let Slot::Full(key, value) = slot {
				self.insert(key, value);
			}
		}
	}
}

impl Default for Table {
	fn default() -> Self {
		Self::new()
	}
}
