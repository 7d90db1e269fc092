//! A calculator that compiles every line to x86-64 machine code.
//!
//! One line in, native code out: [`token`] produces a token list, [`jit`]
//! parses it with operator precedence and emits scalar-SSE instructions
//! directly, [`runtime`] maps the bytes executable and calls them.
//! [`shell::Shell`] is the front door tying a [`table::Table`] of defined
//! functions to the code arena they live in.

pub mod error;
pub mod jit;
pub mod runtime;
pub mod shell;
pub mod table;
pub mod token;
