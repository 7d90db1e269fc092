//! Turning a line of source into tokens.

use crate::table::Table;
use core::iter::Peekable;
use core::str::CharIndices;
use thiserror::Error;

/// A single lexed token.
///
/// Any occurrence of the enclosing definition's parameter becomes [`Token::Param`];
/// its spelling lives in [`TokenList::param`]. Every other bare identifier is a
/// [`Token::Call`], resolved (or rejected) by the code generator.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
	Number(f32),
	Param,
	Call(Box<str>),
	Func(Box<str>),
	Equals,
	DblEquals,
	LParen,
	RParen,
	Plus,
	Minus,
	Star,
	Slash,
	Percent,
	Sqrt,
	If,
	Then,
	Else,
	End,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum TokenError {
	#[error("number has more than one decimal point")]
	MalformedNumber,
	#[error("expected a name after 'function'")]
	EmptyName,
	#[error("'{0}' aliases an existing function or keyword")]
	Aliases(Box<str>),
	#[error("unexpected character '{0}'")]
	UnexpectedChar(char),
}

/// One line's worth of tokens, always terminated by [`Token::End`], plus
/// what the code generator wants to know up front.
#[derive(Debug, PartialEq)]
pub struct TokenList {
	pub tokens: Vec<Token>,
	/// How many literals the line holds, to pre-size the constant buffer.
	pub num_constants: usize,
	/// The definition's parameter name, once one was introduced.
	pub param: Option<Box<str>>,
	/// Whether the line is a definition.
	pub function: bool,
}

/// Names an identifier may never shadow.
const KEYWORDS: &[&str] = &["function", "sqrt", "if", "then", "else"];

/// Lex one line. `table` is consulted so new definition and parameter
/// names can be rejected when they alias an existing function; names in
/// call position are deliberately not checked here, the code generator
/// resolves them against the table at the point of use.
pub fn tokenize(code: &str, table: &Table) -> Result<TokenList, TokenError> {
	Lexer {
		code,
		iter: code.char_indices().peekable(),
		table,
		out: TokenList {
			tokens: Vec::new(),
			num_constants: 0,
			param: None,
			function: false,
		},
	}
	.run()
}

struct Lexer<'a> {
	code: &'a str,
	iter: Peekable<CharIndices<'a>>,
	table: &'a Table,
	out: TokenList,
}

impl<'a> Lexer<'a> {
	fn run(mut self) -> Result<TokenList, TokenError> {
		while let Some(&(_, c)) = self.iter.peek() {
			let token = match c {
				c if c.is_whitespace() => {
					self.iter.next();
					continue;
				}
				'(' => self.take(Token::LParen),
				')' => self.take(Token::RParen),
				'+' => self.take(Token::Plus),
				'-' => self.take(Token::Minus),
				'*' => self.take(Token::Star),
				'/' => self.take(Token::Slash),
				'%' => self.take(Token::Percent),
				'=' => {
					self.iter.next();
					if matches!(self.iter.peek(), Some((_, '='))) {
						self.iter.next();
						Token::DblEquals
					} else {
						Token::Equals
					}
				}
				'0'..='9' => self.number()?,
				c if c.is_ascii_alphabetic() => self.word()?,
				c => return Err(TokenError::UnexpectedChar(c)),
			};
			self.out.tokens.push(token);
		}
		self.out.tokens.push(Token::End);
		Ok(self.out)
	}

	fn take(&mut self, token: Token) -> Token {
		self.iter.next();
		token
	}

	/// Byte position of the next unconsumed character.
	fn pos(&mut self) -> usize {
		self.iter.peek().map_or(self.code.len(), |&(i, _)| i)
	}

	fn number(&mut self) -> Result<Token, TokenError> {
		let start = self.pos();
		let mut seen_dot = false;
		while let Some(&(_, c)) = self.iter.peek() {
			match c {
				'0'..='9' => (),
				'.' if seen_dot => return Err(TokenError::MalformedNumber),
				'.' => seen_dot = true,
				_ => break,
			}
			self.iter.next();
		}
		let end = self.pos();
		let value = self.code[start..end]
			.parse::<f32>()
			.map_err(|_| TokenError::MalformedNumber)?;
		self.out.num_constants += 1;
		Ok(Token::Number(value))
	}

	/// Consume a run of letters, borrowed from the source line. Only the
	/// spellings that end up in tokens get to own their string.
	fn letters(&mut self) -> &'a str {
		let start = self.pos();
		while matches!(self.iter.peek(), Some(&(_, c)) if c.is_ascii_alphabetic()) {
			self.iter.next();
		}
		let end = self.pos();
		&self.code[start..end]
	}

	fn word(&mut self) -> Result<Token, TokenError> {
		let word = self.letters();
		Ok(match word {
			"function" => return self.function_name(),
			"sqrt" => Token::Sqrt,
			"if" => Token::If,
			"then" => Token::Then,
			"else" => Token::Else,
			_ if self.out.function => match &self.out.param {
				// The first identifier inside a definition is its parameter.
				None => {
					self.check_alias(word)?;
					self.out.param = Some(word.into());
					Token::Param
				}
				Some(param) if **param == *word => Token::Param,
				Some(_) => Token::Call(word.into()),
			},
			_ => Token::Call(word.into()),
		})
	}

	fn function_name(&mut self) -> Result<Token, TokenError> {
		self.out.function = true;
		while matches!(self.iter.peek(), Some(&(_, c)) if c.is_whitespace()) {
			self.iter.next();
		}
		let name = self.letters();
		if name.is_empty() {
			return Err(TokenError::EmptyName);
		}
		self.check_alias(name)?;
		Ok(Token::Func(name.into()))
	}

	fn check_alias(&self, name: &str) -> Result<(), TokenError> {
		if KEYWORDS.contains(&name) || self.table.find_key(name).is_some() {
			return Err(TokenError::Aliases(name.into()));
		}
		Ok(())
	}
}
