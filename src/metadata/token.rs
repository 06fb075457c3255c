//! Metadata tokens identifying types and methods.
//!
//! A [`Token`] is a 32-bit value whose high byte names the table (kind of entity) and
//! whose low 24 bits name the row. The redirection engine only ever deals with two
//! tables: type definitions and method definitions. Tokens are the identity under which
//! the registry tracks active redirections, so two descriptors with the same token are
//! the same method.
//!
//! # Examples
//!
//! ```rust
//! use redirection::metadata::token::Token;
//!
//! let method = Token::method_def(5);
//! assert!(method.is_method_def());
//! assert_eq!(method.row(), 5);
//! assert_eq!(method.to_string(), "0x06000005");
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a type or method known to a host runtime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Token(pub u32);

impl Token {
    /// Table id of type definitions.
    pub const TYPE_DEF: u8 = 0x02;

    /// Table id of method definitions.
    pub const METHOD_DEF: u8 = 0x06;

    /// Creates a token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a type definition token for `row`.
    #[must_use]
    pub fn type_def(row: u32) -> Self {
        Token((u32::from(Self::TYPE_DEF) << 24) | (row & 0x00FF_FFFF))
    }

    /// Creates a method definition token for `row`.
    #[must_use]
    pub fn method_def(row: u32) -> Self {
        Token((u32::from(Self::METHOD_DEF) << 24) | (row & 0x00FF_FFFF))
    }

    /// Raw 32-bit value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Table id (high byte).
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Row index (low 24 bits).
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns `true` for the all-zero token, which never names an entity.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if this token names a type definition.
    #[must_use]
    pub fn is_type_def(&self) -> bool {
        self.table() == Self::TYPE_DEF && self.row() != 0
    }

    /// Returns `true` if this token names a method definition.
    #[must_use]
    pub fn is_method_def(&self) -> bool {
        self.table() == Self::METHOD_DEF && self.row() != 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}
