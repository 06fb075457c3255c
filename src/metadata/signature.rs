//! Method signatures and the shape-compatibility rule.
//!
//! A [`MethodSignature`] carries what the resolver needs to tell overloads apart: whether
//! the method takes an implicit receiver (`has_this`), the return type and the ordered
//! parameter types. The element types are a reduced version of the ECMA-335 type
//! signature vocabulary; class and value types refer to their defining type by token.
//!
//! # Shape Compatibility
//!
//! Two methods are shape-compatible when their return types are equal and their
//! parameters line up after the implicit receiver has been accounted for:
//!
//! | Source | Target | Rule |
//! |--------|--------|------|
//! | static | static | parameters equal |
//! | instance | instance | parameters equal |
//! | instance | static | target's first parameter takes the receiver, rest equal |
//! | static | instance | source's first parameter takes the receiver, rest equal |
//!
//! ```rust
//! use redirection::metadata::{signature::{MethodSignature, TypeSignature}, token::Token};
//!
//! let owner = Token::type_def(1);
//! // int Type1.compute(int)
//! let instance = MethodSignature::instance(TypeSignature::I4, vec![TypeSignature::I4]);
//! // static int Helper.compute(Type1, int)
//! let detour = MethodSignature::static_method(
//!     TypeSignature::I4,
//!     vec![TypeSignature::Class(owner), TypeSignature::I4],
//! );
//! assert!(instance.is_shape_compatible(owner, &detour, Token::type_def(2)));
//! ```

use std::fmt;

use crate::metadata::token::Token;

/// Element type of a parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TypeSignature {
    /// Unresolved or unknown type
    #[default]
    Unknown,
    /// No value
    Void,
    /// `bool`
    Boolean,
    /// UTF-16 code unit
    Char,
    /// Signed 8-bit integer
    I1,
    /// Unsigned 8-bit integer
    U1,
    /// Signed 16-bit integer
    I2,
    /// Unsigned 16-bit integer
    U2,
    /// Signed 32-bit integer
    I4,
    /// Unsigned 32-bit integer
    U4,
    /// Signed 64-bit integer
    I8,
    /// Unsigned 64-bit integer
    U8,
    /// 32-bit float
    R4,
    /// 64-bit float
    R8,
    /// Native signed integer
    I,
    /// Native unsigned integer
    U,
    /// String reference
    String,
    /// Any reference type
    Object,
    /// Reference type defined by the token
    Class(Token),
    /// Value type defined by the token
    ValueType(Token),
    /// Single-dimensional, zero-based array
    SzArray(Box<TypeSignature>),
    /// Managed reference (`ref`/`out` parameter)
    ByRef(Box<TypeSignature>),
    /// Generic parameter of the declaring type, by index
    GenericParam(u32),
}

impl TypeSignature {
    /// Returns `true` if a value of this parameter type can carry a receiver of type
    /// `owner`.
    ///
    /// Accepted receiver parameters are the owner itself (class or value type), a
    /// managed reference to it, and `object`.
    #[must_use]
    pub fn accepts_receiver(&self, owner: Token) -> bool {
        match self {
            TypeSignature::Class(token) | TypeSignature::ValueType(token) => *token == owner,
            TypeSignature::ByRef(inner) => inner.accepts_receiver(owner),
            TypeSignature::Object => true,
            _ => false,
        }
    }
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSignature::Unknown => write!(f, "?"),
            TypeSignature::Void => write!(f, "void"),
            TypeSignature::Boolean => write!(f, "bool"),
            TypeSignature::Char => write!(f, "char"),
            TypeSignature::I1 => write!(f, "i1"),
            TypeSignature::U1 => write!(f, "u1"),
            TypeSignature::I2 => write!(f, "i2"),
            TypeSignature::U2 => write!(f, "u2"),
            TypeSignature::I4 => write!(f, "i4"),
            TypeSignature::U4 => write!(f, "u4"),
            TypeSignature::I8 => write!(f, "i8"),
            TypeSignature::U8 => write!(f, "u8"),
            TypeSignature::R4 => write!(f, "r4"),
            TypeSignature::R8 => write!(f, "r8"),
            TypeSignature::I => write!(f, "native int"),
            TypeSignature::U => write!(f, "native uint"),
            TypeSignature::String => write!(f, "string"),
            TypeSignature::Object => write!(f, "object"),
            TypeSignature::Class(token) => write!(f, "class {token}"),
            TypeSignature::ValueType(token) => write!(f, "valuetype {token}"),
            TypeSignature::SzArray(inner) => write!(f, "{inner}[]"),
            TypeSignature::ByRef(inner) => write!(f, "{inner}&"),
            TypeSignature::GenericParam(index) => write!(f, "!{index}"),
        }
    }
}

/// Signature of a method: receiver flag, return type and parameters.
///
/// `params` never includes the implicit receiver of an instance method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MethodSignature {
    /// The method takes an implicit receiver
    pub has_this: bool,
    /// The return type
    pub return_type: TypeSignature,
    /// Declared parameters, excluding the implicit receiver
    pub params: Vec<TypeSignature>,
}

impl MethodSignature {
    /// Signature of an instance method.
    #[must_use]
    pub fn instance(return_type: TypeSignature, params: Vec<TypeSignature>) -> Self {
        MethodSignature {
            has_this: true,
            return_type,
            params,
        }
    }

    /// Signature of a static method.
    #[must_use]
    pub fn static_method(return_type: TypeSignature, params: Vec<TypeSignature>) -> Self {
        MethodSignature {
            has_this: false,
            return_type,
            params,
        }
    }

    /// Number of arguments passed at the machine level, receiver included.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }

    /// Checks shape compatibility between this signature (declared on `owner`) and
    /// `other` (declared on `other_owner`).
    ///
    /// See the module documentation for the rule. Optional or defaulted parameters get
    /// no special treatment; the match is strict.
    #[must_use]
    pub fn is_shape_compatible(&self, owner: Token, other: &MethodSignature, other_owner: Token) -> bool {
        if self.return_type != other.return_type {
            return false;
        }

        match (self.has_this, other.has_this) {
            (true, true) | (false, false) => self.params == other.params,
            (true, false) => strip_receiver(&other.params, owner)
                .is_some_and(|rest| rest == self.params.as_slice()),
            (false, true) => strip_receiver(&self.params, other_owner)
                .is_some_and(|rest| rest == other.params.as_slice()),
        }
    }
}

/// Splits off an explicit receiver parameter that accepts `owner`.
fn strip_receiver(params: &[TypeSignature], owner: Token) -> Option<&[TypeSignature]> {
    let (receiver, rest) = params.split_first()?;
    receiver.accepts_receiver(owner).then_some(rest)
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_this {
            write!(f, "instance ")?;
        }
        write!(f, "(")?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> {}", self.return_type)
    }
}
