//! Method descriptors and the metadata query surface.
//!
//! The resolver never inspects a host runtime directly. Everything it knows about the
//! methods of a type comes from a [`MethodCatalog`], which answers "which methods does
//! this type declare" with [`MethodDescriptor`]s. Hosts that generate their method list at
//! build time, or register it explicitly at startup, can use [`MethodTable`].
//!
//! # Examples
//!
//! ```rust
//! use redirection::metadata::{
//!     method::{MethodCatalog, MethodTable, TypeRef},
//!     signature::{MethodSignature, TypeSignature},
//!     token::Token,
//! };
//!
//! let table = MethodTable::new();
//! let citizen = TypeRef::new(Token::type_def(1), "Game", "Citizen");
//! table.define(
//!     &citizen,
//!     "Update",
//!     MethodSignature::instance(TypeSignature::Void, vec![TypeSignature::R4]),
//! );
//!
//! assert_eq!(table.methods_of(&citizen).len(), 1);
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{
    metadata::{signature::MethodSignature, token::Token},
    platform::EntryPoint,
};

/// A reference-counted [`MethodDescriptor`]
pub type MethodDescriptorRc = Arc<MethodDescriptor>;

/// Identity and name of a type declaring methods.
///
/// Equality and hashing take all fields into account; hosts are expected to hand out
/// one `TypeRef` per token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeRef {
    /// Type definition token
    pub token: Token,
    /// Namespace, empty for the global namespace
    pub namespace: String,
    /// Simple type name
    pub name: String,
}

impl TypeRef {
    /// Creates a new type reference.
    #[must_use]
    pub fn new(token: Token, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        TypeRef {
            token,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Namespace-qualified name, e.g. `Game.Citizen`.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// Everything the resolver and engine need to know about one method.
///
/// Materializing the method's code is not a property of the descriptor; it is requested
/// from the [`Platform`](crate::platform::Platform) that owns the method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Method identity
    pub token: Token,
    /// The type declaring this method
    pub declaring_type: TypeRef,
    /// Method name
    pub name: String,
    /// Receiver flag, return and parameter types
    pub signature: MethodSignature,
}

impl MethodDescriptor {
    /// Creates a new descriptor.
    #[must_use]
    pub fn new(
        token: Token,
        declaring_type: TypeRef,
        name: impl Into<String>,
        signature: MethodSignature,
    ) -> Self {
        MethodDescriptor {
            token,
            declaring_type,
            name: name.into(),
            signature,
        }
    }

    /// Returns `true` for instance methods.
    #[must_use]
    pub fn is_instance(&self) -> bool {
        self.signature.has_this
    }

    /// `Namespace.Type::Method` form used in diagnostics.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.declaring_type.full_name(), self.name)
    }

    /// Checks whether this method and `other` have compatible shapes.
    #[must_use]
    pub fn is_shape_compatible(&self, other: &MethodDescriptor) -> bool {
        self.signature.is_shape_compatible(
            self.declaring_type.token,
            &other.signature,
            other.declaring_type.token,
        )
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.full_name(), self.signature)
    }
}

/// Metadata query surface of a host runtime.
///
/// Implementations must be thread-safe; the resolver queries catalogs from a rayon
/// pool when resolving a scope.
pub trait MethodCatalog: Send + Sync {
    /// Returns every method declared by `declaring_type`, in a stable order.
    fn methods_of(&self, declaring_type: &TypeRef) -> Vec<MethodDescriptorRc>;

    /// Returns the current entry point of `method` if the host has already compiled it.
    ///
    /// This never triggers compilation. The default implementation knows no entry
    /// points.
    fn entry_point(&self, _method: Token) -> Option<EntryPoint> {
        None
    }
}

/// Explicitly registered method metadata.
///
/// An append-only table replacing runtime attribute discovery: the host (or a build
/// step) registers each participating method once. Registration is lock-free and may
/// happen concurrently with lookups.
#[derive(Default)]
pub struct MethodTable {
    methods: boxcar::Vec<MethodDescriptorRc>,
    next_row: AtomicU32,
}

impl MethodTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an existing descriptor.
    pub fn register(&self, descriptor: MethodDescriptor) -> MethodDescriptorRc {
        let descriptor = Arc::new(descriptor);
        self.methods.push(descriptor.clone());
        descriptor
    }

    /// Defines a new method, allocating a fresh method token for it.
    pub fn define(
        &self,
        declaring_type: &TypeRef,
        name: &str,
        signature: MethodSignature,
    ) -> MethodDescriptorRc {
        let row = self.next_row.fetch_add(1, Ordering::Relaxed) + 1;
        self.register(MethodDescriptor::new(
            Token::method_def(row),
            declaring_type.clone(),
            name,
            signature,
        ))
    }

    /// Looks up a method by token.
    #[must_use]
    pub fn get(&self, token: Token) -> Option<MethodDescriptorRc> {
        self.methods
            .iter()
            .find(|(_, method)| method.token == token)
            .map(|(_, method)| method.clone())
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.count()
    }

    /// Returns `true` if nothing has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.count() == 0
    }
}

impl MethodCatalog for MethodTable {
    fn methods_of(&self, declaring_type: &TypeRef) -> Vec<MethodDescriptorRc> {
        self.methods
            .iter()
            .filter(|(_, method)| method.declaring_type.token == declaring_type.token)
            .map(|(_, method)| method.clone())
            .collect()
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("method_count", &self.methods.count())
            .finish()
    }
}
