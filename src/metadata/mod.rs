//! Method metadata consumed by the resolver.
//!
//! This module holds the small, host-independent view of types and methods that the
//! redirection core works with:
//!
//! - [`token`] - Identity of types and methods
//! - [`signature`] - Method signatures and the shape-compatibility rule
//! - [`method`] - Method descriptors, the [`method::MethodCatalog`] query trait and the
//!   explicit-registration [`method::MethodTable`]

pub mod method;
pub mod signature;
pub mod token;
