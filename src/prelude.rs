//! # redirection Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! of the redirection library. Import this module to get quick access to everything
//! needed to declare, perform and revert redirections.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all redirection operations
pub use crate::Error;

/// The result type used throughout redirection
pub use crate::Result;

/// Failure classifications used in reports
pub use crate::{LookupErrorKind, PatchErrorKind};

/// Configuration of redirection passes
pub use crate::{FailurePolicy, RedirectConfig};

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Batch processing of scopes and its results
pub use crate::{RedirectEntry, RedirectOutcome, RedirectReport, Redirector};

/// Declarations and the scopes carrying them
pub use crate::{DeclarationBuilder, RedirectDeclaration, RedirectDirection, RedirectScope};

// ================================================================================================
// Metadata
// ================================================================================================

/// Metadata token type identifying types and methods
pub use crate::metadata::token::Token;

/// Type and method signatures
pub use crate::metadata::signature::{MethodSignature, TypeSignature};

/// Method descriptors and the metadata query surface
pub use crate::metadata::method::{
    MethodCatalog, MethodDescriptor, MethodDescriptorRc, MethodTable, TypeRef,
};

// ================================================================================================
// Resolution, Patching and Registry
// ================================================================================================

/// Method resolution
pub use crate::{MethodResolver, ResolvedMethod, ResolvedPair};

/// Patch engine and its records
pub use crate::patch::{Architecture, PatchEngine, PatchKind, PatchRecord, PatchStats, WritePlan};

/// Active redirections
pub use crate::{MethodKey, RedirectionRegistry, RegistryEvent};

// ================================================================================================
// Platforms
// ================================================================================================

/// Platform abstraction
pub use crate::platform::{EntryPoint, HostId, MemoryProtection, Platform};

/// Emulated host runtime
pub use crate::platform::{EmulatedPlatform, MethodBuilder, Value};

/// Current process
pub use crate::platform::NativePlatform;
