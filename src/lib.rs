// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]
//#![deny(unsafe_code)]
// - 'platform/native.rs' reads and writes the code of the running process
// - 'platform/emulated.rs' maps anonymous memory for its code space

//! # redirection
//!
//! Runtime method redirection for managed hosts. `redirection` replaces compiled methods
//! of a running host with alternative implementations, and restores them later, without
//! touching the host's binaries on disk.
//!
//! ## Features
//!
//! - **Declarative** - Redirections are declared per replacement method and applied in
//!   batches; one failing declaration never takes the others down
//! - **Shape-checked** - Methods are matched by name, instance flag and signature, with
//!   instance methods redirectable to static methods taking an explicit receiver
//! - **Tear-free** - Entry points are rewritten in aligned single-word stores, so
//!   concurrently running threads never execute half-written instructions
//! - **Reversible** - Every patch keeps a byte-exact snapshot of what it overwrote
//! - **Testable** - An emulated host runtime runs the whole pipeline without touching
//!   the process's own code
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use redirection::prelude::*;
//!
//! let host = Arc::new(EmulatedPlatform::new()?);
//! let game = host.define_type("Game", "Citizen");
//! let detours = host.define_type("Mod", "Detours");
//!
//! let happiness = host
//!     .method(&game, "Happiness")
//!     .instance()
//!     .returns(TypeSignature::I4)
//!     .body(|_, _| Ok(Value::I32(10)))
//!     .define()?;
//! let replacement = host
//!     .method(&detours, "Happiness")
//!     .param(TypeSignature::Class(game.token))
//!     .returns(TypeSignature::I4)
//!     .body(|_, _| Ok(Value::I32(100)))
//!     .define()?;
//!
//! let scope = RedirectScope::new("detours").redirect(
//!     &replacement,
//!     RedirectDeclaration::new(RedirectDirection::FromSource, game)?,
//! );
//!
//! let redirector = Redirector::new(host.clone(), host.clone())
//!     .with_registry(Arc::new(RedirectionRegistry::new()));
//! redirector.perform_redirections(&scope);
//! assert_eq!(host.invoke(happiness.token, &[Value::Object(1)])?, Value::I32(100));
//!
//! redirector.revert_redirections(&scope);
//! assert_eq!(host.invoke(happiness.token, &[Value::Object(1)])?, Value::I32(10));
//! # Ok::<(), redirection::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`declaration`] - Redirect declarations and scopes
//! - [`metadata`] - Tokens, signatures, method descriptors and the catalog trait
//! - [`resolver`] - Finds the concrete method behind a declaration
//! - [`platform`] - Executable memory access, native and emulated
//! - [`patch`] - Jump encoding, write planning, apply and revert
//! - [`registry`] - The table of active redirections
//! - [`Redirector`] - Batch processing of scopes
//!
//! ## Logging
//!
//! The crate logs through the [`log`](https://docs.rs/log) facade and installs no logger:
//! batch summaries at `info`, failed declarations and rollbacks at `warn`, every patch at
//! `debug` and every store at `trace`.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). Per-declaration failures of a
//! batch are not errors of the batch; they are reported in the [`RedirectReport`]:
//!
//! ```rust,no_run
//! use redirection::{RedirectOutcome, RedirectReport};
//!
//! fn print_failures(report: &RedirectReport) {
//!     for entry in report.failures() {
//!         match entry.outcome {
//!             RedirectOutcome::LookupError(kind) => println!("{}: {kind}", entry.declaration),
//!             RedirectOutcome::PatchError(kind) => println!("{}: {kind}", entry.declaration),
//!             _ => {}
//!         }
//!     }
//! }
//! ```
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use redirection::prelude::*;
///
/// let config = RedirectConfig::strict();
/// assert_eq!(config.failure_policy, FailurePolicy::RollbackAll);
/// ```
pub mod prelude;

/// Configuration of redirection passes
pub mod config;

/// Redirect declarations and the scopes carrying them
///
/// A declaration is the replacement for runtime attribute discovery: the host
/// constructs one per annotated method (or several, as one method may carry multiple
/// declarations) and collects them in a [`declaration::RedirectScope`].
pub mod declaration;

/// Method metadata: tokens, signatures, descriptors and the catalog trait
pub mod metadata;

/// Jump encoding, tear-free write planning, and the patch engine
///
/// # Key Types
///
/// - [`patch::PatchEngine`] - Applies and reverts single redirections
/// - [`patch::PatchRecord`] - An installed redirection and its undo information
/// - [`patch::WritePlan`] - Word-confined stores of one patch
/// - [`patch::Architecture`] - Jump encodings of x86-64 and AArch64
pub mod patch;

/// Executable memory access of host runtimes
///
/// # Examples
///
/// ```rust
/// use redirection::platform::{EmulatedPlatform, Platform};
///
/// let host = EmulatedPlatform::new()?;
/// assert!(host.read_code(0, 1).is_err());
/// # Ok::<(), redirection::Error>(())
/// ```
pub mod platform;

/// Process-wide table of active redirections
pub mod registry;

/// Resolution of declarations to concrete methods
pub mod resolver;

pub(crate) mod redirector;

/// `redirection` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `redirection` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust
/// use redirection::{Error, RedirectDeclaration};
///
/// match RedirectDeclaration::builder().method_name("").build() {
///     Err(Error::InvalidArgument(message)) => println!("Invalid: {message}"),
///     Err(e) => println!("Error: {e}"),
///     Ok(_) => println!("Valid"),
/// }
/// ```
pub use error::Error;

/// Classification of lookup and patch failures, as used in reports
pub use error::{LookupErrorKind, PatchErrorKind};

/// Declarations and scopes
pub use declaration::{DeclarationBuilder, RedirectDeclaration, RedirectDirection, RedirectScope};

/// Pass configuration
pub use config::{FailurePolicy, RedirectConfig};

/// Batch processing and reporting
pub use redirector::{RedirectEntry, RedirectOutcome, RedirectReport, Redirector};

/// Active redirections
pub use registry::{MethodKey, RedirectionRegistry, RegistryEvent};

/// Method resolution
pub use resolver::{MethodResolver, ResolvedMethod, ResolvedPair};
