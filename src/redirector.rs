//! Batch redirection of a scope.
//!
//! [`Redirector`] is the entry point for hosts. It resolves every declaration of a
//! [`RedirectScope`], installs the redirections through a [`PatchEngine`] and a
//! [`RedirectionRegistry`], and reports the outcome of every entry in a
//! [`RedirectReport`]. A failing entry never aborts the pass unless the configuration
//! asks for all-or-nothing behaviour.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use redirection::prelude::*;
//!
//! let host = Arc::new(EmulatedPlatform::new()?);
//! let game = host.define_type("Game", "Citizen");
//! let detours = host.define_type("Mod", "Detours");
//!
//! host.method(&game, "Age")
//!     .instance()
//!     .returns(TypeSignature::I4)
//!     .body(|_, _| Ok(Value::I32(30)))
//!     .define()?;
//! let age = host
//!     .method(&detours, "Age")
//!     .param(TypeSignature::Class(game.token))
//!     .returns(TypeSignature::I4)
//!     .body(|_, _| Ok(Value::I32(99)))
//!     .define()?;
//!
//! let scope = RedirectScope::new("detours")
//!     .redirect(&age, RedirectDeclaration::new(RedirectDirection::FromSource, game)?);
//!
//! let redirector = Redirector::new(host.clone(), host.clone())
//!     .with_registry(Arc::new(RedirectionRegistry::new()));
//! let report = redirector.perform_redirections(&scope);
//! assert!(report.is_success());
//!
//! redirector.revert_redirections(&scope);
//! # Ok::<(), redirection::Error>(())
//! ```

use std::{collections::HashSet, fmt, sync::Arc};

use crate::{
    config::{FailurePolicy, RedirectConfig},
    declaration::{RedirectDeclaration, RedirectScope},
    error::{LookupErrorKind, PatchErrorKind},
    metadata::{method::MethodCatalog, token::Token},
    patch::{PatchEngine, PatchKind, PatchRecord},
    platform::Platform,
    registry::{MethodKey, RedirectionRegistry},
    resolver::{MethodResolver, ResolvedPair},
    Error, Result,
};

/// Outcome of one scope entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectOutcome {
    /// The redirection was installed.
    Applied(PatchKind),
    /// The redirection was removed.
    Reverted,
    /// A revert found nothing installed for the entry.
    NotActive,
    /// The redirection was installed, then undone because another entry failed.
    RolledBack,
    /// The entry was never processed because an earlier failure ended the pass.
    NotAttempted,
    /// The declaration could not be resolved.
    LookupError(LookupErrorKind),
    /// The redirection could not be installed or removed.
    PatchError(PatchErrorKind),
}

impl RedirectOutcome {
    /// Returns `true` for lookup and patch errors.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RedirectOutcome::LookupError(_) | RedirectOutcome::PatchError(_)
        )
    }

    fn from_error(error: &Error) -> Self {
        match error.lookup_kind() {
            Some(kind) => RedirectOutcome::LookupError(kind),
            None => RedirectOutcome::PatchError(error.patch_kind().unwrap_or(PatchErrorKind::Other)),
        }
    }
}

impl fmt::Display for RedirectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectOutcome::Applied(kind) => write!(f, "applied ({kind})"),
            RedirectOutcome::Reverted => write!(f, "reverted"),
            RedirectOutcome::NotActive => write!(f, "not active"),
            RedirectOutcome::RolledBack => write!(f, "rolled back"),
            RedirectOutcome::NotAttempted => write!(f, "not attempted"),
            RedirectOutcome::LookupError(kind) => write!(f, "lookup error ({kind})"),
            RedirectOutcome::PatchError(kind) => write!(f, "patch error ({kind})"),
        }
    }
}

/// Result of one scope entry.
#[derive(Debug, Clone)]
pub struct RedirectEntry {
    /// The declaration processed
    pub declaration: RedirectDeclaration,
    /// The method carrying the declaration
    pub annotated: Token,
    /// The method whose entry is rewritten, if resolution succeeded
    pub source: Option<Token>,
    /// What happened
    pub outcome: RedirectOutcome,
    /// Error message for failures
    pub message: Option<String>,
}

/// Per-entry results of a pass, in scope order.
#[derive(Debug, Clone, Default)]
pub struct RedirectReport {
    /// Name of the processed scope
    pub scope: String,
    /// One result per scope entry
    pub entries: Vec<RedirectEntry>,
}

impl RedirectReport {
    /// Number of installed redirections.
    #[must_use]
    pub fn applied(&self) -> usize {
        self.count(|outcome| matches!(outcome, RedirectOutcome::Applied(_)))
    }

    /// Number of removed redirections.
    #[must_use]
    pub fn reverted(&self) -> usize {
        self.count(|outcome| *outcome == RedirectOutcome::Reverted)
    }

    /// Number of redirections undone by a rollback.
    #[must_use]
    pub fn rolled_back(&self) -> usize {
        self.count(|outcome| *outcome == RedirectOutcome::RolledBack)
    }

    /// Number of entries left unprocessed after a rollback.
    #[must_use]
    pub fn not_attempted(&self) -> usize {
        self.count(|outcome| *outcome == RedirectOutcome::NotAttempted)
    }

    /// The failed entries.
    pub fn failures(&self) -> impl Iterator<Item = &RedirectEntry> {
        self.entries.iter().filter(|entry| entry.outcome.is_failure())
    }

    /// Returns `true` if no entry failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    fn count(&self, predicate: impl Fn(&RedirectOutcome) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| predicate(&entry.outcome))
            .count()
    }
}

impl fmt::Display for RedirectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scope '{}': {} entries, {} applied, {} reverted, {} rolled back, {} failed, {} not attempted",
            self.scope,
            self.entries.len(),
            self.applied(),
            self.reverted(),
            self.rolled_back(),
            self.failures().count(),
            self.not_attempted()
        )
    }
}

/// Performs and reverts the redirections of scopes.
pub struct Redirector {
    resolver: MethodResolver,
    engine: PatchEngine,
    registry: Arc<RedirectionRegistry>,
    config: RedirectConfig,
}

impl Redirector {
    /// Creates a redirector with the default configuration, using the global registry.
    #[must_use]
    pub fn new(catalog: Arc<dyn MethodCatalog>, platform: Arc<dyn Platform>) -> Self {
        Self::with_config(catalog, platform, RedirectConfig::default())
    }

    /// Creates a redirector with `config`, using the global registry.
    #[must_use]
    pub fn with_config(
        catalog: Arc<dyn MethodCatalog>,
        platform: Arc<dyn Platform>,
        config: RedirectConfig,
    ) -> Self {
        let resolver = if config.cache_resolutions {
            MethodResolver::new(catalog)
        } else {
            MethodResolver::uncached(catalog)
        };

        Redirector {
            resolver,
            engine: PatchEngine::with_config(platform, &config),
            registry: RedirectionRegistry::global(),
            config,
        }
    }

    /// Uses `registry` instead of the global registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<RedirectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// The registry holding this redirector's patches.
    #[must_use]
    pub fn registry(&self) -> &Arc<RedirectionRegistry> {
        &self.registry
    }

    /// The patch engine.
    #[must_use]
    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    /// The resolver.
    #[must_use]
    pub fn resolver(&self) -> &MethodResolver {
        &self.resolver
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &RedirectConfig {
        &self.config
    }

    /// Installs every redirection of `scope`, in scope order.
    ///
    /// Resolution of all entries happens up front and in parallel. Entries that fail to
    /// resolve or install are reported and skipped; with [`FailurePolicy::RollbackAll`]
    /// the first failure instead undoes everything this call installed, and the entries
    /// after it are reported as [`RedirectOutcome::NotAttempted`]. The report always has
    /// one entry per scope entry.
    pub fn perform_redirections(&self, scope: &RedirectScope) -> RedirectReport {
        let resolved = self.resolver.resolve_all(scope);
        let mut report = RedirectReport {
            scope: scope.name().to_string(),
            entries: Vec::with_capacity(scope.len()),
        };
        let mut installed: Vec<(usize, Arc<PatchRecord>)> = Vec::new();

        let mut pending = scope.entries().iter().zip(resolved);
        while let Some((entry, resolution)) = pending.next() {
            let (source, result) = match resolution {
                Ok(pair) => (Some(pair.source().token()), self.install(&pair)),
                Err(error) => (None, Err(error)),
            };

            let (outcome, message) = match result {
                Ok(record) => {
                    installed.push((report.entries.len(), record.clone()));
                    (RedirectOutcome::Applied(record.kind), None)
                }
                Err(error) => {
                    log::warn!(
                        "scope '{}': {} on {} failed - {error}",
                        scope.name(),
                        entry.declaration,
                        entry.annotated.full_name()
                    );
                    (RedirectOutcome::from_error(&error), Some(error.to_string()))
                }
            };
            let failed = outcome.is_failure();

            report.entries.push(RedirectEntry {
                declaration: entry.declaration.clone(),
                annotated: entry.annotated.token,
                source,
                outcome,
                message,
            });

            if failed && self.config.failure_policy == FailurePolicy::RollbackAll {
                self.roll_back(&mut report, installed);
                for (entry, resolution) in pending {
                    report.entries.push(RedirectEntry {
                        declaration: entry.declaration.clone(),
                        annotated: entry.annotated.token,
                        source: resolution.ok().map(|pair| pair.source().token()),
                        outcome: RedirectOutcome::NotAttempted,
                        message: None,
                    });
                }
                break;
            }
        }

        log::info!("{report}");
        report
    }

    /// Removes every active redirection belonging to `scope`, newest first.
    ///
    /// Only redirections on this redirector's platform are considered, even when the
    /// registry is shared with other hosts. Entries without an active redirection are reported as
    /// [`RedirectOutcome::NotActive`].
    pub fn revert_redirections(&self, scope: &RedirectScope) -> RedirectReport {
        let resolved = self.resolver.resolve_all(scope);
        let mut report = RedirectReport {
            scope: scope.name().to_string(),
            entries: Vec::with_capacity(scope.len()),
        };

        let sources: Vec<Result<Token>> = resolved
            .into_iter()
            .map(|resolution| resolution.map(|pair| pair.source().token()))
            .collect();
        let in_scope: HashSet<MethodKey> = sources
            .iter()
            .filter_map(|s| s.as_ref().ok().map(|token| self.key(*token)))
            .collect();

        let mut records = match self.registry.all_active() {
            Ok(records) => records,
            Err(error) => {
                log::warn!("scope '{}': registry unavailable - {error}", scope.name());
                Vec::new()
            }
        };
        records.retain(|record| in_scope.contains(&record.key()));
        records.reverse();

        let mut outcomes: Vec<(Token, RedirectOutcome, Option<String>)> = Vec::new();
        for record in &records {
            let source = record.source.token();
            let outcome = match self.uninstall(record.key()) {
                Ok(_) => (source, RedirectOutcome::Reverted, None),
                Err(error) => {
                    log::warn!("scope '{}': reverting {record} failed - {error}", scope.name());
                    (source, RedirectOutcome::from_error(&error), Some(error.to_string()))
                }
            };
            outcomes.push(outcome);
        }

        for (entry, source) in scope.entries().iter().zip(sources) {
            let (source, outcome, message) = match source {
                Ok(source) => match outcomes.iter().position(|(token, ..)| *token == source) {
                    Some(index) => {
                        let (_, outcome, message) = outcomes.remove(index);
                        (Some(source), outcome, message)
                    }
                    None => (Some(source), RedirectOutcome::NotActive, None),
                },
                Err(error) => {
                    log::warn!(
                        "scope '{}': {} on {} failed - {error}",
                        scope.name(),
                        entry.declaration,
                        entry.annotated.full_name()
                    );
                    (None, RedirectOutcome::from_error(&error), Some(error.to_string()))
                }
            };

            report.entries.push(RedirectEntry {
                declaration: entry.declaration.clone(),
                annotated: entry.annotated.token,
                source,
                outcome,
                message,
            });
        }

        log::info!("{report}");
        report
    }

    fn install(&self, pair: &ResolvedPair) -> Result<Arc<PatchRecord>> {
        let source = pair.source();
        let target = pair.target();
        self.registry.install(
            self.key(source.token()),
            self.key(target.token()),
            self.config.detect_cycles,
            || self.engine.apply(source, target),
        )
    }

    fn key(&self, method: Token) -> MethodKey {
        MethodKey::new(self.engine.platform().host_id(), method)
    }

    fn uninstall(&self, source: MethodKey) -> Result<Option<Arc<PatchRecord>>> {
        self.registry.uninstall(source, |record| {
            self.engine.revert(record)?;
            Ok(())
        })
    }

    /// Undoes `installed` in reverse order, marking the entries as rolled back.
    fn roll_back(&self, report: &mut RedirectReport, installed: Vec<(usize, Arc<PatchRecord>)>) {
        log::warn!(
            "scope '{}': rolling back {} redirection(s)",
            report.scope,
            installed.len()
        );

        for (index, record) in installed.into_iter().rev() {
            match self.uninstall(record.key()) {
                Ok(_) => report.entries[index].outcome = RedirectOutcome::RolledBack,
                Err(error) => {
                    log::warn!("scope '{}': rollback of {record} failed - {error}", report.scope);
                    report.entries[index].message = Some(error.to_string());
                }
            }
        }
    }
}

impl fmt::Debug for Redirector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redirector")
            .field("engine", &self.engine)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
