//! Resolution of declarations to concrete methods.
//!
//! [`MethodResolver`] turns a [`RedirectDeclaration`] and the method carrying it into a
//! [`ResolvedPair`]: it enumerates the methods of the declaration's source type, keeps
//! those with the right name and instance flag, and selects the single one whose shape
//! is compatible with the annotated method.
//!
//! Resolution is side-effect free. Results may be cached per (declaration, annotated
//! method); the cache stores only the selected descriptor, so entry points are always
//! read fresh from the catalog.

use std::{fmt, sync::Arc};

use dashmap::DashMap;
use rayon::prelude::*;

use crate::{
    declaration::{RedirectDeclaration, RedirectDirection, RedirectScope},
    metadata::{
        method::{MethodCatalog, MethodDescriptor, MethodDescriptorRc},
        token::Token,
    },
    platform::EntryPoint,
    Error, Result,
};

/// One concrete method, with its entry point if the host already compiled it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMethod {
    /// Metadata of the method
    pub descriptor: MethodDescriptorRc,
    /// Current entry point; `None` until the host compiled the method
    pub entry: Option<EntryPoint>,
}

impl ResolvedMethod {
    /// Creates a handle.
    #[must_use]
    pub fn new(descriptor: MethodDescriptorRc, entry: Option<EntryPoint>) -> Self {
        ResolvedMethod { descriptor, entry }
    }

    /// Method identity.
    #[must_use]
    pub fn token(&self) -> Token {
        self.descriptor.token
    }

    /// Returns `true` if the host has already materialized the method's code.
    #[must_use]
    pub fn is_compiled(&self) -> bool {
        self.entry.is_some()
    }

    /// Returns `true` for instance methods.
    #[must_use]
    pub fn is_instance(&self) -> bool {
        self.descriptor.is_instance()
    }

    /// Checks shape compatibility with `other`.
    #[must_use]
    pub fn is_shape_compatible(&self, other: &ResolvedMethod) -> bool {
        self.descriptor.is_shape_compatible(&other.descriptor)
    }
}

impl fmt::Display for ResolvedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.descriptor.full_name())
    }
}

/// A resolved declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPair {
    /// The declaration that was resolved
    pub declaration: RedirectDeclaration,
    /// The method found on the declaration's source type
    pub declared: ResolvedMethod,
    /// The method carrying the declaration
    pub annotated: ResolvedMethod,
}

impl ResolvedPair {
    /// Direction of the declaration.
    #[must_use]
    pub fn direction(&self) -> RedirectDirection {
        self.declaration.direction()
    }

    /// The method whose entry gets rewritten.
    #[must_use]
    pub fn source(&self) -> &ResolvedMethod {
        match self.direction() {
            RedirectDirection::FromSource => &self.declared,
            RedirectDirection::ToSource => &self.annotated,
        }
    }

    /// The method control is transferred to.
    #[must_use]
    pub fn target(&self) -> &ResolvedMethod {
        match self.direction() {
            RedirectDirection::FromSource => &self.annotated,
            RedirectDirection::ToSource => &self.declared,
        }
    }
}

/// Resolves declarations against a [`MethodCatalog`].
pub struct MethodResolver {
    catalog: Arc<dyn MethodCatalog>,
    cache: Option<DashMap<(RedirectDeclaration, Token), MethodDescriptorRc>>,
}

impl MethodResolver {
    /// Creates a caching resolver.
    #[must_use]
    pub fn new(catalog: Arc<dyn MethodCatalog>) -> Self {
        MethodResolver {
            catalog,
            cache: Some(DashMap::new()),
        }
    }

    /// Creates a resolver that queries the catalog every time.
    #[must_use]
    pub fn uncached(catalog: Arc<dyn MethodCatalog>) -> Self {
        MethodResolver {
            catalog,
            cache: None,
        }
    }

    /// Resolves `declaration` carried by `annotated`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no method on the source type matches and
    /// [`Error::AmbiguousMatch`] if more than one does.
    pub fn resolve(
        &self,
        declaration: &RedirectDeclaration,
        annotated: &MethodDescriptorRc,
    ) -> Result<ResolvedPair> {
        let declared = match &self.cache {
            Some(cache) => {
                let key = (declaration.clone(), annotated.token);
                if let Some(hit) = cache.get(&key) {
                    hit.clone()
                } else {
                    let found = self.find(declaration, annotated)?;
                    cache.insert(key, found.clone());
                    found
                }
            }
            None => self.find(declaration, annotated)?,
        };

        Ok(ResolvedPair {
            declaration: declaration.clone(),
            declared: self.handle(declared),
            annotated: self.handle(annotated.clone()),
        })
    }

    /// Resolves every entry of `scope` in parallel. Results are in scope order.
    pub fn resolve_all(&self, scope: &RedirectScope) -> Vec<Result<ResolvedPair>> {
        scope
            .entries()
            .par_iter()
            .map(|entry| self.resolve(&entry.declaration, &entry.annotated))
            .collect()
    }

    /// Number of cached resolutions.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.as_ref().map_or(0, DashMap::len)
    }

    /// Drops all cached resolutions.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    fn handle(&self, descriptor: MethodDescriptorRc) -> ResolvedMethod {
        let entry = self.catalog.entry_point(descriptor.token);
        ResolvedMethod::new(descriptor, entry)
    }

    fn find(
        &self,
        declaration: &RedirectDeclaration,
        annotated: &MethodDescriptor,
    ) -> Result<MethodDescriptorRc> {
        let name = declaration.resolved_name(annotated);
        let source_type = declaration.source_type();

        let mut candidates: Vec<MethodDescriptorRc> = self
            .catalog
            .methods_of(source_type)
            .into_iter()
            .filter(|method| {
                method.name == name
                    && method.is_instance() == declaration.is_instance()
                    && method.is_shape_compatible(annotated)
            })
            .collect();

        match candidates.len() {
            0 => Err(Error::NotFound {
                type_name: source_type.full_name(),
                method_name: name.to_string(),
                shape: annotated.signature.to_string(),
            }),
            1 => Ok(candidates.remove(0)),
            count => Err(Error::AmbiguousMatch {
                type_name: source_type.full_name(),
                method_name: name.to_string(),
                candidates: count,
            }),
        }
    }
}

impl fmt::Debug for MethodResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodResolver")
            .field("caching", &self.cache.is_some())
            .field("cached", &self.cached())
            .finish()
    }
}
