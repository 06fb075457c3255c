//! Redirect declarations and scopes.
//!
//! A [`RedirectDeclaration`] marks a method as a replacement for (or a call-through stub
//! of) a method on another type. It names the type owning the original method, the
//! method's name if it differs from the annotated method's, and whether an implicit
//! receiver is matched. Declarations are inert values: constructing one never touches
//! the host.
//!
//! Declarations are attached to their annotated methods in a [`RedirectScope`], the unit
//! of work of [`Redirector`](crate::Redirector). One annotated method may carry several
//! declarations.
//!
//! # Directions
//!
//! | Direction | Rewritten entry | Control transferred to |
//! |-----------|-----------------|------------------------|
//! | [`FromSource`](RedirectDirection::FromSource) | method found on `source_type` | annotated method |
//! | [`ToSource`](RedirectDirection::ToSource) | annotated method | method found on `source_type` |
//!
//! # Examples
//!
//! ```rust
//! use redirection::prelude::*;
//!
//! let citizen = TypeRef::new(Token::type_def(1), "Game", "Citizen");
//!
//! // Replace the instance method `Citizen::Update`, with the name taken from the
//! // annotated replacement
//! let replace = RedirectDeclaration::new(RedirectDirection::FromSource, citizen.clone())?;
//! assert!(replace.is_instance());
//! assert_eq!(replace.method_name(), None);
//!
//! // Call through to the static `Citizen::Spawn` from a stub
//! let call = RedirectDeclaration::builder()
//!     .source_type(citizen)
//!     .method_name("Spawn")
//!     .instance(false)
//!     .direction(RedirectDirection::ToSource)
//!     .build()?;
//! assert_eq!(call.method_name(), Some("Spawn"));
//! # Ok::<(), redirection::Error>(())
//! ```

use std::fmt;

use crate::{
    metadata::method::{MethodDescriptor, MethodDescriptorRc, TypeRef},
    Error, Result,
};

/// Which of the two methods of a declaration gets rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumIter)]
pub enum RedirectDirection {
    /// The method on the source type is replaced by the annotated method.
    #[default]
    FromSource,
    /// The annotated method is replaced by the method on the source type, so calling the
    /// annotated stub calls the original.
    ToSource,
}

/// One redirection intent; see the [module documentation](self).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedirectDeclaration {
    source_type: TypeRef,
    method_name: Option<String>,
    is_instance: bool,
    direction: RedirectDirection,
}

impl RedirectDeclaration {
    /// Starts building a declaration.
    #[must_use]
    pub fn builder() -> DeclarationBuilder {
        DeclarationBuilder::default()
    }

    /// Declares a redirection of the instance method on `source_type` named like the
    /// annotated method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `source_type` has a null token.
    pub fn new(direction: RedirectDirection, source_type: TypeRef) -> Result<Self> {
        Self::builder()
            .source_type(source_type)
            .direction(direction)
            .build()
    }

    /// Like [`new`](Self::new), with an explicit instance flag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `source_type` has a null token.
    pub fn with_kind(
        direction: RedirectDirection,
        source_type: TypeRef,
        is_instance: bool,
    ) -> Result<Self> {
        Self::builder()
            .source_type(source_type)
            .instance(is_instance)
            .direction(direction)
            .build()
    }

    /// Declares a redirection of the instance method `method_name` on `source_type`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `source_type` has a null token or
    /// `method_name` is empty.
    pub fn named(
        direction: RedirectDirection,
        source_type: TypeRef,
        method_name: &str,
    ) -> Result<Self> {
        Self::builder()
            .source_type(source_type)
            .method_name(method_name)
            .direction(direction)
            .build()
    }

    /// Like [`named`](Self::named), with an explicit instance flag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `source_type` has a null token or
    /// `method_name` is empty.
    pub fn named_with_kind(
        direction: RedirectDirection,
        source_type: TypeRef,
        method_name: &str,
        is_instance: bool,
    ) -> Result<Self> {
        Self::builder()
            .source_type(source_type)
            .method_name(method_name)
            .instance(is_instance)
            .direction(direction)
            .build()
    }

    /// The type owning the original method.
    #[must_use]
    pub fn source_type(&self) -> &TypeRef {
        &self.source_type
    }

    /// The explicit method name, `None` when inferred from the annotated method.
    #[must_use]
    pub fn method_name(&self) -> Option<&str> {
        self.method_name.as_deref()
    }

    /// Whether an implicit receiver is matched.
    #[must_use]
    pub fn is_instance(&self) -> bool {
        self.is_instance
    }

    /// Which method gets rewritten.
    #[must_use]
    pub fn direction(&self) -> RedirectDirection {
        self.direction
    }

    /// The name searched for on the source type when `annotated` carries this declaration.
    #[must_use]
    pub fn resolved_name<'a>(&'a self, annotated: &'a MethodDescriptor) -> &'a str {
        self.method_name.as_deref().unwrap_or(&annotated.name)
    }
}

impl fmt::Display for RedirectDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}::{} ({})",
            self.direction,
            self.source_type,
            self.method_name.as_deref().unwrap_or("<inferred>"),
            if self.is_instance { "instance" } else { "static" }
        )
    }
}

/// Builder for [`RedirectDeclaration`].
///
/// Defaults to an instance method, an inferred name and
/// [`RedirectDirection::FromSource`].
#[derive(Debug, Clone)]
pub struct DeclarationBuilder {
    source_type: Option<TypeRef>,
    method_name: Option<String>,
    is_instance: bool,
    direction: RedirectDirection,
}

impl Default for DeclarationBuilder {
    fn default() -> Self {
        DeclarationBuilder {
            source_type: None,
            method_name: None,
            is_instance: true,
            direction: RedirectDirection::FromSource,
        }
    }
}

impl DeclarationBuilder {
    /// Sets the type owning the original method.
    #[must_use]
    pub fn source_type(mut self, source_type: TypeRef) -> Self {
        self.source_type = Some(source_type);
        self
    }

    /// Sets an explicit method name.
    #[must_use]
    pub fn method_name(mut self, name: impl Into<String>) -> Self {
        self.method_name = Some(name.into());
        self
    }

    /// Sets whether an implicit receiver is matched.
    #[must_use]
    pub fn instance(mut self, is_instance: bool) -> Self {
        self.is_instance = is_instance;
        self
    }

    /// Sets the direction.
    #[must_use]
    pub fn direction(mut self, direction: RedirectDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Validates and builds the declaration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no source type was given, its token is null,
    /// or an explicit method name is empty.
    pub fn build(self) -> Result<RedirectDeclaration> {
        let source_type = self
            .source_type
            .ok_or_else(|| Error::InvalidArgument("source type is required".to_string()))?;
        if source_type.token.is_null() {
            return Err(Error::InvalidArgument(format!(
                "source type '{source_type}' has a null token"
            )));
        }
        if self.method_name.as_deref().is_some_and(str::is_empty) {
            return Err(Error::InvalidArgument(
                "method name must not be empty".to_string(),
            ));
        }

        Ok(RedirectDeclaration {
            source_type,
            method_name: self.method_name,
            is_instance: self.is_instance,
            direction: self.direction,
        })
    }
}

/// A declaration attached to its annotated method.
#[derive(Debug, Clone)]
pub struct ScopeEntry {
    /// The redirection intent
    pub declaration: RedirectDeclaration,
    /// The method carrying the declaration
    pub annotated: MethodDescriptorRc,
}

/// A named, ordered batch of declarations processed in one pass.
///
/// Replaces scanning an assembly for attributes: the host registers every annotated
/// method explicitly. Entry order is the order redirections are applied in.
#[derive(Debug, Clone, Default)]
pub struct RedirectScope {
    name: String,
    entries: Vec<ScopeEntry>,
}

impl RedirectScope {
    /// Creates an empty scope.
    pub fn new(name: impl Into<String>) -> Self {
        RedirectScope {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Adds one declaration carried by `annotated`.
    #[must_use]
    pub fn redirect(mut self, annotated: &MethodDescriptorRc, declaration: RedirectDeclaration) -> Self {
        self.push(annotated, declaration);
        self
    }

    /// Adds several declarations carried by the same `annotated` method.
    #[must_use]
    pub fn redirect_all<I>(mut self, annotated: &MethodDescriptorRc, declarations: I) -> Self
    where
        I: IntoIterator<Item = RedirectDeclaration>,
    {
        for declaration in declarations {
            self.push(annotated, declaration);
        }
        self
    }

    /// Adds one declaration carried by `annotated`.
    pub fn push(&mut self, annotated: &MethodDescriptorRc, declaration: RedirectDeclaration) {
        self.entries.push(ScopeEntry {
            declaration,
            annotated: annotated.clone(),
        });
    }

    /// Name used in reports and logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entries in application order.
    #[must_use]
    pub fn entries(&self) -> &[ScopeEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the scope has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{signature::MethodSignature, token::Token};
    use std::sync::Arc;

    fn citizen() -> TypeRef {
        TypeRef::new(Token::type_def(1), "Game", "Citizen")
    }

    #[test]
    fn test_missing_source_type() {
        let result = RedirectDeclaration::builder().method_name("Update").build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_null_source_type() {
        let null = TypeRef::new(Token::new(0), "", "Null");
        assert!(matches!(
            RedirectDeclaration::new(RedirectDirection::FromSource, null),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(matches!(
            RedirectDeclaration::named(RedirectDirection::FromSource, citizen(), ""),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_constructor_defaults() -> Result<()> {
        let decl = RedirectDeclaration::new(RedirectDirection::ToSource, citizen())?;
        assert!(decl.is_instance());
        assert_eq!(decl.direction(), RedirectDirection::ToSource);

        let decl = RedirectDeclaration::with_kind(RedirectDirection::FromSource, citizen(), false)?;
        assert!(!decl.is_instance());
        assert_eq!(decl.method_name(), None);

        let decl = RedirectDeclaration::named(RedirectDirection::FromSource, citizen(), "Tick")?;
        assert!(decl.is_instance());
        assert_eq!(decl.method_name(), Some("Tick"));

        let decl = RedirectDeclaration::named_with_kind(
            RedirectDirection::FromSource,
            citizen(),
            "Spawn",
            false,
        )?;
        assert!(!decl.is_instance());
        Ok(())
    }

    #[test]
    fn test_resolved_name() -> Result<()> {
        let annotated = MethodDescriptor::new(
            Token::method_def(9),
            TypeRef::new(Token::type_def(2), "Mod", "Detours"),
            "Update",
            MethodSignature::default(),
        );

        let inferred = RedirectDeclaration::new(RedirectDirection::FromSource, citizen())?;
        assert_eq!(inferred.resolved_name(&annotated), "Update");

        let explicit = RedirectDeclaration::named(RedirectDirection::FromSource, citizen(), "Tick")?;
        assert_eq!(explicit.resolved_name(&annotated), "Tick");
        Ok(())
    }

    #[test]
    fn test_scope_keeps_order_and_multiple_declarations() -> Result<()> {
        let annotated = Arc::new(MethodDescriptor::new(
            Token::method_def(1),
            TypeRef::new(Token::type_def(2), "Mod", "Detours"),
            "Update",
            MethodSignature::default(),
        ));
        let first = RedirectDeclaration::named(RedirectDirection::FromSource, citizen(), "A")?;
        let second = RedirectDeclaration::named(RedirectDirection::FromSource, citizen(), "B")?;

        let scope = RedirectScope::new("mod")
            .redirect_all(&annotated, [first.clone(), second.clone()]);

        assert_eq!(scope.len(), 2);
        assert_eq!(scope.entries()[0].declaration, first);
        assert_eq!(scope.entries()[1].declaration, second);
        assert!(Arc::ptr_eq(&scope.entries()[1].annotated, &annotated));
        Ok(())
    }
}
