//! Lock identifiers and the resolvers that build them.
//!
//! Every identifier has the form `{prefix}-{business name}-{key values}`
//! with key values joined by `-`. Explicit key values and key expressions
//! evaluated against a call both end in [`canonicalize`], so the same
//! logical inputs always name the same lock.

use crate::error::{LockError, Result};
use crate::expression::{evaluate_all, CallArgs};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Namespace of locks taken by the service-lock wrapper.
pub const SERVICE_LOCK: &str = "SERVICE_LOCK";

/// Namespace of repeat-submission markers.
pub const REPEAT_LIMIT: &str = "REPEAT_LIMIT";

/// Canonical name of one logical exclusion point.
///
/// Equality and hashing are on the string alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockIdentifier(String);

impl LockIdentifier {
    /// Wrap an already-canonical string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key derived from the identifier, on the same Redis Cluster
    /// slot as the identifier itself.
    ///
    /// An identifier without a hash tag is wrapped in one (`{id}:suffix`
    /// hashes like `id`); one that already carries a tag keeps it.
    #[must_use]
    pub fn derived(&self, suffix: &str) -> String {
        if has_hash_tag(&self.0) {
            format!("{}:{suffix}", self.0)
        } else {
            format!("{{{}}}:{suffix}", self.0)
        }
    }
}

/// Whether Redis Cluster would hash `key` by a `{tag}` rather than whole.
fn has_hash_tag(key: &str) -> bool {
    key.find('{')
        .and_then(|open| key[open + 1..].find('}'))
        .is_some_and(|len| len > 0)
}

impl fmt::Display for LockIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LockIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Build an identifier from its parts.
///
/// # Errors
///
/// Returns [`LockError::Configuration`] if the prefix, name or any key
/// value is empty.
pub fn canonicalize(prefix: &str, business_name: &str, key_values: &[String]) -> Result<LockIdentifier> {
    if prefix.is_empty() {
        return Err(LockError::configuration("lock prefix is empty"));
    }
    if business_name.trim().is_empty() {
        return Err(LockError::configuration("lock business name is empty"));
    }
    if let Some(position) = key_values.iter().position(|value| value.is_empty()) {
        return Err(LockError::configuration(format!(
            "key value {position} of lock `{business_name}` is empty"
        )));
    }

    let mut identifier = format!("{prefix}-{}", business_name.trim());
    for value in key_values {
        identifier.push('-');
        identifier.push_str(value);
    }
    Ok(LockIdentifier(identifier))
}

/// Strategy turning business names and keys into identifiers.
pub trait LockInfoResolver: Send + Sync + fmt::Debug {
    /// Prefix every identifier from this resolver starts with.
    fn prefix(&self) -> &str;

    /// Identifier from explicit key values.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Configuration`] for empty parts.
    fn resolve(&self, business_name: &str, key_values: &[String]) -> Result<LockIdentifier> {
        canonicalize(self.prefix(), business_name, key_values)
    }

    /// Identifier from key expressions evaluated against a call.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Configuration`] if an expression cannot be
    /// resolved.
    fn resolve_call(
        &self,
        business_name: &str,
        expressions: &[String],
        args: &CallArgs,
    ) -> Result<LockIdentifier> {
        let key_values = evaluate_all(expressions, args)?;
        self.resolve(business_name, &key_values)
    }
}

/// Resolver prefixing identifiers with `{environment}-{namespace}`.
#[derive(Debug, Clone)]
pub struct PrefixResolver {
    prefix: String,
}

impl PrefixResolver {
    /// Create a resolver for `namespace` within `environment`.
    #[must_use]
    pub fn new(environment: &str, namespace: &str) -> Self {
        Self {
            prefix: format!("{environment}-{namespace}"),
        }
    }
}

impl LockInfoResolver for PrefixResolver {
    fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Resolvers by name, built once at start-up and shared.
#[derive(Debug, Clone, Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Arc<dyn LockInfoResolver>>,
}

impl ResolverRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the [`SERVICE_LOCK`] and [`REPEAT_LIMIT`] resolvers
    /// for `environment`.
    #[must_use]
    pub fn with_builtins(environment: &str) -> Self {
        Self::new()
            .register(SERVICE_LOCK, Arc::new(PrefixResolver::new(environment, SERVICE_LOCK)))
            .register(REPEAT_LIMIT, Arc::new(PrefixResolver::new(environment, REPEAT_LIMIT)))
    }

    /// Add or replace a resolver.
    #[must_use]
    pub fn register(mut self, name: impl Into<String>, resolver: Arc<dyn LockInfoResolver>) -> Self {
        let name = name.into();
        tracing::debug!(resolver = %name, prefix = resolver.prefix(), "Registered lock resolver");
        self.resolvers.insert(name, resolver);
        self
    }

    /// Look up a resolver.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Configuration`] for unknown names.
    pub fn get(&self, name: &str) -> Result<Arc<dyn LockInfoResolver>> {
        self.resolvers
            .get(name)
            .cloned()
            .ok_or_else(|| LockError::configuration(format!("no lock resolver named `{name}`")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_derived_keys_share_the_slot() {
        let tagged = LockIdentifier::new("{show-7}:seats");
        assert_eq!(tagged.derived("timeouts"), "{show-7}:seats:timeouts");

        let empty_tag = LockIdentifier::new("odd{}name");
        assert_eq!(empty_tag.derived("queue"), "{odd{}name}:queue");
    }

    #[test]
    fn test_identifier_format() {
        let id = canonicalize("prod-SERVICE_LOCK", "reserve", &["42".into(), "A-1".into()]).unwrap();
        assert_eq!(id.as_str(), "prod-SERVICE_LOCK-reserve-42-A-1");
        assert_eq!(id.derived("queue"), "{prod-SERVICE_LOCK-reserve-42-A-1}:queue");

        let bare = canonicalize("p", "nightly", &[]).unwrap();
        assert_eq!(bare.to_string(), "p-nightly");
    }

    #[test]
    fn test_empty_parts_rejected() {
        assert!(canonicalize("", "n", &[]).is_err());
        assert!(canonicalize("p", " ", &[]).is_err());
        assert!(canonicalize("p", "n", &["a".into(), String::new()]).is_err());
    }

    #[test]
    fn test_both_entry_points_agree() {
        let registry = ResolverRegistry::with_builtins("test");
        let resolver = registry.get(SERVICE_LOCK).unwrap();

        let args = CallArgs::new()
            .with("show", 7)
            .with("order", json!({"seats": ["B12"]}));
        let from_call = resolver
            .resolve_call("reserve", &["#show".into(), "#order.seats[0]".into()], &args)
            .unwrap();
        let explicit = resolver.resolve("reserve", &["7".into(), "B12".into()]).unwrap();

        assert_eq!(from_call, explicit);
        assert_eq!(explicit.as_str(), "test-SERVICE_LOCK-reserve-7-B12");
    }

    #[test]
    fn test_unknown_resolver() {
        let registry = ResolverRegistry::with_builtins("test");
        assert!(registry.get(REPEAT_LIMIT).is_ok());
        assert!(matches!(registry.get("AUDIT"), Err(LockError::Configuration(_))));
    }

    proptest! {
        #[test]
        fn prop_explicit_and_expression_paths_match(
            name in "[a-z]{1,12}",
            values in proptest::collection::vec("[A-Za-z0-9]{1,8}", 0..4),
        ) {
            let resolver = PrefixResolver::new("env", SERVICE_LOCK);
            let mut args = CallArgs::new();
            let mut expressions = Vec::new();
            for (i, value) in values.iter().enumerate() {
                args = args.with(format!("p{i}"), value.clone());
                expressions.push(format!("#p{i}"));
            }

            let explicit = resolver.resolve(&name, &values).unwrap();
            let from_call = resolver.resolve_call(&name, &expressions, &args).unwrap();
            prop_assert_eq!(&explicit, &from_call);
            prop_assert!(explicit.as_str().starts_with("env-SERVICE_LOCK-"));
        }
    }
}
