//! Run-scoped cache of expensive transformation helpers.

use crate::errors::IndexflowError;
use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::any::Any;
use std::sync::Arc;

type CachedHelper = Arc<dyn Any + Send + Sync>;

/// Cache of helpers keyed by their kind and construction arguments.
///
/// One cache is owned by each pipeline run and shared with every context
/// of that run, so a helper such as a compiled pattern is built once per
/// run instead of once per record.
#[derive(Default)]
pub struct HelperCache {
    entries: DashMap<String, CachedHelper>,
}

impl HelperCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached helper for `(kind, args)`, building it on a miss.
    ///
    /// Two threads missing on the same key may both build; the first one
    /// stored is returned to both.
    ///
    /// # Errors
    ///
    /// Returns `IndexflowError::Usage` if `build` fails, or
    /// `IndexflowError::Internal` if the key is cached with another type.
    pub fn get_or_try_insert_with<T, A, F>(
        &self,
        kind: &str,
        args: &A,
        build: F,
    ) -> Result<Arc<T>, IndexflowError>
    where
        T: Any + Send + Sync,
        A: Serialize + ?Sized,
        F: FnOnce() -> anyhow::Result<T>,
    {
        let key = cache_key(kind, args)?;
        let cached = self.entries.get(&key).map(|entry| entry.value().clone());
        if let Some(helper) = cached {
            return downcast(kind, helper);
        }

        let built: CachedHelper = Arc::new(build().map_err(|e| {
            IndexflowError::usage(format!("failed to build {kind} helper: {e:#}"))
        })?);
        let stored = self.entries.entry(key).or_insert(built).value().clone();
        downcast(kind, stored)
    }

    /// Returns a compiled regex for `pattern`.
    ///
    /// # Errors
    ///
    /// Returns `IndexflowError::Usage` if the pattern does not compile.
    pub fn regex(&self, pattern: &str) -> Result<Arc<Regex>, IndexflowError> {
        self.get_or_try_insert_with("regex", pattern, || Ok(Regex::new(pattern)?))
    }

    /// Returns the number of cached helpers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every cached helper.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for HelperCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

fn cache_key<A: Serialize + ?Sized>(kind: &str, args: &A) -> Result<String, IndexflowError> {
    let encoded = serde_json::to_vec(args).map_err(|e| {
        IndexflowError::Internal(format!("cannot encode {kind} helper arguments: {e}"))
    })?;
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(&encoded);
    Ok(hex::encode(hasher.finalize()))
}

fn downcast<T: Any + Send + Sync>(kind: &str, helper: CachedHelper) -> Result<Arc<T>, IndexflowError> {
    helper.downcast::<T>().map_err(|_| {
        IndexflowError::Internal(format!("cached {kind} helper has an unexpected type"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_builds_once_per_key() {
        let cache = HelperCache::new();
        let builds = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Arc<Vec<String>> = cache
                .get_or_try_insert_with("split", &("a,b", ','), || {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(vec!["a".to_string(), "b".to_string()])
                })
                .unwrap();
            assert_eq!(value.len(), 2);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_kind_and_args_distinguish_keys() {
        let cache = HelperCache::new();
        let _: Arc<u32> = cache.get_or_try_insert_with("a", "x", || Ok(1)).unwrap();
        let _: Arc<u32> = cache.get_or_try_insert_with("b", "x", || Ok(2)).unwrap();
        let _: Arc<u32> = cache.get_or_try_insert_with("a", "y", || Ok(3)).unwrap();
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_build_failure_is_not_cached() {
        let cache = HelperCache::new();
        let err = cache
            .get_or_try_insert_with::<u32, _, _>("broken", "x", || anyhow::bail!("nope"))
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_type_mismatch_is_internal_error() {
        let cache = HelperCache::new();
        let _: Arc<u32> = cache.get_or_try_insert_with("n", "x", || Ok(1)).unwrap();
        let err = cache
            .get_or_try_insert_with::<String, _, _>("n", "x", || Ok(String::new()))
            .unwrap_err();
        assert!(matches!(err, IndexflowError::Internal(_)));
    }

    #[test]
    fn test_regex_helper() {
        let cache = HelperCache::new();
        let re = cache.regex(r"^(\d{4})").unwrap();
        assert!(re.is_match("1999 edition"));
        assert!(matches!(cache.regex("("), Err(IndexflowError::Usage(_))));

        cache.clear();
        assert!(cache.is_empty());
    }
}
