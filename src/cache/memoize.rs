//! Memoize Combinator
//!
//! Wraps an async operation so its results are served from a
//! [`CacheManager`] keyed by the call's arguments.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::CacheManager;
use crate::hashing::short_digest;

/// Length of the argument digest in default keys.
const ARGS_DIGEST_LEN: usize = 16;

// == Absent Results ==
/// Values that can represent "no result". Absent results are only cached
/// when [`WrapOptions::cache_none`] is set.
pub trait MaybeAbsent {
    fn is_absent(&self) -> bool;
}

impl MaybeAbsent for serde_json::Value {
    fn is_absent(&self) -> bool {
        self.is_null()
    }
}

impl<T> MaybeAbsent for Option<T> {
    fn is_absent(&self) -> bool {
        self.is_none()
    }
}

/// Derives a cache key from call arguments.
pub type KeyFn<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

// == Options ==
/// How a wrapped operation is cached.
pub struct WrapOptions<A> {
    ttl: Option<Duration>,
    key_fn: Option<KeyFn<A>>,
    cache_none: bool,
}

impl<A> Default for WrapOptions<A> {
    fn default() -> Self {
        Self {
            ttl: None,
            key_fn: None,
            cache_none: false,
        }
    }
}

impl<A> fmt::Debug for WrapOptions<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapOptions")
            .field("ttl", &self.ttl)
            .field("key_fn", &self.key_fn.is_some())
            .field("cache_none", &self.cache_none)
            .finish()
    }
}

impl<A> WrapOptions<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL for cached results. Falls back to the manager's default.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Custom key derivation replacing the argument hash.
    pub fn key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Also cache absent results.
    pub fn cache_none(mut self, cache_none: bool) -> Self {
        self.cache_none = cache_none;
        self
    }
}

// == Memoized ==
/// An operation whose successful results are memoized.
pub struct Memoized<A, V, F> {
    cache: Arc<CacheManager<V>>,
    name: String,
    operation: F,
    options: WrapOptions<A>,
    _args: PhantomData<fn(A)>,
}

impl<V: Clone + Send + 'static> CacheManager<V> {
    /// Wraps `operation` so its results are cached under `name`.
    ///
    /// Keys are `options.key_fn(args)` when set, otherwise
    /// `"{name}_{digest}"` where the digest covers the JSON form of the
    /// arguments.
    ///
    /// # Example
    /// ```ignore
    /// let quote = cache.wrap("get_quote", fetch_quote, WrapOptions::new().ttl(Duration::from_secs(30)));
    /// let value = quote.call(("AAPL".to_string(),)).await?;
    /// ```
    pub fn wrap<A, F, Fut, E>(
        self: &Arc<Self>,
        name: impl Into<String>,
        operation: F,
        options: WrapOptions<A>,
    ) -> Memoized<A, V, F>
    where
        A: Serialize,
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        Memoized {
            cache: Arc::clone(self),
            name: name.into(),
            operation,
            options,
            _args: PhantomData,
        }
    }
}

impl<A, V, F, Fut, E> Memoized<A, V, F>
where
    A: Serialize,
    V: Clone + Send + MaybeAbsent + 'static,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    /// Returns the cached result for `args`, or runs the operation and
    /// caches what it returns. Errors are passed through uncached.
    pub async fn call(&self, args: A) -> Result<V, E> {
        let key = match self.cache_key(&args) {
            Some(key) => key,
            None => return (self.operation)(args).await,
        };

        if let Some(value) = self.cache.get(&key) {
            debug!(operation = %self.name, key = %key, "memoized result served from cache");
            return Ok(value);
        }

        let value = (self.operation)(args).await?;
        if !value.is_absent() || self.options.cache_none {
            self.cache.set(key, value.clone(), self.options.ttl);
        }
        Ok(value)
    }

    /// Key the result for `args` is stored under, None if the arguments
    /// cannot be serialized.
    pub fn cache_key(&self, args: &A) -> Option<String> {
        if let Some(key_fn) = &self.options.key_fn {
            return Some(key_fn(args));
        }
        match serde_json::to_string(args) {
            Ok(encoded) => Some(format!(
                "{}_{}",
                self.name,
                short_digest(&encoded, ARGS_DIGEST_LEN)
            )),
            Err(e) => {
                warn!(operation = %self.name, error = %e, "arguments not serializable, skipping cache");
                None
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
