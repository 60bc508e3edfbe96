use crate::kv::KvStore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::warn;

/// Content-addressed TTL cache fronting idempotent-by-input calls (search,
/// scrape, summarize). Keys are a stable hash of the canonically serialized
/// arguments; `"1"` and `1` hash differently. Store failures fail open: the
/// wrapped call runs and the write is skipped. Concurrent misses on the same
/// key may race; the last writer wins.
#[derive(Clone)]
pub struct ResultCache {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl ResultCache {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Return the cached value for `(prefix, args)` or invoke `f`, writing its
    /// result through on success.
    pub async fn get_or_invoke<A, T, E, F, Fut>(
        &self,
        prefix: &str,
        args: &A,
        f: F,
    ) -> Result<T, E>
    where
        A: Serialize,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = match cache_key(prefix, args) {
            Some(key) => key,
            None => return f().await,
        };

        match self.kv.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<T>(&cached) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    warn!(%key, %error, "cached value failed to decode, re-invoking");
                }
            },
            Ok(None) => {}
            Err(error) => {
                warn!(%key, %error, "cache read failed, bypassing cache");
                return f().await;
            }
        }

        let value = f().await?;

        match serde_json::to_string(&value) {
            Ok(encoded) => {
                if let Err(error) = self.kv.set_ex(&key, &encoded, self.ttl).await {
                    warn!(%key, %error, "cache write failed");
                }
            }
            Err(error) => warn!(%key, %error, "cache encode failed"),
        }

        Ok(value)
    }
}

/// `prefix:sha256(canonical json)`. Serialization follows struct field order,
/// so identical call sites produce bit-identical keys across restarts.
fn cache_key<A: Serialize>(prefix: &str, args: &A) -> Option<String> {
    use std::fmt::Write;

    let canonical = serde_json::to_string(args).ok()?;
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Some(format!("{prefix}:{hex}"))
}
