//! Ordered cache fallback sources

use crate::cache::{CachedSnapshot, SnapshotStore};
use crate::logging::StructuredLogger;
use serde::Serialize;
use std::fmt;

/// Where a fallback snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackSource {
    /// The snapshot read during the freshness check
    LoadedCache,
    /// A new read, only when the freshness check found nothing
    FreshCacheLoad,
}

impl fmt::Display for FallbackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadedCache => f.write_str("loaded cache"),
            Self::FreshCacheLoad => f.write_str("fresh cache load"),
        }
    }
}

/// Consulted in order until one yields a valid snapshot
pub const FALLBACK_CHAIN: [FallbackSource; 2] =
    [FallbackSource::LoadedCache, FallbackSource::FreshCacheLoad];

/// Walk `chain` and return the first usable snapshot
///
/// `loaded` is what the cycle read up front; `None` means the up-front read
/// found nothing, which is the only case where the store is read again.
pub fn resolve(
    chain: &[FallbackSource],
    loaded: Option<CachedSnapshot>,
    store: &dyn SnapshotStore,
    instance_id: &str,
    logger: &StructuredLogger,
) -> Option<(FallbackSource, CachedSnapshot)> {
    let had_loaded = loaded.is_some();
    let mut loaded = loaded;

    for source in chain {
        let candidate = match source {
            FallbackSource::LoadedCache => loaded.take(),
            FallbackSource::FreshCacheLoad if had_loaded => None,
            FallbackSource::FreshCacheLoad => match store.load(instance_id) {
                Ok(found) => found,
                Err(e) => {
                    logger.warn(&format!("Cache unavailable during fallback: {e}"));
                    None
                }
            },
        };

        let Some(cached) = candidate else {
            continue;
        };
        match cached.snapshot.validate() {
            Ok(()) => return Some((*source, cached)),
            Err(e) => logger.warn(&format!("Skipping invalid {source} snapshot: {e}")),
        }
    }
    None
}
