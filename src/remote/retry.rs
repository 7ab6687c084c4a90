//! Caller-side retry loop for root updates

use super::{RemoteError, RemoteResult, RootStore};
use crate::meta::RootRecord;
use std::thread;
use std::time::Duration;

const BASE_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Read the root, compute a replacement with `update`, and swap it in.
///
/// The epoch is read before the root so that a GC cycle starting while
/// `update` runs invalidates the swap. A lost race backs off and retries, up
/// to `attempts` times. `update` returns the new (value, signature).
pub fn update_root<S, F>(store: &S, attempts: usize, mut update: F) -> RemoteResult<RootRecord>
where
    S: RootStore + ?Sized,
    F: FnMut(&RootRecord) -> RemoteResult<(String, String)>,
{
    let mut backoff = BASE_BACKOFF;
    for attempt in 1..=attempts {
        let epoch = store.get_epoch()?;
        let current = store.get_root()?;
        let (value, signature) = update(&current)?;
        let version = current.version + 1;

        if store.cas_root(&value, version, &signature, epoch)? {
            return Ok(RootRecord {
                value,
                version,
                signature,
            });
        }

        log::debug!("root swap lost at version {} (attempt {})", version, attempt);
        if attempt < attempts {
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
    Err(RemoteError::Contended(attempts))
}
