use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Hands out the next connection id or game-link generation.
///
/// Both tables guard removal by comparing these, so a displaced client
/// socket or a superseded game link can never tear down its successor's
/// entry. A process-local counter is enough: the ids never leave the
/// gateway and only need to stay unique until the process restarts.
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
