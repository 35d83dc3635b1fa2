//! Cached push registration

const SECS_PER_DAY: i64 = 86_400;

/// Storage for the last successful push registration.
pub trait PushCredentialStore {
    fn cached_device_token(&self) -> Option<&str>;
    fn binding_date(&self) -> Option<i64>;
    fn store_binding(&mut self, device_token: String, bound_at: i64);
    fn clear_binding(&mut self);
}

/// When a binding made at `bound_at` should be renewed: half of `ttl_days`
/// later. Saturates for out-of-range lifetimes; negative ones renew at once.
pub fn renewal_due_at(bound_at: i64, ttl_days: i64) -> i64 {
    bound_at.saturating_add(ttl_days.max(0).saturating_mul(SECS_PER_DAY) / 2)
}

/// Whether the server-side binding is old enough to renew.
///
/// A registration lives `ttl_days`; renew once half of that has passed, or
/// when there is no binding at all.
pub fn registration_required(store: &impl PushCredentialStore, ttl_days: i64, now: i64) -> bool {
    match store.binding_date() {
        Some(bound_at) => now > renewal_due_at(bound_at, ttl_days),
        None => true,
    }
}

/// A device token was (re)issued. Returns whether it must be registered:
/// a new token or an ageing binding.
pub fn credentials_updated(
    store: &impl PushCredentialStore,
    device_token: &str,
    ttl_days: i64,
    now: i64,
) -> bool {
    registration_required(store, ttl_days, now)
        || store.cached_device_token() != Some(device_token)
}

/// Remember a successful registration.
pub fn record_registration(store: &mut impl PushCredentialStore, device_token: String, now: i64) {
    store.store_binding(device_token, now);
}

/// The device token was revoked. Returns the token that was cached, which
/// the caller unregisters.
pub fn credentials_invalidated(store: &mut impl PushCredentialStore) -> Option<String> {
    let previous = store.cached_device_token().map(str::to_string);
    store.clear_binding();
    previous
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemoryStore {
        token: Option<String>,
        bound_at: Option<i64>,
    }

    impl PushCredentialStore for MemoryStore {
        fn cached_device_token(&self) -> Option<&str> {
            self.token.as_deref()
        }
        fn binding_date(&self) -> Option<i64> {
            self.bound_at
        }
        fn store_binding(&mut self, device_token: String, bound_at: i64) {
            self.token = Some(device_token);
            self.bound_at = Some(bound_at);
        }
        fn clear_binding(&mut self) {
            self.token = None;
            self.bound_at = None;
        }
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_no_binding_requires_registration() {
        let store = MemoryStore::default();
        assert!(registration_required(&store, 365, NOW));
        assert!(credentials_updated(&store, "aa", 365, NOW));
    }

    #[test]
    fn test_fresh_binding_same_token_skips() {
        let mut store = MemoryStore::default();
        store.store_binding("aa".to_string(), NOW - 10 * SECS_PER_DAY);
        assert!(!credentials_updated(&store, "aa", 365, NOW));
    }

    #[test]
    fn test_new_token_requires_registration() {
        let mut store = MemoryStore::default();
        store.store_binding("aa".to_string(), NOW);
        assert!(credentials_updated(&store, "bb", 365, NOW));
    }

    #[test]
    fn test_half_ttl_elapsed_requires_registration() {
        let mut store = MemoryStore::default();
        store.store_binding("aa".to_string(), NOW - 183 * SECS_PER_DAY);
        assert!(registration_required(&store, 365, NOW));

        store.store_binding("aa".to_string(), NOW - 181 * SECS_PER_DAY);
        assert!(!registration_required(&store, 365, NOW));
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let mut store = MemoryStore::default();
        store.store_binding("aa".to_string(), NOW);
        assert!(!registration_required(&store, i64::MAX / 1000, NOW));
        assert!(!registration_required(&store, i64::MAX, NOW));
        assert_eq!(renewal_due_at(i64::MAX - 1, 365), i64::MAX);
    }

    #[test]
    fn test_negative_ttl_renews_immediately() {
        let mut store = MemoryStore::default();
        store.store_binding("aa".to_string(), NOW);
        assert_eq!(renewal_due_at(NOW, -5), NOW);
        assert!(registration_required(&store, -5, NOW + 1));
    }

    #[test]
    fn test_record_then_invalidate() {
        let mut store = MemoryStore::default();
        record_registration(&mut store, "aa".to_string(), NOW);
        assert!(!credentials_updated(&store, "aa", 365, NOW + 1));

        assert_eq!(credentials_invalidated(&mut store).as_deref(), Some("aa"));
        assert!(store.cached_device_token().is_none());
        assert!(registration_required(&store, 365, NOW));
        assert_eq!(credentials_invalidated(&mut store), None);
    }
}
