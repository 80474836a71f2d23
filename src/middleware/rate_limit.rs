use uuid::Uuid;

use crate::cache::TieredCache;
use crate::errors::AppError;

/// Fixed-window limit applied to every authenticated user.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max_requests: u64,
    pub window_secs: u64,
}

impl RateLimit {
    pub fn is_disabled(&self) -> bool {
        self.max_requests == 0 || self.window_secs == 0
    }
}

/// Count this request against the user's current window.
///
/// Windows are aligned to the epoch so every replica sharing Redis agrees on
/// the bucket. Returns the request count within the window.
pub async fn check_user_rate_limit(
    cache: &TieredCache,
    user_id: Uuid,
    limit: RateLimit,
    now_secs: u64,
) -> Result<u64, AppError> {
    if limit.is_disabled() {
        return Ok(0);
    }

    let (key, retry_after_secs) = window_key(user_id, limit.window_secs, now_secs);
    let count = cache
        .increment(&key, limit.window_secs)
        .await
        .map_err(AppError::Internal)?;

    if count > limit.max_requests {
        tracing::warn!(
            rate_limit = true,
            user_id = %user_id,
            limit = limit.max_requests,
            count = count,
            "rate limit exceeded"
        );
        return Err(AppError::RateLimitExceeded { retry_after_secs });
    }
    Ok(count)
}

/// Counter key for the window containing `now_secs`, plus the seconds until
/// that window closes.
fn window_key(user_id: Uuid, window_secs: u64, now_secs: u64) -> (String, u64) {
    let bucket = now_secs / window_secs;
    let remaining = window_secs - (now_secs % window_secs);
    (format!("rate:user:{}:{}:{}", user_id, window_secs, bucket), remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_key_alignment() {
        let id = Uuid::nil();
        let (k1, r1) = window_key(id, 60, 120);
        let (k2, r2) = window_key(id, 60, 179);
        let (k3, _) = window_key(id, 60, 180);
        assert_eq!(k1, k2);
        assert_ne!(k2, k3);
        assert_eq!(r1, 60);
        assert_eq!(r2, 1);
    }

    #[tokio::test]
    async fn test_limit_enforced_after_max_requests() {
        let cache = TieredCache::local_only();
        let limit = RateLimit { max_requests: 2, window_secs: 60 };
        let user = Uuid::new_v4();
        assert_eq!(check_user_rate_limit(&cache, user, limit, 1_000).await.unwrap(), 1);
        assert_eq!(check_user_rate_limit(&cache, user, limit, 1_001).await.unwrap(), 2);
        let err = check_user_rate_limit(&cache, user, limit, 1_002).await.unwrap_err();
        match err {
            AppError::RateLimitExceeded { retry_after_secs } => assert_eq!(retry_after_secs, 18),
            other => panic!("expected rate limit error, got {:?}", other),
        }
        // other users have their own window
        assert!(check_user_rate_limit(&cache, Uuid::new_v4(), limit, 1_002).await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_limit_disables_check() {
        let cache = TieredCache::local_only();
        let limit = RateLimit { max_requests: 0, window_secs: 60 };
        for _ in 0..5 {
            assert_eq!(check_user_rate_limit(&cache, Uuid::nil(), limit, 10).await.unwrap(), 0);
        }
        assert_eq!(cache.local_len(), 0);
    }
}
