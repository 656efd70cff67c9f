use std::time::Instant;
use tokio::sync::Mutex;

/// Token bucket size for channel upgrades.
pub const BUCKET_CAPACITY: f64 = 10.0;
/// Refill rate, in tokens per second.
pub const REFILL_PER_SEC: f64 = 10.0;

#[derive(Debug)]
pub enum AdmissionError {
    /// The upgrade token bucket is empty.
    RateLimited,
    /// The configured session cap has been reached.
    AtCapacity,
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::RateLimited => write!(f, "upgrade rate limit exceeded"),
            AdmissionError::AtCapacity => write!(f, "session capacity reached"),
        }
    }
}

impl std::error::Error for AdmissionError {}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket gating new channel upgrades.
pub struct AdmissionLimiter {
    bucket: Mutex<Bucket>,
}

impl AdmissionLimiter {
    pub fn new() -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: BUCKET_CAPACITY,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token, refilling first. Fails when the bucket is empty.
    pub async fn try_admit(&self) -> Result<(), AdmissionError> {
        let mut bucket = self.bucket.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * REFILL_PER_SEC).min(BUCKET_CAPACITY);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(AdmissionError::RateLimited)
        }
    }
}

impl Default for AdmissionLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Enforces the configured session cap.
pub fn check_capacity(live_sessions: usize, max_connections: usize) -> Result<(), AdmissionError> {
    if live_sessions >= max_connections {
        return Err(AdmissionError::AtCapacity);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_burst_is_capped_at_bucket_capacity() {
        let limiter = AdmissionLimiter::new();

        let mut admitted = 0;
        let mut rejected = 0;
        for _ in 0..15 {
            match limiter.try_admit().await {
                Ok(()) => admitted += 1,
                Err(AdmissionError::RateLimited) => rejected += 1,
                Err(other) => panic!("unexpected admission error: {}", other),
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(rejected, 5);
    }

    #[tokio::test]
    async fn test_bucket_refills_over_time() {
        let limiter = AdmissionLimiter::new();

        // Drain the bucket
        for _ in 0..10 {
            limiter.try_admit().await.unwrap();
        }
        assert!(limiter.try_admit().await.is_err());

        // 500ms at 10 tokens/s buys at least 4 more upgrades
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.try_admit().await.is_ok() {
                admitted += 1;
            }
        }
        assert!(admitted >= 4, "expected at least 4 refilled tokens, got {}", admitted);
    }

    #[test]
    fn test_capacity_check() {
        assert!(check_capacity(0, 2).is_ok());
        assert!(check_capacity(1, 2).is_ok());
        assert!(matches!(
            check_capacity(2, 2),
            Err(AdmissionError::AtCapacity)
        ));
        // maxConnections = 0 admits nobody
        assert!(matches!(
            check_capacity(0, 0),
            Err(AdmissionError::AtCapacity)
        ));
    }
}
