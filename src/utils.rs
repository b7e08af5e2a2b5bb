/// Utility functions
use crate::errors::{RelayError, RelayResult};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Acquire `mutex` or give up after `wait`, naming the lock domain in the error
pub async fn lock_bounded<'a, T>(
    mutex: &'a Mutex<T>,
    wait: Duration,
    domain: &'static str,
) -> RelayResult<MutexGuard<'a, T>> {
    tokio::time::timeout(wait, mutex.lock())
        .await
        .map_err(|_| RelayError::LockTimeout(domain))
}

/// Round to two decimal places, half away from zero
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Arithmetic mean; `None` for an empty input
pub fn mean<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Parse a `low,high` pair
pub fn parse_range(raw: &str) -> Option<(f64, f64)> {
    let mut parts = raw.split(',').map(|s| s.trim());
    let low = parts.next()?.parse::<f64>().ok()?;
    let high = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((low, high))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_round2() {
        assert_eq!(round2(22.004), 22.0);
        assert_eq!(round2(21.456), 21.46);
        assert_eq!(round2(-3.333), -3.33);
    }

    #[test]
    fn test_mean_of_two() {
        assert_eq!(mean([20.0, 24.0]), Some(22.0));
    }

    #[test]
    fn test_mean_of_nothing() {
        assert_eq!(mean(Vec::<f64>::new()), None);
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("15,35"), Some((15.0, 35.0)));
        assert_eq!(parse_range(" -5.5 , 10 "), Some((-5.5, 10.0)));
        assert_eq!(parse_range("15"), None);
        assert_eq!(parse_range("1,2,3"), None);
        assert_eq!(parse_range("a,b"), None);
    }

    #[tokio::test]
    async fn test_lock_bounded_times_out_when_held() {
        let mutex = Arc::new(Mutex::new(0u32));
        let _held = mutex.lock().await;
        let result = lock_bounded(&mutex, Duration::from_millis(20), "test").await;
        assert!(matches!(result, Err(RelayError::LockTimeout("test"))));
    }

    #[tokio::test]
    async fn test_lock_bounded_acquires_free_lock() {
        let mutex = Mutex::new(5u32);
        let guard = lock_bounded(&mutex, Duration::from_millis(20), "test")
            .await
            .unwrap();
        assert_eq!(*guard, 5);
    }
}
