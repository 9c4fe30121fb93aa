use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use dispatch_service::{
    clients::http::HttpFailure,
    models::retry::RetryConfig,
    utils::{bounded, is_timeout, retry_when, retry_with_backoff},
};
use tokio::time::Instant;

fn fast_config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 20,
        max_delay_ms: 60,
        backoff_multiplier: 2,
    }
}

/// Test: A gateway that recovers on the third attempt is retried to success
#[tokio::test]
async fn test_transient_failures_retried_until_success() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));

    let result = retry_when(
        &fast_config(4),
        || {
            let attempts = Arc::clone(&attempts);
            async move {
                match attempts.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(HttpFailure::Transient("status 503".to_string())),
                    _ => Ok("sent"),
                }
            }
        },
        HttpFailure::is_transient,
    )
    .await;

    assert_eq!(result, Ok("sent"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    Ok(())
}

/// Test: A permanent failure stops retrying at once
#[tokio::test]
async fn test_permanent_failure_not_retried() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));

    let result: Result<(), HttpFailure> = retry_when(
        &fast_config(5),
        || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(HttpFailure::Permanent("status 400: invalid number".to_string()))
            }
        },
        HttpFailure::is_transient,
    )
    .await;

    assert!(matches!(result, Err(HttpFailure::Permanent(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    Ok(())
}

/// Test: Unconditional retry gives up after max_attempts
#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));

    let result = retry_with_backoff(&fast_config(3), || {
        let attempts = Arc::clone(&attempts);
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow!("connection reset"))
        }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    Ok(())
}

/// Test: Backoff delays grow and stay under the cap
#[tokio::test]
async fn test_backoff_grows_and_is_capped() -> Result<()> {
    let config = fast_config(5);
    let start = Instant::now();
    let times = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    let _ = retry_with_backoff(&config, || {
        let times = Arc::clone(&times);
        async move {
            times.lock().await.push(start.elapsed().as_millis());
            Err::<(), _>(anyhow!("timeout"))
        }
    })
    .await;

    let times = times.lock().await;
    assert_eq!(times.len(), 5);

    let gaps: Vec<u128> = times.windows(2).map(|pair| pair[1] - pair[0]).collect();

    // 20ms, 40ms, then capped at 60ms, each within the ±10% jitter.
    assert!(gaps[0] >= 18, "first gap {} too short", gaps[0]);
    assert!(gaps[1] >= 36, "second gap {} too short", gaps[1]);
    for gap in &gaps[2..] {
        assert!(*gap >= 54, "capped gap {} too short", gap);
        assert!(*gap < 200, "capped gap {} ignores max_delay_ms", gap);
    }

    Ok(())
}

/// Test: A lookup past its deadline fails with a recognisable timeout
#[tokio::test]
async fn test_bounded_lookup_times_out() -> Result<()> {
    let slow = bounded(Duration::from_millis(20), "contact lookup", async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, anyhow::Error>(1)
    })
    .await;

    let err = slow.unwrap_err();
    assert!(is_timeout(&err));
    assert!(format!("{:#}", err).contains("contact lookup"));

    let failed = bounded(Duration::from_secs(1), "contact lookup", async {
        Err::<u32, _>(anyhow!("directory returned 500"))
    })
    .await;

    assert!(!is_timeout(&failed.unwrap_err()));

    Ok(())
}
