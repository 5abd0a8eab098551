//! Small async helpers shared by the container kernels: bounded retry,
//! timeout wrapping, and the stable name hash the dynamic container uses
//! to shard its serial queues.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Retries `op` up to `max_retries` additional times (so `max_retries = 0`
/// means "try once, no retries"), waiting `retry_delay` between attempts.
/// On exhaustion, returns `Error::RetryExhausted` wrapping the last error.
pub async fn retry_with_delay<F, Fut, T>(max_retries: u32, retry_delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_retries {
                    return Err(Error::RetryExhausted {
                        attempts: attempt + 1,
                        source: Box::new(err),
                    });
                }
                attempt += 1;
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

/// Wraps `fut` with a deadline. If the deadline elapses first, `fut`'s
/// `JoinHandle` (if any) is dropped rather than forcibly aborted — the
/// in-flight operation's eventual result is simply discarded.
pub async fn with_timeout<Fut, T>(duration: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(Error::Timeout),
    }
}

/// A cooperative yield point used between iterations over child
/// collections so a large tree doesn't monopolise the event loop.
pub async fn cooperative_yield() {
    tokio::task::yield_now().await;
}

/// A deterministic, pure hash used to shard the dynamic container's 47
/// serial queues by child name. Stdlib's default hasher is explicitly
/// *not* guaranteed stable across process runs or Rust versions, so this
/// uses a small fixed-output FNV-1a implementation instead.
pub fn stable_hash(name: &str) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET_BASIS;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Number of serial queues the dynamic container shards its children
/// across.
pub const DYNAMIC_CONTAINER_SHARDS: u64 = 47;

pub fn shard_for(name: &str) -> u64 {
    stable_hash(name) % DYNAMIC_CONTAINER_SHARDS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[tokio::test(flavor = "current_thread")]
    async fn retry_exhausts_after_configured_attempts() {
        let calls = Rc::new(Cell::new(0));
        let calls_clone = Rc::clone(&calls);
        let result: Result<()> = retry_with_delay(2, Duration::from_millis(0), move || {
            calls_clone.set(calls_clone.get() + 1);
            async { Err(Error::Fatal("boom".to_string())) }
        })
        .await;
        assert_eq!(calls.get(), 3);
        match result {
            Err(Error::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn retry_returns_first_success() {
        let result = retry_with_delay(5, Duration::from_millis(0), || async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeout_fires_before_a_never_completing_future() {
        let never = std::future::pending::<Result<()>>();
        let result = with_timeout(Duration::from_millis(10), never).await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeout_passes_through_fast_futures() {
        let fast = async { Ok::<_, Error>(7) };
        let result = with_timeout(Duration::from_millis(500), fast).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash("comp1"), stable_hash("comp1"));
        assert_ne!(stable_hash("comp1"), stable_hash("comp2"));
    }

    #[test]
    fn shard_for_is_within_range() {
        for name in ["a", "temp_comp1", "comp7", ""] {
            assert!(shard_for(name) < DYNAMIC_CONTAINER_SHARDS);
        }
    }
}
