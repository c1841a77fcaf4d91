//! Request and transfer throttling for object-storage traffic
//!
//! Three independent limits are provided, all disabled by default:
//!
//! 1. **Connection limit** - caps the number of HTTP requests in flight at any time
//! 2. **Request throttle** - limits the number of requests issued per second
//! 3. **Transfer throttle** - limits the number of bytes streamed per second, counted in
//!    chunk-size tokens
//!
//! The rate limits are token buckets backed by semaphores that a background task refills at a
//! fixed interval.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example() {
//! throttle::set_max_connections(64);
//!
//! // 200 requests per second
//! throttle::init_request_tokens(20);
//! tokio::spawn(throttle::run_request_replenish_thread(20, Duration::from_millis(100)));
//!
//! let _connection = throttle::connection_permit().await;
//! throttle::get_request_token().await;
//! // issue request here
//! # }
//! ```
//!
//! # Token Calculation
//!
//! For transfer throttling the number of tokens consumed by a buffer is:
//!
//! ```text
//! tokens = ⌈bytes / chunk_size⌉
//! ```

mod semaphore;

static CONNECTION_LIMIT: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);
static REQUEST_THROTTLE: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);
static TRANSFER_THROTTLE: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);

/// Limit the number of requests in flight, 0 disables the limit.
pub fn set_max_connections(max_connections: usize) {
    CONNECTION_LIMIT.setup(max_connections);
}

/// Held for the lifetime of one request; releases its slot on drop.
pub struct ConnectionGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn connection_permit() -> ConnectionGuard {
    ConnectionGuard {
        _permit: CONNECTION_LIMIT.acquire().await,
    }
}

pub fn init_request_tokens(request_tokens: usize) {
    REQUEST_THROTTLE.setup(request_tokens);
}

pub fn init_transfer_tokens(transfer_tokens: usize) {
    TRANSFER_THROTTLE.setup(transfer_tokens);
}

pub async fn get_request_token() {
    REQUEST_THROTTLE.consume().await;
}

/// Number of chunk-size tokens needed to move `bytes` bytes.
pub fn transfer_tokens(chunk_size: u64, bytes: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    1 + (std::cmp::max(1, bytes) - 1) / chunk_size
}

pub async fn get_transfer_tokens(chunk_size: u64, bytes: u64) {
    if chunk_size == 0 || !TRANSFER_THROTTLE.is_enabled() {
        return;
    }
    let tokens = transfer_tokens(chunk_size, bytes);
    match u32::try_from(tokens) {
        Ok(tokens) => TRANSFER_THROTTLE.consume_many(tokens).await,
        Err(_) => tracing::error!(
            "chunk size: {} is too small to limit throughput for buffers this big, size: {}",
            chunk_size,
            bytes,
        ),
    }
}

pub async fn run_request_replenish_thread(replenish: usize, interval: std::time::Duration) {
    REQUEST_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}

pub async fn run_transfer_replenish_thread(replenish: usize, interval: std::time::Duration) {
    TRANSFER_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_math() {
        assert_eq!(transfer_tokens(0, 1 << 20), 0);
        assert_eq!(transfer_tokens(1024, 0), 1);
        assert_eq!(transfer_tokens(1024, 1024), 1);
        assert_eq!(transfer_tokens(1024, 1025), 2);
        assert_eq!(transfer_tokens(64 * 1024, 1 << 20), 16);
    }

    #[tokio::test]
    async fn disabled_semaphore_never_blocks() {
        let sem = semaphore::Semaphore::new();
        assert!(sem.acquire().await.is_none());
        sem.consume_many(1000).await;
    }

    #[tokio::test(start_paused = true)]
    async fn replenish_refills_tokens() {
        let sem = std::sync::Arc::new(semaphore::Semaphore::new());
        sem.setup(2);
        sem.consume_many(2).await;
        let refill = {
            let sem = sem.clone();
            tokio::spawn(async move {
                sem.run_replenish_thread(2, std::time::Duration::from_millis(100))
                    .await
            })
        };
        // blocks until the replenish task adds permits back
        sem.consume().await;
        refill.abort();
    }
}
