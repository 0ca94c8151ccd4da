//! Transcription Client Contract
//!
//! The remote speech-to-text service lives outside this system; what the
//! pipeline depends on is the submission contract: a blocking
//! [`TranscriptionClient`] call driven from a dedicated worker, a token
//! bucket honoring the service's rate limit, and bounded retries with
//! exponential backoff. [`submit_with_retry`] composes the three and polls
//! the shutdown flag between attempts so teardown never waits on a retry
//! schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// One channel's audio segment submitted for transcription
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    /// 16-bit LE PCM, single channel
    pub audio: Vec<u8>,
    pub sample_rate: u32,
    /// "left" or "right"
    pub channel: String,
}

/// A time-aligned piece of the transcription
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub start_ms: f64,
    pub end_ms: f64,
    pub text: String,
}

/// Result returned by the transcription service
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionResult {
    pub text: String,
    pub confidence: f32,
    pub segments: Vec<TranscriptSegment>,
}

/// Transcription submission failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscribeError {
    /// The service pushed back; retry after backoff
    #[error("transcription rate limited")]
    RateLimited,

    /// Service-side failure with its status code
    #[error("transcription api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The backend cannot be reached at all
    #[error("transcription backend unavailable: {0}")]
    Unavailable(String),

    /// Shutdown was requested while waiting to submit
    #[error("transcription submission aborted by shutdown")]
    Shutdown,
}

impl TranscribeError {
    /// Whether another attempt may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TranscribeError::RateLimited | TranscribeError::Unavailable(_)
        ) || matches!(self, TranscribeError::Api { status, .. } if *status >= 500)
    }
}

/// Blocking transcription backend
pub trait TranscriptionClient: Send + Sync {
    fn transcribe(&self, request: TranscriptionRequest)
        -> Result<TranscriptionResult, TranscribeError>;
}

/// Token-bucket rate limiter (default 10 submissions per minute)
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, per: Duration) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity / per.as_secs_f64().max(0.001),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Ten per minute, the service default
    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait up to `timeout` for a token, polling the shutdown flag.
    pub fn acquire_within(&self, timeout: Duration, shutdown: &AtomicBool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire() {
                return true;
            }
            if shutdown.load(Ordering::SeqCst) || Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }
}

/// Retry schedule: exponential backoff from `base_delay`, capped
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        (self.base_delay * factor as u32).min(self.max_delay)
    }
}

/// Drive one request through the rate limiter, the client and the retry
/// policy. Honors `shutdown` between attempts.
pub fn submit_with_retry(
    client: &dyn TranscriptionClient,
    bucket: &TokenBucket,
    policy: &RetryPolicy,
    request: TranscriptionRequest,
    shutdown: &AtomicBool,
) -> Result<TranscriptionResult, TranscribeError> {
    let mut last_error = TranscribeError::Unavailable("no attempt made".into());

    for attempt in 0..=policy.max_retries {
        if shutdown.load(Ordering::SeqCst) {
            return Err(TranscribeError::Shutdown);
        }
        if attempt > 0 {
            let delay = policy.delay_for(attempt - 1);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "transcription retry");
            // Sleep in slices so shutdown stays responsive
            let deadline = Instant::now() + delay;
            while Instant::now() < deadline {
                if shutdown.load(Ordering::SeqCst) {
                    return Err(TranscribeError::Shutdown);
                }
                std::thread::sleep(Duration::from_millis(20).min(delay));
            }
        }

        if !bucket.acquire_within(Duration::from_secs(30), shutdown) {
            if shutdown.load(Ordering::SeqCst) {
                return Err(TranscribeError::Shutdown);
            }
            last_error = TranscribeError::RateLimited;
            continue;
        }

        match client.transcribe(request.clone()) {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retriable() => {
                warn!(error = %e, attempt, "transcription attempt failed");
                last_error = e;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error)
}

/// Client returning a fixed result, for tests and offline runs
pub struct FixedTranscriptionClient {
    pub text: String,
    pub confidence: f32,
}

impl FixedTranscriptionClient {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

impl TranscriptionClient for FixedTranscriptionClient {
    fn transcribe(
        &self,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, TranscribeError> {
        let duration_ms =
            request.audio.len() as f64 / 2.0 / request.sample_rate.max(1) as f64 * 1000.0;
        Ok(TranscriptionResult {
            text: self.text.clone(),
            confidence: self.confidence,
            segments: vec![TranscriptSegment {
                start_ms: 0.0,
                end_ms: duration_ms,
                text: self.text.clone(),
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn request() -> TranscriptionRequest {
        TranscriptionRequest {
            audio: vec![0u8; 3200],
            sample_rate: 16_000,
            channel: "left".into(),
        }
    }

    #[test]
    fn test_token_bucket_capacity() {
        let bucket = TokenBucket::per_minute(3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire(), "bucket should be empty");
    }

    #[test]
    fn test_token_bucket_refills() {
        let bucket = TokenBucket::new(2, Duration::from_millis(100));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        std::thread::sleep(Duration::from_millis(120));
        assert!(bucket.try_acquire(), "tokens should have refilled");
    }

    #[test]
    fn test_acquire_within_respects_shutdown() {
        let bucket = TokenBucket::per_minute(1);
        assert!(bucket.try_acquire());
        let shutdown = AtomicBool::new(true);
        assert!(!bucket.acquire_within(Duration::from_secs(5), &shutdown));
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for(2), Duration::from_millis(800));
        // Capped
        assert_eq!(policy.delay_for(10), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_client() {
        let client = FixedTranscriptionClient::new("hello", 0.9);
        let result = client.transcribe(request()).unwrap();
        assert_eq!(result.text, "hello");
        assert_eq!(result.segments.len(), 1);
        // 3200 bytes = 1600 samples = 100ms at 16kHz
        assert!((result.segments[0].end_ms - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_submit_retries_then_succeeds() {
        struct FlakyClient {
            failures: AtomicU32,
        }
        impl TranscriptionClient for FlakyClient {
            fn transcribe(
                &self,
                _request: TranscriptionRequest,
            ) -> Result<TranscriptionResult, TranscribeError> {
                if self.failures.fetch_sub(1, Ordering::SeqCst) > 1 {
                    Err(TranscribeError::Unavailable("flaky".into()))
                } else {
                    Ok(TranscriptionResult {
                        text: "ok".into(),
                        confidence: 1.0,
                        segments: vec![],
                    })
                }
            }
        }

        let client = FlakyClient {
            failures: AtomicU32::new(2),
        };
        let bucket = TokenBucket::per_minute(10);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let shutdown = AtomicBool::new(false);

        let result = submit_with_retry(&client, &bucket, &policy, request(), &shutdown).unwrap();
        assert_eq!(result.text, "ok");
    }

    #[test]
    fn test_submit_gives_up_after_max_retries() {
        struct DeadClient;
        impl TranscriptionClient for DeadClient {
            fn transcribe(
                &self,
                _request: TranscriptionRequest,
            ) -> Result<TranscriptionResult, TranscribeError> {
                Err(TranscribeError::Unavailable("down".into()))
            }
        }

        let bucket = TokenBucket::per_minute(10);
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let shutdown = AtomicBool::new(false);

        let err =
            submit_with_retry(&DeadClient, &bucket, &policy, request(), &shutdown).unwrap_err();
        assert!(matches!(err, TranscribeError::Unavailable(_)));
    }

    #[test]
    fn test_submit_aborts_on_shutdown() {
        struct NeverCalled;
        impl TranscriptionClient for NeverCalled {
            fn transcribe(
                &self,
                _request: TranscriptionRequest,
            ) -> Result<TranscriptionResult, TranscribeError> {
                panic!("client must not be called after shutdown");
            }
        }

        let bucket = TokenBucket::per_minute(10);
        let policy = RetryPolicy::default();
        let shutdown = AtomicBool::new(true);

        let err =
            submit_with_retry(&NeverCalled, &bucket, &policy, request(), &shutdown).unwrap_err();
        assert_eq!(err, TranscribeError::Shutdown);
    }

    #[test]
    fn test_non_retriable_error_fails_fast() {
        struct BadRequestClient {
            calls: AtomicU32,
        }
        impl TranscriptionClient for BadRequestClient {
            fn transcribe(
                &self,
                _request: TranscriptionRequest,
            ) -> Result<TranscriptionResult, TranscribeError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(TranscribeError::Api {
                    status: 400,
                    message: "bad audio".into(),
                })
            }
        }

        let client = BadRequestClient {
            calls: AtomicU32::new(0),
        };
        let bucket = TokenBucket::per_minute(10);
        let policy = RetryPolicy::default();
        let shutdown = AtomicBool::new(false);

        let err = submit_with_retry(&client, &bucket, &policy, request(), &shutdown).unwrap_err();
        assert!(matches!(err, TranscribeError::Api { status: 400, .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1, "no retries on 4xx");
    }
}
