//! Per-credential caching and serialization of refreshes
//!
//! A [`TokenSlot`] holds the one mutable piece of a credential: its current
//! token. Reads of a still-valid token take only a read lock. When the token
//! is absent or invalid, callers queue on the refresh lock; the first caller
//! through refreshes while the others wait, then observe its outcome instead
//! of refreshing again.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use credo_clock::{Clock, DurationSecs};

use crate::{Error, Token};

/// Tunables for how a credential keeps its token valid
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshOptions {
    skew: DurationSecs,
    timeout: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            skew: Self::DEFAULT_SKEW,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

impl RefreshOptions {
    /// Tokens this close to expiry are treated as already expired
    pub const DEFAULT_SKEW: DurationSecs = DurationSecs(60);

    /// The default bound on waiting for and performing a refresh
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Sets the skew tolerance
    #[must_use]
    pub fn with_skew(mut self, skew: DurationSecs) -> Self {
        self.skew = skew;
        self
    }

    /// Sets the bound on waiting for and performing a refresh
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The skew tolerance
    #[inline]
    pub fn skew(&self) -> DurationSecs {
        self.skew
    }

    /// The bound on waiting for and performing a refresh
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug)]
struct Outcome {
    token: Option<Arc<Token>>,
    failure: Option<Error>,
}

#[derive(Debug)]
pub(crate) struct TokenSlot {
    current: RwLock<Outcome>,
    attempts: AtomicU64,
    refresh: tokio::sync::Mutex<()>,
}

impl TokenSlot {
    pub(crate) fn new(initial: Option<Token>) -> Self {
        Self {
            current: RwLock::new(Outcome {
                token: initial.map(Arc::new),
                failure: None,
            }),
            attempts: AtomicU64::new(0),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// The most recent token, whether or not it is still valid
    pub(crate) fn current(&self) -> Option<Arc<Token>> {
        self.read(|o| o.token.clone())
    }

    fn valid<C: Clock + ?Sized>(&self, clock: &C, skew: DurationSecs) -> Option<Arc<Token>> {
        let now = clock.now();
        self.read(|o| o.token.clone().filter(|t| t.is_valid_at(now, skew)))
    }

    fn read<T>(&self, f: impl FnOnce(&Outcome) -> T) -> T {
        let guard = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&guard)
    }

    fn record(&self, result: &Result<Arc<Token>, Error>) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match result {
            Ok(token) => {
                guard.token = Some(Arc::clone(token));
                guard.failure = None;
            }
            Err(error) => guard.failure = Some(error.clone()),
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn last_failure(&self) -> Option<Error> {
        self.read(|o| o.failure.clone())
    }

    /// Returns a valid token, refreshing at most once across concurrent callers
    ///
    /// A caller that waited on another caller's refresh receives that
    /// refresh's outcome. Waiting and refreshing together are bounded by the
    /// configured timeout, after which the lock is released and a
    /// [`LockTimeout`][Error::LockTimeout] is returned.
    pub(crate) async fn ensure_valid<C, F, Fut>(
        &self,
        clock: &C,
        options: RefreshOptions,
        refresh: F,
    ) -> Result<Arc<Token>, Error>
    where
        C: Clock + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Token, Error>>,
    {
        if let Some(token) = self.valid(clock, options.skew) {
            tracing::trace!("cached token is valid");
            return Ok(token);
        }

        let observed = self.attempts.load(Ordering::SeqCst);

        let attempt = async {
            let _guard = self.refresh.lock().await;

            if let Some(token) = self.valid(clock, options.skew) {
                tracing::debug!("token was refreshed while waiting");
                return Ok(token);
            }

            if self.attempts.load(Ordering::SeqCst) != observed {
                if let Some(error) = self.last_failure() {
                    tracing::debug!("refresh failed while waiting");
                    return Err(error);
                }
            }

            tracing::debug!("refreshing token");
            let result = refresh().await.map(Arc::new);
            self.record(&result);
            result
        };

        match tokio::time::timeout(options.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?options.timeout, "token refresh timed out");
                Err(Error::lock_timeout(options.timeout))
            }
        }
    }
}
