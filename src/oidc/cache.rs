//! Time-based configuration cache with single-flight refresh.
//!
//! The cache starts empty and is populated lazily by the first reader. Once
//! the refresh interval has elapsed, or a refresh was requested, the next
//! reader starts a new load. All readers that arrive while a load is running
//! await the same shared future, so at most one load is in flight.
//!
//! Loads run on their own task: a reader that is cancelled stops waiting but
//! does not cancel the load other readers depend on.
//!
//! On a failed load the last good configuration is kept and served again,
//! with the next attempt pushed one interval forward. Only when nothing was
//! ever loaded does the error reach the readers.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{FetchFailure, KeyProviderError, Result};

/// Default time a loaded configuration stays fresh.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshInterval {
    /// Reload once this much time has passed since the last successful load.
    Every(Duration),
    /// Load once and keep the result for the life of the cache. Refresh
    /// requests are ignored.
    Never,
}

impl Default for RefreshInterval {
    fn default() -> Self {
        RefreshInterval::Every(DEFAULT_REFRESH_INTERVAL)
    }
}

impl RefreshInterval {
    fn deadline_after(&self, now: Instant) -> Option<Instant> {
        match self {
            RefreshInterval::Every(interval) => now.checked_add(*interval),
            RefreshInterval::Never => None,
        }
    }
}

/// A loaded configuration and the times governing its freshness.
#[derive(Debug)]
pub struct CachedConfiguration<T> {
    value: Arc<T>,
    last_refresh: Instant,
    next_refresh: Option<Instant>,
}

impl<T> CachedConfiguration<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    /// When the value was last loaded successfully.
    pub fn last_refresh(&self) -> Instant {
        self.last_refresh
    }

    /// When the value turns stale. `None` if it never does.
    pub fn next_refresh(&self) -> Option<Instant> {
        self.next_refresh
    }

    fn is_fresh_at(&self, now: Instant) -> bool {
        self.next_refresh.map_or(true, |deadline| now < deadline)
    }
}

pub type LoadResult<T> = std::result::Result<Arc<CachedConfiguration<T>>, Arc<KeyProviderError>>;

type Loader<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;
type SharedLoad<T> = Shared<BoxFuture<'static, LoadResult<T>>>;

struct CacheState<T> {
    current: Option<Arc<CachedConfiguration<T>>>,
    in_flight: Option<SharedLoad<T>>,
    /// Bumped by every honoured refresh request.
    requested_generation: u64,
    /// Highest request generation a finished load has answered.
    loaded_generation: u64,
    /// Time of the last request that was honoured.
    last_refresh_request: Option<Instant>,
    last_error: Option<Arc<KeyProviderError>>,
}

pub struct ConfigurationCache<T> {
    source: String,
    refresh_interval: RefreshInterval,
    loader: Loader<T>,
    state: Arc<Mutex<CacheState<T>>>,
}

impl<T: Send + Sync + 'static> ConfigurationCache<T> {
    /// Create an empty cache. `source` names what is loaded, for logs and
    /// errors; `loader` is invoked once per refresh.
    pub fn new<F>(source: impl Into<String>, refresh_interval: RefreshInterval, loader: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            refresh_interval,
            loader: Arc::new(loader),
            state: Arc::new(Mutex::new(CacheState {
                current: None,
                in_flight: None,
                requested_generation: 0,
                loaded_generation: 0,
                last_refresh_request: None,
                last_error: None,
            })),
        }
    }

    pub fn refresh_interval(&self) -> RefreshInterval {
        self.refresh_interval
    }

    /// Return the current configuration, loading it first if it is missing
    /// or stale.
    pub async fn current(&self) -> LoadResult<T> {
        let load = {
            let mut state = self.state.lock();

            if let Some(current) = &state.current {
                let refresh_pending = state.requested_generation > state.loaded_generation;
                if !refresh_pending && current.is_fresh_at(Instant::now()) {
                    return Ok(Arc::clone(current));
                }
            }

            if let Some(load) = state.in_flight.clone() {
                debug!(source = %self.source, "Joining in-flight refresh");
                load
            } else {
                let load = self.start_load(state.requested_generation);
                state.in_flight = Some(load.clone());
                load
            }
        };

        load.await
    }

    /// The cached configuration, without loading or checking freshness.
    pub fn peek(&self) -> Option<Arc<CachedConfiguration<T>>> {
        self.state.lock().current.clone()
    }

    /// Error of the most recent load, cleared by the next successful one.
    pub fn last_error(&self) -> Option<Arc<KeyProviderError>> {
        self.state.lock().last_error.clone()
    }

    /// Mark the configuration stale so the next read reloads it.
    ///
    /// Honoured at most once per refresh interval; the first request is
    /// always honoured. Ignored when the interval is [`RefreshInterval::Never`].
    pub fn request_refresh(&self) {
        let RefreshInterval::Every(interval) = self.refresh_interval else {
            debug!(source = %self.source, "Refresh interval is unbounded, ignoring refresh request");
            return;
        };

        let now = Instant::now();
        let mut state = self.state.lock();
        let honoured = match state.last_refresh_request {
            None => true,
            Some(last) => last
                .checked_add(interval)
                .is_some_and(|allowed_after| now >= allowed_after),
        };

        if honoured {
            state.requested_generation += 1;
            state.last_refresh_request = Some(now);
            debug!(source = %self.source, "Refresh requested");
        } else {
            debug!(source = %self.source, "Refresh request throttled");
        }
    }

    /// Spawn a load answering every refresh request up to `generation`.
    fn start_load(&self, generation: u64) -> SharedLoad<T> {
        let source = self.source.clone();
        let refresh_interval = self.refresh_interval;
        let state = Arc::clone(&self.state);
        let loader = Arc::clone(&self.loader);

        debug!(source = %source, "Starting refresh");

        let task = {
            let state = Arc::clone(&state);
            let source = source.clone();
            tokio::spawn(async move {
                let result = loader().await;
                install(&state, &source, refresh_interval, generation, result)
            })
        };

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let error = Arc::new(KeyProviderError::DocumentFetchFailed {
                        url: source,
                        source: FetchFailure::Aborted(join_error.to_string()),
                    });
                    let mut state = state.lock();
                    state.in_flight = None;
                    state.last_error = Some(Arc::clone(&error));
                    Err(error)
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Store the outcome of a load that answers requests up to `generation`.
fn install<T>(
    state: &Mutex<CacheState<T>>,
    source: &str,
    refresh_interval: RefreshInterval,
    generation: u64,
    result: Result<T>,
) -> LoadResult<T> {
    let now = Instant::now();
    let mut state = state.lock();
    state.in_flight = None;

    // A request made while this load was running still wants a newer value.
    state.loaded_generation = state.loaded_generation.max(generation);

    match result {
        Ok(value) => {
            let cached = Arc::new(CachedConfiguration {
                value: Arc::new(value),
                last_refresh: now,
                next_refresh: refresh_interval.deadline_after(now),
            });
            state.current = Some(Arc::clone(&cached));
            state.last_error = None;
            info!(source = %source, "Configuration refreshed");
            Ok(cached)
        }
        Err(error) => {
            let error = Arc::new(error);
            state.last_error = Some(Arc::clone(&error));

            let Some(previous) = state.current.clone() else {
                warn!(source = %source, error = %error, "Initial configuration load failed");
                return Err(error);
            };

            warn!(
                source = %source,
                error = %error,
                "Configuration refresh failed, serving last known configuration"
            );
            let stale = Arc::new(CachedConfiguration {
                value: Arc::clone(&previous.value),
                last_refresh: previous.last_refresh,
                next_refresh: refresh_interval.deadline_after(now),
            });
            state.current = Some(Arc::clone(&stale));
            Ok(stale)
        }
    }
}
