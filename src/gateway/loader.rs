//! Lazy-loading model registry
//!
//! Each capability (recognizer/translator/synthesizer) is loaded on first
//! use and unloaded after sitting idle, rather than held in a global for the
//! life of the process. Owned by `AppContext`, not a module-level static,
//! so tests can construct independent instances.

use crate::error::GatewayError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

struct LoaderState<T> {
    loaded: Option<T>,
    last_used: Instant,
}

/// Holds a lazily-constructed, idle-unloadable instance of `T` (typically
/// `Arc<dyn Recognizer>` and friends).
pub struct LazyLoader<T: Clone + Send + 'static> {
    name: &'static str,
    factory: Box<dyn Fn() -> BoxFuture<Result<T, GatewayError>> + Send + Sync>,
    state: Mutex<LoaderState<T>>,
    idle_unload: Duration,
}

impl<T: Clone + Send + 'static> LazyLoader<T> {
    pub fn new<F, Fut>(name: &'static str, idle_unload: Duration, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        Self {
            name,
            factory: Box::new(move || Box::pin(factory())),
            state: Mutex::new(LoaderState {
                loaded: None,
                last_used: Instant::now(),
            }),
            idle_unload,
        }
    }

    /// Return the loaded instance, constructing it first if necessary.
    pub async fn get(&self) -> Result<T, GatewayError> {
        let mut state = self.state.lock().await;
        state.last_used = Instant::now();
        if let Some(instance) = &state.loaded {
            return Ok(instance.clone());
        }
        info!(loader = self.name, "loading model");
        let instance = (self.factory)().await?;
        state.loaded = Some(instance.clone());
        Ok(instance)
    }

    /// Unload if idle for longer than `idle_unload`. No-op if unloaded or
    /// still in use.
    async fn unload_if_idle(&self) {
        let mut state = self.state.lock().await;
        if state.loaded.is_some() && state.last_used.elapsed() >= self.idle_unload {
            debug!(loader = self.name, "unloading idle model");
            state.loaded = None;
        }
    }
}

/// Spawn a background task that periodically checks `loader` for idleness.
/// Returns the task handle so callers can abort it on shutdown.
pub fn spawn_idle_unload_task<T: Clone + Send + 'static>(
    loader: Arc<LazyLoader<T>>,
    check_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(check_interval);
        loop {
            interval.tick().await;
            loader.unload_if_idle().await;
        }
    })
}
