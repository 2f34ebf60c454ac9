//! Caching and lifetime management for open source state.

use crate::error::{ErrorKind, Result};
use crate::http::HttpConfig;
use crate::source::{Source, SourceKey, State};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;

type Close = Box<dyn FnOnce() + Send>;

struct Entry {
    state: State,
    close: Mutex<Option<Close>>,
}

impl Entry {
    fn close(&self) {
        let close = self.close.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(close) = close {
            close();
        }
    }
}

type Slot = Arc<OnceCell<Arc<Entry>>>;

#[derive(Default)]
struct Inner {
    slots: HashMap<SourceKey, Slot>,
    /// Keys of successfully opened sources, in acquisition order.
    order: Vec<SourceKey>,
    /// Derived sources, oldest first.
    derived: VecDeque<SourceKey>,
}

impl Inner {
    /// Removes `key` and returns its entry, if it was open.
    fn take(&mut self, key: &SourceKey) -> Option<Arc<Entry>> {
        self.order.retain(|k| k != key);
        self.derived.retain(|k| k != key);
        self.slots.remove(key).and_then(|slot| slot.get().cloned())
    }
}

/// Owns the connection and session state of every source opened through it.
///
/// Sources that compare equal share one state object, created by exactly one
/// call to [`Source::open`]. At most `width` derived sources (archives,
/// decompressed streams, mail bodies) are kept open at once; the least
/// recently opened one is closed to make room. Teardown closes states in the
/// reverse of the order they were opened in.
pub struct SourceManager {
    width: usize,
    http: HttpConfig,
    inner: Mutex<Inner>,
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::new(3)
    }
}

impl std::fmt::Debug for SourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SourceManager")
            .field("width", &self.width)
            .field("open", &inner.order.len())
            .field("derived", &inner.derived.len())
            .finish()
    }
}

impl SourceManager {
    pub fn new(width: usize) -> Self {
        Self { width: width.max(1), http: HttpConfig::default(), inner: Mutex::default() }
    }

    /// Sets the HTTP settings used by sources opened through this manager.
    pub fn with_http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn http(&self) -> &HttpConfig {
        &self.http
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the state for `source`, opening it on first use.
    pub async fn open(&self, source: &dyn Source) -> Result<State> {
        let key = SourceKey::of(source);
        // The lock is never held across an await: opening a derived source
        // re-enters the manager to open its parent.
        let slot = self.lock().slots.entry(key.clone()).or_default().clone();
        let entry = slot
            .get_or_try_init(|| async {
                tracing::debug!(source = key.label, "opening source");
                let opened = source.open(self).await?;
                Ok::<_, crate::error::Error>(Arc::new(Entry { state: opened.state, close: Mutex::new(opened.close) }))
            })
            .await?
            .clone();
        self.acquired(key, source.handle().is_some());
        Ok(entry.state.clone())
    }

    /// Like [`SourceManager::open`], downcasting the state to the type the
    /// caller expects.
    pub async fn open_as<T: Any + Send + Sync>(&self, source: &dyn Source) -> Result<Arc<T>> {
        self.open(source)
            .await?
            .downcast::<T>()
            .map_err(|_| exn::Exn::from(ErrorKind::StateType(source.type_label())))
    }

    fn acquired(&self, key: SourceKey, derived: bool) {
        let evicted = {
            let mut inner = self.lock();
            if inner.order.contains(&key) || !inner.slots.contains_key(&key) {
                return;
            }
            inner.order.push(key.clone());
            if !derived {
                return;
            }
            inner.derived.push_back(key);
            let mut evicted = Vec::new();
            while inner.derived.len() > self.width {
                let Some(oldest) = inner.derived.front().cloned() else { break };
                evicted.extend(inner.take(&oldest));
            }
            evicted
        };
        for entry in evicted {
            tracing::debug!("closing least recently opened derived source");
            entry.close();
        }
    }

    /// Closes derived state (temporary files, nested archives) while keeping
    /// top-level connections open.
    pub fn clear_dependents(&self) {
        let entries: Vec<_> = {
            let mut inner = self.lock();
            let keys: Vec<_> = inner.derived.iter().rev().cloned().collect();
            keys.iter().filter_map(|k| inner.take(k)).collect()
        };
        entries.iter().for_each(|entry| entry.close());
    }

    /// Closes everything, most recently opened first.
    pub fn clear(&self) {
        let entries: Vec<_> = {
            let mut inner = self.lock();
            let keys: Vec<_> = inner.order.iter().rev().cloned().collect();
            let entries = keys.iter().filter_map(|k| inner.take(k)).collect();
            inner.slots.clear();
            entries
        };
        entries.iter().for_each(|entry| entry.close());
    }

    /// Number of currently open sources.
    pub fn open_count(&self) -> usize {
        self.lock().order.len()
    }
}

impl Drop for SourceManager {
    fn drop(&mut self) {
        self.clear();
    }
}
