//! Cancellation tokens for deferred and in-flight requests.
//!
//! A [`CancellationToken`] owns exactly one signal. Its lifecycle is one-way
//! (`active → cancelled`); `cancel` is idempotent and the first reason wins. Transports observe
//! cancellation through a [`CancelSignal`] taken from the token.
//!
//! Tokens created with [`CancellationToken::tracked`] join a process-wide registry so
//! [`cancel_all_requests`] can abort every tracked operation at once. The registry holds weak
//! references: a tracked token leaves it when it is cancelled or when its last handle drops.
//!
//! ```rust
//! use reqpolicy::cancellation::CancellationToken;
//!
//! let token = CancellationToken::new();
//! let signal = token.signal();
//! assert!(token.cancel("navigated away"));
//! assert!(!token.cancel("second reason is ignored"));
//! assert_eq!(signal.reason().as_deref(), Some("navigated away"));
//! assert!(token.throw_if_cancelled().is_err());
//! ```

use crate::error::RequestError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::watch;

/// Reason used when a caller cancels without giving one.
pub const DEFAULT_CANCEL_REASON: &str = "Operation cancelled";

/// Read-only view of a token's cancellation state, handed to transports.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<Option<String>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve with the cancellation reason once the signal fires.
    ///
    /// Pends forever if the owning token is dropped without cancelling.
    pub async fn cancelled(&self) -> String {
        let mut rx = self.rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal").field("reason", &self.reason()).finish()
    }
}

struct TokenState {
    sender: watch::Sender<Option<String>>,
    reason: Option<String>,
}

struct TokenInner {
    state: Mutex<TokenState>,
    tracked_id: Option<u64>,
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        if let Some(id) = self.tracked_id {
            registry().lock().remove(&id);
        }
    }
}

/// Abortable handle for a single operation. Clones share state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Fresh, untracked, active token.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Fresh token registered with the process-wide registry.
    pub fn tracked() -> Self {
        let id = NEXT_TRACKED_ID.fetch_add(1, Ordering::Relaxed);
        let token = Self::build(Some(id));
        registry().lock().insert(id, Arc::downgrade(&token.inner));
        token
    }

    fn build(tracked_id: Option<u64>) -> Self {
        let (sender, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState { sender, reason: None }),
                tracked_id,
            }),
        }
    }

    /// Cancel with `reason`. Returns `true` only for the call that flipped the state.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        {
            let mut state = self.inner.state.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            state.sender.send_replace(Some(reason.clone()));
        }
        if let Some(id) = self.inner.tracked_id {
            registry().lock().remove(&id);
        }
        tracing::debug!(reason = %reason, "cancellation token cancelled");
        true
    }

    /// Cancel with [`DEFAULT_CANCEL_REASON`].
    pub fn abort(&self) -> bool {
        self.cancel(DEFAULT_CANCEL_REASON)
    }

    /// Signal observing the token's current lifecycle.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal { rx: self.inner.state.lock().sender.subscribe() }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().reason.is_some()
    }

    /// Reason stored by the first `cancel`.
    pub fn cancellation_reason(&self) -> Option<String> {
        self.inner.state.lock().reason.clone()
    }

    /// Fail with [`RequestError::Cancelled`] if the token was cancelled.
    pub fn throw_if_cancelled(&self) -> Result<(), RequestError> {
        match self.cancellation_reason() {
            Some(reason) => Err(RequestError::Cancelled { reason }),
            None => Ok(()),
        }
    }

    /// Make a cancelled token active again with a brand-new signal.
    ///
    /// Signals taken before the reset stay cancelled. No-op on an active token.
    pub fn reset(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.reason.is_none() {
                return false;
            }
            let (sender, _rx) = watch::channel(None);
            state.sender = sender;
            state.reason = None;
        }
        if let Some(id) = self.inner.tracked_id {
            registry().lock().insert(id, Arc::downgrade(&self.inner));
        }
        true
    }

    pub fn is_tracked(&self) -> bool {
        self.inner.tracked_id.is_some()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.cancellation_reason())
            .field("tracked", &self.is_tracked())
            .finish()
    }
}

static NEXT_TRACKED_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<HashMap<u64, Weak<TokenInner>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Weak<TokenInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Untracked token.
pub fn create_cancellation_token() -> CancellationToken {
    CancellationToken::new()
}

/// Token registered for [`cancel_all_requests`].
pub fn create_tracked_cancellation_token() -> CancellationToken {
    CancellationToken::tracked()
}

/// Cancel every tracked token with `reason` and empty the registry.
///
/// Returns how many tokens this call cancelled.
pub fn cancel_all_requests(reason: &str) -> usize {
    let drained: Vec<Weak<TokenInner>> = {
        let mut guard = registry().lock();
        guard.drain().map(|(_, weak)| weak).collect()
    };
    let tokens: Vec<CancellationToken> = drained
        .iter()
        .filter_map(Weak::upgrade)
        .map(|inner| CancellationToken { inner })
        .collect();
    let cancelled = tokens.iter().filter(|t| t.cancel(reason)).count();
    tracing::info!(cancelled, reason, "cancelled all tracked requests");
    cancelled
}

/// Number of live tracked tokens.
pub fn tracked_count() -> usize {
    registry().lock().values().filter(|w| w.strong_count() > 0).count()
}
