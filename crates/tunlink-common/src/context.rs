// ============================================
// File: crates/tunlink-common/src/context.rs
// ============================================
//! # Per-Connection Context
//!
//! ## Creation Reason
//! Every accepted flow is handed to the dispatcher together with a small
//! bag of metadata (session id, where it came from) and a cancellation
//! signal shared with the owning inbound.
//!
//! ## Main Functionality
//! - `Context`: session id, inbound metadata, cancellation
//! - `InboundInfo`: source address and inbound tag of a flow
//! - `Cancellation`: cooperative, clonable cancellation flag
//!
//! ## ⚠️ Important Note for Next Developer
//! - Cancellation is cooperative; nothing is aborted, holders must check
//!   `is_cancelled()` or await `cancelled()`
//! - Child contexts share the parent's cancellation
//!
//! ## Last Modified
//! v0.1.0 - Initial context

use std::sync::Arc;

use tokio::sync::watch;

use crate::types::{Destination, SessionId};

// ============================================
// Cancellation
// ============================================

/// Cooperative cancellation shared by clones.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    /// Creates a signal that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancels every holder of this signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Completes when the signal is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // Sender is held by `self`; the wait cannot fail.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================
// InboundInfo
// ============================================

/// Where an accepted flow entered the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundInfo {
    /// Original source of the flow
    pub source: Destination,
    /// Name of the inbound that accepted it
    pub tag: String,
}

// ============================================
// Context
// ============================================

/// Metadata and cancellation for one accepted flow.
///
/// # Example
/// ```
/// use tunlink_common::{Context, SessionId};
///
/// let root = Context::new();
/// let ctx = root.child().with_session_id(SessionId::generate());
/// root.cancellation().cancel();
/// assert!(ctx.cancellation().is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    session_id: Option<SessionId>,
    inbound: Option<InboundInfo>,
    cancellation: Cancellation,
}

impl Context {
    /// Creates a root context with its own cancellation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a context that shares this context's cancellation and
    /// carries no per-flow metadata.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            session_id: None,
            inbound: None,
            cancellation: self.cancellation.clone(),
        }
    }

    /// Sets the session id.
    #[must_use]
    pub fn with_session_id(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    /// Sets the inbound metadata.
    #[must_use]
    pub fn with_inbound(mut self, inbound: InboundInfo) -> Self {
        self.inbound = Some(inbound);
        self
    }

    /// Session id, if one was minted.
    #[must_use]
    pub const fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Inbound metadata, if attached.
    #[must_use]
    pub const fn inbound(&self) -> Option<&InboundInfo> {
        self.inbound.as_ref()
    }

    /// The cancellation signal.
    #[must_use]
    pub const fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_child_shares_cancellation_not_metadata() {
        let root = Context::new().with_session_id(SessionId::generate());
        let child = root.child();
        assert!(child.session_id().is_none());
        assert!(!child.cancellation().is_cancelled());

        child.cancellation().cancel();
        assert!(root.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let ctx = Context::new();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.cancellation().cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancellation().cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let c = Cancellation::new();
        c.cancel();
        c.cancel();
        tokio::time::timeout(Duration::from_millis(100), c.cancelled())
            .await
            .unwrap();
    }
}
