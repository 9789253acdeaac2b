//! Subscription Registry
//!
//! Tracks which downstream sessions are interested in which symbols and
//! keeps the upstream subscription set in step with that interest.
//!
//! # Design
//!
//! The registry tracks:
//! - Which sessions are interested in each symbol (with an explicit
//!   reference count equal to the size of that set)
//! - Which symbols each session holds, so a terminating session can be
//!   removed in one step
//!
//! Many sessions may share one symbol while the relay keeps a single
//! upstream subscription for it. The upstream is told to subscribe when a
//! symbol's count goes 0 → 1 and to unsubscribe when it goes 1 → 0.
//!
//! All state lives behind one `RwLock`. Upstream commands are issued while
//! the write lock is held, so the command stream observed by the upstream
//! is exactly the sequence of count transitions, even with concurrent
//! callers. [`UpstreamControl`] implementations therefore must not block.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::streaming::Symbol;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a downstream session.
pub type SessionId = u64;

/// Outbound port used by the registry to drive the upstream subscription set.
///
/// Called with the registry's write lock held: implementations must return
/// promptly and must not call back into the registry.
#[cfg_attr(test, mockall::automock)]
pub trait UpstreamControl: Send + Sync {
    /// Request an upstream subscription for `symbol`.
    fn subscribe(&self, symbol: &Symbol);

    /// Request removal of the upstream subscription for `symbol`.
    fn unsubscribe(&self, symbol: &Symbol);
}

/// Point-in-time registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Symbols with at least one interested session (= upstream subscriptions).
    pub symbol_count: usize,
    /// Sessions holding at least one symbol.
    pub session_count: usize,
    /// Sum of all reference counts.
    pub total_interest: usize,
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct SymbolInterest {
    refcount: usize,
    sessions: HashSet<SessionId>,
}

#[derive(Debug, Default)]
struct RegistryState {
    symbols: HashMap<Symbol, SymbolInterest>,
    sessions: HashMap<SessionId, HashSet<Symbol>>,
}

impl RegistryState {
    /// Returns `true` when the symbol's count went 0 → 1.
    fn add(&mut self, session: SessionId, symbol: &Symbol) -> bool {
        let entry = self.symbols.entry(symbol.clone()).or_default();
        if !entry.sessions.insert(session) {
            return false;
        }
        entry.refcount += 1;
        debug_assert_eq!(entry.refcount, entry.sessions.len());

        self.sessions
            .entry(session)
            .or_default()
            .insert(symbol.clone());

        entry.refcount == 1
    }

    /// Returns `true` when the symbol's count went 1 → 0.
    fn remove(&mut self, session: SessionId, symbol: &Symbol) -> bool {
        let Some(entry) = self.symbols.get_mut(symbol) else {
            return false;
        };
        if !entry.sessions.remove(&session) {
            return false;
        }
        entry.refcount = entry.refcount.saturating_sub(1);
        debug_assert_eq!(entry.refcount, entry.sessions.len());

        if let Some(held) = self.sessions.get_mut(&session) {
            held.remove(symbol);
            if held.is_empty() {
                self.sessions.remove(&session);
            }
        }

        if entry.refcount == 0 {
            self.symbols.remove(symbol);
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Reference-counted symbol interest shared by all sessions.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use market_relay::domain::streaming::Symbol;
/// use market_relay::domain::subscription::{SubscriptionRegistry, UpstreamControl};
///
/// struct Noop;
/// impl UpstreamControl for Noop {
///     fn subscribe(&self, _: &Symbol) {}
///     fn unsubscribe(&self, _: &Symbol) {}
/// }
///
/// let registry = SubscriptionRegistry::new(Arc::new(Noop));
/// let aapl = Symbol::new("AAPL").unwrap();
///
/// assert!(registry.add_interest(1, &aapl)); // first interest subscribes upstream
/// assert!(!registry.add_interest(2, &aapl)); // second shares the subscription
/// assert_eq!(registry.refcount(&aapl), 2);
///
/// assert!(!registry.remove_interest(1, &aapl));
/// assert!(registry.remove_interest(2, &aapl)); // last interest unsubscribes
/// ```
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
    upstream: Arc<dyn UpstreamControl>,
}

impl SubscriptionRegistry {
    /// Create an empty registry driving the given upstream.
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamControl>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            upstream,
        }
    }

    /// Register `session`'s interest in `symbol`.
    ///
    /// Returns `true` if this call issued the upstream subscribe. Adding an
    /// interest the session already holds is a no-op.
    pub fn add_interest(&self, session: SessionId, symbol: &Symbol) -> bool {
        let mut state = self.state.write();
        let first = state.add(session, symbol);
        if first {
            tracing::debug!(symbol = %symbol, session_id = session, "First interest, subscribing upstream");
            self.upstream.subscribe(symbol);
        }
        first
    }

    /// Drop `session`'s interest in `symbol`.
    ///
    /// Returns `true` if this call issued the upstream unsubscribe. Removing
    /// an interest the session does not hold is a no-op.
    pub fn remove_interest(&self, session: SessionId, symbol: &Symbol) -> bool {
        let mut state = self.state.write();
        let last = state.remove(session, symbol);
        if last {
            tracing::debug!(symbol = %symbol, session_id = session, "Last interest gone, unsubscribing upstream");
            self.upstream.unsubscribe(symbol);
        }
        last
    }

    /// Remove every interest held by `session` in a single critical section.
    ///
    /// Returns the symbols that were unsubscribed upstream as a result.
    pub fn remove_session(&self, session: SessionId) -> Vec<Symbol> {
        let mut state = self.state.write();
        let Some(held) = state.sessions.get(&session).cloned() else {
            return Vec::new();
        };

        let mut released = Vec::new();
        for symbol in held {
            if state.remove(session, &symbol) {
                self.upstream.unsubscribe(&symbol);
                released.push(symbol);
            }
        }

        tracing::debug!(
            session_id = session,
            released = released.len(),
            "Session interest removed"
        );
        released
    }

    /// Sessions currently interested in `symbol`.
    #[must_use]
    pub fn interested_sessions(&self, symbol: &Symbol) -> Vec<SessionId> {
        self.state
            .read()
            .symbols
            .get(symbol)
            .map(|entry| entry.sessions.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Reference count for `symbol` (0 when nobody is interested).
    #[must_use]
    pub fn refcount(&self, symbol: &Symbol) -> usize {
        self.state
            .read()
            .symbols
            .get(symbol)
            .map_or(0, |entry| entry.refcount)
    }

    /// Whether `symbol` should currently be subscribed upstream.
    #[must_use]
    pub fn is_active(&self, symbol: &Symbol) -> bool {
        self.state.read().symbols.contains_key(symbol)
    }

    /// All symbols with non-zero interest, sorted.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.state.read().symbols.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Symbols held by `session`, sorted.
    #[must_use]
    pub fn session_symbols(&self, session: SessionId) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .state
            .read()
            .sessions
            .get(&session)
            .map(|held| held.iter().cloned().collect())
            .unwrap_or_default();
        symbols.sort();
        symbols
    }

    /// Current registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            symbol_count: state.symbols.len(),
            session_count: state.sessions.len(),
            total_interest: state.symbols.values().map(|entry| entry.refcount).sum(),
        }
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
