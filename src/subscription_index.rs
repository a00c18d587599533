//! Bidirectional {symbol<->user} and {user->sessions} maps, guarded by a single
//! exclusive section per mutation so a subscribe/unsubscribe pair can never
//! interleave with a reader and observe a half-updated set of maps.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::models::{SessionId, Symbol, UserId};

#[derive(Debug, PartialEq, Eq)]
pub enum AddSessionOutcome {
    Accepted,
    RejectedMaxReached,
}

#[derive(Default)]
struct SubscriptionState {
    sessions: HashMap<UserId, HashSet<SessionId>>,
    user_symbols: HashMap<UserId, HashSet<Symbol>>,
    symbol_users: HashMap<Symbol, HashSet<UserId>>,
}

pub struct SubscriptionIndex {
    state: Mutex<SubscriptionState>,
    max_sessions_per_user: usize,
}

impl SubscriptionIndex {
    pub fn new(max_sessions_per_user: usize) -> Self {
        Self {
            state: Mutex::new(SubscriptionState::default()),
            max_sessions_per_user,
        }
    }

    /// Enforces the per-user session cap (P3). Does not touch subscriptions.
    pub fn add_session(&self, user: UserId, session: SessionId) -> AddSessionOutcome {
        let mut state = self.state.lock();
        let sessions = state.sessions.entry(user).or_default();
        if sessions.len() >= self.max_sessions_per_user {
            return AddSessionOutcome::RejectedMaxReached;
        }
        sessions.insert(session);
        AddSessionOutcome::Accepted
    }

    /// Removes `session`. If it was the user's last session, purges all of the
    /// user's subscriptions and returns the set of symbols whose last subscriber was
    /// this user (the caller forwards those to `UpstreamConsumer` for unsubscription).
    pub fn remove_session(&self, user: UserId, session: SessionId) -> HashSet<Symbol> {
        let mut state = self.state.lock();
        let Some(sessions) = state.sessions.get_mut(&user) else {
            return HashSet::new();
        };
        sessions.remove(&session);
        if !sessions.is_empty() {
            return HashSet::new();
        }
        state.sessions.remove(&user);

        let Some(symbols) = state.user_symbols.remove(&user) else {
            return HashSet::new();
        };
        let mut now_empty = HashSet::new();
        for symbol in symbols {
            if let Some(users) = state.symbol_users.get_mut(&symbol) {
                users.remove(&user);
                if users.is_empty() {
                    state.symbol_users.remove(&symbol);
                    now_empty.insert(symbol);
                }
            }
        }
        now_empty
    }

    /// Subscribes `user` to `symbols`. Returns the symbols whose `symbol_users` entry
    /// transitioned from absent to present (I1 maintained throughout). Duplicate
    /// subscribe is a no-op per symbol.
    pub fn subscribe(&self, user: UserId, symbols: &[Symbol]) -> HashSet<Symbol> {
        let mut state = self.state.lock();
        let mut newly_tracked = HashSet::new();
        let user_symbols = state.user_symbols.entry(user).or_default();
        for symbol in symbols {
            user_symbols.insert(symbol.clone());
        }
        for symbol in symbols {
            let users = state.symbol_users.entry(symbol.clone()).or_default();
            if users.is_empty() {
                newly_tracked.insert(symbol.clone());
            }
            users.insert(user);
        }
        newly_tracked
    }

    /// Unsubscribes `user` from `symbols`. Returns the symbols whose last subscriber
    /// was this user. Unsubscribe of a non-subscribed symbol is a no-op.
    pub fn unsubscribe(&self, user: UserId, symbols: &[Symbol]) -> HashSet<Symbol> {
        let mut state = self.state.lock();
        let mut now_empty = HashSet::new();
        if let Some(user_symbols) = state.user_symbols.get_mut(&user) {
            for symbol in symbols {
                user_symbols.remove(symbol);
            }
            if user_symbols.is_empty() {
                state.user_symbols.remove(&user);
            }
        }
        for symbol in symbols {
            if let Some(users) = state.symbol_users.get_mut(symbol) {
                users.remove(&user);
                if users.is_empty() {
                    state.symbol_users.remove(symbol);
                    now_empty.insert(symbol.clone());
                }
            }
        }
        now_empty
    }

    /// Snapshot copy; callers must not see the live set.
    pub fn subscribers_of(&self, symbol: &Symbol) -> HashSet<UserId> {
        let state = self.state.lock();
        state
            .symbol_users
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot copy.
    pub fn sessions_of(&self, user: UserId) -> HashSet<SessionId> {
        let state = self.state.lock();
        state.sessions.get(&user).cloned().unwrap_or_default()
    }
}
