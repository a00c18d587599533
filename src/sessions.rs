//! Per-session outbound delivery: the bounded `mpsc` channel each connected
//! session owns, indexed by `SessionId` so the Broadcaster and PnLEngine can
//! enqueue frames without knowing anything about the session's socket.
//!
//! One bounded channel per session, rather than a single shared fan-out
//! channel every session would have to filter, gives genuinely per-session
//! delivery and backpressure: a slow session's queue filling up never slows
//! down delivery to any other session.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::models::{ServerMessage, SessionId, UserId};

/// Why a send to a session failed. Either way the caller should drop the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The bounded queue is full; overflow drops the session, not the pipeline.
    QueueFull,
    /// The session's receiver/writer task is already gone.
    Closed,
}

/// What's actually sent down a session's channel: either a wire frame to
/// serialize and write, or an instruction to the writer task to close the
/// socket with a normal-close code and stop.
#[derive(Debug, Clone)]
pub enum SessionFrame {
    Message(ServerMessage),
    Close,
}

struct SessionHandle {
    user_id: UserId,
    tx: mpsc::Sender<SessionFrame>,
}

/// Registry of live sessions' outbound queues. Distinct from `SubscriptionIndex`,
/// which tracks *that* a session exists for session-cap/subscription bookkeeping;
/// this tracks *how to reach it*.
#[derive(Default)]
pub struct SessionRegistry {
    state: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly-accepted session's outbound sender.
    pub fn register(&self, session: SessionId, user: UserId, tx: mpsc::Sender<SessionFrame>) {
        self.state.write().insert(session, SessionHandle { user_id: user, tx });
        metrics::gauge!("sessions_active").set(self.len() as f64);
    }

    /// Removes a session's queue. Called on disconnect or forced close.
    pub fn remove(&self, session: SessionId) {
        self.state.write().remove(&session);
        metrics::gauge!("sessions_active").set(self.len() as f64);
    }

    pub fn user_of(&self, session: SessionId) -> Option<UserId> {
        self.state.read().get(&session).map(|h| h.user_id)
    }

    /// Enqueues `message` for `session`, non-blocking. A full queue or a closed
    /// receiver both count as a failure; the caller (gateway) is responsible for
    /// then removing the session.
    pub fn send(&self, session: SessionId, message: ServerMessage) -> Result<(), SendFailure> {
        let tx = {
            let state = self.state.read();
            match state.get(&session) {
                Some(handle) => handle.tx.clone(),
                None => return Err(SendFailure::Closed),
            }
        };
        tx.try_send(SessionFrame::Message(message)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Best-effort close signal to every live session, used on host shutdown so
    /// each socket gets a normal-close frame instead of just dying with the
    /// process. A session whose queue is already full is left alone - it's about
    /// to be dropped anyway.
    pub fn close_all(&self) {
        let state = self.state.read();
        for handle in state.values() {
            let _ = handle.tx.try_send(SessionFrame::Close);
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
