//! Call context carrying the active session and a cancellation signal.

use tokio_util::sync::CancellationToken;

/// Session used when the caller never sets one.
pub const DEFAULT_SESSION: &str = "default";

/// Per-call context passed to every memory operation.
///
/// Session-scoped data (personal memories, key-value facts, chat history) is
/// partitioned by [`MemoryContext::session_id`]. The knowledge base is global.
/// Cloning shares the cancellation token.
#[derive(Debug, Clone)]
pub struct MemoryContext {
    session_id: String,
    cancel: CancellationToken,
}

impl Default for MemoryContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContext {
    /// Context bound to the default session.
    pub fn new() -> Self {
        Self {
            session_id: DEFAULT_SESSION.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Context bound to `session_id`. An empty id maps to the default session.
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self::new().with_session(session_id)
    }

    /// Same cancellation token, different session.
    pub fn with_session(&self, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let session_id = if session_id.trim().is_empty() {
            DEFAULT_SESSION.to_string()
        } else {
            session_id
        };
        Self {
            session_id,
            cancel: self.cancel.clone(),
        }
    }

    /// Replace the cancellation token, e.g. with a child of a request token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Generate a new session id: 16 hex characters from 8 random bytes.
pub fn generate_session_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}
