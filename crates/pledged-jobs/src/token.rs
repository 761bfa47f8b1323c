use std::hash::{Hash, Hasher};

use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// A client's promise-scoped cancellation handle.
///
/// Identity lives in the ulid: clones compare equal, and errors produced by
/// this token's cancellation carry the same id so callers can tell their own
/// cancellation apart from a foreign one.
#[derive(Debug, Clone)]
pub struct ClientToken {
    id: Ulid,
    token: CancellationToken,
}

impl ClientToken {
    pub fn new() -> Self {
        Self {
            id: Ulid::new(),
            token: CancellationToken::new(),
        }
    }

    /// A client token wrapping an existing cancellation token, so callers
    /// with their own lifecycle token (the dispatcher) get an identity too.
    pub fn wrapping(token: CancellationToken) -> Self {
        Self {
            id: Ulid::new(),
            token,
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for ClientToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ClientToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientToken {}

impl Hash for ClientToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_identity_and_state() {
        let token = ClientToken::new();
        let clone = token.clone();
        assert_eq!(token, clone);
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn distinct_tokens_differ() {
        assert_ne!(ClientToken::new(), ClientToken::new());
    }
}
