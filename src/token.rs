//! Announce tokens: short-lived opaque values a node hands out in
//! `get_peers` replies and requires back in `announce_peer` calls, as
//! a lightweight proof that the announcing peer recently talked to
//! this node (not a capability or secret — just anti-spoofing noise).
use rand::RngCore;
use tokio::sync::RwLock;
use tokio::time::{self, Duration};
use tracing::debug;

/// How long a token slot lives before rotating out. A token handed out
/// just before a rotation remains valid for up to two periods (it
/// slides from "current" to "previous" before being dropped), so the
/// effective lifetime window is one to two rotations.
pub const ROTATION_PERIOD: Duration = Duration::from_secs(5 * 60);

const TOKEN_LEN: usize = 160;

fn generate_token() -> Vec<u8> {
    let mut buf = vec![0u8; TOKEN_LEN];
    rand::rng().fill_bytes(&mut buf);
    buf
}

struct Slots {
    current: Vec<u8>,
    previous: Vec<u8>,
}

/// Two-slot rotating token manager, safe to share across the tasks of
/// a running node behind an `Arc`.
pub struct TokenManager {
    slots: RwLock<Slots>,
}

impl TokenManager {
    pub fn new() -> Self {
        TokenManager {
            slots: RwLock::new(Slots {
                current: generate_token(),
                previous: generate_token(),
            }),
        }
    }

    /// The token to hand out in a `get_peers` reply right now.
    pub async fn current_token(&self) -> Vec<u8> {
        self.slots.read().await.current.clone()
    }

    /// Checks a token presented in an `announce_peer` call against
    /// either live slot.
    pub async fn validate(&self, token: &[u8]) -> bool {
        let slots = self.slots.read().await;
        token == slots.current.as_slice() || token == slots.previous.as_slice()
    }

    async fn rotate(&self) {
        let mut slots = self.slots.write().await;
        slots.previous = std::mem::replace(&mut slots.current, generate_token());
        debug!("rotated announce tokens");
    }

    /// Runs the rotation ticker until cancelled. Intended to be spawned
    /// as a background task alongside the KRPC engine.
    pub async fn run_rotation(self: std::sync::Arc<Self>) {
        let mut interval = time::interval(ROTATION_PERIOD);
        interval.tick().await; // first tick fires immediately, skip it
        loop {
            interval.tick().await;
            self.rotate().await;
        }
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_token_validates() {
        let manager = TokenManager::new();
        let token = manager.current_token().await;
        assert!(manager.validate(&token).await);
    }

    #[tokio::test]
    async fn unknown_token_does_not_validate() {
        let manager = TokenManager::new();
        assert!(!manager.validate(b"not a real token").await);
    }

    #[tokio::test]
    async fn previous_token_still_validates_after_one_rotation() {
        let manager = TokenManager::new();
        let first = manager.current_token().await;
        manager.rotate().await;
        assert!(manager.validate(&first).await);
        assert_ne!(manager.current_token().await, first);
    }

    #[tokio::test]
    async fn token_expires_after_two_rotations() {
        let manager = TokenManager::new();
        let first = manager.current_token().await;
        manager.rotate().await;
        manager.rotate().await;
        assert!(!manager.validate(&first).await);
    }
}
