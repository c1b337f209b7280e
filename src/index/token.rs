//! Reader tokens
//!
//! A token is a cheap handle a reader holds across one lock-free observation
//! of shard state. Tokens carry serial numbers; deferred reclamation of a
//! retired buffer list waits until every token issued before the list was
//! replaced has been dropped. Tokens issued after the replacement never
//! block it.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::fatal_assert;

#[derive(Debug, Default)]
struct TokenState {
    outstanding: BTreeSet<u64>,
    next_serial: u64,
    shut_down: bool,
}

#[derive(Debug, Default)]
struct TokenInner {
    state: Mutex<TokenState>,
    retired: Condvar,
}

impl TokenInner {
    fn retire(&self, serial: u64) {
        let mut state = self.state.lock();
        state.outstanding.remove(&serial);
        drop(state);
        self.retired.notify_all();
    }
}

/// Issues reader tokens and gates reclamation on their retirement
#[derive(Debug, Default)]
pub struct TokenManager {
    inner: Arc<TokenInner>,
}

impl TokenManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token for one read-phase observation
    pub fn request_token(&self) -> Token {
        let mut state = self.inner.state.lock();
        fatal_assert!(!state.shut_down, "token requested after shutdown");
        let serial = state.next_serial;
        state.next_serial += 1;
        state.outstanding.insert(serial);
        Token {
            serial,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Serial number the next token will carry.
    ///
    /// Everything published before this call is protected exactly by the
    /// tokens with smaller serials, so reclamation units are stamped with
    /// this value.
    pub fn serial_of_next_token(&self) -> u64 {
        self.inner.state.lock().next_serial
    }

    /// Block until every token with a serial below `serial` has retired
    pub fn wait_until_tokens_before(&self, serial: u64) {
        let mut state = self.inner.state.lock();
        while state
            .outstanding
            .first()
            .map_or(false, |&oldest| oldest < serial)
        {
            self.inner.retired.wait(&mut state);
        }
    }

    /// Number of tokens currently outstanding
    pub fn outstanding_token_count(&self) -> usize {
        self.inner.state.lock().outstanding.len()
    }

    /// Stop issuing tokens and drain the outstanding ones
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shut_down = true;
        while !state.outstanding.is_empty() {
            self.inner.retired.wait(&mut state);
        }
    }
}

/// One reader's hold on the current published state; retires on drop
pub struct Token {
    serial: u64,
    inner: Arc<TokenInner>,
}

impl Token {
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.inner.retire(self.serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_serials_increase() {
        let manager = TokenManager::new();
        let first = manager.request_token();
        let second = manager.request_token();
        assert!(second.serial() > first.serial());
        assert_eq!(manager.serial_of_next_token(), second.serial() + 1);
        assert_eq!(manager.outstanding_token_count(), 2);
    }

    #[test]
    fn test_wait_ignores_later_tokens() {
        let manager = TokenManager::new();
        let boundary = manager.serial_of_next_token();
        let _later = manager.request_token();

        // No token precedes the boundary, so this must not block.
        manager.wait_until_tokens_before(boundary);
    }

    #[test]
    fn test_wait_blocks_until_prior_token_retires() {
        let manager = Arc::new(TokenManager::new());
        let token = manager.request_token();
        let boundary = manager.serial_of_next_token();

        let waiter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.wait_until_tokens_before(boundary))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(token);
        waiter.join().unwrap();
    }

    #[test]
    fn test_shutdown_drains() {
        let manager = Arc::new(TokenManager::new());
        let token = manager.request_token();

        let shutter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.shutdown())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!shutter.is_finished());

        drop(token);
        shutter.join().unwrap();
        assert_eq!(manager.outstanding_token_count(), 0);
    }

    #[test]
    #[should_panic(expected = "token requested after shutdown")]
    fn test_request_after_shutdown_is_fatal() {
        let manager = TokenManager::new();
        manager.shutdown();
        let _token = manager.request_token();
    }
}
