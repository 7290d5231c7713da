//! Transport keypair: directional AEAD keys, the send counter, and the
//! receive-side replay window
//!
//! Counters double as nonces, so a counter value must never be used twice
//! under the same key. Senders reserve counters with [`SymmetricKeypair::
//! reserve`] before encrypting (possibly concurrently); receivers
//! authenticate first and only then commit the counter to the replay window,
//! so forged packets cannot poison it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use zeroize::Zeroize;

use crate::crypto::aead;
use crate::error::{ProtocolError, Result};

/// Counters at or above this value stop the session; a rehandshake is
/// required before more data flows. Leaves headroom below the nonce space so
/// in-flight reservations never wrap.
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);

/// Sliding window width for out-of-order delivery
const REPLAY_WINDOW: u64 = 128;

/// Receive-side duplicate suppression over a 128-counter sliding window
pub struct ReplayWindow {
    bitmap: u128,
    highest: u64,
}

impl ReplayWindow {
    fn new() -> Self {
        Self {
            bitmap: 0,
            highest: 0,
        }
    }

    /// Accept `counter` exactly once; duplicates and counters older than the
    /// window are rejected.
    fn check_and_update(&mut self, counter: u64) -> std::result::Result<(), ProtocolError> {
        if counter >= REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::SessionExpired);
        }

        if counter > self.highest {
            let advance = counter - self.highest;
            if advance >= REPLAY_WINDOW {
                self.bitmap = 1;
            } else {
                self.bitmap = (self.bitmap << advance) | 1;
            }
            self.highest = counter;
            return Ok(());
        }

        let offset = self.highest - counter;
        if offset >= REPLAY_WINDOW {
            return Err(ProtocolError::ReplayDetected { counter });
        }
        let bit = 1u128 << offset;
        if self.bitmap & bit != 0 {
            return Err(ProtocolError::ReplayDetected { counter });
        }
        self.bitmap |= bit;
        Ok(())
    }
}

/// The symmetric keys of one established session
pub struct SymmetricKeypair {
    send_key: [u8; aead::KEY_LEN],
    recv_key: [u8; aead::KEY_LEN],
    send_counter: AtomicU64,
    replay: Mutex<ReplayWindow>,
}

impl SymmetricKeypair {
    pub fn new(send_key: [u8; aead::KEY_LEN], recv_key: [u8; aead::KEY_LEN]) -> Self {
        Self {
            send_key,
            recv_key,
            send_counter: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::new()),
        }
    }

    /// Reserve the next send counter.
    ///
    /// Reservation is separate from encryption so callers can claim counters
    /// in packet-arrival order and then encrypt concurrently.
    pub fn reserve(&self) -> Result<u64> {
        let counter = self.send_counter.fetch_add(1, Ordering::Relaxed);
        if counter >= REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::SessionExpired.into());
        }
        Ok(counter)
    }

    /// Counters handed out so far
    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::Relaxed)
    }

    /// Encrypt under a previously reserved counter
    pub fn seal_at(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(aead::seal(&self.send_key, counter, plaintext, &[])?)
    }

    /// Reserve a counter and encrypt in one step
    pub fn seal(&self, plaintext: &[u8]) -> Result<(u64, Vec<u8>)> {
        let counter = self.reserve()?;
        let ciphertext = self.seal_at(counter, plaintext)?;
        Ok((counter, ciphertext))
    }

    /// Authenticate and decrypt a transport payload.
    ///
    /// Does not touch the replay window; call [`SymmetricKeypair::
    /// check_replay`] with the same counter once the packet is accepted.
    pub fn open(&self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(aead::open(&self.recv_key, counter, ciphertext, &[])?)
    }

    /// Commit an authenticated counter to the replay window
    pub fn check_replay(&self, counter: u64) -> std::result::Result<(), ProtocolError> {
        self.replay
            .lock()
            .expect("replay window poisoned")
            .check_and_update(counter)
    }
}

impl Drop for SymmetricKeypair {
    fn drop(&mut self) {
        self.send_key.zeroize();
        self.recv_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn keypair() -> SymmetricKeypair {
        SymmetricKeypair::new([1u8; 32], [2u8; 32])
    }

    fn linked_pair() -> (SymmetricKeypair, SymmetricKeypair) {
        (
            SymmetricKeypair::new([1u8; 32], [2u8; 32]),
            SymmetricKeypair::new([2u8; 32], [1u8; 32]),
        )
    }

    #[test]
    fn test_seal_open_through_linked_keys() {
        let (a, b) = linked_pair();

        for expected in 0..4u64 {
            let (counter, sealed) = a.seal(b"data").unwrap();
            assert_eq!(counter, expected);
            assert_eq!(b.open(counter, &sealed).unwrap(), b"data");
            b.check_replay(counter).unwrap();
        }
    }

    #[test]
    fn test_reserved_counters_are_unique_across_threads() {
        let kp = Arc::new(keypair());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let kp = Arc::clone(&kp);
                thread::spawn(move || {
                    (0..500).map(|_| kp.reserve().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for counter in h.join().unwrap() {
                assert!(seen.insert(counter), "counter {} reserved twice", counter);
            }
        }
        assert_eq!(seen.len(), 4000);
        // Counters form a dense prefix: exactly [0, 4000)
        assert_eq!(kp.send_counter(), 4000);
    }

    #[test]
    fn test_send_limit_enforced() {
        let kp = keypair();
        kp.send_counter
            .store(REJECT_AFTER_MESSAGES - 1, Ordering::Relaxed);

        assert!(kp.reserve().is_ok());
        assert!(kp.reserve().is_err());
        assert!(kp.seal(b"x").is_err());
    }

    #[test]
    fn test_replay_window_duplicate_rejected() {
        let kp = keypair();

        kp.check_replay(5).unwrap();
        assert!(matches!(
            kp.check_replay(5),
            Err(ProtocolError::ReplayDetected { counter: 5 })
        ));
    }

    #[test]
    fn test_replay_window_out_of_order_within_window() {
        let kp = keypair();

        kp.check_replay(10).unwrap();
        kp.check_replay(3).unwrap();
        kp.check_replay(7).unwrap();
        assert!(kp.check_replay(3).is_err());
        assert!(kp.check_replay(7).is_err());
        kp.check_replay(11).unwrap();
    }

    #[test]
    fn test_replay_window_too_old_rejected() {
        let kp = keypair();

        kp.check_replay(500).unwrap();
        // Window now covers [373, 500]
        assert!(kp.check_replay(300).is_err());
        kp.check_replay(400).unwrap();
    }

    #[test]
    fn test_replay_window_large_jump() {
        let kp = keypair();

        kp.check_replay(1).unwrap();
        kp.check_replay(1_000_000).unwrap();
        assert!(kp.check_replay(1).is_err());
        assert!(kp.check_replay(1_000_000).is_err());
        kp.check_replay(999_999).unwrap();
    }

    #[test]
    fn test_receive_limit_enforced() {
        let kp = keypair();
        assert!(matches!(
            kp.check_replay(REJECT_AFTER_MESSAGES),
            Err(ProtocolError::SessionExpired)
        ));
    }
}
