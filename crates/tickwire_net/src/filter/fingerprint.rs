//! Message fingerprints.
//!
//! A fingerprint is an order-sensitive rolling hash (`h = 31 * h + b`, bytes
//! taken as signed, wrapping i32) over the message's wire serialization.
//! Collisions are possible and accepted: the worst case is one suppressed
//! update that the timeout or the run limit will repair.

use std::cell::RefCell;

use thiserror::Error;

/// Serialization failed while fingerprinting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot serialize message for fingerprint: {reason}")]
pub struct FingerprintError {
    /// What went wrong.
    pub reason: String,
}

impl FingerprintError {
    /// Creates an error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// A message the duplicate filter can inspect.
pub trait Fingerprint {
    /// Type name used for classification and cache keys.
    ///
    /// Defaults to the full Rust type path, so substring classification
    /// ("Position", "Chunk", ...) matches on the type's own name.
    fn message_type(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Appends the wire serialization of the message to `out`.
    ///
    /// # Errors
    ///
    /// Any failure; the filter falls back to [`identity_hash`](Self::identity_hash).
    fn write_fingerprint(&self, out: &mut Vec<u8>) -> Result<(), FingerprintError>;

    /// Hash used when serialization fails. Defaults to the message address.
    #[allow(clippy::cast_possible_truncation)]
    fn identity_hash(&self) -> i32 {
        (self as *const Self).cast::<()>() as usize as i32
    }
}

/// Rolling hash over `bytes`.
#[inline]
#[must_use]
pub fn rolling_hash(bytes: &[u8]) -> i32 {
    bytes
        .iter()
        .fold(0i32, |h, &b| h.wrapping_mul(31).wrapping_add(i32::from(b as i8)))
}

thread_local! {
    static SCRATCH: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(256));
}

/// Fingerprints `message`. Never fails.
pub fn fingerprint<M: Fingerprint + ?Sized>(message: &M) -> i32 {
    let hashed = SCRATCH.try_with(|scratch| {
        let Ok(mut buf) = scratch.try_borrow_mut() else {
            let mut fresh = Vec::new();
            return message.write_fingerprint(&mut fresh).map(|()| rolling_hash(&fresh));
        };
        buf.clear();
        message.write_fingerprint(&mut buf).map(|()| rolling_hash(&buf))
    });

    match hashed {
        Ok(Ok(hash)) => hash,
        Ok(Err(e)) => {
            tracing::warn!(message_type = message.message_type(), error = %e, "fingerprint failed, using identity hash");
            message.identity_hash()
        }
        Err(_) => {
            let mut fresh = Vec::new();
            match message.write_fingerprint(&mut fresh) {
                Ok(()) => rolling_hash(&fresh),
                Err(_) => message.identity_hash(),
            }
        }
    }
}
