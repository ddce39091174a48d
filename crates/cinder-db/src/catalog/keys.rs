use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::error::DbError;

const MAX_KEY_LEN: usize = 254;

/// Checks a user-supplied `_key`.
pub fn validate_key(key: &str) -> Result<(), DbError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(DbError::DocumentKeyBad(key.to_string()));
    }
    let ok = key.bytes().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'_' | b'-'
                    | b':'
                    | b'.'
                    | b'@'
                    | b'('
                    | b')'
                    | b'+'
                    | b','
                    | b'='
                    | b';'
                    | b'$'
                    | b'!'
                    | b'*'
                    | b'\''
                    | b'%'
            )
    });
    if ok {
        Ok(())
    } else {
        Err(DbError::DocumentKeyBad(key.to_string()))
    }
}

/// Hands out document keys and revisions.
///
/// Values are strictly increasing across all collections of a database:
/// each one is at least the current time in microseconds and at least one
/// more than the previous value, plus a small random step.
#[derive(Debug, Default)]
pub struct KeyGenerator {
    last: AtomicU64,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_key(&self) -> String {
        self.next().to_string()
    }

    pub fn next_revision(&self) -> String {
        format!("_{:x}", self.next())
    }

    fn next(&self) -> u64 {
        let step = rand::thread_rng().gen_range(1..=16);
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now_micros().max(current + step);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
