#![forbid(unsafe_code)]

//! Keyed, order-dependent digest over a trace's event sequence.
//!
//! `fold(None, e)` is `HMAC(key, ser(e))` and `fold(Some(d), e)` is
//! `HMAC(key, d ":" ser(e))`, hex encoded. `ser` sorts object keys
//! recursively, uses compact separators and renders both timestamps with
//! exactly six decimals.

use hmac::{Hmac, Mac};
use pr_telemetry_domain::TraceEvent;
use serde_json::{Map, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const MIN_KEY_BYTES: usize = 16;

const TIMESTAMP_FIELDS: [&str; 2] = ["ts_client_s", "ts_server_s"];

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("hash chain key MUST be at least {MIN_KEY_BYTES} bytes, got {0}")]
    KeyTooShort(usize),
    #[error("failed to serialize event {event_id}: {source}")]
    Serialize {
        event_id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone)]
pub struct HashChain {
    template: HmacSha256,
}

impl std::fmt::Debug for HashChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashChain").finish_non_exhaustive()
    }
}

impl HashChain {
    /// # Errors
    /// Returns `ChainError::KeyTooShort` for keys under `MIN_KEY_BYTES`.
    pub fn new(key: &[u8]) -> Result<Self, ChainError> {
        if key.len() < MIN_KEY_BYTES {
            return Err(ChainError::KeyTooShort(key.len()));
        }
        let template =
            HmacSha256::new_from_slice(key).map_err(|_| ChainError::KeyTooShort(key.len()))?;
        Ok(Self { template })
    }

    /// Combine the prior digest with one event.
    ///
    /// # Errors
    /// Returns an error only if the event cannot be serialized.
    pub fn fold(&self, prior: Option<&str>, event: &TraceEvent) -> Result<String, ChainError> {
        let mac = self.keyed(prior, event)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Start of the chain: `fold` with no prior digest.
    ///
    /// # Errors
    /// Returns an error only if the event cannot be serialized.
    pub fn initial(&self, event: &TraceEvent) -> Result<String, ChainError> {
        self.fold(None, event)
    }

    /// Fold an ordered sequence; `None` when it is empty.
    ///
    /// # Errors
    /// Returns an error only if an event cannot be serialized.
    pub fn digest_of<'a, I>(&self, events: I) -> Result<Option<String>, ChainError>
    where
        I: IntoIterator<Item = &'a TraceEvent>,
    {
        let mut digest: Option<String> = None;
        for event in events {
            digest = Some(self.fold(digest.as_deref(), event)?);
        }
        Ok(digest)
    }

    /// Replay the ordered sequence and compare its final digest in constant time.
    #[must_use]
    pub fn verify(&self, events: &[TraceEvent], expected_final_digest: &str) -> bool {
        let Some((last, prefix)) = events.split_last() else {
            return false;
        };
        let Ok(expected) = hex::decode(expected_final_digest) else {
            return false;
        };
        let Ok(prior) = self.digest_of(prefix) else {
            return false;
        };
        match self.keyed(prior.as_deref(), last) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }

    fn keyed(&self, prior: Option<&str>, event: &TraceEvent) -> Result<HmacSha256, ChainError> {
        let serialized = canonical_event_bytes(event)?;
        let mut mac = self.template.clone();
        if let Some(prior) = prior {
            mac.update(prior.as_bytes());
            mac.update(b":");
        }
        mac.update(&serialized);
        Ok(mac)
    }
}

/// Canonical bytes of one event as fed to the MAC.
///
/// # Errors
/// Returns an error if the event cannot be converted to JSON.
pub fn canonical_event_bytes(event: &TraceEvent) -> Result<Vec<u8>, ChainError> {
    let to_error = |source| ChainError::Serialize {
        event_id: event.id.clone(),
        source,
    };
    let mut value = serde_json::to_value(event).map_err(to_error)?;
    if let Value::Object(fields) = &mut value {
        for name in TIMESTAMP_FIELDS {
            if let Some(field) = fields.get_mut(name) {
                if let Some(seconds) = field.as_f64() {
                    *field = Value::String(format!("{seconds:.6}"));
                }
            }
        }
    }
    serde_json::to_vec(&sorted(value)).map_err(to_error)
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut entries = fields.into_iter().collect::<Vec<_>>();
            entries.sort_by(|left, right| left.0.cmp(&right.0));
            let mut ordered = Map::new();
            for (key, nested) in entries {
                ordered.insert(key, sorted(nested));
            }
            Value::Object(ordered)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}
