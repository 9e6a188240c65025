//! Short-lived HMAC build tokens.
//!
//! A token binds a build request to a recent page load: the UI fetches one
//! when the form renders and submits it with the request. This is a bot
//! deterrent, not user authentication; the secret lives for the process
//! lifetime and all outstanding tokens become invalid on restart.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// How long after issuance a token remains valid.
const TOKEN_TTL_MS: i64 = 10 * 60 * 1000;

/// Tolerated clock skew for tokens stamped in the future.
const FUTURE_SKEW_MS: i64 = 60 * 1000;

/// Issues and verifies `{timestamp_ms}.{hex hmac}` tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
}

impl TokenIssuer {
    /// Create an issuer with an externally supplied secret, or a fresh
    /// random one when none is configured.
    pub fn new(secret: Option<Vec<u8>>) -> Self {
        let secret = secret.unwrap_or_else(|| {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes.to_vec()
        });
        Self { secret }
    }

    pub fn generate(&self) -> String {
        let now = chrono::Utc::now().timestamp_millis();
        format!("{}.{}", now, self.sign(now))
    }

    pub fn verify(&self, token: &str) -> bool {
        self.verify_at(token, chrono::Utc::now().timestamp_millis())
    }

    fn verify_at(&self, token: &str, now_ms: i64) -> bool {
        let Some((timestamp, digest)) = token.rsplit_once('.') else {
            return false;
        };
        let Ok(issued_ms) = timestamp.parse::<i64>() else {
            return false;
        };
        if now_ms - issued_ms > TOKEN_TTL_MS {
            return false;
        }
        if issued_ms - now_ms > FUTURE_SKEW_MS {
            return false;
        }
        let expected = self.sign(issued_ms);
        // Length alone leaks no secret material, so a plain check first is
        // fine; the digest bytes themselves get a constant-time compare.
        if expected.len() != digest.len() {
            return false;
        }
        expected.as_bytes().ct_eq(digest.as_bytes()).into()
    }

    fn sign(&self, timestamp_ms: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(timestamp_ms.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}
