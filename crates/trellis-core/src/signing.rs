//! Tamper-evident message signing.
//!
//! Tokens have the form `<message>--<hex HMAC-SHA256 digest>`. The message
//! itself is not encrypted, only authenticated.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SEPARATOR: &str = "--";

/// The token was not produced by this verifier's key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message was tampered with")]
pub struct TamperedMessage;

/// Signs messages and verifies signed tokens with one secret key.
#[derive(Clone)]
pub struct MessageVerifier {
    key: Vec<u8>,
}

impl std::fmt::Debug for MessageVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageVerifier").finish_non_exhaustive()
    }
}

impl MessageVerifier {
    /// A verifier keyed with `secret`.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length; the fallback arm is never taken.
        HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| <HmacSha256 as Mac>::new(&Default::default()))
    }

    /// Sign `message`.
    pub fn generate(&self, message: &str) -> String {
        let mut mac = self.mac();
        mac.update(message.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        format!("{message}{SEPARATOR}{digest}")
    }

    /// Check `token` and return the message it carries.
    ///
    /// # Errors
    ///
    /// Returns [`TamperedMessage`] if the token is malformed or the digest
    /// does not match.
    pub fn verify(&self, token: &str) -> Result<String, TamperedMessage> {
        let (message, digest) = token.rsplit_once(SEPARATOR).ok_or(TamperedMessage)?;
        let digest = hex::decode(digest).map_err(|_e| TamperedMessage)?;

        let mut mac = self.mac();
        mac.update(message.as_bytes());
        mac.verify_slice(&digest).map_err(|_e| TamperedMessage)?;
        Ok(message.to_owned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_verify() {
        let verifier = MessageVerifier::new("secret");
        let token = verifier.generate("socket-123");
        assert!(token.starts_with("socket-123--"));
        assert_eq!(verifier.verify(&token).unwrap(), "socket-123");
    }

    #[test]
    fn messages_containing_the_separator_survive() {
        let verifier = MessageVerifier::new("secret");
        let token = verifier.generate("a--b");
        assert_eq!(verifier.verify(&token).unwrap(), "a--b");
    }

    #[test]
    fn altered_message_is_tampered() {
        let verifier = MessageVerifier::new("secret");
        let token = verifier.generate("socket-123").replacen("123", "124", 1);
        assert_eq!(verifier.verify(&token), Err(TamperedMessage));
    }

    #[test]
    fn other_key_is_tampered() {
        let token = MessageVerifier::new("one").generate("id");
        assert_eq!(MessageVerifier::new("two").verify(&token), Err(TamperedMessage));
    }

    #[test]
    fn malformed_tokens_are_tampered() {
        let verifier = MessageVerifier::new("secret");
        assert_eq!(verifier.verify("no-separator"), Err(TamperedMessage));
        assert_eq!(verifier.verify("id--zz"), Err(TamperedMessage));
    }
}
