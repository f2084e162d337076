//! HMAC-SHA256 message signatures keyed by the bus auth token.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs `message`, returning the lowercase hex MAC.
pub fn sign(token: &str, message: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = <HmacSha256 as Mac>::new_from_slice(token.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a hex signature in constant time. Malformed hex never verifies.
pub fn verify(token: &str, message: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(token.as_bytes()) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let sig = sign("token", b"{\"a\":1}");
        assert_eq!(sig.len(), 64);
        assert!(verify("token", b"{\"a\":1}", &sig));
    }

    #[test]
    fn wrong_token_or_message_fails() {
        let sig = sign("token", b"payload");
        assert!(!verify("other", b"payload", &sig));
        assert!(!verify("token", b"payload!", &sig));
        assert!(!verify("token", b"payload", "not-hex"));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2
        let sig = sign("Jefe", b"what do ya want for nothing?");
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
