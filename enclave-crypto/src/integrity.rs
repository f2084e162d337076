//! Subresource-integrity digests (`sha256-`, `sha384-`, `sha512-` + base64).

use crate::error::{CryptoError, CryptoResult};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

/// Hash algorithm named by an integrity string prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// A parsed integrity value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integrity {
    pub algorithm: HashAlgorithm,
    pub digest: Vec<u8>,
}

impl Integrity {
    /// Computes the integrity of `data`.
    pub fn compute(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            digest: algorithm.digest(data),
        }
    }

    /// Parses an integrity string. When several space-separated values are
    /// present the strongest algorithm wins.
    pub fn parse(s: &str) -> CryptoResult<Self> {
        let mut best: Option<Self> = None;
        for token in s.split_whitespace() {
            let parsed = Self::parse_one(token)?;
            if best.as_ref().is_none_or(|b| parsed.algorithm > b.algorithm) {
                best = Some(parsed);
            }
        }
        best.ok_or_else(|| CryptoError::InvalidIntegrity("empty integrity string".into()))
    }

    fn parse_one(token: &str) -> CryptoResult<Self> {
        let (prefix, encoded) = token
            .split_once('-')
            .ok_or_else(|| CryptoError::InvalidIntegrity(token.to_string()))?;
        let algorithm = match prefix {
            "sha256" => HashAlgorithm::Sha256,
            "sha384" => HashAlgorithm::Sha384,
            "sha512" => HashAlgorithm::Sha512,
            other => {
                return Err(CryptoError::InvalidIntegrity(format!(
                    "unsupported algorithm '{other}'"
                )));
            }
        };
        // Strip SRI options such as "?ct=application/javascript"
        let encoded = encoded.split('?').next().unwrap_or(encoded);
        let digest = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidIntegrity(format!("{token}: {e}")))?;
        Ok(Self { algorithm, digest })
    }

    /// Fails with [`CryptoError::IntegrityMismatch`] unless `data` hashes to this digest.
    pub fn verify(&self, data: &[u8]) -> CryptoResult<()> {
        let actual = Self::compute(self.algorithm, data);
        if actual.digest == self.digest {
            Ok(())
        } else {
            Err(CryptoError::IntegrityMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm.prefix(), STANDARD.encode(&self.digest))
    }
}

impl FromStr for Integrity {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_empty_input() {
        let i = Integrity::compute(HashAlgorithm::Sha256, b"");
        assert_eq!(
            i.to_string(),
            "sha256-47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn parse_display_round_trip() {
        let i = Integrity::compute(HashAlgorithm::Sha384, b"alert(1)");
        let parsed: Integrity = i.to_string().parse().unwrap();
        assert_eq!(parsed, i);
        parsed.verify(b"alert(1)").unwrap();
    }

    #[test]
    fn mismatch_is_reported() {
        let i = Integrity::compute(HashAlgorithm::Sha512, b"original");
        let err = i.verify(b"tampered").unwrap_err();
        assert!(matches!(err, CryptoError::IntegrityMismatch { .. }));
    }

    #[test]
    fn strongest_of_several_wins() {
        let a = Integrity::compute(HashAlgorithm::Sha256, b"x");
        let b = Integrity::compute(HashAlgorithm::Sha512, b"x");
        let parsed = Integrity::parse(&format!("{a} {b}")).unwrap();
        assert_eq!(parsed.algorithm, HashAlgorithm::Sha512);
    }

    #[test]
    fn rejects_unknown_algorithm_and_garbage() {
        assert!(Integrity::parse("md5-abc").is_err());
        assert!(Integrity::parse("sha256").is_err());
        assert!(Integrity::parse("").is_err());
        assert!(Integrity::parse("sha256-!!!").is_err());
    }
}
