use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use super::utils;

/// PKCE code verifier and challenge pair.
#[derive(Debug, Clone)]
pub struct PkcePair {
    verifier: String,
    challenge: String,
}

impl PkcePair {
    /// Create a new random verifier/challenge pair following RFC 7636 recommendations.
    pub fn generate() -> Self {
        Self::from_verifier(utils::random_token())
    }

    /// Rebuild the pair from a persisted verifier.
    pub fn from_verifier(verifier: String) -> Self {
        let challenge = generate_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }
}

fn generate_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Fresh per-attempt secrets: PKCE pair plus independent `state` and `nonce`.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub pkce: PkcePair,
    pub state: String,
    pub nonce: String,
}

impl AuthChallenge {
    pub fn generate() -> Self {
        Self {
            pkce: PkcePair::generate(),
            state: utils::random_token(),
            nonce: utils::random_token(),
        }
    }
}
