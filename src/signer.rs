//! Server-held wallet signing and challenge verification.

use std::str::FromStr;

use alloy::hex;
use alloy::primitives::Signature;
use alloy::signers::local::{LocalSignerError, PrivateKeySigner};
use alloy::signers::SignerSync;
use log::warn;

use crate::types::normalize_address;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Failed to parse signer: {0}")]
    SignerParsingError(#[from] LocalSignerError),
    #[error("Signing error: {0}")]
    SigningError(#[from] alloy::signers::Error),
}

/// Wraps the server wallet used for the delegated registration path: the
/// caller asks the bridge to sign the current challenge instead of supplying a
/// wallet signature of their own.
pub struct ChallengeSigner {
    signer: PrivateKeySigner,
}

impl ChallengeSigner {
    pub fn from_key(private_key: &str) -> Result<Self, SignerError> {
        let signer = PrivateKeySigner::from_str(private_key)?;
        Ok(ChallengeSigner { signer })
    }

    /// Generate a throwaway key. Registrations signed with it do not survive a
    /// restart, so this is loudly logged rather than silently accepted.
    pub fn ephemeral() -> Self {
        let signer = PrivateKeySigner::random();
        warn!("BRIDGE_KEY not set, using an ephemeral signing key");
        warn!(
            "Generated private key: {}",
            hex::encode_prefixed(signer.to_bytes())
        );
        ChallengeSigner { signer }
    }

    pub fn address(&self) -> String {
        self.signer.address().to_string()
    }

    /// Sign a challenge string, returning the signature as 0x-prefixed hex.
    pub fn sign(&self, text: &str) -> Result<String, SignerError> {
        let signature = self.signer.sign_message_sync(text.as_bytes())?;
        Ok(hex::encode_prefixed(signature.as_bytes()))
    }
}

/// Check that `signature` is a valid wallet signature over `challenge` made by
/// the key behind `address`. Recovery is from the message itself, so the
/// address never has to ship its public key.
pub fn verify_challenge_signature(address: &str, challenge: &str, signature: &str) -> bool {
    let Ok(signature) = Signature::from_str(signature) else {
        return false;
    };
    let Ok(recovered) = signature.recover_address_from_msg(challenge) else {
        return false;
    };
    normalize_address(&recovered.to_string()) == normalize_address(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover_round_trip() {
        let signer = ChallengeSigner::from_key(
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
        )
        .expect("parse key");
        let challenge = "register identity for 0xabc (nonce 1234)";
        let signature = signer.sign(challenge).expect("sign");

        assert!(verify_challenge_signature(
            &signer.address(),
            challenge,
            &signature
        ));
        assert!(!verify_challenge_signature(
            &signer.address(),
            "a different challenge",
            &signature
        ));
    }

    #[test]
    fn garbage_signature_fails_closed() {
        assert!(!verify_challenge_signature("0xabc", "challenge", "not-hex"));
        assert!(!verify_challenge_signature("0xabc", "challenge", "0x1234"));
    }
}
