//! Flattened JWS signing with a certificate's own key
//!
//! Only the revocation endpoint accepts requests signed by a certificate
//! key rather than an account key, so only what it needs is here: ECDSA
//! keys in PKCS#8 form and a `jwk` protected header.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, EcdsaSigningAlgorithm, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING,
    ECDSA_P384_SHA384_FIXED_SIGNING,
};
use rustls::pki_types::PrivateKeyDer;
use serde::{Deserialize, Serialize};

use crate::acme::AcmeError;

/// A key able to sign JWS requests.
pub struct JwsKey {
    key_pair: EcdsaKeyPair,
    alg: &'static str,
    crv: &'static str,
}

/// Public half of a [`JwsKey`] as a JSON Web Key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

#[derive(Serialize)]
struct Protected<'a> {
    alg: &'static str,
    jwk: Jwk,
    nonce: &'a str,
    url: &'a str,
}

/// Request body in flattened JSON serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

const CURVES: &[(&EcdsaSigningAlgorithm, &str, &str)] = &[
    (&ECDSA_P256_SHA256_FIXED_SIGNING, "ES256", "P-256"),
    (&ECDSA_P384_SHA384_FIXED_SIGNING, "ES384", "P-384"),
];

impl JwsKey {
    pub fn from_private_key(key: &PrivateKeyDer<'_>) -> Result<Self, AcmeError> {
        let pkcs8 = match key {
            PrivateKeyDer::Pkcs8(der) => der.secret_pkcs8_der(),
            PrivateKeyDer::Pkcs1(_) => {
                return Err(AcmeError::Signing(
                    "RSA keys are not supported; revoke with the account key".to_string(),
                ))
            }
            _ => {
                return Err(AcmeError::Signing(
                    "only PKCS#8 ECDSA keys are supported".to_string(),
                ))
            }
        };

        let rng = SystemRandom::new();
        for &(alg, name, crv) in CURVES {
            if let Ok(key_pair) = EcdsaKeyPair::from_pkcs8(alg, pkcs8, &rng) {
                return Ok(Self {
                    key_pair,
                    alg: name,
                    crv,
                });
            }
        }
        Err(AcmeError::Signing(
            "key is not a P-256 or P-384 ECDSA key".to_string(),
        ))
    }

    pub fn alg(&self) -> &'static str {
        self.alg
    }

    /// Uncompressed public point, `0x04 || x || y`.
    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }

    pub fn jwk(&self) -> Jwk {
        let (x, y) = self.public_key()[1..].split_at((self.public_key().len() - 1) / 2);
        Jwk {
            kty: "EC".to_string(),
            crv: self.crv.to_string(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
        }
    }

    /// Sign `payload` for a POST to `url`.
    pub fn sign<T: Serialize>(&self, nonce: &str, url: &str, payload: &T) -> Result<Jws, AcmeError> {
        let protected = serde_json::to_vec(&Protected {
            alg: self.alg,
            jwk: self.jwk(),
            nonce,
            url,
        })?;
        let protected = URL_SAFE_NO_PAD.encode(protected);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?);

        let signing_input = format!("{protected}.{payload}");
        let signature = self
            .key_pair
            .sign(&SystemRandom::new(), signing_input.as_bytes())
            .map_err(|_| AcmeError::Signing("failed to sign request".to_string()))?;

        Ok(Jws {
            protected,
            payload,
            signature: URL_SAFE_NO_PAD.encode(signature.as_ref()),
        })
    }
}
