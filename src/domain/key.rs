//! Signing key model
//!
//! A [`KeyEntry`] is the public half of one upstream signing key. It is built
//! from the upstream JWK exactly once and never mutated afterwards; the `kid`
//! is either the upstream identifier or the RFC 7638 thumbprint of the key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Errors raised while turning a JWK into a [`KeyEntry`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("symmetric key '{kid}' cannot be published")]
    SymmetricKey { kid: String },

    #[error("unsupported key type '{0}'")]
    UnsupportedKeyType(String),

    #[error("unsupported signing algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("algorithm {algorithm} cannot be used with {key_type} key")]
    IncompatibleAlgorithm { algorithm: SigningAlgorithm, key_type: String },

    #[error("cannot infer signing algorithm for {key_type} key")]
    UnknownAlgorithm { key_type: String },

    #[error("key component '{0}' is not valid base64url")]
    InvalidComponent(&'static str),

    #[error("malformed JWK: {0}")]
    Malformed(String),
}

/// JWS signing algorithms accepted for published keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    RS256,
    RS384,
    RS512,
    PS256,
    PS384,
    PS512,
    ES256,
    ES384,
    ES512,
    EdDSA,
}

impl SigningAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::RS512 => "RS512",
            Self::PS256 => "PS256",
            Self::PS384 => "PS384",
            Self::PS512 => "PS512",
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
            Self::ES512 => "ES512",
            Self::EdDSA => "EdDSA",
        }
    }

    /// Whether this algorithm can verify signatures made with the given key
    pub fn is_compatible_with(&self, material: &PublicKeyMaterial) -> bool {
        match (self, material) {
            (
                Self::RS256 | Self::RS384 | Self::RS512 | Self::PS256 | Self::PS384 | Self::PS512,
                PublicKeyMaterial::Rsa { .. },
            ) => true,
            (Self::ES256, PublicKeyMaterial::Ec { crv, .. }) => crv == "P-256",
            (Self::ES384, PublicKeyMaterial::Ec { crv, .. }) => crv == "P-384",
            (Self::ES512, PublicKeyMaterial::Ec { crv, .. }) => crv == "P-521",
            (Self::EdDSA, PublicKeyMaterial::Okp { crv, .. }) => crv == "Ed25519" || crv == "Ed448",
            _ => false,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RS256" => Ok(Self::RS256),
            "RS384" => Ok(Self::RS384),
            "RS512" => Ok(Self::RS512),
            "PS256" => Ok(Self::PS256),
            "PS384" => Ok(Self::PS384),
            "PS512" => Ok(Self::PS512),
            "ES256" => Ok(Self::ES256),
            "ES384" => Ok(Self::ES384),
            "ES512" => Ok(Self::ES512),
            "EdDSA" => Ok(Self::EdDSA),
            other => Err(KeyError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Public key parameters in their native JWK representation
///
/// All components are base64url without padding, carried exactly as the
/// upstream JWK encodes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum PublicKeyMaterial {
    #[serde(rename = "RSA")]
    Rsa { n: String, e: String },

    #[serde(rename = "EC")]
    Ec { crv: String, x: String, y: String },

    #[serde(rename = "OKP")]
    Okp { crv: String, x: String },
}

impl PublicKeyMaterial {
    pub fn key_type(&self) -> &'static str {
        match self {
            Self::Rsa { .. } => "RSA",
            Self::Ec { .. } => "EC",
            Self::Okp { .. } => "OKP",
        }
    }

    /// Algorithm implied by the key when the JWK carries no `alg`
    pub fn default_algorithm(&self) -> Option<SigningAlgorithm> {
        match self {
            Self::Rsa { .. } => Some(SigningAlgorithm::RS256),
            Self::Ec { crv, .. } => match crv.as_str() {
                "P-256" => Some(SigningAlgorithm::ES256),
                "P-384" => Some(SigningAlgorithm::ES384),
                "P-521" => Some(SigningAlgorithm::ES512),
                _ => None,
            },
            Self::Okp { crv, .. } if crv == "Ed25519" || crv == "Ed448" => {
                Some(SigningAlgorithm::EdDSA)
            }
            Self::Okp { .. } => None,
        }
    }

    fn validate_components(&self) -> Result<(), KeyError> {
        let components: Vec<(&'static str, &str)> = match self {
            Self::Rsa { n, e } => vec![("n", n), ("e", e)],
            Self::Ec { x, y, .. } => vec![("x", x), ("y", y)],
            Self::Okp { x, .. } => vec![("x", x)],
        };

        for (name, value) in components {
            match URL_SAFE_NO_PAD.decode(value) {
                Ok(bytes) if !bytes.is_empty() => {}
                _ => return Err(KeyError::InvalidComponent(name)),
            }
        }
        Ok(())
    }

    /// RFC 7638 JWK thumbprint: SHA-256 over the required members in
    /// lexicographic order, base64url encoded without padding.
    pub fn thumbprint(&self) -> String {
        let mut members: BTreeMap<&str, &str> = BTreeMap::new();
        members.insert("kty", self.key_type());
        match self {
            Self::Rsa { n, e } => {
                members.insert("n", n);
                members.insert("e", e);
            }
            Self::Ec { crv, x, y } => {
                members.insert("crv", crv);
                members.insert("x", x);
                members.insert("y", y);
            }
            Self::Okp { crv, x } => {
                members.insert("crv", crv);
                members.insert("x", x);
            }
        }

        // A map of strings always serializes
        let canonical = serde_json::to_string(&members).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// JWK wire form used both for parsing upstream documents and for publishing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    #[serde(flatten)]
    pub material: PublicKeyMaterial,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
}

impl Jwk {
    /// Parse one upstream JWK, rejecting symmetric and unknown key types with
    /// a precise error instead of a generic serde failure.
    pub fn from_value(value: serde_json::Value) -> Result<Self, KeyError> {
        let kty = value
            .get("kty")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KeyError::Malformed("missing 'kty'".to_string()))?;

        match kty {
            "RSA" | "EC" | "OKP" => {}
            "oct" => {
                let kid = value.get("kid").and_then(|v| v.as_str()).unwrap_or("<none>");
                return Err(KeyError::SymmetricKey { kid: kid.to_string() });
            }
            other => return Err(KeyError::UnsupportedKeyType(other.to_string())),
        }

        serde_json::from_value(value).map_err(|e| KeyError::Malformed(e.to_string()))
    }

    /// Keys explicitly marked for encryption are not signing keys
    pub fn is_signing_key(&self) -> bool {
        self.key_use.as_deref().map_or(true, |u| u == "sig")
    }
}

/// One published signing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub kid: String,
    pub algorithm: SigningAlgorithm,
    pub public_key: PublicKeyMaterial,
    pub first_seen: DateTime<Utc>,
}

impl KeyEntry {
    pub fn new(
        public_key: PublicKeyMaterial,
        algorithm: SigningAlgorithm,
        first_seen: DateTime<Utc>,
    ) -> Self {
        Self { kid: public_key.thumbprint(), algorithm, public_key, first_seen }
    }

    /// Build an entry from an upstream JWK
    pub fn from_jwk(jwk: Jwk, first_seen: DateTime<Utc>) -> Result<Self, KeyError> {
        jwk.material.validate_components()?;

        let algorithm = match jwk.alg.as_deref() {
            Some(alg) => alg.parse::<SigningAlgorithm>()?,
            None => jwk.material.default_algorithm().ok_or_else(|| KeyError::UnknownAlgorithm {
                key_type: jwk.material.key_type().to_string(),
            })?,
        };

        if !algorithm.is_compatible_with(&jwk.material) {
            return Err(KeyError::IncompatibleAlgorithm {
                algorithm,
                key_type: jwk.material.key_type().to_string(),
            });
        }

        let kid = match jwk.kid {
            Some(kid) if !kid.is_empty() => kid,
            _ => jwk.material.thumbprint(),
        };

        Ok(Self { kid, algorithm, public_key: jwk.material, first_seen })
    }

    /// Publishable JWK for this entry
    pub fn to_jwk(&self) -> Jwk {
        Jwk {
            material: self.public_key.clone(),
            kid: Some(self.kid.clone()),
            alg: Some(self.algorithm.to_string()),
            key_use: Some("sig".to_string()),
        }
    }
}
