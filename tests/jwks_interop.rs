//! Published JWKS documents load into a standard JWT verifier

mod common;

use chrono::Utc;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::DecodingKey;
use oidc_bridge::domain::{DiscoveryDocument, JwksDocument};
use oidc_bridge::upstream::parse_jwks;
use serde_json::json;

use common::{ISSUER, RFC7638_N};

// RFC 7517 appendix A.1 example P-256 key
const EC_X: &str = "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4";
const EC_Y: &str = "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM";

fn upstream_jwks() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "keys": [
            { "kty": "RSA", "kid": "rsa-1", "alg": "RS256", "use": "sig", "n": RFC7638_N, "e": "AQAB" },
            { "kty": "EC", "crv": "P-256", "x": EC_X, "y": EC_Y },
        ]
    }))
    .unwrap()
}

#[test]
fn published_jwks_parses_as_a_standard_key_set() {
    let keys = parse_jwks(&upstream_jwks(), Utc::now()).unwrap();
    let published = JwksDocument::new(&keys).to_bytes().unwrap();

    let set: JwkSet = serde_json::from_slice(&published).unwrap();
    assert_eq!(set.keys.len(), 2);

    let rsa = set.find("rsa-1").expect("rsa key by kid");
    assert_eq!(rsa.common.key_algorithm, Some(KeyAlgorithm::RS256));
    assert_eq!(rsa.common.public_key_use, Some(PublicKeyUse::Signature));
    assert!(matches!(rsa.algorithm, AlgorithmParameters::RSA(_)));
    DecodingKey::from_jwk(rsa).unwrap();

    let ec = set.keys.iter().find(|k| k.common.key_id.as_deref() != Some("rsa-1")).unwrap();
    assert_eq!(ec.common.key_algorithm, Some(KeyAlgorithm::ES256));
    assert!(matches!(ec.algorithm, AlgorithmParameters::EllipticCurve(_)));
    // Keys without an upstream kid are identified by their RFC 7638 thumbprint
    assert_eq!(ec.common.key_id.as_ref().unwrap().len(), 43);
}

#[test]
fn discovery_advertises_the_algorithms_in_the_key_set() {
    let keys = parse_jwks(&upstream_jwks(), Utc::now()).unwrap();
    let doc: serde_json::Value =
        serde_json::from_slice(&DiscoveryDocument::new(ISSUER, &keys).to_bytes().unwrap()).unwrap();

    assert_eq!(doc["issuer"], ISSUER);
    assert_eq!(doc["jwks_uri"], format!("{ISSUER}/openid/v1/jwks"));
    let mut algs: Vec<&str> =
        doc["id_token_signing_alg_values_supported"].as_array().unwrap().iter().map(|a| a.as_str().unwrap()).collect();
    algs.sort();
    assert_eq!(algs, vec!["ES256", "RS256"]);
}

#[test]
fn published_jwks_contains_no_private_members() {
    let keys = parse_jwks(&upstream_jwks(), Utc::now()).unwrap();
    let published: serde_json::Value = serde_json::from_slice(&JwksDocument::new(&keys).to_bytes().unwrap()).unwrap();

    for key in published["keys"].as_array().unwrap() {
        let members: Vec<&str> = key.as_object().unwrap().keys().map(String::as_str).collect();
        for private in ["d", "p", "q", "dp", "dq", "qi", "k"] {
            assert!(!members.contains(&private), "{private} in {key}");
        }
    }
}
