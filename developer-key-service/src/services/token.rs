//! Token signing for developer keys.
//!
//! Tokens presented back to this service are signed with the process-wide
//! HMAC secret. Keys whose client credentials audience is `external` get
//! tokens signed with the asymmetric signing key instead, so third parties can
//! verify them against the published JWKS.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs;

use super::error::ServiceError;
use crate::config::JwtConfig;
use crate::models::DeveloperKey;

pub type Claims = Map<String, Value>;

/// Published JSON Web Key Set.
#[derive(Debug, Clone, Serialize)]
pub struct Jwks {
    pub keys: Vec<Value>,
}

struct SigningKey {
    encoding_key: EncodingKey,
    algorithm: Algorithm,
    kid: String,
    public_jwk: Option<Value>,
}

pub struct TokenIssuer {
    symmetric_key: EncodingKey,
    symmetric_decoding_key: DecodingKey,
    signing_key: Option<SigningKey>,
}

impl TokenIssuer {
    /// Build the issuer from configuration, reading the asymmetric signing
    /// key from disk when a path is configured.
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let private_key_pem = match &config.private_key_path {
            Some(path) => Some(fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("Failed to read signing key from {}: {}", path, e)
            })?),
            None => None,
        };

        let issuer = Self::from_pem(&config.signing_secret, private_key_pem.as_deref())?;
        match &issuer.signing_key {
            Some(key) => tracing::info!(
                algorithm = ?key.algorithm,
                kid = %key.kid,
                "Token issuer initialized with asymmetric signing key"
            ),
            None => tracing::warn!(
                "No asymmetric signing key configured, externally audienced tokens cannot be issued"
            ),
        }
        Ok(issuer)
    }

    pub fn from_pem(
        signing_secret: &str,
        private_key_pem: Option<&str>,
    ) -> Result<Self, anyhow::Error> {
        if signing_secret.is_empty() {
            return Err(anyhow::anyhow!("Token signing secret must not be empty"));
        }

        let signing_key = private_key_pem.map(autodetect_signing_key).transpose()?;

        Ok(Self {
            symmetric_key: EncodingKey::from_secret(signing_secret.as_bytes()),
            symmetric_decoding_key: DecodingKey::from_secret(signing_secret.as_bytes()),
            signing_key,
        })
    }

    /// Sign `claims` for `key`.
    pub fn issue(&self, key: &DeveloperKey, claims: &Claims) -> Result<String, ServiceError> {
        if key.uses_external_audience() {
            let signing_key = self.signing_key.as_ref().ok_or_else(|| {
                ServiceError::Internal(anyhow::anyhow!(
                    "No asymmetric signing key configured for externally audienced tokens"
                ))
            })?;
            let mut header = Header::new(signing_key.algorithm);
            header.kid = Some(signing_key.kid.clone());
            return Ok(encode(&header, claims, &signing_key.encoding_key)?);
        }

        Ok(encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.symmetric_key,
        )?)
    }

    /// Verify a symmetrically signed token presented back to this service.
    pub fn decode_internal(&self, token: &str) -> Result<Claims, ServiceError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        let token_data = decode::<Claims>(token, &self.symmetric_decoding_key, &validation)?;
        Ok(token_data.claims)
    }

    pub fn signing_algorithm(&self) -> Option<Algorithm> {
        self.signing_key.as_ref().map(|key| key.algorithm)
    }

    /// Public half of the asymmetric signing key. Only RSA keys are published.
    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: self
                .signing_key
                .as_ref()
                .and_then(|key| key.public_jwk.clone())
                .into_iter()
                .collect(),
        }
    }
}

fn autodetect_signing_key(pem: &str) -> Result<SigningKey, anyhow::Error> {
    if let Ok(encoding_key) = EncodingKey::from_rsa_pem(pem.as_bytes()) {
        let private_key = parse_rsa_private_key(pem)?;
        let public_jwk = rsa_public_jwk(&private_key);
        let kid = jwk_string(&public_jwk, "kid");
        return Ok(SigningKey {
            encoding_key,
            algorithm: Algorithm::RS256,
            kid,
            public_jwk: Some(public_jwk),
        });
    }

    let (encoding_key, algorithm) = if let Ok(key) = EncodingKey::from_ec_pem(pem.as_bytes()) {
        (key, Algorithm::ES256)
    } else if let Ok(key) = EncodingKey::from_ed_pem(pem.as_bytes()) {
        (key, Algorithm::EdDSA)
    } else {
        return Err(anyhow::anyhow!(
            "Unsupported signing key: expected an RSA, EC or Ed25519 private key in PEM format"
        ));
    };

    Ok(SigningKey {
        encoding_key,
        algorithm,
        kid: hex::encode(Sha256::digest(pem.trim().as_bytes())),
        public_jwk: None,
    })
}

fn parse_rsa_private_key(pem: &str) -> Result<RsaPrivateKey, anyhow::Error> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA private key: {}", e))
}

fn b64(value: &BigUint) -> String {
    URL_SAFE_NO_PAD.encode(value.to_bytes_be())
}

fn jwk_string(jwk: &Value, member: &str) -> String {
    jwk.get(member)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// RFC 7638 thumbprint of an RSA public key.
pub fn rsa_thumbprint(n: &str, e: &str) -> String {
    // Members in lexicographic order, no whitespace.
    let canonical = format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, e, n);
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

fn rsa_public_jwk(private_key: &RsaPrivateKey) -> Value {
    let n = b64(private_key.n());
    let e = b64(private_key.e());
    let kid = rsa_thumbprint(&n, &e);
    json!({
        "kty": "RSA",
        "e": e,
        "n": n,
        "kid": kid,
        "alg": "RS256",
        "use": "sig",
    })
}

/// Generate an RSA key pair for a developer key, returning the private and
/// public JWKs.
pub fn generate_rsa_jwk_pair(bits: usize) -> Result<(Value, Value), ServiceError> {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to generate RSA key: {}", e)))?;
    let public_jwk = rsa_public_jwk(&private_key);

    let mut private_jwk = public_jwk.clone();
    if let Some(members) = private_jwk.as_object_mut() {
        members.insert("d".to_string(), json!(b64(private_key.d())));
        if let [p, q] = private_key.primes() {
            members.insert("p".to_string(), json!(b64(p)));
            members.insert("q".to_string(), json!(b64(q)));
        }
        if let Some(dp) = private_key.dp() {
            members.insert("dp".to_string(), json!(b64(dp)));
        }
        if let Some(dq) = private_key.dq() {
            members.insert("dq".to_string(), json!(b64(dq)));
        }
        if let Some(qi) = private_key.crt_coefficient() {
            members.insert("qi".to_string(), json!(b64(&qi)));
        }
    }

    Ok((private_jwk, public_jwk))
}
