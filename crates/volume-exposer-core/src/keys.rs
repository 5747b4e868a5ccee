//! Per-session SSH credentials
//!
//! A fresh ECDSA key pair is generated for every session. The private key is
//! handed to the local mount client (and, on the proxy path, to the sidecar);
//! the public key is installed into the access point as an authorized key.

use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Elliptic curve used for the session key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyCurve {
    #[default]
    P256,
    P384,
}

impl KeyCurve {
    fn algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            KeyCurve::P256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyCurve::P384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }

    /// OpenSSH key type, e.g. `ecdsa-sha2-nistp256`
    pub fn ssh_key_type(self) -> &'static str {
        match self {
            KeyCurve::P256 => "ecdsa-sha2-nistp256",
            KeyCurve::P384 => "ecdsa-sha2-nistp384",
        }
    }

    fn ssh_curve_name(self) -> &'static str {
        match self {
            KeyCurve::P256 => "nistp256",
            KeyCurve::P384 => "nistp384",
        }
    }

    /// Length of an uncompressed SEC1 point (0x04 || X || Y)
    fn point_len(self) -> usize {
        match self {
            KeyCurve::P256 => 65,
            KeyCurve::P384 => 97,
        }
    }
}

/// Key material for one session
pub struct KeyPair {
    private_key_pem: Zeroizing<String>,
    public_key: String,
}

impl KeyPair {
    /// Generate a key pair on the given curve
    pub fn generate(curve: KeyCurve) -> Result<Self> {
        let key = rcgen::KeyPair::generate_for(curve.algorithm())
            .map_err(|e| Error::KeyGeneration(format!("failed to generate private key: {}", e)))?;

        let point = uncompressed_point(key.public_key_raw(), curve)?;
        let public_key = format!(
            "{} {}",
            curve.ssh_key_type(),
            STANDARD.encode(ssh_ecdsa_blob(curve, point))
        );

        Ok(Self {
            private_key_pem: Zeroizing::new(key.serialize_pem()),
            public_key,
        })
    }

    /// Private key as PEM text
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// Public key as a single authorized_keys line, without trailing newline
    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Check that `raw` is an uncompressed SEC1 point on `curve`
fn uncompressed_point(raw: &[u8], curve: KeyCurve) -> Result<&[u8]> {
    if raw.len() != curve.point_len() || raw[0] != 0x04 {
        return Err(Error::KeyGeneration(format!(
            "public key is not an uncompressed {} point ({} bytes)",
            curve.ssh_curve_name(),
            raw.len()
        )));
    }
    Ok(raw)
}

/// Encode an ECDSA public key in the SSH wire format (RFC 5656 section 3.1)
fn ssh_ecdsa_blob(curve: KeyCurve, point: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(64 + point.len());
    for field in [
        curve.ssh_key_type().as_bytes(),
        curve.ssh_curve_name().as_bytes(),
        point,
    ] {
        blob.extend_from_slice(&(field.len() as u32).to_be_bytes());
        blob.extend_from_slice(field);
    }
    blob
}
