//! # Cryptographic Infrastructure
//!
//! Two independent layers protect every mesh link:
//!
//! - **Transport**: TLS via rustls. Certificates are either loaded from PEM
//!   files or generated self-signed at configure time. Certificate trust is
//!   optional (`rejectUnauthorized`); peer authentication is the job of the
//!   challenge-response handshake, not of the certificate chain.
//! - **Handshake**: challenge nonces are sealed with an AEAD cipher keyed by
//!   the shared mesh secret, proving possession of the secret without ever
//!   transmitting it.
//!
//! ## Challenge Ciphertext Format
//!
//! `hex(nonce):hex(ciphertext || tag)`
//!
//! The nonce is fresh per encryption, so sealing the same challenge twice
//! never yields the same string. The secret is normalized to a 32-byte key
//! with BLAKE3 key derivation, so secrets of any length are accepted.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{MeshError, MeshResult};

// ============================================================================
// Challenge Cipher
// ============================================================================

/// BLAKE3 key-derivation context for the handshake key.
/// Changing it breaks interoperability with every deployed node.
const HANDSHAKE_KEY_CONTEXT: &str = "eventmesh 2024-06 handshake challenge key v1";

/// Symmetric algorithm used to seal handshake challenges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    #[default]
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl CipherAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
            Self::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    fn nonce_len(self) -> usize {
        match self {
            Self::ChaCha20Poly1305 => 12,
            Self::XChaCha20Poly1305 => 24,
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Self::ChaCha20Poly1305),
            "xchacha20-poly1305" | "xchacha20poly1305" => Ok(Self::XChaCha20Poly1305),
            other => Err(MeshError::Config(format!("unsupported cipher algorithm: {other}"))),
        }
    }
}

fn derive_key(secret: &str) -> [u8; 32] {
    blake3::derive_key(HANDSHAKE_KEY_CONTEXT, secret.as_bytes())
}

/// Seal `plaintext` under `secret`, returning `hex(nonce):hex(ciphertext)`.
pub fn encrypt(algorithm: CipherAlgorithm, plaintext: &str, secret: &str) -> MeshResult<String> {
    let key = derive_key(secret);
    let mut nonce = vec![0u8; algorithm.nonce_len()];
    OsRng.fill_bytes(&mut nonce);

    let sealed = match algorithm {
        CipherAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(Key::from_slice(&key))
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes()),
        CipherAlgorithm::XChaCha20Poly1305 => XChaCha20Poly1305::new(Key::from_slice(&key))
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes()),
    }
    .map_err(|_| MeshError::Cipher("encryption failed".into()))?;

    Ok(format!("{}:{}", hex::encode(nonce), hex::encode(sealed)))
}

/// Open a string produced by [`encrypt`].
///
/// # Errors
/// [`MeshError::Cipher`] when the input is malformed or was sealed under a
/// different secret or algorithm.
pub fn decrypt(algorithm: CipherAlgorithm, text: &str, secret: &str) -> MeshResult<String> {
    let (nonce_hex, sealed_hex) = text
        .split_once(':')
        .ok_or_else(|| MeshError::Cipher("missing nonce separator".into()))?;
    let nonce = hex::decode(nonce_hex).map_err(|e| MeshError::Cipher(format!("bad nonce: {e}")))?;
    let sealed =
        hex::decode(sealed_hex).map_err(|e| MeshError::Cipher(format!("bad ciphertext: {e}")))?;
    if nonce.len() != algorithm.nonce_len() {
        return Err(MeshError::Cipher(format!(
            "nonce length {} does not match {algorithm}",
            nonce.len()
        )));
    }

    let key = derive_key(secret);
    let opened = match algorithm {
        CipherAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(Key::from_slice(&key))
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice()),
        CipherAlgorithm::XChaCha20Poly1305 => XChaCha20Poly1305::new(Key::from_slice(&key))
            .decrypt(XNonce::from_slice(&nonce), sealed.as_slice()),
    }
    .map_err(|_| MeshError::Cipher("decryption failed".into()))?;

    String::from_utf8(opened).map_err(|_| MeshError::Cipher("plaintext is not UTF-8".into()))
}

/// Fresh challenge nonce: `size` random bytes, hex-encoded.
pub fn generate_challenge(size: usize) -> String {
    let mut bytes = vec![0u8; size];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time comparison of a returned answer against the issued nonce.
pub fn challenge_matches(expected: &str, answer: &str) -> bool {
    expected.len() == answer.len() && bool::from(expected.as_bytes().ct_eq(answer.as_bytes()))
}

// ============================================================================
// TLS
// ============================================================================

/// Lazily-initialized crypto provider for rustls.
/// Uses ring as the underlying cryptographic implementation.
static CRYPTO_PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier, so a mesh port is never mistaken for another
/// TLS service.
pub const ALPN: &[u8] = b"eventmesh/1";

/// Certificate chain and private key for the local node.
pub struct TlsMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    self_signed: bool,
}

impl TlsMaterial {
    /// Parse a PEM certificate chain and PEM private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to parse certificate PEM")?;
        if certs.is_empty() {
            anyhow::bail!("no certificates found in PEM input");
        }

        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .context("failed to parse private key PEM")?
            .ok_or_else(|| anyhow::anyhow!("no private key found in PEM input"))?;

        Ok(Self {
            certs,
            key,
            self_signed: false,
        })
    }

    /// Load PEM files from disk.
    pub fn load(key_path: &Path, cert_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path)
            .with_context(|| format!("failed to read certificate {}", cert_path.display()))?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("failed to read private key {}", key_path.display()))?;
        Self::from_pem(&cert_pem, &key_pem)
            .with_context(|| format!("invalid TLS material in {}", cert_path.display()))
    }

    /// Generate a throwaway self-signed certificate valid for `hosts`.
    pub fn self_signed(hosts: &[String]) -> Result<Self> {
        let (cert_pem, key_pem) = self_signed_pem(hosts)?;
        let mut material = Self::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())?;
        material.self_signed = true;
        Ok(material)
    }

    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    pub fn is_self_signed(&self) -> bool {
        self.self_signed
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let mut config = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
            .with_safe_default_protocol_versions()
            .context("failed to select TLS protocol versions")?
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .context("failed to create server TLS config")?;
        config.alpn_protocols = vec![ALPN.to_vec()];
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Client side of a dial.
    ///
    /// With `reject_unauthorized` the server certificate must chain to the
    /// locally configured certificate (meshes that share one certificate or
    /// one private CA). Otherwise any certificate is accepted, but handshake
    /// signatures are still verified.
    pub fn connector(&self, reject_unauthorized: bool) -> Result<TlsConnector> {
        let builder = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
            .with_safe_default_protocol_versions()
            .context("failed to select TLS protocol versions")?;

        let mut config = if reject_unauthorized {
            let mut roots = RootCertStore::empty();
            for cert in &self.certs {
                roots
                    .add(cert.clone())
                    .context("configured certificate is not a usable trust anchor")?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AnyServerCertVerifier))
                .with_no_client_auth()
        };
        config.alpn_protocols = vec![ALPN.to_vec()];
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certs", &self.certs.len())
            .field("self_signed", &self.self_signed)
            .finish_non_exhaustive()
    }
}

/// Generate a self-signed certificate and key as `(cert_pem, key_pem)`.
pub fn self_signed_pem(hosts: &[String]) -> Result<(String, String)> {
    let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    for host in hosts {
        if !host.is_empty() && !names.contains(host) {
            names.push(host.clone());
        }
    }

    let certified = rcgen::generate_simple_self_signed(names)
        .context("failed to generate self-signed certificate")?;
    Ok((certified.cert.pem(), certified.key_pair.serialize_pem()))
}

/// TLS server name for a dial target. IP literals are accepted.
pub fn server_name(host: &str) -> MeshResult<ServerName<'static>> {
    ServerName::try_from(host.to_owned())
        .map_err(|e| MeshError::Tls(format!("invalid server name {host}: {e}")))
}

/// Accepts any server certificate while still checking handshake signatures.
/// Peers prove themselves through the shared-secret handshake instead.
#[derive(Debug)]
struct AnyServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for AnyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const SECRET: &str = "bc6383f0-b6e7-11e9-9f74-0348351cafd3";

    #[test]
    fn challenge_survives_encrypt_decrypt() {
        for algorithm in [CipherAlgorithm::ChaCha20Poly1305, CipherAlgorithm::XChaCha20Poly1305] {
            let challenge = generate_challenge(32);
            let sealed = encrypt(algorithm, &challenge, SECRET).expect("encrypt");
            let opened = decrypt(algorithm, &sealed, SECRET).expect("decrypt");
            assert_eq!(opened, challenge);
        }
    }

    #[test]
    fn encryption_is_not_deterministic() {
        let mut outputs = HashSet::new();
        for _ in 0..20 {
            let sealed = encrypt(CipherAlgorithm::default(), "same plaintext", SECRET).unwrap();
            assert!(outputs.insert(sealed), "two encryptions produced identical output");
        }
    }

    #[test]
    fn wrong_secret_fails() {
        let sealed = encrypt(CipherAlgorithm::default(), "nonce", SECRET).unwrap();
        assert!(matches!(
            decrypt(CipherAlgorithm::default(), &sealed, "foooooo"),
            Err(MeshError::Cipher(_))
        ));
    }

    #[test]
    fn algorithm_mismatch_fails() {
        let sealed = encrypt(CipherAlgorithm::XChaCha20Poly1305, "nonce", SECRET).unwrap();
        assert!(decrypt(CipherAlgorithm::ChaCha20Poly1305, &sealed, SECRET).is_err());
    }

    #[test]
    fn malformed_ciphertext_rejected() {
        let algorithm = CipherAlgorithm::default();
        assert!(decrypt(algorithm, "no-separator", SECRET).is_err());
        assert!(decrypt(algorithm, "zz:00", SECRET).is_err());
        assert!(decrypt(algorithm, "00:00", SECRET).is_err());
        assert!(decrypt(algorithm, "", SECRET).is_err());
    }

    #[test]
    fn wire_format_is_hex_pair() {
        let sealed = encrypt(CipherAlgorithm::ChaCha20Poly1305, "abc", SECRET).unwrap();
        let (nonce, body) = sealed.split_once(':').unwrap();
        assert_eq!(nonce.len(), 24);
        assert!(hex::decode(nonce).is_ok());
        // 3 bytes plaintext + 16 byte tag
        assert_eq!(hex::decode(body).unwrap().len(), 19);
    }

    #[test]
    fn challenge_has_requested_size() {
        let challenge = generate_challenge(16);
        assert_eq!(challenge.len(), 32);
        assert_ne!(challenge, generate_challenge(16));
    }

    #[test]
    fn challenge_comparison() {
        assert!(challenge_matches("abcd", "abcd"));
        assert!(!challenge_matches("abcd", "abce"));
        assert!(!challenge_matches("abcd", "abc"));
        assert!(!challenge_matches("abcd", ""));
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!("chacha20-poly1305".parse::<CipherAlgorithm>().unwrap(), CipherAlgorithm::ChaCha20Poly1305);
        assert_eq!("XChaCha20-Poly1305".parse::<CipherAlgorithm>().unwrap(), CipherAlgorithm::XChaCha20Poly1305);
        assert!("aes-256-cbc".parse::<CipherAlgorithm>().is_err());
    }

    #[test]
    fn self_signed_material_builds_configs() {
        let material = TlsMaterial::self_signed(&["mesh.local".to_string()]).expect("generate");
        assert!(material.is_self_signed());
        assert_eq!(material.certs().len(), 1);
        material.acceptor().expect("acceptor");
        material.connector(false).expect("permissive connector");
        material.connector(true).expect("strict connector");
    }

    #[test]
    fn pem_files_load() {
        let (cert_pem, key_pem) = self_signed_pem(&[]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert_pem).unwrap();
        std::fs::write(&key_path, key_pem).unwrap();

        let material = TlsMaterial::load(&key_path, &cert_path).expect("load");
        assert!(!material.is_self_signed());
        material.acceptor().expect("acceptor");
    }

    #[test]
    fn missing_pem_file_reports_path() {
        let err = TlsMaterial::load(Path::new("/nonexistent/key.pem"), Path::new("/nonexistent/cert.pem"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/cert.pem"));
    }

    #[test]
    fn server_names() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("bad name with spaces").is_err());
    }
}
