//! Certificate authority material for TLS interception
//! Generates root CAs, loads operator-supplied roots and issues per-host leaf certificates

use crate::error::{Error, Result};
use dashmap::DashMap;
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256,
};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::public_key::PublicKey;

/// Offset for not_before to tolerate clock skew between proxy and client
const NOT_BEFORE_OFFSET_SECS: i64 = 60;
/// Leaf certificate lifetime
const LEAF_TTL_DAYS: i64 = 30;
/// Upper bound of cached leaf certificates before the cache is flushed
const LEAF_CACHE_CAPACITY: usize = 1024;

/// Key algorithm of a root CA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    #[default]
    EcdsaP256,
    Rsa2048,
    Rsa4096,
}

impl KeyAlgorithm {
    fn generate_key_pair(self) -> Result<KeyPair> {
        match self {
            KeyAlgorithm::EcdsaP256 => KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
                .map_err(|e| Error::ca(format!("failed to generate ECDSA P-256 key: {}", e))),
            KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa4096 => {
                let bits = if self == KeyAlgorithm::Rsa2048 { 2048 } else { 4096 };
                let private_key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), bits)
                    .map_err(|e| Error::ca(format!("failed to generate RSA-{} key: {}", bits, e)))?;
                let pem = private_key
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(|e| Error::ca(format!("failed to encode RSA key: {}", e)))?;
                KeyPair::from_pem_and_sign_algo(pem.as_str(), &PKCS_RSA_SHA256)
                    .map_err(|e| Error::ca(format!("failed to load RSA key: {}", e)))
            }
        }
    }
}

impl TryFrom<u32> for KeyAlgorithm {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(KeyAlgorithm::EcdsaP256),
            1 => Ok(KeyAlgorithm::Rsa2048),
            2 => Ok(KeyAlgorithm::Rsa4096),
            other => Err(Error::invalid_argument(format!(
                "unknown CA key algorithm selector: {}",
                other
            ))),
        }
    }
}

impl FromStr for KeyAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ecdsa" | "ecdsa-p256" | "p256" => Ok(KeyAlgorithm::EcdsaP256),
            "rsa2048" | "rsa-2048" => Ok(KeyAlgorithm::Rsa2048),
            "rsa4096" | "rsa-4096" => Ok(KeyAlgorithm::Rsa4096),
            other => Err(Error::invalid_argument(format!(
                "unknown CA key algorithm: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyAlgorithm::EcdsaP256 => "ecdsa-p256",
            KeyAlgorithm::Rsa2048 => "rsa-2048",
            KeyAlgorithm::Rsa4096 => "rsa-4096",
        };
        f.write_str(name)
    }
}

/// PEM pair produced by [`generate`]
#[derive(Clone)]
pub struct GeneratedCa {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Leaf certificate issued for one hostname
#[derive(Debug)]
pub struct LeafCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivatePkcs8KeyDer<'static>,
}

fn random_serial() -> SerialNumber {
    // Top bit cleared so the DER integer stays positive without padding.
    SerialNumber::from(rand::thread_rng().gen::<u64>() >> 1)
}

/// Generate a self-signed root CA
pub fn generate(common_name: &str, validity_days: u32, algorithm: KeyAlgorithm) -> Result<GeneratedCa> {
    let common_name = common_name.trim();
    if common_name.is_empty() {
        return Err(Error::invalid_argument("CA common name must not be empty"));
    }
    if validity_days == 0 {
        return Err(Error::invalid_argument("CA validity must be at least one day"));
    }

    let now = OffsetDateTime::now_utc();
    let not_after = now
        .checked_add(Duration::days(i64::from(validity_days)))
        .ok_or_else(|| Error::invalid_argument(format!("CA validity of {} days is too long", validity_days)))?;

    let key_pair = algorithm.generate_key_pair()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "CrabProxy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(random_serial());
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
    params.not_after = not_after;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::ca(format!("failed to self-sign CA certificate: {}", e)))?;

    info!("Generated {} root CA \"{}\" valid for {} days", algorithm, common_name, validity_days);

    Ok(GeneratedCa {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Generate a root CA and write both PEM files
pub fn generate_ca_files(
    common_name: &str,
    validity_days: u32,
    cert_path: &Path,
    key_path: &Path,
    algorithm: KeyAlgorithm,
) -> Result<()> {
    let generated = generate(common_name, validity_days, algorithm)?;

    fs::write(cert_path, generated.cert_pem.as_bytes()).map_err(|e| {
        Error::io(format!("failed to write CA certificate {}", cert_path.display()), e)
    })?;
    write_private_key(key_path, &generated.key_pem)
        .map_err(|e| Error::io(format!("failed to write CA key {}", key_path.display()), e))?;

    info!("Wrote CA certificate to {} and key to {}", cert_path.display(), key_path.display());
    Ok(())
}

fn write_private_key(path: &Path, pem: &str) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(pem.as_bytes())?;
    file.sync_all()
}

/// Normalize a requested hostname into the exact name a leaf is issued for
pub(crate) fn normalize_host(host: &str) -> Result<String> {
    let trimmed = host.trim().trim_end_matches('.');
    let trimmed = trimmed
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(trimmed);

    if trimmed.is_empty() {
        return Err(Error::invalid_argument("hostname must not be empty"));
    }
    if trimmed.contains('*') {
        return Err(Error::invalid_argument(format!(
            "refusing to issue a wildcard certificate for {}",
            host
        )));
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.parse::<IpAddr>().is_ok() {
        return Ok(lower);
    }

    let valid = lower.len() <= 253
        && lower.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        });
    if !valid {
        return Err(Error::invalid_argument(format!("invalid hostname: {}", host)));
    }

    Ok(lower)
}

/// Re-encode a PKCS#1 RSA key as PKCS#8; PKCS#8 passes through
fn pkcs8_key_pem(key_pem: &str) -> Result<Cow<'_, str>> {
    if key_pem.contains("BEGIN EC PRIVATE KEY") {
        return Err(Error::ca("SEC1 EC private keys are not supported, convert the CA key to PKCS#8"));
    }
    if !key_pem.contains("BEGIN RSA PRIVATE KEY") {
        return Ok(Cow::Borrowed(key_pem));
    }

    let key = rsa::RsaPrivateKey::from_pkcs1_pem(key_pem.trim())
        .map_err(|e| Error::ca(format!("failed to parse PKCS#1 CA private key: {}", e)))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::ca(format!("failed to re-encode CA private key: {}", e)))?;
    Ok(Cow::Owned(pem.to_string()))
}

/// Loaded root CA, shared read-only by every session
pub struct CaMaterial {
    algorithm: KeyAlgorithm,
    common_name: String,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    not_after: OffsetDateTime,
    issuer: rcgen::Certificate,
    issuer_key: KeyPair,
    leaf_cache: DashMap<String, Arc<CertifiedKey>>,
}

impl CaMaterial {
    /// Load a CA certificate and its private key from disk
    ///
    /// The key may be PKCS#8 or a PKCS#1 RSA key.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
            Error::io(format!("failed to read CA certificate {}", cert_path.display()), e)
        })?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| Error::io(format!("failed to read CA key {}", key_path.display()), e))?;

        let material = Self::from_pem(&cert_pem, &key_pem)?;
        info!(
            "Loaded {} CA \"{}\" from {}",
            material.algorithm,
            material.common_name,
            cert_path.display()
        );
        Ok(material)
    }

    /// Build CA material from PEM text, checking that key and certificate pair up
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pem = pkcs8_key_pem(key_pem)?;
        let issuer_key = KeyPair::from_pem(&key_pem)
            .map_err(|e| Error::ca(format!("failed to parse CA private key: {}", e)))?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| Error::ca("no certificate found in CA PEM"))?
            .map_err(|e| Error::ca(format!("failed to parse CA certificate PEM: {}", e)))?;

        let (_, parsed) = X509Certificate::from_der(cert_der.as_ref())
            .map_err(|e| Error::ca(format!("failed to parse CA certificate: {}", e)))?;

        if !parsed.is_ca() {
            return Err(Error::ca("certificate is not a certificate authority"));
        }

        let cert_public_key: &[u8] = parsed.public_key().subject_public_key.data.as_ref();
        if cert_public_key != issuer_key.public_key_raw() {
            return Err(Error::ca("CA certificate and private key do not match"));
        }

        let algorithm = match parsed.public_key().parsed() {
            Ok(PublicKey::EC(_)) if issuer_key.algorithm() == &PKCS_ECDSA_P256_SHA256 => {
                KeyAlgorithm::EcdsaP256
            }
            Ok(PublicKey::RSA(rsa_key)) => {
                let bits = rsa_key.modulus.iter().skip_while(|b| **b == 0).count() * 8;
                match bits {
                    2048 => KeyAlgorithm::Rsa2048,
                    4096 => KeyAlgorithm::Rsa4096,
                    other => {
                        return Err(Error::ca(format!("unsupported RSA key size: {} bits", other)))
                    }
                }
            }
            _ => return Err(Error::ca("unsupported CA key algorithm")),
        };

        let not_after = OffsetDateTime::from_unix_timestamp(parsed.validity().not_after.timestamp())
            .map_err(|e| Error::ca(format!("invalid CA expiry: {}", e)))?;
        if not_after <= OffsetDateTime::now_utc() {
            return Err(Error::ca("CA certificate has expired"));
        }

        let common_name = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        // rcgen signs leaves with a certificate object rebuilt from the parsed root.
        let issuer = CertificateParams::from_ca_cert_pem(cert_pem)
            .and_then(|params| params.self_signed(&issuer_key))
            .map_err(|e| Error::ca(format!("failed to prepare CA for signing: {}", e)))?;

        Ok(Self {
            algorithm,
            common_name,
            cert_pem: cert_pem.to_string(),
            cert_der,
            not_after,
            issuer,
            issuer_key,
            leaf_cache: DashMap::new(),
        })
    }

    /// Issue a leaf certificate for exactly `hostname`
    pub fn issue_leaf(&self, hostname: &str) -> Result<LeafCertificate> {
        let name = normalize_host(hostname)?;

        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::ca(format!("failed to generate leaf key: {}", e)))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name.as_str());
        params.distinguished_name = dn;

        params.subject_alt_names = match name.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(name.as_str().try_into().map_err(|_| {
                Error::invalid_argument(format!("invalid hostname: {}", name))
            })?)],
        };

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
        params.not_after = std::cmp::min(now + Duration::days(LEAF_TTL_DAYS), self.not_after);

        let cert = params
            .signed_by(&leaf_key, &self.issuer, &self.issuer_key)
            .map_err(|e| Error::ca(format!("failed to sign leaf for {}: {}", name, e)))?;

        debug!("Issued leaf certificate for {}", name);

        Ok(LeafCertificate {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            cert_der: cert.der().clone(),
            key_der: PrivatePkcs8KeyDer::from(leaf_key.serialize_der()),
        })
    }

    /// Signing material for `hostname`, issued on first use and cached
    pub fn certified_key(&self, hostname: &str) -> Result<Arc<CertifiedKey>> {
        let name = normalize_host(hostname)?;
        if let Some(cached) = self.leaf_cache.get(&name) {
            return Ok(cached.clone());
        }

        let leaf = self.issue_leaf(&name)?;
        let key_der = PrivateKeyDer::Pkcs8(leaf.key_der);
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| Error::ca(format!("failed to load leaf signing key: {}", e)))?;
        let certified = Arc::new(CertifiedKey::new(
            vec![leaf.cert_der, self.cert_der.clone()],
            signing_key,
        ));

        if self.leaf_cache.len() >= LEAF_CACHE_CAPACITY {
            self.leaf_cache.clear();
        }
        self.leaf_cache.insert(name, certified.clone());

        Ok(certified)
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn cached_leaf_count(&self) -> usize {
        self.leaf_cache.len()
    }
}

impl fmt::Debug for CaMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaMaterial")
            .field("algorithm", &self.algorithm)
            .field("common_name", &self.common_name)
            .field("not_after", &self.not_after)
            .field("cached_leaves", &self.leaf_cache.len())
            .finish()
    }
}
