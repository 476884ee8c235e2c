//! Certificate and key handling on top of OpenSSL
//!
//! Everything in here is pure: no Kubernetes objects are read or written.

use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, PKeyRef, Private},
    stack::Stack,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        store::X509StoreBuilder,
        verify::X509VerifyFlags,
        X509Builder, X509NameBuilder, X509NameRef, X509PurposeId, X509Ref, X509StoreContext, X509,
    },
};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::time::Duration;
use time::OffsetDateTime;

use crate::utils::{asn1time_to_offsetdatetime, Asn1TimeParseError, Unloggable};

/// Certificates are backdated slightly to tolerate clock skew between nodes
const NOT_BEFORE_BACKDATE: Duration = Duration::from_minutes_unchecked(5);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate key"))]
    GenerateKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to serialize certificate"))]
    SerializeCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to decode certificate"))]
    LoadCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to decode private key"))]
    LoadPrivateKey { source: openssl::error::ErrorStack },

    #[snafu(display("private key is missing"))]
    MissingPrivateKey,

    #[snafu(display("private key does not belong to the certificate"))]
    KeyMismatch,

    #[snafu(display("failed to read public key of certificate"))]
    ReadPublicKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to parse certificate lifetime"))]
    ParseLifetime { source: Asn1TimeParseError },

    #[snafu(display("failed to set up certificate verification"))]
    BuildVerifier { source: openssl::error::ErrorStack },

    #[snafu(display("certificate is not trusted for {usage}: {reason}"))]
    Untrusted {
        reason: &'static str,
        usage: CertUsage,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the error was caused by the crypto library while producing new material,
    /// rather than by invalid input material
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::GenerateKey { .. }
                | Error::BuildCertificate { .. }
                | Error::SerializeCertificate { .. }
                | Error::BuildVerifier { .. }
        )
    }
}

/// What a leaf certificate may be used for, mapped to its extended key usage
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum CertUsage {
    #[strum(serialize = "server authentication")]
    ServerAuth,
    #[strum(serialize = "client authentication")]
    ClientAuth,
}

impl CertUsage {
    fn purpose(self) -> X509PurposeId {
        match self {
            CertUsage::ServerAuth => X509PurposeId::SSL_SERVER,
            CertUsage::ClientAuth => X509PurposeId::SSL_CLIENT,
        }
    }
}

/// Validity window of a certificate that is about to be issued
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Validity {
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl Validity {
    pub fn starting_at(now: OffsetDateTime, lifetime: Duration) -> Self {
        // X.509 only stores whole seconds
        let now = now.replace_nanosecond(0).unwrap_or(now);
        Self {
            not_before: now - NOT_BEFORE_BACKDATE,
            not_after: now + lifetime,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expiry {
    pub not_after: OffsetDateTime,
    /// Whether the certificate expires within the renewal threshold (or already has)
    pub expiring: bool,
}

/// Subject of a self-signed root CA
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaSubject {
    pub common_name: String,
    pub organizational_unit: String,
}

/// The identity a leaf certificate is issued for
#[derive(Clone, Copy, Debug)]
pub struct LeafRequest<'a> {
    pub common_name: &'a str,
    pub usage: CertUsage,
    pub alt_dns_names: &'a [String],
}

/// A PEM-encoded certificate, optionally accompanied by its PEM-encoded private key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    pub certificate: Vec<u8>,
    pub private_key: Option<Unloggable<Vec<u8>>>,
}

impl KeyPair {
    pub fn parse_certificate(&self) -> Result<X509> {
        X509::from_pem(&self.certificate).context(LoadCertificateSnafu)
    }

    pub fn parse_private_key(&self) -> Result<PKey<Private>> {
        let pem = self.private_key.as_ref().context(MissingPrivateKeySnafu)?;
        PKey::private_key_from_pem(pem).context(LoadPrivateKeySnafu)
    }

    /// Checks when the certificate expires, and whether that is less than `threshold` after `now`
    pub fn expiry(&self, now: OffsetDateTime, threshold: Duration) -> Result<Expiry> {
        let cert = self.parse_certificate()?;
        let not_after = asn1time_to_offsetdatetime(cert.not_after()).context(ParseLifetimeSnafu)?;
        Ok(Expiry {
            not_after,
            expiring: not_after < now + threshold,
        })
    }

    /// Verifies that the certificate was issued by `ca` and may be used for `usage`
    ///
    /// The trust store consists of the CA certificate alone: neither the system roots nor
    /// intermediate certificates are considered. Validity periods are not checked here, they are
    /// judged against the reconciliation time by [`KeyPair::expiry`] instead.
    pub fn verify(&self, ca: &KeyPair, usage: CertUsage) -> Result<()> {
        let ca_cert = ca.parse_certificate()?;
        let cert = self.parse_certificate()?;
        let store = X509StoreBuilder::new()
            .and_then(|mut store| {
                store.add_cert(ca_cert)?;
                store.set_purpose(usage.purpose())?;
                store.set_flags(X509VerifyFlags::NO_CHECK_TIME)?;
                Ok(store.build())
            })
            .context(BuildVerifierSnafu)?;
        let chain = Stack::new().context(BuildVerifierSnafu)?;
        let failure = X509StoreContext::new()
            .and_then(|mut ctx| {
                ctx.init(&store, &cert, &chain, |ctx| {
                    Ok((!ctx.verify_cert()?).then(|| ctx.error()))
                })
            })
            .context(BuildVerifierSnafu)?;
        match failure {
            None => Ok(()),
            Some(result) => UntrustedSnafu {
                reason: result.error_string(),
                usage,
            }
            .fail(),
        }
    }
}

fn generate_key() -> Result<PKey<Private>> {
    EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
        .and_then(|group| EcKey::generate(&group))
        .and_then(PKey::from_ec_key)
        .context(GenerateKeySnafu)
}

fn random_serial() -> Result<Asn1Integer, openssl::error::ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    Asn1Integer::from_bn(&serial)
}

fn encode(cert: &X509Ref, key: &PKeyRef<Private>) -> Result<KeyPair> {
    Ok(KeyPair {
        certificate: cert.to_pem().context(SerializeCertificateSnafu)?,
        private_key: Some(Unloggable(
            key.private_key_to_pem_pkcs8()
                .context(SerializeCertificateSnafu)?,
        )),
    })
}

/// A CA that is able to sign certificates
pub struct CertificateAuthority {
    cert: X509,
    key: PKey<Private>,
}

impl CertificateAuthority {
    pub fn new_self_signed(subject: &CaSubject, validity: Validity) -> Result<Self> {
        let subject_name = X509NameBuilder::new()
            .and_then(|mut name| {
                name.append_entry_by_nid(Nid::COMMONNAME, &subject.common_name)?;
                name.append_entry_by_nid(
                    Nid::ORGANIZATIONALUNITNAME,
                    &subject.organizational_unit,
                )?;
                Ok(name)
            })
            .context(BuildCertificateSnafu)?
            .build();
        let key = generate_key()?;
        let cert = build_ca_certificate(&subject_name, &key, validity)?;
        Ok(Self { cert, key })
    }

    /// Loads a CA from a [`KeyPair`], requiring the private key to be present and to match the certificate
    pub fn from_key_pair(pair: &KeyPair) -> Result<Self> {
        let cert = pair.parse_certificate()?;
        let key = pair.parse_private_key()?;
        let public_key = cert.public_key().context(ReadPublicKeySnafu)?;
        if !public_key.public_eq(&key) {
            return KeyMismatchSnafu.fail();
        }
        Ok(Self { cert, key })
    }

    /// Issues a new CA certificate with the same subject and key, and a new validity window
    ///
    /// The key is always kept, so that certificates signed by the previous CA certificate
    /// stay trusted.
    pub fn renew(&self, validity: Validity) -> Result<Self> {
        let cert = build_ca_certificate(self.cert.subject_name(), &self.key, validity)?;
        Ok(Self {
            cert,
            key: self.key.clone(),
        })
    }

    /// Issues a leaf certificate for a freshly generated key
    pub fn sign_leaf(&self, request: LeafRequest<'_>, validity: Validity) -> Result<KeyPair> {
        let key = generate_key()?;
        self.issue_leaf(&key, request, validity)
    }

    /// Issues a leaf certificate for an existing key
    pub fn issue_leaf(
        &self,
        key: &PKeyRef<Private>,
        request: LeafRequest<'_>,
        validity: Validity,
    ) -> Result<KeyPair> {
        let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
        let cert = X509Builder::new()
            .and_then(|mut x509| {
                let subject_name = X509NameBuilder::new()
                    .and_then(|mut name| {
                        name.append_entry_by_nid(Nid::COMMONNAME, request.common_name)?;
                        Ok(name)
                    })?
                    .build();
                x509.set_subject_name(&subject_name)?;
                x509.set_issuer_name(self.cert.subject_name())?;
                x509.set_not_before(
                    Asn1Time::from_unix(validity.not_before.unix_timestamp())?.as_ref(),
                )?;
                x509.set_not_after(
                    Asn1Time::from_unix(validity.not_after.unix_timestamp())?.as_ref(),
                )?;
                x509.set_pubkey(key)?;
                x509.set_version(
                    3 - 1, // zero-indexed
                )?;
                x509.set_serial_number(random_serial()?.as_ref())?;
                let ctx = x509.x509v3_context(Some(&self.cert), Some(&conf));
                let mut extended_key_usage = ExtendedKeyUsage::new();
                match request.usage {
                    CertUsage::ServerAuth => extended_key_usage.server_auth(),
                    CertUsage::ClientAuth => extended_key_usage.client_auth(),
                };
                let mut exts = vec![
                    BasicConstraints::new().critical().build()?,
                    KeyUsage::new()
                        .critical()
                        .digital_signature()
                        .key_encipherment()
                        .build()?,
                    extended_key_usage.build()?,
                    SubjectKeyIdentifier::new().build(&ctx)?,
                    // Identify the issuer by key only, so that the certificate keeps
                    // chaining to the CA across CA renewals
                    AuthorityKeyIdentifier::new().keyid(true).build(&ctx)?,
                ];
                if !request.alt_dns_names.is_empty() {
                    let mut san_ext = SubjectAlternativeName::new();
                    for name in request.alt_dns_names {
                        san_ext.dns(name);
                    }
                    exts.push(san_ext.build(&ctx)?);
                }
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                x509.sign(&self.key, MessageDigest::sha256())?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();
        encode(&cert, key)
    }

    pub fn to_key_pair(&self) -> Result<KeyPair> {
        encode(&self.cert, &self.key)
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.cert
    }
}

fn build_ca_certificate(
    subject_name: &X509NameRef,
    key: &PKeyRef<Private>,
    validity: Validity,
) -> Result<X509> {
    let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
    Ok(X509Builder::new()
        .and_then(|mut x509| {
            x509.set_subject_name(subject_name)?;
            x509.set_issuer_name(subject_name)?;
            x509.set_not_before(
                Asn1Time::from_unix(validity.not_before.unix_timestamp())?.as_ref(),
            )?;
            x509.set_not_after(Asn1Time::from_unix(validity.not_after.unix_timestamp())?.as_ref())?;
            x509.set_pubkey(key)?;
            x509.set_serial_number(random_serial()?.as_ref())?;
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            let ctx = x509.x509v3_context(None, Some(&conf));
            let exts = [
                BasicConstraints::new().critical().ca().build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(false)
                    .keyid(false)
                    .build(&ctx)?,
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_cert_sign()
                    .crl_sign()
                    .build()?,
            ];
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .context(BuildCertificateSnafu)?
        .build())
}
