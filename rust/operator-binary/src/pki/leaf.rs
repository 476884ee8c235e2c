//! Leaf Certificate Manager: issues and renews the certificates signed by the role CAs, and checks
//! the ones supplied by the user

use std::collections::BTreeMap;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::runtime::reflector::ObjectRef,
};

use super::{
    ca::CaRecord,
    keypair::{self, CertUsage, Expiry, KeyPair, LeafRequest, Validity},
    ClassifiedError, ErrorKind, LeafKeyPolicy, OwnerReferenceError, PkiContext, PkiReport,
    Renewal,
};
use crate::{
    crd::CertificateSource,
    store::{SecretStore, StoreError},
    utils::Unloggable,
};

pub const SECRET_KEY_TLS_CERT: &str = "tls.crt";
pub const SECRET_KEY_TLS_KEY: &str = "tls.key";
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up certificate {secret}"))]
    FindCertificate {
        source: StoreError,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("missing specified certificate secret {secret}"))]
    MissingSpecifiedCertificate { secret: ObjectRef<Secret> },

    #[snafu(display("certificate {secret} has no {key:?}"))]
    MissingCertificateData {
        secret: ObjectRef<Secret>,
        key: &'static str,
    },

    #[snafu(display("failed to load certificate from {secret}"))]
    InvalidCertificate {
        source: keypair::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("certificate {secret} is not signed by CA {ca}"))]
    UntrustedCertificate {
        source: keypair::Error,
        secret: ObjectRef<Secret>,
        ca: ObjectRef<Secret>,
    },

    #[snafu(display("failed to load CA {ca} for signing"))]
    LoadSigningCa {
        source: keypair::Error,
        ca: ObjectRef<Secret>,
    },

    #[snafu(display("failed to sign certificate {secret}"))]
    SignCertificate {
        source: keypair::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to build metadata for certificate {secret}"))]
    BuildMetadata {
        source: OwnerReferenceError,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to create certificate {secret}"))]
    CreateCertificate {
        source: StoreError,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("certificate {secret} was reported to exist but could not be found"))]
    CertificateVanished { secret: ObjectRef<Secret> },

    #[snafu(display("failed to save renewed certificate {secret}"))]
    SaveRenewedCertificate {
        source: StoreError,
        secret: ObjectRef<Secret>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifiedError for Error {
    fn kind(&self) -> ErrorKind {
        let crypto_kind = |source: &keypair::Error| {
            if source.is_internal() {
                ErrorKind::Internal
            } else {
                ErrorKind::ValidationFailure
            }
        };
        match self {
            Error::FindCertificate { source, .. } => source.kind(),
            Error::MissingSpecifiedCertificate { .. } => ErrorKind::MissingExternalSecret,
            Error::MissingCertificateData { .. } => ErrorKind::ValidationFailure,
            Error::InvalidCertificate { source, .. } => crypto_kind(source),
            Error::UntrustedCertificate { source, .. } => crypto_kind(source),
            Error::LoadSigningCa { .. } => ErrorKind::ValidationFailure,
            Error::SignCertificate { source, .. } => crypto_kind(source),
            Error::BuildMetadata { .. } => ErrorKind::ValidationFailure,
            Error::CreateCertificate { source, .. } => source.kind(),
            Error::CertificateVanished { .. } => ErrorKind::ConflictError,
            Error::SaveRenewedCertificate { source, .. } => source.kind(),
        }
    }
}

/// Identity of a leaf certificate slot
#[derive(Clone, Copy, Debug)]
pub struct LeafSpec<'a> {
    pub common_name: &'a str,
    pub usage: CertUsage,
    pub alt_dns_names: &'a [String],
    /// Value of the certificate role label on created Secrets
    pub role: &'static str,
}

impl<'a> LeafSpec<'a> {
    fn request(&self) -> LeafRequest<'a> {
        LeafRequest {
            common_name: self.common_name,
            usage: self.usage,
            alt_dns_names: self.alt_dns_names,
        }
    }
}

fn tls_data(pair: KeyPair) -> BTreeMap<String, ByteString> {
    let mut data = BTreeMap::from([(
        SECRET_KEY_TLS_CERT.to_string(),
        ByteString(pair.certificate),
    )]);
    if let Some(Unloggable(key)) = pair.private_key {
        data.insert(SECRET_KEY_TLS_KEY.to_string(), ByteString(key));
    }
    data
}

/// Reads the certificate (and key, if `require_key`) from a TLS Secret
fn leaf_key_pair(
    secret_ref: &ObjectRef<Secret>,
    secret: &Secret,
    require_key: bool,
) -> Result<KeyPair> {
    let data = secret.data.as_ref();
    let get = |key: &'static str| {
        data.and_then(|data| data.get(key))
            .map(|value| value.0.clone())
    };
    let certificate = get(SECRET_KEY_TLS_CERT).with_context(|| MissingCertificateDataSnafu {
        secret: secret_ref.clone(),
        key: SECRET_KEY_TLS_CERT,
    })?;
    let private_key = get(SECRET_KEY_TLS_KEY);
    if require_key && private_key.is_none() {
        return MissingCertificateDataSnafu {
            secret: secret_ref.clone(),
            key: SECRET_KEY_TLS_KEY,
        }
        .fail();
    }
    Ok(KeyPair {
        certificate,
        private_key: private_key.map(Unloggable),
    })
}

impl<S: SecretStore + ?Sized> PkiContext<'_, S> {
    /// Ensures that the leaf certificate in `source` exists and is usable, returning its expiry
    pub async fn ensure_leaf(
        &self,
        source: &CertificateSource,
        spec: LeafSpec<'_>,
        ca: &CaRecord,
        report: &mut PkiReport,
    ) -> Result<Expiry> {
        let secret_ref = self.secret_ref(source.secret_name());
        let expiry = match source {
            CertificateSource::AutoManaged { .. } => {
                self.ensure_managed_leaf(&secret_ref, &spec, ca).await?
            }
            CertificateSource::ExternallySupplied { .. } => {
                let secret = self
                    .store
                    .get(&secret_ref)
                    .await
                    .with_context(|_| FindCertificateSnafu {
                        secret: secret_ref.clone(),
                    })?
                    .with_context(|| MissingSpecifiedCertificateSnafu {
                        secret: secret_ref.clone(),
                    })?;
                let expiry = self.validate_leaf(&secret_ref, &secret, ca, spec.usage)?;
                if expiry.expiring {
                    tracing::warn!(
                        secret = %secret_ref,
                        certificate.expires_at = %expiry.not_after,
                        "externally supplied certificate is expiring, it has to be renewed by its owner"
                    );
                    report.warn_expiring(&secret_ref, expiry);
                }
                expiry
            }
        };
        report.record_expiry(&secret_ref, expiry);
        Ok(expiry)
    }

    /// Checks that a leaf certificate decodes, has a key, and is trusted by `ca` for `usage`
    pub fn validate_leaf(
        &self,
        secret_ref: &ObjectRef<Secret>,
        secret: &Secret,
        ca: &CaRecord,
        usage: CertUsage,
    ) -> Result<Expiry> {
        let key_pair = leaf_key_pair(secret_ref, secret, true)?;
        key_pair
            .verify(&ca.key_pair, usage)
            .with_context(|_| UntrustedCertificateSnafu {
                secret: secret_ref.clone(),
                ca: ca.secret.clone(),
            })?;
        key_pair
            .expiry(self.now, self.config.renewal_threshold)
            .with_context(|_| InvalidCertificateSnafu {
                secret: secret_ref.clone(),
            })
    }

    async fn ensure_managed_leaf(
        &self,
        secret_ref: &ObjectRef<Secret>,
        spec: &LeafSpec<'_>,
        ca: &CaRecord,
    ) -> Result<Expiry> {
        let found = self
            .store
            .get(secret_ref)
            .await
            .with_context(|_| FindCertificateSnafu {
                secret: secret_ref.clone(),
            })?;
        let snapshot = match found {
            Some(snapshot) => snapshot,
            None => match self.create_leaf(secret_ref, spec, ca).await {
                Err(Error::CreateCertificate {
                    source: StoreError::AlreadyExists { .. },
                    ..
                }) => {
                    tracing::info!(
                        secret = %secret_ref,
                        "certificate was created concurrently, continuing with the existing one"
                    );
                    self.store
                        .get(secret_ref)
                        .await
                        .with_context(|_| FindCertificateSnafu {
                            secret: secret_ref.clone(),
                        })?
                        .with_context(|| CertificateVanishedSnafu {
                            secret: secret_ref.clone(),
                        })?
                }
                created => return created,
            },
        };
        match self.renew_leaf(&snapshot, spec, ca).await? {
            Renewal::Unchanged => {
                leaf_key_pair(secret_ref, &snapshot, false)?
                    .expiry(self.now, self.config.renewal_threshold)
                    .with_context(|_| InvalidCertificateSnafu {
                        secret: secret_ref.clone(),
                    })
            }
            Renewal::Renewed(expiry) => Ok(expiry),
        }
    }

    async fn create_leaf(
        &self,
        secret_ref: &ObjectRef<Secret>,
        spec: &LeafSpec<'_>,
        ca: &CaRecord,
    ) -> Result<Expiry> {
        let signer = ca.signer().with_context(|_| LoadSigningCaSnafu {
            ca: ca.secret.clone(),
        })?;
        let validity = Validity::starting_at(self.now, self.config.certificate_lifetime);
        let key_pair = signer
            .sign_leaf(spec.request(), validity)
            .with_context(|_| SignCertificateSnafu {
                secret: secret_ref.clone(),
            })?;
        let secret = Secret {
            metadata: self
                .owned_secret_metadata(secret_ref, spec.role)
                .with_context(|_| BuildMetadataSnafu {
                    secret: secret_ref.clone(),
                })?,
            type_: Some(SECRET_TYPE_TLS.to_string()),
            data: Some(tls_data(key_pair)),
            ..Secret::default()
        };
        self.store
            .create(&secret)
            .await
            .with_context(|_| CreateCertificateSnafu {
                secret: secret_ref.clone(),
            })?;
        tracing::info!(
            secret = %secret_ref,
            ca = %ca.secret,
            certificate.common_name = spec.common_name,
            certificate.expires_at = %validity.not_after,
            "issued certificate"
        );
        Ok(Expiry {
            not_after: validity.not_after,
            expiring: false,
        })
    }

    /// Reissues the certificate in `snapshot` if it is about to expire, or if it is no longer
    /// trusted by `ca` for the slot's usage (for example after the CA key was replaced)
    ///
    /// The write is conditional on `snapshot` still being current, so a concurrent modification
    /// fails with [`StoreError::Conflict`] instead of being overwritten.
    pub async fn renew_leaf(
        &self,
        snapshot: &Secret,
        spec: &LeafSpec<'_>,
        ca: &CaRecord,
    ) -> Result<Renewal<Expiry>> {
        let secret_ref = ObjectRef::from_obj(snapshot);
        let current = leaf_key_pair(&secret_ref, snapshot, false)?;
        let expiry = current
            .expiry(self.now, self.config.renewal_threshold)
            .with_context(|_| InvalidCertificateSnafu {
                secret: secret_ref.clone(),
            })?;
        let trusted = match current.verify(&ca.key_pair, spec.usage) {
            Ok(()) => true,
            Err(keypair::Error::Untrusted { .. }) => false,
            Err(source) => {
                return Err(Error::UntrustedCertificate {
                    source,
                    secret: secret_ref.clone(),
                    ca: ca.secret.clone(),
                })
            }
        };
        if !expiry.expiring && trusted {
            return Ok(Renewal::Unchanged);
        }

        let signer = ca.signer().with_context(|_| LoadSigningCaSnafu {
            ca: ca.secret.clone(),
        })?;
        let validity = Validity::starting_at(self.now, self.config.certificate_lifetime);
        let key_pair = match self.config.leaf_key_policy {
            LeafKeyPolicy::ReuseExisting => {
                let key = current
                    .parse_private_key()
                    .with_context(|_| InvalidCertificateSnafu {
                        secret: secret_ref.clone(),
                    })?;
                signer.issue_leaf(&key, spec.request(), validity)
            }
            LeafKeyPolicy::Regenerate => signer.sign_leaf(spec.request(), validity),
        }
        .with_context(|_| SignCertificateSnafu {
            secret: secret_ref.clone(),
        })?;
        let updated = Secret {
            data: Some(tls_data(key_pair)),
            ..snapshot.clone()
        };
        self.store
            .patch(snapshot, &updated)
            .await
            .with_context(|_| SaveRenewedCertificateSnafu {
                secret: secret_ref.clone(),
            })?;
        tracing::info!(
            secret = %secret_ref,
            ca = %ca.secret,
            key_policy = %self.config.leaf_key_policy,
            certificate.was_trusted = trusted,
            certificate.previously_expired_at = %expiry.not_after,
            certificate.expires_at = %validity.not_after,
            "renewed certificate"
        );
        Ok(Renewal::Renewed(Expiry {
            not_after: validity.not_after,
            expiring: false,
        }))
    }
}
