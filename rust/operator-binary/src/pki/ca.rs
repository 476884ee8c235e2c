//! CA Manager: makes sure a CA exists for a trust role, and renews it while the operator owns it

use std::collections::BTreeMap;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::runtime::reflector::ObjectRef,
};
use time::OffsetDateTime;

use super::{
    keypair::{self, CaSubject, CertificateAuthority, Expiry, KeyPair, Validity},
    ClassifiedError, ErrorKind, OwnerReferenceError, PkiContext, PkiReport, Renewal,
};
use crate::{
    crd::{CertificateSource, RoleSources},
    store::{SecretStore, StoreError},
    utils::Unloggable,
};

pub const SECRET_KEY_CA_CERT: &str = "ca.crt";
pub const SECRET_KEY_CA_KEY: &str = "ca.key";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up CA {secret}"))]
    FindCa {
        source: StoreError,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("missing specified CA secret {secret}"))]
    MissingSpecifiedCa { secret: ObjectRef<Secret> },

    #[snafu(display("CA {secret} has no {key:?}"))]
    MissingCaCertificate {
        secret: ObjectRef<Secret>,
        key: &'static str,
    },

    #[snafu(display("failed to load CA certificate from {secret}"))]
    InvalidCaCertificate {
        source: keypair::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to load CA private key from {secret}"))]
    InvalidCaKey {
        source: keypair::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to generate CA for {secret}"))]
    GenerateCa {
        source: keypair::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to renew CA {secret}"))]
    RenewCa {
        source: keypair::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to build metadata for CA {secret}"))]
    BuildMetadata {
        source: OwnerReferenceError,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to create CA {secret}"))]
    CreateCa {
        source: StoreError,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("CA {secret} was reported to exist but could not be found"))]
    CaVanished { secret: ObjectRef<Secret> },

    #[snafu(display("failed to save renewed CA {secret}"))]
    SaveRenewedCa {
        source: StoreError,
        secret: ObjectRef<Secret>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

fn crypto_kind(source: &keypair::Error) -> ErrorKind {
    if source.is_internal() {
        ErrorKind::Internal
    } else {
        ErrorKind::ValidationFailure
    }
}

impl ClassifiedError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::FindCa { source, .. } => source.kind(),
            Error::MissingSpecifiedCa { .. } => ErrorKind::MissingExternalSecret,
            Error::MissingCaCertificate { .. } => ErrorKind::ValidationFailure,
            Error::InvalidCaCertificate { source, .. } => crypto_kind(source),
            Error::InvalidCaKey { .. } => ErrorKind::ValidationFailure,
            Error::GenerateCa { .. } => ErrorKind::Internal,
            Error::RenewCa { source, .. } => crypto_kind(source),
            Error::BuildMetadata { .. } => ErrorKind::ValidationFailure,
            Error::CreateCa { source, .. } => source.kind(),
            Error::CaVanished { .. } => ErrorKind::ConflictError,
            Error::SaveRenewedCa { source, .. } => source.kind(),
        }
    }
}

/// The trust roles that each get their own CA
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum CaRole {
    #[strum(serialize = "server")]
    Server,
    #[strum(serialize = "client")]
    Client,
}

impl CaRole {
    fn label(self) -> &'static str {
        match self {
            CaRole::Server => "server-ca",
            CaRole::Client => "client-ca",
        }
    }
}

/// A CA as read from its Secret
#[derive(Debug)]
pub struct CaRecord {
    pub secret: ObjectRef<Secret>,
    pub key_pair: KeyPair,
    pub expiry: Expiry,
}

impl CaRecord {
    /// Whether the private key is available, which is the case for every CA the operator manages
    pub fn is_self_managed(&self) -> bool {
        self.key_pair.private_key.is_some()
    }

    /// Loads the CA for signing, failing if its key is missing or belongs to another certificate
    pub fn signer(&self) -> Result<CertificateAuthority, keypair::Error> {
        CertificateAuthority::from_key_pair(&self.key_pair)
    }

    fn from_secret(
        secret_ref: &ObjectRef<Secret>,
        secret: &Secret,
        now: OffsetDateTime,
        threshold: stackable_operator::time::Duration,
    ) -> Result<Self> {
        let data = secret.data.as_ref();
        let certificate = data
            .and_then(|data| data.get(SECRET_KEY_CA_CERT))
            .with_context(|| MissingCaCertificateSnafu {
                secret: secret_ref.clone(),
                key: SECRET_KEY_CA_CERT,
            })?;
        let key_pair = KeyPair {
            certificate: certificate.0.clone(),
            private_key: data
                .and_then(|data| data.get(SECRET_KEY_CA_KEY))
                .map(|key| Unloggable(key.0.clone())),
        };
        let expiry = key_pair
            .expiry(now, threshold)
            .context(InvalidCaCertificateSnafu { secret: secret_ref.clone() })?;
        Ok(Self {
            secret: secret_ref.clone(),
            key_pair,
            expiry,
        })
    }
}

fn ca_data(pair: KeyPair) -> BTreeMap<String, ByteString> {
    let mut data = BTreeMap::from([(
        SECRET_KEY_CA_CERT.to_string(),
        ByteString(pair.certificate),
    )]);
    if let Some(Unloggable(key)) = pair.private_key {
        data.insert(SECRET_KEY_CA_KEY.to_string(), ByteString(key));
    }
    data
}

impl<S: SecretStore + ?Sized> PkiContext<'_, S> {
    /// Ensures that the CA of `role` exists and can be used to check (and, if needed, sign) the
    /// role's leaf certificate
    pub async fn ensure_ca(
        &self,
        role: CaRole,
        sources: &RoleSources,
        report: &mut PkiReport,
    ) -> Result<CaRecord> {
        let record = match &sources.ca {
            CertificateSource::AutoManaged { secret_name } => {
                self.ensure_managed_ca(role, &self.secret_ref(secret_name))
                    .await?
            }
            CertificateSource::ExternallySupplied { secret_name } => {
                self.check_external_ca(&self.secret_ref(secret_name), sources, report)
                    .await?
            }
        };
        report.record_expiry(&record.secret, record.expiry);
        Ok(record)
    }

    async fn ensure_managed_ca(
        &self,
        role: CaRole,
        secret_ref: &ObjectRef<Secret>,
    ) -> Result<CaRecord> {
        let found = self
            .store
            .get(secret_ref)
            .await
            .context(FindCaSnafu { secret: secret_ref.clone() })?;
        let snapshot = match found {
            Some(snapshot) => snapshot,
            None => match self.create_ca(role, secret_ref).await {
                Err(Error::CreateCa {
                    source: StoreError::AlreadyExists { .. },
                    ..
                }) => {
                    tracing::info!(
                        secret = %secret_ref,
                        "CA was created concurrently, continuing with the existing one"
                    );
                    self.store
                        .get(secret_ref)
                        .await
                        .context(FindCaSnafu { secret: secret_ref.clone() })?
                        .context(CaVanishedSnafu { secret: secret_ref.clone() })?
                }
                created => return created,
            },
        };

        let record = CaRecord::from_secret(
            secret_ref,
            &snapshot,
            self.now,
            self.config.renewal_threshold,
        )?;
        let signer = record
            .signer()
            .context(InvalidCaKeySnafu { secret: secret_ref.clone() })?;
        match self.renew_ca(&snapshot, &record, &signer).await? {
            Renewal::Unchanged => Ok(record),
            Renewal::Renewed(renewed) => Ok(renewed),
        }
    }

    async fn create_ca(&self, role: CaRole, secret_ref: &ObjectRef<Secret>) -> Result<CaRecord> {
        let subject = CaSubject {
            common_name: self.cluster.metadata.name.clone().unwrap_or_default(),
            organizational_unit: self.namespace.clone(),
        };
        let validity = Validity::starting_at(self.now, self.config.certificate_lifetime);
        let key_pair = CertificateAuthority::new_self_signed(&subject, validity)
            .and_then(|ca| ca.to_key_pair())
            .context(GenerateCaSnafu { secret: secret_ref.clone() })?;
        let secret = Secret {
            metadata: self
                .owned_secret_metadata(secret_ref, role.label())
                .context(BuildMetadataSnafu { secret: secret_ref.clone() })?,
            data: Some(ca_data(key_pair.clone())),
            ..Secret::default()
        };
        self.store
            .create(&secret)
            .await
            .context(CreateCaSnafu { secret: secret_ref.clone() })?;
        tracing::info!(
            secret = %secret_ref,
            %role,
            ca.expires_at = %validity.not_after,
            "created CA"
        );
        Ok(CaRecord {
            secret: secret_ref.clone(),
            key_pair,
            expiry: Expiry {
                not_after: validity.not_after,
                expiring: false,
            },
        })
    }

    /// Issues a new certificate for the CA's existing key if the current one is about to expire
    async fn renew_ca(
        &self,
        snapshot: &Secret,
        record: &CaRecord,
        signer: &CertificateAuthority,
    ) -> Result<Renewal<CaRecord>> {
        if !record.expiry.expiring {
            return Ok(Renewal::Unchanged);
        }
        let secret_ref = &record.secret;
        let validity = Validity::starting_at(self.now, self.config.certificate_lifetime);
        let key_pair = signer
            .renew(validity)
            .and_then(|renewed| renewed.to_key_pair())
            .context(RenewCaSnafu { secret: secret_ref.clone() })?;
        let updated = Secret {
            data: Some(ca_data(key_pair.clone())),
            ..snapshot.clone()
        };
        self.store
            .patch(snapshot, &updated)
            .await
            .context(SaveRenewedCaSnafu { secret: secret_ref.clone() })?;
        tracing::info!(
            secret = %secret_ref,
            ca.previously_expired_at = %record.expiry.not_after,
            ca.expires_at = %validity.not_after,
            "renewed CA"
        );
        Ok(Renewal::Renewed(CaRecord {
            secret: secret_ref.clone(),
            key_pair,
            expiry: Expiry {
                not_after: validity.not_after,
                expiring: false,
            },
        }))
    }

    /// Validates a CA supplied by the user, without ever writing to it
    async fn check_external_ca(
        &self,
        secret_ref: &ObjectRef<Secret>,
        sources: &RoleSources,
        report: &mut PkiReport,
    ) -> Result<CaRecord> {
        let secret = self
            .store
            .get(secret_ref)
            .await
            .context(FindCaSnafu { secret: secret_ref.clone() })?
            .context(MissingSpecifiedCaSnafu { secret: secret_ref.clone() })?;
        let record = CaRecord::from_secret(
            secret_ref,
            &secret,
            self.now,
            self.config.renewal_threshold,
        )?;
        if record.expiry.expiring {
            tracing::warn!(
                secret = %secret_ref,
                ca.expires_at = %record.expiry.not_after,
                "externally supplied CA is expiring, it has to be renewed by its owner"
            );
            report.warn_expiring(secret_ref, record.expiry);
        }
        // The key is only needed if the operator has to sign the role's leaf certificate
        if sources.leaf.is_auto_managed() {
            record
                .signer()
                .context(InvalidCaKeySnafu { secret: secret_ref.clone() })?;
        }
        Ok(record)
    }
}
