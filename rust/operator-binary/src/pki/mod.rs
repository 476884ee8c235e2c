//! Maintains the certificate hierarchy of a [`DatabaseCluster`]
//!
//! Two trust roles exist per cluster, each consisting of a CA and a leaf certificate signed by it:
//!
//! * server: the server CA and the certificate served by the database
//! * client: the client CA and the certificate the streaming replicas authenticate with
//!
//! Every slot is either managed by the operator (created when missing, renewed when expiring)
//! or supplied by the user (only ever read and validated).

use std::collections::BTreeMap;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::api::core::v1::Secret,
    kube::{api::ObjectMeta, runtime::reflector::ObjectRef, Resource},
    time::Duration,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use time::OffsetDateTime;

use crate::{
    crd::{DatabaseCluster, STREAMING_REPLICATION_USER},
    store::{SecretStore, StoreError},
};

pub mod ca;
pub mod keypair;
pub mod leaf;

#[cfg(test)]
mod fixtures;

use self::{ca::CaRole, keypair::CertUsage, keypair::Expiry, leaf::LeafSpec};

pub const LABEL_CLUSTER: &str = "pki.dbcluster.tech/cluster";
pub const LABEL_CERTIFICATE_ROLE: &str = "pki.dbcluster.tech/certificate-role";

/// Default lifetime of generated CA and leaf certificates
pub const DEFAULT_CERT_LIFETIME: Duration = Duration::from_days_unchecked(90);

/// Certificates expiring within this period are renewed
pub const DEFAULT_RENEWAL_THRESHOLD: Duration = Duration::from_days_unchecked(7);

#[derive(clap::Args, Clone, Debug)]
pub struct PkiConfig {
    /// Lifetime of the CA and leaf certificates generated by the operator
    #[arg(long, env, default_value = "90d")]
    pub certificate_lifetime: Duration,

    /// Operator-managed certificates are renewed once they expire within this period
    #[arg(long, env, default_value = "7d")]
    pub renewal_threshold: Duration,

    /// Whether renewed leaf certificates keep their private key
    #[arg(long, env, default_value_t, value_enum)]
    pub leaf_key_policy: LeafKeyPolicy,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            certificate_lifetime: DEFAULT_CERT_LIFETIME,
            renewal_threshold: DEFAULT_RENEWAL_THRESHOLD,
            leaf_key_policy: LeafKeyPolicy::default(),
        }
    }
}

/// Key handling when a leaf certificate is renewed
///
/// CA renewals always keep the key, since a new CA key would invalidate every certificate
/// signed by the CA.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum LeafKeyPolicy {
    /// Sign a new certificate for the existing key
    #[default]
    ReuseExisting,
    /// Generate a new key along with the new certificate
    Regenerate,
}

/// Coarse classification of failures, used to decide how to retry
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, IntoStaticStr)]
pub enum ErrorKind {
    /// A Secret configured on the cluster does not exist, and has to be provided by the user
    MissingExternalSecret,
    /// Existing TLS material is unusable
    ValidationFailure,
    /// The object store could not be reached or refused the request
    TransientStoreError,
    /// A concurrent writer got there first, reading again should resolve it
    ConflictError,
    /// The crypto library failed to produce new material
    Internal,
}

pub trait ClassifiedError: std::error::Error + Send + Sync + 'static {
    fn kind(&self) -> ErrorKind;
}

impl ClassifiedError for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::AlreadyExists { .. } => ErrorKind::ConflictError,
            StoreError::Conflict { .. } => ErrorKind::ConflictError,
            StoreError::Request { .. } => ErrorKind::TransientStoreError,
        }
    }
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("{cluster} has no namespace"))]
    NoNamespace {
        cluster: ObjectRef<DatabaseCluster>,
    },

    #[snafu(display("failed to set up the server CA"))]
    ServerCa { source: ca::Error },

    #[snafu(display("failed to set up the server TLS certificate"))]
    ServerCertificate { source: leaf::Error },

    #[snafu(display("failed to set up the client CA"))]
    ClientCa { source: ca::Error },

    #[snafu(display("failed to set up the streaming replication client certificate"))]
    ReplicationCertificate { source: leaf::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

impl ClassifiedError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::NoNamespace { .. } => ErrorKind::ValidationFailure,
            Error::ServerCa { source } => source.kind(),
            Error::ServerCertificate { source } => source.kind(),
            Error::ClientCa { source } => source.kind(),
            Error::ReplicationCertificate { source } => source.kind(),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("{cluster} has no UID, so it cannot own Secrets"))]
pub struct OwnerReferenceError {
    cluster: ObjectRef<DatabaseCluster>,
}

/// Result of checking whether something needs to be renewed
#[derive(Debug)]
pub enum Renewal<T> {
    Unchanged,
    Renewed(T),
}

/// Externally supplied material that is about to expire, which only its owner can fix
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpiryWarning {
    pub secret: ObjectRef<Secret>,
    pub not_after: OffsetDateTime,
}

/// Observations made while setting up the PKI of a cluster
#[derive(Debug, Default)]
pub struct PkiReport {
    /// Expiry of every certificate in use, keyed by the name of its Secret
    pub expirations: BTreeMap<String, OffsetDateTime>,
    pub warnings: Vec<ExpiryWarning>,
}

impl PkiReport {
    fn record_expiry(&mut self, secret: &ObjectRef<Secret>, expiry: Expiry) {
        self.expirations.insert(secret.name.clone(), expiry.not_after);
    }

    fn warn_expiring(&mut self, secret: &ObjectRef<Secret>, expiry: Expiry) {
        self.warnings.push(ExpiryWarning {
            secret: secret.clone(),
            not_after: expiry.not_after,
        });
    }

    /// The earliest point in time after `now` at which some certificate enters its renewal window
    ///
    /// Certificates that are already inside their window are skipped, since only externally
    /// supplied ones can still be there after a successful run.
    pub fn next_renewal(
        &self,
        now: OffsetDateTime,
        threshold: Duration,
    ) -> Option<OffsetDateTime> {
        self.expirations
            .values()
            .map(|not_after| *not_after - threshold)
            .filter(|renew_at| *renew_at > now)
            .min()
    }
}

/// Everything that stays constant while the PKI of a single cluster is reconciled
pub struct PkiContext<'a, S: ?Sized> {
    pub store: &'a S,
    pub cluster: &'a DatabaseCluster,
    pub config: &'a PkiConfig,
    pub namespace: String,
    /// Reference time for all expiry checks and new validity windows
    pub now: OffsetDateTime,
}

impl<S: ?Sized> PkiContext<'_, S> {
    fn secret_ref(&self, name: &str) -> ObjectRef<Secret> {
        ObjectRef::new(name).within(&self.namespace)
    }

    /// Metadata for a Secret created by the operator, owned by the cluster so that it is
    /// garbage collected along with it
    fn owned_secret_metadata(
        &self,
        secret: &ObjectRef<Secret>,
        role: &str,
    ) -> Result<ObjectMeta, OwnerReferenceError> {
        let owner = self
            .cluster
            .controller_owner_ref(&())
            .with_context(|| OwnerReferenceSnafu {
                cluster: ObjectRef::from_obj(self.cluster),
            })?;
        let mut metadata = ObjectMetaBuilder::new()
            .name(&secret.name)
            .namespace(&self.namespace)
            .ownerreference(owner)
            .build();
        metadata.labels = Some(BTreeMap::from([
            (
                LABEL_CLUSTER.to_string(),
                self.cluster.metadata.name.clone().unwrap_or_default(),
            ),
            (LABEL_CERTIFICATE_ROLE.to_string(), role.to_string()),
        ]));
        Ok(metadata)
    }
}

/// Ensures that all CAs and leaf certificates of `cluster` exist and are valid
///
/// The stages run strictly in order and the first failure aborts the run. Material persisted by
/// earlier stages is kept, a later run picks it up again.
pub async fn setup_pki<S: SecretStore + ?Sized>(
    store: &S,
    cluster: &DatabaseCluster,
    config: &PkiConfig,
    now: OffsetDateTime,
) -> Result<PkiReport> {
    let namespace = cluster
        .metadata
        .namespace
        .clone()
        .with_context(|| NoNamespaceSnafu {
            cluster: ObjectRef::from_obj(cluster),
        })?;
    let ctx = PkiContext {
        store,
        cluster,
        config,
        namespace,
        now,
    };
    let sources = cluster.certificate_sources();
    let mut report = PkiReport::default();

    let server_ca = ctx
        .ensure_ca(CaRole::Server, &sources.server, &mut report)
        .await
        .context(ServerCaSnafu)?;
    let service_name = cluster.service_read_write_name();
    let alt_dns_names = cluster.alt_dns_names();
    ctx.ensure_leaf(
        &sources.server.leaf,
        LeafSpec {
            common_name: &service_name,
            usage: CertUsage::ServerAuth,
            alt_dns_names: &alt_dns_names,
            role: "server",
        },
        &server_ca,
        &mut report,
    )
    .await
    .context(ServerCertificateSnafu)?;

    let client_ca = ctx
        .ensure_ca(CaRole::Client, &sources.client, &mut report)
        .await
        .context(ClientCaSnafu)?;
    ctx.ensure_leaf(
        &sources.client.leaf,
        LeafSpec {
            common_name: STREAMING_REPLICATION_USER,
            usage: CertUsage::ClientAuth,
            alt_dns_names: &[],
            role: "replication",
        },
        &client_ca,
        &mut report,
    )
    .await
    .context(ReplicationCertificateSnafu)?;

    Ok(report)
}
