//! Runs [`pki::setup_pki`] for every [`DatabaseCluster`] and reports the result in its status

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::StreamExt;
use serde_json::json;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        self,
        api::{Patch, PatchParams},
        runtime::{controller, reflector::ObjectRef, watcher, Controller},
        Api,
    },
    namespace::WatchNamespace,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    crd::{CertificatesStatus, DatabaseCluster, DatabaseClusterStatus},
    pki::{self, ClassifiedError, ErrorKind, PkiConfig, PkiReport},
    store::KubeSecretStore,
    utils::error_full_message,
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "pki";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

/// Bounds for the requeue after a successful reconciliation
const MIN_REQUEUE: Duration = Duration::from_secs(60);
const MAX_REQUEUE: Duration = Duration::from_secs(60 * 60);

pub async fn start(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    config: PkiConfig,
    reconcile_timeout: Duration,
) {
    Controller::new(
        watch_namespace.get_api::<DatabaseCluster>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<Secret>(client),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(
        reconcile,
        error_policy,
        Arc::new(Ctx {
            client: client.clone(),
            config,
            reconcile_timeout,
        }),
    )
    .for_each_concurrent(16, |res| async move {
        match res {
            Ok((cluster, action)) => {
                tracing::info!(
                    controller.name = FULL_CONTROLLER_NAME,
                    cluster = %cluster,
                    ?action,
                    "reconciled DatabaseCluster"
                );
            }
            Err(err) => {
                tracing::error!(
                    controller.name = FULL_CONTROLLER_NAME,
                    error = %error_full_message(&err),
                    "failed to reconcile DatabaseCluster"
                );
            }
        }
    })
    .await;
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to set up PKI for {cluster}"))]
    SetupPki {
        source: pki::Error,
        cluster: ObjectRef<DatabaseCluster>,
    },

    #[snafu(display("PKI setup for {cluster} did not finish within {timeout:?}"))]
    TimedOut {
        source: tokio::time::error::Elapsed,
        cluster: ObjectRef<DatabaseCluster>,
        timeout: Duration,
    },

    #[snafu(display("failed to format expiry of {secret}"))]
    FormatExpiry {
        source: time::error::Format,
        secret: String,
    },

    #[snafu(display("failed to update status of {cluster}"))]
    ApplyStatus {
        source: kube::Error,
        cluster: ObjectRef<DatabaseCluster>,
    },
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
            Error::SetupPki { source, .. } => source.kind(),
            Error::TimedOut { .. } => ErrorKind::TransientStoreError,
            Error::FormatExpiry { .. } => ErrorKind::Internal,
            Error::ApplyStatus { .. } => ErrorKind::TransientStoreError,
        }
    }
}

struct Ctx {
    client: stackable_operator::client::Client,
    config: PkiConfig,
    reconcile_timeout: Duration,
}

async fn reconcile(cluster: Arc<DatabaseCluster>, ctx: Arc<Ctx>) -> Result<controller::Action> {
    let cluster_ref = ObjectRef::from_obj(&*cluster);
    let store = KubeSecretStore::new(ctx.client.clone());
    let now = OffsetDateTime::now_utc();
    // Dropping the future on timeout abandons the remaining stages, persisted ones stay valid
    let report = tokio::time::timeout(
        ctx.reconcile_timeout,
        pki::setup_pki(&store, &cluster, &ctx.config, now),
    )
    .await
    .with_context(|_| TimedOutSnafu {
        cluster: cluster_ref.clone(),
        timeout: ctx.reconcile_timeout,
    })?
    .with_context(|_| SetupPkiSnafu {
        cluster: cluster_ref.clone(),
    })?;

    let status = DatabaseClusterStatus {
        certificates: Some(certificates_status(&cluster, &report)?),
    };
    if cluster.status.as_ref() != Some(&status) {
        let api: Api<DatabaseCluster> = Api::namespaced(
            ctx.client.as_kube_client(),
            cluster.metadata.namespace.as_deref().unwrap_or_default(),
        );
        api.patch_status(
            &cluster_ref.name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": status })),
        )
        .await
        .with_context(|_| ApplyStatusSnafu {
            cluster: cluster_ref.clone(),
        })?;
    }

    Ok(controller::Action::requeue(requeue_after(
        &report,
        now,
        &ctx.config,
    )))
}

fn certificates_status(cluster: &DatabaseCluster, report: &PkiReport) -> Result<CertificatesStatus> {
    let expirations = report
        .expirations
        .iter()
        .map(|(secret, not_after)| -> Result<(String, String)> {
            let formatted = not_after
                .format(&Rfc3339)
                .with_context(|_| FormatExpirySnafu {
                    secret: secret.clone(),
                })?;
            Ok((secret.clone(), formatted))
        })
        .collect::<Result<_>>()?;
    Ok(CertificatesStatus {
        server_ca_secret: cluster.server_ca_secret_name(),
        server_tls_secret: cluster.server_tls_secret_name(),
        client_ca_secret: cluster.client_ca_secret_name(),
        replication_tls_secret: cluster.replication_tls_secret_name(),
        expirations,
    })
}

/// Wakes up when the next certificate enters its renewal window
fn requeue_after(report: &PkiReport, now: OffsetDateTime, config: &PkiConfig) -> Duration {
    report
        .next_renewal(now, config.renewal_threshold)
        .and_then(|renew_at| Duration::try_from(renew_at - now).ok())
        .unwrap_or(MAX_REQUEUE)
        .clamp(MIN_REQUEUE, MAX_REQUEUE)
}

fn error_policy(_cluster: Arc<DatabaseCluster>, error: &Error, _ctx: Arc<Ctx>) -> controller::Action {
    let kind = error.kind();
    tracing::warn!(
        error.category = error.category(),
        error.kind = %kind,
        "scheduling retry"
    );
    controller::Action::requeue(retry_delay(kind))
}

fn retry_delay(kind: ErrorKind) -> Duration {
    match kind {
        ErrorKind::ConflictError => Duration::from_secs(1),
        ErrorKind::TransientStoreError => Duration::from_secs(10),
        ErrorKind::Internal => Duration::from_secs(30),
        // Only the user can fix these, external Secrets are not watched
        ErrorKind::MissingExternalSecret => Duration::from_secs(60),
        ErrorKind::ValidationFailure => Duration::from_secs(5 * 60),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use stackable_operator::time::Duration as PkiDuration;

    use super::{certificates_status, requeue_after, retry_delay, MAX_REQUEUE, MIN_REQUEUE};
    use crate::pki::{ErrorKind, PkiConfig, PkiReport};

    fn cluster() -> crate::crd::DatabaseCluster {
        serde_yaml::from_str(
            "
            apiVersion: pki.dbcluster.tech/v1alpha1
            kind: DatabaseCluster
            metadata:
              name: pg
              namespace: db
            spec:
              certificates:
                clientCaSecret: corporate-ca
            ",
        )
        .unwrap()
    }

    #[test]
    fn requeue_follows_next_renewal() {
        let now = time::OffsetDateTime::now_utc();
        let config = PkiConfig::default();
        let mut report = PkiReport::default();
        assert_eq!(requeue_after(&report, now, &config), MAX_REQUEUE);

        report.expirations.insert(
            "pg-server".to_string(),
            now + PkiDuration::from_days_unchecked(7) + PkiDuration::from_minutes_unchecked(20),
        );
        assert_eq!(
            requeue_after(&report, now, &config),
            Duration::from_secs(20 * 60)
        );

        report.expirations.insert(
            "pg-client-ca".to_string(),
            now + PkiDuration::from_days_unchecked(7) + time::Duration::seconds(5),
        );
        assert_eq!(requeue_after(&report, now, &config), MIN_REQUEUE);
    }

    #[test]
    fn status_lists_effective_secrets() {
        let mut report = PkiReport::default();
        report.expirations.insert(
            "pg-server".to_string(),
            time::macros::datetime!(2030-01-02 03:04:05 UTC),
        );
        let status = certificates_status(&cluster(), &report).unwrap();
        assert_eq!(status.server_ca_secret, "pg-server-ca");
        assert_eq!(status.client_ca_secret, "corporate-ca");
        assert_eq!(status.server_tls_secret, "pg-server");
        assert_eq!(status.replication_tls_secret, "pg-replication");
        assert_eq!(status.expirations["pg-server"], "2030-01-02T03:04:05Z");
    }

    #[test]
    fn conflicts_are_retried_quickly() {
        assert!(retry_delay(ErrorKind::ConflictError) < retry_delay(ErrorKind::TransientStoreError));
        assert!(
            retry_delay(ErrorKind::TransientStoreError)
                < retry_delay(ErrorKind::ValidationFailure)
        );
    }
}
