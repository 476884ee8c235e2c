//! Access to the [`Secret`]s that hold the TLS material

use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        self,
        api::{ObjectMeta, Patch, PatchParams, PostParams},
        runtime::reflector::ObjectRef,
        Api,
    },
};

#[cfg(test)]
pub mod memory;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("{secret} already exists"))]
    AlreadyExists { secret: ObjectRef<Secret> },

    #[snafu(display("{secret} has been modified since it was read"))]
    Conflict { secret: ObjectRef<Secret> },

    #[snafu(display("request for {secret} failed"))]
    Request {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },
}

/// The object store holding the persisted TLS material
///
/// Implementations must not retry on their own, errors are classified and handed back
/// to the reconciler.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns `None` if the Secret does not exist
    async fn get(&self, secret: &ObjectRef<Secret>) -> Result<Option<Secret>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] if a Secret with the same name exists
    async fn create(&self, secret: &Secret) -> Result<Secret, StoreError>;

    /// Replaces the data of `snapshot` with the data of `updated`
    ///
    /// Fails with [`StoreError::Conflict`] if the Secret has been modified after `snapshot` was read.
    async fn patch(&self, snapshot: &Secret, updated: &Secret) -> Result<Secret, StoreError>;
}

/// [`SecretStore`] backed by the Kubernetes API
pub struct KubeSecretStore {
    client: stackable_operator::client::Client,
}

impl KubeSecretStore {
    pub fn new(client: stackable_operator::client::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: Option<&str>) -> Api<Secret> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.as_kube_client(), ns),
            None => Api::default_namespaced(self.client.as_kube_client()),
        }
    }
}

fn classify(source: kube::Error, secret: ObjectRef<Secret>) -> StoreError {
    match &source {
        kube::Error::Api(response) if response.code == 409 => {
            if response.reason == "AlreadyExists" {
                StoreError::AlreadyExists { secret }
            } else {
                StoreError::Conflict { secret }
            }
        }
        _ => StoreError::Request { source, secret },
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, secret: &ObjectRef<Secret>) -> Result<Option<Secret>, StoreError> {
        self.api(secret.namespace.as_deref())
            .get_opt(&secret.name)
            .await
            .map_err(|err| classify(err, secret.clone()))
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.api(secret.metadata.namespace.as_deref())
            .create(&PostParams::default(), secret)
            .await
            .map_err(|err| classify(err, ObjectRef::from_obj(secret)))
    }

    async fn patch(&self, snapshot: &Secret, updated: &Secret) -> Result<Secret, StoreError> {
        let secret_ref = ObjectRef::from_obj(snapshot);
        // The resourceVersion turns the merge patch into a compare-and-swap
        let patch = Secret {
            metadata: ObjectMeta {
                resource_version: snapshot.metadata.resource_version.clone(),
                ..ObjectMeta::default()
            },
            data: updated.data.clone(),
            ..Secret::default()
        };
        self.api(secret_ref.namespace.as_deref())
            .patch(&secret_ref.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|err| classify(err, secret_ref))
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::{
        k8s_openapi::api::core::v1::Secret,
        kube::{self, core::ErrorResponse, runtime::reflector::ObjectRef},
    };

    use super::{classify, StoreError};

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("simulated {reason}"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn api_errors_are_classified() {
        let secret = ObjectRef::<Secret>::new("pg-server-ca").within("db");
        assert!(matches!(
            classify(api_error(409, "AlreadyExists"), secret.clone()),
            StoreError::AlreadyExists { .. }
        ));
        assert!(matches!(
            classify(api_error(409, "Conflict"), secret.clone()),
            StoreError::Conflict { .. }
        ));
        assert!(matches!(
            classify(api_error(403, "Forbidden"), secret),
            StoreError::Request { .. }
        ));
    }
}
