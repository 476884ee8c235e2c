use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

/// Name of the database user that streaming replicas authenticate as
pub const STREAMING_REPLICATION_USER: &str = "streaming_replica";

const CLUSTER_DOMAIN: &str = "cluster.local";

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "pki.dbcluster.tech",
    version = "v1alpha1",
    kind = "DatabaseCluster",
    namespaced,
    status = "DatabaseClusterStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterSpec {
    /// Where the TLS material of the cluster comes from.
    /// Slots that are left empty are generated and renewed by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<CertificatesConfiguration>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificatesConfiguration {
    /// Secret containing the CA (`ca.crt`, optionally `ca.key`) that issued the server certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ca_secret: Option<String>,

    /// Secret of type `kubernetes.io/tls` holding the server certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_tls_secret: Option<String>,

    /// Secret containing the CA (`ca.crt`, optionally `ca.key`) used to authenticate clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca_secret: Option<String>,

    /// Secret of type `kubernetes.io/tls` holding the client certificate of the streaming replication user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_tls_secret: Option<String>,

    /// Extra DNS names the generated server certificate should be valid for
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_alt_dns_names: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<CertificatesStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificatesStatus {
    pub server_ca_secret: String,
    pub server_tls_secret: String,
    pub client_ca_secret: String,
    pub replication_tls_secret: String,
    /// Expiry of every certificate in use, keyed by the name of its Secret
    #[serde(default)]
    pub expirations: BTreeMap<String, String>,
}

/// Who owns the contents of a certificate slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertificateSource {
    /// Generated and renewed by the operator
    AutoManaged { secret_name: String },
    /// Provided by the user, only ever read and validated
    ExternallySupplied { secret_name: String },
}

impl CertificateSource {
    fn resolve(configured: Option<&str>, default_name: String) -> Self {
        match configured.filter(|name| !name.is_empty()) {
            Some(name) => CertificateSource::ExternallySupplied {
                secret_name: name.to_string(),
            },
            None => CertificateSource::AutoManaged {
                secret_name: default_name,
            },
        }
    }

    pub fn secret_name(&self) -> &str {
        match self {
            CertificateSource::AutoManaged { secret_name }
            | CertificateSource::ExternallySupplied { secret_name } => secret_name,
        }
    }

    pub fn is_auto_managed(&self) -> bool {
        matches!(self, CertificateSource::AutoManaged { .. })
    }
}

/// The CA and leaf slot that belong to one trust role
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleSources {
    pub ca: CertificateSource,
    pub leaf: CertificateSource,
}

/// [`CertificateSource`]s of all slots, resolved once per reconciliation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateSources {
    pub server: RoleSources,
    pub client: RoleSources,
}

impl DatabaseCluster {
    fn cluster_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn certificate_config(&self) -> Option<&CertificatesConfiguration> {
        self.spec.certificates.as_ref()
    }

    pub fn server_ca_secret_name(&self) -> String {
        self.certificate_sources().server.ca.secret_name().to_string()
    }

    pub fn client_ca_secret_name(&self) -> String {
        self.certificate_sources().client.ca.secret_name().to_string()
    }

    pub fn server_tls_secret_name(&self) -> String {
        self.certificate_sources().server.leaf.secret_name().to_string()
    }

    pub fn replication_tls_secret_name(&self) -> String {
        self.certificate_sources().client.leaf.secret_name().to_string()
    }

    pub fn certificate_sources(&self) -> CertificateSources {
        let name = self.cluster_name();
        let config = self.certificate_config().cloned().unwrap_or_default();
        CertificateSources {
            server: RoleSources {
                ca: CertificateSource::resolve(
                    config.server_ca_secret.as_deref(),
                    format!("{name}-server-ca"),
                ),
                leaf: CertificateSource::resolve(
                    config.server_tls_secret.as_deref(),
                    format!("{name}-server"),
                ),
            },
            client: RoleSources {
                ca: CertificateSource::resolve(
                    config.client_ca_secret.as_deref(),
                    format!("{name}-client-ca"),
                ),
                leaf: CertificateSource::resolve(
                    config.replication_tls_secret.as_deref(),
                    format!("{name}-replication"),
                ),
            },
        }
    }

    /// Name of the Service that always routes to the primary instance
    pub fn service_read_write_name(&self) -> String {
        format!("{}-rw", self.cluster_name())
    }

    fn service_names(&self) -> [String; 3] {
        let name = self.cluster_name();
        [
            self.service_read_write_name(),
            format!("{name}-r"),
            format!("{name}-ro"),
        ]
    }

    /// All DNS names the server certificate has to be valid for
    pub fn alt_dns_names(&self) -> Vec<String> {
        let namespace = self.metadata.namespace.as_deref().unwrap_or_default();
        let mut names = Vec::new();
        for service in self.service_names() {
            names.push(service.clone());
            names.push(format!("{service}.{namespace}"));
            names.push(format!("{service}.{namespace}.svc"));
            names.push(format!("{service}.{namespace}.svc.{CLUSTER_DOMAIN}"));
        }
        if let Some(config) = self.certificate_config() {
            names.extend(config.server_alt_dns_names.iter().cloned());
        }
        names
    }
}
