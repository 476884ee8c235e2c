//! Builders for the objects the PKI tests operate on

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use openssl::nid::Nid;
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::{api::ObjectMeta, runtime::reflector::ObjectRef},
    time::Duration,
};
use time::OffsetDateTime;

use super::{
    ca::{SECRET_KEY_CA_CERT, SECRET_KEY_CA_KEY},
    keypair::{CaSubject, CertUsage, CertificateAuthority, KeyPair, LeafRequest, Validity},
    leaf::{SECRET_KEY_TLS_CERT, SECRET_KEY_TLS_KEY, SECRET_TYPE_TLS},
    PkiConfig, PkiContext,
};
use crate::{
    crd::{CertificatesConfiguration, DatabaseCluster, DatabaseClusterSpec},
    store::{memory::MemoryStore, SecretStore, StoreError},
};

pub const NAMESPACE: &str = "db";

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// A cluster named `pg` in the namespace [`NAMESPACE`]
pub fn cluster(certificates: Option<CertificatesConfiguration>) -> DatabaseCluster {
    let mut cluster = DatabaseCluster::new("pg", DatabaseClusterSpec { certificates });
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.uid = Some("2f3a8c1e-5d4b-4e7f-9a61-0c2d8b7e4f10".to_string());
    cluster
}

pub fn self_signed_ca(now: OffsetDateTime, lifetime: Duration) -> CertificateAuthority {
    CertificateAuthority::new_self_signed(
        &CaSubject {
            common_name: "external-ca".to_string(),
            organizational_unit: "tests".to_string(),
        },
        Validity::starting_at(now, lifetime),
    )
    .unwrap()
}

pub fn leaf(
    ca: &CertificateAuthority,
    now: OffsetDateTime,
    lifetime: Duration,
    usage: CertUsage,
) -> KeyPair {
    let alt_dns_names = vec!["pg-rw".to_string()];
    ca.sign_leaf(
        LeafRequest {
            common_name: "pg-rw",
            usage,
            alt_dns_names: &alt_dns_names,
        },
        Validity::starting_at(now, lifetime),
    )
    .unwrap()
}

fn secret(name: &str, type_: Option<&str>, data: BTreeMap<String, ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        type_: type_.map(str::to_string),
        data: Some(data),
        ..Secret::default()
    }
}

/// A CA Secret as a user would provide it, with or without the CA key
pub fn ca_secret(name: &str, ca: &CertificateAuthority, with_key: bool) -> Secret {
    let pair = ca.to_key_pair().unwrap();
    let mut data = BTreeMap::from([(
        SECRET_KEY_CA_CERT.to_string(),
        ByteString(pair.certificate),
    )]);
    if with_key {
        data.insert(
            SECRET_KEY_CA_KEY.to_string(),
            ByteString(pair.private_key.unwrap().0),
        );
    }
    secret(name, None, data)
}

pub fn tls_secret(name: &str, pair: &KeyPair) -> Secret {
    let mut data = BTreeMap::from([(
        SECRET_KEY_TLS_CERT.to_string(),
        ByteString(pair.certificate.clone()),
    )]);
    if let Some(key) = &pair.private_key {
        data.insert(SECRET_KEY_TLS_KEY.to_string(), ByteString(key.to_vec()));
    }
    secret(name, Some(SECRET_TYPE_TLS), data)
}

fn key_pair(secret: &Secret, cert_key: &str, private_key_key: &str) -> KeyPair {
    let data = secret.data.as_ref().unwrap();
    KeyPair {
        certificate: data[cert_key].0.clone(),
        private_key: data
            .get(private_key_key)
            .map(|key| crate::utils::Unloggable(key.0.clone())),
    }
}

pub fn ca_key_pair(secret: &Secret) -> KeyPair {
    key_pair(secret, SECRET_KEY_CA_CERT, SECRET_KEY_CA_KEY)
}

pub fn tls_key_pair(secret: &Secret) -> KeyPair {
    key_pair(secret, SECRET_KEY_TLS_CERT, SECRET_KEY_TLS_KEY)
}

/// Subject common name of the certificate in `pair`
pub fn common_name(pair: &KeyPair) -> String {
    let cert = pair.parse_certificate().unwrap();
    let entry = cert
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .unwrap();
    entry.data().as_utf8().unwrap().to_string()
}

/// DNS names in the subject alternative name extension of the certificate in `pair`
pub fn dns_names(pair: &KeyPair) -> Vec<String> {
    pair.parse_certificate()
        .unwrap()
        .subject_alt_names()
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.dnsname().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub fn context<'a, S: ?Sized>(
    store: &'a S,
    cluster: &'a DatabaseCluster,
    config: &'a PkiConfig,
    now: OffsetDateTime,
) -> PkiContext<'a, S> {
    PkiContext {
        store,
        cluster,
        config,
        namespace: NAMESPACE.to_string(),
        now,
    }
}

/// Pretends that the first lookup happened before another writer created the Secret
#[derive(Default)]
pub struct RacingStore {
    pub inner: MemoryStore,
    raced: AtomicBool,
}

#[async_trait]
impl SecretStore for RacingStore {
    async fn get(&self, secret: &ObjectRef<Secret>) -> Result<Option<Secret>, StoreError> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.get(secret).await
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.inner.create(secret).await
    }

    async fn patch(&self, snapshot: &Secret, updated: &Secret) -> Result<Secret, StoreError> {
        self.inner.patch(snapshot, updated).await
    }
}
