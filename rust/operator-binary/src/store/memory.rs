//! In-memory [`SecretStore`] that records every write

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{self, core::ErrorResponse, runtime::reflector::ObjectRef},
};

use super::{SecretStore, StoreError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    Create(String),
    Patch(String),
}

#[derive(Default)]
pub struct MemoryStore {
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    writes: Mutex<Vec<Write>>,
    failing_creates: Mutex<BTreeSet<String>>,
    version: Mutex<u64>,
}

fn key_of(secret: &ObjectRef<Secret>) -> (String, String) {
    (
        secret.namespace.clone().unwrap_or_default(),
        secret.name.clone(),
    )
}

impl MemoryStore {
    fn next_version(&self) -> String {
        let mut version = self.version.lock().unwrap();
        *version += 1;
        version.to_string()
    }

    /// Stores a Secret without recording a write, as if it had been created by someone else
    pub fn insert(&self, mut secret: Secret) {
        secret.metadata.resource_version = Some(self.next_version());
        self.secrets
            .lock()
            .unwrap()
            .insert(key_of(&ObjectRef::from_obj(&secret)), secret);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.secrets
            .lock()
            .unwrap()
            .keys()
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    /// Makes every following attempt to create the Secret `name` fail
    pub fn fail_creates_of(&self, name: &str) {
        self.failing_creates
            .lock()
            .unwrap()
            .insert(name.to_string());
    }

    pub fn allow_creates_of(&self, name: &str) {
        self.failing_creates.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get(&self, secret: &ObjectRef<Secret>) -> Result<Option<Secret>, StoreError> {
        Ok(self.secrets.lock().unwrap().get(&key_of(secret)).cloned())
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let secret_ref = ObjectRef::from_obj(secret);
        if self.failing_creates.lock().unwrap().contains(&secret_ref.name) {
            return Err(StoreError::Request {
                source: kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: "simulated outage".to_string(),
                    reason: "InternalError".to_string(),
                    code: 500,
                }),
                secret: secret_ref,
            });
        }
        let mut secrets = self.secrets.lock().unwrap();
        let key = key_of(&secret_ref);
        if secrets.contains_key(&key) {
            return Err(StoreError::AlreadyExists { secret: secret_ref });
        }
        let mut created = secret.clone();
        created.metadata.resource_version = Some(self.next_version());
        secrets.insert(key, created.clone());
        self.writes
            .lock()
            .unwrap()
            .push(Write::Create(secret_ref.name));
        Ok(created)
    }

    async fn patch(&self, snapshot: &Secret, updated: &Secret) -> Result<Secret, StoreError> {
        let secret_ref = ObjectRef::from_obj(snapshot);
        let mut secrets = self.secrets.lock().unwrap();
        let Some(current) = secrets.get_mut(&key_of(&secret_ref)) else {
            return Err(StoreError::Conflict { secret: secret_ref });
        };
        if current.metadata.resource_version != snapshot.metadata.resource_version {
            return Err(StoreError::Conflict { secret: secret_ref });
        }
        let mut data = current.data.clone().unwrap_or_default();
        data.extend(updated.data.clone().unwrap_or_default());
        current.data = Some(data);
        current.metadata.resource_version = Some(self.next_version());
        let patched = current.clone();
        self.writes
            .lock()
            .unwrap()
            .push(Write::Patch(secret_ref.name));
        Ok(patched)
    }
}
