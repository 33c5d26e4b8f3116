//! Reads Secrets through two caches.
//!
//! Secrets that cert-manager owns are cached in full. All other Secrets are only cached by their
//! metadata, which keeps memory use bounded in clusters with many unrelated (and potentially
//! large) Secrets. Reading one of those means going back to the API server.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    sync::Arc,
};

use async_trait::async_trait;
use snafu::{ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        api::PartialObjectMeta,
        runtime::reflector::{self, ObjectRef},
        Resource,
    },
};
use tokio::time::{error::Elapsed, timeout_at, Instant};
use tracing::{debug, warn};

use crate::crd::PART_OF_CERT_MANAGER_LABEL;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {secret} from the API server"))]
    LiveGet {
        source: Box<dyn std::error::Error + Send + Sync>,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("timed out getting {secret} from the API server"))]
    LiveGetTimeout {
        source: Elapsed,
        secret: ObjectRef<Secret>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    Equals { key: String, value: String },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals { key, value } => labels.get(key) == Some(value),
            Requirement::Exists { key } => labels.contains_key(key),
            Requirement::DoesNotExist { key } => !labels.contains_key(key),
        }
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals { key, value } => write!(f, "{key}={value}"),
            Requirement::Exists { key } => f.write_str(key),
            Requirement::DoesNotExist { key } => write!(f, "!{key}"),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches every object.
///
/// Renders in the query syntax of the API server, so it can also be handed to a watcher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector(Vec<Requirement>);

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push(Requirement::Equals {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.0.push(Requirement::Exists { key: key.into() });
        self
    }

    pub fn does_not_exist(mut self, key: impl Into<String>) -> Self {
        self.0.push(Requirement::DoesNotExist { key: key.into() });
        self
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let empty = BTreeMap::new();
        let labels = labels.unwrap_or(&empty);
        self.0.iter().all(|requirement| requirement.matches(labels))
    }
}

impl Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, requirement) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{requirement}")?;
        }
        Ok(())
    }
}

/// Decides which cache a Secret belongs in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretSelectors {
    /// Secrets cached in full.
    pub owned: LabelSelector,
    /// Secrets cached by metadata only.
    pub unowned: LabelSelector,
}

impl SecretSelectors {
    /// Splits Secrets on the label that cert-manager puts on every Secret it is a part of.
    pub fn part_of_cert_manager() -> Self {
        Self {
            owned: LabelSelector::everything().equals(PART_OF_CERT_MANAGER_LABEL, "true"),
            unowned: LabelSelector::everything().does_not_exist(PART_OF_CERT_MANAGER_LABEL),
        }
    }
}

/// A local, eventually consistent index of objects.
pub trait ObjectCache<K>: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;

    fn list(&self, namespace: &str) -> Vec<Arc<K>>;
}

impl<K> ObjectCache<K> for reflector::Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        reflector::Store::get(self, &ObjectRef::new(name).within(namespace))
    }

    fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.state()
            .into_iter()
            .filter(|obj| obj.meta().namespace.as_deref() == Some(namespace))
            .collect()
    }
}

/// Reads a single Secret from the API server, bypassing every cache.
#[async_trait]
pub trait SecretSource: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, Self::Error>;
}

#[async_trait]
impl SecretSource for stackable_operator::client::Client {
    type Error = stackable_operator::client::Error;

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, Self::Error> {
        self.get_opt::<Secret>(name, namespace).await
    }
}

/// Answers Secret reads from a typed cache and a metadata-only cache.
///
/// A Secret that is only known by its metadata is read from the API server. A Secret found in
/// both caches means that one of them is stale. That is logged, and the API server wins.
pub struct FilteredSecretLister<T, M, S> {
    typed: T,
    metadata: M,
    source: S,
    selectors: SecretSelectors,
}

impl<T, M, S> FilteredSecretLister<T, M, S>
where
    T: ObjectCache<Secret>,
    M: ObjectCache<PartialObjectMeta<Secret>>,
    S: SecretSource,
{
    pub fn new(typed: T, metadata: M, source: S, selectors: SecretSelectors) -> Self {
        Self {
            typed,
            metadata,
            source,
            selectors,
        }
    }

    pub fn selectors(&self) -> &SecretSelectors {
        &self.selectors
    }

    /// Gets a single Secret, or `None` if it does not exist.
    ///
    /// API server reads are abandoned once `deadline` passes.
    pub async fn get(
        &self,
        namespace: &str,
        name: &str,
        deadline: Instant,
    ) -> Result<Option<Secret>> {
        let typed = self
            .typed
            .get(namespace, name)
            .filter(|secret| self.selectors.owned.matches(secret.metadata.labels.as_ref()));
        let partial = self
            .metadata
            .get(namespace, name)
            .filter(|meta| self.selectors.unowned.matches(meta.metadata.labels.as_ref()));
        if partial.is_none() {
            return Ok(typed.map(|secret| Secret::clone(&secret)));
        }

        let secret = ObjectRef::<Secret>::new(name).within(namespace);
        if typed.is_some() {
            warn!(
                %secret,
                "possible internal error: stale cache: secret found both in typed cache and in partial cache"
            );
        }
        self.live_get(&secret, deadline).await
    }

    /// Lists the Secrets in `namespace` that match `selector`, ordered by name.
    ///
    /// API server reads are abandoned once `deadline` passes.
    pub async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        deadline: Instant,
    ) -> Result<Vec<Secret>> {
        let mut secrets = self
            .typed
            .list(namespace)
            .into_iter()
            .filter(|secret| {
                let labels = secret.metadata.labels.as_ref();
                self.selectors.owned.matches(labels) && selector.matches(labels)
            })
            .map(|secret| {
                (
                    secret.metadata.name.clone().unwrap_or_default(),
                    Secret::clone(&secret),
                )
            })
            .collect::<BTreeMap<_, _>>();

        for partial in self.metadata.list(namespace) {
            let labels = partial.metadata.labels.as_ref();
            if !self.selectors.unowned.matches(labels) || !selector.matches(labels) {
                continue;
            }
            let Some(name) = partial.metadata.name.clone() else {
                continue;
            };
            let secret = ObjectRef::<Secret>::new(&name).within(namespace);
            if secrets.remove(&name).is_some() {
                warn!(
                    %secret,
                    "possible internal error: stale cache: secret found both in typed cache and in partial cache"
                );
            }
            match self.live_get(&secret, deadline).await? {
                Some(live) => {
                    secrets.insert(name, live);
                }
                None => debug!(%secret, "secret was deleted since it was cached, skipping"),
            }
        }
        Ok(secrets.into_values().collect())
    }

    async fn live_get(
        &self,
        secret: &ObjectRef<Secret>,
        deadline: Instant,
    ) -> Result<Option<Secret>> {
        let namespace = secret.namespace.as_deref().unwrap_or_default();
        timeout_at(deadline, self.source.get_secret(namespace, &secret.name))
            .await
            .context(LiveGetTimeoutSnafu {
                secret: secret.clone(),
            })?
            .boxed()
            .context(LiveGetSnafu {
                secret: secret.clone(),
            })
    }
}
