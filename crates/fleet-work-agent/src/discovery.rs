//! GVK to REST-mapping resolution against the member cluster.
//!
//! Wraps [`kube::Discovery`] in a refresh-on-miss cache. The cache is the
//! only piece of shared mutable state next to the override index and is
//! internally synchronized; reconciliations hold the lock only for lookups,
//! never across remote calls.

use kube::{
    Client,
    core::GroupVersionKind,
    discovery::{ApiResource, Discovery, Scope},
};
use snafu::{ResultExt, Snafu};
use tokio::sync::RwLock;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to run API discovery against the member cluster"))]
    RunDiscovery { source: kube::Error },

    /// Typically transient: the kind may be served after a CRD finishes
    /// registering.
    #[snafu(display("no API resource registered for group {group:?} version {version:?} kind {kind:?}"))]
    UnknownKind {
        group: String,
        version: String,
        kind: String,
    },
}

pub struct RestMapper {
    client: Client,
    discovery: RwLock<Option<Discovery>>,
}

impl RestMapper {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: RwLock::new(None),
        }
    }

    /// Resolves a GVK to its API resource and scope, refreshing the
    /// discovery state once on a miss.
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, Scope)> {
        if let Some(found) = self.lookup(gvk).await {
            return Ok(found);
        }

        self.refresh().await?;

        self.lookup(gvk).await.ok_or_else(|| Error::UnknownKind {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
        })
    }

    async fn lookup(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, Scope)> {
        self.discovery
            .read()
            .await
            .as_ref()
            .and_then(|discovery| discovery.resolve_gvk(gvk))
            .map(|(api_resource, capabilities)| (api_resource, capabilities.scope))
    }

    /// Re-runs discovery. Used on lookup misses and at worker startup.
    pub async fn refresh(&self) -> Result<()> {
        tracing::debug!("refreshing member cluster API discovery");

        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .context(RunDiscoverySnafu)?;
        *self.discovery.write().await = Some(discovery);

        Ok(())
    }
}
