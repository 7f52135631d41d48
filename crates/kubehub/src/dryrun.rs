use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use kube::{discovery::verbs, Client};
use rewind_core::Gvk;
use rewind_undo::DryRunVerifier;
use tokio::sync::OnceCell;

use crate::{shared_catalog, ResourceCatalog};

/// Server dry-run is possible when the exact kind is served and patchable.
pub struct KubeDryRunVerifier {
    client: Client,
    catalog: Arc<OnceCell<ResourceCatalog>>,
}

impl KubeDryRunVerifier {
    pub fn new(client: Client, catalog: Arc<OnceCell<ResourceCatalog>>) -> Self {
        Self { client, catalog }
    }
}

#[async_trait]
impl DryRunVerifier for KubeDryRunVerifier {
    async fn has_support(&self, gvk: &Gvk) -> Result<()> {
        let catalog = shared_catalog(&self.client, &self.catalog).await?;
        check_support(catalog, gvk)
    }
}

pub(crate) fn check_support(catalog: &ResourceCatalog, gvk: &Gvk) -> Result<()> {
    let served = catalog.find(gvk).ok_or_else(|| anyhow!("{} is not served by the cluster", gvk.key()))?;
    if !served.supports(verbs::PATCH) {
        return Err(anyhow!("{} does not support server-side dry-run patches", gvk.key()));
    }
    Ok(())
}
