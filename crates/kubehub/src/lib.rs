//! Rewind kubehub: cluster connection, discovery and the kube-backed collaborators
//! of the undo engine.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use kube::{config::KubeConfigOptions, Client, Config};
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub mod catalog;
pub mod dryrun;
pub mod manifest;
pub mod source;

pub use catalog::{KindResolutionError, ResourceCatalog, ServedResource};
pub use dryrun::KubeDryRunVerifier;
pub use source::KubeSource;

/// Deadline applied to every single API call (`REWIND_REQUEST_TIMEOUT_SECS`, default 30).
pub fn request_timeout() -> Duration {
    let secs = std::env::var("REWIND_REQUEST_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .unwrap_or(30);
    Duration::from_secs(secs)
}

/// Await a kube call under [`request_timeout`], labelling failures with `what`.
pub async fn with_deadline<T, F>(what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    let limit = request_timeout();
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res.with_context(|| what.to_string()),
        Err(_) => Err(anyhow!("{}: timed out after {}s", what, limit.as_secs())),
    }
}

/// A connected cluster plus the discovery cache shared by its collaborators.
#[derive(Clone)]
pub struct Cluster {
    client: Client,
    default_namespace: String,
    catalog: Arc<OnceCell<ResourceCatalog>>,
}

impl Cluster {
    /// Connect using the given kubeconfig context, or the inferred config
    /// (in-cluster env or current context) when `context` is `None`.
    pub async fn connect(context: Option<&str>) -> Result<Self> {
        let config = match context {
            Some(ctx) => {
                let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
                Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kubeconfig context {ctx:?}"))?
            }
            None => Config::infer().await.context("inferring kube config")?,
        };
        let default_namespace = config.default_namespace.clone();
        info!(cluster_url = %config.cluster_url, namespace = %default_namespace, "kube config loaded");
        let client = Client::try_from(config).context("building kube client")?;
        Ok(Self::from_client(client, default_namespace))
    }

    pub fn from_client(client: Client, default_namespace: impl Into<String>) -> Self {
        Self { client, default_namespace: default_namespace.into(), catalog: Arc::new(OnceCell::new()) }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    pub fn source(&self) -> KubeSource {
        KubeSource::new(self.client.clone(), self.catalog.clone())
    }

    pub fn dry_run_verifier(&self) -> KubeDryRunVerifier {
        KubeDryRunVerifier::new(self.client.clone(), self.catalog.clone())
    }
}

/// Run discovery once per cluster handle.
pub(crate) async fn shared_catalog<'a>(client: &Client, cell: &'a OnceCell<ResourceCatalog>) -> Result<&'a ResourceCatalog, KindResolutionError> {
    cell.get_or_try_init(|| async {
        debug!("running API discovery");
        ResourceCatalog::discover(client.clone()).await
    })
    .await
}
