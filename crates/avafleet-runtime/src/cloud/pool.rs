use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::debug;

use avafleet_core::config::CommandOptions;
use avafleet_core::node::CloudService;

use super::CloudProvider;
use super::aws::AwsProvider;
use super::gcp::GcpProvider;

/// Builds a provider client for one (cloud, region).
pub type ProviderFactory =
    Arc<dyn Fn(CloudService, &str) -> Result<Arc<dyn CloudProvider>> + Send + Sync>;

/// Per-region provider clients, created once per region under a single lock
/// and shared read-only by every task of a command invocation.
#[derive(Clone)]
pub struct RegionPool {
    factory: ProviderFactory,
    clients: Arc<Mutex<HashMap<(CloudService, String), Arc<dyn CloudProvider>>>>,
}

impl RegionPool {
    pub fn new(factory: ProviderFactory) -> Self {
        Self {
            factory,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Pool backed by the vendor CLIs, configured from the command options.
    pub fn from_options(opts: &CommandOptions) -> Self {
        let profile = opts.aws_profile.clone();
        let project = opts.gcp_project.clone();
        let credentials = opts.gcp_credentials_file.clone();
        Self::new(Arc::new(move |cloud: CloudService, region: &str| {
            let provider: Arc<dyn CloudProvider> = match cloud {
                CloudService::Aws => Arc::new(AwsProvider::new(&profile, region)),
                CloudService::Gcp => {
                    if project.is_empty() {
                        anyhow::bail!("GCP project is not configured; set [gcp] project in settings");
                    }
                    Arc::new(GcpProvider::new(&project, region, &credentials))
                }
                CloudService::None => anyhow::bail!("Node has no cloud service"),
            };
            Ok(provider)
        }))
    }

    /// The client for a region, creating it on first use.
    pub async fn get(&self, cloud: CloudService, region: &str) -> Result<Arc<dyn CloudProvider>> {
        let mut clients = self.clients.lock().await;
        let key = (cloud, region.to_string());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        debug!(%cloud, region, "Creating cloud client");
        let client = (self.factory)(cloud, region)?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Create every client a fleet operation will need before it fans out.
    pub async fn prepare(&self, keys: &[(CloudService, String)]) -> Result<()> {
        for (cloud, region) in keys {
            self.get(*cloud, region).await?;
        }
        Ok(())
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::mock::FakeCloud;

    fn counting_pool(created: Arc<AtomicUsize>) -> RegionPool {
        RegionPool::new(Arc::new(move |cloud: CloudService, region: &str| {
            created.fetch_add(1, Ordering::SeqCst);
            let fake = match cloud {
                CloudService::Gcp => FakeCloud::gcp(region),
                _ => FakeCloud::aws(region),
            };
            Ok(Arc::new(fake) as Arc<dyn CloudProvider>)
        }))
    }

    #[tokio::test]
    async fn test_client_created_once_per_region() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(created.clone());
        let a = pool.get(CloudService::Aws, "us-east-1").await.unwrap();
        let b = pool.get(CloudService::Aws, "us-east-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        pool.get(CloudService::Aws, "eu-west-1").await.unwrap();
        pool.get(CloudService::Gcp, "us-east-1").await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.client_count().await, 3);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_creates_one_client() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(created.clone());
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let pool = pool.clone();
            set.spawn(async move { pool.get(CloudService::Aws, "us-east-1").await.map(|_| ()) });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gcp_requires_project() {
        let pool = RegionPool::from_options(&CommandOptions::default());
        let err = pool.get(CloudService::Gcp, "us-east1-b").await.err().unwrap();
        assert!(format!("{}", err).contains("GCP project"));
        assert!(pool.get(CloudService::None, "x").await.is_err());
    }
}
