//! Select and connect the configured driver.

use std::sync::Arc;

use arena_core::config::{ContainerProviderConfig, ContainerProviderType};
use arena_core::{ContainerManager, Result};

use crate::docker::{BollardDocker, DockerDriver};
use crate::kubernetes::{KubeClient, KubernetesDriver};
use crate::swarm::{BollardSwarm, SwarmDriver};

/// Build the driver named by `config.provider`, verifying the backend is reachable.
pub async fn build_manager(config: &ContainerProviderConfig) -> Result<Arc<dyn ContainerManager>> {
    let manager: Arc<dyn ContainerManager> = match config.provider {
        ContainerProviderType::Docker => {
            let api = BollardDocker::connect(config.docker.uri.as_deref())?;
            api.ping().await?;
            Arc::new(DockerDriver::new(Arc::new(api), config.clone()))
        }
        ContainerProviderType::Swarm => {
            let docker = BollardDocker::connect(config.docker.uri.as_deref())?;
            docker.ping().await?;
            let api = BollardSwarm::from_client(docker.client().clone());
            Arc::new(SwarmDriver::new(Arc::new(api), config.clone()))
        }
        ContainerProviderType::Kubernetes => {
            let client = KubeClient::connect(&config.kubernetes).await?;
            client.bootstrap(&config.registries).await?;
            tracing::debug!(namespace = %client.namespace(), "Kubernetes namespace ready");
            Arc::new(KubernetesDriver::new(Arc::new(client), config.clone()))
        }
    };

    tracing::info!(
        provider = config.provider.as_str(),
        port_mapping = ?config.port_mapping,
        public_entry = %config.public_entry,
        "Container manager initialized"
    );
    Ok(manager)
}
