//! File-backed endpoint resolution.
//!
//! The inventory describes services (a label selector plus exposed ports) and
//! the instances backing them. Resolving a mapping target picks a ready
//! instance selected by the service and translates the service port into the
//! instance's container port.
//!
//! ```yaml
//! services:
//!   - namespace: dev
//!     name: my-svc
//!     selector: { app: my-svc }
//!     ports:
//!       - { name: http, port: 80, target_port: 8081 }
//! instances:
//!   - namespace: dev
//!     name: pod-xyz
//!     labels: { app: my-svc }
//!     ready: true
//!     address: 10.0.0.7:7443
//!     fingerprint: "ab12..."
//!     ports:
//!       - { name: http, container_port: 8081 }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use podlink_forward::{BackendIdentity, EndpointResolver, ResolutionError, Target};
use podlink_transport::{ATTR_TUNNEL_ADDRESS, ATTR_TUNNEL_FINGERPRINT};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
    pub namespace: String,
    pub name: String,
    /// An empty selector selects every instance in the namespace.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicePort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub target_port: Option<TargetPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TargetPort {
    Number(u16),
    Name(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ready: bool,
    /// Relay address, `host:port`.
    #[serde(default)]
    pub address: Option<String>,
    /// Hex SHA-256 of the relay certificate.
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerPort {
    #[serde(default)]
    pub name: Option<String>,
    pub container_port: u16,
}

impl Service {
    fn selects(&self, instance: &Instance) -> bool {
        instance.namespace == self.namespace
            && self
                .selector
                .iter()
                .all(|(key, value)| instance.labels.get(key) == Some(value))
    }
}

impl Inventory {
    pub fn parse(content: &str) -> Result<Self, ResolutionError> {
        serde_yaml::from_str(content)
            .map_err(|e| ResolutionError::Unavailable(format!("malformed inventory: {e}")))
    }

    /// Pick the first ready instance behind `target` and the port to dial on it.
    pub fn select(&self, target: &Target) -> Result<BackendIdentity, ResolutionError> {
        let service = self
            .services
            .iter()
            .find(|s| s.namespace == target.namespace && s.name == target.name)
            .ok_or_else(|| {
                ResolutionError::NotFound(format!(
                    "service {}/{} does not exist",
                    target.namespace, target.name
                ))
            })?;

        let service_port = service
            .ports
            .iter()
            .find(|p| p.port == target.port)
            .ok_or_else(|| {
                ResolutionError::NotFound(format!(
                    "service {}/{} does not expose port {}",
                    target.namespace, target.name, target.port
                ))
            })?;

        let instance = self
            .instances
            .iter()
            .find(|i| i.ready && service.selects(i))
            .ok_or_else(|| {
                ResolutionError::NotFound(format!(
                    "no ready instance for service {}/{}",
                    target.namespace, target.name
                ))
            })?;

        let port = container_port(service_port, instance)?;

        let mut backend = BackendIdentity::new(&instance.namespace, &instance.name, port);
        if let Some(address) = &instance.address {
            backend = backend.with_attribute(ATTR_TUNNEL_ADDRESS, address);
        }
        if let Some(fingerprint) = &instance.fingerprint {
            backend = backend.with_attribute(ATTR_TUNNEL_FINGERPRINT, fingerprint);
        }
        Ok(backend)
    }
}

fn container_port(service_port: &ServicePort, instance: &Instance) -> Result<u16, ResolutionError> {
    match &service_port.target_port {
        None => Ok(service_port.port),
        Some(TargetPort::Number(port)) => Ok(*port),
        Some(TargetPort::Name(name)) => instance
            .ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .map(|p| p.container_port)
            .ok_or_else(|| {
                ResolutionError::NotFound(format!(
                    "instance {}/{} has no container port named '{name}'",
                    instance.namespace, instance.name
                ))
            }),
    }
}

/// Resolves targets against an inventory file.
///
/// Never blocks waiting for an instance to become ready: a target with no
/// ready instance fails with [`ResolutionError::NotFound`] and the session's
/// retry policy decides when to look again. The file is re-read on every
/// call, so edits are picked up on the next reconnect.
pub struct InventoryResolver {
    path: PathBuf,
}

impl InventoryResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EndpointResolver for InventoryResolver {
    async fn resolve(&self, target: &Target) -> Result<BackendIdentity, ResolutionError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ResolutionError::Unavailable(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let backend = Inventory::parse(&content)?.select(target)?;
        debug!(%target, %backend, "resolved from inventory");
        Ok(backend)
    }
}
