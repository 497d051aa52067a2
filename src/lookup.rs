use std::{net::Ipv4Addr, path::Path};

use ahash::RandomState;
use async_trait::async_trait;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
pub enum LookupError {
    #[error("unknown session")]
    UnknownSession,
    #[error("unknown instance")]
    UnknownInstance,
    #[error("unknown alias")]
    UnknownAlias,
    #[error("error reading routes file: {0}")]
    RoutesFile(#[from] std::io::Error),
    #[error("error parsing routes file: {0}")]
    RoutesFormat(#[from] serde_json::Error),
}

/// Where an instance's SSH service lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
}

// Read-only view over the session/instance storage. The fabric only ever
// asks "where does this identity live right now"; creating, deleting, and
// health-checking instances is the storage owner's problem.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceLookup: Send + Sync {
    /// Resolve a (session, instance address) pair to a live network address
    /// and the instance's default service port.
    async fn resolve_by_address(
        &self,
        session_id: &str,
        instance_address: &str,
    ) -> Result<(String, u16), LookupError>;

    /// Resolve an (alias, session prefix) pair to a live instance address.
    async fn resolve_by_alias(
        &self,
        alias: &str,
        session_prefix: &str,
    ) -> Result<String, LookupError>;

    /// Resolve a (session prefix, instance IP) pair to the instance's SSH
    /// endpoint.
    async fn resolve_ssh_target(
        &self,
        session_prefix: &str,
        instance_ip: Ipv4Addr,
    ) -> Result<SshEndpoint, LookupError>;
}

#[async_trait]
impl<T: InstanceLookup + ?Sized> InstanceLookup for std::sync::Arc<T> {
    async fn resolve_by_address(
        &self,
        session_id: &str,
        instance_address: &str,
    ) -> Result<(String, u16), LookupError> {
        (**self).resolve_by_address(session_id, instance_address).await
    }

    async fn resolve_by_alias(
        &self,
        alias: &str,
        session_prefix: &str,
    ) -> Result<String, LookupError> {
        (**self).resolve_by_alias(alias, session_prefix).await
    }

    async fn resolve_ssh_target(
        &self,
        session_prefix: &str,
        instance_ip: Ipv4Addr,
    ) -> Result<SshEndpoint, LookupError> {
        (**self).resolve_ssh_target(session_prefix, instance_ip).await
    }
}

#[derive(Debug, Clone, Deserialize)]
struct InstanceEntry {
    address: String,
    // Dial target when it differs from the overlay address (e.g. a node IP).
    #[serde(default)]
    host: Option<String>,
    #[serde(default = "default_service_port")]
    port: u16,
    #[serde(default = "default_ssh_port")]
    ssh_port: u16,
}

fn default_service_port() -> u16 {
    80
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Deserialize)]
struct SessionEntry {
    id: String,
    #[serde(default)]
    aliases: Vec<AliasEntry>,
    instances: Vec<InstanceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AliasEntry {
    alias: String,
    address: String,
}

/// In-memory lookup table, optionally seeded from a JSON routes file. Stands
/// in for the session storage in deployments and tests; production setups
/// are expected to inject their own [`InstanceLookup`].
#[derive(Default)]
pub struct MemoryLookup {
    // (session id, instance address) -> (dial host, default port)
    by_address: DashMap<(String, String), (String, u16), RandomState>,
    // (alias, session prefix) -> instance address
    by_alias: DashMap<(String, String), String, RandomState>,
    // (session prefix, instance ip) -> ssh endpoint
    ssh_targets: DashMap<(String, Ipv4Addr), SshEndpoint, RandomState>,
}

impl MemoryLookup {
    pub fn from_routes_file(path: &Path) -> Result<Self, LookupError> {
        let contents = std::fs::read_to_string(path)?;
        let sessions: Vec<SessionEntry> = serde_json::from_str(&contents)?;
        let lookup = MemoryLookup::default();
        for session in sessions {
            for instance in &session.instances {
                lookup.add_instance(
                    &session.id,
                    &instance.address,
                    instance.host.as_deref().unwrap_or(&instance.address),
                    instance.port,
                    instance.ssh_port,
                );
            }
            for alias in &session.aliases {
                lookup.add_alias(&session.id, &alias.alias, &alias.address);
            }
        }
        Ok(lookup)
    }

    // Sessions are keyed by their full token; the SSH and alias families key
    // by its first eight characters.
    fn session_prefix(session_id: &str) -> String {
        session_id.chars().take(8).collect()
    }

    pub fn add_instance(
        &self,
        session_id: &str,
        instance_address: &str,
        dial_host: &str,
        port: u16,
        ssh_port: u16,
    ) {
        self.by_address.insert(
            (session_id.into(), instance_address.into()),
            (dial_host.into(), port),
        );
        if let Ok(ip) = instance_address.parse::<Ipv4Addr>() {
            self.ssh_targets.insert(
                (Self::session_prefix(session_id), ip),
                SshEndpoint {
                    host: dial_host.into(),
                    port: ssh_port,
                },
            );
        }
    }

    pub fn add_alias(&self, session_id: &str, alias: &str, instance_address: &str) {
        self.by_alias.insert(
            (alias.into(), Self::session_prefix(session_id)),
            instance_address.into(),
        );
    }
}

#[async_trait]
impl InstanceLookup for MemoryLookup {
    async fn resolve_by_address(
        &self,
        session_id: &str,
        instance_address: &str,
    ) -> Result<(String, u16), LookupError> {
        self.by_address
            .get(&(session_id.to_owned(), instance_address.to_owned()))
            .map(|entry| entry.value().clone())
            .ok_or(LookupError::UnknownInstance)
    }

    async fn resolve_by_alias(
        &self,
        alias: &str,
        session_prefix: &str,
    ) -> Result<String, LookupError> {
        self.by_alias
            .get(&(alias.to_owned(), session_prefix.to_owned()))
            .map(|entry| entry.value().clone())
            .ok_or(LookupError::UnknownAlias)
    }

    async fn resolve_ssh_target(
        &self,
        session_prefix: &str,
        instance_ip: Ipv4Addr,
    ) -> Result<SshEndpoint, LookupError> {
        self.ssh_targets
            .get(&(session_prefix.to_owned(), instance_ip))
            .map(|entry| entry.value().clone())
            .ok_or(LookupError::UnknownInstance)
    }
}
