use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::cli::CliConfig;
use super::constants::{
    CONFIG_FILE_NAME, DEFAULT_HEARTBEAT_MS, DEFAULT_HOST, DEFAULT_IDLE_MASTER_TOPIC_TIMEOUT_SECS,
    DEFAULT_MAX_DELETE_COUNT, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_SUBSCRIBER_COUNT,
    DEFAULT_NODE_FAIL_AFTER, DEFAULT_PORT, DEFAULT_SESSION_QUEUE_LEN, DEFAULT_VOTE_AFTER,
    ENV_HOSTNAME,
};
use crate::data::StoreBackendType;
use crate::domain::RuntimeConfig;
use crate::domain::cluster::ClusterSpec;
use crate::domain::cluster::failover::FailoverConfig;

// =============================================================================
// File Config Structs (JSON deserialization)
// =============================================================================

/// Server configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Topic sizing section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TopicsFileConfig {
    /// Seconds an idle master topic stays loaded
    pub idle_master_topic_timeout_secs: Option<u64>,
    pub max_subscriber_count: Option<usize>,
    pub max_message_size: Option<usize>,
    pub default_max_delete_count: Option<usize>,
    /// Outbound messages queued per client session
    pub session_queue_len: Option<usize>,
}

/// Tag namespace policy section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TagsFileConfig {
    /// Namespaces only root may add or remove
    pub restricted_namespaces: Option<Vec<String>>,
    /// Namespaces hidden from discovery
    pub masked_namespaces: Option<Vec<String>>,
}

/// Store section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StoreFileConfig {
    pub backend: Option<StoreBackendType>,
}

/// Push section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PushFileConfig {
    /// Adapter names to enable; `log` is always available
    pub adapters: Option<Vec<String>>,
}

/// Failover section (nested under cluster)
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FailoverFileConfig {
    pub enabled: Option<bool>,
    pub heartbeat_ms: Option<u64>,
    pub vote_after: Option<u32>,
    pub node_fail_after: Option<u32>,
}

/// Cluster section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ClusterFileConfig {
    /// Name of this node; overridden by HOSTNAME in container environments
    #[serde(rename = "self")]
    pub self_name: Option<String>,
    pub nodes: Option<Vec<String>>,
    pub failover: Option<FailoverFileConfig>,
}

/// Root config file structure
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileConfig {
    pub server: Option<ServerFileConfig>,
    pub topics: Option<TopicsFileConfig>,
    pub tags: Option<TagsFileConfig>,
    pub store: Option<StoreFileConfig>,
    pub push: Option<PushFileConfig>,
    pub cluster: Option<ClusterFileConfig>,
}

// =============================================================================
// Resolved configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub self_name: String,
    pub nodes: Vec<String>,
    pub failover: Option<FailoverConfig>,
}

/// Fully resolved application configuration. Precedence: CLI flags (which
/// clap also feeds from env vars) over config file over built-in defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub topics: RuntimeConfig,
    pub store_backend: StoreBackendType,
    pub push_adapters: Vec<String>,
    pub cluster: Option<ClusterConfig>,
}

impl AppConfig {
    pub fn load(cli: &CliConfig) -> Result<AppConfig> {
        let file = Self::read_file(cli.config.clone())?;

        let server_file = file.server.unwrap_or_default();
        let server = ServerConfig {
            host: cli
                .host
                .clone()
                .or(server_file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.or(server_file.port).unwrap_or(DEFAULT_PORT),
        };

        let topics_file = file.topics.unwrap_or_default();
        let tags_file = file.tags.unwrap_or_default();
        let topics = RuntimeConfig {
            idle_master_topic_timeout: Duration::from_secs(
                topics_file
                    .idle_master_topic_timeout_secs
                    .unwrap_or(DEFAULT_IDLE_MASTER_TOPIC_TIMEOUT_SECS),
            ),
            max_subscriber_count: topics_file
                .max_subscriber_count
                .unwrap_or(DEFAULT_MAX_SUBSCRIBER_COUNT),
            max_message_size: topics_file
                .max_message_size
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            default_max_delete_count: topics_file
                .default_max_delete_count
                .unwrap_or(DEFAULT_MAX_DELETE_COUNT),
            session_queue_len: topics_file
                .session_queue_len
                .unwrap_or(DEFAULT_SESSION_QUEUE_LEN),
            restricted_tag_namespaces: tags_file.restricted_namespaces.unwrap_or_default(),
            masked_tag_namespaces: tags_file.masked_namespaces.unwrap_or_default(),
        };

        let store_backend = cli
            .store_backend
            .or(file.store.and_then(|s| s.backend))
            .unwrap_or_default();

        let push_adapters = file
            .push
            .and_then(|p| p.adapters)
            .unwrap_or_else(|| vec!["log".to_string()]);

        let cluster = Self::resolve_cluster(cli, file.cluster)?;

        Ok(AppConfig {
            server,
            topics,
            store_backend,
            push_adapters,
            cluster,
        })
    }

    fn read_file(explicit: Option<PathBuf>) -> Result<FileConfig> {
        let path = match explicit {
            Some(path) => path,
            None => {
                let default = PathBuf::from(CONFIG_FILE_NAME);
                if !default.exists() {
                    return Ok(FileConfig::default());
                }
                default
            }
        };
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn resolve_cluster(
        cli: &CliConfig,
        file: Option<ClusterFileConfig>,
    ) -> Result<Option<ClusterConfig>> {
        let Some(file) = file else {
            return Ok(None);
        };
        let nodes = file.nodes.unwrap_or_default();
        if nodes.is_empty() {
            return Ok(None);
        }

        // Container orchestrators name pods for us; HOSTNAME beats the
        // configured name so one config file serves the whole fleet.
        let self_name = cli
            .cluster_self
            .clone()
            .or_else(|| std::env::var(ENV_HOSTNAME).ok().filter(|h| !h.is_empty()))
            .or(file.self_name)
            .context("cluster.self is not set and HOSTNAME is empty")?;
        if !nodes.contains(&self_name) {
            anyhow::bail!("cluster node '{}' is not in cluster.nodes", self_name);
        }

        let failover = file.failover.and_then(|fo| {
            let enabled = fo.enabled.unwrap_or(false);
            if !enabled {
                return None;
            }
            Some(FailoverConfig {
                enabled,
                heartbeat: Duration::from_millis(fo.heartbeat_ms.unwrap_or(DEFAULT_HEARTBEAT_MS)),
                vote_after: fo.vote_after.unwrap_or(DEFAULT_VOTE_AFTER),
                node_fail_after: fo.node_fail_after.unwrap_or(DEFAULT_NODE_FAIL_AFTER),
            })
        });
        if failover.is_some() && nodes.len() < 3 {
            anyhow::bail!("cluster failover requires at least three nodes");
        }

        Ok(Some(ClusterConfig {
            self_name,
            nodes,
            failover,
        }))
    }

    pub fn cluster_spec(&self) -> Option<ClusterSpec> {
        self.cluster.as_ref().map(|c| ClusterSpec {
            self_name: c.self_name.clone(),
            nodes: c.nodes.clone(),
            failover: c.failover.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::load(&CliConfig::default()).unwrap();
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.store_backend, StoreBackendType::Memory);
        assert!(config.cluster.is_none());
        assert_eq!(config.push_adapters, vec!["log".to_string()]);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliConfig {
            host: Some("0.0.0.0".to_string()),
            port: Some(7070),
            ..Default::default()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 7070);
    }

    #[test]
    fn test_cluster_self_must_be_listed() {
        let file = ClusterFileConfig {
            self_name: Some("n9".to_string()),
            nodes: Some(vec!["n1".to_string(), "n2".to_string()]),
            failover: None,
        };
        let cli = CliConfig {
            cluster_self: Some("n9".to_string()),
            ..Default::default()
        };
        assert!(AppConfig::resolve_cluster(&cli, Some(file)).is_err());
    }

    #[test]
    fn test_failover_needs_three_nodes() {
        let file = ClusterFileConfig {
            self_name: Some("n1".to_string()),
            nodes: Some(vec!["n1".to_string(), "n2".to_string()]),
            failover: Some(FailoverFileConfig {
                enabled: Some(true),
                ..Default::default()
            }),
        };
        let cli = CliConfig {
            cluster_self: Some("n1".to_string()),
            ..Default::default()
        };
        assert!(AppConfig::resolve_cluster(&cli, Some(file)).is_err());
    }

    #[test]
    fn test_parse_full_file() {
        let raw = r#"{
            "server": { "host": "127.0.0.1", "port": 6061 },
            "topics": { "max_subscriber_count": 16, "idle_master_topic_timeout_secs": 2 },
            "tags": { "restricted_namespaces": ["email"], "masked_namespaces": ["email"] },
            "store": { "backend": "memory" },
            "cluster": { "self": "n1", "nodes": ["n1", "n2", "n3"] }
        }"#;
        let file: FileConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(file.server.unwrap().port, Some(6061));
        assert_eq!(file.topics.unwrap().max_subscriber_count, Some(16));
        let cluster = file.cluster.unwrap();
        assert_eq!(cluster.self_name.as_deref(), Some("n1"));
        assert_eq!(cluster.nodes.unwrap().len(), 3);
    }
}
