//! Gateway configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::handlers::command::CommandSpec;
use crate::router::Access;

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen address (default: "0.0.0.0:2022")
    pub listen_addr: String,

    /// Path to the SSH host key. The built-in development key is used if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_key_file: Option<PathBuf>,

    /// Control requests buffered per channel before `exec` arrives
    pub request_queue_capacity: usize,

    /// Users allowed to log in
    pub users: Vec<UserConfig>,

    /// Exposed routes
    pub routes: Vec<RouteConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2022".to_string(),
            host_key_file: None,
            request_queue_capacity: 1000,
            users: Vec::new(),
            routes: Vec::new(),
        }
    }
}

/// A user and the credentials it may authenticate with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,

    /// Plaintext password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Public key in authorized_keys format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// File holding public keys, re-read on every authentication attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Request path, e.g. "/deploy"
    pub uri: String,

    /// Users allowed to use the route
    pub allow: Vec<String>,

    /// Allow every authenticated user, ignoring `allow`
    pub allow_all_users: bool,

    pub handler: HandlerConfig,
}

impl RouteConfig {
    pub fn access(&self) -> Access {
        if self.allow_all_users {
            Access::AllUsers
        } else {
            Access::Users(self.allow.iter().cloned().collect::<HashSet<_>>())
        }
    }
}

/// Handler bound to a route. Only `command` exists today.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub cmd: String,
    pub args: Vec<String>,

    /// Reported but not enforced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CommandConfig {
    pub fn spec(&self) -> CommandSpec {
        CommandSpec {
            cmd: self.cmd.clone(),
            args: self.args.clone(),
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// A small configuration showing every option.
    pub fn example() -> Self {
        Self {
            host_key_file: Some(PathBuf::from("/etc/execgate/host_key")),
            users: vec![
                UserConfig {
                    name: "alice".to_string(),
                    password: Some("change-me".to_string()),
                    ..Default::default()
                },
                UserConfig {
                    name: "bob".to_string(),
                    public_key_path: Some(PathBuf::from("/etc/execgate/keys/bob.pub")),
                    ..Default::default()
                },
            ],
            routes: vec![
                RouteConfig {
                    uri: "/uptime".to_string(),
                    allow_all_users: true,
                    handler: HandlerConfig {
                        command: Some(CommandConfig {
                            cmd: "uptime".to_string(),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                },
                RouteConfig {
                    uri: "/top".to_string(),
                    allow: vec!["alice".to_string()],
                    handler: HandlerConfig {
                        command: Some(CommandConfig {
                            cmd: "top".to_string(),
                            args: vec!["-d".to_string(), "2".to_string()],
                            timeout_secs: Some(600),
                        }),
                    },
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }
}
