// Configuration and aliases loading

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::output::errors::CuminError;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cumin/config.yaml";

/// Parsed configuration file.
///
/// Unknown keys are tolerated so that configurations shared with other
/// deployments keep loading.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Executor transport to use
    pub transport: Option<String>,

    /// Backend tried on the raw query before the global grammar
    pub default_backend: Option<String>,

    /// Destination of the operational log
    pub log_file: Option<PathBuf>,

    /// Environment variables set for launched commands
    pub environment: HashMap<String, String>,

    pub puppetdb: PuppetDbConfig,
    pub openstack: OpenStackConfig,
    pub knownhosts: KnownHostsConfig,
    pub clustershell: ClusterShellConfig,
    pub kerberos: KerberosConfig,
    pub plugins: PluginsConfig,

    /// Alias name -> query string, loaded from aliases.yaml
    #[serde(skip)]
    pub aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PuppetDbConfig {
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub api_version: u8,
    /// Request timeout in seconds
    pub timeout: u64,
    pub ssl_verify: bool,
    pub ssl_client_cert: Option<PathBuf>,
    pub ssl_client_key: Option<PathBuf>,
}

impl Default for PuppetDbConfig {
    fn default() -> Self {
        PuppetDbConfig {
            host: "localhost".to_string(),
            port: 443,
            scheme: "https".to_string(),
            api_version: 4,
            timeout: 30,
            ssl_verify: true,
            ssl_client_cert: None,
            ssl_client_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenStackConfig {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    /// Appended to instance names to build FQDNs
    pub domain_suffix: Option<String>,
    pub nova_api_version: String,
    /// Request timeout in seconds
    pub timeout: u64,
    /// Extra parameters passed to the compute API client
    pub client_params: HashMap<String, serde_yaml::Value>,
    /// Default search filters, merged under status/vm_state ACTIVE
    pub query_params: HashMap<String, String>,
}

impl Default for OpenStackConfig {
    fn default() -> Self {
        OpenStackConfig {
            auth_url: "http://localhost:5000".to_string(),
            username: "username".to_string(),
            password: "password".to_string(),
            domain_suffix: None,
            nova_api_version: "2".to_string(),
            timeout: 10,
            client_params: HashMap::new(),
            query_params: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KnownHostsConfig {
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterShellConfig {
    /// Options passed to the SSH layer, each entry split on whitespace
    pub ssh_options: Vec<String>,
    /// Max concurrent hosts across the whole run
    pub fanout: usize,
}

impl Default for ClusterShellConfig {
    fn default() -> Self {
        ClusterShellConfig {
            ssh_options: Vec::new(),
            fanout: 64,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KerberosConfig {
    /// Require a valid Kerberos ticket before executing
    pub ensure_ticket: bool,
    /// Apply the ticket requirement to root as well
    pub ensure_ticket_root: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Names of the backends to register; all built-ins when empty
    pub backends: Vec<String>,
}

impl Config {
    /// Load the configuration file plus an adjacent aliases.yaml, if present
    pub fn load(path: &Path) -> Result<Self, CuminError> {
        let content = std::fs::read_to_string(path).map_err(|e| CuminError::Config {
            message: format!("unable to read configuration file: {}", e),
            path: Some(path.to_path_buf()),
        })?;

        let mut config = Config::parse(&content, path)?;

        let alias_file = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("aliases.yaml");
        if alias_file.is_file() {
            let content = std::fs::read_to_string(&alias_file).map_err(|e| CuminError::Config {
                message: format!("unable to read aliases file: {}", e),
                path: Some(alias_file.clone()),
            })?;
            config.aliases =
                serde_yaml::from_str(&content).map_err(|e| CuminError::Config {
                    message: format!("unable to parse aliases file: {}", e),
                    path: Some(alias_file),
                })?;
        }

        Ok(config)
    }

    /// Parse a configuration document from a string
    pub fn parse(content: &str, path: &Path) -> Result<Self, CuminError> {
        if content.trim().is_empty() {
            return Ok(Config::default());
        }

        serde_yaml::from_str(content).map_err(|e| CuminError::Config {
            message: format!("unable to parse configuration file: {}", e),
            path: Some(path.to_path_buf()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("", Path::new("test.yaml")).unwrap();
        assert_eq!(config.clustershell.fanout, 64);
        assert_eq!(config.puppetdb.port, 443);
        assert_eq!(config.puppetdb.api_version, 4);
        assert!(config.puppetdb.ssl_verify);
        assert!(config.default_backend.is_none());
    }

    #[test]
    fn test_parse_full() {
        let yaml = r#"
transport: clustershell
default_backend: direct
log_file: /var/log/cumin/cumin.log
environment:
  SSH_AUTH_SOCK: /run/keyholder/proxy.sock
puppetdb:
  host: puppetdb.example.org
  port: 8443
  api_version: 3
  ssl_verify: false
clustershell:
  fanout: 16
  ssh_options:
    - "-o StrictHostKeyChecking=no"
knownhosts:
  files:
    - /etc/ssh/known_hosts
kerberos:
  ensure_ticket: true
"#;
        let config = Config::parse(yaml, Path::new("test.yaml")).unwrap();
        assert_eq!(config.default_backend.as_deref(), Some("direct"));
        assert_eq!(config.puppetdb.host, "puppetdb.example.org");
        assert_eq!(config.puppetdb.api_version, 3);
        assert!(!config.puppetdb.ssl_verify);
        assert_eq!(config.clustershell.fanout, 16);
        assert_eq!(config.knownhosts.files.len(), 1);
        assert!(config.kerberos.ensure_ticket);
        assert!(!config.kerberos.ensure_ticket_root);
        assert_eq!(
            config.environment.get("SSH_AUTH_SOCK").map(String::as_str),
            Some("/run/keyholder/proxy.sock")
        );
    }

    #[test]
    fn test_unknown_keys_tolerated() {
        let yaml = "puppetdb:\n  urllib3_disable_warnings:\n    - InsecureRequestWarning\n";
        let config = Config::parse(yaml, Path::new("test.yaml"));
        assert!(config.is_ok());
    }

    #[test]
    fn test_invalid_yaml() {
        let result = Config::parse("transport: [unterminated", Path::new("test.yaml"));
        assert!(matches!(result, Err(CuminError::Config { .. })));
    }

    #[test]
    fn test_aliases_loaded_from_adjacent_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "default_backend: direct\n").unwrap();
        std::fs::write(
            dir.path().join("aliases.yaml"),
            "web: D{web[1-2].dom}\nall: A:web or D{db1.dom}\n",
        )
        .unwrap();

        let config = Config::load(&config_path).unwrap();
        assert_eq!(config.aliases.len(), 2);
        assert_eq!(config.aliases["web"], "D{web[1-2].dom}");
    }
}
