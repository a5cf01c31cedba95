// OpenStack backend: enumerate Nova instances through the HTTP APIs

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::Backend;
use crate::config::{Config, OpenStackConfig};
use crate::nodeset::NodeSet;
use crate::output::errors::CuminError;

const BACKEND: &str = "openstack";

/// The `openstack` backend selects VMs deployed in an OpenStack
/// infrastructure.
///
/// The query is a space-separated list of `key:value` filters passed to the
/// compute list-servers API, or `*` for everything. The special `project` key
/// restricts the search to one project; without it all enabled projects are
/// queried. The filters `status:ACTIVE` and `vm_state:ACTIVE` are applied by
/// default and can be overridden. Results are returned as
/// `name.project.domain_suffix` FQDNs.
pub struct OpenStackQuery {
    config: OpenStackConfig,
    client: reqwest::Client,
}

/// Parsed search: optional project plus the API filter parameters
#[derive(Debug, PartialEq, Eq)]
struct Search {
    project: Option<String>,
    params: BTreeMap<String, String>,
}

impl OpenStackQuery {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.openstack.timeout))
            .build()
            .unwrap_or_default();

        OpenStackQuery {
            config: config.openstack.clone(),
            client,
        }
    }

    /// Parse the payload into search parameters, applying the defaults
    fn parse_payload(&self, payload: &str) -> Result<Search, CuminError> {
        let mut search = Search {
            project: None,
            params: BTreeMap::new(),
        };
        search.params.insert("status".to_string(), "ACTIVE".to_string());
        search
            .params
            .insert("vm_state".to_string(), "ACTIVE".to_string());

        for (key, value) in &self.config.query_params {
            if key == "project" {
                search.project = Some(value.clone());
            } else {
                search.params.insert(key.clone(), value.clone());
            }
        }

        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return Err(CuminError::InvalidQuery {
                backend: BACKEND,
                message: "empty query, use '*' to select all hosts".to_string(),
            });
        }
        if trimmed == "*" {
            return Ok(search);
        }

        for token in tokenize(trimmed, payload)? {
            let (key, value) = token.split_once(':').ok_or_else(|| {
                CuminError::InvalidQuery {
                    backend: BACKEND,
                    message: format!("expected 'key:value', got '{}'", token),
                }
            })?;

            if key.is_empty() || value.is_empty() {
                return Err(CuminError::InvalidQuery {
                    backend: BACKEND,
                    message: format!("expected 'key:value', got '{}'", token),
                });
            }

            let value = strip_quotes(value);
            if key == "project" {
                search.project = Some(value);
            } else {
                search.params.insert(key.to_string(), value);
            }
        }

        Ok(search)
    }

    /// Authenticate against Keystone, optionally scoped to a project.
    /// Returns the token and the compute endpoint from the service catalog.
    async fn authenticate(&self, project: Option<&str>) -> Result<(String, String), CuminError> {
        let mut auth = json!({
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": self.config.username,
                        "domain": {"id": "default"},
                        "password": self.config.password,
                    }
                }
            }
        });

        if let Some(project) = project {
            auth["scope"] = json!({
                "project": {"name": project, "domain": {"id": "default"}}
            });
        }

        let url = format!("{}/v3/auth/tokens", self.config.auth_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "auth": auth }))
            .send()
            .await
            .map_err(|e| CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("Keystone request failed: {}", e),
            })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CuminError::BackendAuth {
                backend: BACKEND,
                message: "Keystone rejected the credentials".to_string(),
            });
        }
        let response = response
            .error_for_status()
            .map_err(|e| CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("Keystone returned an error: {}", e),
            })?;

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| CuminError::BackendAuth {
                backend: BACKEND,
                message: "Keystone response is missing the subject token".to_string(),
            })?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("unable to decode the Keystone response: {}", e),
            })?;

        let compute_url = body["token"]["catalog"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|service| service["type"] == "compute")
            .flat_map(|service| service["endpoints"].as_array().into_iter().flatten())
            .find(|endpoint| endpoint["interface"] == "public")
            .and_then(|endpoint| endpoint["url"].as_str())
            .map(String::from)
            .unwrap_or_default();

        Ok((token, compute_url))
    }

    /// All enabled project names, except the special admin project
    async fn get_projects(&self, token: &str) -> Result<Vec<String>, CuminError> {
        let url = format!("{}/v3/projects?enabled=true", self.config.auth_url);
        let body: Value = self
            .client
            .get(&url)
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(|e| CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("Keystone projects request failed: {}", e),
            })?
            .error_for_status()
            .map_err(|e| CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("Keystone projects request failed: {}", e),
            })?
            .json()
            .await
            .map_err(|e| CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("unable to decode the projects response: {}", e),
            })?;

        Ok(body["projects"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|project| project["name"].as_str())
            .filter(|name| *name != "admin")
            .map(String::from)
            .collect())
    }

    /// FQDNs of the instances matching the search in one project
    async fn get_project_hosts(
        &self,
        project: &str,
        search: &Search,
    ) -> Result<NodeSet, CuminError> {
        let (token, compute_url) = self.authenticate(Some(project)).await?;
        if compute_url.is_empty() {
            return Err(CuminError::BackendUnreachable {
                backend: BACKEND,
                message: "no public compute endpoint in the service catalog".to_string(),
            });
        }

        let params: Vec<(&str, &str)> = search
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let body: Value = self
            .client
            .get(format!("{}/servers", compute_url))
            .header("X-Auth-Token", token.as_str())
            .header(
                "X-OpenStack-Nova-API-Version",
                self.config.nova_api_version.as_str(),
            )
            .query(&params)
            .send()
            .await
            .map_err(|e| CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("compute API request failed: {}", e),
            })?
            .error_for_status()
            .map_err(|e| CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("compute API request failed: {}", e),
            })?
            .json()
            .await
            .map_err(|e| CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("unable to decode the compute response: {}", e),
            })?;

        let domain = self.domain();
        Ok(body["servers"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|server| server["name"].as_str())
            .map(|name| format!("{}.{}{}", name, project, domain))
            .collect())
    }

    fn domain(&self) -> String {
        match &self.config.domain_suffix {
            Some(suffix) if suffix.starts_with('.') => suffix.clone(),
            Some(suffix) => format!(".{}", suffix),
            None => String::new(),
        }
    }
}

#[async_trait]
impl Backend for OpenStackQuery {
    fn prefix(&self) -> char {
        'O'
    }

    fn name(&self) -> &'static str {
        "openstack"
    }

    async fn resolve(&self, payload: &str) -> Result<NodeSet, CuminError> {
        let search = self.parse_payload(payload)?;
        debug!(?search, "resolving openstack query");

        let mut hosts = NodeSet::new();
        match &search.project {
            Some(project) => {
                hosts |= &self.get_project_hosts(project, &search).await?;
            }
            None => {
                let (token, _) = self.authenticate(None).await?;
                for project in self.get_projects(&token).await? {
                    hosts |= &self.get_project_hosts(&project, &search).await?;
                }
            }
        }

        Ok(hosts)
    }
}

/// Split a filter list on whitespace, honoring quoted values
fn tokenize(input: &str, payload: &str) -> Result<Vec<String>, CuminError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    current.push(c);
                    quote = Some(c);
                }
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            },
        }
    }

    if quote.is_some() {
        return Err(CuminError::InvalidQuery {
            backend: BACKEND,
            message: format!("unterminated quoted string in '{}'", payload),
        });
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    Ok(tokens)
}

/// Strip one level of matching quotes around a value
fn strip_quotes(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> OpenStackQuery {
        OpenStackQuery::new(&Config::default())
    }

    #[test]
    fn test_star_selects_defaults() {
        let search = backend().parse_payload("*").unwrap();
        assert!(search.project.is_none());
        assert_eq!(search.params.get("status").map(String::as_str), Some("ACTIVE"));
        assert_eq!(
            search.params.get("vm_state").map(String::as_str),
            Some("ACTIVE")
        );
    }

    #[test]
    fn test_project_filter() {
        let search = backend().parse_payload("project:deployment-prep").unwrap();
        assert_eq!(search.project.as_deref(), Some("deployment-prep"));
        assert!(!search.params.contains_key("project"));
    }

    #[test]
    fn test_filters_override_defaults() {
        let search = backend()
            .parse_payload("status:SHUTOFF name:web1")
            .unwrap();
        assert_eq!(search.params.get("status").map(String::as_str), Some("SHUTOFF"));
        assert_eq!(search.params.get("name").map(String::as_str), Some("web1"));
    }

    #[test]
    fn test_quoted_value() {
        let search = backend()
            .parse_payload(r#"name:"host1.*\.domain" image:1234"#)
            .unwrap();
        assert_eq!(
            search.params.get("name").map(String::as_str),
            Some(r"host1.*\.domain")
        );
        assert_eq!(search.params.get("image").map(String::as_str), Some("1234"));
    }

    #[test]
    fn test_config_query_params_merged() {
        let mut config = Config::default();
        config
            .openstack
            .query_params
            .insert("project".to_string(), "infra".to_string());
        config
            .openstack
            .query_params
            .insert("image".to_string(), "debian".to_string());

        let backend = OpenStackQuery::new(&config);
        let search = backend.parse_payload("*").unwrap();
        assert_eq!(search.project.as_deref(), Some("infra"));
        assert_eq!(search.params.get("image").map(String::as_str), Some("debian"));
    }

    #[test]
    fn test_invalid_tokens() {
        assert!(backend().parse_payload("novalue").is_err());
        assert!(backend().parse_payload("key:").is_err());
        assert!(backend().parse_payload("name:'unterminated").is_err());
        assert!(backend().parse_payload("").is_err());
    }

    #[test]
    fn test_domain_suffix() {
        let mut config = Config::default();
        config.openstack.domain_suffix = Some("cloud.example.org".to_string());
        assert_eq!(OpenStackQuery::new(&config).domain(), ".cloud.example.org");

        config.openstack.domain_suffix = Some(".cloud.example.org".to_string());
        assert_eq!(OpenStackQuery::new(&config).domain(), ".cloud.example.org");

        config.openstack.domain_suffix = None;
        assert_eq!(OpenStackQuery::new(&config).domain(), "");
    }
}
