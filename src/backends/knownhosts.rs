// KnownHosts backend: resolve against SSH known-hosts files

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use super::{hostexpr, Backend};
use crate::config::Config;
use crate::nodeset::NodeSet;
use crate::output::errors::CuminError;

/// The `knownhosts` backend matches hosts against the entries of one or more
/// SSH known-hosts files, configured under `knownhosts.files`.
///
/// The files are read once at construction. Atoms follow the same expression
/// grammar as the direct backend, with glob atoms (`host10*`) matched against
/// the parsed entries; whatever the expression yields is finally intersected
/// with the union of the entries, so only existing hosts are returned.
/// Hashed entries cannot be listed and are skipped.
pub struct KnownHostsQuery {
    known: NodeSet,
}

impl KnownHostsQuery {
    pub fn new(config: &Config) -> Result<Self, CuminError> {
        let mut known = NodeSet::new();
        for file in &config.knownhosts.files {
            load_known_hosts(file, &mut known)?;
        }

        debug!(hosts = known.len(), "loaded known hosts entries");
        Ok(KnownHostsQuery { known })
    }
}

#[async_trait]
impl Backend for KnownHostsQuery {
    fn prefix(&self) -> char {
        'K'
    }

    fn name(&self) -> &'static str {
        "knownhosts"
    }

    async fn resolve(&self, payload: &str) -> Result<NodeSet, CuminError> {
        let hosts = hostexpr::evaluate(payload, "knownhosts", &|atom| {
            if atom.contains('*') || atom.contains('?') {
                self.match_glob(atom)
            } else {
                NodeSet::parse(atom)
            }
        })?;

        Ok(&hosts & &self.known)
    }
}

impl KnownHostsQuery {
    /// Select the known hosts matching a glob pattern
    fn match_glob(&self, pattern: &str) -> Result<NodeSet, CuminError> {
        let regex = glob_to_regex(pattern).map_err(|e| CuminError::InvalidQuery {
            backend: "knownhosts",
            message: format!("invalid glob pattern '{}': {}", pattern, e),
        })?;

        Ok(self
            .known
            .iter()
            .filter(|host| regex.is_match(host))
            .map(String::from)
            .collect())
    }
}

/// Translate a glob pattern into an anchored regex
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expression = String::with_capacity(pattern.len() + 8);
    expression.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            _ => expression.push_str(&regex::escape(&c.to_string())),
        }
    }
    expression.push('$');
    Regex::new(&expression)
}

/// Parse one known-hosts file into the accumulated host set.
///
/// Lines are `hostnames keytype key [comment]` with comma-separated hostname
/// patterns, see `SSH_KNOWN_HOSTS FILE FORMAT` in `man sshd`. Hashed entries
/// (`|1|...`), revoked entries, wildcard patterns and plain IP addresses
/// cannot be usefully enumerated and are skipped.
fn load_known_hosts(path: &Path, known: &mut NodeSet) -> Result<(), CuminError> {
    let content = std::fs::read_to_string(path).map_err(|e| CuminError::Io {
        message: format!("unable to read known hosts file: {}", e),
        path: Some(path.to_path_buf()),
    })?;

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('|') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let hostnames = if line.starts_with('@') {
            if fields.len() < 4 {
                warn!(line = lineno + 1, file = %path.display(), "discarded invalid marker line");
                continue;
            }
            match fields[0] {
                "@cert-authority" => fields[1],
                "@revoked" => continue,
                _ => {
                    warn!(line = lineno + 1, file = %path.display(), "discarded unknown marker");
                    continue;
                }
            }
        } else {
            if fields.len() < 3 {
                warn!(line = lineno + 1, file = %path.display(), "discarded invalid line");
                continue;
            }
            fields[0]
        };

        for entry in hostnames.split(',') {
            if entry.is_empty() {
                continue;
            }

            // A negated pattern still names a listable host
            let entry = entry.strip_prefix('!').unwrap_or(entry);

            // Non-standard port syntax: [host]:port
            let host = match entry.strip_prefix('[') {
                Some(rest) => match rest.split_once(']') {
                    Some((host, _port)) => host,
                    None => continue,
                },
                None => entry,
            };

            if host.is_empty() || host.contains('*') || host.contains('?') {
                continue;
            }
            if host.parse::<std::net::IpAddr>().is_ok() {
                continue;
            }

            known.insert(host);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn backend_with(content: &str) -> KnownHostsQuery {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();

        let mut config = Config::default();
        config.knownhosts.files = vec![file.path().to_path_buf()];
        let backend = KnownHostsQuery::new(&config).unwrap();
        // The file can go away once the entries are loaded
        drop(file);
        backend
    }

    const KNOWN_HOSTS: &str = "\
# comment line
host1.domain,10.0.0.1 ssh-ed25519 AAAAC3Nza
host2.domain ssh-rsa AAAAB3Nza
|1|hashed-entry-base64=|more-base64= ssh-rsa AAAAB3Nza
@revoked revoked.domain ssh-rsa AAAAB3Nza
[host3.domain]:2222 ssh-ed25519 AAAAC3Nza
web1.domain,web2.domain ssh-ed25519 AAAAC3Nza
*.wildcard.domain ssh-rsa AAAAB3Nza
";

    #[tokio::test]
    async fn test_plain_match() {
        let backend = backend_with(KNOWN_HOSTS);
        let hosts = backend.resolve("host1.domain").await.unwrap();
        assert_eq!(hosts.to_string(), "host1.domain");
    }

    #[tokio::test]
    async fn test_unknown_host_filtered() {
        let backend = backend_with(KNOWN_HOSTS);
        let hosts = backend.resolve("host1.domain,ghost.domain").await.unwrap();
        assert_eq!(hosts.to_string(), "host1.domain");
    }

    #[tokio::test]
    async fn test_hashed_entries_skipped() {
        let backend = backend_with(KNOWN_HOSTS);
        let hosts = backend.resolve("*").await.unwrap();
        for host in hosts.iter() {
            assert!(!host.starts_with('|'));
        }
    }

    #[tokio::test]
    async fn test_glob_match() {
        let backend = backend_with(KNOWN_HOSTS);
        let hosts = backend.resolve("host*.domain").await.unwrap();
        assert_eq!(hosts.to_string(), "host[1-3].domain");
    }

    #[tokio::test]
    async fn test_bracketed_port_stripped() {
        let backend = backend_with(KNOWN_HOSTS);
        let hosts = backend.resolve("host3.domain").await.unwrap();
        assert_eq!(hosts.to_string(), "host3.domain");
    }

    #[tokio::test]
    async fn test_expression_with_expansion() {
        let backend = backend_with(KNOWN_HOSTS);
        let hosts = backend
            .resolve("web[1-5].domain and not web2.domain")
            .await
            .unwrap();
        assert_eq!(hosts.to_string(), "web1.domain");
    }

    #[tokio::test]
    async fn test_revoked_entries_skipped() {
        let backend = backend_with(KNOWN_HOSTS);
        let hosts = backend.resolve("revoked.domain").await.unwrap();
        assert!(hosts.is_empty());
    }

    #[tokio::test]
    async fn test_ip_addresses_skipped() {
        let backend = backend_with(KNOWN_HOSTS);
        let hosts = backend.resolve("10.0.0.1").await.unwrap();
        assert!(hosts.is_empty());
    }

    #[tokio::test]
    async fn test_cert_authority_hostnames_indexed() {
        let backend = backend_with("@cert-authority ca.domain ssh-rsa AAAAB3Nza comment\n");
        let hosts = backend.resolve("ca.domain").await.unwrap();
        assert_eq!(hosts.to_string(), "ca.domain");
    }
}
