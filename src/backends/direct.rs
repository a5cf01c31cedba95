// Direct backend: pure nodeset algebra, no external dependencies

use async_trait::async_trait;

use super::{hostexpr, Backend};
use crate::config::Config;
use crate::nodeset::NodeSet;
use crate::output::errors::CuminError;

/// The `direct` backend resolves hosts without any external service.
///
/// Each atom is a nodeset expression (`host10[10-42].domain`), combined with
/// `and`, `or`, `and not`, `xor` and parentheses. The typical usage is as a
/// reliable fallback when the primary selection mechanism is unavailable and
/// for exercising the transport without backend dependencies.
pub struct DirectQuery;

impl DirectQuery {
    pub fn new(_config: &Config) -> Self {
        DirectQuery
    }
}

#[async_trait]
impl Backend for DirectQuery {
    fn prefix(&self) -> char {
        'D'
    }

    fn name(&self) -> &'static str {
        "direct"
    }

    async fn resolve(&self, payload: &str) -> Result<NodeSet, CuminError> {
        hostexpr::evaluate(payload, "direct", &|atom| {
            if atom.contains('*') || atom.contains('?') {
                return Err(CuminError::InvalidQuery {
                    backend: "direct",
                    message: format!(
                        "globbing is not supported, each atom must be a nodeset: '{}'",
                        atom
                    ),
                });
            }
            NodeSet::parse(atom)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> DirectQuery {
        DirectQuery::new(&Config::default())
    }

    #[tokio::test]
    async fn test_simple_selection() {
        let hosts = backend().resolve("host1.domain").await.unwrap();
        assert_eq!(hosts.to_string(), "host1.domain");
    }

    #[tokio::test]
    async fn test_expansion() {
        let hosts = backend()
            .resolve("host10[10-42].domain,host2010.other-domain")
            .await
            .unwrap();
        assert_eq!(hosts.len(), 34);
        assert!(hosts.contains("host1033.domain"));
        assert!(hosts.contains("host2010.other-domain"));
    }

    #[tokio::test]
    async fn test_complex_selection() {
        let hosts = backend()
            .resolve("host1 or (host[2-5] and not (host3 or host4))")
            .await
            .unwrap();
        assert_eq!(hosts.to_string(), "host[1-2,5]");
    }

    #[tokio::test]
    async fn test_glob_rejected() {
        let result = backend().resolve("host1*").await;
        assert!(matches!(result, Err(CuminError::InvalidQuery { .. })));
    }
}
