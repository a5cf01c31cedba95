// Query backends: the contract, the registry and the set aggregation

pub mod direct;
pub mod hostexpr;
pub mod knownhosts;
pub mod openstack;
pub mod puppetdb;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::nodeset::NodeSet;
use crate::output::errors::CuminError;

pub use direct::DirectQuery;
pub use knownhosts::KnownHostsQuery;
pub use openstack::OpenStackQuery;
pub use puppetdb::PuppetDBQuery;

/// Prefix reserved for alias atoms in the global grammar, not available to backends
pub const ALIAS_PREFIX: char = 'A';

/// A hosts-selection backend.
///
/// Each backend owns a single-character prefix in the global grammar and a
/// payload grammar of its own. Resolution must be deterministic for a given
/// payload and configuration, network state aside.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The single-character identifier registered in the global grammar
    fn prefix(&self) -> char;

    /// The name used in the configuration and in error messages
    fn name(&self) -> &'static str;

    /// Parse the payload with the backend grammar and resolve the hosts
    async fn resolve(&self, payload: &str) -> Result<NodeSet, CuminError>;
}

/// Boolean operators shared by the global grammar and the aggregating backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOperator {
    Or,
    And,
    AndNot,
    Xor,
}

/// Aggregate `element` into `hosts` according to the operator.
/// `None` adds the first element of a group.
pub fn aggregate(hosts: &mut NodeSet, element: &NodeSet, operator: Option<BoolOperator>) {
    match operator {
        None | Some(BoolOperator::Or) => *hosts |= element,
        Some(BoolOperator::And) => *hosts &= element,
        Some(BoolOperator::AndNot) => *hosts -= element,
        Some(BoolOperator::Xor) => *hosts ^= element,
    }
}

/// Registry of the available backends, keyed by their grammar prefix.
///
/// An explicit value threaded through `Query` construction: there is no
/// process-wide table, so tests and embedders compose their own.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<char, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        BackendRegistry::default()
    }

    /// Register a backend, rejecting the reserved alias prefix and duplicates
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Result<(), CuminError> {
        let prefix = backend.prefix();

        if prefix.eq_ignore_ascii_case(&ALIAS_PREFIX) {
            return Err(CuminError::Config {
                message: format!(
                    "unable to register backend '{}': prefix '{}' is reserved for aliases",
                    backend.name(),
                    ALIAS_PREFIX
                ),
                path: None,
            });
        }

        if let Some(existing) = self.backends.get(&prefix) {
            return Err(CuminError::Config {
                message: format!(
                    "unable to register backend '{}': prefix '{}' already registered by '{}'",
                    backend.name(),
                    prefix,
                    existing.name()
                ),
                path: None,
            });
        }

        self.backends.insert(prefix, backend);
        Ok(())
    }

    /// Build a registry with the built-in backends.
    ///
    /// `plugins.backends` in the configuration selects which ones register;
    /// with an empty list all of them do.
    pub fn with_builtins(config: &Config) -> Result<Self, CuminError> {
        let mut registry = BackendRegistry::new();
        let selected = &config.plugins.backends;
        let wanted = |name: &str| selected.is_empty() || selected.iter().any(|s| s == name);

        if wanted("direct") {
            registry.register(Arc::new(DirectQuery::new(config)))?;
        }
        if wanted("knownhosts") {
            registry.register(Arc::new(KnownHostsQuery::new(config)?))?;
        }
        if wanted("puppetdb") {
            registry.register(Arc::new(PuppetDBQuery::new(config)?))?;
        }
        if wanted("openstack") {
            registry.register(Arc::new(OpenStackQuery::new(config)))?;
        }

        Ok(registry)
    }

    pub fn get(&self, prefix: char) -> Option<&Arc<dyn Backend>> {
        self.backends.get(&prefix)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.values().find(|b| b.name() == name)
    }

    /// The registered prefixes, for error messages
    pub fn prefixes(&self) -> Vec<char> {
        let mut prefixes: Vec<char> = self.backends.keys().copied().collect();
        prefixes.sort_unstable();
        prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBackend(char);

    #[async_trait]
    impl Backend for FakeBackend {
        fn prefix(&self) -> char {
            self.0
        }

        fn name(&self) -> &'static str {
            "fake"
        }

        async fn resolve(&self, _payload: &str) -> Result<NodeSet, CuminError> {
            Ok(NodeSet::new())
        }
    }

    #[test]
    fn test_alias_prefix_rejected() {
        let mut registry = BackendRegistry::new();
        assert!(registry.register(Arc::new(FakeBackend('A'))).is_err());
        assert!(registry.register(Arc::new(FakeBackend('a'))).is_err());
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(FakeBackend('Z'))).unwrap();
        assert!(registry.register(Arc::new(FakeBackend('Z'))).is_err());
    }

    #[test]
    fn test_builtins() {
        let registry = BackendRegistry::with_builtins(&Config::default()).unwrap();
        assert!(registry.get('D').is_some());
        assert!(registry.get('K').is_some());
        assert!(registry.get('P').is_some());
        assert!(registry.get('O').is_some());
        assert!(registry.by_name("direct").is_some());
    }

    #[test]
    fn test_plugin_selection() {
        let mut config = Config::default();
        config.plugins.backends = vec!["direct".to_string()];
        let registry = BackendRegistry::with_builtins(&config).unwrap();
        assert!(registry.get('D').is_some());
        assert!(registry.get('P').is_none());
    }

    #[test]
    fn test_aggregate_operators() {
        let mut hosts = NodeSet::new();
        let a = NodeSet::from_list(["h1", "h2", "h3"]);
        let b = NodeSet::from_list(["h2", "h4"]);

        aggregate(&mut hosts, &a, None);
        assert_eq!(hosts.len(), 3);

        aggregate(&mut hosts, &b, Some(BoolOperator::AndNot));
        assert_eq!(hosts, NodeSet::from_list(["h1", "h3"]));

        aggregate(&mut hosts, &b, Some(BoolOperator::Or));
        assert_eq!(hosts.len(), 4);

        aggregate(&mut hosts, &a, Some(BoolOperator::And));
        assert_eq!(hosts, NodeSet::from_list(["h1", "h2", "h3"]));

        aggregate(&mut hosts, &b, Some(BoolOperator::Xor));
        assert_eq!(hosts, NodeSet::from_list(["h1", "h3", "h4"]));
    }
}
