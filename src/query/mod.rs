// Query handling: default-backend shortcut and global execution

pub mod grammar;

use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::backends::{aggregate, BackendRegistry};
use crate::config::Config;
use crate::nodeset::NodeSet;
use crate::output::errors::CuminError;

pub use grammar::{parse_query, QueryAst};

/// The main query facade.
///
/// If a `default_backend` is configured, the query string is first attempted
/// with that backend's own grammar; only when that parse fails is the string
/// re-parsed with the global multi-backend grammar. Resolution failures other
/// than parse rejections (unreachable or unauthorized backends) are never
/// retried: a partial host list must not silently replace the real answer.
pub struct Query {
    registry: BackendRegistry,
    aliases: HashMap<String, String>,
    default_backend: Option<String>,
}

impl Query {
    pub fn new(config: &Config, registry: BackendRegistry) -> Self {
        Query {
            registry,
            aliases: config.aliases.clone(),
            default_backend: config.default_backend.clone(),
        }
    }

    /// Resolve a query string into the matching hosts
    pub async fn execute(&self, query_string: &str) -> Result<NodeSet, CuminError> {
        let Some(name) = &self.default_backend else {
            return self.execute_global(query_string).await;
        };

        let backend = self
            .registry
            .by_name(name)
            .ok_or_else(|| CuminError::Config {
                message: format!("default backend '{}' is not registered", name),
                path: None,
            })?;

        match backend.resolve(query_string).await {
            Ok(hosts) => {
                debug!(backend = name.as_str(), hosts = hosts.len(), "default backend matched");
                Ok(hosts)
            }
            Err(default_error) if is_parse_rejection(&default_error) => {
                self.execute_global(query_string)
                    .await
                    .map_err(|global_error| CuminError::InvalidQuery {
                        backend: "query",
                        message: format!(
                            "unable to parse the query '{}' neither with the default backend \
                             '{}' nor with the global grammar:\n{}: {}\nglobal: {}",
                            query_string, name, name, default_error, global_error
                        ),
                    })
            }
            Err(error) => Err(error),
        }
    }

    async fn execute_global(&self, query_string: &str) -> Result<NodeSet, CuminError> {
        let ast = parse_query(query_string, &self.aliases)?;
        let hosts = self.resolve_ast(&ast).await?;
        debug!(hosts = hosts.len(), query = query_string, "query resolved");
        Ok(hosts)
    }

    /// Walk the parsed tree bottom-up, combining subresults over set algebra
    fn resolve_ast<'a>(&'a self, ast: &'a QueryAst) -> BoxFuture<'a, Result<NodeSet, CuminError>> {
        async move {
            match ast {
                QueryAst::Backend { prefix, payload } => {
                    let backend = self.registry.get(*prefix).ok_or_else(|| {
                        CuminError::parse(
                            format!(
                                "no backend registered for prefix '{}', available: {}",
                                prefix,
                                self.registry
                                    .prefixes()
                                    .iter()
                                    .map(char::to_string)
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            ),
                            format!("{}{{{}}}", prefix, payload),
                        )
                    })?;

                    backend.resolve(payload).await
                }
                QueryAst::Group(items) => {
                    let mut hosts = NodeSet::new();
                    for (operator, item) in items {
                        let element = self.resolve_ast(item).await?;
                        aggregate(&mut hosts, &element, *operator);
                    }
                    Ok(hosts)
                }
            }
        }
        .boxed()
    }
}

/// Whether an error means "the payload did not parse", making the global
/// grammar fallback legitimate
fn is_parse_rejection(error: &CuminError) -> bool {
    matches!(
        error,
        CuminError::Parse(_) | CuminError::InvalidQuery { .. }
    )
}
