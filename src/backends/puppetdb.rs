// PuppetDB backend: compiles the query to the PuppetDB AST and asks the API

use std::time::Duration;

use async_trait::async_trait;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde_json::{json, Value};
use tracing::debug;

use super::Backend;
use crate::config::Config;
use crate::nodeset::NodeSet;
use crate::output::errors::CuminError;

#[derive(Parser)]
#[grammar = "backends/puppetdb.pest"]
struct PuppetDbParser;

const BACKEND: &str = "puppetdb";

/// Resource fields accepted by the `@field` selector
const RESOURCE_FIELDS: [&str; 7] = [
    "tag", "certname", "type", "title", "exported", "file", "line",
];

/// The `puppetdb` backend selects hosts from an existing PuppetDB instance
/// (API v3 or v4).
///
/// A query part is either a hostname pattern (globs and nodeset expansion
/// allowed) or a category token `F:key op value` / `R:Type` with the `C`,
/// `O`, `P` shortcuts for classes, roles and profiles. Facts and resources
/// cannot be mixed in one subquery, compose them at the global grammar level.
pub struct PuppetDBQuery {
    client: reqwest::Client,
    base_url: String,
    api_version: u8,
}

impl PuppetDBQuery {
    pub fn new(config: &Config) -> Result<Self, CuminError> {
        let pdb = &config.puppetdb;

        let base_url = match pdb.api_version {
            3 => format!("{}://{}:{}/v3/", pdb.scheme, pdb.host, pdb.port),
            4 => format!("{}://{}:{}/pdb/query/v4/", pdb.scheme, pdb.host, pdb.port),
            version => {
                return Err(CuminError::Config {
                    message: format!("unsupported PuppetDB API version {}", version),
                    path: None,
                })
            }
        };

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(pdb.timeout));
        if !pdb.ssl_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let (Some(cert), Some(key)) = (&pdb.ssl_client_cert, &pdb.ssl_client_key) {
            let mut pem = std::fs::read(cert).map_err(|e| CuminError::Io {
                message: format!("unable to read client certificate: {}", e),
                path: Some(cert.clone()),
            })?;
            pem.extend(std::fs::read(key).map_err(|e| CuminError::Io {
                message: format!("unable to read client key: {}", e),
                path: Some(key.clone()),
            })?);

            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| CuminError::Config {
                message: format!("invalid TLS client identity: {}", e),
                path: Some(cert.clone()),
            })?;
            builder = builder.identity(identity);
        }

        let client = builder.build().map_err(|e| CuminError::Config {
            message: format!("unable to build the PuppetDB HTTP client: {}", e),
            path: None,
        })?;

        Ok(PuppetDBQuery {
            client,
            base_url,
            api_version: pdb.api_version,
        })
    }

    /// Compile a payload to `(endpoint, host key, AST)` without touching the API
    fn compile(&self, payload: &str) -> Result<(&'static str, &'static str, Value), CuminError> {
        let trimmed = payload.trim();
        let mut pairs =
            PuppetDbParser::parse(Rule::query, trimmed).map_err(|e| CuminError::InvalidQuery {
                backend: BACKEND,
                message: format!("unable to parse query '{}': {}", trimmed, e),
            })?;

        let query = pairs.next().expect("grammar yields one query");
        let expr = query
            .into_inner()
            .find(|p| p.as_rule() == Rule::expr)
            .expect("query contains expr");

        let mut compiler = Compiler {
            endpoint: None,
            api_version: self.api_version,
        };
        let group = compiler.compile_expr(expr)?;

        let endpoint = compiler.endpoint.unwrap_or("nodes");
        let host_key = match (self.api_version, endpoint) {
            (3, "nodes") => "name",
            _ => "certname",
        };

        Ok((endpoint, host_key, render_group(&group, host_key)))
    }

    async fn api_call(&self, endpoint: &str, ast: &Value) -> Result<Vec<Value>, CuminError> {
        let url = format!("{}{}", self.base_url, endpoint);

        let request = if self.api_version == 3 {
            self.client
                .get(&url)
                .query(&[("query", ast.to_string())])
        } else {
            self.client.post(&url).json(&json!({ "query": ast }))
        };

        let response = request
            .send()
            .await
            .map_err(|e| CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("request to {} failed: {}", url, e),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(CuminError::BackendAuth {
                backend: BACKEND,
                message: format!("PuppetDB rejected the credentials: HTTP {}", status),
            });
        }
        if !status.is_success() {
            return Err(CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("PuppetDB returned HTTP {} for {}", status, url),
            });
        }

        response
            .json()
            .await
            .map_err(|e| CuminError::BackendUnreachable {
                backend: BACKEND,
                message: format!("unable to decode the PuppetDB response: {}", e),
            })
    }
}

#[async_trait]
impl Backend for PuppetDBQuery {
    fn prefix(&self) -> char {
        'P'
    }

    fn name(&self) -> &'static str {
        "puppetdb"
    }

    async fn resolve(&self, payload: &str) -> Result<NodeSet, CuminError> {
        let (endpoint, host_key, ast) = self.compile(payload)?;
        debug!(endpoint, query = %ast, "querying puppetdb");

        let items = self.api_call(endpoint, &ast).await?;
        let hosts: NodeSet = items
            .iter()
            .filter_map(|item| item.get(host_key).and_then(Value::as_str))
            .map(String::from)
            .collect();

        debug!(results = hosts.len(), "puppetdb query done");
        Ok(hosts)
    }
}

/// Flat boolean group, all operators in a group must agree
struct Group {
    bool_op: Option<&'static str>,
    tokens: Vec<TokenNode>,
}

enum TokenNode {
    Group { group: Group, neg: bool },
    Compiled(Value),
    Hosts { patterns: Vec<String>, neg: bool },
}

struct Compiler {
    endpoint: Option<&'static str>,
    api_version: u8,
}

impl Compiler {
    fn compile_expr(&mut self, pair: Pair<'_, Rule>) -> Result<Group, CuminError> {
        let mut group = Group {
            bool_op: None,
            tokens: Vec::new(),
        };

        for part in pair.into_inner() {
            match part.as_rule() {
                Rule::and_or => {
                    let op = match part.into_inner().next().map(|p| p.as_rule()) {
                        Some(Rule::and) => "and",
                        _ => "or",
                    };
                    self.set_bool(&mut group, op)?;
                }
                Rule::item => {
                    let token = self.compile_item(part)?;
                    group.tokens.push(token);
                }
                _ => {}
            }
        }

        Ok(group)
    }

    /// The original API mixes and/or within one group only through explicit
    /// parentheses; a flat group must use a single operator.
    fn set_bool(&self, group: &mut Group, op: &'static str) -> Result<(), CuminError> {
        match group.bool_op {
            None => {
                group.bool_op = Some(op);
                Ok(())
            }
            Some(current) if current == op => Ok(()),
            Some(current) => Err(CuminError::InvalidQuery {
                backend: BACKEND,
                message: format!(
                    "got unexpected '{}' boolean operator, current operator was '{}'",
                    op, current
                ),
            }),
        }
    }

    fn compile_item(&mut self, pair: Pair<'_, Rule>) -> Result<TokenNode, CuminError> {
        let mut neg = false;

        for part in pair.into_inner() {
            match part.as_rule() {
                Rule::neg => neg = true,
                Rule::token => {
                    let compiled = self.compile_token(part)?;
                    return Ok(TokenNode::Compiled(if neg {
                        json!(["not", compiled])
                    } else {
                        compiled
                    }));
                }
                Rule::hosts => {
                    let patterns: Vec<String> =
                        NodeSet::parse(part.as_str())?.into_iter().collect();
                    return Ok(TokenNode::Hosts { patterns, neg });
                }
                Rule::expr => {
                    let group = self.compile_expr(part)?;
                    return Ok(TokenNode::Group { group, neg });
                }
                _ => {}
            }
        }

        Err(CuminError::InvalidQuery {
            backend: BACKEND,
            message: "got an empty query item".to_string(),
        })
    }

    fn compile_token(&mut self, pair: Pair<'_, Rule>) -> Result<Value, CuminError> {
        let mut selector = "";
        let mut operator = "=";
        let mut value: Option<Value> = None;

        for part in pair.into_inner() {
            match part.as_rule() {
                Rule::selector => selector = part.as_str(),
                Rule::operator => operator = part.as_str(),
                Rule::value => value = Some(parse_value(part)),
                _ => {}
            }
        }

        let (category, key) = selector
            .split_once(':')
            .expect("selector always contains a colon");
        let category = category.to_ascii_uppercase();

        self.set_endpoint(match category.as_str() {
            "F" => "nodes",
            _ => "resources",
        })?;

        // The PuppetDB API requires every backslash in a regex to be escaped
        if operator == "~" {
            if let Some(Value::String(s)) = &value {
                value = Some(Value::String(s.replace('\\', "\\\\")));
            }
        }

        match category.as_str() {
            "F" => {
                let value = value.ok_or_else(|| missing_value(selector))?;
                Ok(json!([operator, ["fact", key], value]))
            }
            "R" => self.resource_query(key, value, operator),
            "C" | "O" | "P" => self.special_resource_query(&category, key, value, operator),
            _ => unreachable!("grammar only yields C|F|O|P|R categories"),
        }
    }

    fn set_endpoint(&mut self, endpoint: &'static str) -> Result<(), CuminError> {
        match self.endpoint {
            None => {
                self.endpoint = Some(endpoint);
                Ok(())
            }
            Some(current) if current == endpoint => Ok(()),
            Some(_) => Err(CuminError::InvalidQuery {
                backend: BACKEND,
                message: "mixed fact and resource queries are not supported, \
                          use the global grammar to mix them"
                    .to_string(),
            }),
        }
    }

    /// Build a resource query, resolving `%param` and `@field` selectors
    fn resource_query(
        &self,
        key: &str,
        value: Option<Value>,
        operator: &str,
    ) -> Result<Value, CuminError> {
        if key.contains('%') && key.contains('@') {
            return Err(CuminError::InvalidQuery {
                backend: BACKEND,
                message: "resource key cannot contain both '%' (parameter) and '@' (field)"
                    .to_string(),
            });
        }

        if let Some((resource, param)) = key.split_once('%') {
            if operator == "~" && self.api_version == 3 {
                return Err(CuminError::InvalidQuery {
                    backend: BACKEND,
                    message:
                        "regex operations are not supported in PuppetDB API v3 for resource \
                         parameters"
                            .to_string(),
                });
            }
            let value = value.ok_or_else(|| missing_value(key))?;
            return Ok(json!([
                "and",
                ["=", "type", capitalize_segments(resource)],
                [operator, ["parameter", param], value]
            ]));
        }

        if let Some((resource, field)) = key.split_once('@') {
            if !RESOURCE_FIELDS.contains(&field) {
                return Err(CuminError::InvalidQuery {
                    backend: BACKEND,
                    message: format!(
                        "invalid resource field '{}', expected one of: {}",
                        field,
                        RESOURCE_FIELDS.join(", ")
                    ),
                });
            }
            let value = value.ok_or_else(|| missing_value(key))?;
            return Ok(json!([
                "and",
                ["=", "type", capitalize_segments(resource)],
                [operator, field, value]
            ]));
        }

        match value {
            None => Ok(json!(["and", ["=", "type", capitalize_segments(key)]])),
            Some(mut title) => {
                if key.eq_ignore_ascii_case("class") && operator != "~" {
                    if let Value::String(s) = &title {
                        title = Value::String(capitalize_segments(s));
                    }
                }
                Ok(json!([
                    "and",
                    ["=", "type", capitalize_segments(key)],
                    [operator, "title", title]
                ]))
            }
        }
    }

    /// Build the C/O/P shortcut queries over resources of type Class
    fn special_resource_query(
        &self,
        category: &str,
        key: &str,
        value: Option<Value>,
        operator: &str,
    ) -> Result<Value, CuminError> {
        if key.contains('%') && key.contains('@') {
            return Err(CuminError::InvalidQuery {
                backend: BACKEND,
                message: "resource key cannot contain both '%' (parameter) and '@' (field)"
                    .to_string(),
            });
        }

        let (base_key, special) = if let Some((base, param)) = key.split_once('%') {
            (base, Some(('%', param)))
        } else if let Some((base, field)) = key.split_once('@') {
            (base, Some(('@', field)))
        } else {
            if value.is_some() {
                return Err(CuminError::InvalidQuery {
                    backend: BACKEND,
                    message: format!(
                        "invalid query of the form '{}:key = value', matching a value is \
                         accepted only with %param or @field",
                        category
                    ),
                });
            }
            (key, None)
        };

        let title = match category {
            "O" => format!("Role::{}", base_key),
            "P" => format!("Profile::{}", base_key),
            _ => base_key.to_string(),
        };

        let base = self.resource_query("Class", Some(Value::String(title)), "=")?;

        match special {
            None => Ok(base),
            Some((marker, param)) => {
                let param_query =
                    self.resource_query(&format!("Class{}{}", marker, param), value, operator)?;
                Ok(json!(["and", base, param_query]))
            }
        }
    }
}

fn missing_value(selector: &str) -> CuminError {
    CuminError::InvalidQuery {
        backend: BACKEND,
        message: format!("selector '{}' requires a comparison value", selector),
    }
}

/// Extract the typed value of a token
fn parse_value(pair: Pair<'_, Rule>) -> Value {
    let inner = pair.into_inner().next().expect("value wraps a concrete kind");
    let text = inner.as_str();

    match inner.as_rule() {
        Rule::hexadecimal => json!(i64::from_str_radix(&text[2..], 16).unwrap_or(0)),
        Rule::octal => json!(i64::from_str_radix(&text[1..], 8).unwrap_or(0)),
        Rule::number => {
            if text.contains('.') {
                json!(text.parse::<f64>().unwrap_or(0.0))
            } else {
                json!(text.parse::<i64>().unwrap_or(0))
            }
        }
        Rule::boolean => json!(text == "true"),
        Rule::quoted_string => Value::String(text[1..text.len() - 1].to_string()),
        _ => Value::String(text.to_string()),
    }
}

/// Capitalize the first letter of each `::`-separated segment
fn capitalize_segments(name: &str) -> String {
    name.split("::")
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("::")
}

/// Render a compiled group into the PuppetDB AST
fn render_group(group: &Group, host_key: &str) -> Value {
    let mut parts: Vec<Value> = group
        .tokens
        .iter()
        .map(|token| render_token(token, host_key))
        .collect();

    match group.bool_op {
        Some(op) => {
            let mut array = vec![Value::String(op.to_string())];
            array.append(&mut parts);
            Value::Array(array)
        }
        None => parts.pop().unwrap_or(Value::Null),
    }
}

fn render_token(token: &TokenNode, host_key: &str) -> Value {
    match token {
        TokenNode::Compiled(value) => value.clone(),
        TokenNode::Group { group, neg } => {
            let rendered = render_group(group, host_key);
            if *neg {
                json!(["not", rendered])
            } else {
                rendered
            }
        }
        TokenNode::Hosts { patterns, neg } => {
            let mut items = vec![Value::String("or".to_string())];
            for pattern in patterns {
                if pattern.contains('*') {
                    let regex = format!(
                        "^{}$",
                        pattern.replace('.', "\\.").replace('*', ".*")
                    );
                    items.push(json!(["~", host_key, regex]));
                } else {
                    items.push(json!(["=", host_key, pattern]));
                }
            }

            let hosts = Value::Array(items);
            if *neg {
                json!(["not", hosts])
            } else {
                hosts
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> PuppetDBQuery {
        PuppetDBQuery::new(&Config::default()).unwrap()
    }

    fn backend_v3() -> PuppetDBQuery {
        let mut config = Config::default();
        config.puppetdb.api_version = 3;
        PuppetDBQuery::new(&config).unwrap()
    }

    #[test]
    fn test_hosts_default_endpoint() {
        let (endpoint, host_key, ast) = backend().compile("host1 or host2").unwrap();
        assert_eq!(endpoint, "nodes");
        assert_eq!(host_key, "certname");
        assert_eq!(
            ast,
            json!(["or", ["or", ["=", "certname", "host1"]], ["or", ["=", "certname", "host2"]]])
        );
    }

    #[test]
    fn test_hosts_v3_host_key() {
        let (_, host_key, ast) = backend_v3().compile("host1").unwrap();
        assert_eq!(host_key, "name");
        assert_eq!(ast, json!(["or", ["=", "name", "host1"]]));
    }

    #[test]
    fn test_host_glob_becomes_regex() {
        let (_, _, ast) = backend().compile("host1*.domain").unwrap();
        assert_eq!(
            ast,
            json!(["or", ["~", "certname", "^host1.*\\.domain$"]])
        );
    }

    #[test]
    fn test_host_nodeset_expansion() {
        let (_, _, ast) = backend().compile("web[1-2].dom").unwrap();
        assert_eq!(
            ast,
            json!(["or", ["=", "certname", "web1.dom"], ["=", "certname", "web2.dom"]])
        );
    }

    #[test]
    fn test_fact_query() {
        let (endpoint, _, ast) = backend().compile("F:key = value1").unwrap();
        assert_eq!(endpoint, "nodes");
        assert_eq!(ast, json!(["=", ["fact", "key"], "value1"]));
    }

    #[test]
    fn test_fact_numeric_comparison() {
        let (_, _, ast) = backend().compile("F:physicalcorecount > 2").unwrap();
        assert_eq!(ast, json!([">", ["fact", "physicalcorecount"], 2]));
    }

    #[test]
    fn test_fact_value_types() {
        let (_, _, ast) = backend().compile("F:is_virtual = true").unwrap();
        assert_eq!(ast, json!(["=", ["fact", "is_virtual"], true]));

        let (_, _, ast) = backend().compile("F:load = 23.5").unwrap();
        assert_eq!(ast, json!(["=", ["fact", "load"], 23.5]));

        let (_, _, ast) = backend().compile("F:mask = 0x1f").unwrap();
        assert_eq!(ast, json!(["=", ["fact", "mask"], 31]));

        let (_, _, ast) = backend().compile("F:mode = 0755").unwrap();
        assert_eq!(ast, json!(["=", ["fact", "mode"], 493]));
    }

    #[test]
    fn test_resource_type_only() {
        let (endpoint, _, ast) = backend().compile("R:nginx::worker").unwrap();
        assert_eq!(endpoint, "resources");
        assert_eq!(ast, json!(["and", ["=", "type", "Nginx::Worker"]]));
    }

    #[test]
    fn test_resource_title_class_capitalized() {
        let (_, _, ast) = backend().compile("R:Class = mymodule::myclass").unwrap();
        assert_eq!(
            ast,
            json!(["and", ["=", "type", "Class"], ["=", "title", "Mymodule::Myclass"]])
        );
    }

    #[test]
    fn test_resource_title_regex_not_capitalized() {
        let (_, _, ast) = backend().compile("R:Class ~ 'my.*'").unwrap();
        assert_eq!(
            ast,
            json!(["and", ["=", "type", "Class"], ["~", "title", "my.*"]])
        );
    }

    #[test]
    fn test_regex_backslash_doubling() {
        let (_, _, ast) = backend().compile(r"F:key ~ 'a\.b'").unwrap();
        assert_eq!(ast, json!(["~", ["fact", "key"], "a\\\\.b"]));
    }

    #[test]
    fn test_resource_field() {
        let (_, _, ast) = backend().compile("R:Exec@line = 15").unwrap();
        assert_eq!(
            ast,
            json!(["and", ["=", "type", "Exec"], ["=", "line", 15]])
        );
    }

    #[test]
    fn test_resource_invalid_field() {
        let result = backend().compile("R:Exec@bogus = 15");
        assert!(matches!(result, Err(CuminError::InvalidQuery { .. })));
    }

    #[test]
    fn test_resource_parameter() {
        let (_, _, ast) = backend().compile("R:Service%ensure = running").unwrap();
        assert_eq!(
            ast,
            json!(["and", ["=", "type", "Service"], ["=", ["parameter", "ensure"], "running"]])
        );
    }

    #[test]
    fn test_resource_parameter_regex_v3_rejected() {
        let result = backend_v3().compile("R:Service%ensure ~ 'run.*'");
        assert!(matches!(result, Err(CuminError::InvalidQuery { .. })));

        // Same query is fine on API v4
        assert!(backend().compile("R:Service%ensure ~ 'run.*'").is_ok());
    }

    #[test]
    fn test_class_shortcut() {
        let (_, _, ast) = backend().compile("C:Foo::Bar").unwrap();
        assert_eq!(
            ast,
            json!(["and", ["=", "type", "Class"], ["=", "title", "Foo::Bar"]])
        );
    }

    #[test]
    fn test_role_and_profile_shortcuts() {
        let (_, _, ast) = backend().compile("O:myrole").unwrap();
        assert_eq!(
            ast,
            json!(["and", ["=", "type", "Class"], ["=", "title", "Role::Myrole"]])
        );

        let (_, _, ast) = backend().compile("P:myprofile").unwrap();
        assert_eq!(
            ast,
            json!(["and", ["=", "type", "Class"], ["=", "title", "Profile::Myprofile"]])
        );
    }

    #[test]
    fn test_class_shortcut_with_parameter() {
        let (_, _, ast) = backend().compile("P:mail%exim = present").unwrap();
        assert_eq!(
            ast,
            json!([
                "and",
                ["and", ["=", "type", "Class"], ["=", "title", "Profile::Mail"]],
                ["and", ["=", "type", "Class"], ["=", ["parameter", "exim"], "present"]]
            ])
        );
    }

    #[test]
    fn test_class_shortcut_value_rejected() {
        let result = backend().compile("C:Foo = bar");
        assert!(matches!(result, Err(CuminError::InvalidQuery { .. })));
    }

    #[test]
    fn test_negation() {
        let (_, _, ast) = backend().compile("not F:key = value1").unwrap();
        assert_eq!(ast, json!(["not", ["=", ["fact", "key"], "value1"]]));
    }

    #[test]
    fn test_boolean_grouping() {
        let (_, _, ast) = backend()
            .compile("F:a = 1 and (F:b = 2 or F:c = 3)")
            .unwrap();
        assert_eq!(
            ast,
            json!([
                "and",
                ["=", ["fact", "a"], 1],
                ["or", ["=", ["fact", "b"], 2], ["=", ["fact", "c"], 3]]
            ])
        );
    }

    #[test]
    fn test_mixed_operators_without_parens_rejected() {
        let result = backend().compile("F:a = 1 and F:b = 2 or F:c = 3");
        assert!(matches!(result, Err(CuminError::InvalidQuery { .. })));
    }

    #[test]
    fn test_mixed_endpoints_rejected() {
        let result = backend().compile("F:a = 1 and R:Class = Foo");
        assert!(matches!(result, Err(CuminError::InvalidQuery { .. })));
    }

    #[test]
    fn test_param_and_field_together_rejected() {
        let result = backend().compile("R:Type%param@field = 1");
        assert!(matches!(result, Err(CuminError::InvalidQuery { .. })));
    }

    #[test]
    fn test_invalid_api_version() {
        let mut config = Config::default();
        config.puppetdb.api_version = 5;
        assert!(PuppetDBQuery::new(&config).is_err());
    }
}
