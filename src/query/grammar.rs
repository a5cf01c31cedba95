// Global grammar parser and recursive alias resolution

use std::collections::HashMap;

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use tracing::trace;

use crate::backends::BoolOperator;
use crate::output::errors::{CuminError, ParseError};

#[derive(Parser)]
#[grammar = "query/grammar.pest"]
struct GlobalParser;

/// Parsed composite query tree.
///
/// Aliases are already expanded: an alias atom is replaced at parse time by
/// the parsed tree of its replacement text.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryAst {
    /// A backend-specific subquery, payload opaque to the global grammar
    Backend { prefix: char, payload: String },
    /// A parenthesized group or expansion: items with their joining operator.
    /// The first operator is always `None`.
    Group(Vec<(Option<BoolOperator>, QueryAst)>),
}

/// Parse a composite query, recursively expanding aliases.
///
/// A name already on the current expansion path raises `CyclicAlias`; a name
/// missing from the table raises `UnknownAlias`.
pub fn parse_query(
    query: &str,
    aliases: &HashMap<String, String>,
) -> Result<QueryAst, CuminError> {
    let mut path = Vec::new();
    parse_with_path(query, aliases, &mut path)
}

fn parse_with_path(
    query: &str,
    aliases: &HashMap<String, String>,
    path: &mut Vec<String>,
) -> Result<QueryAst, CuminError> {
    let trimmed = query.trim();
    trace!(query = trimmed, "parsing global query");

    let mut pairs = GlobalParser::parse(Rule::query, trimmed).map_err(|e| {
        let position = match e.location {
            pest::error::InputLocation::Pos(p) => Some(p),
            pest::error::InputLocation::Span((start, _)) => Some(start),
        };
        CuminError::Parse(Box::new(ParseError {
            message: format!("unable to parse the query with the global grammar: {}", e.variant.message()),
            query: trimmed.to_string(),
            position,
            suggestion: Some(
                "expected items like B{backend query} or A:alias joined by \
                 'and', 'and not', 'or', 'xor'"
                    .to_string(),
            ),
        }))
    })?;

    let query_pair = pairs.next().expect("grammar yields one query");
    let expr = query_pair
        .into_inner()
        .find(|p| p.as_rule() == Rule::expr)
        .expect("query contains expr");

    build_expr(expr, aliases, path)
}

fn build_expr(
    pair: Pair<'_, Rule>,
    aliases: &HashMap<String, String>,
    path: &mut Vec<String>,
) -> Result<QueryAst, CuminError> {
    let mut items = Vec::new();
    let mut operator: Option<BoolOperator> = None;

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::bool_op => {
                operator = Some(parse_operator(&part));
            }
            Rule::item => {
                let op = if items.is_empty() { None } else { operator };
                items.push((op, build_item(part, aliases, path)?));
            }
            _ => {}
        }
    }

    Ok(QueryAst::Group(items))
}

fn build_item(
    pair: Pair<'_, Rule>,
    aliases: &HashMap<String, String>,
    path: &mut Vec<String>,
) -> Result<QueryAst, CuminError> {
    let inner = pair
        .into_inner()
        .next()
        .expect("item contains one alternative");

    match inner.as_rule() {
        Rule::backend_query => {
            let mut prefix = ' ';
            let mut payload = String::new();
            for part in inner.into_inner() {
                match part.as_rule() {
                    Rule::prefix => {
                        prefix = part
                            .as_str()
                            .chars()
                            .next()
                            .expect("prefix is one character")
                            .to_ascii_uppercase();
                    }
                    Rule::payload => payload = part.as_str().trim().to_string(),
                    _ => {}
                }
            }
            Ok(QueryAst::Backend { prefix, payload })
        }
        Rule::alias => {
            let name = inner
                .into_inner()
                .find(|p| p.as_rule() == Rule::alias_name)
                .expect("alias contains a name")
                .as_str()
                .to_string();
            expand_alias(name, aliases, path)
        }
        Rule::expr => build_expr(inner, aliases, path),
        rule => unreachable!("unexpected rule in item: {:?}", rule),
    }
}

fn expand_alias(
    name: String,
    aliases: &HashMap<String, String>,
    path: &mut Vec<String>,
) -> Result<QueryAst, CuminError> {
    if path.contains(&name) {
        let mut chain = path.clone();
        chain.push(name.clone());
        return Err(CuminError::CyclicAlias { alias: name, path: chain });
    }

    let replacement = aliases
        .get(&name)
        .ok_or_else(|| CuminError::UnknownAlias {
            alias: name.clone(),
        })?;

    trace!(alias = %name, replacement = %replacement, "expanding alias");

    path.push(name);
    let expanded = parse_with_path(replacement, aliases, path)?;
    path.pop();

    Ok(expanded)
}

fn parse_operator(pair: &Pair<'_, Rule>) -> BoolOperator {
    match pair
        .clone()
        .into_inner()
        .next()
        .expect("bool_op wraps a concrete operator")
        .as_rule()
    {
        Rule::and_not => BoolOperator::AndNot,
        Rule::and => BoolOperator::And,
        Rule::xor => BoolOperator::Xor,
        Rule::or => BoolOperator::Or,
        rule => unreachable!("unexpected operator rule: {:?}", rule),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_aliases() -> HashMap<String, String> {
        HashMap::new()
    }

    fn backend(prefix: char, payload: &str) -> QueryAst {
        QueryAst::Backend {
            prefix,
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_single_backend_query() {
        let ast = parse_query("D{host1.domain}", &no_aliases()).unwrap();
        assert_eq!(ast, QueryAst::Group(vec![(None, backend('D', "host1.domain"))]));
    }

    #[test]
    fn test_operators_and_groups() {
        let ast = parse_query("(D{h1} or D{h2}) and not D{h2}", &no_aliases()).unwrap();
        let QueryAst::Group(items) = ast else {
            panic!("expected a group")
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].0, Some(BoolOperator::AndNot));
        assert_eq!(items[1].1, backend('D', "h2"));
    }

    #[test]
    fn test_prefix_case_insensitive() {
        let ast = parse_query("d{h1}", &no_aliases()).unwrap();
        assert_eq!(ast, QueryAst::Group(vec![(None, backend('D', "h1"))]));
    }

    #[test]
    fn test_payload_with_braces_in_quotes() {
        let ast = parse_query(r#"P{F:key = "}"}"#, &no_aliases()).unwrap();
        assert_eq!(
            ast,
            QueryAst::Group(vec![(None, backend('P', r#"F:key = "}""#))])
        );
    }

    #[test]
    fn test_alias_expansion() {
        let mut aliases = no_aliases();
        aliases.insert("web".to_string(), "D{w1} or D{w2}".to_string());

        let ast = parse_query("A:web and not D{w2}", &aliases).unwrap();
        let QueryAst::Group(items) = ast else {
            panic!("expected a group")
        };
        // The alias atom is replaced by its parsed subtree
        assert_eq!(
            items[0].1,
            QueryAst::Group(vec![
                (None, backend('D', "w1")),
                (Some(BoolOperator::Or), backend('D', "w2")),
            ])
        );
        assert_eq!(items[1].0, Some(BoolOperator::AndNot));
    }

    #[test]
    fn test_nested_aliases() {
        let mut aliases = no_aliases();
        aliases.insert("web".to_string(), "D{w1} or D{w2}".to_string());
        aliases.insert("all".to_string(), "A:web or D{db1}".to_string());

        let ast = parse_query("A:all", &aliases).unwrap();
        // Expanding twice yields the same tree
        assert_eq!(ast, parse_query("A:all", &aliases).unwrap());
    }

    #[test]
    fn test_cyclic_alias() {
        let mut aliases = no_aliases();
        aliases.insert("a".to_string(), "A:b".to_string());
        aliases.insert("b".to_string(), "A:a".to_string());

        let result = parse_query("A:a", &aliases);
        match result {
            Err(CuminError::CyclicAlias { alias, path }) => {
                assert_eq!(alias, "a");
                assert_eq!(path, vec!["a", "b", "a"]);
            }
            other => panic!("expected CyclicAlias, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unknown_alias() {
        let result = parse_query("A:missing", &no_aliases());
        assert!(matches!(result, Err(CuminError::UnknownAlias { .. })));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_query("D{h1} and", &no_aliases()).is_err());
        assert!(parse_query("(D{h1}", &no_aliases()).is_err());
        assert!(parse_query("D{h1} D{h2}", &no_aliases()).is_err());
        assert!(parse_query("host1 and host2", &no_aliases()).is_err());
        assert!(parse_query("", &no_aliases()).is_err());
    }

    #[test]
    fn test_case_insensitive_operators() {
        let ast = parse_query("D{h1} AND NOT D{h2} XOR D{h3}", &no_aliases()).unwrap();
        let QueryAst::Group(items) = ast else {
            panic!("expected a group")
        };
        assert_eq!(items[1].0, Some(BoolOperator::AndNot));
        assert_eq!(items[2].0, Some(BoolOperator::Xor));
    }
}
