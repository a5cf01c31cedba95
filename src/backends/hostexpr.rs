// Shared boolean host-expression parser for the direct and knownhosts backends

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use super::{aggregate, BoolOperator};
use crate::nodeset::NodeSet;
use crate::output::errors::CuminError;

#[derive(Parser)]
#[grammar = "backends/hostexpr.pest"]
struct HostExprParser;

/// Parse a host expression and evaluate it, resolving each atom through
/// `resolve_atom`. Operators are left-associative with a single precedence
/// level; parentheses are the only grouping.
pub fn evaluate<F>(
    payload: &str,
    backend: &'static str,
    resolve_atom: &F,
) -> Result<NodeSet, CuminError>
where
    F: Fn(&str) -> Result<NodeSet, CuminError>,
{
    let trimmed = payload.trim();
    let mut pairs =
        HostExprParser::parse(Rule::expression, trimmed).map_err(|e| CuminError::InvalidQuery {
            backend,
            message: format!("unable to parse query '{}': {}", trimmed, e),
        })?;

    let expression = pairs.next().expect("grammar yields one expression");
    let expr = expression
        .into_inner()
        .find(|p| p.as_rule() == Rule::expr)
        .expect("expression contains expr");

    eval_expr(expr, resolve_atom)
}

fn eval_expr<F>(pair: Pair<'_, Rule>, resolve_atom: &F) -> Result<NodeSet, CuminError>
where
    F: Fn(&str) -> Result<NodeSet, CuminError>,
{
    let mut hosts = NodeSet::new();
    let mut operator: Option<BoolOperator> = None;
    let mut first = true;

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::bool_op => {
                operator = Some(parse_operator(&part));
            }
            Rule::item => {
                let element = eval_item(part, resolve_atom)?;
                aggregate(&mut hosts, &element, if first { None } else { operator });
                first = false;
            }
            _ => {}
        }
    }

    Ok(hosts)
}

fn eval_item<F>(pair: Pair<'_, Rule>, resolve_atom: &F) -> Result<NodeSet, CuminError>
where
    F: Fn(&str) -> Result<NodeSet, CuminError>,
{
    let inner = pair
        .into_inner()
        .next()
        .expect("item contains hosts or a sub-expression");

    match inner.as_rule() {
        Rule::hosts => resolve_atom(inner.as_str()),
        Rule::expr => eval_expr(inner, resolve_atom),
        rule => unreachable!("unexpected rule in item: {:?}", rule),
    }
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
