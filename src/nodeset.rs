// NodeSet: host set with compact range expansion and folding

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, BitXorAssign, Sub, SubAssign};
use std::str::FromStr;

use crate::output::errors::CuminError;

/// A finite, unordered set of host names.
///
/// Supports the compact range syntax `host[10-42,50].domain` on input and
/// re-folds contiguous numeric suffixes on output, so that
/// `parse(render(s))` always yields `s` again. Numeric padding is preserved:
/// `host[08-10]` expands to host08, host09, host10.
///
/// A whole expression may combine literals with `,` (union), `!`
/// (difference), `&` (intersection) and `^` (symmetric difference),
/// evaluated left to right.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet {
    nodes: BTreeSet<String>,
}

/// Set operator between two parts of a nodeset expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartOp {
    Union,
    Difference,
    Intersection,
    SymmetricDifference,
}

impl NodeSet {
    /// Create an empty NodeSet
    pub fn new() -> Self {
        NodeSet::default()
    }

    /// Build a NodeSet from plain host names, no range expansion
    pub fn from_list<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NodeSet {
            nodes: hosts.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a nodeset expression, expanding all range literals
    pub fn parse(expression: &str) -> Result<Self, CuminError> {
        let expression = expression.trim();
        let mut result = NodeSet::new();

        if expression.is_empty() {
            return Ok(result);
        }

        for (op, part) in split_parts(expression)? {
            let mut expanded = NodeSet::new();
            for host in expand_literal(part, expression)? {
                expanded.nodes.insert(host);
            }

            match op {
                PartOp::Union => result |= &expanded,
                PartOp::Difference => result -= &expanded,
                PartOp::Intersection => result &= &expanded,
                PartOp::SymmetricDifference => result ^= &expanded,
            }
        }

        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, host: &str) -> bool {
        self.nodes.contains(host)
    }

    pub fn insert(&mut self, host: impl Into<String>) {
        self.nodes.insert(host.into());
    }

    /// Iterate the hosts in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|s| s.as_str())
    }

    /// The first `n` hosts in sorted order
    pub fn first_batch(&self, n: usize) -> Vec<String> {
        self.nodes.iter().take(n).cloned().collect()
    }
}

impl fmt::Display for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", fold(&self.nodes))
    }
}

impl FromStr for NodeSet {
    type Err = CuminError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeSet::parse(s)
    }
}

impl FromIterator<String> for NodeSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        NodeSet {
            nodes: iter.into_iter().collect(),
        }
    }
}

impl Extend<String> for NodeSet {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        self.nodes.extend(iter);
    }
}

impl IntoIterator for NodeSet {
    type Item = String;
    type IntoIter = std::collections::btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl BitOr for &NodeSet {
    type Output = NodeSet;

    fn bitor(self, rhs: &NodeSet) -> NodeSet {
        NodeSet {
            nodes: self.nodes.union(&rhs.nodes).cloned().collect(),
        }
    }
}

impl BitAnd for &NodeSet {
    type Output = NodeSet;

    fn bitand(self, rhs: &NodeSet) -> NodeSet {
        NodeSet {
            nodes: self.nodes.intersection(&rhs.nodes).cloned().collect(),
        }
    }
}

impl Sub for &NodeSet {
    type Output = NodeSet;

    fn sub(self, rhs: &NodeSet) -> NodeSet {
        NodeSet {
            nodes: self.nodes.difference(&rhs.nodes).cloned().collect(),
        }
    }
}

impl BitXor for &NodeSet {
    type Output = NodeSet;

    fn bitxor(self, rhs: &NodeSet) -> NodeSet {
        NodeSet {
            nodes: self
                .nodes
                .symmetric_difference(&rhs.nodes)
                .cloned()
                .collect(),
        }
    }
}

impl BitOrAssign<&NodeSet> for NodeSet {
    fn bitor_assign(&mut self, rhs: &NodeSet) {
        self.nodes.extend(rhs.nodes.iter().cloned());
    }
}

impl BitAndAssign<&NodeSet> for NodeSet {
    fn bitand_assign(&mut self, rhs: &NodeSet) {
        self.nodes.retain(|n| rhs.nodes.contains(n));
    }
}

impl SubAssign<&NodeSet> for NodeSet {
    fn sub_assign(&mut self, rhs: &NodeSet) {
        self.nodes.retain(|n| !rhs.nodes.contains(n));
    }
}

impl BitXorAssign<&NodeSet> for NodeSet {
    fn bitxor_assign(&mut self, rhs: &NodeSet) {
        *self = &*self ^ rhs;
    }
}

fn parse_error(message: impl Into<String>, expression: &str) -> CuminError {
    CuminError::parse(message, expression)
}

/// Split an expression on top-level `,` `!` `&` `^`, keeping the operator
/// that precedes each part. Separators inside brackets belong to range lists.
fn split_parts(expression: &str) -> Result<Vec<(PartOp, &str)>, CuminError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut op = PartOp::Union;
    let mut start = 0usize;

    for (i, c) in expression.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| parse_error("unbalanced ']' in nodeset", expression))?;
            }
            ',' | '!' | '&' | '^' if depth == 0 => {
                let part = &expression[start..i];
                if part.is_empty() && !(parts.is_empty() && c != ',') {
                    return Err(parse_error("empty element in nodeset", expression));
                }
                if !part.is_empty() {
                    parts.push((op, part));
                }
                op = match c {
                    ',' => PartOp::Union,
                    '!' => PartOp::Difference,
                    '&' => PartOp::Intersection,
                    _ => PartOp::SymmetricDifference,
                };
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(parse_error("unbalanced '[' in nodeset", expression));
    }

    let last = &expression[start..];
    if last.is_empty() {
        return Err(parse_error("empty element in nodeset", expression));
    }
    parts.push((op, last));

    Ok(parts)
}

/// One piece of a range literal: fixed text or a list of numeric ranges
enum Segment {
    Text(String),
    Ranges(Vec<(u64, u64, usize)>),
}

/// Expand a single literal like `host[10-42,50].domain` into all member names.
/// Multiple bracket groups multiply out as a Cartesian product.
fn expand_literal(literal: &str, expression: &str) -> Result<Vec<String>, CuminError> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = literal.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '[' {
            text.push(c);
            continue;
        }

        if !text.is_empty() {
            segments.push(Segment::Text(std::mem::take(&mut text)));
        }

        let mut range_list = String::new();
        let mut closed = false;
        for rc in chars.by_ref() {
            match rc {
                ']' => {
                    closed = true;
                    break;
                }
                '[' => return Err(parse_error("nested '[' in range literal", expression)),
                _ => range_list.push(rc),
            }
        }
        if !closed {
            return Err(parse_error("missing ']' in range literal", expression));
        }

        segments.push(Segment::Ranges(parse_range_list(&range_list, expression)?));
    }

    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }

    // Cartesian product over the segments
    let mut names = vec![String::new()];
    for segment in &segments {
        match segment {
            Segment::Text(t) => {
                for name in &mut names {
                    name.push_str(t);
                }
            }
            Segment::Ranges(ranges) => {
                let mut next = Vec::new();
                for name in &names {
                    for &(start, end, pad) in ranges {
                        for value in start..=end {
                            let mut expanded = name.clone();
                            expanded.push_str(&render_number(value, pad));
                            next.push(expanded);
                        }
                    }
                }
                names = next;
            }
        }
    }

    Ok(names)
}

/// Parse a bracketed range list: comma-separated integers or `a-b` pairs
fn parse_range_list(list: &str, expression: &str) -> Result<Vec<(u64, u64, usize)>, CuminError> {
    if list.is_empty() {
        return Err(parse_error("empty range list", expression));
    }

    let mut ranges = Vec::new();
    for item in list.split(',') {
        let (start_str, end_str) = match item.split_once('-') {
            Some((a, b)) => (a, b),
            None => (item, item),
        };

        let start = parse_bound(start_str, expression)?;
        let end = parse_bound(end_str, expression)?;
        if start > end {
            return Err(parse_error(
                format!("reversed range '{}' in range list", item),
                expression,
            ));
        }

        ranges.push((start, end, padding_of(start_str)));
    }

    Ok(ranges)
}

fn parse_bound(digits: &str, expression: &str) -> Result<u64, CuminError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(parse_error(
            format!("invalid range bound '{}'", digits),
            expression,
        ));
    }
    digits
        .parse()
        .map_err(|_| parse_error(format!("range bound '{}' is too large", digits), expression))
}

/// Zero-padding width carried by a bound: `08` keeps width 2, `8` keeps none
fn padding_of(digits: &str) -> usize {
    if digits.len() > 1 && digits.starts_with('0') {
        digits.len()
    } else {
        0
    }
}

fn render_number(value: u64, pad: usize) -> String {
    if pad > 0 {
        format!("{:0width$}", value, width = pad)
    } else {
        value.to_string()
    }
}

/// Number of decimal digits of a value
fn decimal_len(value: u64) -> usize {
    value.to_string().len()
}

/// Re-fold a set of names into the compact range form
fn fold(nodes: &BTreeSet<String>) -> String {
    // (prefix, suffix) -> pad -> values
    let mut groups: BTreeMap<(String, String), BTreeMap<usize, BTreeSet<u64>>> = BTreeMap::new();
    let mut literals: Vec<String> = Vec::new();

    for name in nodes {
        match last_digit_run(name) {
            Some((start, end)) => {
                let digits = &name[start..end];
                match digits.parse::<u64>() {
                    Ok(value) => {
                        let key = (name[..start].to_string(), name[end..].to_string());
                        groups
                            .entry(key)
                            .or_default()
                            .entry(padding_of(digits))
                            .or_default()
                            .insert(value);
                    }
                    // Numeric run too large to fold, keep verbatim
                    Err(_) => literals.push(name.clone()),
                }
            }
            None => literals.push(name.clone()),
        }
    }

    for ((prefix, suffix), mut pads) in groups {
        // Unpadded values render identically inside a padded group as long as
        // they are at least as wide, so merge them there to fold runs like
        // 08, 09, 10 into a single range.
        let padded_widths: Vec<usize> = pads.keys().copied().filter(|w| *w > 0).collect();
        if let [width] = padded_widths[..] {
            if let Some(plain) = pads.remove(&0) {
                let (wide, narrow): (BTreeSet<u64>, BTreeSet<u64>) =
                    plain.into_iter().partition(|v| decimal_len(*v) >= width);
                if let Some(target) = pads.get_mut(&width) {
                    target.extend(wide);
                }
                if !narrow.is_empty() {
                    pads.insert(0, narrow);
                }
            }
        }

        for (pad, values) in pads {
            literals.push(fold_group(&prefix, &suffix, pad, &values));
        }
    }

    literals.sort();
    literals.join(",")
}

/// Fold one (prefix, suffix, pad) group of values into a literal
fn fold_group(prefix: &str, suffix: &str, pad: usize, values: &BTreeSet<u64>) -> String {
    let mut items: Vec<String> = Vec::new();
    let mut run: Option<(u64, u64)> = None;

    for &value in values {
        run = match run {
            Some((start, end)) if value == end + 1 => Some((start, value)),
            Some((start, end)) => {
                items.push(render_range(start, end, pad));
                Some((value, value))
            }
            None => Some((value, value)),
        };
    }
    if let Some((start, end)) = run {
        items.push(render_range(start, end, pad));
    }

    if items.len() == 1 && !items[0].contains('-') {
        format!("{}{}{}", prefix, items[0], suffix)
    } else {
        format!("{}[{}]{}", prefix, items.join(","), suffix)
    }
}

fn render_range(start: u64, end: u64, pad: usize) -> String {
    if start == end {
        render_number(start, pad)
    } else {
        format!("{}-{}", render_number(start, pad), render_number(end, pad))
    }
}

/// Byte offsets of the last maximal ASCII digit run in a name
fn last_digit_run(name: &str) -> Option<(usize, usize)> {
    let bytes = name.as_bytes();
    let mut end = bytes.len();
    while end > 0 && !bytes[end - 1].is_ascii_digit() {
        end -= 1;
    }
    if end == 0 {
        return None;
    }
    let mut start = end;
    while start > 0 && bytes[start - 1].is_ascii_digit() {
        start -= 1;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_expansion() {
        let set = NodeSet::parse("host[10-42,50].dom").unwrap();
        assert_eq!(set.len(), 34);
        assert!(set.contains("host10.dom"));
        assert!(set.contains("host42.dom"));
        assert!(set.contains("host50.dom"));
        assert!(!set.contains("host43.dom"));
    }

    #[test]
    fn test_padding_preserved() {
        let set = NodeSet::parse("host[08-10]").unwrap();
        let hosts: Vec<&str> = set.iter().collect();
        assert_eq!(hosts, vec!["host08", "host09", "host10"]);
    }

    #[test]
    fn test_cartesian_product() {
        let set = NodeSet::parse("rack[1-2]node[1-3].dom").unwrap();
        assert_eq!(set.len(), 6);
        assert!(set.contains("rack1node3.dom"));
        assert!(set.contains("rack2node1.dom"));
    }

    #[test]
    fn test_plain_hosts_and_union() {
        let set = NodeSet::parse("web1.dom,db1.dom,web1.dom").unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_inline_operators() {
        let set = NodeSet::parse("host[1-5]!host3").unwrap();
        assert_eq!(set.len(), 4);
        assert!(!set.contains("host3"));

        let set = NodeSet::parse("host[1-3]&host[2-4]").unwrap();
        assert_eq!(set.to_string(), "host[2-3]");

        let set = NodeSet::parse("host[1-3]^host[2-4]").unwrap();
        assert_eq!(set.to_string(), "host[1,4]");
    }

    #[test]
    fn test_set_operators() {
        let a = NodeSet::parse("host[1-3]").unwrap();
        let b = NodeSet::parse("host[2-4]").unwrap();

        assert_eq!((&a | &b).to_string(), "host[1-4]");
        assert_eq!((&a & &b).to_string(), "host[2-3]");
        assert_eq!((&a - &b).to_string(), "host1");
        assert_eq!((&a ^ &b).to_string(), "host[1,4]");
    }

    #[test]
    fn test_fold_contiguous() {
        let set = NodeSet::from_list(["host1.d", "host2.d", "host3.d", "host5.d"]);
        assert_eq!(set.to_string(), "host[1-3,5].d");
    }

    #[test]
    fn test_fold_padded_run() {
        let set = NodeSet::from_list(["host08", "host09", "host10"]);
        assert_eq!(set.to_string(), "host[08-10]");
    }

    #[test]
    fn test_fold_single_value_plain() {
        let set = NodeSet::from_list(["host5.dom"]);
        assert_eq!(set.to_string(), "host5.dom");
    }

    #[test]
    fn test_fold_no_digits() {
        let set = NodeSet::from_list(["alpha", "beta"]);
        assert_eq!(set.to_string(), "alpha,beta");
    }

    #[test]
    fn test_round_trip() {
        for expr in [
            "host[1-5].dom",
            "host[08-10]",
            "db[1-3].x,web[10-12].y",
            "single.host",
            "a1,b2,c3",
        ] {
            let set = NodeSet::parse(expr).unwrap();
            let rendered = set.to_string();
            let reparsed = NodeSet::parse(&rendered).unwrap();
            assert_eq!(set, reparsed, "round trip failed for {}", expr);
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(NodeSet::parse("host[1-").is_err());
        assert!(NodeSet::parse("host[]").is_err());
        assert!(NodeSet::parse("host[a-b]").is_err());
        assert!(NodeSet::parse("host[5-2]").is_err());
        assert!(NodeSet::parse("host1,,host2").is_err());
        assert!(NodeSet::parse("host]1[").is_err());
    }

    #[test]
    fn test_empty_expression() {
        let set = NodeSet::parse("").unwrap();
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");
    }

    #[test]
    fn test_first_batch_sorted() {
        let set = NodeSet::parse("host[1-5]").unwrap();
        assert_eq!(set.first_batch(2), vec!["host1", "host2"]);
    }
}
