//! Predicate trees for query filtering.
//!
//! A [`Predicate`] is the wire-form filter tree: comparator leaves over row
//! attributes plus `and`/`or`/`not` combinators. Engines compile it once per
//! query into a [`CompiledPredicate`] (regexes and `like` patterns are
//! compiled at that point) and evaluate the compiled form per row.
//!
//! # Evaluation rules
//!
//! - A comparator on a missing attribute is `false`, with one exception:
//!   `eq` against explicit null matches a present null attribute.
//! - `like` uses SQL wildcards `%` (any run) and `_` (one character),
//!   case-insensitively.
//! - `between` is inclusive on both ends.
//! - Empty `and` is `true`; empty `or` is `false`; `not` of an absent
//!   operand is `true`.
//! - Order comparators require comparable types (numbers compare across
//!   int/float); mismatched types are `false`, never an error.

use serde::{Deserialize, Serialize};

use crate::text::tokenize;
use crate::value::Value;

/// Sort direction for query ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One sort key in a query's ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    /// Attribute to sort by. `_score` is the virtual relevance field.
    pub attribute: String,
    /// Ascending or descending.
    pub direction: SortDirection,
}

/// Wire-form predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Predicate {
    Eq { attribute: String, value: Value },
    Neq { attribute: String, value: Value },
    Lt { attribute: String, value: Value },
    Lte { attribute: String, value: Value },
    Gt { attribute: String, value: Value },
    Gte { attribute: String, value: Value },
    Between { attribute: String, low: Value, high: Value },
    Like { attribute: String, pattern: String },
    Regex { attribute: String, pattern: String },
    Match { attribute: String, query: String },
    MatchPhrase { attribute: String, query: String },
    MatchPrefix { attribute: String, query: String },
    And { children: Vec<Predicate> },
    Or { children: Vec<Predicate> },
    Not {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        child: Option<Box<Predicate>>,
    },
}

/// A pattern in the tree failed to compile.
#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error("invalid regex pattern `{pattern}`: {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
    #[error("invalid like pattern `{pattern}`: {source}")]
    Like {
        pattern: String,
        source: regex::Error,
    },
}

impl Predicate {
    /// Compiles the tree for evaluation.
    ///
    /// # Errors
    ///
    /// [`PredicateError`] when a `regex` or `like` pattern does not compile.
    pub fn compile(&self) -> Result<CompiledPredicate, PredicateError> {
        let node = match self {
            Predicate::Eq { attribute, value } => {
                Node::Eq(attribute.clone(), value.clone())
            }
            Predicate::Neq { attribute, value } => {
                Node::Neq(attribute.clone(), value.clone())
            }
            Predicate::Lt { attribute, value } => {
                Node::Cmp(attribute.clone(), value.clone(), CmpOp::Lt)
            }
            Predicate::Lte { attribute, value } => {
                Node::Cmp(attribute.clone(), value.clone(), CmpOp::Lte)
            }
            Predicate::Gt { attribute, value } => {
                Node::Cmp(attribute.clone(), value.clone(), CmpOp::Gt)
            }
            Predicate::Gte { attribute, value } => {
                Node::Cmp(attribute.clone(), value.clone(), CmpOp::Gte)
            }
            Predicate::Between { attribute, low, high } => {
                Node::Between(attribute.clone(), low.clone(), high.clone())
            }
            Predicate::Like { attribute, pattern } => {
                let regex = compile_like(pattern).map_err(|source| PredicateError::Like {
                    pattern: pattern.clone(),
                    source,
                })?;
                Node::Regex(attribute.clone(), regex)
            }
            Predicate::Regex { attribute, pattern } => {
                let regex = regex::Regex::new(pattern).map_err(|source| PredicateError::Regex {
                    pattern: pattern.clone(),
                    source,
                })?;
                Node::Regex(attribute.clone(), regex)
            }
            Predicate::Match { attribute, query } => {
                Node::Text(attribute.clone(), tokenize(query), TextOp::AllTerms)
            }
            Predicate::MatchPhrase { attribute, query } => {
                Node::Text(attribute.clone(), tokenize(query), TextOp::Phrase)
            }
            Predicate::MatchPrefix { attribute, query } => {
                Node::Text(attribute.clone(), tokenize(query), TextOp::Prefix)
            }
            Predicate::And { children } => Node::And(compile_all(children)?),
            Predicate::Or { children } => Node::Or(compile_all(children)?),
            Predicate::Not { child } => Node::Not(match child {
                Some(inner) => Some(Box::new(inner.compile()?.root)),
                None => None,
            }),
        };
        Ok(CompiledPredicate { root: node })
    }
}

fn compile_all(children: &[Predicate]) -> Result<Vec<Node>, PredicateError> {
    children
        .iter()
        .map(|c| c.compile().map(|p| p.root))
        .collect()
}

/// Translates a SQL `like` pattern into an anchored, case-insensitive regex.
fn compile_like(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?is)^");
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    regex::Regex::new(&out)
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, Copy)]
enum TextOp {
    AllTerms,
    Phrase,
    Prefix,
}

#[derive(Debug)]
enum Node {
    Eq(String, Value),
    Neq(String, Value),
    Cmp(String, Value, CmpOp),
    Between(String, Value, Value),
    Regex(String, regex::Regex),
    Text(String, Vec<String>, TextOp),
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Option<Box<Node>>),
}

/// A compiled, evaluation-ready predicate.
#[derive(Debug)]
pub struct CompiledPredicate {
    root: Node,
}

impl CompiledPredicate {
    /// Whether a row matches.
    #[must_use]
    pub fn matches(&self, row: &Value) -> bool {
        eval(&self.root, row)
    }
}

fn eval(node: &Node, row: &Value) -> bool {
    match node {
        Node::Eq(attribute, expected) => match row.attribute(attribute) {
            Some(actual) => values_equal(actual, expected),
            None => false,
        },
        Node::Neq(attribute, expected) => match row.attribute(attribute) {
            Some(actual) => !values_equal(actual, expected),
            None => false,
        },
        Node::Cmp(attribute, bound, op) => {
            let Some(actual) = row.attribute(attribute) else {
                return false;
            };
            let Some(ordering) = compare(actual, bound) else {
                return false;
            };
            match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Lte => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Gte => ordering.is_ge(),
            }
        }
        Node::Between(attribute, low, high) => {
            let Some(actual) = row.attribute(attribute) else {
                return false;
            };
            let (Some(lo), Some(hi)) = (compare(actual, low), compare(actual, high)) else {
                return false;
            };
            lo.is_ge() && hi.is_le()
        }
        Node::Regex(attribute, regex) => row
            .attribute(attribute)
            .and_then(Value::as_str)
            .is_some_and(|text| regex.is_match(text)),
        Node::Text(attribute, terms, op) => row
            .attribute(attribute)
            .and_then(Value::as_str)
            .is_some_and(|text| text_matches(&tokenize(text), terms, *op)),
        Node::And(children) => children.iter().all(|c| eval(c, row)),
        Node::Or(children) => children.iter().any(|c| eval(c, row)),
        Node::Not(child) => match child {
            Some(inner) => !eval(inner, row),
            None => true,
        },
    }
}

/// Equality with cross-type numeric comparison (`2 == 2.0`).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering between two values when their types are comparable.
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let comparable = matches!(
        (a, b),
        (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Bytes(_), Value::Bytes(_))
    ) || (a.as_f64().is_some() && b.as_f64().is_some());
    comparable.then(|| a.cmp_sort(b))
}

fn text_matches(doc_tokens: &[String], terms: &[String], op: TextOp) -> bool {
    if terms.is_empty() {
        return false;
    }
    match op {
        TextOp::AllTerms => terms
            .iter()
            .all(|term| doc_tokens.iter().any(|t| t == term)),
        TextOp::Phrase => doc_tokens
            .windows(terms.len())
            .any(|window| window == terms),
        TextOp::Prefix => {
            let (last, head) = terms.split_last().expect("terms checked non-empty");
            head.iter()
                .all(|term| doc_tokens.iter().any(|t| t == term))
                && doc_tokens.iter().any(|t| t.starts_with(last.as_str()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Value {
        Value::Map(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
    }

    fn matches(predicate: &Predicate, r: &Value) -> bool {
        predicate.compile().expect("compile").matches(r)
    }

    #[test]
    fn eq_and_neq() {
        let r = row(&[("name", Value::from("Alice")), ("age", Value::Int(30))]);
        assert!(matches(
            &Predicate::Eq {
                attribute: "name".into(),
                value: Value::from("Alice")
            },
            &r
        ));
        assert!(matches(
            &Predicate::Neq {
                attribute: "name".into(),
                value: Value::from("Bob")
            },
            &r
        ));
        // Missing attribute: both eq and neq are false.
        assert!(!matches(
            &Predicate::Eq {
                attribute: "missing".into(),
                value: Value::from("x")
            },
            &r
        ));
        assert!(!matches(
            &Predicate::Neq {
                attribute: "missing".into(),
                value: Value::from("x")
            },
            &r
        ));
    }

    #[test]
    fn eq_null_matches_explicit_null_only() {
        let explicit = row(&[("deleted", Value::Null)]);
        let absent = row(&[]);
        let p = Predicate::Eq {
            attribute: "deleted".into(),
            value: Value::Null,
        };
        assert!(matches(&p, &explicit));
        assert!(!matches(&p, &absent));
    }

    #[test]
    fn numeric_comparators_cross_int_float() {
        let r = row(&[("score", Value::Float(7.5))]);
        assert!(matches(
            &Predicate::Gt {
                attribute: "score".into(),
                value: Value::Int(7)
            },
            &r
        ));
        assert!(matches(
            &Predicate::Lte {
                attribute: "score".into(),
                value: Value::Float(7.5)
            },
            &r
        ));
        assert!(!matches(
            &Predicate::Lt {
                attribute: "score".into(),
                value: Value::Int(7)
            },
            &r
        ));
    }

    #[test]
    fn comparator_on_mismatched_types_is_false() {
        let r = row(&[("score", Value::from("high"))]);
        assert!(!matches(
            &Predicate::Gt {
                attribute: "score".into(),
                value: Value::Int(1)
            },
            &r
        ));
    }

    #[test]
    fn between_is_inclusive_on_both_ends() {
        let p = |v: i64| Predicate::Between {
            attribute: "n".into(),
            low: Value::Int(3),
            high: Value::Int(5),
        }
        .compile()
        .unwrap()
        .matches(&row(&[("n", Value::Int(v))]));
        assert!(!p(2));
        assert!(p(3));
        assert!(p(4));
        assert!(p(5));
        assert!(!p(6));
    }

    #[test]
    fn between_with_equal_bounds_matches_that_point() {
        let p = Predicate::Between {
            attribute: "n".into(),
            low: Value::Int(4),
            high: Value::Int(4),
        };
        assert!(matches(&p, &row(&[("n", Value::Int(4))])));
        assert!(!matches(&p, &row(&[("n", Value::Int(5))])));
    }

    #[test]
    fn like_uses_sql_wildcards_case_insensitively() {
        let r = row(&[("email", Value::from("Alice@Example.COM"))]);
        let like = |pattern: &str| {
            matches(
                &Predicate::Like {
                    attribute: "email".into(),
                    pattern: pattern.into(),
                },
                &r,
            )
        };
        assert!(like("%@example.com"));
        assert!(like("alice@_xample.com"));
        assert!(!like("bob@%"));
        // Regex metacharacters in the pattern are literal.
        assert!(!like("alice@example.c.m"));
        assert!(like("alice@example.c_m"));
    }

    #[test]
    fn regex_leaf() {
        let r = row(&[("sku", Value::from("AB-1234"))]);
        assert!(matches(
            &Predicate::Regex {
                attribute: "sku".into(),
                pattern: "^AB-\\d{4}$".into(),
            },
            &r
        ));
        assert!(Predicate::Regex {
            attribute: "sku".into(),
            pattern: "(".into(),
        }
        .compile()
        .is_err());
    }

    #[test]
    fn match_leaves() {
        let r = row(&[("bio", Value::from("Rust systems programming, and sailing"))]);
        let m = |p: Predicate| matches(&p, &r);
        assert!(m(Predicate::Match {
            attribute: "bio".into(),
            query: "sailing rust".into(),
        }));
        assert!(!m(Predicate::Match {
            attribute: "bio".into(),
            query: "rust cooking".into(),
        }));
        assert!(m(Predicate::MatchPhrase {
            attribute: "bio".into(),
            query: "systems programming".into(),
        }));
        assert!(!m(Predicate::MatchPhrase {
            attribute: "bio".into(),
            query: "programming systems".into(),
        }));
        assert!(m(Predicate::MatchPrefix {
            attribute: "bio".into(),
            query: "sail".into(),
        }));
        assert!(m(Predicate::MatchPrefix {
            attribute: "bio".into(),
            query: "rust sail".into(),
        }));
        assert!(!m(Predicate::MatchPrefix {
            attribute: "bio".into(),
            query: "cooking sail".into(),
        }));
    }

    #[test]
    fn vacuous_combinators() {
        let r = row(&[]);
        assert!(matches(&Predicate::And { children: vec![] }, &r));
        assert!(!matches(&Predicate::Or { children: vec![] }, &r));
        assert!(matches(&Predicate::Not { child: None }, &r));
    }

    #[test]
    fn nested_combinators() {
        let r = row(&[("age", Value::Int(25)), ("active", Value::Bool(true))]);
        let p = Predicate::And {
            children: vec![
                Predicate::Gte {
                    attribute: "age".into(),
                    value: Value::Int(18),
                },
                Predicate::Or {
                    children: vec![
                        Predicate::Eq {
                            attribute: "active".into(),
                            value: Value::Bool(true),
                        },
                        Predicate::Eq {
                            attribute: "role".into(),
                            value: Value::from("admin"),
                        },
                    ],
                },
                Predicate::Not {
                    child: Some(Box::new(Predicate::Eq {
                        attribute: "banned".into(),
                        value: Value::Bool(true),
                    })),
                },
            ],
        };
        assert!(matches(&p, &r));
    }

    #[test]
    fn wire_roundtrip() {
        let p = Predicate::And {
            children: vec![
                Predicate::Like {
                    attribute: "name".into(),
                    pattern: "a%".into(),
                },
                Predicate::Not { child: None },
            ],
        };
        let bytes = rmp_serde::to_vec_named(&p).expect("serialize");
        let decoded: Predicate = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(p, decoded);
    }
}
