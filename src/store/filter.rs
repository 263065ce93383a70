//! Filter expressions for the in-memory store
//!
//! Jobs carry their filter as an opaque string; only the store interprets
//! it. This store understands a small SQL-like subset:
//!
//! ```text
//! Title LIKE 'draft-%' AND Rating >= 3 AND AuthorID IS NOT NULL
//! ```
//!
//! Clauses are `field op value` joined by `AND`. `LIKE` is case-insensitive
//! with `%` and `_` wildcards; string literals use single quotes with `''`
//! as an escaped quote.

use crate::error::{Error, Result};
use crate::schema::ID_FIELD;
use crate::store::{DataObject, Scalar};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;

static CLAUSE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)^\s*"?([A-Za-z_][A-Za-z0-9_]*)"?\s*(NOT\s+LIKE|LIKE|IS\s+NOT\s+NULL|IS\s+NULL|<>|!=|<=|>=|=|<|>)\s*('(?:[^']|'')*'|-?\d+(?:\.\d+)?)?\s*"#,
    )
    .unwrap()
});

static AND_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^AND\b").unwrap());

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Text(String),
    Number(f64),
}

impl Literal {
    fn parse(raw: &str) -> Self {
        if let Some(inner) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
            Literal::Text(inner.replace("''", "'"))
        } else {
            raw.parse()
                .map(Literal::Number)
                .unwrap_or_else(|_| Literal::Text(raw.to_string()))
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like(Regex),
    NotLike(Regex),
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone)]
struct Clause {
    field: String,
    op: Op,
    value: Option<Literal>,
}

/// A parsed filter expression
#[derive(Debug, Clone)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn parse(expression: &str) -> Result<Self> {
        let fail = |reason: &str| Error::Filter {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let mut clauses = Vec::new();
        let mut rest = expression.trim();

        while !rest.is_empty() {
            let caps = CLAUSE_REGEX
                .captures(rest)
                .ok_or_else(|| fail("expected `field op value`"))?;
            let field = caps[1].to_string();
            let op_text = caps[2].split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
            let value = caps.get(3).map(|m| Literal::parse(m.as_str()));

            let op = match op_text.as_str() {
                "IS NULL" => Op::IsNull,
                "IS NOT NULL" => Op::IsNotNull,
                "LIKE" | "NOT LIKE" => {
                    let Some(Literal::Text(pattern)) = &value else {
                        return Err(fail("LIKE needs a quoted pattern"));
                    };
                    let regex = like_to_regex(pattern).map_err(|e| fail(&e.to_string()))?;
                    if op_text == "LIKE" {
                        Op::Like(regex)
                    } else {
                        Op::NotLike(regex)
                    }
                }
                "=" => Op::Eq,
                "!=" | "<>" => Op::Ne,
                "<" => Op::Lt,
                "<=" => Op::Le,
                ">" => Op::Gt,
                ">=" => Op::Ge,
                _ => return Err(fail("unsupported operator")),
            };

            let needs_value = !matches!(op, Op::IsNull | Op::IsNotNull);
            if needs_value && value.is_none() {
                return Err(fail("missing value"));
            }
            if !needs_value && value.is_some() {
                return Err(fail("IS NULL takes no value"));
            }

            clauses.push(Clause { field, op, value });

            rest = rest[caps.get(0).map_or(0, |m| m.end())..].trim_start();
            if rest.is_empty() {
                break;
            }
            let and = AND_REGEX
                .find(rest)
                .ok_or_else(|| fail("clauses must be joined with AND"))?;
            rest = rest[and.end()..].trim_start();
            if rest.is_empty() {
                return Err(fail("dangling AND"));
            }
        }

        Ok(Filter { clauses })
    }

    pub fn matches(&self, object: &DataObject) -> bool {
        self.clauses.iter().all(|clause| clause.matches(object))
    }
}

impl Clause {
    fn matches(&self, object: &DataObject) -> bool {
        let actual = if self.field == ID_FIELD {
            object.persisted_id().map(|id| Scalar::Int(id.0 as i64))
        } else {
            object.get(&self.field).cloned()
        };

        match (&self.op, actual) {
            (Op::IsNull, actual) => actual.is_none(),
            (Op::IsNotNull, actual) => actual.is_some(),
            (_, None) => false,
            (Op::Like(regex), Some(actual)) => regex.is_match(&actual.to_cell()),
            (Op::NotLike(regex), Some(actual)) => !regex.is_match(&actual.to_cell()),
            (op, Some(actual)) => {
                let Some(ordering) = self.value.as_ref().and_then(|v| compare(&actual, v)) else {
                    return false;
                };
                match op {
                    Op::Eq => ordering == Ordering::Equal,
                    Op::Ne => ordering != Ordering::Equal,
                    Op::Lt => ordering == Ordering::Less,
                    Op::Le => ordering != Ordering::Greater,
                    Op::Gt => ordering == Ordering::Greater,
                    Op::Ge => ordering != Ordering::Less,
                    _ => false,
                }
            }
        }
    }
}

fn compare(actual: &Scalar, expected: &Literal) -> Option<Ordering> {
    match expected {
        Literal::Number(n) => {
            let value = match actual {
                Scalar::Int(i) => *i as f64,
                Scalar::Float(f) => *f,
                Scalar::Bool(b) => f64::from(u8::from(*b)),
                Scalar::Text(s) => s.trim().parse().ok()?,
            };
            value.partial_cmp(n)
        }
        Literal::Text(s) => Some(actual.to_cell().as_str().cmp(s.as_str())),
    }
}

fn like_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut out = String::from("(?is)^");
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectId;

    fn article(title: &str, rating: i64) -> DataObject {
        let mut object = DataObject::new("Article")
            .with_field("Title", title)
            .with_field("Rating", rating);
        object.id = Some(ObjectId(7));
        object
    }

    #[test]
    fn test_like_prefix() {
        let filter = Filter::parse("Title LIKE 'draft-%'").unwrap();
        assert!(filter.matches(&article("draft-one", 1)));
        assert!(filter.matches(&article("DRAFT-two", 1)));
        assert!(!filter.matches(&article("final", 1)));
    }

    #[test]
    fn test_and_with_numeric_comparison() {
        let filter = Filter::parse("Title != 'x' and Rating >= 3").unwrap();
        assert!(filter.matches(&article("a", 3)));
        assert!(!filter.matches(&article("a", 2)));
        assert!(!filter.matches(&article("x", 5)));
    }

    #[test]
    fn test_null_checks_and_id() {
        let mut object = article("a", 1);
        object.set("AuthorID", None);
        assert!(Filter::parse("AuthorID IS NULL").unwrap().matches(&object));
        assert!(!Filter::parse("AuthorID IS NOT NULL").unwrap().matches(&object));
        assert!(Filter::parse("ID = 7").unwrap().matches(&object));
    }

    #[test]
    fn test_escaped_quote() {
        let filter = Filter::parse("Title = 'it''s'").unwrap();
        assert!(filter.matches(&article("it's", 0)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(Filter::parse("DROP TABLE x"), Err(Error::Filter { .. })));
        assert!(Filter::parse("Title = 'a' AND").is_err());
        assert!(Filter::parse("Title LIKE 3").is_err());
    }
}
