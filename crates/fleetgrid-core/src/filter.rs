//! Target filter query language.
//!
//! A small FIQL/RSQL dialect used to select the targets of a rollout and to
//! refine the members of individual groups:
//!
//! ```text
//! name==edge-*;(attribute.region==eu,attribute.region==us)
//! controllerid=in=(dev-1,dev-2)
//! createdat=le=1700000000000
//! ```
//!
//! `;` binds tighter than `,` (AND before OR). Parentheses group. String
//! comparisons ignore ASCII case and `*` in a value is a wildcard.

use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter expression is empty")]
    Empty,
    #[error("unexpected end of filter expression")]
    UnexpectedEnd,
    #[error("unexpected character '{found}' at position {pos}")]
    UnexpectedChar { pos: usize, found: char },
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },
}

/// Anything a filter can be evaluated against.
pub trait FilterSubject {
    fn controller_id(&self) -> &str;
    fn name(&self) -> &str;
    fn attribute(&self, key: &str) -> Option<&str>;
    /// Creation time in epoch milliseconds.
    fn created_at(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    ControllerId,
    Name,
    CreatedAt,
    Attribute(String),
}

impl Field {
    fn parse(selector: &str) -> Result<Self, FilterError> {
        let lower = selector.to_ascii_lowercase();
        match lower.as_str() {
            "id" | "controllerid" => Ok(Field::ControllerId),
            "name" => Ok(Field::Name),
            "createdat" => Ok(Field::CreatedAt),
            _ => match lower.strip_prefix("attribute.") {
                Some(key) if !key.is_empty() => {
                    // attribute keys keep their original case
                    Ok(Field::Attribute(selector["attribute.".len()..].to_string()))
                }
                _ => Err(FilterError::UnknownField(selector.to_string())),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    In,
    Out,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn parse(op: &str) -> Result<Self, FilterError> {
        match op {
            "==" => Ok(Op::Eq),
            "!=" => Ok(Op::Ne),
            "=in=" => Ok(Op::In),
            "=out=" => Ok(Op::Out),
            "=lt=" | "<" => Ok(Op::Lt),
            "=le=" | "<=" => Ok(Op::Le),
            "=gt=" | ">" => Ok(Op::Gt),
            "=ge=" | ">=" => Ok(Op::Ge),
            other => Err(FilterError::UnknownOperator(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    fn new(value: &str) -> Self {
        if !value.contains('*') {
            return Matcher::Exact(value.to_string());
        }
        let body = value
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        // escaped literal pieces joined by `.*` always form a valid pattern
        match Regex::new(&format!("(?i)^{body}$")) {
            Ok(re) => Matcher::Pattern(re),
            Err(_) => Matcher::Exact(value.to_string()),
        }
    }

    fn matches(&self, actual: &str) -> bool {
        match self {
            Matcher::Exact(v) => v.eq_ignore_ascii_case(actual),
            Matcher::Pattern(re) => re.is_match(actual),
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    All,
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare {
        field: Field,
        op: Op,
        values: Vec<String>,
        matchers: Vec<Matcher>,
    },
}

impl Expr {
    fn eval<S: FilterSubject + ?Sized>(&self, subject: &S) -> bool {
        match self {
            Expr::All => true,
            Expr::And(items) => items.iter().all(|e| e.eval(subject)),
            Expr::Or(items) => items.iter().any(|e| e.eval(subject)),
            Expr::Compare {
                field,
                op,
                values,
                matchers,
            } => compare(subject, field, *op, values, matchers),
        }
    }
}

fn compare<S: FilterSubject + ?Sized>(
    subject: &S,
    field: &Field,
    op: Op,
    values: &[String],
    matchers: &[Matcher],
) -> bool {
    if let Field::CreatedAt = field {
        let actual = subject.created_at();
        // values were validated as integers while parsing
        let nums = values.iter().filter_map(|v| v.parse::<u64>().ok());
        return match op {
            Op::Eq | Op::In => nums.into_iter().any(|n| n == actual),
            Op::Ne | Op::Out => nums.into_iter().all(|n| n != actual),
            Op::Lt => nums.into_iter().all(|n| actual < n),
            Op::Le => nums.into_iter().all(|n| actual <= n),
            Op::Gt => nums.into_iter().all(|n| actual > n),
            Op::Ge => nums.into_iter().all(|n| actual >= n),
        };
    }

    let actual = match field {
        Field::ControllerId => Some(subject.controller_id()),
        Field::Name => Some(subject.name()),
        Field::Attribute(key) => subject.attribute(key),
        Field::CreatedAt => None,
    };
    let Some(actual) = actual else {
        // a missing attribute only satisfies negative comparisons
        return matches!(op, Op::Ne | Op::Out);
    };

    match op {
        Op::Eq | Op::In => matchers.iter().any(|m| m.matches(actual)),
        Op::Ne | Op::Out => !matchers.iter().any(|m| m.matches(actual)),
        Op::Lt | Op::Le | Op::Gt | Op::Ge => values.iter().all(|v| {
            let ord = order_values(actual, v);
            match op {
                Op::Lt => ord == Ordering::Less,
                Op::Le => ord != Ordering::Greater,
                Op::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }
        }),
    }
}

fn order_values(actual: &str, expected: &str) -> Ordering {
    match (actual.parse::<i64>(), expected.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => actual
            .to_ascii_lowercase()
            .cmp(&expected.to_ascii_lowercase()),
    }
}

// ── Parser ─────────────────────────────────────────────────────────

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn expect(&mut self, want: char) -> Result<(), FilterError> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(found) => Err(FilterError::UnexpectedChar {
                pos: self.pos - found.len_utf8(),
                found,
            }),
            None => Err(FilterError::UnexpectedEnd),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut items = vec![self.parse_and()?];
        loop {
            self.skip_ws();
            if self.peek() == Some(',') {
                self.bump();
                items.push(self.parse_and()?);
            } else {
                break;
            }
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut items = vec![self.parse_primary()?];
        loop {
            self.skip_ws();
            if self.peek() == Some(';') {
                self.bump();
                items.push(self.parse_primary()?);
            } else {
                break;
            }
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, FilterError> {
        self.skip_ws();
        match self.peek() {
            None => Err(FilterError::UnexpectedEnd),
            Some('(') => {
                self.bump();
                let inner = self.parse_or()?;
                self.expect(')')?;
                Ok(inner)
            }
            Some(_) => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, FilterError> {
        let selector = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if selector.is_empty() {
            return Err(self.unexpected());
        }
        let field = Field::parse(selector)?;

        self.skip_ws();
        let op = self.parse_operator()?;

        self.skip_ws();
        let values = if self.peek() == Some('(') {
            self.bump();
            let mut values = vec![self.parse_value()?];
            loop {
                self.skip_ws();
                match self.bump() {
                    Some(',') => values.push(self.parse_value()?),
                    Some(')') => break,
                    Some(found) => {
                        return Err(FilterError::UnexpectedChar {
                            pos: self.pos - found.len_utf8(),
                            found,
                        });
                    }
                    None => return Err(FilterError::UnexpectedEnd),
                }
            }
            values
        } else {
            vec![self.parse_value()?]
        };

        if matches!(op, Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge) && values.len() != 1 {
            return Err(FilterError::InvalidValue {
                field: selector.to_string(),
                value: values.join(","),
            });
        }
        if field == Field::CreatedAt
            && let Some(bad) = values.iter().find(|v| v.parse::<u64>().is_err())
        {
            return Err(FilterError::InvalidValue {
                field: selector.to_string(),
                value: bad.clone(),
            });
        }

        let matchers = values.iter().map(|v| Matcher::new(v)).collect();
        Ok(Expr::Compare {
            field,
            op,
            values,
            matchers,
        })
    }

    fn parse_operator(&mut self) -> Result<Op, FilterError> {
        let start = self.pos;
        match self.bump() {
            Some('=') => {
                if self.peek() == Some('=') {
                    self.bump();
                } else {
                    self.take_while(|c| c.is_ascii_alphabetic());
                    if self.bump() != Some('=') {
                        return Err(FilterError::UnknownOperator(
                            self.input[start..self.pos].to_string(),
                        ));
                    }
                }
            }
            Some('!') | Some('<') | Some('>') => {
                if self.peek() == Some('=') {
                    self.bump();
                }
            }
            Some(found) => {
                return Err(FilterError::UnexpectedChar { pos: start, found });
            }
            None => return Err(FilterError::UnexpectedEnd),
        }
        Op::parse(&self.input[start..self.pos])
    }

    fn parse_value(&mut self) -> Result<String, FilterError> {
        self.skip_ws();
        match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.bump();
                let mut out = String::new();
                loop {
                    match self.bump() {
                        None => return Err(FilterError::UnexpectedEnd),
                        Some('\\') => match self.bump() {
                            Some(c) => out.push(c),
                            None => return Err(FilterError::UnexpectedEnd),
                        },
                        Some(c) if c == q => break,
                        Some(c) => out.push(c),
                    }
                }
                Ok(out)
            }
            Some(_) => {
                let raw = self.take_while(|c| !matches!(c, ';' | ',' | '(' | ')' | '"' | '\'') && !c.is_whitespace());
                if raw.is_empty() {
                    Err(self.unexpected())
                } else {
                    Ok(raw.to_string())
                }
            }
            None => Err(FilterError::UnexpectedEnd),
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
        &self.input[start..self.pos]
    }

    fn unexpected(&self) -> FilterError {
        match self.peek() {
            Some(found) => FilterError::UnexpectedChar {
                pos: self.pos,
                found,
            },
            None => FilterError::UnexpectedEnd,
        }
    }
}

// ── Public API ─────────────────────────────────────────────────────

/// A parsed, ready to evaluate target filter.
#[derive(Debug, Clone)]
pub struct TargetFilter {
    source: String,
    expr: Expr,
}

impl TargetFilter {
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(FilterError::Empty);
        }
        let mut parser = Parser {
            input: trimmed,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        parser.skip_ws();
        if parser.peek().is_some() {
            return Err(parser.unexpected());
        }
        Ok(Self {
            source: trimmed.to_string(),
            expr,
        })
    }

    /// Filter matching every target.
    pub fn all() -> Self {
        Self {
            source: String::new(),
            expr: Expr::All,
        }
    }

    /// Conjunction of two filters.
    pub fn and(&self, other: &TargetFilter) -> Self {
        match (&self.expr, &other.expr) {
            (Expr::All, _) => other.clone(),
            (_, Expr::All) => self.clone(),
            (a, b) => Self {
                source: format!("({});({})", self.source, other.source),
                expr: Expr::And(vec![a.clone(), b.clone()]),
            },
        }
    }

    pub fn matches<S: FilterSubject + ?Sized>(&self, subject: &S) -> bool {
        self.expr.eval(subject)
    }

    pub fn is_all(&self) -> bool {
        matches!(self.expr, Expr::All)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for TargetFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            f.write_str("*")
        } else {
            f.write_str(&self.source)
        }
    }
}

impl std::str::FromStr for TargetFilter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetFilter::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Dev {
        id: &'static str,
        name: &'static str,
        attrs: HashMap<&'static str, &'static str>,
        created: u64,
    }

    impl FilterSubject for Dev {
        fn controller_id(&self) -> &str {
            self.id
        }
        fn name(&self) -> &str {
            self.name
        }
        fn attribute(&self, key: &str) -> Option<&str> {
            self.attrs.get(key).copied()
        }
        fn created_at(&self) -> u64 {
            self.created
        }
    }

    fn dev(id: &'static str, region: &'static str, created: u64) -> Dev {
        Dev {
            id,
            name: id,
            attrs: HashMap::from([("region", region), ("hw", "rev2")]),
            created,
        }
    }

    #[test]
    fn test_equality_and_wildcard() {
        let f = TargetFilter::parse("name==edge-*").unwrap();
        assert!(f.matches(&dev("edge-01", "eu", 1)));
        assert!(f.matches(&dev("EDGE-02", "eu", 1)));
        assert!(!f.matches(&dev("core-01", "eu", 1)));

        let f = TargetFilter::parse("controllerid==core-01").unwrap();
        assert!(f.matches(&dev("core-01", "eu", 1)));
        assert!(!f.matches(&dev("core-011", "eu", 1)));
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let f = TargetFilter::parse("attribute.region==eu;name==a*,name==z*").unwrap();
        assert!(f.matches(&dev("a1", "eu", 1)));
        assert!(!f.matches(&dev("a1", "us", 1)));
        assert!(f.matches(&dev("z1", "us", 1)));

        let f = TargetFilter::parse("attribute.region==eu;(name==a*,name==z*)").unwrap();
        assert!(!f.matches(&dev("z1", "us", 1)));
        assert!(f.matches(&dev("z1", "eu", 1)));
    }

    #[test]
    fn test_in_out_and_missing_attribute() {
        let f = TargetFilter::parse("id=in=(a, b,'c d')").unwrap();
        assert!(f.matches(&dev("b", "eu", 1)));
        assert!(f.matches(&dev("c d", "eu", 1)));
        assert!(!f.matches(&dev("e", "eu", 1)));

        let f = TargetFilter::parse("attribute.region=out=(eu,us)").unwrap();
        assert!(f.matches(&dev("x", "apac", 1)));
        assert!(!f.matches(&dev("x", "us", 1)));

        let f = TargetFilter::parse("attribute.missing!=x").unwrap();
        assert!(f.matches(&dev("x", "eu", 1)));
        let f = TargetFilter::parse("attribute.missing==x").unwrap();
        assert!(!f.matches(&dev("x", "eu", 1)));
    }

    #[test]
    fn test_created_at_comparisons() {
        let f = TargetFilter::parse("createdat=le=100").unwrap();
        assert!(f.matches(&dev("x", "eu", 100)));
        assert!(!f.matches(&dev("x", "eu", 101)));

        let f = TargetFilter::parse("createdat>50;createdat<60").unwrap();
        assert!(f.matches(&dev("x", "eu", 55)));
        assert!(!f.matches(&dev("x", "eu", 60)));

        assert!(matches!(
            TargetFilter::parse("createdat=lt=yesterday"),
            Err(FilterError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_combine() {
        let base = TargetFilter::parse("attribute.region==eu").unwrap();
        let refined = base.and(&TargetFilter::parse("attribute.hw==rev2").unwrap());
        assert!(refined.matches(&dev("x", "eu", 1)));
        assert!(!refined.matches(&dev("x", "us", 1)));
        assert_eq!(refined.as_str(), "(attribute.region==eu);(attribute.hw==rev2)");

        let same = base.and(&TargetFilter::all());
        assert_eq!(same.as_str(), base.as_str());
        assert!(TargetFilter::all().matches(&dev("x", "us", 1)));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(TargetFilter::parse("  ").unwrap_err(), FilterError::Empty);
        assert!(matches!(
            TargetFilter::parse("color==red"),
            Err(FilterError::UnknownField(_))
        ));
        assert!(matches!(
            TargetFilter::parse("name=like=x"),
            Err(FilterError::UnknownOperator(_))
        ));
        assert_eq!(
            TargetFilter::parse("name==a;").unwrap_err(),
            FilterError::UnexpectedEnd
        );
        assert!(matches!(
            TargetFilter::parse("(name==a"),
            Err(FilterError::UnexpectedEnd)
        ));
        assert!(matches!(
            TargetFilter::parse("name==a)"),
            Err(FilterError::UnexpectedChar { found: ')', .. })
        ));
        assert!(matches!(
            TargetFilter::parse("name==(a,b)"),
            Err(FilterError::InvalidValue { .. })
        ));
    }
}
