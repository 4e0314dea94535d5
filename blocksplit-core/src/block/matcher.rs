//! Label matchers and series selectors

use crate::{Labels, Result, SplitError, METRIC_NAME};
use regex::Regex;
use std::fmt;

/// Matcher operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Equal,       // =
    NotEqual,    // !=
    Regex,       // =~
    NotRegex,    // !~
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchType::Equal => "=",
            MatchType::NotEqual => "!=",
            MatchType::Regex => "=~",
            MatchType::NotRegex => "!~",
        })
    }
}

/// Predicate on a single label value. A missing label matches as the empty
/// string.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: String,
    pub value: String,
    pub kind: MatchType,
    re: Option<Regex>,
}

impl Matcher {
    /// Create a matcher; regex values are fully anchored
    pub fn new(kind: MatchType, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        let re = match kind {
            MatchType::Regex | MatchType::NotRegex => Some(
                Regex::new(&format!("^(?:{})$", value))
                    .map_err(|e| SplitError::Config(format!("invalid regex {:?}: {}", value, e)))?,
            ),
            MatchType::Equal | MatchType::NotEqual => None,
        };
        Ok(Self {
            name,
            value,
            kind,
            re,
        })
    }

    /// Matcher selecting every series (`__name__ != ""`)
    pub fn match_all() -> Self {
        Self {
            name: METRIC_NAME.to_string(),
            value: String::new(),
            kind: MatchType::NotEqual,
            re: None,
        }
    }

    /// Check a single label value
    pub fn matches_value(&self, value: &str) -> bool {
        match (self.kind, &self.re) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::Regex, Some(re)) => re.is_match(value),
            (MatchType::NotRegex, Some(re)) => !re.is_match(value),
            _ => false,
        }
    }

    /// Check a label set
    pub fn matches(&self, labels: &Labels) -> bool {
        self.matches_value(labels.get(&self.name).unwrap_or(""))
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value && self.kind == other.kind
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.kind, self.value)
    }
}

/// Parse a series selector such as `up{job="api", env=~'prod|stage'}`.
///
/// A leading metric name becomes an equality matcher on `__name__`. An empty
/// selector yields no matchers.
pub fn parse_selector(input: &str) -> Result<Vec<Matcher>> {
    let mut p = SelectorParser {
        input,
        pos: 0,
    };
    p.parse()
}

struct SelectorParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> SelectorParser<'a> {
    fn parse(&mut self) -> Result<Vec<Matcher>> {
        let mut matchers = Vec::new();
        self.skip_ws();

        let name = self.ident();
        if !name.is_empty() {
            matchers.push(Matcher::new(MatchType::Equal, METRIC_NAME, name)?);
        }
        self.skip_ws();

        if self.eat('{') {
            loop {
                self.skip_ws();
                if self.eat('}') {
                    break;
                }
                matchers.push(self.matcher()?);
                self.skip_ws();
                if self.eat(',') {
                    continue;
                }
                if self.eat('}') {
                    break;
                }
                return Err(self.error("expected ',' or '}'"));
            }
        }

        self.skip_ws();
        if self.pos != self.input.len() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(matchers)
    }

    fn matcher(&mut self) -> Result<Matcher> {
        let name = self.ident();
        if name.is_empty() {
            return Err(self.error("expected label name"));
        }
        self.skip_ws();

        let kind = if self.eat_str("=~") {
            MatchType::Regex
        } else if self.eat_str("!~") {
            MatchType::NotRegex
        } else if self.eat_str("!=") {
            MatchType::NotEqual
        } else if self.eat('=') {
            MatchType::Equal
        } else {
            return Err(self.error("expected one of =, !=, =~, !~"));
        };
        self.skip_ws();

        let value = self.quoted()?;
        Matcher::new(kind, name, value)
    }

    fn ident(&mut self) -> &'a str {
        let rest = &self.input[self.pos..];
        let len = rest
            .char_indices()
            .find(|(i, c)| {
                !(c.is_ascii_alphabetic() || *c == '_' || *c == ':' || (*i > 0 && c.is_ascii_digit()))
            })
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn quoted(&mut self) -> Result<String> {
        let quote = match self.peek() {
            Some(q @ ('"' | '\'' | '`')) => q,
            _ => return Err(self.error("expected quoted value")),
        };
        self.pos += 1;

        let mut value = String::new();
        let mut escaped = false;
        while let Some(c) = self.peek() {
            self.pos += c.len_utf8();
            if escaped {
                value.push(match c {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                escaped = false;
            } else if c == '\\' && quote != '`' {
                escaped = true;
            } else if c == quote {
                return Ok(value);
            } else {
                value.push(c);
            }
        }
        Err(self.error("unterminated string"))
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.input[self.pos..].starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn error(&self, msg: &str) -> SplitError {
        SplitError::Config(format!(
            "invalid selector {:?} at position {}: {}",
            self.input, self.pos, msg
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matcher_semantics() {
        let labels = Labels::from_pairs([("__name__", "cpu"), ("env", "prod")]);

        assert!(Matcher::new(MatchType::Equal, "env", "prod").unwrap().matches(&labels));
        assert!(Matcher::new(MatchType::NotEqual, "env", "dev").unwrap().matches(&labels));
        assert!(Matcher::new(MatchType::Regex, "env", "pr.*").unwrap().matches(&labels));
        assert!(!Matcher::new(MatchType::Regex, "env", "pr").unwrap().matches(&labels));
        assert!(Matcher::new(MatchType::NotRegex, "env", "dev|stage").unwrap().matches(&labels));

        // Missing labels compare as empty
        assert!(Matcher::new(MatchType::Equal, "zone", "").unwrap().matches(&labels));
        assert!(Matcher::match_all().matches(&labels));
        assert!(!Matcher::match_all().matches(&Labels::from_pairs([("a", "b")])));
    }

    #[test]
    fn test_parse_selector() {
        let matchers = parse_selector(r#"cpu{env="prod", zone=~'eu-.*' ,job!~`x\d`}"#).unwrap();
        assert_eq!(matchers.len(), 4);
        assert_eq!(matchers[0], Matcher::new(MatchType::Equal, "__name__", "cpu").unwrap());
        assert_eq!(matchers[1], Matcher::new(MatchType::Equal, "env", "prod").unwrap());
        assert_eq!(matchers[2].kind, MatchType::Regex);
        assert_eq!(matchers[3].value, r"x\d");

        assert!(parse_selector("").unwrap().is_empty());
        assert_eq!(parse_selector("{a!=\"b\"}").unwrap()[0].kind, MatchType::NotEqual);
    }

    #[test]
    fn test_parse_selector_errors() {
        assert!(parse_selector("cpu{env}").is_err());
        assert!(parse_selector("cpu{env=\"x\"").is_err());
        assert!(parse_selector("cpu{env=~\"(\"}").is_err());
        assert!(parse_selector("cpu extra").is_err());
    }
}
