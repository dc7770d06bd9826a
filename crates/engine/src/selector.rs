//! Selector grammar parser
//!
//! Turns a locator string into a structured predicate. The grammar is a
//! pragmatic subset of common test-locator syntaxes: tag, `#id`, `.class`
//! lists, attribute tests (exact, prefix, contains, presence), and a text
//! predicate written either standalone (`text=Login`) or as a `:text(...)`
//! suffix. Anything outside the subset is rejected with
//! `UnsupportedSelectorSyntax` so the policy can escalate instead of
//! guessing.

use selfheal_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// How an attribute value is compared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrOp {
    /// `[attr]` - attribute present, value ignored
    Exists,
    /// `[attr=v]`
    Equals,
    /// `[attr^=v]`
    Prefix,
    /// `[attr*=v]`
    Contains,
}

/// One attribute test from the selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrPredicate {
    pub name: String,
    pub op: AttrOp,
    pub value: String,
}

impl AttrPredicate {
    /// Evaluate against a candidate's attribute value (None = absent)
    pub fn matches(&self, actual: Option<&str>) -> bool {
        match (&self.op, actual) {
            (AttrOp::Exists, Some(_)) => true,
            (AttrOp::Equals, Some(v)) => v == self.value,
            (AttrOp::Prefix, Some(v)) => v.starts_with(&self.value),
            (AttrOp::Contains, Some(v)) => v.contains(&self.value),
            _ => false,
        }
    }
}

/// Structured form of a locator string
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectorPredicate {
    pub tag: Option<String>,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attrs: Vec<AttrPredicate>,
    pub text: Option<String>,
}

impl SelectorPredicate {
    /// Parse a locator string into a predicate.
    pub fn parse(selector: &str) -> Result<SelectorPredicate> {
        let raw = selector.trim();
        if raw.is_empty() {
            return Err(unsupported(raw, "empty selector"));
        }

        // Standalone text locator: `text=Login`
        if let Some(text) = raw.strip_prefix("text=") {
            let text = unquote(text.trim());
            if text.is_empty() {
                return Err(unsupported(raw, "empty text predicate"));
            }
            return Ok(SelectorPredicate {
                text: Some(text),
                ..Default::default()
            });
        }

        // XPath and combinator syntaxes are out of the supported subset
        if raw.starts_with('/') || raw.starts_with('(') {
            return Err(unsupported(raw, "xpath selectors are not supported"));
        }

        let mut p = Parser {
            chars: raw.chars().collect(),
            pos: 0,
            raw,
        };
        p.parse()
    }

}

impl std::fmt::Display for SelectorPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(tag) = &self.tag {
            write!(f, "{}", tag)?;
        }
        if let Some(id) = &self.id {
            write!(f, "#{}", id)?;
        }
        for class in &self.classes {
            write!(f, ".{}", class)?;
        }
        for attr in &self.attrs {
            match attr.op {
                AttrOp::Exists => write!(f, "[{}]", attr.name)?,
                AttrOp::Equals => write!(f, "[{}={}]", attr.name, attr.value)?,
                AttrOp::Prefix => write!(f, "[{}^={}]", attr.name, attr.value)?,
                AttrOp::Contains => write!(f, "[{}*={}]", attr.name, attr.value)?,
            }
        }
        if let Some(text) = &self.text {
            if self.tag.is_some() || self.id.is_some() || !self.classes.is_empty()
                || !self.attrs.is_empty()
            {
                write!(f, ":text({})", text)?;
            } else {
                write!(f, "text={}", text)?;
            }
        }
        Ok(())
    }
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    raw: &'a str,
}

impl<'a> Parser<'a> {
    fn parse(&mut self) -> Result<SelectorPredicate> {
        let mut pred = SelectorPredicate::default();

        // Leading tag name
        if self
            .peek()
            .map(|c| c.is_ascii_alphabetic())
            .unwrap_or(false)
        {
            pred.tag = Some(self.read_name().to_lowercase());
        }

        while let Some(c) = self.peek() {
            match c {
                '#' => {
                    self.pos += 1;
                    let id = self.read_name();
                    if id.is_empty() {
                        return Err(unsupported(self.raw, "empty id"));
                    }
                    if pred.id.is_some() {
                        return Err(unsupported(self.raw, "multiple ids"));
                    }
                    pred.id = Some(id);
                }
                '.' => {
                    self.pos += 1;
                    let class = self.read_name();
                    if class.is_empty() {
                        return Err(unsupported(self.raw, "empty class"));
                    }
                    if !pred.classes.contains(&class) {
                        pred.classes.push(class);
                    }
                }
                '[' => {
                    pred.attrs.push(self.read_attr()?);
                }
                ':' => {
                    self.pos += 1;
                    let name = self.read_name();
                    if name != "text" || self.peek() != Some('(') {
                        return Err(unsupported(
                            self.raw,
                            "pseudo-classes other than :text(...) are not supported",
                        ));
                    }
                    self.pos += 1; // '('
                    let mut text = String::new();
                    let mut closed = false;
                    while let Some(c) = self.peek() {
                        self.pos += 1;
                        if c == ')' {
                            closed = true;
                            break;
                        }
                        text.push(c);
                    }
                    if !closed {
                        return Err(unsupported(self.raw, "unterminated :text(...)"));
                    }
                    pred.text = Some(unquote(text.trim()));
                }
                ' ' | '>' | '+' | '~' | ',' => {
                    return Err(unsupported(
                        self.raw,
                        "combinators are not supported; use a single compound selector",
                    ));
                }
                _ => {
                    return Err(unsupported(self.raw, "unexpected character"));
                }
            }
        }

        if pred == SelectorPredicate::default() {
            return Err(unsupported(self.raw, "selector matched no grammar rule"));
        }
        Ok(pred)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn read_name(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn read_attr(&mut self) -> Result<AttrPredicate> {
        self.pos += 1; // '['
        let name = self.read_name().to_lowercase();
        if name.is_empty() {
            return Err(unsupported(self.raw, "empty attribute name"));
        }

        let op = match self.peek() {
            Some(']') => {
                self.pos += 1;
                return Ok(AttrPredicate {
                    name,
                    op: AttrOp::Exists,
                    value: String::new(),
                });
            }
            Some('=') => {
                self.pos += 1;
                AttrOp::Equals
            }
            Some('^') => {
                self.pos += 1;
                self.expect('=')?;
                AttrOp::Prefix
            }
            Some('*') => {
                self.pos += 1;
                self.expect('=')?;
                AttrOp::Contains
            }
            _ => return Err(unsupported(self.raw, "malformed attribute predicate")),
        };

        let mut value = String::new();
        let mut closed = false;
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == ']' {
                closed = true;
                break;
            }
            value.push(c);
        }
        if !closed {
            return Err(unsupported(self.raw, "unterminated attribute predicate"));
        }

        Ok(AttrPredicate {
            name,
            op,
            value: unquote(value.trim()),
        })
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(unsupported(self.raw, "malformed attribute operator"))
        }
    }
}

fn unsupported(selector: &str, why: &str) -> Error {
    Error::UnsupportedSelectorSyntax(format!("{} ({})", selector, why))
}

fn unquote(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_selector() {
        let p = SelectorPredicate::parse("button#login.primary.big[data-testid=login-btn]")
            .unwrap();
        assert_eq!(p.tag.as_deref(), Some("button"));
        assert_eq!(p.id.as_deref(), Some("login"));
        assert_eq!(p.classes, vec!["primary", "big"]);
        assert_eq!(
            p.attrs,
            vec![AttrPredicate {
                name: "data-testid".into(),
                op: AttrOp::Equals,
                value: "login-btn".into(),
            }]
        );
    }

    #[test]
    fn parses_attr_variants() {
        let p = SelectorPredicate::parse("[href^=/checkout][class*=btn][disabled]").unwrap();
        assert_eq!(p.attrs.len(), 3);
        assert_eq!(p.attrs[0].op, AttrOp::Prefix);
        assert_eq!(p.attrs[1].op, AttrOp::Contains);
        assert_eq!(p.attrs[2].op, AttrOp::Exists);
        assert!(p.attrs[0].matches(Some("/checkout/cart")));
        assert!(!p.attrs[0].matches(Some("checkout")));
        assert!(p.attrs[1].matches(Some("btn btn-primary")));
        assert!(p.attrs[2].matches(Some("")));
        assert!(!p.attrs[2].matches(None));
    }

    #[test]
    fn parses_text_forms() {
        let standalone = SelectorPredicate::parse("text=Add to cart").unwrap();
        assert_eq!(standalone.text.as_deref(), Some("Add to cart"));
        assert!(standalone.tag.is_none());

        let suffixed = SelectorPredicate::parse("button:text(Login)").unwrap();
        assert_eq!(suffixed.tag.as_deref(), Some("button"));
        assert_eq!(suffixed.text.as_deref(), Some("Login"));

        let quoted = SelectorPredicate::parse("text=\"Sign up\"").unwrap();
        assert_eq!(quoted.text.as_deref(), Some("Sign up"));
    }

    #[test]
    fn rejects_unsupported_syntax() {
        for s in [
            "div > span",
            "div span",
            "a:hover",
            "//button[@id='x']",
            "ul, ol",
            "",
            "div[",
            "#",
        ] {
            let err = SelectorPredicate::parse(s).unwrap_err();
            assert!(
                matches!(err, Error::UnsupportedSelectorSyntax(_)),
                "expected unsupported syntax for {:?}, got {:?}",
                s,
                err
            );
        }
    }

    #[test]
    fn display_roundtrips() {
        for s in [
            "button#login.primary[data-testid=login-btn]",
            ".card.featured",
            "text=Login",
            "button:text(Login)",
            "[data-test^=nav]",
        ] {
            let p = SelectorPredicate::parse(s).unwrap();
            let rendered = p.to_string();
            assert_eq!(SelectorPredicate::parse(&rendered).unwrap(), p);
        }
    }
}
