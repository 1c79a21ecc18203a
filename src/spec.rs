//! Transport strings: `kind(arg,arg,...),rest`.
//!
//! The kind selects a provider; the parenthesized arguments are its options
//! (`key=value` or bare flags), and `rest` is whatever follows the first
//! top-level comma, which is either the provider's own address or, for a
//! layered provider, the transport string of the layer below.

use crate::error::{Error, Result};
use std::fmt;

/// A parsed transport string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSpec {
    kind: String,
    args: Vec<String>,
    rest: String,
}

impl TransportSpec {
    /// Parses a transport string.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let kind_end = s.find(|c| c == '(' || c == ',').unwrap_or(s.len());
        let kind = s[..kind_end].trim();
        if kind.is_empty() {
            return Err(Error::invalid(format!("missing transport kind in {s:?}")));
        }
        if !kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::invalid(format!("bad transport kind {kind:?}")));
        }

        let mut args = Vec::new();
        let mut tail = &s[kind_end..];
        if let Some(inner) = tail.strip_prefix('(') {
            let close = matching_paren(inner)
                .ok_or_else(|| Error::invalid(format!("unbalanced parentheses in {s:?}")))?;
            args = split_top_level(&inner[..close])
                .into_iter()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_owned)
                .collect();
            tail = &inner[close + 1..];
        }

        let rest = match tail.strip_prefix(',') {
            Some(rest) => rest.trim(),
            None if tail.trim().is_empty() => "",
            None => {
                return Err(Error::invalid(format!(
                    "unexpected {:?} after arguments in {s:?}",
                    tail.trim()
                )))
            }
        };

        Ok(Self {
            kind: kind.to_owned(),
            args,
            rest: rest.to_owned(),
        })
    }

    /// The provider kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The parenthesized arguments, trimmed.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Everything after the first top-level comma.
    pub fn rest(&self) -> &str {
        &self.rest
    }

    /// Splits [`TransportSpec::rest`] on top-level commas.
    pub fn rest_fields(&self) -> Vec<&str> {
        if self.rest.is_empty() {
            return Vec::new();
        }
        split_top_level(&self.rest)
            .into_iter()
            .map(str::trim)
            .collect()
    }

    /// The value of a `key=value` argument. A bare `key` yields `""`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.args.iter().find_map(|arg| match arg.split_once('=') {
            Some((k, v)) if k.trim() == key => Some(v.trim()),
            None if arg == key => Some(""),
            _ => None,
        })
    }

    /// Whether the bare flag `flag` was given.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|arg| arg == flag)
    }

    /// Parses a numeric `key=value` argument.
    pub fn uint_param(&self, key: &str) -> Result<Option<u32>> {
        match self.param(key) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| Error::invalid(format!("{key}={v:?} is not a number"))),
        }
    }

    /// Fails on any argument whose key is not in `known`.
    pub fn reject_unknown(&self, known: &[&str]) -> Result<()> {
        for arg in &self.args {
            let key = arg.split_once('=').map_or(arg.as_str(), |(k, _)| k.trim());
            if !known.contains(&key) {
                return Err(Error::invalid(format!(
                    "{}: unknown option {key:?}",
                    self.kind
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for TransportSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.kind)?;
        if !self.args.is_empty() {
            write!(f, "({})", self.args.join(","))?;
        }
        if !self.rest.is_empty() {
            write!(f, ",{}", self.rest)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for TransportSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Index of the `)` closing an already-consumed `(`.
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => return Some(i),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_args_rest() {
        let spec = TransportSpec::parse("cm108gpio(bit=5),1").unwrap();
        assert_eq!(spec.kind(), "cm108gpio");
        assert_eq!(spec.args(), ["bit=5"]);
        assert_eq!(spec.rest(), "1");
        assert_eq!(spec.uint_param("bit").unwrap(), Some(5));
        assert_eq!(spec.to_string(), "cm108gpio(bit=5),1");
    }

    #[test]
    fn nested_layers_stay_in_rest() {
        let spec = TransportSpec::parse("relay(x=1),tcp(nodelay),localhost,3000").unwrap();
        assert_eq!(spec.kind(), "relay");
        assert_eq!(spec.rest(), "tcp(nodelay),localhost,3000");
        let inner = TransportSpec::parse(spec.rest()).unwrap();
        assert!(inner.has_flag("nodelay"));
        assert_eq!(inner.rest_fields(), ["localhost", "3000"]);
    }

    #[test]
    fn bare_kind() {
        let spec = TransportSpec::parse("stdio(self)").unwrap();
        assert_eq!(spec.rest(), "");
        assert!(spec.has_flag("self"));
        assert_eq!(spec.param("self"), Some(""));
        assert!(spec.rest_fields().is_empty());
    }

    #[test]
    fn malformed() {
        for bad in ["", "(bit=3),1", "cm108gpio(bit=3,1", "cm108gpio(bit=3)x", "a b,c"] {
            assert!(
                matches!(TransportSpec::parse(bad), Err(Error::Invalid(_))),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn unknown_and_non_numeric_options() {
        let spec = TransportSpec::parse("cm108gpio(bits=3),1").unwrap();
        assert!(spec.reject_unknown(&["bit"]).is_err());
        let spec = TransportSpec::parse("cm108gpio(bit=three),1").unwrap();
        assert!(spec.uint_param("bit").is_err());
    }
}
