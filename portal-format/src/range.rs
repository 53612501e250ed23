use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A block bound as written in configuration: a plain number or a string such as
/// `"1_000_000"`, `"1,000,000"` or (for `to` only) `"+1000"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RangeBound {
    Number(u64),
    Text(String),
}

impl From<u64> for RangeBound {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RangeBound {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl Default for RangeBound {
    fn default() -> Self {
        Self::Number(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalRange {
    #[serde(default)]
    pub from: RangeBound,
    #[serde(default)]
    pub to: Option<RangeBound>,
}

/// Inclusive block range. `to == None` means "follow the chain head".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRange {
    pub from: u64,
    pub to: Option<u64>,
}

impl PortalRange {
    pub fn new(from: impl Into<RangeBound>, to: Option<RangeBound>) -> Self {
        Self {
            from: from.into(),
            to,
        }
    }

    pub fn parse(&self) -> Result<ParsedRange> {
        let from = parse_bound(&self.from, None)?;
        let to = match &self.to {
            Some(to) => Some(parse_bound(to, Some(from))?),
            None => None,
        };

        if let Some(to) = to {
            if to < from {
                return Err(Error::InvalidBlockRange { from, to });
            }
        }

        Ok(ParsedRange { from, to })
    }
}

fn parse_bound(bound: &RangeBound, relative_to: Option<u64>) -> Result<u64> {
    match bound {
        RangeBound::Number(n) => Ok(*n),
        RangeBound::Text(s) => match (s.strip_prefix('+'), relative_to) {
            (Some(rest), Some(base)) => {
                let n = parse_block_number(rest)?;
                base.checked_add(n)
                    .ok_or_else(|| Error::InvalidBlockNumber(s.clone()))
            }
            _ => parse_block_number(s),
        },
    }
}

/// Parses a block number allowing `_` and `,` as thousands separators.
pub fn parse_block_number(s: &str) -> Result<u64> {
    let cleaned: String = s.chars().filter(|c| *c != '_' && *c != ',').collect();

    cleaned
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::InvalidBlockNumber(s.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_separators() {
        assert_eq!(parse_block_number("1000000").unwrap(), 1_000_000);
        assert_eq!(parse_block_number("1_000_000").unwrap(), 1_000_000);
        assert_eq!(parse_block_number("1,000,000").unwrap(), 1_000_000);
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_block_number("latest").unwrap_err();
        assert!(err.to_string().contains("\"latest\""));
    }

    #[test]
    fn relative_to_block() {
        let range = PortalRange::new("1_000", Some("+500".into()));
        assert_eq!(
            range.parse().unwrap(),
            ParsedRange {
                from: 1000,
                to: Some(1500)
            }
        );
    }

    #[test]
    fn inverted_range_is_rejected() {
        let range = PortalRange::new(10u64, Some(5u64.into()));
        assert!(matches!(
            range.parse(),
            Err(Error::InvalidBlockRange { from: 10, to: 5 })
        ));
    }

    #[test]
    fn deserializes_mixed_bounds() {
        let range: PortalRange = serde_json::from_str(r#"{"from":"20,000","to":20500}"#).unwrap();
        assert_eq!(range.parse().unwrap().to, Some(20_500));
    }
}
