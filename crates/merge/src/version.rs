//! Version Ordering
//!
//! Versions in a version index are free-form strings. They are ordered the way
//! Maven orders them: split into numeric and qualifier items at `.`, `-` and
//! digit/letter boundaries, compare numbers numerically and qualifiers by
//! their release stage.

use std::cmp::Ordering;

/// Rank of the implicit qualifier a plain release carries.
const RELEASE_RANK: u8 = 5;
/// Rank of any qualifier we don't recognise.
const UNKNOWN_RANK: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    /// Digits with leading zeros stripped, so that longer means larger.
    Number(String),
    Qualifier(String),
}
impl Item {
    fn parse(token: &str) -> Self {
        if token.bytes().all(|b| b.is_ascii_digit()) {
            let trimmed = token.trim_start_matches('0');
            return Self::Number(trimmed.to_string());
        }
        Self::Qualifier(token.to_ascii_lowercase())
    }

    /// Items that add nothing when they appear at the end: `1.0` is `1`.
    fn is_null(&self) -> bool {
        match self {
            Self::Number(digits) => digits.is_empty(),
            Self::Qualifier(qualifier) => qualifier_rank(qualifier) == RELEASE_RANK,
        }
    }
}

fn qualifier_rank(qualifier: &str) -> u8 {
    match qualifier {
        "alpha" | "a" => 0,
        "beta" | "b" => 1,
        "milestone" | "m" => 2,
        "rc" | "cr" => 3,
        "snapshot" => 4,
        "" | "ga" | "final" | "release" => RELEASE_RANK,
        "sp" => 6,
        _ => UNKNOWN_RANK,
    }
}

fn compare_items(left: Option<&Item>, right: Option<&Item>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (Some(item), None) => compare_to_null(item),
        (None, Some(item)) => compare_to_null(item).reverse(),
        (Some(Item::Number(a)), Some(Item::Number(b))) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
        (Some(Item::Number(_)), Some(Item::Qualifier(_))) => Ordering::Greater,
        (Some(Item::Qualifier(_)), Some(Item::Number(_))) => Ordering::Less,
        (Some(Item::Qualifier(a)), Some(Item::Qualifier(b))) => {
            let (rank_a, rank_b) = (qualifier_rank(a), qualifier_rank(b));
            match rank_a == UNKNOWN_RANK && rank_b == UNKNOWN_RANK {
                true => a.cmp(b),
                false => rank_a.cmp(&rank_b),
            }
        },
    }
}

fn compare_to_null(item: &Item) -> Ordering {
    match item {
        Item::Number(digits) if digits.is_empty() => Ordering::Equal,
        Item::Number(_) => Ordering::Greater,
        Item::Qualifier(qualifier) => qualifier_rank(qualifier).cmp(&RELEASE_RANK),
    }
}

/// A version string with Maven ordering.
///
/// Equality follows the ordering, so `1.0` and `1` are equal versions even
/// though [`as_str`](Self::as_str) differs.
#[derive(Debug, Clone)]
pub struct VersionOrder {
    raw: String,
    items: Vec<Item>,
}
impl VersionOrder {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let mut items = Vec::new();
        for part in raw.split(['.', '-']) {
            let mut start = 0;
            let bytes = part.as_bytes();
            for i in 1..bytes.len() {
                if bytes[i].is_ascii_digit() != bytes[i - 1].is_ascii_digit() {
                    items.push(Item::parse(&part[start..i]));
                    start = i;
                }
            }
            items.push(Item::parse(&part[start..]));
        }
        while items.last().is_some_and(Item::is_null) {
            items.pop();
        }
        Self { raw, items }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}
impl Ord for VersionOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.items.len().max(other.items.len());
        for i in 0..len {
            let ordering = compare_items(self.items.get(i), other.items.get(i));
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}
impl PartialOrd for VersionOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for VersionOrder {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for VersionOrder {}

/// Compare two version strings.
pub fn compare(left: &str, right: &str) -> Ordering {
    VersionOrder::new(left).cmp(&VersionOrder::new(right))
}
