//! Identifier normalization.
//!
//! Every comparison of parliamentarian ids, boletines, or names in the
//! pipeline goes through the constructors here, so equality is
//! case- and whitespace-insensitive by construction.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Chamber;

/// Chamber-namespaced parliamentarian id (`DIP-1096`, `SEN-5001`).
///
/// Always trimmed and uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExternalId(String);

impl ExternalId {
    /// Builds the id the normalizer assigns to a raw upstream id. A raw id
    /// that already carries the chamber prefix is not prefixed again.
    pub fn for_chamber(chamber: Chamber, raw: &str) -> Option<Self> {
        let canonical = canonical_form(raw);
        if canonical.is_empty() {
            return None;
        }
        let prefix = chamber.id_prefix();
        if canonical.starts_with(prefix) {
            if canonical.len() == prefix.len() {
                return None;
            }
            return Some(Self(canonical));
        }
        Some(Self(format!("{prefix}{canonical}")))
    }

    /// Canonical form of an id exactly as stored or emitted, without adding a
    /// prefix. Used for rows persisted before prefixing and for the raw
    /// fallback lookup of roll-call references.
    pub fn from_stored(raw: &str) -> Option<Self> {
        let canonical = canonical_form(raw);
        if canonical.is_empty() {
            None
        } else {
            Some(Self(canonical))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn canonical_form(raw: &str) -> String {
    raw.trim().to_uppercase()
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ExternalId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_stored(&value).ok_or_else(|| "empty external id".to_string())
    }
}

impl From<ExternalId> for String {
    fn from(value: ExternalId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoletinError {
    Missing,
    Malformed(String),
}

impl fmt::Display for BoletinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoletinError::Missing => f.write_str("missing boletin"),
            BoletinError::Malformed(raw) => write!(f, "malformed boletin `{raw}`"),
        }
    }
}

impl std::error::Error for BoletinError {}

/// Bill bulletin number (`17203-15`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Boletin(String);

impl Boletin {
    /// Whitespace is removed entirely (upstream occasionally emits
    /// `17203 - 15`), letters are uppercased, and only ASCII alphanumerics
    /// and interior dashes are accepted.
    pub fn parse(raw: &str) -> Result<Self, BoletinError> {
        let compact: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        if compact.is_empty() {
            return Err(BoletinError::Missing);
        }
        let well_formed = compact
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
            && compact.chars().any(|c| c.is_ascii_digit())
            && !compact.starts_with('-')
            && !compact.ends_with('-');
        if !well_formed {
            return Err(BoletinError::Malformed(raw.trim().to_string()));
        }
        Ok(Self(compact))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Boletin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Boletin {
    type Error = BoletinError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Boletin> for String {
    fn from(value: Boletin) -> Self {
        value.0
    }
}

/// Key for the duplicate-name check: lowercased, trimmed, inner whitespace
/// collapsed. Accents are kept, `Pérez` and `Perez` are different names.
pub fn name_key(full_name: &str) -> String {
    full_name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Key for enumeration lookup tables: lowercased, accents folded, trailing
/// punctuation dropped, inner whitespace collapsed.
pub fn lookup_key(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(fold_accent)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(&['.', ':', ';'][..])
        .to_string()
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        other => other,
    }
}
