//! Core domain model for the congress sync pipeline.
//!
//! Two layers live here: the raw handoff records that source clients emit
//! (still in each upstream's vocabulary, every field optional) and the
//! canonical entities the normalizer produces from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod dates;
pub mod ids;

pub use dates::{CanonicalDate, CanonicalTimestamp, UNKNOWN};
pub use ids::{lookup_key, name_key, Boletin, BoletinError, ExternalId};

pub const CRATE_NAME: &str = "congreso-core";

/// Legislative chamber. Each upstream source publishes for exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chamber {
    Camara,
    Senado,
}

impl Chamber {
    pub const ALL: [Chamber; 2] = [Chamber::Camara, Chamber::Senado];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chamber::Camara => "camara",
            Chamber::Senado => "senado",
        }
    }

    /// Namespace tag prepended to raw upstream ids to build an [`ExternalId`].
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Chamber::Camara => "DIP-",
            Chamber::Senado => "SEN-",
        }
    }
}

impl fmt::Display for Chamber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownChamber(pub String);

impl fmt::Display for UnknownChamber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown chamber `{}`", self.0)
    }
}

impl std::error::Error for UnknownChamber {}

impl FromStr for Chamber {
    type Err = UnknownChamber;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camara" => Ok(Chamber::Camara),
            "senado" => Ok(Chamber::Senado),
            other => Err(UnknownChamber(other.to_string())),
        }
    }
}

/// Deputy or senator as the upstream describes them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawParliamentarian {
    pub id: Option<String>,
    pub given_names: Option<String>,
    pub paternal_surname: Option<String>,
    pub maternal_surname: Option<String>,
    /// Set by sources that only publish a single display name.
    pub full_name: Option<String>,
    pub region: Option<String>,
    /// Distrito for deputies, circunscripción for senators.
    pub district: Option<String>,
    pub party: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBill {
    pub boletin: Option<String>,
    pub title: Option<String>,
    pub status: Option<String>,
    pub chamber_of_origin: Option<String>,
    pub urgency: Option<String>,
    pub initiative: Option<String>,
    pub entry_date: Option<String>,
}

/// Roll-call session header. Tallies stay textual until normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVoteSession {
    pub session_id: Option<String>,
    pub boletin: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
    pub yes: Option<String>,
    pub no: Option<String>,
    pub abstain: Option<String>,
    pub paired: Option<String>,
    pub quorum: Option<String>,
    pub result: Option<String>,
}

/// One line of a roll call. `parliamentarian_ref` is whatever id form the
/// upstream chose to emit (raw numeric or already prefixed).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVoteEntry {
    pub session_id: String,
    pub parliamentarian_ref: Option<String>,
    pub parliamentarian_name: Option<String>,
    pub option: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parliamentarian {
    pub external_id: ExternalId,
    pub full_name: String,
    pub chamber: Chamber,
    pub region: Option<String>,
    pub district: Option<String>,
    pub party: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub boletin: Boletin,
    pub title: String,
    /// Canonical status code, or the upstream text verbatim when it is not in
    /// the lookup table (`status_recognized == false`).
    pub status: Option<String>,
    pub status_recognized: bool,
    pub chamber_of_origin: Option<Chamber>,
    pub urgency: Option<String>,
    pub initiative: Option<String>,
    pub entry_date: CanonicalDate,
    /// Source that produced this observation.
    pub source: Chamber,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub yes: Option<u32>,
    pub no: Option<u32>,
    pub abstain: Option<u32>,
    pub paired: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// `<chamber>:<upstream session id>`.
    pub session_key: String,
    /// Upstream session id as emitted, used to fetch the roll call.
    pub session_id: String,
    pub chamber: Chamber,
    pub boletin: Option<Boletin>,
    pub voted_at: CanonicalTimestamp,
    pub description: Option<String>,
    pub tally: Tally,
    pub quorum: Option<String>,
    pub result: Option<String>,
}

impl Vote {
    pub fn session_key_for(chamber: Chamber, session_id: &str) -> String {
        format!("{}:{}", chamber.as_str(), session_id.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollCallEntry {
    pub session_key: String,
    pub chamber: Chamber,
    /// Unresolved reference; the reconciler turns it into a row id.
    pub parliamentarian_ref: String,
    pub option: String,
    pub option_recognized: bool,
}
