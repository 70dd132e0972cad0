//! Raw upstream records to canonical entities.
//!
//! Every function here is pure. Enumerated upstream strings go through
//! closed lookup tables keyed by [`lookup_key`]; anything not in a table is
//! kept verbatim and flagged instead of being dropped.

use congreso_core::{
    lookup_key, Bill, Boletin, BoletinError, CanonicalDate, CanonicalTimestamp, Chamber,
    ExternalId, Parliamentarian, RawBill, RawParliamentarian, RawVoteEntry, RawVoteSession,
    RollCallEntry, Tally, Vote, UNKNOWN,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Expected, counted exclusion of a raw record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationSkip {
    #[error("record has no id")]
    MissingId,
    #[error("record has no name")]
    MissingName,
    #[error("record has no boletin")]
    MissingBoletin,
    #[error("malformed boletin `{0}`")]
    MalformedBoletin(String),
    #[error("vote session has no id")]
    MissingSessionId,
    #[error("roll-call entry has no parliamentarian reference")]
    MissingParliamentarianRef,
}

/// Upstream string that no lookup table knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnrecognizedValue {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub value: T,
    pub flags: Vec<UnrecognizedValue>,
}

const BILL_STATUS: &[(&str, &str)] = &[
    ("en tramitacion", "en_tramitacion"),
    ("en tramite", "en_tramitacion"),
    ("tramitacion", "en_tramitacion"),
    ("publicado", "publicado"),
    ("publicada", "publicado"),
    ("ley", "publicado"),
    ("archivado", "archivado"),
    ("archivada", "archivado"),
    ("retirado", "retirado"),
    ("retirada", "retirado"),
    ("rechazado", "rechazado"),
    ("rechazada", "rechazado"),
    ("inadmisible", "inadmisible"),
    ("tramitacion terminada", "tramitacion_terminada"),
];

const URGENCY: &[(&str, &str)] = &[
    ("sin urgencia", "sin_urgencia"),
    ("simple", "simple"),
    ("suma", "suma"),
    ("discusion inmediata", "discusion_inmediata"),
];

const INITIATIVE: &[(&str, &str)] = &[("mocion", "mocion"), ("mensaje", "mensaje")];

const CHAMBER_OF_ORIGIN: &[(&str, &str)] = &[
    ("camara de diputados", "camara"),
    ("camara de diputadas y diputados", "camara"),
    ("c.diputados", "camara"),
    ("c. diputados", "camara"),
    ("diputados", "camara"),
    ("camara", "camara"),
    ("senado", "senado"),
];

const VOTE_OPTION: &[(&str, &str)] = &[
    ("si", "si"),
    ("afirmativo", "si"),
    ("a favor", "si"),
    ("no", "no"),
    ("en contra", "no"),
    ("negativo", "no"),
    ("abstencion", "abstencion"),
    ("pareo", "pareo"),
    ("pareado", "pareo"),
    ("dispensado", "dispensado"),
];

fn lookup(table: &[(&str, &'static str)], raw: &str) -> Option<&'static str> {
    let key = lookup_key(raw);
    table.iter().find(|(k, _)| *k == key).map(|(_, code)| *code)
}

/// Canonical code when known, otherwise the trimmed raw text plus a flag.
fn classify(
    table: &[(&str, &'static str)],
    field: &str,
    raw: Option<&str>,
    flags: &mut Vec<UnrecognizedValue>,
) -> (Option<String>, bool) {
    let Some(raw) = clean(raw) else {
        return (None, true);
    };
    match lookup(table, &raw) {
        Some(code) => (Some(code.to_string()), true),
        None => {
            flags.push(UnrecognizedValue {
                field: field.to_string(),
                value: raw.clone(),
            });
            (Some(raw), false)
        }
    }
}

fn clean(value: Option<&str>) -> Option<String> {
    let collapsed = value?.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

fn count(value: Option<&str>) -> Option<u32> {
    value.and_then(|v| v.trim().parse().ok())
}

pub fn normalize_parliamentarian(
    raw: &RawParliamentarian,
    chamber: Chamber,
) -> Result<Parliamentarian, NormalizationSkip> {
    let external_id = raw
        .id
        .as_deref()
        .and_then(|id| ExternalId::for_chamber(chamber, id))
        .ok_or(NormalizationSkip::MissingId)?;

    let full_name = clean(raw.full_name.as_deref())
        .or_else(|| {
            let parts = [
                raw.given_names.as_deref(),
                raw.paternal_surname.as_deref(),
                raw.maternal_surname.as_deref(),
            ];
            clean(Some(parts.into_iter().flatten().collect::<Vec<_>>().join(" ").as_str()))
        })
        .ok_or(NormalizationSkip::MissingName)?;

    Ok(Parliamentarian {
        external_id,
        full_name,
        chamber,
        region: clean(raw.region.as_deref()),
        district: clean(raw.district.as_deref()),
        party: clean(raw.party.as_deref()),
    })
}

pub fn normalize_bill(raw: &RawBill, source: Chamber) -> Result<Normalized<Bill>, NormalizationSkip> {
    let boletin = Boletin::parse(raw.boletin.as_deref().unwrap_or_default()).map_err(|e| match e {
        BoletinError::Missing => NormalizationSkip::MissingBoletin,
        BoletinError::Malformed(raw) => NormalizationSkip::MalformedBoletin(raw),
    })?;

    let mut flags = Vec::new();
    let (status, status_recognized) = classify(BILL_STATUS, "bill.status", raw.status.as_deref(), &mut flags);
    let (urgency, _) = classify(URGENCY, "bill.urgency", raw.urgency.as_deref(), &mut flags);
    let (initiative, _) = classify(INITIATIVE, "bill.initiative", raw.initiative.as_deref(), &mut flags);
    let (origin, _) = classify(
        CHAMBER_OF_ORIGIN,
        "bill.chamber_of_origin",
        raw.chamber_of_origin.as_deref(),
        &mut flags,
    );
    let chamber_of_origin = origin.and_then(|code| code.parse::<Chamber>().ok());

    Ok(Normalized {
        value: Bill {
            boletin,
            title: clean(raw.title.as_deref()).unwrap_or_default(),
            status,
            status_recognized,
            chamber_of_origin,
            urgency,
            initiative,
            entry_date: CanonicalDate::parse(raw.entry_date.as_deref().unwrap_or_default()),
            source,
        },
        flags,
    })
}

pub fn normalize_vote(raw: &RawVoteSession, chamber: Chamber) -> Result<Normalized<Vote>, NormalizationSkip> {
    let session_id = clean(raw.session_id.as_deref()).ok_or(NormalizationSkip::MissingSessionId)?;
    let mut flags = Vec::new();

    let boletin = match clean(raw.boletin.as_deref()) {
        None => None,
        Some(text) => match Boletin::parse(&text) {
            Ok(boletin) => Some(boletin),
            Err(_) => {
                flags.push(UnrecognizedValue {
                    field: "vote.boletin".to_string(),
                    value: text,
                });
                None
            }
        },
    };

    Ok(Normalized {
        value: Vote {
            session_key: Vote::session_key_for(chamber, &session_id),
            session_id,
            chamber,
            boletin,
            voted_at: CanonicalTimestamp::parse(raw.date.as_deref().unwrap_or_default()),
            description: clean(raw.description.as_deref()),
            tally: Tally {
                yes: count(raw.yes.as_deref()),
                no: count(raw.no.as_deref()),
                abstain: count(raw.abstain.as_deref()),
                paired: count(raw.paired.as_deref()),
            },
            quorum: clean(raw.quorum.as_deref()),
            result: clean(raw.result.as_deref()),
        },
        flags,
    })
}

pub fn normalize_roll_call_entry(
    raw: &RawVoteEntry,
    chamber: Chamber,
) -> Result<Normalized<RollCallEntry>, NormalizationSkip> {
    let parliamentarian_ref = clean(raw.parliamentarian_ref.as_deref())
        .ok_or(NormalizationSkip::MissingParliamentarianRef)?;
    let mut flags = Vec::new();
    let (option, option_recognized) = match classify(VOTE_OPTION, "vote.option", raw.option.as_deref(), &mut flags) {
        (Some(option), recognized) => (option, recognized),
        (None, _) => (UNKNOWN.to_string(), false),
    };

    Ok(Normalized {
        value: RollCallEntry {
            session_key: Vote::session_key_for(chamber, &raw.session_id),
            chamber,
            parliamentarian_ref,
            option,
            option_recognized,
        },
        flags,
    })
}
