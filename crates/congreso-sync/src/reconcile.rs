//! Identity reconciliation against the persisted population.

use std::collections::HashMap;

use congreso_core::{name_key, Boletin, Chamber, ExternalId, Parliamentarian};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

pub const DEFAULT_REVIEW_THRESHOLD: f64 = 0.92;

/// Two different external ids claiming the same name in one chamber. The
/// incoming record is not written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConflict {
    pub chamber: Chamber,
    pub full_name: String,
    pub incoming_external_id: ExternalId,
    pub existing_external_id: ExternalId,
}

/// Similar but not identical names, surfaced for review only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearDuplicate {
    pub chamber: Chamber,
    pub external_id: ExternalId,
    pub full_name: String,
    pub similar_external_id: ExternalId,
    pub similar_name_key: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Insert,
    Update { row_id: i64 },
    Conflict(IdentityConflict),
}

#[derive(Debug, Clone)]
struct IndexEntry {
    row_id: i64,
    name_key: String,
}

/// External id and per-chamber name indexes over every persisted
/// parliamentarian. Built once per pass, extended as records are written.
#[derive(Debug, Clone, Default)]
pub struct IdentityReconciler {
    by_key: HashMap<ExternalId, IndexEntry>,
    by_name: HashMap<Chamber, HashMap<String, ExternalId>>,
}

impl IdentityReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = (i64, ExternalId, Chamber, String)>) -> Self {
        let mut index = Self::new();
        for (row_id, external_id, chamber, full_name) in rows {
            index.insert(row_id, external_id, chamber, &full_name);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// An existing external id always wins; a name match only matters for
    /// ids never seen before.
    pub fn decide(&self, p: &Parliamentarian) -> Decision {
        if let Some(entry) = self.by_key.get(&p.external_id) {
            return Decision::Update { row_id: entry.row_id };
        }
        let key = name_key(&p.full_name);
        match self.by_name.get(&p.chamber).and_then(|names| names.get(&key)) {
            Some(existing) if existing != &p.external_id => Decision::Conflict(IdentityConflict {
                chamber: p.chamber,
                full_name: p.full_name.clone(),
                incoming_external_id: p.external_id.clone(),
                existing_external_id: existing.clone(),
            }),
            _ => Decision::Insert,
        }
    }

    pub fn record(&mut self, p: &Parliamentarian, row_id: i64) {
        self.insert(row_id, p.external_id.clone(), p.chamber, &p.full_name);
    }

    fn insert(&mut self, row_id: i64, external_id: ExternalId, chamber: Chamber, full_name: &str) {
        let key = name_key(full_name);
        let names = self.by_name.entry(chamber).or_default();
        if let Some(previous) = self.by_key.get(&external_id) {
            if previous.name_key != key && names.get(&previous.name_key) == Some(&external_id) {
                names.remove(&previous.name_key);
            }
        }
        // First holder of a name keeps it, later rows with the same name were
        // written before the check existed.
        names.entry(key.clone()).or_insert_with(|| external_id.clone());
        self.by_key.insert(external_id, IndexEntry { row_id, name_key: key });
    }

    /// Row id for a roll-call reference. Tries the chamber-prefixed form the
    /// normalizer assigns, then the reference as emitted.
    pub fn resolve(&self, chamber: Chamber, raw_ref: &str) -> Option<i64> {
        ExternalId::for_chamber(chamber, raw_ref)
            .and_then(|id| self.by_key.get(&id))
            .or_else(|| ExternalId::from_stored(raw_ref).and_then(|id| self.by_key.get(&id)))
            .map(|entry| entry.row_id)
    }

    pub fn near_duplicates(&self, p: &Parliamentarian, threshold: f64) -> Vec<NearDuplicate> {
        let key = name_key(&p.full_name);
        let Some(names) = self.by_name.get(&p.chamber) else {
            return Vec::new();
        };
        let mut found: Vec<NearDuplicate> = names
            .iter()
            .filter(|(other, id)| **other != key && **id != p.external_id)
            .filter_map(|(other, id)| {
                let score = jaro_winkler(&key, other);
                (score >= threshold).then(|| NearDuplicate {
                    chamber: p.chamber,
                    external_id: p.external_id.clone(),
                    full_name: p.full_name.clone(),
                    similar_external_id: id.clone(),
                    similar_name_key: other.clone(),
                    score,
                })
            })
            .collect();
        found.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.similar_external_id.cmp(&b.similar_external_id))
        });
        found
    }
}

/// Boletin to bill row id, shared by the year workers of a pass.
#[derive(Debug, Clone, Default)]
pub struct BillIndex {
    by_boletin: HashMap<Boletin, i64>,
}

impl BillIndex {
    pub fn from_rows(rows: impl IntoIterator<Item = (i64, Boletin)>) -> Self {
        Self {
            by_boletin: rows.into_iter().map(|(id, b)| (b, id)).collect(),
        }
    }

    pub fn get(&self, boletin: &Boletin) -> Option<i64> {
        self.by_boletin.get(boletin).copied()
    }

    pub fn record(&mut self, boletin: Boletin, row_id: i64) {
        self.by_boletin.insert(boletin, row_id);
    }

    pub fn len(&self) -> usize {
        self.by_boletin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_boletin.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deputy(id: &str, name: &str) -> Parliamentarian {
        Parliamentarian {
            external_id: ExternalId::for_chamber(Chamber::Camara, id).unwrap(),
            full_name: name.to_string(),
            chamber: Chamber::Camara,
            region: None,
            district: None,
            party: None,
        }
    }

    #[test]
    fn known_id_updates_even_if_renamed() {
        let mut index = IdentityReconciler::new();
        index.record(&deputy("1", "Ana Soto"), 10);
        assert_eq!(index.decide(&deputy("1", "Ana María Soto")), Decision::Update { row_id: 10 });
    }

    #[test]
    fn same_name_new_id_is_a_conflict() {
        let mut index = IdentityReconciler::new();
        index.record(&deputy("100", "Juan Pérez"), 1);
        match index.decide(&deputy("100B", "  JUAN   pérez ")) {
            Decision::Conflict(c) => {
                assert_eq!(c.incoming_external_id.as_str(), "DIP-100B");
                assert_eq!(c.existing_external_id.as_str(), "DIP-100");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn same_name_other_chamber_is_not_a_conflict() {
        let mut index = IdentityReconciler::new();
        index.record(&deputy("100", "Juan Pérez"), 1);
        let senator = Parliamentarian {
            external_id: ExternalId::for_chamber(Chamber::Senado, "5003").unwrap(),
            chamber: Chamber::Senado,
            ..deputy("x", "Juan Pérez")
        };
        assert_eq!(index.decide(&senator), Decision::Insert);
    }

    #[test]
    fn accents_distinguish_names() {
        let mut index = IdentityReconciler::new();
        index.record(&deputy("100", "Juan Pérez"), 1);
        assert_eq!(index.decide(&deputy("101", "Juan Perez")), Decision::Insert);
    }

    #[test]
    fn rename_frees_the_old_name() {
        let mut index = IdentityReconciler::new();
        index.record(&deputy("1", "Ana Soto"), 10);
        index.record(&deputy("1", "Ana Soto Díaz"), 10);
        assert_eq!(index.decide(&deputy("2", "Ana Soto")), Decision::Insert);
    }

    #[test]
    fn resolve_tries_prefixed_then_raw() {
        let mut index = IdentityReconciler::new();
        index.record(&deputy("1096", "Gonzalo Ibáñez"), 7);
        let legacy = Parliamentarian {
            external_id: ExternalId::from_stored("777").unwrap(),
            ..deputy("x", "Legacy Row")
        };
        index.record(&legacy, 8);

        assert_eq!(index.resolve(Chamber::Camara, "1096"), Some(7));
        assert_eq!(index.resolve(Chamber::Camara, " dip-1096 "), Some(7));
        assert_eq!(index.resolve(Chamber::Camara, "777"), Some(8));
        assert_eq!(index.resolve(Chamber::Senado, "1096"), None);
        assert_eq!(index.resolve(Chamber::Camara, "9999"), None);
    }

    #[test]
    fn near_duplicates_above_threshold() {
        let mut index = IdentityReconciler::new();
        index.record(&deputy("1200", "María José Soto Díaz"), 1);
        index.record(&deputy("1", "Pedro Alarcón"), 2);
        let found = index.near_duplicates(&deputy("1201", "María Jose Soto Díaz"), DEFAULT_REVIEW_THRESHOLD);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].similar_external_id.as_str(), "DIP-1200");
        assert!(found[0].score >= DEFAULT_REVIEW_THRESHOLD && found[0].score < 1.0);
    }

    #[test]
    fn bill_index_tracks_rows() {
        let b = Boletin::parse("17203-15").unwrap();
        let mut index = BillIndex::default();
        assert_eq!(index.get(&b), None);
        index.record(b.clone(), 3);
        assert_eq!(index.get(&b), Some(3));
        assert_eq!(index.len(), 1);
    }
}
