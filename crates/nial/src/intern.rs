//! Phrase and fault interning.
//!
//! Phrases (string atoms) and faults (error atoms) are interned: creating one
//! from text that has been seen before returns the existing identity, so
//! equality on either kind is identity comparison. The tables are owned by
//! the [`crate::interp::Interpreter`] and serialized as part of a workspace
//! snapshot.
//!
//! A handful of fault identities are *sentinels*: they are pre-interned at
//! fixed ids and are exempt from fault triggering (see `interp::Interpreter::fault`).

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Index into the phrase interner's storage.
///
/// Uses `u32` to save space; identity comparison of phrases is comparison of
/// these ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhraseId(u32);

impl PhraseId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index into the fault interner's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FaultId(u32);

impl FaultId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The `?noexpr` sentinel: result of an expression that produces no value.
pub const NOEXPR: FaultId = FaultId(0);
/// The `?eof` sentinel: end of input at the top level.
pub const EOF: FaultId = FaultId(1);
/// The `?I` sentinel (zenith).
pub const ZENITH: FaultId = FaultId(2);
/// The `?O` sentinel (nadir).
pub const NADIR: FaultId = FaultId(3);
/// The `?no_value` fault used to fill fresh local slots and undefined variables.
pub const NO_VALUE: FaultId = FaultId(4);
/// The `?L` fault produced by a non-boolean test in a conditional or loop.
pub const LOGICAL: FaultId = FaultId(5);

/// Fault texts interned at fixed ids on construction, in id order.
const PREINTERNED_FAULTS: [&str; 6] = ["?noexpr", "?eof", "?I", "?O", "?no_value", "?L"];

/// Returns true when the fault id is one of the four triggering-exempt
/// sentinels (`?noexpr`, `?eof`, `?I`, `?O`).
#[inline]
pub fn is_sentinel(id: FaultId) -> bool {
    matches!(id, NOEXPR | EOF | ZENITH | NADIR)
}

/// Interning tables for phrases and faults.
///
/// Text is stored once per distinct string; the maps give text -> id lookup
/// and the vectors give id -> text. The maps are rebuilt from the vectors on
/// deserialization so a snapshot only carries each string once.
#[derive(Debug, Default)]
pub struct Interns {
    phrases: Vec<Box<str>>,
    phrase_ids: AHashMap<Box<str>, PhraseId>,
    faults: Vec<Box<str>>,
    fault_ids: AHashMap<Box<str>, FaultId>,
}

impl Interns {
    /// Creates the interning tables with the sentinel faults pre-interned.
    pub fn new() -> Self {
        let mut interns = Self::default();
        for text in PREINTERNED_FAULTS {
            interns.fault(text);
        }
        interns
    }

    /// Interns a phrase, returning the existing id when the text was seen before.
    pub fn phrase(&mut self, text: &str) -> PhraseId {
        if let Some(&id) = self.phrase_ids.get(text) {
            return id;
        }
        let id = PhraseId(u32::try_from(self.phrases.len()).expect("phrase table overflow"));
        let boxed: Box<str> = text.into();
        self.phrases.push(boxed.clone());
        self.phrase_ids.insert(boxed, id);
        id
    }

    /// Looks up a phrase without interning it.
    #[must_use]
    pub fn lookup_phrase(&self, text: &str) -> Option<PhraseId> {
        self.phrase_ids.get(text).copied()
    }

    /// Returns the text of an interned phrase.
    ///
    /// # Panics
    /// Panics if the id did not come from this table.
    #[must_use]
    pub fn phrase_text(&self, id: PhraseId) -> &str {
        &self.phrases[id.index()]
    }

    /// Interns a fault. The text is normalized to carry a single leading `?`.
    pub fn fault(&mut self, text: &str) -> FaultId {
        let normalized: Box<str> = if text.starts_with('?') {
            text.into()
        } else {
            format!("?{text}").into()
        };
        if let Some(&id) = self.fault_ids.get(&normalized) {
            return id;
        }
        let id = FaultId(u32::try_from(self.faults.len()).expect("fault table overflow"));
        self.faults.push(normalized.clone());
        self.fault_ids.insert(normalized, id);
        id
    }

    /// Returns the text of an interned fault, including the leading `?`.
    ///
    /// # Panics
    /// Panics if the id did not come from this table.
    #[must_use]
    pub fn fault_text(&self, id: FaultId) -> &str {
        &self.faults[id.index()]
    }

    /// Number of distinct interned phrases.
    #[must_use]
    pub fn phrase_count(&self) -> usize {
        self.phrases.len()
    }
}

impl Serialize for Interns {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Interns", 2)?;
        state.serialize_field("phrases", &self.phrases)?;
        state.serialize_field("faults", &self.faults)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Interns {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct InternsFields {
            phrases: Vec<Box<str>>,
            faults: Vec<Box<str>>,
        }
        let fields = InternsFields::deserialize(deserializer)?;
        let phrase_ids = fields
            .phrases
            .iter()
            .enumerate()
            .map(|(i, text)| (text.clone(), PhraseId(i as u32)))
            .collect();
        let fault_ids = fields
            .faults
            .iter()
            .enumerate()
            .map(|(i, text)| (text.clone(), FaultId(i as u32)))
            .collect();
        Ok(Self {
            phrases: fields.phrases,
            phrase_ids,
            faults: fields.faults,
            fault_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_text_shares_identity() {
        let mut interns = Interns::new();
        let a = interns.phrase("HELLO");
        let b = interns.phrase("HELLO");
        let c = interns.phrase("WORLD");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn fault_text_is_normalized() {
        let mut interns = Interns::new();
        let a = interns.fault("address");
        let b = interns.fault("?address");
        assert_eq!(a, b);
        assert_eq!(interns.fault_text(a), "?address");
    }

    #[test]
    fn sentinels_are_preinterned() {
        let mut interns = Interns::new();
        assert_eq!(interns.fault("?noexpr"), NOEXPR);
        assert_eq!(interns.fault("?eof"), EOF);
        assert_eq!(interns.fault("?I"), ZENITH);
        assert_eq!(interns.fault("?O"), NADIR);
        assert!(is_sentinel(NOEXPR));
        assert!(!is_sentinel(NO_VALUE));
    }

    #[test]
    fn snapshot_round_trip_preserves_ids() {
        let mut interns = Interns::new();
        let a = interns.phrase("COUNTER");
        let f = interns.fault("?address");
        let bytes = postcard::to_allocvec(&interns).unwrap();
        let restored: Interns = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(restored.phrase_text(a), "COUNTER");
        assert_eq!(restored.fault_text(f), "?address");
        assert_eq!(restored.lookup_phrase("COUNTER"), Some(a));
    }
}
