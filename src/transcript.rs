//! # Transcript Reconciler
//!
//! Merges a stream of partial and final fragments per speaker into one ordered
//! transcript log.
//!
//! ## Rules:
//! - A final fragment replaces the open entry's text outright
//! - A partial fragment is merged into the speaker's open entry by overlap
//!   detection, so re-sent or overlapping deliveries never duplicate words
//! - A fragment whose id matches an existing entry of the same speaker updates
//!   that entry wherever it sits in the log
//! - Otherwise a new entry is appended with the server id or a locally minted one
//!
//! At most one non-final entry exists per speaker, and the log is only ever
//! appended to or updated in place.

use crate::protocol::{Speaker, TranscriptFragment};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// One line of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub id: u64,
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f32>,
}

/// What applying a fragment did to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Appended(u64),
    Updated(u64),
    /// The fragment was a duplicate of what the entry already says
    Unchanged(u64),
    /// Nothing to record (empty text, or a partial for an entry already final)
    Ignored,
}

impl ReconcileOutcome {
    /// Id of the entry touched, when the log changed.
    pub fn changed_entry(&self) -> Option<u64> {
        match self {
            ReconcileOutcome::Appended(id) | ReconcileOutcome::Updated(id) => Some(*id),
            _ => None,
        }
    }
}

/// Join `incoming` onto `existing` without repeating the part they share.
///
/// ## Examples:
/// - "I want" + "I want to buy" → "I want to buy"
/// - "hello wor" + "orld today" → "hello world today"
/// - "see you soon" + "soon" → "see you soon"
pub fn merge_text(existing: &str, incoming: &str) -> String {
    if existing.is_empty() {
        return incoming.to_string();
    }
    if incoming.starts_with(existing) {
        return incoming.to_string();
    }
    if existing.ends_with(incoming) {
        return existing.to_string();
    }

    // Largest prefix of `incoming` that `existing` already ends with.
    let boundaries = incoming
        .char_indices()
        .map(|(i, _)| i)
        .skip(1)
        .chain(std::iter::once(incoming.len()));
    let overlap = boundaries
        .filter(|&end| end <= existing.len())
        .filter(|&end| existing.ends_with(&incoming[..end]))
        .max()
        .unwrap_or(0);

    format!("{}{}", existing, &incoming[overlap..])
}

#[derive(Debug, Default)]
pub struct TranscriptReconciler {
    entries: Vec<TranscriptEntry>,
    /// Index of each speaker's non-final entry
    open: HashMap<Speaker, usize>,
    next_id: u64,
}

impl TranscriptReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn get(&self, id: u64) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn open_entry(&self, speaker: Speaker) -> Option<&TranscriptEntry> {
        self.open.get(&speaker).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop the whole log and restart id minting.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.open.clear();
        self.next_id = 0;
    }

    /// Replace the log with a server-provided history. Every entry is final.
    pub fn replace_history(&mut self, history: Vec<TranscriptFragment>) {
        self.reset();
        for mut fragment in history {
            fragment.is_final = true;
            self.apply(fragment);
        }
    }

    pub fn apply(&mut self, fragment: TranscriptFragment) -> ReconcileOutcome {
        let outcome = self.apply_inner(fragment);
        debug!(?outcome, entries = self.entries.len(), "Transcript fragment applied");
        outcome
    }

    fn apply_inner(&mut self, fragment: TranscriptFragment) -> ReconcileOutcome {
        if let Some(id) = fragment.id {
            if let Some(index) = self
                .entries
                .iter()
                .position(|e| e.id == id && e.speaker == fragment.speaker)
            {
                return self.update_at(index, fragment);
            }
        }

        if let Some(&index) = self.open.get(&fragment.speaker) {
            if fragment.id.is_none() {
                return self.update_at(index, fragment);
            }
            // The server moved on to a new id; the old partial is as good as it gets.
            self.entries[index].is_final = true;
            self.open.remove(&fragment.speaker);
        }

        if fragment.text.trim().is_empty() {
            return ReconcileOutcome::Ignored;
        }

        if fragment.id.is_none() && fragment.is_final {
            if let Some(last) = self.entries.iter().rev().find(|e| e.speaker == fragment.speaker) {
                if last.is_final && last.text == fragment.text {
                    return ReconcileOutcome::Unchanged(last.id);
                }
            }
        }

        self.append(fragment)
    }

    fn mint_id(&mut self, requested: Option<u64>) -> u64 {
        match requested {
            Some(id) if id < u64::MAX && !self.entries.iter().any(|e| e.id == id) => {
                self.next_id = self.next_id.max(id + 1);
                id
            }
            _ => {
                let id = self.next_id;
                self.next_id = self.next_id.saturating_add(1);
                id
            }
        }
    }

    fn append(&mut self, fragment: TranscriptFragment) -> ReconcileOutcome {
        let id = self.mint_id(fragment.id);
        let index = self.entries.len();
        if !fragment.is_final {
            self.open.insert(fragment.speaker, index);
        }
        self.entries.push(TranscriptEntry {
            id,
            speaker: fragment.speaker,
            text: fragment.text,
            is_final: fragment.is_final,
            confidence: fragment.confidence,
        });
        ReconcileOutcome::Appended(id)
    }

    fn update_at(&mut self, index: usize, fragment: TranscriptFragment) -> ReconcileOutcome {
        let entry = &mut self.entries[index];
        let id = entry.id;

        if fragment.is_final {
            // A final closing a partial is authoritative; further finals under
            // the same id are later segments of the same turn.
            let text = if entry.is_final {
                merge_text(&entry.text, &fragment.text)
            } else {
                fragment.text
            };
            let changed = !entry.is_final || entry.text != text;
            entry.text = text;
            entry.is_final = true;
            if fragment.confidence.is_some() {
                entry.confidence = fragment.confidence;
            }
            if self.open.get(&fragment.speaker) == Some(&index) {
                self.open.remove(&fragment.speaker);
            }
            return if changed {
                ReconcileOutcome::Updated(id)
            } else {
                ReconcileOutcome::Unchanged(id)
            };
        }

        if entry.is_final {
            // A partial arriving after its final is stale.
            return ReconcileOutcome::Ignored;
        }

        let merged = merge_text(&entry.text, &fragment.text);
        if fragment.confidence.is_some() {
            entry.confidence = fragment.confidence;
        }
        if merged == entry.text {
            return ReconcileOutcome::Unchanged(id);
        }
        entry.text = merged;
        ReconcileOutcome::Updated(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(speaker: Speaker, text: &str) -> TranscriptFragment {
        TranscriptFragment {
            id: None,
            speaker,
            text: text.to_string(),
            is_final: false,
            confidence: None,
        }
    }

    fn final_(speaker: Speaker, text: &str) -> TranscriptFragment {
        TranscriptFragment {
            is_final: true,
            ..partial(speaker, text)
        }
    }

    fn with_id(mut fragment: TranscriptFragment, id: u64) -> TranscriptFragment {
        fragment.id = Some(id);
        fragment
    }

    #[test]
    fn test_merge_text_cases() {
        assert_eq!(merge_text("I want", "I want to buy"), "I want to buy");
        assert_eq!(merge_text("hello wor", "orld today"), "hello world today");
        assert_eq!(merge_text("see you soon", "soon"), "see you soon");
        assert_eq!(merge_text("same", "same"), "same");
        assert_eq!(merge_text("", "fresh"), "fresh");
        assert_eq!(merge_text("kept", ""), "kept");
        assert_eq!(merge_text("abc", "xyz"), "abcxyz");
        assert_eq!(merge_text("café au", "au lait"), "café au lait");
    }

    #[test]
    fn test_prefix_containment() {
        let mut log = TranscriptReconciler::new();
        log.apply(partial(Speaker::Trainee, "I want"));
        log.apply(partial(Speaker::Trainee, "I want to buy"));
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].text, "I want to buy");
    }

    #[test]
    fn test_suffix_prefix_overlap() {
        let mut log = TranscriptReconciler::new();
        log.apply(partial(Speaker::Customer, "hello wor"));
        log.apply(partial(Speaker::Customer, "orld today"));
        assert_eq!(log.entries()[0].text, "hello world today");
    }

    #[test]
    fn test_final_text_is_authoritative() {
        let mut log = TranscriptReconciler::new();
        log.apply(partial(Speaker::Trainee, "we need fort"));
        log.apply(partial(Speaker::Trainee, "t units"));
        let outcome = log.apply(final_(Speaker::Trainee, "We need forty units."));
        assert_eq!(outcome, ReconcileOutcome::Updated(0));
        assert_eq!(log.entries()[0].text, "We need forty units.");
        assert!(log.entries()[0].is_final);
        assert!(log.open_entry(Speaker::Trainee).is_none());
    }

    #[test]
    fn test_speakers_interleave_independently() {
        let mut log = TranscriptReconciler::new();
        log.apply(partial(Speaker::Trainee, "So about"));
        log.apply(partial(Speaker::Customer, "Mm"));
        log.apply(partial(Speaker::Trainee, "So about the price"));
        log.apply(final_(Speaker::Customer, "Mm-hmm."));

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].text, "So about the price");
        assert!(!log.entries()[0].is_final);
        assert_eq!(log.entries()[1].speaker, Speaker::Customer);
        assert!(log.entries()[1].is_final);
    }

    #[test]
    fn test_new_utterance_after_final_appends() {
        let mut log = TranscriptReconciler::new();
        log.apply(final_(Speaker::Trainee, "Hi."));
        let outcome = log.apply(partial(Speaker::Trainee, "How are"));
        assert_eq!(outcome, ReconcileOutcome::Appended(1));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_server_id_updates_in_place() {
        let mut log = TranscriptReconciler::new();
        log.apply(with_id(partial(Speaker::Customer, "Let me"), 7));
        log.apply(with_id(final_(Speaker::Customer, "Let me think"), 7));
        log.apply(with_id(partial(Speaker::Trainee, "Sure"), 8));

        // A later final for an older entry extends it in place.
        let outcome = log.apply(with_id(final_(Speaker::Customer, "Let me think about it."), 7));
        assert_eq!(outcome, ReconcileOutcome::Updated(7));
        assert_eq!(log.entries()[0].text, "Let me think about it.");
        assert_eq!(log.entries()[1].id, 8);

        // Locally minted ids continue past server ids.
        log.apply(final_(Speaker::Trainee, "Sure thing."));
        log.apply(partial(Speaker::Customer, "Okay"));
        assert_eq!(log.entries().last().unwrap().id, 9);
    }

    #[test]
    fn test_consecutive_finals_with_same_id_accumulate() {
        let mut log = TranscriptReconciler::new();
        log.apply(with_id(partial(Speaker::Trainee, "I want to"), 0));
        log.apply(with_id(final_(Speaker::Trainee, "I want to buy"), 0));
        let outcome = log.apply(with_id(final_(Speaker::Trainee, " forty units."), 0));

        assert_eq!(outcome, ReconcileOutcome::Updated(0));
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].text, "I want to buy forty units.");
        assert!(log.entries()[0].is_final);

        // Redelivery of the last segment changes nothing.
        assert_eq!(
            log.apply(with_id(final_(Speaker::Trainee, "forty units."), 0)),
            ReconcileOutcome::Unchanged(0)
        );
    }

    #[test]
    fn test_largest_server_id_does_not_overflow() {
        let mut log = TranscriptReconciler::new();
        let outcome = log.apply(with_id(final_(Speaker::Customer, "Edge."), u64::MAX));
        assert_eq!(outcome, ReconcileOutcome::Appended(0));

        log.apply(final_(Speaker::Trainee, "Next."));
        assert_eq!(log.entries()[1].id, 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_stale_partial_after_final_is_ignored() {
        let mut log = TranscriptReconciler::new();
        log.apply(with_id(final_(Speaker::Customer, "Done."), 3));
        assert_eq!(
            log.apply(with_id(partial(Speaker::Customer, "Do"), 3)),
            ReconcileOutcome::Ignored
        );
        assert_eq!(log.entries()[0].text, "Done.");
    }

    #[test]
    fn test_unexpected_id_closes_open_entry() {
        let mut log = TranscriptReconciler::new();
        log.apply(with_id(partial(Speaker::Customer, "First"), 1));
        log.apply(with_id(partial(Speaker::Customer, "Second"), 2));
        assert_eq!(log.len(), 2);
        assert!(log.entries()[0].is_final);
        assert_eq!(log.open_entry(Speaker::Customer).unwrap().id, 2);
    }

    #[test]
    fn test_duplicate_deliveries_are_unchanged() {
        let mut log = TranscriptReconciler::new();
        log.apply(partial(Speaker::Trainee, "hello there"));
        assert_eq!(log.apply(partial(Speaker::Trainee, "there")), ReconcileOutcome::Unchanged(0));
        log.apply(final_(Speaker::Trainee, "Hello there."));
        assert_eq!(log.apply(final_(Speaker::Trainee, "Hello there.")), ReconcileOutcome::Unchanged(0));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_empty_fragment_creates_nothing() {
        let mut log = TranscriptReconciler::new();
        assert_eq!(log.apply(partial(Speaker::Customer, "  ")), ReconcileOutcome::Ignored);
        assert!(log.is_empty());
    }

    #[test]
    fn test_final_override_for_many_sequences() {
        let partials = ["a", "ab", "b c", "c d e", "e", ""];
        for n in 0..partials.len() {
            let mut log = TranscriptReconciler::new();
            for text in &partials[..n] {
                log.apply(partial(Speaker::Trainee, text));
            }
            log.apply(final_(Speaker::Trainee, "final words"));
            let last = log.entries().last().unwrap();
            assert_eq!(last.text, "final words");
            assert!(last.is_final);
        }
    }

    #[test]
    fn test_replace_history_and_reset() {
        let mut log = TranscriptReconciler::new();
        log.apply(partial(Speaker::Trainee, "stale"));
        log.replace_history(vec![
            with_id(partial(Speaker::Trainee, "Hi."), 0),
            with_id(partial(Speaker::Customer, "Hello."), 1),
        ]);
        assert_eq!(log.len(), 2);
        assert!(log.entries().iter().all(|e| e.is_final));

        log.reset();
        assert!(log.is_empty());
        assert_eq!(log.apply(final_(Speaker::Trainee, "Again.")), ReconcileOutcome::Appended(0));
    }
}
