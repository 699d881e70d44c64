//! In-memory registry of not-yet-durable compounds and fragments.
//!
//! A writer registers its finished compound here before the fragment cache
//! has uploaded the compound's fragments. Queries inside the same write
//! transaction see these pending objects (pending-preferred lookups), and on
//! writer failure the engine walks this registry to undo partial state.
//!
//! A pending compound is "ready" once none of its fragments are pending any
//! more; the fragment cache pops ready compounds after each upload and writes
//! their sequence-mapping rows.

use parking_lot::Mutex;
use std::collections::HashMap;
use stowage_core::{Compound, CompoundName, Fragment, FragmentHash, SequenceIndex};

struct PendingCompound {
    compound: Compound,
    /// Hashes of this compound's fragments that were pending at registration.
    needed: Vec<FragmentHash>,
    /// Full reconstruction order, kept until the compound is made durable.
    sequence: Vec<(Fragment, SequenceIndex)>,
}

#[derive(Default)]
struct Inner {
    compounds: HashMap<CompoundName, PendingCompound>,
    fragments: HashMap<FragmentHash, Fragment>,
}

/// Pending-objects controller (one per engine).
#[derive(Default)]
pub struct PendingObjectsController {
    inner: Mutex<Inner>,
}

impl PendingObjectsController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fragment that is buffered but not yet uploaded.
    pub fn add_fragment(&self, fragment: &Fragment) {
        let mut inner = self.inner.lock();
        inner
            .fragments
            .entry(fragment.hash)
            .or_insert_with(|| fragment.clone());
    }

    /// Register a closed compound with its fragment list and reconstruction
    /// order. Only fragments that are currently pending are recorded as
    /// blocking; a compound whose fragments are all durable is immediately
    /// ready.
    ///
    /// Writers on one name are serialized by the exclusive name lock, so a
    /// pending compound under the same name is an overwrite that never became
    /// durable; the new registration supersedes it.
    pub fn add_compound(
        &self,
        compound: Compound,
        fragments: &[Fragment],
        sequence: Vec<(Fragment, SequenceIndex)>,
    ) {
        let mut inner = self.inner.lock();
        if inner.compounds.remove(&compound.name).is_some() {
            tracing::debug!(compound = %compound.name, "superseding pending compound");
        }
        let needed: Vec<FragmentHash> = fragments
            .iter()
            .filter(|f| inner.fragments.contains_key(&f.hash))
            .map(|f| f.hash)
            .collect();
        inner.compounds.insert(
            compound.name.clone(),
            PendingCompound {
                compound,
                needed,
                sequence,
            },
        );
    }

    /// Mark a fragment durable: scrub it from every pending compound's
    /// blocking list and drop it from the pending-fragment map.
    pub fn remove_fragment(&self, hash: &FragmentHash) {
        let mut inner = self.inner.lock();
        inner.fragments.remove(hash);
        for pending in inner.compounds.values_mut() {
            pending.needed.retain(|needed| needed != hash);
        }
    }

    /// Drop a pending compound by name, returning its record if present.
    pub fn remove_compound_by_name(&self, name: &CompoundName) -> Option<Compound> {
        let mut inner = self.inner.lock();
        inner.compounds.remove(name).map(|p| p.compound)
    }

    /// Pending compound registered under `name`, if any.
    pub fn compound_by_name(&self, name: &CompoundName) -> Option<Compound> {
        let inner = self.inner.lock();
        inner.compounds.get(name).map(|p| p.compound.clone())
    }

    /// Reconstruction order of the pending compound under `name`.
    pub fn sequence_for_name(
        &self,
        name: &CompoundName,
    ) -> Option<Vec<(Fragment, SequenceIndex)>> {
        let inner = self.inner.lock();
        inner.compounds.get(name).map(|p| p.sequence.clone())
    }

    /// All pending compounds.
    pub fn pending_compounds(&self) -> Vec<Compound> {
        let inner = self.inner.lock();
        inner
            .compounds
            .values()
            .map(|p| p.compound.clone())
            .collect()
    }

    /// All pending fragments.
    pub fn pending_fragments(&self) -> Vec<Fragment> {
        let inner = self.inner.lock();
        inner.fragments.values().cloned().collect()
    }

    /// Whether `hash` is still pending.
    pub fn has_fragment(&self, hash: &FragmentHash) -> bool {
        let inner = self.inner.lock();
        inner.fragments.contains_key(hash)
    }

    /// Pop every compound whose fragments are all durable, returning the
    /// sequence mappings to commit.
    pub fn pop_ready_sequences(&self) -> Vec<(Compound, Vec<(Fragment, SequenceIndex)>)> {
        let mut inner = self.inner.lock();
        let ready: Vec<CompoundName> = inner
            .compounds
            .iter()
            .filter(|(_, p)| p.needed.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        ready
            .into_iter()
            .filter_map(|name| {
                inner
                    .compounds
                    .remove(&name)
                    .map(|p| (p.compound, p.sequence))
            })
            .collect()
    }

    /// Drop everything. Used by the engine's failure cleanup.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.compounds.clear();
        inner.fragments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_core::{CompoundHash, CompoundKind, CompressTag, WrapTag};

    fn compound(name: &str) -> Compound {
        Compound::new(
            CompoundName::from(name),
            CompoundKind::File,
            CompoundHash::of(name.as_bytes()),
            4,
            WrapTag::new("pass"),
            CompressTag::new("pass"),
        )
    }

    fn fragment(data: &[u8]) -> Fragment {
        Fragment::new(FragmentHash::of(data), data.len() as u64, data.len() as u64)
    }

    #[test]
    fn test_compound_becomes_ready_when_fragments_durable() {
        let pending = PendingObjectsController::new();
        let f1 = fragment(b"one");
        let f2 = fragment(b"two");
        pending.add_fragment(&f1);
        pending.add_fragment(&f2);
        pending.add_compound(
            compound("c"),
            &[f1.clone(), f2.clone()],
            vec![(f1.clone(), 0), (f2.clone(), 1)],
        );

        assert!(pending.pop_ready_sequences().is_empty());
        pending.remove_fragment(&f1.hash);
        assert!(pending.pop_ready_sequences().is_empty());
        pending.remove_fragment(&f2.hash);

        let ready = pending.pop_ready_sequences();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1.len(), 2);
        assert!(pending.pending_compounds().is_empty());
    }

    #[test]
    fn test_compound_with_durable_fragments_is_immediately_ready() {
        let pending = PendingObjectsController::new();
        let f = fragment(b"already durable");
        // Fragment was never registered as pending (e.g. deduplicated).
        pending.add_compound(compound("c"), &[f.clone()], vec![(f, 0)]);
        assert_eq!(pending.pop_ready_sequences().len(), 1);
    }

    #[test]
    fn test_same_name_registration_supersedes() {
        let pending = PendingObjectsController::new();
        let f = fragment(b"blocking");
        pending.add_fragment(&f);
        pending.add_compound(compound("c"), &[f.clone()], vec![(f, 0)]);
        // The overwrite that never became durable is replaced wholesale.
        pending.add_compound(compound("c"), &[], vec![]);
        let ready = pending.pop_ready_sequences();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].1.is_empty());
    }

    #[test]
    fn test_pending_lookup_by_name() {
        let pending = PendingObjectsController::new();
        let f = fragment(b"x");
        pending.add_fragment(&f);
        pending.add_compound(compound("name"), &[f.clone()], vec![(f, 0)]);
        assert!(pending.compound_by_name(&CompoundName::from("name")).is_some());
        assert_eq!(
            pending
                .sequence_for_name(&CompoundName::from("name"))
                .unwrap()
                .len(),
            1
        );
        assert!(pending.compound_by_name(&CompoundName::from("other")).is_none());
    }

    #[test]
    fn test_remove_compound_by_name() {
        let pending = PendingObjectsController::new();
        pending.add_compound(compound("c"), &[], vec![]);
        assert!(pending
            .remove_compound_by_name(&CompoundName::from("c"))
            .is_some());
        assert!(pending.pop_ready_sequences().is_empty());
    }
}
