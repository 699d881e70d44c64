//! In-memory reference implementation of the [`Meta`] contract.
//!
//! Plain tables behind one mutex, integer id allocation, and a
//! snapshot-stack transaction scope: every `begin` clones the tables, commit
//! discards the clone, rollback restores it. Clone-per-scope is affordable
//! here; durable drivers implement the same contract with real transactions.

use crate::{CompoundFilter, Meta};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use stowage_core::{
    Compound, CompoundHash, CompoundId, CompoundKind, CompoundName, CompressTag, Error, Fragment,
    FragmentHash, FragmentId, FragmentOffset, Resource, ResourceHash, ResourceId, ResourceName,
    Result, SequenceIndex, WrapTag,
};

#[derive(Clone, Default)]
struct Tables {
    next_compound_id: u64,
    next_fragment_id: u64,
    next_resource_id: u64,
    compounds: BTreeMap<u64, Compound>,
    fragments: BTreeMap<u64, Fragment>,
    fragments_by_hash: HashMap<FragmentHash, u64>,
    resources: BTreeMap<u64, Resource>,
    /// compound id → (fragment id, sequence index), dense per compound.
    compound_fragments: BTreeMap<u64, Vec<(u64, SequenceIndex)>>,
    /// fragment id → (resource id, offset). A fragment lives in exactly one
    /// resource at a time.
    fragment_resources: BTreeMap<u64, (u64, FragmentOffset)>,
}

impl Tables {
    fn compound_rows_for_name<'a>(
        &'a self,
        name: &'a CompoundName,
    ) -> impl Iterator<Item = &'a Compound> {
        self.compounds.values().filter(move |c| &c.name == name)
    }

    fn live_compound_id(&self, name: &CompoundName) -> Option<u64> {
        self.compounds
            .iter()
            .find(|(_, c)| &c.name == name && c.version.is_none())
            .map(|(id, _)| *id)
    }

    fn compound_row(&self, name: &CompoundName, version: Option<u32>) -> Option<&Compound> {
        self.compounds
            .values()
            .find(|c| &c.name == name && c.version == version)
    }

    /// Sequence references per fragment, counted over live compounds only.
    /// Snapshot rows clone the live mapping and would otherwise report every
    /// snapshotted fragment as a duplicate without any content sharing.
    fn fragment_refcounts(&self) -> HashMap<u64, u64> {
        let mut counts: HashMap<u64, u64> = HashMap::new();
        for (id, compound) in &self.compounds {
            if compound.version.is_some() {
                continue;
            }
            if let Some(rows) = self.compound_fragments.get(id) {
                for (fragment_id, _) in rows {
                    *counts.entry(*fragment_id).or_insert(0) += 1;
                }
            }
        }
        counts
    }
}

struct State {
    tables: Tables,
    /// Per-thread snapshot stacks. Scopes are re-entrant within a thread;
    /// each `begin` pushes a clone of the tables for the calling thread,
    /// commit discards it, rollback restores it.
    snapshots: HashMap<std::thread::ThreadId, Vec<Tables>>,
}

/// In-memory [`Meta`] store.
///
/// Rollback restores a whole-table snapshot taken at the calling thread's
/// `begin`; concurrent mutations from other threads between that `begin` and
/// the rollback are lost with it. Durable drivers provide real per-connection
/// transactions; this implementation trades that isolation for simplicity,
/// which is sufficient for engine error paths (rollbacks happen under the
/// failing operation's locks).
pub struct MemoryMeta {
    state: Mutex<State>,
}

impl MemoryMeta {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tables: Tables {
                    next_compound_id: 1,
                    next_fragment_id: 1,
                    next_resource_id: 1,
                    ..Tables::default()
                },
                snapshots: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryMeta {
    fn default() -> Self {
        Self::new()
    }
}

fn fragment_with_id(id: u64, fragment: &Fragment) -> Fragment {
    let mut f = fragment.clone();
    f.id = Some(FragmentId(id));
    f
}

impl Meta for MemoryMeta {
    fn begin(&self) {
        let mut state = self.state.lock();
        let snapshot = state.tables.clone();
        let thread = std::thread::current().id();
        state.snapshots.entry(thread).or_default().push(snapshot);
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        let thread = std::thread::current().id();
        match state.snapshots.get_mut(&thread).and_then(Vec::pop) {
            Some(_) => Ok(()),
            None => Err(Error::meta("commit without matching begin")),
        }
    }

    fn rollback(&self) {
        let mut state = self.state.lock();
        let thread = std::thread::current().id();
        match state.snapshots.get_mut(&thread).and_then(Vec::pop) {
            Some(snapshot) => state.tables = snapshot,
            None => tracing::warn!("rollback without matching begin"),
        }
    }

    fn has_compound(&self, name: &CompoundName, version: Option<u32>) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.tables.compound_row(name, version).is_some())
    }

    fn get_compound(&self, name: &CompoundName, version: Option<u32>) -> Result<Compound> {
        let state = self.state.lock();
        state
            .tables
            .compound_row(name, version)
            .cloned()
            .ok_or_else(|| Error::compound_not_existing(name))
    }

    fn get_compound_by_hash(&self, hash: &CompoundHash, version: Option<u32>) -> Result<Compound> {
        let state = self.state.lock();
        state
            .tables
            .compounds
            .values()
            .find(|c| &c.hash == hash && c.version == version)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("compound with hash {hash}")))
    }

    fn get_compound_by_hash_with_fragment_links(&self, hash: &CompoundHash) -> Result<Compound> {
        let state = self.state.lock();
        state
            .tables
            .compounds
            .iter()
            .filter(|(_, c)| &c.hash == hash)
            .find(|(id, _)| {
                state
                    .tables
                    .compound_fragments
                    .get(*id)
                    .is_some_and(|rows| !rows.is_empty())
            })
            .map(|(_, c)| c.clone())
            .ok_or_else(|| Error::not_found(format!("linked compound with hash {hash}")))
    }

    fn make_compound(&self, compound: &Compound) -> Result<Compound> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        if tables
            .compound_row(&compound.name, compound.version)
            .is_some()
        {
            return Err(Error::compound_already_exists(&compound.name));
        }
        let id = tables.next_compound_id;
        tables.next_compound_id += 1;
        let mut row = compound.clone();
        row.id = Some(CompoundId(id));
        tables.compounds.insert(id, row.clone());
        Ok(row)
    }

    fn make_snapshot(&self, name: &CompoundName) -> Result<Compound> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        let live_id = tables
            .live_compound_id(name)
            .ok_or_else(|| Error::compound_not_existing(name))?;
        let next_version = tables
            .compound_rows_for_name(name)
            .filter_map(|c| c.version)
            .max()
            .unwrap_or(0)
            + 1;
        let mut row = tables.compounds[&live_id].clone();
        let id = tables.next_compound_id;
        tables.next_compound_id += 1;
        row.id = Some(CompoundId(id));
        row.version = Some(next_version);
        tables.compounds.insert(id, row.clone());
        let mapping = tables
            .compound_fragments
            .get(&live_id)
            .cloned()
            .unwrap_or_default();
        if !mapping.is_empty() {
            tables.compound_fragments.insert(id, mapping);
        }
        Ok(row)
    }

    fn rename_compound(&self, old: &CompoundName, new: &CompoundName) -> Result<()> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        if tables.compound_rows_for_name(new).next().is_some() {
            return Err(Error::compound_already_exists(new));
        }
        let ids: Vec<u64> = tables
            .compounds
            .iter()
            .filter(|(_, c)| &c.name == old)
            .map(|(id, _)| *id)
            .collect();
        if ids.is_empty() {
            return Err(Error::compound_not_existing(old));
        }
        for id in ids {
            if let Some(row) = tables.compounds.get_mut(&id) {
                row.name = new.clone();
            }
        }
        Ok(())
    }

    fn remove_compound(&self, id: CompoundId) -> Result<()> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        tables
            .compounds
            .remove(&id.0)
            .ok_or_else(|| Error::not_found(format!("compound {id}")))?;
        tables.compound_fragments.remove(&id.0);
        Ok(())
    }

    fn remove_compound_by_name(&self, name: &CompoundName, keep_snapshots: bool) -> Result<()> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        let ids: Vec<u64> = tables
            .compounds
            .iter()
            .filter(|(_, c)| &c.name == name && (!keep_snapshots || c.version.is_none()))
            .map(|(id, _)| *id)
            .collect();
        if ids.is_empty() {
            return Err(Error::compound_not_existing(name));
        }
        for id in ids {
            tables.compounds.remove(&id);
            tables.compound_fragments.remove(&id);
        }
        Ok(())
    }

    fn truncate_compounds(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.tables.compounds.clear();
        state.tables.compound_fragments.clear();
        Ok(())
    }

    fn list_compounds(&self, filter: &CompoundFilter) -> Result<Vec<Compound>> {
        let state = self.state.lock();
        let mut out: Vec<Compound> = state
            .tables
            .compounds
            .values()
            .filter(|c| filter.include_snapshots || c.version.is_none())
            .filter(|c| filter.kind.map_or(true, |k| c.kind == k))
            .filter(|c| {
                filter
                    .prefix
                    .as_deref()
                    .map_or(true, |p| c.name.as_str().starts_with(p))
            })
            .filter(|c| {
                filter
                    .suffix
                    .as_deref()
                    .map_or(true, |s| c.name.as_str().ends_with(s))
            })
            .filter(|c| {
                filter
                    .slash_count
                    .map_or(true, |n| c.name.as_str().matches('/').count() == n)
            })
            .filter(|c| filter.min_size.map_or(true, |s| c.size >= s))
            .cloned()
            .collect();
        if filter.alphabetical {
            out.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        }
        Ok(out)
    }

    fn list_compound_names(
        &self,
        include_snapshots: bool,
    ) -> Result<Vec<(CompoundName, Option<u32>)>> {
        let state = self.state.lock();
        Ok(state
            .tables
            .compounds
            .values()
            .filter(|c| include_snapshots || c.version.is_none())
            .map(|c| (c.name.clone(), c.version))
            .collect())
    }

    fn list_snapshots(
        &self,
        name: &CompoundName,
        min_version: Option<u32>,
        max_version: Option<u32>,
        include_live: bool,
    ) -> Result<Vec<Compound>> {
        let state = self.state.lock();
        let mut out: Vec<Compound> = state
            .tables
            .compound_rows_for_name(name)
            .filter(|c| match c.version {
                None => include_live,
                Some(v) => {
                    min_version.map_or(true, |min| v >= min)
                        && max_version.map_or(true, |max| v <= max)
                }
            })
            .cloned()
            .collect();
        out.sort_by_key(|c| c.version);
        Ok(out)
    }

    fn add_overwrite_compound_and_map_fragments(
        &self,
        compound: &Compound,
        sequence: &[(Fragment, SequenceIndex)],
    ) -> Result<Compound> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;

        let mut rows = Vec::with_capacity(sequence.len());
        for (fragment, index) in sequence {
            let fragment_id = match fragment.id {
                Some(id) => id.0,
                None => *tables.fragments_by_hash.get(&fragment.hash).ok_or_else(|| {
                    Error::fragment_missing(format!(
                        "fragment {} has no row while mapping compound {}",
                        fragment.hash, compound.name
                    ))
                })?,
            };
            rows.push((fragment_id, *index));
        }

        let id = match tables
            .compounds
            .iter()
            .find(|(_, c)| c.name == compound.name && c.version == compound.version)
            .map(|(id, _)| *id)
        {
            Some(existing) => existing,
            None => {
                let id = tables.next_compound_id;
                tables.next_compound_id += 1;
                id
            }
        };
        let mut row = compound.clone();
        row.id = Some(CompoundId(id));
        tables.compounds.insert(id, row.clone());
        if rows.is_empty() {
            tables.compound_fragments.remove(&id);
        } else {
            tables.compound_fragments.insert(id, rows);
        }
        Ok(row)
    }

    fn set_fragment_mappings_for_compound(
        &self,
        id: CompoundId,
        rows: &[(FragmentId, SequenceIndex)],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        if !tables.compounds.contains_key(&id.0) {
            return Err(Error::not_found(format!("compound {id}")));
        }
        let rows: Vec<(u64, SequenceIndex)> = rows.iter().map(|(f, s)| (f.0, *s)).collect();
        if rows.is_empty() {
            tables.compound_fragments.remove(&id.0);
        } else {
            tables.compound_fragments.insert(id.0, rows);
        }
        Ok(())
    }

    fn sequence_fragments_for_compound(
        &self,
        id: CompoundId,
    ) -> Result<Vec<(SequenceIndex, Fragment)>> {
        let state = self.state.lock();
        let tables = &state.tables;
        let mut out = Vec::new();
        if let Some(rows) = tables.compound_fragments.get(&id.0) {
            for (fragment_id, index) in rows {
                let fragment = tables
                    .fragments
                    .get(fragment_id)
                    .ok_or_else(|| Error::not_found(format!("fragment {fragment_id}")))?;
                out.push((*index, fragment.clone()));
            }
        }
        out.sort_by_key(|(index, _)| *index);
        Ok(out)
    }

    fn fragment_hashes_for_compound(&self, id: CompoundId) -> Result<Vec<FragmentHash>> {
        let state = self.state.lock();
        let tables = &state.tables;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        if let Some(rows) = tables.compound_fragments.get(&id.0) {
            for (fragment_id, _) in rows {
                let fragment = tables
                    .fragments
                    .get(fragment_id)
                    .ok_or_else(|| Error::not_found(format!("fragment {fragment_id}")))?;
                if seen.insert(fragment.hash) {
                    out.push(fragment.hash);
                }
            }
        }
        Ok(out)
    }

    fn compounds_without_fragment_links(&self) -> Result<Vec<Compound>> {
        let state = self.state.lock();
        Ok(state
            .tables
            .compounds
            .iter()
            .filter(|(id, c)| {
                c.size > 0
                    && state
                        .tables
                        .compound_fragments
                        .get(*id)
                        .map_or(true, |rows| rows.is_empty())
            })
            .map(|(_, c)| c.clone())
            .collect())
    }

    fn has_fragment(&self, hash: &FragmentHash) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.tables.fragments_by_hash.contains_key(hash))
    }

    fn get_fragment(&self, hash: &FragmentHash) -> Result<Fragment> {
        let state = self.state.lock();
        let tables = &state.tables;
        tables
            .fragments_by_hash
            .get(hash)
            .and_then(|id| tables.fragments.get(id))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("fragment with hash {hash}")))
    }

    fn get_fragment_by_id(&self, id: FragmentId) -> Result<Fragment> {
        let state = self.state.lock();
        state
            .tables
            .fragments
            .get(&id.0)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("fragment {id}")))
    }

    fn make_fragment(&self, hash: &FragmentHash, size: u64, payload_size: u64) -> Result<Fragment> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        if let Some(id) = tables.fragments_by_hash.get(hash) {
            return Ok(tables.fragments[id].clone());
        }
        let id = tables.next_fragment_id;
        tables.next_fragment_id += 1;
        let mut fragment = Fragment::new(*hash, size, payload_size);
        fragment.id = Some(FragmentId(id));
        tables.fragments.insert(id, fragment.clone());
        tables.fragments_by_hash.insert(*hash, id);
        Ok(fragment)
    }

    fn delete_fragments(&self, fragments: &[Fragment]) -> Result<()> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        for fragment in fragments {
            let id = match fragment.id {
                Some(id) => Some(id.0),
                None => tables.fragments_by_hash.get(&fragment.hash).copied(),
            };
            let Some(id) = id else { continue };
            if let Some(removed) = tables.fragments.remove(&id) {
                tables.fragments_by_hash.remove(&removed.hash);
            }
            tables.fragment_resources.remove(&id);
            for rows in tables.compound_fragments.values_mut() {
                rows.retain(|(fragment_id, _)| *fragment_id != id);
            }
        }
        Ok(())
    }

    fn unreferenced_fragments(&self) -> Result<Vec<Fragment>> {
        let state = self.state.lock();
        let tables = &state.tables;
        let referenced: HashSet<u64> = tables
            .compound_fragments
            .values()
            .flatten()
            .map(|(fragment_id, _)| *fragment_id)
            .collect();
        Ok(tables
            .fragments
            .iter()
            .filter(|(id, _)| !referenced.contains(*id))
            .map(|(_, f)| f.clone())
            .collect())
    }

    fn fragments_without_resource_links(&self) -> Result<Vec<Fragment>> {
        let state = self.state.lock();
        let tables = &state.tables;
        Ok(tables
            .fragments
            .iter()
            .filter(|(id, _)| !tables.fragment_resources.contains_key(*id))
            .map(|(_, f)| f.clone())
            .collect())
    }

    fn all_fragments_sorted_by_compound_usage(&self) -> Result<Vec<Fragment>> {
        let state = self.state.lock();
        let tables = &state.tables;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (compound_id, rows) in &tables.compound_fragments {
            let mut rows = rows.clone();
            rows.sort_by_key(|(_, index)| *index);
            for (fragment_id, _) in rows {
                if seen.insert(fragment_id) {
                    if let Some(fragment) = tables.fragments.get(&fragment_id) {
                        out.push(fragment.clone());
                    } else {
                        return Err(Error::not_found(format!(
                            "fragment {fragment_id} referenced by compound {compound_id}"
                        )));
                    }
                }
            }
        }
        Ok(out)
    }

    fn make_resource(
        &self,
        name: &ResourceName,
        size: u64,
        payload_size: u64,
        hash: &ResourceHash,
        wrap_tag: &WrapTag,
        compress_tag: &CompressTag,
    ) -> Result<Resource> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        let id = tables.next_resource_id;
        tables.next_resource_id += 1;
        let resource = Resource {
            id: ResourceId(id),
            name: name.clone(),
            size,
            payload_size,
            hash: *hash,
            wrap_tag: wrap_tag.clone(),
            compress_tag: compress_tag.clone(),
        };
        tables.resources.insert(id, resource.clone());
        Ok(resource)
    }

    fn get_resource_by_hash(&self, hash: &ResourceHash) -> Result<Resource> {
        let state = self.state.lock();
        state
            .tables
            .resources
            .values()
            .find(|r| &r.hash == hash)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("resource with hash {hash}")))
    }

    fn get_resource_by_name(&self, name: &ResourceName) -> Result<Resource> {
        let state = self.state.lock();
        state
            .tables
            .resources
            .values()
            .find(|r| &r.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("resource {name}")))
    }

    fn delete_resource(&self, id: ResourceId) -> Result<()> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        tables
            .resources
            .remove(&id.0)
            .ok_or_else(|| Error::not_found(format!("resource {id}")))?;
        tables
            .fragment_resources
            .retain(|_, (resource_id, _)| *resource_id != id.0);
        Ok(())
    }

    fn all_resources(&self) -> Result<Vec<Resource>> {
        let state = self.state.lock();
        Ok(state.tables.resources.values().cloned().collect())
    }

    fn all_resources_size_sorted(&self) -> Result<Vec<Resource>> {
        let mut out = self.all_resources()?;
        out.sort_by(|a, b| b.payload_size.cmp(&a.payload_size));
        Ok(out)
    }

    fn all_resource_names(&self) -> Result<Vec<ResourceName>> {
        let state = self.state.lock();
        Ok(state.tables.resources.values().map(|r| r.name.clone()).collect())
    }

    fn smallest_resource(&self, ignore: &HashSet<ResourceHash>) -> Result<Option<Resource>> {
        let state = self.state.lock();
        let tables = &state.tables;
        let mapped: HashSet<u64> = tables
            .fragment_resources
            .values()
            .map(|(resource_id, _)| *resource_id)
            .collect();
        Ok(tables
            .resources
            .values()
            .filter(|r| mapped.contains(&r.id.0) && !ignore.contains(&r.hash))
            .min_by_key(|r| r.payload_size)
            .cloned())
    }

    fn unreferenced_resources(&self) -> Result<Vec<Resource>> {
        let state = self.state.lock();
        let tables = &state.tables;
        let mapped: HashSet<u64> = tables
            .fragment_resources
            .values()
            .map(|(resource_id, _)| *resource_id)
            .collect();
        Ok(tables
            .resources
            .values()
            .filter(|r| !mapped.contains(&r.id.0))
            .cloned()
            .collect())
    }

    fn resources_with_referenced_fragment_size(&self) -> Result<Vec<(Resource, u64)>> {
        let state = self.state.lock();
        let tables = &state.tables;
        let mut sums: HashMap<u64, u64> = HashMap::new();
        for (fragment_id, (resource_id, _)) in &tables.fragment_resources {
            if let Some(fragment) = tables.fragments.get(fragment_id) {
                *sums.entry(*resource_id).or_insert(0) += fragment.size;
            }
        }
        Ok(tables
            .resources
            .values()
            .map(|r| (r.clone(), sums.get(&r.id.0).copied().unwrap_or(0)))
            .collect())
    }

    fn resource_and_offset_for_fragment(
        &self,
        id: FragmentId,
    ) -> Result<(Resource, FragmentOffset)> {
        let state = self.state.lock();
        let tables = &state.tables;
        let (resource_id, offset) = tables
            .fragment_resources
            .get(&id.0)
            .ok_or_else(|| Error::not_found(format!("resource mapping for fragment {id}")))?;
        let resource = tables
            .resources
            .get(resource_id)
            .ok_or_else(|| Error::not_found(format!("resource {resource_id}")))?;
        Ok((resource.clone(), *offset))
    }

    fn fragments_with_offset_on_resource(
        &self,
        id: ResourceId,
    ) -> Result<Vec<(Fragment, FragmentOffset)>> {
        let state = self.state.lock();
        let tables = &state.tables;
        let mut out: Vec<(Fragment, FragmentOffset)> = tables
            .fragment_resources
            .iter()
            .filter(|(_, (resource_id, _))| *resource_id == id.0)
            .filter_map(|(fragment_id, (_, offset))| {
                tables
                    .fragments
                    .get(fragment_id)
                    .map(|f| (f.clone(), *offset))
            })
            .collect();
        out.sort_by_key(|(_, offset)| *offset);
        Ok(out)
    }

    fn has_resource_mapping(&self, id: FragmentId) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.tables.fragment_resources.contains_key(&id.0))
    }

    fn make_and_map_fragments_to_resource(
        &self,
        resource: ResourceId,
        rows: &[(Fragment, FragmentOffset)],
    ) -> Result<Vec<Fragment>> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        if !tables.resources.contains_key(&resource.0) {
            return Err(Error::not_found(format!("resource {resource}")));
        }
        let mut out = Vec::with_capacity(rows.len());
        for (fragment, offset) in rows {
            let id = match tables.fragments_by_hash.get(&fragment.hash) {
                Some(id) => *id,
                None => {
                    let id = tables.next_fragment_id;
                    tables.next_fragment_id += 1;
                    tables.fragments.insert(id, fragment_with_id(id, fragment));
                    tables.fragments_by_hash.insert(fragment.hash, id);
                    id
                }
            };
            tables.fragment_resources.insert(id, (resource.0, *offset));
            out.push(fragment_with_id(id, fragment));
        }
        Ok(out)
    }

    fn map_fragments_to_resource(
        &self,
        resource: ResourceId,
        rows: &[(FragmentId, FragmentOffset)],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        if !tables.resources.contains_key(&resource.0) {
            return Err(Error::not_found(format!("resource {resource}")));
        }
        for (fragment_id, offset) in rows {
            if !tables.fragments.contains_key(&fragment_id.0) {
                return Err(Error::not_found(format!("fragment {fragment_id}")));
            }
            tables
                .fragment_resources
                .insert(fragment_id.0, (resource.0, *offset));
        }
        Ok(())
    }

    fn move_fragment_mappings(&self, old: ResourceId, new: ResourceId) -> Result<()> {
        let mut state = self.state.lock();
        let tables = &mut state.tables;
        for (resource_id, _) in tables.fragment_resources.values_mut() {
            if *resource_id == old.0 {
                *resource_id = new.0;
            }
        }
        Ok(())
    }

    fn total_compound_count(&self, kind: Option<CompoundKind>) -> Result<u64> {
        let state = self.state.lock();
        Ok(state
            .tables
            .compounds
            .values()
            .filter(|c| c.version.is_none())
            .filter(|c| kind.map_or(true, |k| c.kind == k))
            .count() as u64)
    }

    fn total_compound_size(&self) -> Result<u64> {
        let state = self.state.lock();
        Ok(state
            .tables
            .compounds
            .values()
            .filter(|c| c.version.is_none())
            .map(|c| c.size)
            .sum())
    }

    fn snapshot_count(&self) -> Result<u64> {
        let state = self.state.lock();
        Ok(state
            .tables
            .compounds
            .values()
            .filter(|c| c.version.is_some())
            .count() as u64)
    }

    fn unique_compound_count(&self) -> Result<u64> {
        let state = self.state.lock();
        let hashes: HashSet<CompoundHash> = state
            .tables
            .compounds
            .values()
            .filter(|c| c.version.is_none())
            .map(|c| c.hash)
            .collect();
        Ok(hashes.len() as u64)
    }

    fn unique_compound_size(&self) -> Result<u64> {
        let state = self.state.lock();
        let mut seen = HashSet::new();
        Ok(state
            .tables
            .compounds
            .values()
            .filter(|c| c.version.is_none())
            .filter(|c| seen.insert(c.hash))
            .map(|c| c.size)
            .sum())
    }

    fn total_fragment_count(&self) -> Result<u64> {
        let state = self.state.lock();
        Ok(state.tables.fragments.len() as u64)
    }

    fn total_fragment_size(&self) -> Result<u64> {
        let state = self.state.lock();
        Ok(state.tables.fragments.values().map(|f| f.size).sum())
    }

    fn total_resource_count(&self) -> Result<u64> {
        let state = self.state.lock();
        Ok(state.tables.resources.len() as u64)
    }

    fn total_resource_size(&self) -> Result<u64> {
        let state = self.state.lock();
        Ok(state.tables.resources.values().map(|r| r.size).sum())
    }

    fn duplicate_fragment_count(&self) -> Result<u64> {
        let state = self.state.lock();
        Ok(state
            .tables
            .fragment_refcounts()
            .values()
            .map(|count| count.saturating_sub(1))
            .sum())
    }

    fn saved_bytes_by_duplicate_fragments(&self) -> Result<u64> {
        let state = self.state.lock();
        let tables = &state.tables;
        Ok(tables
            .fragment_refcounts()
            .iter()
            .filter_map(|(fragment_id, count)| {
                tables
                    .fragments
                    .get(fragment_id)
                    .map(|f| f.size * count.saturating_sub(1))
            })
            .sum())
    }

    fn multiple_used_compound_count(&self, kind: Option<CompoundKind>) -> Result<u64> {
        let state = self.state.lock();
        let mut counts: HashMap<CompoundHash, u64> = HashMap::new();
        for compound in state
            .tables
            .compounds
            .values()
            .filter(|c| c.version.is_none())
            .filter(|c| kind.map_or(true, |k| c.kind == k))
        {
            *counts.entry(compound.hash).or_insert(0) += 1;
        }
        Ok(counts.values().map(|count| count.saturating_sub(1)).sum())
    }

    fn saved_bytes_by_multiple_used_compounds(&self) -> Result<u64> {
        let state = self.state.lock();
        let mut sizes: HashMap<CompoundHash, (u64, u64)> = HashMap::new();
        for compound in state
            .tables
            .compounds
            .values()
            .filter(|c| c.version.is_none())
        {
            let entry = sizes.entry(compound.hash).or_insert((0, compound.size));
            entry.0 += 1;
        }
        Ok(sizes
            .values()
            .map(|(count, size)| size * count.saturating_sub(1))
            .sum())
    }
}
