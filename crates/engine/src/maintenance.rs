//! Maintenance operations: garbage collection, space reclamation, resource
//! combining, defragmentation, consistency checks and repair.

use crate::cache::PackingPolicy;
use crate::config::GcOptions;
use crate::engine::Engine;
use std::collections::HashSet;
use stowage_core::{
    Error, Fragment, FragmentHash, FragmentId, Resource, ResourceId, ResourceName, Result,
};
use stowage_meta::CompoundFilter;
use stowage_concurrency::{AccessGuard, MassReserver};
use std::sync::Arc;

/// Outcome of [`Engine::repair_fragmentless_compounds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepairReport {
    /// Compounds whose sequence mapping was restored from a same-hash donor.
    pub repaired: usize,
    /// Compounds with no donor; their content is gone.
    pub unrepairable: usize,
}

impl Engine {
    /// Reclaim unreferenced metadata and backend state.
    ///
    /// - unless `keep_fragments`: delete fragments referenced by no compound
    ///   (exclusively locked and deleted in chunks);
    /// - unless `keep_resources`: delete resources referenced by no fragment
    ///   from the backend, then from metadata;
    /// - unless `keep_unreferenced_resources`: delete backend blobs metadata
    ///   does not know at all.
    pub fn collect_garbage(&self, options: &GcOptions) -> Result<()> {
        let blocking = self.config.blocking;
        let timeout = self.config.lock_timeout;

        if !options.keep_fragments {
            let scope = stowage_meta::scope(&self.shared.meta);
            let unreferenced = self.shared.meta.unreferenced_fragments()?;
            tracing::debug!(count = unreferenced.len(), "collecting unreferenced fragments");
            for chunk in unreferenced.chunks(self.config.gc_chunk_size) {
                let hashes: Vec<FragmentHash> = chunk.iter().map(|f| f.hash).collect();
                let mut reserver = MassReserver::exclusive(
                    Arc::clone(&self.shared.fragment_locks),
                    blocking,
                    timeout,
                );
                reserver.reserve_all(&hashes)?;
                self.shared.meta.delete_fragments(chunk)?;
            }
            scope.commit()?;
        }

        let scope = stowage_meta::scope(&self.shared.meta);
        let mut targets: Vec<(ResourceName, Option<ResourceId>)> = Vec::new();
        if !options.keep_resources {
            for resource in self.shared.meta.unreferenced_resources()? {
                targets.push((resource.name, Some(resource.id)));
            }
        }
        if !options.keep_unreferenced_resources {
            let known: HashSet<ResourceName> =
                self.shared.meta.all_resource_names()?.into_iter().collect();
            for name in self.shared.storage.list()? {
                if !known.contains(&name) {
                    targets.push((name, None));
                }
            }
        }
        if !targets.is_empty() {
            tracing::debug!(count = targets.len(), "collecting unreferenced resources");
            let names: Vec<ResourceName> = targets.iter().map(|(name, _)| name.clone()).collect();
            let mut reserver = MassReserver::exclusive(
                Arc::clone(&self.shared.resource_locks),
                blocking,
                timeout,
            );
            reserver.reserve_all(&names)?;
            for (name, id) in targets {
                self.shared.storage.delete(&name)?;
                if let Some(id) = id {
                    self.shared.meta.delete_resource(id)?;
                }
                reserver.release_one(&name);
            }
        }
        scope.commit()
    }

    /// Rewrite every resource whose hole share (payload bytes no mapped
    /// fragment covers) is at least `unused_pct`: download it, rebuild a
    /// compact payload holding only mapped fragments in their original
    /// order, upload that as a new resource and re-point the mappings. The
    /// old resource is left for garbage collection (its blob may be deleted
    /// immediately under `auto_delete_resource` semantics of a later rewrite).
    pub fn optimize_resource_space(&self, unused_pct: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&unused_pct) {
            return Err(Error::unsupported(
                "unused percentage must be within [0, 1]",
            ));
        }
        let blocking = self.config.blocking;
        let timeout = self.config.lock_timeout;

        let scope = stowage_meta::scope(&self.shared.meta);
        let candidates: Vec<(Resource, u64)> = self
            .shared
            .meta
            .resources_with_referenced_fragment_size()?
            .into_iter()
            .filter(|(resource, referenced)| {
                resource.payload_size > 0 && {
                    let hole = resource.payload_size.saturating_sub(*referenced);
                    hole as f64 / resource.payload_size as f64 >= unused_pct
                }
            })
            .collect();
        for (resource, referenced) in candidates {
            let _resource_guard = AccessGuard::exclusive(
                Arc::clone(&self.shared.resource_locks),
                resource.name.clone(),
                blocking,
                timeout,
            )?;
            let rows = self
                .shared
                .meta
                .fragments_with_offset_on_resource(resource.id)?;
            if rows.is_empty() {
                // Nothing mapped at all; plain garbage collection handles it.
                continue;
            }
            let hashes: Vec<FragmentHash> = rows.iter().map(|(f, _)| f.hash).collect();
            let mut fragment_reserver = MassReserver::exclusive(
                Arc::clone(&self.shared.fragment_locks),
                blocking,
                timeout,
            );
            fragment_reserver.reserve_all(&hashes)?;

            tracing::debug!(
                resource = %resource.name,
                hole = resource.payload_size.saturating_sub(referenced),
                "compacting resource"
            );
            let payload = self.shared.cache.load_resource(&resource)?;
            let mut compact = Vec::with_capacity(referenced as usize);
            let mut mapping: Vec<(FragmentId, u64)> = Vec::with_capacity(rows.len());
            let mut offset = 0u64;
            for (fragment, old_offset) in &rows {
                let start = *old_offset as usize;
                let end = start + fragment.size as usize;
                if end > payload.len() {
                    return Err(Error::resource_manipulated(format!(
                        "fragment offset outside payload of resource {}",
                        resource.name
                    )));
                }
                compact.extend_from_slice(&payload[start..end]);
                let id = fragment
                    .id
                    .ok_or_else(|| Error::internal("metadata returned a fragment without id"))?;
                mapping.push((id, offset));
                offset += fragment.size;
            }
            let new_resource = self.shared.cache.upload_payload(&compact, rows.len())?;
            self.shared
                .meta
                .map_fragments_to_resource(new_resource.id, &mapping)?;
        }
        scope.commit()
    }

    /// Combine under-filled resources: every resource whose payload is below
    /// `fill_pct` of the resource size has its fragments re-added to the
    /// cache under the FILL_ALWAYS policy, which appends them into other
    /// resources. Per-resource fragments are fed largest-first and
    /// smallest-first on alternating iterations so mixed sizes pack tighter.
    /// The previous policy and reuse blacklist are restored on completion.
    pub fn optimize_resource_usage(&self, fill_pct: f64) -> Result<()> {
        let blocking = self.config.blocking;
        let timeout = self.config.lock_timeout;
        let resource_size = self.shared.cache.resource_size();

        let original_policy = self.shared.cache.policy();
        let original_blacklist = self.shared.cache.swap_reuse_blacklist(HashSet::new());

        let scope = stowage_meta::scope(&self.shared.meta);
        let result = (|| {
            self.shared.cache.flush(true)?;
            self.shared.cache.set_policy(PackingPolicy::FillAlways);
            self.shared.cache.enter_scope();
            let inner = (|| -> Result<()> {
                let resources: Vec<Resource> = self
                    .shared
                    .meta
                    .all_resources_size_sorted()?
                    .into_iter()
                    .filter(|r| (r.payload_size as f64 / resource_size as f64) < fill_pct)
                    .collect();
                self.shared
                    .cache
                    .swap_reuse_blacklist(resources.iter().map(|r| r.hash).collect());

                let mut sort_biggest_first = true;
                for resource in &resources {
                    let _resource_guard = AccessGuard::exclusive(
                        Arc::clone(&self.shared.resource_locks),
                        resource.name.clone(),
                        blocking,
                        timeout,
                    )?;
                    let mut fragments: Vec<Fragment> = self
                        .shared
                        .meta
                        .fragments_with_offset_on_resource(resource.id)?
                        .into_iter()
                        .map(|(f, _)| f)
                        .collect();
                    fragments.sort_by_key(|f| f.size);
                    if sort_biggest_first {
                        fragments.reverse();
                    }
                    sort_biggest_first = !sort_biggest_first;

                    let hashes: Vec<FragmentHash> = fragments.iter().map(|f| f.hash).collect();
                    let mut fragment_reserver = MassReserver::exclusive(
                        Arc::clone(&self.shared.fragment_locks),
                        blocking,
                        timeout,
                    );
                    fragment_reserver.reserve_all(&hashes)?;
                    for fragment in fragments {
                        let data = self.shared.cache.load_fragment(&fragment)?;
                        self.shared.cache.add_fragment(data, fragment, true)?;
                    }
                }
                Ok(())
            })();
            let exited = self.shared.cache.exit_scope(inner.is_ok());
            inner.and(exited)
        })();

        self.shared.cache.set_policy(original_policy);
        self.shared.cache.swap_reuse_blacklist(original_blacklist);
        match result {
            Ok(()) => scope.commit(),
            Err(e) => Err(e),
        }
    }

    /// Re-pack every fragment in read order: fragments are re-added to the
    /// cache sorted by the first compound using them and that compound's
    /// sequence, so fragments needed consecutively tend to land in the same
    /// resource. Currently unreferenced fragments follow at the end. Runs
    /// under the PASS policy; the previous policy is restored on completion.
    pub fn defragment_resources(&self) -> Result<()> {
        let original_policy = self.shared.cache.policy();
        self.shared.cache.flush(true)?;
        self.shared.cache.set_policy(PackingPolicy::Pass);

        let result = (|| {
            let scope = stowage_meta::scope(&self.shared.meta);
            let ordered = self.shared.meta.all_fragments_sorted_by_compound_usage()?;
            let unreferenced = self.shared.meta.unreferenced_fragments()?;
            tracing::debug!(
                referenced = ordered.len(),
                unreferenced = unreferenced.len(),
                "re-packing fragments in compound order"
            );
            for fragment in ordered.into_iter().chain(unreferenced) {
                let data = self.shared.cache.load_fragment(&fragment)?;
                self.shared.cache.add_fragment(data, fragment, true)?;
            }
            self.shared.cache.flush(true)?;
            scope.commit()
        })();

        self.shared.cache.set_policy(original_policy);
        result
    }

    // ------------------------------------------------------------------
    // Consistency checks
    // ------------------------------------------------------------------

    /// Every resource name metadata knows must exist at the backend.
    pub fn check_storage_consistency(&self) -> Result<()> {
        let scope = stowage_meta::scope(&self.shared.meta);
        let meta_names: HashSet<ResourceName> =
            self.shared.meta.all_resource_names()?.into_iter().collect();
        let backend_names: HashSet<ResourceName> =
            self.shared.storage.list()?.into_iter().collect();
        scope.commit()?;
        let missing: Vec<&ResourceName> = meta_names.difference(&backend_names).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::resource_missing(format!(
                "storage is missing {} resources referenced by metadata",
                missing.len()
            )))
        }
    }

    /// No fragment row may lack a fragment-resource mapping.
    pub fn check_meta_resourceless_fragments(&self) -> Result<()> {
        let unlinked = self.shared.meta.fragments_without_resource_links()?;
        if unlinked.is_empty() {
            Ok(())
        } else {
            Err(Error::fragment_missing(format!(
                "{} fragments have no resource mapping",
                unlinked.len()
            )))
        }
    }

    /// No non-empty compound may lack sequence-mapping rows.
    pub fn check_meta_fragmentless_compounds(&self) -> Result<()> {
        let unlinked = self.shared.meta.compounds_without_fragment_links()?;
        if unlinked.is_empty() {
            Ok(())
        } else {
            Err(Error::fragment_missing(format!(
                "{} non-empty compounds have no fragment mapping",
                unlinked.len()
            )))
        }
    }

    /// Download every resource and fully verify it (stored length, hash,
    /// decapsulated payload length).
    pub fn check_storage_content(&self) -> Result<()> {
        let scope = stowage_meta::scope(&self.shared.meta);
        let resources = self.shared.meta.all_resources()?;
        scope.commit()?;
        for resource in resources {
            self.shared.cache.load_resource(&resource)?;
        }
        Ok(())
    }

    /// Stream-load every live compound, verifying every fragment and the
    /// stream hash. The loaded bytes are discarded.
    pub fn check_all_compounds(&self) -> Result<()> {
        let compounds = self.shared.meta.list_compounds(&CompoundFilter::default())?;
        for compound in compounds {
            let reader = self.load_version(compound.name.clone(), compound.version)?;
            for chunk in reader {
                chunk?;
            }
        }
        Ok(())
    }

    /// Restore the sequence mapping of fragmentless compounds from another
    /// compound with the same content hash that still has its mapping.
    pub fn repair_fragmentless_compounds(&self) -> Result<RepairReport> {
        let scope = stowage_meta::scope(&self.shared.meta);
        let broken = self.shared.meta.compounds_without_fragment_links()?;
        let mut report = RepairReport::default();
        for compound in broken {
            match self
                .shared
                .meta
                .get_compound_by_hash_with_fragment_links(&compound.hash)
            {
                Ok(donor) => {
                    let donor_id = donor
                        .id
                        .ok_or_else(|| Error::internal("metadata returned a compound without id"))?;
                    let compound_id = compound
                        .id
                        .ok_or_else(|| Error::internal("metadata returned a compound without id"))?;
                    let sequence = self.shared.meta.sequence_fragments_for_compound(donor_id)?;
                    let mut rows = Vec::with_capacity(sequence.len());
                    for (index, fragment) in sequence {
                        let id = fragment.id.ok_or_else(|| {
                            Error::internal("metadata returned a fragment without id")
                        })?;
                        rows.push((id, index));
                    }
                    self.shared
                        .meta
                        .set_fragment_mappings_for_compound(compound_id, &rows)?;
                    report.repaired += 1;
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!(compound = %compound.name, "no donor mapping found");
                    report.unrepairable += 1;
                }
                Err(e) => return Err(e),
            }
        }
        scope.commit()?;
        Ok(report)
    }
}
