//! Version Reconciler.
//!
//! Merges the "internal" (already built) and "external" (upstream truth)
//! index unions, classifies every package as up to date, stale, or missing,
//! and carries build history forward from the previous catalog snapshot so
//! a reconciliation pass never wipes out attempt counters.
//!
//! Index downloads run concurrently; determinism comes from applying the
//! fetched maps in descriptor priority order, not from fetch completion
//! order.

use std::cmp::Ordering;
use std::collections::HashMap;

use reqwest::Client;

use crate::catalog::{PackageRecord, PackageStatus};
use crate::config::SourceDescriptor;
use crate::index::{self, FetchError};
use crate::version;

/// Which union a set of descriptors belongs to. The two kinds merge
/// differently on name collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Locally built indices: lower priority number (loaded last) or higher
    /// version wins a collision.
    Internal,
    /// Upstream indices: applied in ascending priority order,
    /// last-applied-wins.
    External,
}

/// Fetch every (descriptor, subrepo) index of one kind and merge them.
pub async fn load_sources(
    client: &Client,
    descriptors: &[SourceDescriptor],
    kind: SourceKind,
) -> Result<HashMap<String, PackageRecord>, FetchError> {
    let mut ordered: Vec<&SourceDescriptor> = descriptors.iter().collect();
    match kind {
        // Higher numeric priority loads first so that lower numbers,
        // applied later, win the version-tie rule below.
        SourceKind::Internal => ordered.sort_by_key(|d| std::cmp::Reverse(d.priority)),
        SourceKind::External => ordered.sort_by_key(|d| d.priority),
    }

    let fetches = ordered
        .iter()
        .flat_map(|d| d.subrepos.iter().map(move |s| index::fetch_index(client, d, s)));
    let batches = futures::future::try_join_all(fetches).await?;

    Ok(merge_batches(kind, batches))
}

/// Apply index maps in load order, resolving name collisions per kind.
fn merge_batches(
    kind: SourceKind,
    batches: Vec<HashMap<String, PackageRecord>>,
) -> HashMap<String, PackageRecord> {
    let mut merged: HashMap<String, PackageRecord> = HashMap::new();
    for batch in batches {
        for (name, record) in batch {
            match kind {
                SourceKind::External => {
                    merged.insert(name, record);
                }
                SourceKind::Internal => {
                    let keep_existing = merged.get(&name).is_some_and(|existing| {
                        version::compare(&record.version, &existing.version) == Ordering::Less
                    });
                    if !keep_existing {
                        merged.insert(name, record);
                    }
                }
            }
        }
    }
    merged
}

/// Mark internal records stale where upstream carries a newer version.
///
/// The external version is stripped of any `+bN` binary-rebuild suffix
/// before comparison. Records already Missing are left alone.
pub fn apply_stale_pass(
    internal: &mut HashMap<String, PackageRecord>,
    external: &HashMap<String, PackageRecord>,
) {
    for (name, ext) in external {
        let Some(record) = internal.get_mut(name) else {
            continue;
        };
        if record.status == PackageStatus::Missing {
            continue;
        }
        let stripped = version::strip_binary_rebuild(&ext.version);
        if version::compare(&record.version, stripped) == Ordering::Less {
            record.status = PackageStatus::Stale;
            record.pending_version = stripped.to_string();
        }
    }
}

/// Insert a Missing record for every name seen only upstream.
pub fn apply_missing_pass(
    internal: &mut HashMap<String, PackageRecord>,
    external: &HashMap<String, PackageRecord>,
) {
    for (name, ext) in external {
        if internal.contains_key(name) {
            continue;
        }
        let mut record = ext.clone();
        record.status = PackageStatus::Missing;
        internal.insert(name.clone(), record);
    }
}

/// Merge the freshly computed set against the previous catalog snapshot.
///
/// Build-history fields (attempt counters, last build outcome) live only in
/// the previous records; this pass adopts the new status/version facts
/// without losing them. Names absent from `fresh` drop out: the catalog is
/// replaced wholesale.
pub fn carry_forward(
    previous: &HashMap<String, PackageRecord>,
    fresh: Vec<PackageRecord>,
) -> Vec<PackageRecord> {
    use PackageStatus::{Built, Error, Missing, Stale, Uptodate};

    let mut out = Vec::with_capacity(fresh.len());
    for new in fresh {
        let Some(prev) = previous.get(&new.name) else {
            let mut record = new;
            record.last_build_status = None;
            out.push(record);
            continue;
        };

        let mut record = prev.clone();
        if record.status == Stale && new.status != Stale {
            record.status = new.status;
            record.version = new.version.clone();
            record.pending_version.clear();
        }
        if record.status == Missing && new.status != Missing {
            record.pending_version = new.pending_version.clone();
            record.version = new.version.clone();
            record.status = new.status;
        }
        if record.status == Missing && new.status == Missing {
            record.pending_version = new.pending_version.clone();
            record.version = new.version.clone();
        }
        if record.status == Stale && new.status == Missing {
            record.pending_version = new.pending_version.clone();
            record.version = new.version.clone();
            record.status = new.status;
        }
        if matches!(new.status, Stale | Missing)
            && matches!(record.status, Uptodate | Stale | Built | Error)
        {
            record.pending_version = new.pending_version.clone();
            record.status = new.status;
        }
        out.push(record);
    }
    out
}

/// One full reconciliation: load both unions, run the three passes, return
/// the next catalog sorted by name.
pub async fn reconcile(
    client: &Client,
    internal_sources: &[SourceDescriptor],
    external_sources: &[SourceDescriptor],
    previous: &[PackageRecord],
) -> Result<Vec<PackageRecord>, FetchError> {
    let mut internal = load_sources(client, internal_sources, SourceKind::Internal).await?;
    let external = load_sources(client, external_sources, SourceKind::External).await?;

    apply_stale_pass(&mut internal, &external);
    apply_missing_pass(&mut internal, &external);

    let mut fresh: Vec<PackageRecord> = internal.into_values().collect();
    fresh.sort_by(|a, b| a.name.cmp(&b.name));

    let prev_map: HashMap<String, PackageRecord> = previous
        .iter()
        .map(|r| (r.name.clone(), r.clone()))
        .collect();
    Ok(carry_forward(&prev_map, fresh))
}
