//! Build queue construction.
//!
//! A build job is the atomic unit handed to one container: every binary
//! package sharing a source package, built together, because one source
//! build emits all of them at once.

use serde::Serialize;

use crate::catalog::{PackageRecord, PackageStatus};

/// An ordered group of records sharing one source key.
#[derive(Debug, Clone, Serialize)]
pub struct BuildJob {
    /// Source-package grouping key.
    pub source: String,
    pub records: Vec<PackageRecord>,
}

impl BuildJob {
    /// The version this job will build: the first record's pending version,
    /// or its current version when nothing newer is pending.
    pub fn target_version(&self) -> &str {
        let first = &self.records[0];
        if first.pending_version.is_empty() {
            &first.version
        } else {
            &first.pending_version
        }
    }
}

/// Group every Missing/Stale record by source key.
///
/// The grouping is driven by the (sorted) name set rather than insertion
/// order, so re-running on an unchanged catalog yields identical jobs.
pub fn group_buildable<'a, I>(records: I) -> Vec<BuildJob>
where
    I: IntoIterator<Item = &'a PackageRecord>,
{
    let mut groups: std::collections::BTreeMap<String, Vec<PackageRecord>> =
        std::collections::BTreeMap::new();
    for record in records {
        if !matches!(record.status, PackageStatus::Missing | PackageStatus::Stale) {
            continue;
        }
        groups
            .entry(record.source_key().to_string())
            .or_default()
            .push(record.clone());
    }
    groups
        .into_iter()
        .map(|(source, records)| BuildJob { source, records })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, source: &str, status: PackageStatus) -> PackageRecord {
        PackageRecord {
            name: name.to_string(),
            source: source.to_string(),
            version: "1.0-1".to_string(),
            status,
            ..Default::default()
        }
    }

    #[test]
    fn test_groups_by_source_key() {
        let records = vec![
            record("libssl3", "openssl", PackageStatus::Stale),
            record("openssl", "openssl", PackageStatus::Stale),
            record("jq", "", PackageStatus::Missing),
            record("bash", "bash", PackageStatus::Uptodate),
        ];
        let jobs = group_buildable(&records);

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].source, "jq");
        assert_eq!(jobs[1].source, "openssl");
        assert_eq!(jobs[1].records.len(), 2);
    }

    #[test]
    fn test_every_buildable_record_in_exactly_one_job() {
        let records = vec![
            record("a", "src1", PackageStatus::Missing),
            record("b", "src1", PackageStatus::Stale),
            record("c", "", PackageStatus::Stale),
        ];
        let jobs = group_buildable(&records);
        let mut seen: Vec<&str> = jobs
            .iter()
            .flat_map(|j| j.records.iter().map(|r| r.name.as_str()))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_deterministic_on_reordered_input() {
        let mut records = vec![
            record("a", "src1", PackageStatus::Missing),
            record("b", "src2", PackageStatus::Stale),
            record("c", "src1", PackageStatus::Stale),
        ];
        let first = group_buildable(&records);
        records.reverse();
        let second = group_buildable(&records);

        let keys = |jobs: &[BuildJob]| -> Vec<String> {
            jobs.iter().map(|j| j.source.clone()).collect()
        };
        assert_eq!(keys(&first), keys(&second));
    }

    #[test]
    fn test_target_version_prefers_pending() {
        let mut r = record("jq", "", PackageStatus::Stale);
        r.pending_version = "1.1-1".to_string();
        let jobs = group_buildable(std::iter::once(&r));
        assert_eq!(jobs[0].target_version(), "1.1-1");

        let r2 = record("jq", "", PackageStatus::Missing);
        let jobs2 = group_buildable(std::iter::once(&r2));
        assert_eq!(jobs2[0].target_version(), "1.0-1");
    }
}
