//! Index Fetcher.
//!
//! Downloads a remote "Packages" index for one source descriptor + subrepo,
//! transparently decompresses it, and streams it through the control-file
//! parser into normalized [`PackageRecord`]s. Any network, decompression,
//! or parse failure aborts the whole descriptor's load — a partially-read
//! index is never accepted.

pub mod control;

use std::collections::HashMap;

use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, XzDecoder};
use futures::TryStreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::io::StreamReader;

use crate::catalog::{PackageRecord, PackageStatus};
use crate::config::{Compression, SourceDescriptor};
use crate::version;

use control::ControlReader;

/// Installer pseudo-section; its entries are not real packages.
const INSTALLER_SECTION: &str = "debian-installer";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed stanza line: {0:?}")]
    MalformedStanza(String),

    #[error("Invalid version {version:?} for package {package}: {reason}")]
    Version {
        package: String,
        version: String,
        reason: String,
    },
}

/// Download and parse one subrepo's index into name → record.
///
/// Records come out with status [`PackageStatus::Uptodate`] and no build
/// history; the reconciler assigns real statuses later. When the same name
/// appears twice in one document, the higher-versioned stanza wins.
pub async fn fetch_index(
    client: &Client,
    descriptor: &SourceDescriptor,
    subrepo: &str,
) -> Result<HashMap<String, PackageRecord>, FetchError> {
    let url = descriptor.index_url(subrepo);
    tracing::debug!(source = %descriptor.name, %url, "fetching package index");

    let response = client
        .get(&url)
        .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
        .send()
        .await?
        .error_for_status()?;

    let stream = response.bytes_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);
    let decoded: Box<dyn AsyncRead + Send + Unpin> = match descriptor.compression {
        Compression::Raw => Box::new(reader),
        Compression::Gz => Box::new(GzipDecoder::new(reader)),
        Compression::Bz2 => Box::new(BzDecoder::new(reader)),
        Compression::Xz => Box::new(XzDecoder::new(reader)),
    };

    parse_index(descriptor, BufReader::new(decoded)).await
}

async fn parse_index<R: tokio::io::AsyncBufRead + Unpin>(
    descriptor: &SourceDescriptor,
    reader: R,
) -> Result<HashMap<String, PackageRecord>, FetchError> {
    let mut packages: HashMap<String, PackageRecord> = HashMap::new();
    let mut control = ControlReader::new(reader);

    while let Some(stanza) = control.next_stanza().await? {
        if stanza.field("Section") == INSTALLER_SECTION {
            continue;
        }

        let name = stanza.field("Package");
        if name.is_empty() {
            continue;
        }

        let use_whitelist = descriptor.use_whitelist && !descriptor.whitelist.is_empty();
        if use_whitelist && !name_contains(name, &descriptor.whitelist) {
            continue;
        }
        if name_contains(name, &descriptor.blacklist) {
            continue;
        }

        let raw_version = stanza.field("Version");
        let parsed = version::parse(raw_version).map_err(|e| FetchError::Version {
            package: name.to_string(),
            version: raw_version.to_string(),
            reason: e.to_string(),
        })?;

        // Duplicate names within one document keep the higher version
        // (later stanza wins a tie).
        if let Some(existing) = packages.get(name) {
            if version::compare(raw_version, &existing.version) == std::cmp::Ordering::Less {
                continue;
            }
        }

        packages.insert(
            name.to_string(),
            PackageRecord {
                name: name.to_string(),
                version: parsed.to_string(),
                source: stanza.field("Source").to_string(),
                architecture: stanza.field("Architecture").to_string(),
                description: stanza.field("Description").to_string(),
                status: PackageStatus::Uptodate,
                ..Default::default()
            },
        );
    }

    Ok(packages)
}

fn name_contains(name: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| name.contains(n.as_str()))
}
