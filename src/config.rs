//! Farm configuration, loaded from a TOML file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Compression applied to a remote package index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Raw,
    #[default]
    Gz,
    Bz2,
    Xz,
}

impl Compression {
    /// File extension appended to the index path, if any.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Self::Raw => None,
            Self::Gz => Some("gz"),
            Self::Bz2 => Some("bz2"),
            Self::Xz => Some("xz"),
        }
    }
}

/// One remote package index to load.
///
/// Internal descriptors describe what the farm has already built; external
/// descriptors describe upstream truth. `priority` breaks ties when two
/// descriptors claim the same package name — lower number wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    /// Base URL; the subrepo and package path are appended to it.
    pub url: String,
    /// Repo components to union (e.g. "main", "contrib").
    pub subrepos: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub use_whitelist: bool,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Index file path fragment below the subrepo (e.g.
    /// "binary-amd64/Packages").
    pub package_path: String,
    #[serde(default)]
    pub compression: Compression,
}

impl SourceDescriptor {
    /// Compose the full index URL for one subrepo.
    pub fn index_url(&self, subrepo: &str) -> String {
        let mut url = format!("{}{}/{}", self.url, subrepo, self.package_path);
        if let Some(ext) = self.compression.extension() {
            url.push('.');
            url.push_str(ext);
        }
        url
    }
}

/// Build-command variants run inside a container against a fetched `.dsc`.
///
/// The optimized (LTO) variant is the default; the plain variant serves the
/// LTO blocklist and the retry heuristic; the reuse variant re-fetches a
/// previously built artifact set instead of rebuilding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildCommands {
    pub lto: String,
    pub plain: String,
    pub reuse: String,
}

impl Default for BuildCommands {
    fn default() -> Self {
        Self {
            lto: "pbuilder-lto-build".to_string(),
            plain: "pbuilder-build".to_string(),
            reuse: "find ./ -type f -name '*.dsc' -exec dget --all {} \\;".to_string(),
        }
    }
}

fn default_containers() -> usize {
    3
}

fn default_container_workdir() -> String {
    "/data".to_string()
}

fn default_watchdog_interval_secs() -> u64 {
    600
}

fn default_watchdog_checks() -> u32 {
    6
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Catalog store location (JSON document).
    pub store_path: PathBuf,
    /// Host directory bind-mounted into every build container.
    pub staging_dir: PathBuf,
    /// Where finished .deb files land, world-readable.
    pub deb_output_dir: PathBuf,
    /// Where build logs land, namespaced by package name.
    pub build_log_dir: PathBuf,

    /// Upstream base image pulled during an image refresh.
    pub base_image: String,
    /// Locally committed image the build containers run.
    pub build_image: String,
    /// Container name prefix; workers get `<prefix>-0 .. <prefix>-N`.
    pub container_prefix: String,
    /// Mount point of `staging_dir` inside the container.
    #[serde(default = "default_container_workdir")]
    pub container_workdir: String,
    /// Build container pool size.
    #[serde(default = "default_containers")]
    pub containers: usize,
    /// Shell command run once inside a fresh base container before it is
    /// committed as `build_image`.
    pub image_setup_command: String,

    /// Seconds between watchdog artifact checks.
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// Failed checks tolerated before a build is declared timed out.
    #[serde(default = "default_watchdog_checks")]
    pub watchdog_checks: u32,

    /// Packages that must never be built with LTO.
    #[serde(default)]
    pub lto_blocklist: Vec<String>,

    /// Build-command variants (see [`BuildCommands`]).
    #[serde(default)]
    pub build_commands: BuildCommands,

    /// Indices describing what the farm has already built.
    #[serde(default)]
    pub internal_sources: Vec<SourceDescriptor>,
    /// Indices describing upstream truth.
    #[serde(default)]
    pub external_sources: Vec<SourceDescriptor>,
}

impl Config {
    /// Load and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
store_path = "/var/lib/debfarm/catalog.json"
staging_dir = "/var/lib/debfarm/staging"
deb_output_dir = "/srv/www/debs/"
build_log_dir = "/srv/www/buildlogs/"
base_image = "ghcr.io/example/base-container:latest"
build_image = "farm-bldr:latest"
container_prefix = "farm-bldr"
image_setup_command = "apt-get update -y && apt-get upgrade -y"
lto_blocklist = ["glibc"]

[[internal_sources]]
name = "local"
url = "https://repo.example.org/pool/"
subrepos = ["main"]
priority = 1
package_path = "binary-amd64/Packages"
compression = "xz"

[[external_sources]]
name = "upstream"
url = "https://deb.example.org/dists/stable/"
subrepos = ["main", "contrib"]
priority = 2
use_whitelist = true
whitelist = ["lib"]
blacklist = ["dbg"]
package_path = "binary-amd64/Packages"
compression = "gz"
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.containers, 3);
        assert_eq!(config.watchdog_interval_secs, 600);
        assert_eq!(config.watchdog_checks, 6);
        assert_eq!(config.container_workdir, "/data");
        assert_eq!(config.internal_sources.len(), 1);
        assert_eq!(config.external_sources[0].subrepos.len(), 2);
        assert!(config.external_sources[0].use_whitelist);
    }

    #[test]
    fn test_index_url_composition() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let internal = &config.internal_sources[0];
        assert_eq!(
            internal.index_url("main"),
            "https://repo.example.org/pool/main/binary-amd64/Packages.xz"
        );

        let mut raw = internal.clone();
        raw.compression = Compression::Raw;
        assert_eq!(
            raw.index_url("main"),
            "https://repo.example.org/pool/main/binary-amd64/Packages"
        );
    }
}
