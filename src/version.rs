//! Debian version handling.
//!
//! The comparison algorithm itself is delegated to the `debversion` crate;
//! this module only adds the helpers the fetcher and reconciler need on top
//! of it: lenient string comparison and the `+bN` binary-rebuild strip.

use std::cmp::Ordering;

pub use debversion::Version;

/// Parse a raw version string into a [`Version`].
pub fn parse(raw: &str) -> Result<Version, debversion::ParseError> {
    raw.parse()
}

/// Compare two version strings under Debian ordering.
///
/// Falls back to byte comparison when either side fails to parse, so a
/// malformed stored version never panics a reconciliation pass.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (parse(a), parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

/// Strip a trailing `+bN` binary-rebuild suffix.
///
/// Upstream indices publish binNMU versions like `1.2-3+b2`; the farm builds
/// from source, so the suffix is ignored when deciding staleness.
pub fn strip_binary_rebuild(raw: &str) -> &str {
    match raw.split_once("+b") {
        Some((base, _)) => base,
        None => raw,
    }
}
