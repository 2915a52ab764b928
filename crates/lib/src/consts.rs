//! Crate-wide constants.

/// Length of the truncated hex prefix used for build keys.
///
/// 80 bits of SHA-256 output keeps keys short enough for store paths while
/// retaining sufficient collision resistance for a single project's graph.
pub const BUILD_KEY_PREFIX_LEN: usize = 20;

/// Name of the blob file inside a directory cache entry.
pub const CACHE_BLOB_FILE: &str = "artifact.bin";

/// Name of the metadata sidecar inside a directory cache entry.
pub const CACHE_META_FILE: &str = "meta.json";
