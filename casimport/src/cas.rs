//! Naming rules of the content-addressed layout

use anyhow::{Result, anyhow};

/// Content hash of a dynamic large object, cached on the source manifest.
pub const LO_ETAG: &str = "x-object-meta-lo-etag";
/// `container/prefix` pointer of a dynamic large object.
pub const DLO_HEADER: &str = "x-object-manifest";
/// md5 of zero bytes; every DLO manifest lists with it, so it never proves a duplicate.
pub const EMPTY_HASH: &str = "d41d8cd98f00b204e9800998ecf8427e";
pub const MIME_FILE: &str = "application/octet-stream";
pub const MIME_LARGE: &str = "application/large-file";

/// `hash[0..2]/hash[2..3]/hash`, with both prefixes cut short for hashes under 3 characters.
pub fn cas_path(hash: &str) -> Result<String> {
    if hash.is_empty() || !hash.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(anyhow!("invalid content hash {:?}", hash));
    }
    // hex digits only, so byte offsets are char boundaries
    let first = &hash[..hash.len().min(2)];
    let second = hash.get(2..3).unwrap_or_default();
    Ok(format!("{}/{}/{}", first, second, hash))
}

/// Last `/`-separated component of an object name.
pub fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Etag header value without surrounding quotes.
pub fn unquote(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}
