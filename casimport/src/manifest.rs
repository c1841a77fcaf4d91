//! Static large object manifests rebuilt from dynamic large object segments

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::cas;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSegment {
    pub path: String,
    pub size_bytes: u64,
    pub etag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub segments: Vec<ManifestSegment>,
}

impl Manifest {
    /// One segment per listed entry, in listing order, addressed by content in `dst_container`.
    pub fn from_segments(dst_container: &str, entries: &[swift::ObjectEntry]) -> Result<Self> {
        let segments = entries
            .iter()
            .map(|entry| {
                let hash = cas::unquote(&entry.hash);
                Ok(ManifestSegment {
                    path: format!("{}/{}", dst_container, cas::cas_path(hash)?),
                    size_bytes: entry.bytes,
                    etag: hash.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { segments })
    }

    /// md5 of the concatenated segment etags, as the object store computes it.
    pub fn etag(&self) -> String {
        let mut context = md5::Context::new();
        for segment in &self.segments {
            context.consume(segment.etag.as_bytes());
        }
        format!("{:x}", context.compute())
    }

    pub fn size_bytes(&self) -> u64 {
        self.segments.iter().map(|segment| segment.size_bytes).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.segments).context("cannot serialize manifest")
    }
}

/// Splits an `x-object-manifest` value into (container, prefix).
pub fn parse_dlo_pointer(header: &str) -> Result<(String, String)> {
    let decoded = urlencoding::decode(header)
        .with_context(|| format!("invalid large object pointer {:?}", header))?;
    let (container, prefix) = decoded
        .split_once('/')
        .unwrap_or((decoded.as_ref(), ""));
    if container.is_empty() {
        return Err(anyhow!("large object pointer {:?} names no container", header));
    }
    Ok((container.to_string(), prefix.to_string()))
}
