//! Content-addressed import of Swift containers
//!
//! `cas-import` mirrors every object of one or more source containers into a destination
//! container where each object is stored under a path derived from its md5:
//!
//! ```text
//! <dst container>/<hash[0..2]>/<hash[2..3]>/<hash>
//! ```
//!
//! Identical content is therefore stored once, plain objects are copied server-side without
//! passing through this host, and dynamic large objects are re-published as static manifests
//! whose segments are the already-imported, content-addressed parts.
//!
//! # Re-running
//!
//! A run never overwrites destination objects: anything whose hash is already present is
//! skipped before any request is made. An interrupted or partially failed run can simply be
//! started again; it only does the remaining work.
//!
//! # Failures
//!
//! Object-level failures are collected in the [`Summary`] and the run continues with the
//! remaining objects. [`migrate`] reports an [`Error`] (carrying the summary) if at least one
//! object failed; `--fail-early` stops at the first failure instead.

pub mod cas;
pub mod engine;
pub mod manifest;

pub use engine::{Error, Failure, Outcome, Settings, Summary, migrate};
