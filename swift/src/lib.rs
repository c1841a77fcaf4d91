//! Swift object-storage client used by swiftcas tools
//!
//! The crate is organised around a [`Context`]: an authenticated session against one
//! Keystone-backed Swift account. It is built from [`Credentials`] (usually looked up by name
//! in a [`Remotes`] file) and a [`Transport`], then shared by reference with the free
//! functions in [`storage`].
//!
//! ```rust,no_run
//! # async fn example() -> swift::Result<()> {
//! use std::sync::Arc;
//!
//! let credentials = swift::Remotes::load_default()?.credentials("backup")?;
//! let transport = Arc::new(swift::HttpTransport::new(Default::default())?);
//! let ctx = swift::Context::build(credentials, transport).await?;
//! let entries = swift::storage::list_container(&ctx, "photos", None)
//!     .collect_all()
//!     .await?;
//! println!("{} objects", entries.len());
//! # Ok(())
//! # }
//! ```
//!
//! Failures are reported as [`Error`]; storage failures keep their HTTP status so callers can
//! tell "absent" (404) from "still copying" (504) or "corrupted upload" (422).

mod auth;
pub mod context;
pub mod credentials;
pub mod error;
pub mod listing;
pub mod remotes;
pub mod storage;
pub mod tempurl;
pub mod transport;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use auth::Session;
pub use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
pub use reqwest::{Method, StatusCode, Url};
pub use context::{Context, OBJECT_STORE, RequestOptions, container_path, headers, object_path};
pub use credentials::{AuthVersion, Credentials, DirectContainer};
pub use error::{Error, Result, StorageError};
pub use listing::{Listing, ObjectEntry};
pub use remotes::{ENV_REMOTE, Remotes};
pub use transport::{Body, ByteStream, HttpSettings, HttpTransport, Request, Response, Transport};
