//! Object-storage verbs over a [`Context`]
//!
//! Every function maps a non-2xx answer to [`Error::Storage`](crate::Error::Storage) with the
//! status code preserved, so callers can tell "absent" from "failed".

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue};
use reqwest::{Method, Url};
use tracing::{debug, instrument};

use crate::context::{Context, OBJECT_STORE, RequestOptions, container_path, object_path};
use crate::error::{Error, Result};
use crate::listing::Listing;
use crate::tempurl;
use crate::transport::{Body, ByteStream, Response};

pub const DEFAULT_TEMP_URL_TTL: Duration = Duration::from_secs(86_400);

#[instrument(skip(ctx))]
pub async fn show_account(ctx: &Context) -> Result<HeaderMap> {
    let response = ctx.call("", RequestOptions::new(Method::HEAD)).await?;
    ctx.cache_account(response.headers.clone());
    Ok(response.headers)
}

/// Sets account metadata; the cached account snapshot is dropped so a new temp URL key is
/// picked up by the next signature.
#[instrument(skip(ctx))]
pub async fn update_account(ctx: &Context, headers: HeaderMap) -> Result<()> {
    let response = ctx
        .call("", RequestOptions::new(Method::POST).with_headers(headers))
        .await;
    ctx.invalidate_account();
    response?.drain().await
}

#[instrument(skip(ctx))]
pub async fn create_container(ctx: &Context, container: &str, headers: HeaderMap) -> Result<()> {
    ctx.call(
        &container_path(container),
        RequestOptions::new(Method::PUT).with_headers(headers),
    )
    .await?
    .drain()
    .await?;
    ctx.invalidate(container);
    Ok(())
}

/// Container metadata; refreshes the context cache.
#[instrument(skip(ctx))]
pub async fn show_container(ctx: &Context, container: &str) -> Result<HeaderMap> {
    let response = ctx
        .call(&container_path(container), RequestOptions::new(Method::HEAD))
        .await?;
    ctx.cache_container(container, response.headers.clone());
    Ok(response.headers)
}

#[instrument(skip(ctx))]
pub async fn update_container(ctx: &Context, container: &str, headers: HeaderMap) -> Result<()> {
    let result = ctx
        .call(
            &container_path(container),
            RequestOptions::new(Method::POST).with_headers(headers),
        )
        .await;
    // cached metadata is stale whether or not the update went through
    ctx.invalidate(container);
    result?.drain().await
}

#[instrument(skip(ctx))]
pub async fn delete_container(ctx: &Context, container: &str) -> Result<()> {
    let result = ctx
        .call(&container_path(container), RequestOptions::new(Method::DELETE))
        .await;
    ctx.invalidate(container);
    result?.drain().await
}

/// Sets the read ACL of a container, e.g. `.r:*` for public read.
pub async fn set_container_read(ctx: &Context, container: &str, acl: &str) -> Result<()> {
    update_container(ctx, container, crate::headers(&[("x-container-read", acl)])?).await
}

/// Installs a temp-URL key on `container` and re-reads its metadata into the cache.
pub async fn temp_key(ctx: &Context, container: &str, key: &str) -> Result<()> {
    update_container(
        ctx,
        container,
        crate::headers(&[("x-container-meta-temp-url-key", key)])?,
    )
    .await?;
    show_container(ctx, container).await?;
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn head(ctx: &Context, container: &str, name: &str) -> Result<HeaderMap> {
    let response = ctx
        .call(&object_path(container, name), RequestOptions::new(Method::HEAD))
        .await?;
    Ok(response.headers)
}

/// GET with caller-supplied headers and query, e.g. `Range`; the body is left unread.
#[instrument(skip(ctx, options))]
pub async fn get(
    ctx: &Context,
    container: &str,
    name: &str,
    options: RequestOptions,
) -> Result<Response> {
    let options = RequestOptions {
        method: Method::GET,
        ..options
    };
    ctx.call(&object_path(container, name), options).await
}

pub async fn download(ctx: &Context, container: &str, name: &str) -> Result<Response> {
    get(ctx, container, name, RequestOptions::default()).await
}

/// PUT to `container/name`, draining the answer; query parameters such as
/// `multipart-manifest=put` go in `options.query`.
#[instrument(skip(ctx, options))]
pub async fn put(
    ctx: &Context,
    container: &str,
    name: &str,
    options: RequestOptions,
) -> Result<HeaderMap> {
    let options = RequestOptions {
        method: Method::PUT,
        ..options
    };
    let response = ctx.call(&object_path(container, name), options).await?;
    let headers = response.headers.clone();
    response.drain().await?;
    debug!("stored {}/{}", container, name);
    Ok(headers)
}

pub async fn put_stream(
    ctx: &Context,
    container: &str,
    name: &str,
    stream: ByteStream,
    headers: HeaderMap,
) -> Result<HeaderMap> {
    put(
        ctx,
        container,
        name,
        RequestOptions::default().with_headers(headers).body(stream),
    )
    .await
}

pub async fn put_bytes(
    ctx: &Context,
    container: &str,
    name: &str,
    bytes: impl Into<Bytes>,
    headers: HeaderMap,
) -> Result<HeaderMap> {
    put(
        ctx,
        container,
        name,
        RequestOptions::default()
            .with_headers(headers)
            .body(Body::Bytes(bytes.into())),
    )
    .await
}

/// Streams a local file without loading it in memory.
pub async fn put_file(
    ctx: &Context,
    container: &str,
    name: &str,
    path: &Path,
    headers: HeaderMap,
) -> Result<HeaderMap> {
    let file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    let stream: ByteStream = Box::pin(tokio_util::io::ReaderStream::new(file));
    let options = RequestOptions::default()
        .with_headers(headers)
        .header(CONTENT_LENGTH, HeaderValue::from(size))
        .body(stream);
    put(ctx, container, name, options).await
}

/// Replaces the metadata of an object (POST).
#[instrument(skip(ctx))]
pub async fn update(ctx: &Context, container: &str, name: &str, headers: HeaderMap) -> Result<()> {
    ctx.call(
        &object_path(container, name),
        RequestOptions::new(Method::POST).with_headers(headers),
    )
    .await?
    .drain()
    .await
}

#[instrument(skip(ctx))]
pub async fn delete_file(ctx: &Context, container: &str, name: &str) -> Result<()> {
    ctx.call(&object_path(container, name), RequestOptions::new(Method::DELETE))
        .await?
        .drain()
        .await
}

pub fn list_container<'a>(ctx: &'a Context, container: &str, prefix: Option<&str>) -> Listing<'a> {
    Listing::new(ctx, container, prefix)
}

/// Temporary URL granting `method` on `container/name` for `ttl`, signed with the
/// container's secret.
pub async fn temp_url(
    ctx: &Context,
    container: &str,
    name: &str,
    method: Method,
    ttl: Duration,
) -> Result<Url> {
    let secret = ctx.secret(container).await?;
    let now = u64::try_from(chrono::Utc::now().timestamp())
        .map_err(|_| Error::Config("system clock is before the unix epoch".to_string()))?;
    let url = ctx
        .resolve(
            OBJECT_STORE,
            &object_path(container, name),
            RequestOptions::default(),
        )?
        .url;
    tempurl::sign_temp_url(&url, &secret, &method, now + ttl.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::MemoryStore;
    use crate::transport::{Request, Transport};
    use tracing_test::traced_test;

    fn etag_of(body: &[u8]) -> String {
        format!("{:x}", md5::compute(body))
    }

    #[tokio::test]
    #[traced_test]
    async fn ping_roundtrip_through_temp_url() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let ctx = store.context("tenant").await?;
        create_container(&ctx, "ping", HeaderMap::new()).await?;
        temp_key(&ctx, "ping", "s3cr3t").await?;
        put_bytes(
            &ctx,
            "ping",
            "ping",
            "ping",
            crate::headers(&[("etag", etag_of(b"ping").as_str())])?,
        )
        .await?;
        let url = temp_url(&ctx, "ping", "ping", Method::GET, DEFAULT_TEMP_URL_TTL).await?;
        // no token: only the signature authorizes this request
        let response = store
            .send(Request {
                method: Method::GET,
                url: url.clone(),
                headers: HeaderMap::new(),
                body: Default::default(),
            })
            .await?;
        assert!(response.status.is_success());
        assert_eq!(response.text().await?, "ping");
        let mut tampered = url.clone();
        tampered.set_path("/v1/AUTH_tenant/ping/pong");
        let response = store
            .send(Request {
                method: Method::GET,
                url: tampered,
                headers: HeaderMap::new(),
                body: Default::default(),
            })
            .await?;
        assert_eq!(response.status.as_u16(), 401);
        delete_file(&ctx, "ping", "ping").await?;
        let err = head(&ctx, "ping", "ping").await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_upload_is_rejected() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let ctx = store.context("tenant").await?;
        create_container(&ctx, "c", HeaderMap::new()).await?;
        let err = put_bytes(
            &ctx,
            "c",
            "o",
            "corrupted",
            crate::headers(&[("etag", etag_of(b"original").as_str())])?,
        )
        .await
        .unwrap_err();
        assert!(err.is_integrity_mismatch());
        assert!(store.object("tenant", "c", "o").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn object_lifecycle() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let ctx = store.context("tenant").await?;
        create_container(&ctx, "c", HeaderMap::new()).await?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"file contents").await?;
        put_file(&ctx, "c", "dir/data bin", &path, HeaderMap::new()).await?;
        update(
            &ctx,
            "c",
            "dir/data bin",
            crate::headers(&[("content-type", "text/plain"), ("x-object-meta-color", "red")])?,
        )
        .await?;
        let headers = head(&ctx, "c", "dir/data bin").await?;
        assert_eq!(headers["etag"], etag_of(b"file contents").as_str());
        assert_eq!(headers["content-type"], "text/plain");
        assert_eq!(headers["x-object-meta-color"], "red");
        let body = download(&ctx, "c", "dir/data bin").await?.bytes().await?;
        assert_eq!(&body[..], b"file contents");
        let container = show_container(&ctx, "c").await?;
        assert_eq!(container["x-container-object-count"], "1");
        set_container_read(&ctx, "c", ".r:*").await?;
        assert_eq!(show_container(&ctx, "c").await?["x-container-read"], ".r:*");
        let err = delete_container(&ctx, "c").await.unwrap_err();
        assert_eq!(err.status().map(|status| status.as_u16()), Some(409));
        delete_file(&ctx, "c", "dir/data bin").await?;
        delete_container(&ctx, "c").await?;
        assert!(show_container(&ctx, "c").await.unwrap_err().is_not_found());
        Ok(())
    }
}
