//! Raw HTTP boundary between the session context and the network
//!
//! Everything above this module speaks in [`Request`] and [`Response`]; the
//! [`Transport`] trait is the seam where tests plug in an in-memory store.

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use tracing::{debug, instrument};

use crate::error::{Error, Result};

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => write!(f, "Empty"),
            Body::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Body::Stream(_) => write!(f, "Stream"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes.into())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Bytes(text.into())
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<ByteStream> for Body {
    fn from(stream: ByteStream) -> Self {
        Body::Stream(stream)
    }
}

impl Body {
    /// Collects the whole body in memory.
    pub async fn collect(self) -> std::io::Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Bytes(bytes) => Ok(bytes),
            Body::Stream(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(chunks.concat().into())
            }
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Body,
}

impl Request {
    /// Decoded path of the request, used to name the target in errors and logs.
    pub fn target(&self) -> String {
        urlencoding::decode(self.url.path())
            .map(|path| path.into_owned())
            .unwrap_or_else(|_| self.url.path().to_string())
    }
}

pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: ByteStream,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ByteStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(
            status,
            headers,
            futures::stream::once(async move { Ok(body) }).boxed(),
        )
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    pub async fn bytes(self) -> Result<Bytes> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(chunks.concat().into())
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| Error::Decode(err.to_string()))
    }

    /// Reads and discards the body so the connection can be reused.
    pub async fn drain(mut self) -> Result<()> {
        while let Some(chunk) = self.body.next().await {
            chunk?;
        }
        Ok(())
    }

    pub fn into_stream(self) -> ByteStream {
        self.body
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: Request) -> Result<Response>;
}

#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub connect_timeout: std::time::Duration,
    /// Maximum idle time between two reads of a response
    pub read_timeout: std::time::Duration,
    pub pool_idle_timeout: std::time::Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: std::time::Duration::from_secs(30),
            read_timeout: std::time::Duration::from_secs(300),
            pool_idle_timeout: std::time::Duration::from_secs(90),
        }
    }
}

/// [`Transport`] over one shared keep-alive [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(settings: HttpSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.read_timeout)
            .pool_idle_timeout(settings.pool_idle_timeout)
            .build()
            .map_err(|err| Error::Config(format!("cannot build http client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: Request) -> Result<Response> {
        let permit = throttle::connection_permit().await;
        throttle::get_request_token().await;
        let method = request.method.clone();
        let target = request.target();
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        builder = match request.body {
            Body::Empty => builder,
            Body::Bytes(bytes) => builder.body(bytes),
            Body::Stream(stream) => builder.body(reqwest::Body::wrap_stream(stream)),
        };
        let response = builder.send().await.map_err(|source| Error::Transport {
            method: method.clone(),
            target: target.clone(),
            source,
        })?;
        let status = response.status();
        debug!("{} {} -> {}", method, target, status);
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        Ok(Response::new(status, headers, release_on_end(body, permit)))
    }
}

/// Keeps `guard` alive while `stream` still has chunks to yield and drops it at the end of the
/// body, even if the caller keeps the exhausted stream around.
fn release_on_end<G: Send + 'static>(stream: ByteStream, guard: G) -> ByteStream {
    futures::stream::unfold(Some((stream, guard)), |state| async move {
        let (mut stream, guard) = state?;
        let chunk = stream.next().await?;
        Some((chunk, Some((stream, guard))))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_helpers() -> anyhow::Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-container-object-count", "3".parse()?);
        let response = Response::from_bytes(StatusCode::OK, headers, r#"{"a": 1}"#);
        assert_eq!(response.header_str("x-container-object-count"), Some("3"));
        let value: serde_json::Value = response.json().await?;
        assert_eq!(value["a"], 1);
        let response = Response::from_bytes(StatusCode::OK, HeaderMap::new(), "not json");
        assert!(matches!(
            response.json::<serde_json::Value>().await,
            Err(Error::Decode(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn guard_released_once_body_is_read() -> anyhow::Result<()> {
        let slots = std::sync::Arc::new(tokio::sync::Semaphore::new(1));
        let permit = slots.clone().acquire_owned().await?;
        let body: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"da")),
            Ok(Bytes::from_static(b"ta")),
        ])
        .boxed();
        let mut stream = release_on_end(body, permit);
        assert!(stream.next().await.is_some());
        assert_eq!(slots.available_permits(), 0);
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        // the stream is still alive here
        assert_eq!(slots.available_permits(), 1);
        assert!(stream.next().await.is_none());
        Ok(())
    }

    /// Answers every request on its own connection with a 4 byte body.
    async fn serve_ping() -> anyhow::Result<std::net::SocketAddr> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\nconnection: close\r\n\r\nping",
                        )
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        Ok(addr)
    }

    #[tokio::test]
    async fn read_body_frees_connection_slot() -> anyhow::Result<()> {
        throttle::set_max_connections(1);
        let addr = serve_ping().await?;
        let transport = HttpTransport::new(HttpSettings::default())?;
        let request = |method: Method| -> anyhow::Result<Request> {
            Ok(Request {
                method,
                url: Url::parse(&format!("http://{addr}/v1/AUTH_test/c/o"))?,
                headers: HeaderMap::new(),
                body: Body::Empty,
            })
        };
        let response = transport.send(request(Method::GET)?).await?;
        let mut stream = response.into_stream();
        let mut read = 0;
        while let Some(chunk) = stream.try_next().await? {
            read += chunk.len();
        }
        assert_eq!(read, 4);
        let second = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            transport.send(request(Method::POST)?),
        )
        .await??;
        assert_eq!(second.status, StatusCode::OK);
        drop(stream);
        throttle::set_max_connections(0);
        Ok(())
    }

    #[tokio::test]
    async fn stream_body_collects() -> anyhow::Result<()> {
        let stream: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"pi")),
            Ok(Bytes::from_static(b"ng")),
        ])
        .boxed();
        assert_eq!(Body::from(stream).collect().await?, Bytes::from_static(b"ping"));
        Ok(())
    }
}
