//! HTTP retrieval of static and realtime feeds.
//!
//! Single attempt per call: a transport failure or a non-2xx status becomes
//! [`PipelineError::Fetch`] and retrying is left to the caller.

mod client;
mod basic;
pub mod auth;

pub use client::HttpClient;
pub use basic::BasicClient;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::io;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::PipelineError;
use auth::UrlParam;

/// Response body exposed as an `AsyncRead` without buffering it.
pub type ByteStream = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Builds the client used for feed requests, appending `key=<api_key>` when
/// a key is configured.
pub fn feed_client(api_key: Option<String>) -> Box<dyn HttpClient> {
    match api_key {
        Some(key) => Box::new(UrlParam::api_key(BasicClient::new(), key)),
        None => Box::new(BasicClient::new()),
    }
}

/// Reads feed data from a local file, or fetches it through [`feed_client`]
/// when `source` is an http(s) URL.
#[tracing::instrument(skip(api_key))]
pub async fn load_feed(source: &str, api_key: Option<String>) -> Result<Vec<u8>, PipelineError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        fetch_bytes(feed_client(api_key).as_ref(), source).await
    } else {
        Ok(tokio::fs::read(source).await?)
    }
}

/// Fetches `url` and returns the whole body.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<Vec<u8>, PipelineError> {
    let resp = send(client, url).await?;
    let body = resp
        .bytes()
        .await
        .map_err(|e| PipelineError::fetch(url, e))?;
    debug!(url, bytes = body.len(), "Body received");
    Ok(body.to_vec())
}

/// Fetches `url` and returns the body as a byte stream.
pub async fn fetch_stream<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<ByteStream, PipelineError> {
    let resp = send(client, url).await?;
    debug!(url, content_length = resp.content_length(), "Streaming body");
    let body = resp.bytes_stream().map_err(io::Error::other).boxed();
    Ok(StreamReader::new(body))
}

async fn send<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<reqwest::Response, PipelineError> {
    let req = reqwest::Request::new(
        reqwest::Method::GET,
        url.parse().map_err(|e| PipelineError::fetch(url, e))?,
    );

    let resp = client
        .execute(req)
        .await
        .map_err(|e| PipelineError::fetch(url, e))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(PipelineError::fetch(url, format!("HTTP status {status}")));
    }
    Ok(resp)
}
