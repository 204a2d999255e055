//! HTTP fetch helpers and record codecs for pkgrelay.
//!
//! `Fetcher` wraps a blocking HTTP client: `load_remote_struct` performs a
//! GET, reads the whole body and JSON-decodes it, retrying the complete
//! round-trip on any failure — six attempts total, no backoff. Plain `get`
//! is the single-shot variant used for artifact downloads where the caller
//! streams the body.
//!
//! The codec half pairs gzip (best speed) with JSON: `marshal`/`unmarshal`
//! compose the two for compressed record storage. `unmarshal` of bytes that
//! are not gzip reports a decompression error; the composer cleanup pass
//! uses exactly that to tell record shapes apart.
//!
//! # Example
//!
//! ```
//! use pkgrelay_fetch::{compress, decompress, marshal, unmarshal};
//!
//! let record = vec!["a".to_string(), "b".to_string()];
//! let packed = marshal(&record).expect("marshal");
//! let unpacked: Vec<String> = unmarshal(&packed).expect("unmarshal");
//! assert_eq!(unpacked, record);
//!
//! let data = b"raw bytes".to_vec();
//! assert_eq!(decompress(&compress(&data).unwrap()).unwrap(), data);
//! ```

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use pkgrelay_types::MirrorError;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Total attempts for `load_remote_struct` (one try plus five retries).
pub const MAX_ATTEMPTS: usize = 6;

/// Default user agent for upstream requests.
pub const USER_AGENT: &str = concat!("pkgrelay/", env!("CARGO_PKG_VERSION"));

/// Blocking HTTP client shared by the mirrors.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::blocking::Client,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(None)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self { client }
    }

    /// Client with a per-request timeout, for tests and small fetches.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self { client }
    }

    /// GET `url`, read the entire body, JSON-decode into `T`. The whole
    /// round-trip is retried on any failure; the sixth consecutive failure
    /// returns the last error.
    pub fn load_remote_struct<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_load(url) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::debug!(url, attempt, error = %err, "fetch attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("fetch failed"))
            .context(format!("giving up on {url} after {MAX_ATTEMPTS} attempts")))
    }

    fn try_load<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let body = self.get_bytes(url)?;
        serde_json::from_slice(&body).with_context(|| format!("failed to decode {url}"))
    }

    /// Single-shot GET returning the whole body. Status mapping:
    /// 404 becomes `ResourceNotFound`, any other non-2xx `HttpError`.
    pub fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get(url)?;
        response
            .bytes()
            .map(|b| b.to_vec())
            .with_context(|| format!("failed to read body of {url}"))
    }

    /// Single-shot GET returning the response for streaming consumption.
    pub fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow::Error::from(MirrorError::ResourceNotFound))
                .with_context(|| format!("{url} returned 404"));
        }
        if !status.is_success() {
            return Err(anyhow::Error::from(MirrorError::HttpError(status.as_u16())))
                .with_context(|| format!("{url} returned {status}"));
        }
        Ok(response)
    }
}

/// Gzip `data` at best-speed level.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).context("failed to gzip data")?;
    encoder.finish().context("failed to finish gzip stream")
}

/// Reverse of [`compress`]. Fails on bytes that are not a gzip stream.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("failed to gunzip data")?;
    Ok(out)
}

/// JSON-encode and gzip a value.
pub fn marshal<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value).context("failed to encode value")?;
    compress(&json)
}

/// Reverse of [`marshal`]. A non-gzip input surfaces as a decompression
/// error, which callers use to distinguish record shapes.
pub fn unmarshal<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let json = decompress(data)?;
    serde_json::from_slice(&json).context("failed to decode value")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spawn_counting_server(status: u16, body: &'static [u8]) -> (String, Arc<AtomicUsize>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_ip().expect("ip address");
        let url = format!("http://{addr}");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        std::thread::spawn(move || {
            while let Ok(request) = server.recv() {
                counter.fetch_add(1, Ordering::SeqCst);
                let response = tiny_http::Response::from_data(body.to_vec())
                    .with_status_code(tiny_http::StatusCode(status));
                let _ = request.respond(response);
            }
        });

        (url, hits)
    }

    #[test]
    fn load_remote_struct_decodes_json() {
        let (url, _hits) = spawn_counting_server(200, br#"{"name":"left-pad"}"#);
        let fetcher = Fetcher::with_timeout(Duration::from_secs(5));

        #[derive(serde::Deserialize)]
        struct Doc {
            name: String,
        }

        let doc: Doc = fetcher.load_remote_struct(&url).expect("load");
        assert_eq!(doc.name, "left-pad");
    }

    #[test]
    fn load_remote_struct_retries_five_times() {
        let (url, hits) = spawn_counting_server(500, b"upstream exploded");
        let fetcher = Fetcher::with_timeout(Duration::from_secs(5));

        let err = fetcher
            .load_remote_struct::<serde_json::Value>(&url)
            .expect_err("must fail");
        assert_eq!(hits.load(Ordering::SeqCst), MAX_ATTEMPTS);
        assert!(MirrorError::matches(&err, MirrorError::HttpError(500)), "{err:#}");
    }

    #[test]
    fn load_remote_struct_retries_on_bad_json_too() {
        let (url, hits) = spawn_counting_server(200, b"<html>not json</html>");
        let fetcher = Fetcher::with_timeout(Duration::from_secs(5));

        let err = fetcher.load_remote_struct::<serde_json::Value>(&url);
        assert!(err.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[test]
    fn get_maps_404_to_resource_not_found() {
        let (url, _hits) = spawn_counting_server(404, b"nope");
        let fetcher = Fetcher::with_timeout(Duration::from_secs(5));

        let err = fetcher.get(&url).expect_err("404");
        assert!(MirrorError::is_not_found(&err));
    }

    #[test]
    fn compress_roundtrip_including_empty() {
        for data in [&b""[..], &b"x"[..], &[0u8; 4096][..]] {
            let packed = compress(data).expect("compress");
            assert_eq!(decompress(&packed).expect("decompress"), data);
        }
    }

    #[test]
    fn marshal_roundtrip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Record {
            package: String,
            hash_source: String,
        }

        let record = Record {
            package: "vendor/pkg".into(),
            hash_source: "abc".into(),
        };
        let packed = marshal(&record).expect("marshal");
        let unpacked: Record = unmarshal(&packed).expect("unmarshal");
        assert_eq!(unpacked, record);
    }

    #[test]
    fn unmarshal_of_plain_json_is_a_decompression_error() {
        let err = unmarshal::<serde_json::Value>(br#"{"plain":"json"}"#).expect_err("not gzip");
        assert!(err.to_string().contains("gunzip"), "{err:#}");
    }
}
