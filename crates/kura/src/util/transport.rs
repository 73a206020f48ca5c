use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header;
use url::Url;

use super::{http::HttpClient, range::ByteRange};
use crate::{
    download::throttle::Throttle,
    error::{KuraError, KuraResult},
};

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub range: Option<ByteRange>,
    pub accept: Option<&'static str>,
    /// Paces the body as it arrives. Transports that do not use it are
    /// throttled after the fact.
    pub throttle: Option<Throttle>,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            range: None,
            accept: None,
            throttle: None,
        }
    }

    pub fn range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }

    pub fn accept(mut self, accept: &'static str) -> Self {
        self.accept = Some(accept);
        self
    }

    pub fn throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = Some(throttle);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub body: Bytes,
    /// The server answered `206 Partial Content`.
    pub partial: bool,
    pub content_type: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

/// Range-capable GET used for manifests, segments and key URIs.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn fetch(&self, request: FetchRequest) -> KuraResult<FetchResponse>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: HttpClient,
}

impl HttpTransport {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: FetchRequest) -> KuraResult<FetchResponse> {
        let mut builder = self.client.get(request.url.clone());
        if let Some(range) = &request.range {
            builder = builder.header(header::RANGE, range.to_http_range());
        }
        if let Some(accept) = request.accept {
            builder = builder.header(header::ACCEPT, accept);
        }

        let response = builder.send().await.map_err(map_request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(KuraError::HttpError(status));
        }

        let partial = status == reqwest::StatusCode::PARTIAL_CONTENT;
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|s| s.to_str().ok())
            .map(|s| s.to_lowercase());
        let date = response
            .headers()
            .get(header::DATE)
            .and_then(|s| s.to_str().ok())
            .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
            .map(|d| d.with_timezone(&Utc));

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    body.extend_from_slice(&chunk);
                    if let Some(throttle) = &request.throttle {
                        throttle.consume(chunk.len() as u64).await;
                    }
                }
                Err(e) if body.is_empty() => return Err(map_request_error(e)),
                Err(e) => {
                    tracing::debug!(url = %request.url, received = body.len(), "Body interrupted: {e}");
                    return Err(KuraError::Interrupted {
                        received: body.freeze(),
                        partial,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(FetchResponse {
            body: body.freeze(),
            partial,
            content_type,
            date,
        })
    }
}

fn map_request_error(e: reqwest::Error) -> KuraError {
    if e.is_timeout() {
        KuraError::Timeout
    } else {
        KuraError::RequestError(e)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use wiremock::{matchers::path, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::download::BandwidthLimit;

    #[tokio::test]
    async fn test_body_is_throttled_while_streaming() {
        let server = MockServer::start().await;
        Mock::given(path("/seg.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 12_000]))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(HttpClient::new(reqwest::Client::builder()).unwrap());
        let throttle = Throttle::new(BandwidthLimit::new(Some(10_000)));
        throttle.reset();
        let url = Url::parse(&format!("{}/seg.ts", server.uri())).unwrap();

        let start = Instant::now();
        let response = transport
            .fetch(FetchRequest::get(url).throttle(throttle.clone()))
            .await
            .unwrap();
        assert_eq!(response.body.len(), 12_000);
        // 2000 bytes over a 10000 B/s burst
        assert!(start.elapsed() >= Duration::from_millis(150));
        // paid for while streaming, nothing left to settle
        assert!(throttle.settle(12_000).await.is_zero());
    }
}
