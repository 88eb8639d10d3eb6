//! HTTP forwarding to a resolved backend
//!
//! Uses the hyper-util pooled client. The response body is buffered so that
//! backend addresses embedded in it can be rewritten before it reaches the
//! caller.

use axum::body::Body;
use axum::http::{header, HeaderMap, Request, Response, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};
use vmgate_discovery::ResolvedBackend;

use crate::error::ProxyError;
use crate::rewrite::{is_text_content_type, rewrite_all};

/// Forwards plain HTTP requests to backends
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` to `backend` at `path_and_query`, rewriting backend
    /// addresses in the response body to `public_base`.
    ///
    /// `path_and_query` must already have the routing parameter removed.
    pub async fn forward(
        &self,
        request: Request<Body>,
        backend: &ResolvedBackend,
        path_and_query: &str,
        public_base: &str,
    ) -> Result<Response<Body>, ProxyError> {
        let span = info_span!(
            "forward",
            method = %request.method(),
            backend = %backend.address,
            machine = %backend.machine.name,
        );

        self.forward_inner(request, backend, path_and_query, public_base)
            .instrument(span)
            .await
    }

    async fn forward_inner(
        &self,
        request: Request<Body>,
        backend: &ResolvedBackend,
        path_and_query: &str,
        public_base: &str,
    ) -> Result<Response<Body>, ProxyError> {
        let target = format!("http://{}{}", backend.address, path_and_query);
        let uri: Uri = target
            .parse()
            .map_err(|e| ProxyError::BadRequest(format!("invalid target URI {}: {}", target, e)))?;

        let (parts, body) = request.into_parts();

        let mut forwarded = Request::builder()
            .method(parts.method)
            .uri(uri)
            .body(body)
            .map_err(|e| ProxyError::BadRequest(format!("failed to build request: {}", e)))?;
        *forwarded.headers_mut() = outbound_headers(&parts.headers);

        debug!("Forwarding to {}", target);

        let exchange = async {
            let response: Response<Incoming> = self
                .client
                .request(forwarded)
                .await
                .map_err(|e| ProxyError::BackendUnreachable(format!("{}: {}", target, e)))?;

            let (parts, body) = response.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| {
                    ProxyError::BackendUnreachable(format!("reading body from {}: {}", target, e))
                })?
                .to_bytes();

            Ok::<_, ProxyError>((parts, bytes))
        };

        let (mut parts, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                warn!("Backend {} did not answer within {:?}", backend.address, self.timeout);
                ProxyError::BackendUnreachable(format!(
                    "{} timed out after {:?}",
                    target, self.timeout
                ))
            })??;

        // The body may change length
        parts.headers.remove(header::CONTENT_LENGTH);
        parts.headers.remove(header::TRANSFER_ENCODING);

        let rewritable = parts
            .headers
            .get(header::CONTENT_TYPE)
            .map_or(true, |ct| ct.to_str().map_or(false, is_text_content_type));

        let body = if rewritable {
            rewrite_all(&bytes, &backend.known_authorities(), public_base).into()
        } else {
            bytes
        };

        debug!(
            "Backend answered {} ({} bytes, rewritten: {})",
            parts.status,
            body.len(),
            rewritable
        );

        Ok(Response::from_parts(parts, Body::from(body)))
    }
}

/// Inbound headers minus the ones naming the gateway's own host.
///
/// `Accept-Encoding` is dropped too so backend bodies arrive uncompressed and
/// can be rewritten.
fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = inbound.clone();
    headers.remove(header::HOST);
    headers.remove("x-forwarded-host");
    headers.remove(header::ACCEPT_ENCODING);
    headers
}
