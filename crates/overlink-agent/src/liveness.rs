//! Liveness endpoint served on the overlay
//!
//! Answers every HTTP request, whatever its method or path, with
//! `200 OK` and the body `Ok\n`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use overlink_overlay::{OverlayError, OverlayListener, OverlayResult, ACCEPT_RETRY_DELAY};
use std::convert::Infallible;

/// Overlay port the liveness endpoint listens on by default
pub const DEFAULT_LIVENESS_PORT: u16 = 80;

/// Body of every liveness response
pub const LIVENESS_BODY: &str = "Ok\n";

/// Serve liveness responses until the owning session closes
///
/// Other accept errors are logged and retried after [`ACCEPT_RETRY_DELAY`].
/// Returns `OverlayError::Closed` once the session is closed.
pub async fn serve<L: OverlayListener>(listener: L) -> OverlayResult<()> {
    tracing::debug!(port = listener.local_port(), "Serving liveness endpoint");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(OverlayError::Closed) => return Err(OverlayError::Closed),
            Err(e) => {
                tracing::trace!(error = %e, "Liveness accept error");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(respond))
                .await
            {
                tracing::trace!(peer = %peer, error = %e, "Liveness connection error");
            }
        });
    }
}

async fn respond(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut response = Response::new(Full::new(Bytes::from_static(LIVENESS_BODY.as_bytes())));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Ok(response)
}
