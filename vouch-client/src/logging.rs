//! Logging setup, and logging of the HTTP calls to the authority

use anyhow::anyhow;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use task_local_extensions::Extensions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber: human-readable output on stderr,
/// filtered via `RUST_LOG`.
pub fn setup_tracing(ansi: bool) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(ansi)
                .with_writer(std::io::stderr),
        )
        .with(EnvFilter::from_default_env())
        .init();
}

/// Logs every request and turns 4xx and 5xx responses into errors
/// carrying the status and the response body.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAndHandleErrorMiddleware;

#[async_trait::async_trait]
impl Middleware for LogAndHandleErrorMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        tracing::info!(
            url = %req.url(),
            method = %req.method(),
            "Calling the authority"
        );
        let resp = next.run(req, extensions).await?;
        let status = resp.status();
        if status.is_client_error() {
            let body = resp.text().await?;
            tracing::error!(?status, %body, "Client error on response");
            Err(anyhow!("Client error (status code {status}): {body}").into())
        } else if status.is_server_error() {
            let body = resp.text().await?;
            tracing::error!(?status, %body, "Server error on response");
            Err(anyhow!("Server error (status code {status}): {body}").into())
        } else {
            let content_length = resp.content_length();
            tracing::debug!(?status, ?content_length, "Got response");
            Ok(resp)
        }
    }
}
