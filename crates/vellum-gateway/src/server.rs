//! The upgrade boundary: listener, request screening, 401/429 refusal.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vellum_config::WebSocketSection;
use vellum_core::{ClientId, DocumentKey};
use vellum_doclog::UpdateLog;
use vellum_hub::HubHandle;

use crate::auth::{AuthClaims, TokenVerifier};
use crate::connection::run_session;
use crate::error::{GatewayError, GatewayResult};
use crate::limiter::{ConnectionLimiter, ConnectionPermit};

/// Everything a connection needs, shared across all sessions.
pub struct GatewayContext {
    /// Fan-out hub handle.
    pub hub: HubHandle,
    /// Document update log.
    pub log: Arc<UpdateLog>,
    /// Token verifier applied before upgrade.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Per-IP admission control.
    pub limiter: Arc<ConnectionLimiter>,
    /// Transport timing and size limits.
    pub websocket: WebSocketSection,
    /// Process-wide shutdown signal.
    pub shutdown: CancellationToken,
}

/// The WebSocket listener.
pub struct Gateway {
    ctx: Arc<GatewayContext>,
}

impl Gateway {
    /// Wrap a shared context.
    #[must_use]
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self { ctx }
    }

    /// Accept connections until shutdown. Each connection gets its own
    /// task; a failed accept is logged and retried.
    pub async fn run(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "gateway listening");
        }
        loop {
            tokio::select! {
                biased;
                () = self.ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&self.ctx);
                        tokio::spawn(handle_connection(stream, peer, ctx));
                    },
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    },
                }
            }
        }
        info!("gateway stopped accepting");
    }
}

/// A screened, admitted upgrade.
struct Accepted {
    doc: DocumentKey,
    claims: AuthClaims,
    client: ClientId,
    _permit: ConnectionPermit,
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<GatewayContext>) {
    let mut accepted: Option<Accepted> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match screen_request(request, peer, &ctx) {
            Ok(result) => {
                accepted = Some(result);
                Ok(response)
            },
            Err(e) => {
                debug!(%peer, error = %e, "upgrade refused");
                Err(refusal(&e))
            },
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "handshake failed");
            return;
        },
    };
    let Some(accepted) = accepted else {
        return;
    };

    info!(
        %peer,
        doc = %accepted.doc,
        principal = %accepted.claims.principal,
        "session accepted"
    );
    run_session(ws, ctx, accepted.doc, accepted.claims, accepted.client).await;
    // The permit drops here, freeing the IP slot.
}

/// Validate path, token, and admission before agreeing to upgrade.
fn screen_request(
    request: &Request,
    peer: SocketAddr,
    ctx: &Arc<GatewayContext>,
) -> GatewayResult<Accepted> {
    let permit = ctx
        .limiter
        .acquire(peer.ip())
        .ok_or(GatewayError::TooManyConnections(peer.ip()))?;

    let doc = parse_ws_path(request.uri().path())?;
    let token = extract_token(request)?;
    let claims = ctx.verifier.verify(&token)?;
    let client = query_param(request.uri(), "client")
        .map(ClientId::new)
        .unwrap_or_else(|| ClientId::new(Uuid::new_v4().to_string()));

    Ok(Accepted {
        doc,
        claims,
        client,
        _permit: permit,
    })
}

/// `/ws/{project}/{document}` → document key.
fn parse_ws_path(path: &str) -> GatewayResult<DocumentKey> {
    let rest = path
        .strip_prefix("/ws/")
        .ok_or_else(|| GatewayError::BadRequest(format!("unexpected path {path}")))?;
    rest.parse()
        .map_err(|_| GatewayError::BadRequest(format!("bad document key in path {path}")))
}

/// Token from `?token=` or `Authorization: Bearer …`.
fn extract_token(request: &Request) -> GatewayResult<String> {
    if let Some(token) = query_param(request.uri(), "token") {
        return Ok(token);
    }
    if let Some(value) = request.headers().get("authorization") {
        let value = value
            .to_str()
            .map_err(|_| GatewayError::Unauthorized("unreadable authorization header".to_owned()))?;
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Ok(token.to_owned());
        }
    }
    Err(GatewayError::Unauthorized("no token presented".to_owned()))
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_owned())
}

/// HTTP refusal matching the error class.
fn refusal(error: &GatewayError) -> ErrorResponse {
    let status = match error {
        GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        GatewayError::TooManyConnections(_) => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::Io(_) | GatewayError::WebSocket(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn ws_path_parses_project_and_document() {
        let doc = parse_ws_path("/ws/proj-1/chapters/intro.tex").unwrap();
        assert_eq!(doc.project, "proj-1");
        assert_eq!(doc.name, "chapters/intro.tex");

        assert!(parse_ws_path("/other/proj/doc").is_err());
        assert!(parse_ws_path("/ws/no-doc").is_err());
    }

    #[test]
    fn token_from_query_wins() {
        let req = request("ws://host/ws/p/d?token=abc&client=c1");
        assert_eq!(extract_token(&req).unwrap(), "abc");
    }

    #[test]
    fn token_from_bearer_header() {
        let req = Request::builder()
            .uri("ws://host/ws/p/d")
            .header("authorization", "Bearer xyz")
            .body(())
            .unwrap();
        assert_eq!(extract_token(&req).unwrap(), "xyz");
    }

    #[test]
    fn missing_token_is_unauthorized() {
        let req = request("ws://host/ws/p/d");
        assert!(matches!(
            extract_token(&req),
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[test]
    fn client_query_param_is_extracted() {
        let req = request("ws://host/ws/p/d?client=tab-7&token=t");
        assert_eq!(query_param(req.uri(), "client").as_deref(), Some("tab-7"));
        assert_eq!(query_param(req.uri(), "absent"), None);
    }
}
