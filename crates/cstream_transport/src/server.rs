//! Websocket upgrade handling: parses the request path/query during the
//! handshake (so a malformed request can be rejected with a plain HTTP
//! error instead of an accepted-then-immediately-closed websocket) and
//! hands back a [`WebSocketStream`] paired with what was parsed.

use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{
    Callback, ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Result, TransportError};
use crate::path::{self, ParsedPath, RequestedRoute};
use cstream_types::SubscribeRequest;

/// What the handshake resolved the request to, before any application
/// logic (replica version negotiation, subscriber registration) runs.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub parsed_path: ParsedPath,
    /// `Some` for the `changes` route, `None` for `snapshot` (which takes
    /// no query parameters — it's a point-in-time dump, not a subscription).
    pub subscribe: Option<SubscribeRequest>,
}

/// Implements tungstenite's `Callback` trait to run our path/query parsing
/// synchronously inside the handshake, stashing the result (or the parse
/// error, turned into a plain HTTP rejection) for the caller to retrieve
/// once the handshake future resolves.
struct CaptureRequest {
    slot: Arc<Mutex<Option<Result<UpgradeRequest>>>>,
}

impl Callback for CaptureRequest {
    fn on_request(
        self,
        request: &Request,
        response: Response,
    ) -> std::result::Result<Response, ErrorResponse> {
        let path_and_query = request.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("");
        let (path_part, query_part) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, q),
            None => (path_and_query, ""),
        };

        let parsed = path::parse_path(path_part).and_then(|parsed_path| {
            let subscribe = match parsed_path.route {
                RequestedRoute::Changes => Some(path::parse_subscribe_query(
                    parsed_path.protocol_version,
                    query_part,
                )?),
                RequestedRoute::Snapshot => None,
            };
            Ok(UpgradeRequest {
                parsed_path,
                subscribe,
            })
        });

        let result = match parsed {
            Ok(req) => {
                *self.slot.lock().unwrap() = Some(Ok(req));
                Ok(response)
            }
            Err(e) => {
                *self.slot.lock().unwrap() = Some(Err(TransportError::MalformedRequest(e.to_string())));
                let mut rejection = ErrorResponse::new(Some(e.to_string()));
                *rejection.status_mut() = StatusCode::BAD_REQUEST;
                Err(rejection)
            }
        };
        result
    }
}

/// Run the websocket handshake over an already-accepted TCP connection,
/// parsing the subscribe path/query as part of it. On success returns the
/// parsed request alongside the live stream; on a malformed request the
/// handshake itself fails with a 400 and this returns an error without
/// ever producing a [`WebSocketStream`].
pub async fn accept(stream: TcpStream) -> Result<(UpgradeRequest, WebSocketStream<TcpStream>)> {
    let slot: Arc<Mutex<Option<Result<UpgradeRequest>>>> = Arc::new(Mutex::new(None));
    let callback = CaptureRequest { slot: slot.clone() };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let captured = slot
        .lock()
        .unwrap()
        .take()
        .ok_or(TransportError::Closed)?;
    let upgrade = captured?;
    Ok((upgrade, ws))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_request_is_clonable_and_debuggable() {
        let req = UpgradeRequest {
            parsed_path: ParsedPath {
                service_prefix: "sync".into(),
                protocol_version: 2,
                route: RequestedRoute::Snapshot,
            },
            subscribe: None,
        };
        let cloned = req.clone();
        assert_eq!(format!("{:?}", cloned).contains("sync"), true);
    }
}
