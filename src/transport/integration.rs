//! HTTP integration endpoint receiving network-server uplink events.

use super::envelope::parse_envelope;
use super::Uplink;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared state for the integration handler.
#[derive(Clone)]
pub struct IntegrationState {
    pub uplinks: mpsc::Sender<Uplink>,
}

#[derive(Debug, Deserialize)]
struct EventQuery {
    event: Option<String>,
}

/// `POST /uplink?event=<kind>`
pub fn integration_router(state: IntegrationState) -> Router {
    Router::new()
        .route("/uplink", post(receive_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn receive_event(
    State(state): State<IntegrationState>,
    Query(query): Query<EventQuery>,
    body: Bytes,
) -> StatusCode {
    // Only uplink events matter; join/status/ack events are acknowledged and dropped.
    if let Some(event) = query.event.as_deref() {
        if event != "up" {
            debug!(event, "Ignoring non-uplink integration event");
            return StatusCode::OK;
        }
    }

    let uplink = match parse_envelope(&body) {
        Ok(uplink) => uplink,
        Err(e) => {
            warn!(error = %e, "Rejected integration event");
            return StatusCode::BAD_REQUEST;
        }
    };

    match state.uplinks.send(uplink).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Serve the integration router until `shutdown` fires.
pub async fn serve_integration(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Uplink integration listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> (Router, mpsc::Receiver<Uplink>) {
        let (tx, rx) = mpsc::channel(8);
        (integration_router(IntegrationState { uplinks: tx }), rx)
    }

    fn post_uplink(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_uplink_forwarded() {
        let (app, mut rx) = router();
        let resp = app
            .oneshot(post_uplink(
                "/uplink?event=up",
                r#"{"deviceInfo":{"devEui":"70b3d5499a000001"},"data":"JE9UQSw0LCo="}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let uplink = rx.recv().await.unwrap();
        assert_eq!(uplink.payload, b"$OTA,4,*");
    }

    #[tokio::test]
    async fn test_absent_event_means_up() {
        let (app, mut rx) = router();
        let resp = app
            .oneshot(post_uplink("/uplink", r#"{"devEUI":"70b3d5499a000001","data":"AA=="}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_other_events_dropped() {
        let (app, mut rx) = router();
        let resp = app
            .oneshot(post_uplink("/uplink?event=join", r#"{"devEUI":"70b3d5499a000001"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_bad_request() {
        let (app, mut rx) = router();
        let resp = app
            .oneshot(post_uplink("/uplink?event=up", r#"{"data":"AA=="}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }
}
