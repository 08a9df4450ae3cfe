//! Bridge Routes

use super::handlers::{relay_handler, AppState};
use axum::Router;
use std::path::Path;
use tower_http::services::ServeFile;

/// Bridge router
pub struct BridgeApi;

impl BridgeApi {
    /// Create the bridge router
    pub fn create_router(state: AppState, test_page: &Path) -> Router {
        Router::new()
            // Manual test aid
            .route_service("/test", ServeFile::new(test_page))
            // Every other path is a relay request
            .fallback(relay_handler)
            .with_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PortPolicy;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::io::Write;
    use tower::ServiceExt;

    fn create_test_router() -> Router {
        let state = AppState::new(PortPolicy::new([8484]));
        BridgeApi::create_router(state, Path::new("does-not-exist.html"))
    }

    async fn status_of(app: Router, uri: &str) -> StatusCode {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_missing_port_is_precondition_required() {
        assert_eq!(
            status_of(create_test_router(), "/").await,
            StatusCode::PRECONDITION_REQUIRED
        );
    }

    #[tokio::test]
    async fn test_invalid_port_is_not_acceptable() {
        assert_eq!(
            status_of(create_test_router(), "/?port=ssh").await,
            StatusCode::NOT_ACCEPTABLE
        );
    }

    #[tokio::test]
    async fn test_disallowed_port_is_not_acceptable() {
        assert_eq!(
            status_of(create_test_router(), "/?port=9999").await,
            StatusCode::NOT_ACCEPTABLE
        );
    }

    #[tokio::test]
    async fn test_allowed_port_without_upgrade_headers_fails_upgrade() {
        let status = status_of(create_test_router(), "/?port=8484").await;
        assert!(status.is_client_error());
        assert_ne!(status, StatusCode::NOT_ACCEPTABLE);
        assert_ne!(status, StatusCode::PRECONDITION_REQUIRED);
    }

    #[tokio::test]
    async fn test_validation_happens_before_upgrade() {
        // A well-formed upgrade request for a disallowed port is still refused.
        let request = Request::builder()
            .uri("/?port=22")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();

        let response = create_test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn test_test_page_is_served() {
        let mut page = tempfile::NamedTempFile::new().unwrap();
        write!(page, "<html>bridge test</html>").unwrap();

        let state = AppState::new(PortPolicy::default());
        let app = BridgeApi::create_router(state, page.path());

        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"<html>bridge test</html>");
    }

    #[tokio::test]
    async fn test_any_other_path_is_a_relay_request() {
        assert_eq!(
            status_of(create_test_router(), "/anything").await,
            StatusCode::PRECONDITION_REQUIRED
        );
        assert_eq!(
            status_of(create_test_router(), "/nested/path?port=9999").await,
            StatusCode::NOT_ACCEPTABLE
        );
        assert_eq!(
            status_of(create_test_router(), "/test/extra").await,
            StatusCode::PRECONDITION_REQUIRED
        );
    }

    #[tokio::test]
    async fn test_missing_test_page_is_not_found() {
        assert_eq!(status_of(create_test_router(), "/test").await, StatusCode::NOT_FOUND);
    }
}
