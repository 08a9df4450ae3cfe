//! WebSocket Handshake
//!
//! Axum extractor that validates an RFC 6455 opening handshake, negotiates
//! `permessage-deflate` and hands the upgraded connection to a callback.

use std::fmt;
use std::future::Future;

use axum::{
    async_trait,
    body::Body,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};

use super::deflate::{self, ACCEPTED_EXTENSION};
use super::socket::{WebSocket, WebSocketConfig};

const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Connection handed to the upgrade callback
pub type UpgradedSocket = WebSocket<TokioIo<Upgraded>>;

/// `Sec-WebSocket-Accept` value for a client key
pub fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(ACCEPT_GUID);
    STANDARD.encode(sha1.finalize())
}

/// Why a request could not be upgraded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeRejection {
    MethodNotGet,
    InvalidConnectionHeader,
    InvalidUpgradeHeader,
    InvalidVersion,
    KeyMissing,
    /// The request did not arrive over a connection that can be taken over
    ConnectionNotUpgradable,
}

impl UpgradeRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            UpgradeRejection::MethodNotGet => StatusCode::METHOD_NOT_ALLOWED,
            UpgradeRejection::ConnectionNotUpgradable => StatusCode::UPGRADE_REQUIRED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for UpgradeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UpgradeRejection::MethodNotGet => "Request method must be `GET`",
            UpgradeRejection::InvalidConnectionHeader => "Connection header did not include 'upgrade'",
            UpgradeRejection::InvalidUpgradeHeader => "`Upgrade` header did not include 'websocket'",
            UpgradeRejection::InvalidVersion => "`Sec-WebSocket-Version` header did not include '13'",
            UpgradeRejection::KeyMissing => "`Sec-WebSocket-Key` header missing",
            UpgradeRejection::ConnectionNotUpgradable => "Connection is not upgradable",
        };
        f.write_str(text)
    }
}

impl std::error::Error for UpgradeRejection {}

impl IntoResponse for UpgradeRejection {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Validated WebSocket handshake, ready to be accepted
pub struct WebSocketUpgrade {
    key: HeaderValue,
    on_upgrade: OnUpgrade,
    deflate: bool,
    config: WebSocketConfig,
    on_failed_upgrade: Option<Box<dyn FnOnce(hyper::Error) + Send>>,
}

impl fmt::Debug for WebSocketUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketUpgrade")
            .field("deflate", &self.deflate)
            .field("config", &self.config)
            .finish()
    }
}

impl WebSocketUpgrade {
    /// Buffer sizes and message limit for the connection
    pub fn config(mut self, config: WebSocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Whether the client offered a `permessage-deflate` variant that will be accepted
    pub fn deflate(&self) -> bool {
        self.deflate
    }

    /// Called instead of the upgrade callback when the connection could not
    /// be taken over after the 101 response
    pub fn on_failed_upgrade<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(hyper::Error) + Send + 'static,
    {
        self.on_failed_upgrade = Some(Box::new(callback));
        self
    }

    /// Accept the handshake and run `callback` on the upgraded connection.
    ///
    /// The returned `101 Switching Protocols` response must be sent for the
    /// upgrade to complete.
    #[must_use = "the upgrade only happens once this response is returned"]
    pub fn on_upgrade<C, Fut>(self, callback: C) -> Response
    where
        C: FnOnce(UpgradedSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let accept = match HeaderValue::from_str(&accept_key(self.key.as_bytes())) {
            Ok(accept) => accept,
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };

        let Self {
            on_upgrade,
            deflate,
            config,
            on_failed_upgrade,
            ..
        } = self;

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let socket = WebSocket::from_upgraded(TokioIo::new(upgraded), config, deflate);
                    callback(socket).await;
                }
                Err(e) => {
                    if let Some(on_failed_upgrade) = on_failed_upgrade {
                        on_failed_upgrade(e);
                    }
                }
            }
        });

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        if deflate {
            headers.insert(
                header::SEC_WEBSOCKET_EXTENSIONS,
                HeaderValue::from_static(ACCEPTED_EXTENSION),
            );
        }
        response
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for WebSocketUpgrade
where
    S: Send + Sync,
{
    type Rejection = UpgradeRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if parts.method != Method::GET {
            return Err(UpgradeRejection::MethodNotGet);
        }
        if !header_contains(&parts.headers, header::CONNECTION, "upgrade") {
            return Err(UpgradeRejection::InvalidConnectionHeader);
        }
        if !header_eq(&parts.headers, header::UPGRADE, "websocket") {
            return Err(UpgradeRejection::InvalidUpgradeHeader);
        }
        if !header_eq(&parts.headers, header::SEC_WEBSOCKET_VERSION, "13") {
            return Err(UpgradeRejection::InvalidVersion);
        }

        let key = parts
            .headers
            .get(header::SEC_WEBSOCKET_KEY)
            .cloned()
            .ok_or(UpgradeRejection::KeyMissing)?;

        let on_upgrade = parts
            .extensions
            .remove::<OnUpgrade>()
            .ok_or(UpgradeRejection::ConnectionNotUpgradable)?;

        Ok(Self {
            key,
            on_upgrade,
            deflate: deflate::negotiate(&parts.headers),
            config: WebSocketConfig::default(),
            on_failed_upgrade: None,
        })
    }
}

fn header_eq(headers: &HeaderMap, key: HeaderName, value: &str) -> bool {
    headers
        .get(&key)
        .map(|header| header.as_bytes().eq_ignore_ascii_case(value.as_bytes()))
        .unwrap_or(false)
}

/// Whether a comma-separated header contains `value` as one of its tokens
fn header_contains(headers: &HeaderMap, key: HeaderName, value: &str) -> bool {
    headers
        .get_all(&key)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|header| header.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case(value))
}
