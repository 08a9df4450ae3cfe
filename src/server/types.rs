//! Request Validation Types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;

/// Why a relay request was refused before any upgrade was attempted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRejection {
    /// No `port` query parameter
    Missing,
    /// `port` is not an integer
    Invalid(String),
    /// `port` is an integer outside the allow-list
    NotAllowed(i64),
}

impl PortRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            PortRejection::Missing => StatusCode::PRECONDITION_REQUIRED,
            PortRejection::Invalid(_) | PortRejection::NotAllowed(_) => StatusCode::NOT_ACCEPTABLE,
        }
    }

    /// Plain-text body sent with the status
    pub fn body_text(&self) -> &'static str {
        match self {
            PortRejection::Missing => "no port query argument",
            PortRejection::Invalid(_) => "invalid port query argument",
            PortRejection::NotAllowed(_) => "port not allowed",
        }
    }
}

impl fmt::Display for PortRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRejection::Missing => write!(f, "{}", self.body_text()),
            PortRejection::Invalid(raw) => write!(f, "{}: {:?}", self.body_text(), raw),
            PortRejection::NotAllowed(port) => write!(f, "{}: {}", self.body_text(), port),
        }
    }
}

impl IntoResponse for PortRejection {
    fn into_response(self) -> Response {
        (self.status(), self.body_text()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(PortRejection::Missing.status(), StatusCode::PRECONDITION_REQUIRED);
        assert_eq!(PortRejection::Invalid("x".into()).status(), StatusCode::NOT_ACCEPTABLE);
        assert_eq!(PortRejection::NotAllowed(22).status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[test]
    fn test_into_response() {
        let response = PortRejection::NotAllowed(9999).into_response();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[test]
    fn test_display_includes_detail() {
        assert_eq!(PortRejection::NotAllowed(9999).to_string(), "port not allowed: 9999");
        assert_eq!(
            PortRejection::Invalid("http".into()).to_string(),
            "invalid port query argument: \"http\""
        );
    }
}
