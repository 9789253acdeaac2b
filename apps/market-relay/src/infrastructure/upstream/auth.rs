//! Upstream Authentication
//!
//! Handles the authentication handshake with the upstream feed. The feed
//! terminates connections that do not authenticate promptly, so the
//! connector bounds the whole handshake with a timeout.
//!
//! # Authentication Flow
//!
//! 1. Connect to WebSocket endpoint
//! 2. Receive `{"T":"success","msg":"connected"}` from server
//! 3. Send `{"action":"auth","key":"...","secret":"..."}`
//! 4. Receive `{"T":"success","msg":"authenticated"}` or error
//!
//! # Error Codes
//!
//! - 401: Not authenticated
//! - 402: Authentication failed (invalid credentials)
//! - 403: Already authenticated
//! - 404: Authentication timeout
//! - 406: Connection limit exceeded

use thiserror::Error;

use super::messages::{AuthRequest, ErrorMessage, SuccessKind, SuccessMessage};
use crate::infrastructure::config::Credentials;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Not authenticated (must authenticate before subscribing).
    #[error("not authenticated: must authenticate before making requests")]
    NotAuthenticated,

    /// Authentication failed (invalid credentials).
    #[error("authentication failed: invalid API key or secret")]
    InvalidCredentials,

    /// Already authenticated (connection was already authenticated).
    #[error("already authenticated: connection is already authenticated")]
    AlreadyAuthenticated,

    /// Server-side authentication timeout.
    #[error("authentication timeout reported by server")]
    Timeout,

    /// Connection limit exceeded.
    #[error("connection limit exceeded: too many concurrent connections")]
    ConnectionLimitExceeded,

    /// Unexpected error from server.
    #[error("server error ({code}): {message}")]
    ServerError {
        /// Error code from server
        code: i32,
        /// Error message from server
        message: String,
    },
}

impl From<&ErrorMessage> for AuthError {
    fn from(err: &ErrorMessage) -> Self {
        match err.code {
            401 => Self::NotAuthenticated,
            402 => Self::InvalidCredentials,
            403 => Self::AlreadyAuthenticated,
            404 => Self::Timeout,
            406 => Self::ConnectionLimitExceeded,
            code => Self::ServerError {
                code,
                message: err.msg.clone(),
            },
        }
    }
}

// =============================================================================
// Authentication State
// =============================================================================

/// Current state of authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Not yet connected or authentication not started.
    #[default]
    Disconnected,

    /// Connected but not authenticated.
    Connected,

    /// Authentication request sent, awaiting response.
    Authenticating,

    /// Successfully authenticated.
    Authenticated,

    /// Authentication failed.
    Failed,
}

impl AuthState {
    /// Check if ready to authenticate (connected but not yet authenticated).
    #[must_use]
    pub const fn can_authenticate(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

// =============================================================================
// Authentication Handler
// =============================================================================

/// Authentication state machine for one upstream connection.
#[derive(Debug)]
pub struct AuthHandler {
    credentials: Credentials,
    state: AuthState,
}

impl AuthHandler {
    /// Create a new authentication handler.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            state: AuthState::Disconnected,
        }
    }

    /// Get the current authentication state.
    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Build the authentication request and mark authentication in progress.
    #[must_use]
    pub fn create_auth_request(&mut self) -> AuthRequest {
        self.state = AuthState::Authenticating;
        AuthRequest::new(
            self.credentials.api_key().to_string(),
            self.credentials.api_secret().to_string(),
        )
    }

    /// Process a success message from the server.
    ///
    /// Returns `true` once authentication is complete, `false` for the
    /// initial connection acknowledgment (the auth request should follow).
    pub const fn on_success(&mut self, msg: &SuccessMessage) -> bool {
        match msg.msg {
            SuccessKind::Connected => {
                self.state = AuthState::Connected;
                false
            }
            SuccessKind::Authenticated => {
                self.state = AuthState::Authenticated;
                true
            }
        }
    }

    /// Process an error message from the server.
    pub fn on_error(&mut self, msg: &ErrorMessage) -> AuthError {
        self.state = AuthState::Failed;
        AuthError::from(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn handler() -> AuthHandler {
        AuthHandler::new(Credentials::new("key".to_string(), "secret".to_string()))
    }

    fn success(kind: SuccessKind) -> SuccessMessage {
        SuccessMessage {
            msg_type: "success".to_string(),
            msg: kind,
        }
    }

    fn error(code: i32) -> ErrorMessage {
        ErrorMessage {
            msg_type: "error".to_string(),
            code,
            msg: "test".to_string(),
        }
    }

    #[test]
    fn full_handshake_flow() {
        let mut handler = handler();
        assert_eq!(handler.state(), AuthState::Disconnected);

        assert!(!handler.on_success(&success(SuccessKind::Connected)));
        assert!(handler.state().can_authenticate());

        let request = handler.create_auth_request();
        assert_eq!(request.key, "key");
        assert_eq!(request.secret, "secret");
        assert_eq!(handler.state(), AuthState::Authenticating);

        assert!(handler.on_success(&success(SuccessKind::Authenticated)));
        assert_eq!(handler.state(), AuthState::Authenticated);
    }

    #[test]
    fn error_fails_handshake() {
        let mut handler = handler();
        let err = handler.on_error(&error(402));
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(handler.state(), AuthState::Failed);
    }

    #[test_case(401, "not authenticated"; "401")]
    #[test_case(402, "authentication failed"; "402")]
    #[test_case(403, "already authenticated"; "403")]
    #[test_case(404, "authentication timeout"; "404")]
    #[test_case(406, "connection limit"; "406")]
    #[test_case(500, "server error (500)"; "other")]
    fn error_codes_map(code: i32, expected: &str) {
        let err = AuthError::from(&error(code));
        assert!(err.to_string().contains(expected), "{err}");
    }
}
