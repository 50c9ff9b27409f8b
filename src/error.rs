use thiserror::Error;

/// Reasons a request is not served.
///
/// Every variant is recovered by the dispatcher and turned into a response; none of them
/// are fatal to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The path tried to climb above the root. Answered exactly like `NotFound`.
    #[error("The URL you requested was not found.")]
    TraversalRejected,
    #[error("Access denied due to invalid credentials.")]
    AuthRequired,
    #[error("You don't have permission to access this URL.")]
    AuthForbidden,
    #[error("The URL you requested was not found.")]
    NotFound,
    #[error("You don't have permission to access this URL.")]
    Forbidden,
    #[error("You sent a request that the server couldn't understand.")]
    BadRequest,
    #[error("Your request was dropped because it was too long.")]
    RequestTooLarge,
    #[error("The method you specified is not implemented.")]
    NotImplemented,
}

impl RequestError {
    /// HTTP status code.
    pub fn status(self) -> u16 {
        match self {
            Self::TraversalRejected | Self::NotFound => 404,
            Self::AuthRequired => 401,
            Self::AuthForbidden | Self::Forbidden => 403,
            Self::BadRequest => 400,
            Self::RequestTooLarge => 413,
            Self::NotImplemented => 501,
        }
    }

    /// HTTP reason phrase.
    pub fn status_name(self) -> &'static str {
        match self.status() {
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            413 => "Request Entity Too Large",
            _ => "Not Implemented",
        }
    }

    /// Whether the response must carry a `WWW-Authenticate` challenge.
    pub fn challenge(self) -> bool {
        matches!(self, Self::AuthRequired)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn traversal_is_indistinguishable_from_not_found() {
        let traversal = RequestError::TraversalRejected;
        let not_found = RequestError::NotFound;
        assert_eq!(traversal.status(), not_found.status());
        assert_eq!(traversal.status_name(), not_found.status_name());
        assert_eq!(traversal.to_string(), not_found.to_string());
    }

    #[test]
    fn only_auth_required_challenges() {
        assert!(RequestError::AuthRequired.challenge());
        assert!(!RequestError::AuthForbidden.challenge());
        assert!(!RequestError::Forbidden.challenge());
    }
}
