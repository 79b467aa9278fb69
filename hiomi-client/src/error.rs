//! Error types for hiomi-client
//!
//! Every failure is scoped to a single request. The presentation layer gets
//! one human-readable string from [`ClientError::user_message`]; status codes
//! and raw bodies stay in the logs.

use thiserror::Error;

/// Longest backend body excerpt shown to the user
const MAX_DETAIL_CHARS: usize = 200;

/// Client error type
#[derive(Debug, Error)]
pub enum ClientError {
    /// Service could not be reached (connection refused, DNS, timeout)
    #[error("Network error ({service}): {detail}")]
    Network { service: &'static str, detail: String },

    /// Non-success HTTP status, with the backend-provided body
    #[error("{operation} failed: {status} - {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// Response or event payload could not be parsed
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// File refused before any network call
    #[error("Rejected file: {0}")]
    RejectedFile(String),

    /// Polling reached its attempt ceiling without a matching result
    #[error("No result after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// Push stream ended without an error
    #[error("Result channel closed")]
    ChannelClosed,

    /// Client construction or configuration problem
    #[error("Common error: {0}")]
    Common(#[from] hiomi_common::Error),
}

impl ClientError {
    pub fn network(service: &'static str, err: impl std::fmt::Display) -> Self {
        ClientError::Network {
            service,
            detail: err.to_string(),
        }
    }

    /// Single human-readable message for the presentation layer
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Network { service, .. } => format!(
                "Cannot connect to {service} service. Please check if the service is running and CORS is configured."
            ),
            ClientError::Status {
                operation,
                status,
                body,
            } => {
                let detail = summarize(body);
                if detail.is_empty() {
                    format!("{operation} failed: {status}")
                } else {
                    format!("{operation} failed: {status} - {detail}")
                }
            }
            ClientError::Malformed(_) => "The service returned an unreadable response.".to_string(),
            ClientError::RejectedFile(reason) => reason.clone(),
            ClientError::Timeout { .. } => {
                "Analysis is taking longer than expected. Please try again.".to_string()
            }
            ClientError::ChannelClosed => "The result connection was closed.".to_string(),
            ClientError::Common(e) => e.to_string(),
        }
    }
}

/// First line of a body, trimmed and capped
fn summarize(body: &str) -> String {
    let line = body.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.chars().count() > MAX_DETAIL_CHARS {
        let mut cut: String = line.chars().take(MAX_DETAIL_CHARS).collect();
        cut.push('…');
        cut
    } else {
        line.to_string()
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_message_names_service() {
        let err = ClientError::network("upload", "connection refused");
        assert_eq!(
            err.user_message(),
            "Cannot connect to upload service. Please check if the service is running and CORS is configured."
        );
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_status_message_keeps_code_and_first_line() {
        let err = ClientError::Status {
            operation: "Upload",
            status: 413,
            body: "\n  File too large\nTraceback (most recent call last): ...".to_string(),
        };
        assert_eq!(err.user_message(), "Upload failed: 413 - File too large");

        let empty = ClientError::Status {
            operation: "Processing",
            status: 502,
            body: String::new(),
        };
        assert_eq!(empty.user_message(), "Processing failed: 502");
    }

    #[test]
    fn test_long_detail_truncated() {
        let err = ClientError::Status {
            operation: "Upload",
            status: 500,
            body: "x".repeat(1000),
        };
        assert!(err.user_message().chars().count() < 250);
    }
}
