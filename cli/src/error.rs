use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Error body returned by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub details: Option<Value>,
}

#[derive(Debug, Error)]
pub enum CliError {
    /// The control plane rejected the session token.
    #[error("session is missing or expired; run `deployctl login`")]
    Unauthorized,

    #[error("{method} {url} failed: status={status} error_code={code} error={message}{details}")]
    Api {
        method: String,
        url: String,
        status: u16,
        code: String,
        message: String,
        details: String,
    },
}

impl CliError {
    pub fn from_body(method: &str, url: &str, status: u16, bytes: &[u8]) -> Self {
        let (code, message, details) = match serde_json::from_slice::<ErrorResponse>(bytes) {
            Ok(e) => (
                e.error_code.unwrap_or_else(|| "UNKNOWN".to_string()),
                e.error.unwrap_or_default(),
                render_details(e.details.as_ref()),
            ),
            Err(_) => (
                "UNKNOWN".to_string(),
                String::from_utf8_lossy(bytes).to_string(),
                String::new(),
            ),
        };
        CliError::Api {
            method: method.to_string(),
            url: url.to_string(),
            status,
            code,
            message,
            details,
        }
    }
}

/// Validation violations render one per line; anything else is elided.
fn render_details(details: Option<&Value>) -> String {
    let Some(Value::Array(items)) = details else {
        return String::new();
    };
    let mut out = String::new();
    for item in items {
        let field = item.get("field").and_then(Value::as_str).unwrap_or("?");
        let message = item.get("message").and_then(Value::as_str).unwrap_or("");
        out.push_str(&format!("\n  - {}: {}", field, message));
    }
    out
}
