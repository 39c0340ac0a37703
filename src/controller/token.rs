//! # Opaque operation token.
//!
//! Returned with `202 Accepted` and handed back on last-operation queries.
//! The token is URL-safe base64 (no padding) over a small JSON document:
//!
//! ```text
//! {"type":"update","serviceflow_name":"blueprint","serviceflow_id":"f1"}
//! ```
//!
//! Decoding accepts padded and unpadded input.

use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Lifecycle verb an asynchronous operation belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    /// Capitalized verb for user-facing descriptions.
    pub fn action(&self) -> &'static str {
        match self {
            OperationType::Create => "Create",
            OperationType::Update => "Update",
            OperationType::Delete => "Delete",
        }
    }
}

/// Decoded operation token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationToken {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<OperationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serviceflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serviceflow_id: Option<String>,
}

impl OperationToken {
    pub fn new(operation_type: OperationType) -> Self {
        Self {
            operation_type: Some(operation_type),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_service_flow(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.serviceflow_name = Some(name.into());
        self.serviceflow_id = Some(id.into());
        self
    }

    pub fn is_delete(&self) -> bool {
        self.operation_type == Some(OperationType::Delete)
    }

    pub fn encode(&self) -> BrokerResult<String> {
        Ok(TOKEN_ENGINE.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(token: &str) -> BrokerResult<Self> {
        let bytes = TOKEN_ENGINE
            .decode(token.trim())
            .map_err(|e| invalid(format!("not base64: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| invalid(format!("not a token document: {e}")))
    }
}

/// Decodes base64-wrapped JSON in either the standard or the URL-safe alphabet.
pub fn decode_base64_json<T: DeserializeOwned>(encoded: &str) -> BrokerResult<T> {
    let encoded = encoded.trim();
    let bytes = STANDARD
        .decode(encoded)
        .or_else(|_| TOKEN_ENGINE.decode(encoded))
        .map_err(|e| invalid(format!("not base64: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| invalid(format!("not json: {e}")))
}

fn invalid(message: String) -> BrokerError {
    BrokerError::InvalidToken { message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_token_is_url_safe_and_decodable() {
        let token = OperationToken::new(OperationType::Update).with_service_flow("blueprint", "f1");
        let encoded = token.encode().unwrap();
        assert!(!encoded.contains(['+', '/', '=']));
        assert_eq!(OperationToken::decode(&encoded).unwrap(), token);
    }

    #[test]
    fn test_padded_input_is_accepted() {
        // base64('{"type":"create"}') with padding
        let token = OperationToken::decode("eyJ0eXBlIjoiY3JlYXRlIn0=").unwrap();
        assert_eq!(token, OperationToken::new(OperationType::Create));
    }

    #[test]
    fn test_garbage_is_invalid_token() {
        assert_eq!(OperationToken::decode("%%%").unwrap_err().as_label(), "invalid_token");
        let not_json = TOKEN_ENGINE.encode("hello");
        assert_eq!(OperationToken::decode(&not_json).unwrap_err().as_label(), "invalid_token");
    }

    #[test]
    fn test_credentials_in_standard_alphabet() {
        let encoded = STANDARD.encode(r#"{"user":"u","password":"p?>"}"#);
        let creds: Value = decode_base64_json(&encoded).unwrap();
        assert_eq!(creds, json!({"user": "u", "password": "p?>"}));
    }
}
