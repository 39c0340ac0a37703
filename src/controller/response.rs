use serde_json::{json, Map, Value};

/// Protocol-level answer to a lifecycle verb.
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerResponse {
    pub status: u16,
    pub body: Value,
}

impl BrokerResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn created(body: Map<String, Value>) -> Self {
        Self::new(201, Value::Object(body))
    }

    pub fn ok(body: Map<String, Value>) -> Self {
        Self::new(200, Value::Object(body))
    }

    pub fn accepted(body: Map<String, Value>) -> Self {
        Self::new(202, Value::Object(body))
    }

    pub fn conflict() -> Self {
        Self::new(409, json!({}))
    }

    pub fn gone() -> Self {
        Self::new(410, json!({}))
    }

    pub fn is_accepted(&self) -> bool {
        self.status == 202
    }

    /// Encoded operation token carried by an accepted response.
    pub fn operation(&self) -> Option<&str> {
        self.body.get("operation").and_then(Value::as_str)
    }
}
