//! Wire shapes of the detection exchange.

use serde::{Deserialize, Serialize};

use crate::pipeline::DetectionBox;

/// Opaque client token, echoed verbatim.
pub type RequestId = serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct InboundRequest {
    /// `null` is read as absent.
    #[serde(rename = "reqId", default)]
    pub request_id: Option<RequestId>,
    pub image: String,
}

impl InboundRequest {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Serialize)]
pub struct OutboundResponse<'a> {
    #[serde(rename = "reqId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<&'a RequestId>,
    pub results: &'a [DetectionBox],
}

/// Render the outbound message. `request_id` is emitted only when given.
pub fn encode(results: &[DetectionBox], request_id: Option<&RequestId>) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutboundResponse {
        request_id,
        results,
    })
}
