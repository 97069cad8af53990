//! RPC messages exchanged after the upgrade handshake.

use live_results_core::{Delta, Snapshot};
use serde::{Deserialize, Serialize};

/// An RPC call from publisher to results server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Call {
    /// Replace the server's results with a full snapshot
    SubmitLatestResults(Snapshot),
    /// Apply a delta to the server's current results
    SubmitDelta(Delta),
}

impl Call {
    /// RPC method name.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Call::SubmitLatestResults(_) => "SubmitLatestResults",
            Call::SubmitDelta(_) => "SubmitDelta",
        }
    }
}

/// An RPC request frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RpcRequest {
    /// Request identifier, echoed in the response
    pub id: u64,
    /// The call to perform
    pub call: Call,
}

/// Borrowed form of [`RpcRequest`] used for encoding without cloning the payload.
#[derive(Serialize)]
struct OutgoingRequest<'a> {
    id: u64,
    call: &'a Call,
}

impl RpcRequest {
    /// Serialize a request to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn encode(id: u64, call: &Call) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&OutgoingRequest { id, call }, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// An RPC response frame.
///
/// `reply` is the boolean result of the call. `error` is set instead when the
/// server could not execute the call at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Identifier of the request being answered
    pub id: u64,
    /// Call result
    pub reply: Option<bool>,
    /// Server-side failure description
    pub error: Option<String>,
}

impl RpcResponse {
    /// A successful response.
    #[must_use]
    pub fn reply(id: u64, reply: bool) -> Self {
        Self {
            id,
            reply: Some(reply),
            error: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn error(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            reply: None,
            error: Some(error.into()),
        }
    }

    /// Convert into the call result.
    ///
    /// # Errors
    ///
    /// Returns the server's error message, or a description of a malformed
    /// response carrying neither a reply nor an error.
    pub fn into_result(self) -> Result<bool, String> {
        match (self.reply, self.error) {
            (_, Some(error)) => Err(error),
            (Some(reply), None) => Ok(reply),
            (None, None) => Err("response carries neither reply nor error".to_string()),
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}
