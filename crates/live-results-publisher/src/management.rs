//! Management API.
//!
//! Requests name an action and carry action-specific parameters:
//!
//! | Action          | Params                    | Result        |
//! |-----------------|---------------------------|---------------|
//! | `status.get`    | none                      | `WatchStatus` |
//! | `watch.start`   | `{"File": path}`          | null          |
//! | `watch.stop`    | none                      | null          |
//! | `target.add`    | `{"ServerAddress": addr}` | null          |
//! | `target.remove` | `{"ServerAddress": addr}` | null          |

use crate::distributor::{DistributorError, DistributorHandle};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// A management request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiRequest {
    /// Action name
    #[serde(default)]
    pub action: String,
    /// Action parameters
    #[serde(default)]
    pub params: Value,
}

/// A management response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiResponse {
    /// Whether the action succeeded
    pub success: bool,
    /// Failure description, empty on success
    pub error_message: String,
    /// Action result
    pub result: Value,
}

impl ApiResponse {
    fn from_result(result: Result<Value, ManagementError>) -> Self {
        match result {
            Ok(result) => Self {
                success: true,
                error_message: String::new(),
                result,
            },
            Err(err) => Self {
                success: false,
                error_message: err.to_string(),
                result: Value::Null,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartWatchParams {
    file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetParams {
    server_address: String,
}

/// Actions understood by [`dispatch`].
pub const ACTIONS: &[&str] = &[
    "status.get",
    "watch.start",
    "watch.stop",
    "target.add",
    "target.remove",
];

fn params<T: DeserializeOwned>(value: Value) -> Result<T, ManagementError> {
    if value.is_null() {
        return Err(ManagementError::MissingParams);
    }
    serde_json::from_value(value).map_err(|e| ManagementError::InvalidParams(e.to_string()))
}

/// Execute a request against the distributor.
pub async fn dispatch(distributor: &DistributorHandle, request: ApiRequest) -> ApiResponse {
    let result = match request.action.as_str() {
        "status.get" => distributor
            .status()
            .await
            .map_err(ManagementError::from)
            .and_then(|status| {
                serde_json::to_value(status).map_err(|e| ManagementError::Internal(e.to_string()))
            }),
        "watch.start" => match params::<StartWatchParams>(request.params) {
            Ok(p) => distributor
                .start_watch(p.file)
                .await
                .map(|()| Value::Null)
                .map_err(Into::into),
            Err(err) => Err(err),
        },
        "watch.stop" => distributor.stop_watch().await.map(|()| Value::Null).map_err(Into::into),
        "target.add" => match params::<TargetParams>(request.params) {
            Ok(p) => distributor
                .add_target(p.server_address)
                .await
                .map(|()| Value::Null)
                .map_err(Into::into),
            Err(err) => Err(err),
        },
        "target.remove" => match params::<TargetParams>(request.params) {
            Ok(p) => distributor
                .remove_target(p.server_address)
                .await
                .map(|()| Value::Null)
                .map_err(Into::into),
            Err(err) => Err(err),
        },
        "" => Err(ManagementError::NoAction),
        other => Err(ManagementError::UnknownAction(other.to_string())),
    };

    if let Err(err) = &result {
        tracing::info!(action = %request.action, error = %err, "Management request failed");
    }
    ApiResponse::from_result(result)
}

/// Execute one JSON-encoded request and return the JSON-encoded response.
pub async fn handle_line(distributor: &DistributorHandle, line: &str) -> String {
    let response = match serde_json::from_str::<ApiRequest>(line) {
        Ok(request) => dispatch(distributor, request).await,
        Err(err) => ApiResponse::from_result(Err(ManagementError::BadRequest(err.to_string()))),
    };
    serde_json::to_string(&response).unwrap_or_else(|err| {
        format!(r#"{{"Success":false,"ErrorMessage":"failed to encode response: {err}","Result":null}}"#)
    })
}

/// Errors reported through [`ApiResponse::error_message`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ManagementError {
    /// The request could not be parsed
    #[error("malformed request: {0}")]
    BadRequest(String),
    /// No action was given
    #[error("no action supplied")]
    NoAction,
    /// The action is not known
    #[error("action not recognised: '{0}'")]
    UnknownAction(String),
    /// The action needs parameters
    #[error("no request data supplied")]
    MissingParams,
    /// The parameters do not match the action
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    /// The distributor refused the action
    #[error(transparent)]
    Distributor(#[from] DistributorError),
    /// The result could not be encoded
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::distributor::{Distributor, DistributorConfig};
    use live_results_proto::{DialConfig, HandshakeConfig};
    use std::time::Duration;

    fn distributor() -> DistributorHandle {
        let config = DistributorConfig {
            connection: ConnectionConfig::new(DialConfig::new(HandshakeConfig::new("s3cret"))),
            poll_interval: Duration::from_millis(20),
            ..DistributorConfig::default()
        };
        Distributor::spawn(config).0
    }

    async fn call(handle: &DistributorHandle, line: &str) -> ApiResponse {
        serde_json::from_str(&handle_line(handle, line).await).unwrap()
    }

    #[tokio::test]
    async fn status_get_returns_status() {
        let handle = distributor();
        let response = call(&handle, r#"{"Action": "status.get"}"#).await;

        assert!(response.success);
        assert!(response.error_message.is_empty());
        assert_eq!(
            response.result,
            serde_json::json!({"WatchedFile": "", "ActiveWatch": false, "Targets": []})
        );
    }

    #[tokio::test]
    async fn unknown_and_missing_actions_fail() {
        let handle = distributor();

        let response = call(&handle, r#"{"Action": "results.delete"}"#).await;
        assert!(!response.success);
        assert_eq!(response.error_message, "action not recognised: 'results.delete'");

        let response = call(&handle, r#"{"Params": {}}"#).await;
        assert_eq!(response.error_message, "no action supplied");

        let response = call(&handle, "not json").await;
        assert!(response.error_message.starts_with("malformed request"));
    }

    #[tokio::test]
    async fn params_are_validated() {
        let handle = distributor();

        let response = call(&handle, r#"{"Action": "target.add"}"#).await;
        assert_eq!(response.error_message, "no request data supplied");

        let response = call(&handle, r#"{"Action": "watch.start", "Params": {"Path": "x"}}"#).await;
        assert!(response.error_message.starts_with("invalid parameters"));
    }

    #[tokio::test]
    async fn watch_start_and_stop() {
        let handle = distributor();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, r#"{"Title": "Sprint"}"#).unwrap();

        let request = serde_json::json!({"Action": "watch.start", "Params": {"File": path}});
        let response = call(&handle, &request.to_string()).await;
        assert!(response.success, "{}", response.error_message);

        let response = call(&handle, r#"{"Action": "status.get"}"#).await;
        assert_eq!(response.result["ActiveWatch"], true);

        let response = call(&handle, r#"{"Action": "watch.stop"}"#).await;
        assert!(response.success);

        let request = serde_json::json!({
            "Action": "watch.start",
            "Params": {"File": dir.path().join("missing.json")},
        });
        let response = call(&handle, &request.to_string()).await;
        assert!(!response.success);
        assert!(response.error_message.contains("not found"));
    }

    #[tokio::test]
    async fn target_remove_is_unconditional() {
        let handle = distributor();
        let response = call(
            &handle,
            r#"{"Action": "target.remove", "Params": {"ServerAddress": "results.example.org"}}"#,
        )
        .await;
        assert!(response.success);
        assert_eq!(response.result, Value::Null);
    }
}
