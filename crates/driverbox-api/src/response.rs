//! Response envelope and error mapping for the REST surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use driverbox_core::CoreError;
use driverbox_plugin::PluginError;
use linkedge_engine::LinkEdgeError;
use serde::Serialize;
use serde_json::Value;

/// `{success, errorCode, errorMsg, data}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub success: bool,
    pub error_code: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_msg: String,
    pub data: Value,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            error_code: StatusCode::OK.as_u16(),
            error_msg: String::new(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn error(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: status.as_u16(),
            error_msg: msg.into(),
            data: Value::Null,
        }
    }
}

pub type ApiResult = Result<Json<ApiResponse>, ApiError>;

/// Wrap a handler result in the success envelope
pub fn ok<T: Serialize>(data: T) -> ApiResult {
    Ok(Json(ApiResponse::success(data)))
}

/// An error rendered as `{success: false, ..}` with a 4xx or 5xx status
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("Request failed: {}", self.message);
        } else {
            tracing::debug!("Request rejected: {}", self.message);
        }
        (self.status, Json(ApiResponse::error(self.status, self.message))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::UnknownDevice(_)
            | CoreError::DeviceNotFound(_)
            | CoreError::ModelNotFound(_)
            | CoreError::PointNotFound { .. }
            | CoreError::ConnectionNotFound(_)
            | CoreError::PluginNotFound(_)
            | CoreError::ConflictModel { .. }
            | CoreError::InvalidConfig(_)
            | CoreError::InvalidPointValue { .. }
            | CoreError::InvalidSetting { .. }
            | CoreError::InvalidSchedule(_) => Self::bad_request(e.to_string()),
            CoreError::LoadCoreConfig(_)
            | CoreError::Write { .. }
            | CoreError::Export { .. }
            | CoreError::Io(_)
            | CoreError::Json(_) => Self::internal(e.to_string()),
        }
    }
}

impl From<PluginError> for ApiError {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::Core(core) => core.into(),
            PluginError::ConnectorNotFound(_)
            | PluginError::DeviceNotFound(_)
            | PluginError::PointNotFound { .. }
            | PluginError::PointNotWritable { .. }
            | PluginError::PointNotReadable { .. }
            | PluginError::PluginNotFound(_)
            | PluginError::InvalidConnection(_) => Self::bad_request(e.to_string()),
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<LinkEdgeError> for ApiError {
    fn from(e: LinkEdgeError) -> Self {
        match e {
            LinkEdgeError::Core(core) => core.into(),
            LinkEdgeError::Io(_) | LinkEdgeError::Json(_) => Self::internal(e.to_string()),
            _ => Self::bad_request(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::bad_request(format!("invalid request body: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let json = serde_json::to_value(ApiResponse::success(vec![1, 2])).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"success": true, "errorCode": 200, "data": [1, 2]})
        );

        let json =
            serde_json::to_value(ApiResponse::error(StatusCode::BAD_REQUEST, "id is required")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorCode"], 400);
        assert_eq!(json["errorMsg"], "id is required");
        assert!(json["data"].is_null());
    }

    #[test]
    fn test_error_kinds_map_to_status() {
        let status = |e: ApiError| e.status;
        assert_eq!(
            status(CoreError::DeviceNotFound("d".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(CoreError::LoadCoreConfig("x".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(PluginError::PointNotWritable {
                device: "d".into(),
                point: "p".into()
            }
            .into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(PluginError::ProtocolTimeout.into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(PluginError::Core(CoreError::UnknownDevice("d".into())).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(LinkEdgeError::ExecuteTooDeep(10).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(LinkEdgeError::Io(std::io::Error::other("disk")).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
