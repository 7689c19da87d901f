// src/error.rs

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// 广告 Pod 校验与生成阶段的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PodError {
    /// pod 扩展 JSON 无法解析，整个请求失败
    #[error("malformed adpod extension on imp {imp_id}: {reason}")]
    MalformedExtension { imp_id: String, reason: String },

    #[error("invalid pod id '{pod_id}': must not contain '{separator}'")]
    InvalidPodId { pod_id: String, separator: &'static str },

    /// 单个 pod 的约束校验失败，不影响其它 pod
    #[error("{0}")]
    Constraint(String),

    #[error("unable to generate impressions for adpod {pod_id}")]
    ImpressionGeneration { pod_id: String },

    #[error("unable to generate adpod {pod_id}: {reason}")]
    Selection { pod_id: String, reason: String },
}

impl PodError {
    /// 响应扩展中使用的错误码
    pub fn code(&self) -> u32 {
        match self {
            PodError::MalformedExtension { .. } => 601,
            PodError::InvalidPodId { .. } => 602,
            PodError::Constraint(_) => 603,
            PodError::ImpressionGeneration { .. } => 604,
            PodError::Selection { .. } => 605,
        }
    }
}

/// 广告位 / 竞价参数解析错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("partner configuration missing for partner {partner_id}")]
    MissingPartnerConfig { partner_id: i32 },

    #[error("no valid VAST tag for slot {slot}: {reasons}")]
    InvalidVastTag { slot: String, reasons: String },
}

/// 配置存储访问错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read store file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse store data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{entity} not found for {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// 竞价执行器错误
#[derive(Error, Debug)]
pub enum AuctionError {
    #[error("auction cancelled: deadline of {deadline_ms}ms exceeded by every bidder")]
    Cancelled { deadline_ms: u64 },

    #[error("auction transport failure: {0}")]
    Transport(String),
}

/// 请求级错误，由 handler 转换为 HTTP 状态码
#[derive(Error, Debug)]
pub enum AdxError {
    #[error(transparent)]
    Pod(#[from] PodError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Auction(#[from] AuctionError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl AdxError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdxError::Pod(_) | AdxError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AdxError::Auction(AuctionError::Cancelled { .. }) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdxError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_bad_request() {
        let err = AdxError::from(PodError::MalformedExtension {
            imp_id: "imp1".to_string(),
            reason: "expected value".to_string(),
        });
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn cancelled_auction_maps_to_gateway_timeout() {
        let err = AdxError::from(AuctionError::Cancelled { deadline_ms: 200 });
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn store_errors_are_internal() {
        let err = AdxError::from(StoreError::Unavailable("down".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
