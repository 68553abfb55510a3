//! Error taxonomy and localization
//!
//! Stable string codes exported to callers, with an English and a Chinese
//! message maintained per code. `verify_catalog` runs at startup and refuses
//! to proceed when any code lacks a translation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core-level failures.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("incomplete error catalog: {0}")]
    IncompleteCatalog(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Message locale. Unknown values fall back to English with a warning at the
/// configuration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Zh,
}

impl Locale {
    pub fn as_str(self) -> &'static str {
        match self {
            Locale::En => "en",
            Locale::Zh => "zh",
        }
    }

    pub const ALL: [Locale; 2] = [Locale::En, Locale::Zh];
}

/// Stable error codes surfaced to downstream applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Parameter / validation
    InvalidParameter,
    ValidationError,
    ResourceNotFound,
    // Database / store
    DatabaseError,
    DatabaseQueryError,
    DatabaseTimeout,
    // Network / external
    HttpTimeout,
    ExternalServiceError,
    ApiRateLimitExceeded,
    // LLM
    LlmCallFailed,
    LlmOutputParsingError,
    LlmRetryExhausted,
    // Queue
    QueueFull,
    DeliveryError,
    // Cache
    CacheOperationFailed,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 15] = [
        ErrorCode::InvalidParameter,
        ErrorCode::ValidationError,
        ErrorCode::ResourceNotFound,
        ErrorCode::DatabaseError,
        ErrorCode::DatabaseQueryError,
        ErrorCode::DatabaseTimeout,
        ErrorCode::HttpTimeout,
        ErrorCode::ExternalServiceError,
        ErrorCode::ApiRateLimitExceeded,
        ErrorCode::LlmCallFailed,
        ErrorCode::LlmOutputParsingError,
        ErrorCode::LlmRetryExhausted,
        ErrorCode::QueueFull,
        ErrorCode::DeliveryError,
        ErrorCode::CacheOperationFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::DatabaseQueryError => "DATABASE_QUERY_ERROR",
            ErrorCode::DatabaseTimeout => "DATABASE_TIMEOUT",
            ErrorCode::HttpTimeout => "HTTP_TIMEOUT",
            ErrorCode::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            ErrorCode::ApiRateLimitExceeded => "API_RATE_LIMIT_EXCEEDED",
            ErrorCode::LlmCallFailed => "LLM_CALL_FAILED",
            ErrorCode::LlmOutputParsingError => "LLM_OUTPUT_PARSING_ERROR",
            ErrorCode::LlmRetryExhausted => "LLM_RETRY_EXHAUSTED",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::DeliveryError => "DELIVERY_ERROR",
            ErrorCode::CacheOperationFailed => "CACHE_OPERATION_FAILED",
        }
    }

    /// Localized message for the code, or `None` when a translation is
    /// missing (the catalog check treats that as fatal).
    pub fn message(self, locale: Locale) -> Option<&'static str> {
        let msg = match (self, locale) {
            (ErrorCode::InvalidParameter, Locale::En) => "Invalid parameter",
            (ErrorCode::InvalidParameter, Locale::Zh) => "参数无效",
            (ErrorCode::ValidationError, Locale::En) => "Validation failed",
            (ErrorCode::ValidationError, Locale::Zh) => "校验失败",
            (ErrorCode::ResourceNotFound, Locale::En) => "Resource not found",
            (ErrorCode::ResourceNotFound, Locale::Zh) => "资源不存在",
            (ErrorCode::DatabaseError, Locale::En) => "Database error",
            (ErrorCode::DatabaseError, Locale::Zh) => "数据库错误",
            (ErrorCode::DatabaseQueryError, Locale::En) => "Database query failed",
            (ErrorCode::DatabaseQueryError, Locale::Zh) => "数据库查询失败",
            (ErrorCode::DatabaseTimeout, Locale::En) => "Database operation timed out",
            (ErrorCode::DatabaseTimeout, Locale::Zh) => "数据库操作超时",
            (ErrorCode::HttpTimeout, Locale::En) => "HTTP request timed out",
            (ErrorCode::HttpTimeout, Locale::Zh) => "HTTP 请求超时",
            (ErrorCode::ExternalServiceError, Locale::En) => "External service error",
            (ErrorCode::ExternalServiceError, Locale::Zh) => "外部服务错误",
            (ErrorCode::ApiRateLimitExceeded, Locale::En) => "API rate limit exceeded",
            (ErrorCode::ApiRateLimitExceeded, Locale::Zh) => "API 调用频率超限",
            (ErrorCode::LlmCallFailed, Locale::En) => "LLM call failed",
            (ErrorCode::LlmCallFailed, Locale::Zh) => "LLM 调用失败",
            (ErrorCode::LlmOutputParsingError, Locale::En) => "Failed to parse LLM output",
            (ErrorCode::LlmOutputParsingError, Locale::Zh) => "LLM 输出解析失败",
            (ErrorCode::LlmRetryExhausted, Locale::En) => "LLM retries exhausted",
            (ErrorCode::LlmRetryExhausted, Locale::Zh) => "LLM 重试次数耗尽",
            (ErrorCode::QueueFull, Locale::En) => "Queue is full",
            (ErrorCode::QueueFull, Locale::Zh) => "队列已满",
            (ErrorCode::DeliveryError, Locale::En) => "Message delivery failed",
            (ErrorCode::DeliveryError, Locale::Zh) => "消息投递失败",
            (ErrorCode::CacheOperationFailed, Locale::En) => "Cache operation failed",
            (ErrorCode::CacheOperationFailed, Locale::Zh) => "缓存操作失败",
        };
        Some(msg)
    }
}

/// Verify that every error code has a message in every locale. Called once
/// at startup; any gap refuses the start (fail-fast).
pub fn verify_catalog() -> Result<(), CoreError> {
    for code in ErrorCode::ALL {
        for locale in Locale::ALL {
            if code.message(locale).is_none() {
                return Err(CoreError::IncompleteCatalog(format!(
                    "missing {} message for {}",
                    locale.as_str(),
                    code.as_str()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_complete() {
        verify_catalog().unwrap();
    }

    #[test]
    fn codes_serialize_as_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::LlmRetryExhausted).unwrap();
        assert_eq!(json, "\"LLM_RETRY_EXHAUSTED\"");
        assert_eq!(ErrorCode::QueueFull.as_str(), "QUEUE_FULL");
    }

    #[test]
    fn every_code_has_both_translations() {
        for code in ErrorCode::ALL {
            assert!(code.message(Locale::En).is_some());
            assert!(code.message(Locale::Zh).is_some());
        }
    }
}
