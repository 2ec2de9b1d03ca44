//! `application/problem+json` error bodies returned by every handler.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use capigrid_core::validation::{FieldError, ValidationErrors};

const PROBLEM_JSON: &str = "application/problem+json";

#[derive(Debug, Serialize)]
struct ProblemBody {
    #[serde(rename = "type")]
    kind: &'static str,
    title: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<FieldError>,
}

/// An error response; `kind` is a stable machine-readable code.
#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemBody,
}

impl ProblemResponse {
    pub fn new(status: StatusCode, kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: ProblemBody {
                kind,
                title: status.canonical_reason().unwrap_or("Error"),
                detail: detail.into(),
                errors: Vec::new(),
            },
        }
    }

    /// 400 carrying every field problem found in the payload.
    pub fn validation(errors: ValidationErrors) -> Self {
        let mut problem = Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_payload",
            "request payload failed validation",
        );
        problem.body.errors = errors.errors;
        problem
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "Unauthorized")
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", detail)
    }

    pub fn not_found(kind: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, kind, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", detail)
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        (self.status, [(header::CONTENT_TYPE, PROBLEM_JSON)], Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::Value;

    async fn render(problem: ProblemResponse) -> (StatusCode, String, Value) {
        let response = problem.into_response();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        (status, content_type, serde_json::from_slice(&bytes).expect("json"))
    }

    #[tokio::test]
    async fn problems_use_the_problem_json_media_type() {
        let (status, content_type, body) =
            render(ProblemResponse::not_found("campaign_not_found", "Campaign not found")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(content_type, "application/problem+json");
        assert_eq!(body["type"], "campaign_not_found");
        assert_eq!(body["title"], "Not Found");
        assert_eq!(body["detail"], "Campaign not found");
        assert!(body.get("errors").is_none());
    }
}
