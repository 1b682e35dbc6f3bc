use core::fmt;
use core::panic::Location;
use std::error::Error as StdError;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use shellhub_registry::RegistryError;

pub struct HttpErrorBuilder {
    pub code: StatusCode,
    pub loc: &'static Location<'static>,
    pub msg: Option<&'static str>,
}

impl HttpErrorBuilder {
    #[inline]
    #[track_caller]
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            loc: Location::caller(),
            msg: None,
        }
    }

    #[inline]
    pub fn err<T: Into<Box<dyn StdError + Sync + Send + 'static>>>(self) -> impl FnOnce(T) -> HttpError {
        move |source| HttpError {
            code: self.code,
            loc: self.loc,
            msg: self.msg,
            body: None,
            source: Some(source.into()),
        }
    }

    #[inline]
    pub fn msg(self, msg: &'static str) -> HttpError {
        HttpError {
            code: self.code,
            loc: self.loc,
            msg: Some(msg),
            body: None,
            source: None,
        }
    }
}

pub struct HttpError {
    pub code: StatusCode,
    pub loc: &'static Location<'static>,
    pub msg: Option<&'static str>,
    /// Structured payload sent back to the client.
    pub body: Option<serde_json::Value>,
    pub source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl HttpError {
    #[inline]
    #[track_caller]
    pub fn forbidden() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::FORBIDDEN)
    }

    #[inline]
    #[track_caller]
    pub fn not_found() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::NOT_FOUND)
    }

    #[inline]
    #[track_caller]
    pub fn unauthorized() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::UNAUTHORIZED)
    }

    #[inline]
    #[track_caller]
    pub fn internal() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::INTERNAL_SERVER_ERROR)
    }

    #[inline]
    #[track_caller]
    pub fn bad_request() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::BAD_REQUEST)
    }

    #[inline]
    #[track_caller]
    pub fn conflict() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::CONFLICT)
    }
}

/// Stable status mapping for registry failures.
impl From<RegistryError> for HttpError {
    #[track_caller]
    fn from(error: RegistryError) -> Self {
        let (code, body) = match &error {
            RegistryError::NotFound { id } => (StatusCode::NOT_FOUND, serde_json::json!({ "id": id })),
            RegistryError::Duplicated { fields } => (StatusCode::CONFLICT, serde_json::json!({ "fields": fields })),
            RegistryError::Limit { limit } => (StatusCode::FORBIDDEN, serde_json::json!({ "limit": limit })),
            RegistryError::Invalid { fields } => (StatusCode::BAD_REQUEST, serde_json::json!({ "fields": fields })),
            RegistryError::Unauthorized => (StatusCode::UNAUTHORIZED, serde_json::Value::Null),
            RegistryError::Forbidden | RegistryError::RoleInvalid => (StatusCode::FORBIDDEN, serde_json::Value::Null),
            RegistryError::Payment => (StatusCode::PAYMENT_REQUIRED, serde_json::Value::Null),
            RegistryError::StoreUnavailable => (StatusCode::SERVICE_UNAVAILABLE, serde_json::Value::Null),
            RegistryError::Unknown { .. } => (StatusCode::INTERNAL_SERVER_ERROR, serde_json::Value::Null),
        };

        HttpError {
            code,
            loc: Location::caller(),
            msg: None,
            body: Some(serde_json::json!({
                "error": error.to_string(),
                "data": body,
            })),
            source: Some(Box::new(error)),
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.code, self.loc)?;

        if let Some(msg) = self.msg {
            write!(f, ": {msg}")?;
        }

        if let Some(source) = self.source.as_deref() {
            write!(f, " [source: {source}")?;
            for cause in anyhow::Chain::new(source).skip(1) {
                write!(f, ", because {cause}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        error!(error = %self);

        match self.body {
            Some(body) => (self.code, Json(body)).into_response(),
            None => self.code.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_errors_map_to_stable_codes() {
        let cases: Vec<(RegistryError, StatusCode)> = vec![
            (RegistryError::not_found("x"), StatusCode::NOT_FOUND),
            (RegistryError::duplicated(["name"]), StatusCode::CONFLICT),
            (RegistryError::Limit { limit: 3 }, StatusCode::FORBIDDEN),
            (RegistryError::invalid("f", "v"), StatusCode::BAD_REQUEST),
            (RegistryError::Unauthorized, StatusCode::UNAUTHORIZED),
            (RegistryError::Forbidden, StatusCode::FORBIDDEN),
            (RegistryError::RoleInvalid, StatusCode::FORBIDDEN),
            (RegistryError::Payment, StatusCode::PAYMENT_REQUIRED),
            (RegistryError::StoreUnavailable, StatusCode::SERVICE_UNAVAILABLE),
            (RegistryError::unknown("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            assert_eq!(HttpError::from(error).code, expected);
        }
    }

    #[test]
    fn duplicated_body_carries_the_fields() {
        let error = HttpError::from(RegistryError::duplicated(["name"]));
        let body = error.body.expect("duplicated errors carry a body");
        assert_eq!(body["data"]["fields"][0], "name");
    }
}
