use core::fmt;
use core::panic::Location;
use std::error::Error as StdError;

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

pub struct HttpErrorBuilder {
    pub code: StatusCode,
    pub loc: &'static Location<'static>,
    pub kind: Option<&'static str>,
}

impl HttpErrorBuilder {
    #[inline]
    #[track_caller]
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            loc: Location::caller(),
            kind: None,
        }
    }

    #[inline]
    pub fn err<T: Into<Box<dyn StdError + Sync + Send + 'static>>>(self) -> impl FnOnce(T) -> HttpError {
        move |source| HttpError {
            code: self.code,
            loc: self.loc,
            kind: self.kind,
            headers: HeaderMap::new(),
            source: Some(source.into()),
        }
    }

    #[inline]
    pub fn with_kind(mut self, kind: &'static str) -> HttpErrorBuilder {
        self.kind = Some(kind);
        self
    }

    #[inline]
    pub fn kind(self, kind: &'static str) -> HttpError {
        HttpError {
            code: self.code,
            loc: self.loc,
            kind: Some(kind),
            headers: HeaderMap::new(),
            source: None,
        }
    }
}

/// An error mapped to one of the stable, user-facing error kinds.
///
/// The kind string is the only detail a client ever sees; the source chain is
/// logged when the response is produced.
pub struct HttpError {
    pub code: StatusCode,
    pub loc: &'static Location<'static>,
    pub kind: Option<&'static str>,
    pub headers: HeaderMap,
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
    pub fn bad_gateway() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::BAD_GATEWAY)
    }

    #[inline]
    #[track_caller]
    pub fn too_many_requests() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::TOO_MANY_REQUESTS)
    }

    #[inline]
    #[track_caller]
    pub fn service_unavailable() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::SERVICE_UNAVAILABLE)
    }

    pub fn with_header(mut self, name: axum::http::HeaderName, value: axum::http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn kind_str(&self) -> &'static str {
        self.kind.unwrap_or("internal_server_error")
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.code, self.loc)?;

        if let Some(kind) = self.kind {
            write!(f, ": {kind}")?;
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
        let body = Json(json!({ "error": self.kind_str() }));
        (self.code, self.headers, body).into_response()
    }
}
