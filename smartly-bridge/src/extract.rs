use std::net::IpAddr;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::http::HttpError;

/// Identity the auth middleware attaches to a request once it clears the
/// verification chain.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub client_id: String,
    pub source_ip: IpAddr,
}

impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ClientIdentity>()
            .cloned()
            .ok_or_else(|| HttpError::internal().kind("internal_server_error"))
    }
}
