//! Bearer identity tokens (HS256 JWT) and the axum extractors that read them.

use crate::{ApiError, ServiceState};
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use swiftcause_core::{Caller, Role};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: usize,
}

impl Claims {
    pub fn into_caller(self) -> Caller {
        let role = self.role.as_deref().and_then(|value| match Role::parse(value) {
            Ok(role) => Some(role),
            Err(err) => {
                tracing::warn!(uid = %self.sub, error = %err, "ignoring unknown role claim");
                None
            }
        });
        Caller {
            uid: self.sub,
            email: self.email,
            organization_id: self.org_id,
            role,
        }
    }
}

#[derive(Clone)]
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl AuthKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(&self, claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        decode::<Claims>(token, &self.decoding, &validation).map(|data| data.claims)
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn caller_from_token(state: &ServiceState, token: &str) -> Result<Caller, ApiError> {
    state
        .auth
        .verify(token)
        .map(Claims::into_caller)
        .map_err(|err| {
            tracing::debug!(error = %err, "bearer token rejected");
            ApiError::unauthorized("invalid bearer token")
        })
}

/// Authenticated caller. Missing or invalid tokens are answered with 401.
#[derive(Debug, Clone)]
pub struct AuthenticatedCaller(pub Caller);

#[axum::async_trait]
impl FromRequestParts<ServiceState> for AuthenticatedCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServiceState,
    ) -> Result<Self, Self::Rejection> {
        let token =
            bearer_token(parts).ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        caller_from_token(state, token).map(Self)
    }
}

/// Caller when a token is present; a present but invalid token is still a 401.
#[derive(Debug, Clone)]
pub struct MaybeCaller(pub Option<Caller>);

#[axum::async_trait]
impl FromRequestParts<ServiceState> for MaybeCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServiceState,
    ) -> Result<Self, Self::Rejection> {
        match bearer_token(parts) {
            Some(token) => caller_from_token(state, token).map(|caller| Self(Some(caller))),
            None => Ok(Self(None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(exp: usize) -> Claims {
        Claims {
            sub: "uid-1".to_string(),
            email: Some("ops@example.org".to_string()),
            org_id: Some("org-1".to_string()),
            role: Some("admin".to_string()),
            exp,
        }
    }

    fn future_exp() -> usize {
        (chrono::Utc::now().timestamp() + 3_600) as usize
    }

    #[test]
    fn issued_tokens_verify_into_callers() {
        let keys = AuthKeys::new("jwt-secret");
        let token = keys.issue(&claims(future_exp())).unwrap();
        let caller = keys.verify(&token).unwrap().into_caller();
        assert_eq!(caller.uid, "uid-1");
        assert_eq!(caller.organization_id.as_deref(), Some("org-1"));
        assert_eq!(caller.role, Some(Role::Admin));
    }

    #[test]
    fn rejects_expired_and_foreign_tokens() {
        let keys = AuthKeys::new("jwt-secret");
        let expired = keys.issue(&claims(1_000)).unwrap();
        assert!(keys.verify(&expired).is_err());

        let foreign = AuthKeys::new("other").issue(&claims(future_exp())).unwrap();
        assert!(keys.verify(&foreign).is_err());
    }

    #[test]
    fn unknown_role_claim_is_dropped() {
        let mut claims = claims(future_exp());
        claims.role = Some("wizard".to_string());
        assert_eq!(claims.into_caller().role, None);
    }
}
