//! Viewer identity, derived from the opaque bearer credential the relay
//! issues on join.
//!
//! The credential is a JWT whose `sub` claim names the visitor. The client
//! never verifies the signature (the relay does); it only splits the token
//! and decodes the claims payload, exactly enough to know its own identity.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

use crate::session::SessionError;

#[derive(Debug, Clone)]
pub struct VisitorIdentity {
    pub visitor_id: String,
    pub token: String,
}

impl VisitorIdentity {
    pub fn from_token(token: &str) -> Result<Self, SessionError> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| SessionError::InvalidCredential("credential is not a JWT".into()))?;
        let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|err| {
            SessionError::InvalidCredential(format!("claims payload is not base64url: {err}"))
        })?;
        let claims: Value = serde_json::from_slice(&bytes).map_err(|err| {
            SessionError::InvalidCredential(format!("claims payload is not JSON: {err}"))
        })?;
        let visitor_id = claims
            .get("sub")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::InvalidCredential("missing sub claim".into()))?
            .to_string();
        Ok(Self {
            visitor_id,
            token: token.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) fn unsigned_token(visitor_id: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&serde_json::json!({ "sub": visitor_id }))
            .expect("serialize claims"),
    );
    format!("{header}.{claims}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_visitor_id_from_sub_claim() {
        let token = unsigned_token("v-42");
        let identity = VisitorIdentity::from_token(&token).expect("identity");
        assert_eq!(identity.visitor_id, "v-42");
        assert_eq!(identity.token, token);
    }

    #[test]
    fn rejects_token_without_claims() {
        assert!(VisitorIdentity::from_token("garbage").is_err());
        assert!(VisitorIdentity::from_token("a.!!!.c").is_err());
    }
}
