//! Reading identity claims out of an id_token.
//!
//! Claims are only read, never validated: signature checks belong to the
//! identity backend.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdClaims {
    pub oid: Option<String>,
    pub tid: Option<String>,
    pub sub: Option<String>,
    pub preferred_username: Option<String>,
    pub upn: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl IdClaims {
    /// Account id in the `{oid}.{tid}` home-account form, falling back to `sub`.
    pub fn account_id(&self) -> Option<String> {
        match (&self.oid, &self.tid) {
            (Some(oid), Some(tid)) => Some(format!("{}.{}", oid, tid)),
            (Some(oid), None) => Some(oid.clone()),
            _ => self.sub.clone(),
        }
    }

    pub fn username(&self) -> Option<String> {
        self.preferred_username
            .clone()
            .or_else(|| self.upn.clone())
            .or_else(|| self.email.clone())
            .or_else(|| self.name.clone())
    }
}

/// Decode the payload segment of a JWT. Returns `None` for anything that
/// is not a three-part token with a JSON payload.
pub fn decode_unverified(jwt: &str) -> Option<IdClaims> {
    let mut parts = jwt.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
pub(crate) fn encode_unsigned(payload: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.sig", header, body)
}
