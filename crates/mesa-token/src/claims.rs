use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};

use crate::TokenError;

/// Window before expiry inside which a credential should be proactively
/// renewed rather than used until it lapses mid-request.
const REFRESH_WINDOW: Duration = Duration::seconds(600);

/// The decoded payload of a credential: a plain string-keyed claim map with
/// typed accessors layered on top.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    fields: Map<String, Value>,
}

/// Decode the payload segment of a credential into its claim map.
///
/// Fails if the token does not have exactly three dot-separated segments or
/// the payload is not unpadded base64url wrapping a JSON object.
pub fn decode(credential: &str) -> Result<Claims, TokenError> {
    let mut segments = credential.split('.');
    let payload = match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => {
            return Err(TokenError::Malformed(
                "expected three dot-separated segments".into(),
            ))
        }
    };

    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|err| TokenError::Malformed(format!("payload is not base64url: {err}")))?;
    let value: Value = serde_json::from_slice(&raw)
        .map_err(|err| TokenError::Malformed(format!("payload is not JSON: {err}")))?;
    match value {
        Value::Object(fields) => Ok(Claims { fields }),
        _ => Err(TokenError::Malformed("payload is not a JSON object".into())),
    }
}

/// A credential is valid when it decodes and carries a numeric `exp` that is
/// still in the future. Every decode error folds to `false`.
pub fn is_valid(credential: &str) -> bool {
    match decode(credential) {
        Ok(claims) => match claims.expires_at() {
            Some(expires) => expires > OffsetDateTime::now_utc(),
            None => false,
        },
        Err(_) => false,
    }
}

/// Whether the credential should be swapped for a fresh one.
///
/// Conservatively `true` for anything that fails to decode or lacks a usable
/// `exp`: a corrupt credential gets refreshed instead of silently kept.
pub fn should_refresh(credential: &str) -> bool {
    let Ok(claims) = decode(credential) else {
        return true;
    };
    let Some(expires) = claims.expires_at() else {
        return true;
    };
    expires - OffsetDateTime::now_utc() < REFRESH_WINDOW
}

impl Claims {
    /// Raw access for callers that need a claim outside the typed accessors.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Display identity: first present of `username`, `sub`, `user`.
    pub fn identity(&self) -> Option<&str> {
        ["username", "sub", "user"]
            .iter()
            .find_map(|key| self.str_field(key))
    }

    /// Numeric identity: `user_id`, or `sub` when it parses as an integer.
    pub fn numeric_id(&self) -> Option<i64> {
        let parse = |value: &Value| {
            value
                .as_i64()
                .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()))
        };
        if let Some(value) = self.fields.get("user_id") {
            return parse(value);
        }
        self.fields.get("sub").and_then(parse)
    }

    /// Expiry instant from the `exp` claim; absent or ill-typed is `None`.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        let exp = self.fields.get("exp")?;
        let seconds = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
        OffsetDateTime::from_unix_timestamp(seconds).ok()
    }
}
