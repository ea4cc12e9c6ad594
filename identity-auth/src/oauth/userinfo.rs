//! Maps provider-specific user claims onto one canonical identity.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{protocol_error, Error, ProtocolErrorKind};
use crate::providers::ProviderFamily;

/// Canonical identity of an authenticated user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedIdentity {
    pub provider_id: String,
    /// Provider-scoped subject identifier.
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub picture: Option<String>,
    pub email_verified: Option<bool>,
    /// Every claim the provider returned, unmodified.
    pub attributes: Map<String, Value>,
    /// The ID token's `exp`, when the identity came from one.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Claim names consulted, in order, for each canonical field.
struct ClaimMapping {
    subject: &'static [&'static str],
    email: &'static [&'static str],
    name: &'static [&'static str],
    first_name: &'static [&'static str],
    last_name: &'static [&'static str],
    picture: &'static [&'static str],
    email_verified: &'static [&'static str],
}

const GOOGLE: ClaimMapping = ClaimMapping {
    subject: &["sub", "id"],
    email: &["email"],
    name: &["name"],
    first_name: &["given_name"],
    last_name: &["family_name"],
    picture: &["picture"],
    email_verified: &["email_verified", "verified_email"],
};

const MICROSOFT: ClaimMapping = ClaimMapping {
    subject: &["id", "oid", "sub"],
    email: &["mail", "userPrincipalName", "email", "preferred_username"],
    name: &["displayName", "name"],
    first_name: &["givenName", "given_name"],
    last_name: &["surname", "family_name"],
    picture: &[],
    email_verified: &[],
};

const GITHUB: ClaimMapping = ClaimMapping {
    subject: &["id"],
    email: &["email"],
    name: &["name", "login"],
    first_name: &[],
    last_name: &[],
    picture: &["avatar_url"],
    email_verified: &[],
};

const GENERIC: ClaimMapping = ClaimMapping {
    subject: &["sub", "id", "user_id", "uid"],
    email: &["email", "mail", "emailAddress", "upn"],
    name: &["name", "displayName", "preferred_username", "login"],
    first_name: &["given_name", "givenName", "first_name", "firstName"],
    last_name: &["family_name", "surname", "last_name", "lastName"],
    picture: &["picture", "avatar_url", "avatar"],
    email_verified: &["email_verified", "verified_email", "verified"],
};

fn mapping_for(family: ProviderFamily) -> &'static ClaimMapping {
    match family {
        ProviderFamily::Google => &GOOGLE,
        ProviderFamily::Microsoft => &MICROSOFT,
        ProviderFamily::Github => &GITHUB,
        ProviderFamily::Generic => &GENERIC,
    }
}

/// Build a [`ValidatedIdentity`] from raw claims (ID token payload or userinfo
/// response). Fails only when no subject identifier can be found.
pub fn normalize(
    provider_id: &str,
    family: ProviderFamily,
    claims: Map<String, Value>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<ValidatedIdentity, Error> {
    let mapping = mapping_for(family);

    let subject = first_string(&claims, mapping.subject).ok_or_else(|| {
        protocol_error(
            ProtocolErrorKind::MissingField("sub"),
            &format!("{} user claims carry no subject identifier", family.as_str()),
        )
    })?;

    Ok(ValidatedIdentity {
        provider_id: provider_id.to_string(),
        subject,
        email: first_string(&claims, mapping.email),
        name: first_string(&claims, mapping.name),
        first_name: first_string(&claims, mapping.first_name),
        last_name: first_string(&claims, mapping.last_name),
        picture: first_string(&claims, mapping.picture),
        email_verified: first_bool(&claims, mapping.email_verified),
        attributes: claims,
        expires_at,
    })
}

/// First non-empty value among `keys`. Numeric identifiers are stringified.
fn first_string(claims: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match claims.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn first_bool(claims: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| match claims.get(*key)? {
        Value::Bool(b) => Some(*b),
        // Some providers send "true"/"false" strings.
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}
