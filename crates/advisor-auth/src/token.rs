//! Identity token decoding
//!
//! The `x-rh-identity` header carries base64 (standard alphabet) encoded
//! JSON of the form `{"identity": {...}}`.

use advisor_core::{AdvisorError, Identity, OrgId, UserId};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, error, info};

/// Header carrying the identity token
pub const IDENTITY_HEADER: &str = "x-rh-identity";

const MISSING_TOKEN: &str = "Missing auth token";
const MALFORMED_TOKEN: &str = "Malformed authentication token";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Missing auth token")]
    MissingToken,

    #[error("Malformed authentication token")]
    MalformedToken,

    #[error("unknown auth type: {0}")]
    UnsupportedAuthType(String),

    #[error("error retrieving requester org_id from token. account_number [{account_number}], user_id [{user_id}]")]
    MissingOrgId {
        account_number: String,
        user_id: String,
    },
}

impl From<TokenError> for AdvisorError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::UnsupportedAuthType(_) => AdvisorError::Internal(err.to_string()),
            other => AdvisorError::Authentication(other.to_string()),
        }
    }
}

/// Supported authentication modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    Xrh,
}

impl FromStr for AuthType {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xrh" => Ok(AuthType::Xrh),
            other => Err(TokenError::UnsupportedAuthType(other.to_string())),
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthType::Xrh => f.write_str("xrh"),
        }
    }
}

/// Org id claim, sent either as a number or as a string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OrgIdClaim {
    Number(u32),
    Text(String),
}

impl OrgIdClaim {
    /// `None` for an empty claim; text that is not a number is malformed
    fn to_org_id(&self) -> Result<Option<OrgId>, TokenError> {
        match self {
            OrgIdClaim::Number(n) => Ok(Some(OrgId(*n))),
            OrgIdClaim::Text(s) if s.is_empty() => Ok(None),
            OrgIdClaim::Text(s) => s.parse().map(|n| Some(OrgId(n))).map_err(|_| {
                error!(org_id = %s, "{}: org_id is not a number", MALFORMED_TOKEN);
                TokenError::MalformedToken
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct XrhToken {
    identity: XrhIdentity,
}

#[derive(Debug, Deserialize)]
struct XrhIdentity {
    #[serde(default)]
    account_number: String,
    #[serde(default)]
    org_id: Option<OrgIdClaim>,
    #[serde(default)]
    internal: Option<XrhInternal>,
    #[serde(default)]
    user: Option<XrhUser>,
    #[serde(default, rename = "type")]
    account_type: String,
}

#[derive(Debug, Deserialize)]
struct XrhInternal {
    #[serde(default)]
    org_id: Option<OrgIdClaim>,
}

#[derive(Debug, Deserialize)]
struct XrhUser {
    #[serde(default)]
    user_id: String,
}

impl XrhIdentity {
    /// Current tokens carry `org_id` at the top level, legacy ones under `internal`
    fn org_id(&self) -> Result<OrgId, TokenError> {
        let current = match &self.org_id {
            Some(claim) => claim.to_org_id()?,
            None => None,
        };
        if let Some(org_id) = current.filter(|id| id.0 != 0) {
            return Ok(org_id);
        }
        let legacy = match self.internal.as_ref().and_then(|i| i.org_id.as_ref()) {
            Some(claim) => claim.to_org_id()?,
            None => None,
        };
        Ok(legacy.unwrap_or_default())
    }
}

/// Decodes identity tokens into an `Identity`
#[derive(Debug, Clone, Default)]
pub struct AuthTokenDecoder {
    auth_type: AuthType,
    log_token: bool,
}

impl AuthTokenDecoder {
    pub fn new(auth_type: AuthType) -> Self {
        Self {
            auth_type,
            log_token: false,
        }
    }

    /// Build from the configured mode name; anything but `xrh` is rejected
    pub fn from_config(auth_type: &str, log_token: bool) -> Result<Self, TokenError> {
        Ok(Self {
            auth_type: auth_type.parse()?,
            log_token,
        })
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    /// Decode a raw header value
    pub fn decode(&self, header: Option<&str>) -> Result<Identity, TokenError> {
        let raw = match header.map(str::trim) {
            Some(raw) if !raw.is_empty() => raw,
            _ => {
                error!("{}", MISSING_TOKEN);
                return Err(TokenError::MissingToken);
            }
        };
        if self.log_token {
            debug!(token = raw, "decoding identity token");
        }

        let decoded = STANDARD.decode(raw).map_err(|e| {
            error!(error = %e, "{}", MALFORMED_TOKEN);
            TokenError::MalformedToken
        })?;

        let token: XrhToken = match self.auth_type {
            AuthType::Xrh => serde_json::from_slice(&decoded).map_err(|e| {
                error!(error = %e, "{}", MALFORMED_TOKEN);
                TokenError::MalformedToken
            })?,
        };

        self.normalize(token.identity)
    }

    fn normalize(&self, identity: XrhIdentity) -> Result<Identity, TokenError> {
        let org_id = identity.org_id()?;
        let user_id = identity
            .user
            .as_ref()
            .map(|u| u.user_id.clone())
            .filter(|id| !id.is_empty())
            .map(UserId::new)
            .unwrap_or_default();

        if identity.account_number.is_empty() || identity.account_number == "0" {
            info!(org_id = %org_id, user_id = %user_id, "anemic tenant found");
        }

        if org_id.0 == 0 {
            let err = TokenError::MissingOrgId {
                account_number: identity.account_number.clone(),
                user_id: user_id.to_string(),
            };
            error!("{}", err);
            return Err(err);
        }

        let mut decoded = Identity::new(org_id, user_id)
            .with_account_number(identity.account_number);
        if !identity.account_type.is_empty() {
            decoded = decoded.with_account_type(identity.account_type);
        }
        Ok(decoded)
    }
}

/// Encode an identity the way the upstream gateway does; used by tests and tooling
pub fn encode_identity(value: &serde_json::Value) -> String {
    STANDARD.encode(value.to_string())
}
