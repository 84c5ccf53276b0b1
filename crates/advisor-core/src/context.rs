//! Request Context: caller identity attached by the auth middleware
use serde::{Deserialize, Serialize};

use crate::data_model::{OrgId, UserId};

/// Identity decoded from the inbound token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub org_id: OrgId,
    pub user_id: UserId,
    /// Account number, empty for anemic tenants
    pub account_number: String,
    /// Account type (`User`, `ServiceAccount`, ...)
    pub account_type: String,
}

impl Identity {
    pub fn new(org_id: OrgId, user_id: UserId) -> Self {
        Self {
            org_id,
            user_id,
            account_number: String::new(),
            account_type: "User".to_string(),
        }
    }

    pub fn with_account_number(mut self, account_number: impl Into<String>) -> Self {
        self.account_number = account_number.into();
        self
    }

    pub fn with_account_type(mut self, account_type: impl Into<String>) -> Self {
        self.account_type = account_type.into();
        self
    }

    pub fn is_service_account(&self) -> bool {
        self.account_type == "ServiceAccount"
    }

    /// Tenants without an account number are still served
    pub fn is_anemic(&self) -> bool {
        self.account_number.is_empty() || self.account_number == "0"
    }
}

/// Per-request state shared by handlers
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: Identity,
    /// Raw identity header, forwarded verbatim to RBAC
    pub raw_token: String,
    pub trace_id: String,
}

impl RequestContext {
    pub fn new(identity: Identity, raw_token: impl Into<String>) -> Self {
        Self {
            identity,
            raw_token: raw_token.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn org_id(&self) -> OrgId {
        self.identity.org_id
    }
}
