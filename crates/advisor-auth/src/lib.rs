//! Advisor Auth: identity tokens and RBAC
//!
//! `AuthTokenDecoder` turns the identity header into an `Identity`;
//! `RbacClient` decides whether a service account may use the advisor API.

pub mod rbac;
pub mod token;

pub use rbac::{
    access_urls, Acl, AccessPage, Filter, Grant, HttpPermissionFeed, PermissionFeed,
    PermissionIndex, RbacClient, RbacError, ResourceScope,
};
pub use token::{encode_identity, AuthTokenDecoder, AuthType, TokenError, IDENTITY_HEADER};
