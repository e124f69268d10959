//! `obs-http` is the authenticated request layer for the Open Build Service
//! HTTP+XML API.
//!
//! [`ObsClient::request`] turns one logical API call into HTTP traffic:
//! - Basic or SSH `Signature` authentication, renegotiated on `401`
//! - session cookies persisted in a Netscape cookie-jar file
//! - exponential backoff on 500/502/503/504 and per-attempt timeouts
//!
//! Response bodies are returned raw; mapping the XML onto domain records is
//! left to the caller.

mod auth;
mod client;
mod config;
mod cookies;
mod error;
mod options;
mod request;
mod wire;

pub use auth::{negotiate, AuthMaterial, SshKeygenSigner, SshSigner, DEFAULT_REALM};
pub use client::{ObsClient, PUBLIC_PREFIX};
pub use config::{
    default_cookie_jar, ClientConfig, Credentials, DEFAULT_API_URL, ENV_API_URL, ENV_PASSWORD,
    ENV_SSH_KEY, ENV_USER,
};
pub use cookies::{Cookie, CookieStore};
pub use error::ObsError;
pub use options::{BackOff, ClientOptions};
pub use request::{ApiRequest, ApiResponse, ParamValue, Payload};
pub use reqwest::{Method, StatusCode};
pub use wire::{Challenge, SetCookie};

pub type Result<T> = std::result::Result<T, ObsError>;
