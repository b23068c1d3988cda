//! Shared client library for content hub API types and HTTP clients.
//!
//! This library provides the wire-level type definitions and HTTP client
//! implementation for the authoring APIs of the content hub. Types are always
//! available, while HTTP client code is gated behind the `client` feature.
//!
//! ## Use of `#[non_exhaustive]`
//!
//! We use `#[non_exhaustive]` on structs and enums to prevent users manually
//! constructing the types while still allowing their fields to be `pub` for
//! reading. The intention here is that users must generally construct the types
//! either by:
//! - Using constructors on the types
//! - Using builder methods
//! - Using deserialization

use std::{fmt, str::FromStr};

use color_eyre::eyre::bail;
use http::header::{self, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tap::Pipe;

pub mod hub;

/// Request header naming the tenant the call is scoped to.
pub const TENANT_ID_HEADER: &str = "x-ibm-dx-tenant-id";

/// Option key naming the tenant API endpoint.
///
/// This is not a request header: the base URL already addresses the tenant.
/// The name is shared with the configuration layer so that both sides agree
/// on the spelling.
pub const TENANT_BASE_URL_KEY: &str = "x-ibm-dx-tenant-base-url";

/// An authentication token for API access.
///
/// This type wraps a token string and ensures it is never accidentally leaked
/// in logs or debug output. To access the actual token value, use the
/// `expose()` method.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Expose the raw token value.
    ///
    /// This method must be called explicitly to access the token string,
    /// preventing accidental exposure in logs or debug output.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl FromStr for Token {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("token cannot be empty");
        }
        String::from(s).pipe(Self).pipe(Ok)
    }
}

impl<S: Into<String>> From<S> for Token {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

/// The default buffer size used when streaming resource binaries.
///
/// Asset binaries routinely run to tens of megabytes, so we stream them in
/// reasonably large chunks rather than buffering whole files.
pub const NETWORK_BUFFER_SIZE: usize = 64 * 1024;

/// The default buffer size for static local buffers, e.g. when hashing files.
pub const LOCAL_BUFFER_SIZE: usize = 16 * 1024;

/// The latest hub client version.
#[cfg(feature = "client")]
pub type Hub = hub::v1::Client;

/// Hub v1 client.
#[cfg(feature = "client")]
pub type HubV1 = hub::v1::Client;

/// Content types used by the library.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ContentType {
    Bytes,
    Json,
}

impl ContentType {
    pub const HEADER: HeaderName = header::CONTENT_TYPE;
    pub const ACCEPT: HeaderName = header::ACCEPT;

    pub const fn to_str(&self) -> &'static str {
        match self {
            ContentType::Bytes => "application/octet-stream",
            ContentType::Json => "application/json",
        }
    }

    pub const fn value(&self) -> HeaderValue {
        HeaderValue::from_static(self.to_str())
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}
