//! Transport selection.
//!
//! [`create_transport`] is a capability-checked factory: it builds the requested adapter and,
//! when the optional `reqwest` client cannot be built with the given options, logs a warning
//! and falls back to a default client instead of failing. Asking for `reqwest` in a build
//! without the `reqwest` feature is a synchronous configuration error.

use crate::client::{InterceptorClient, Transport};
use crate::error::RequestError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "reqwest")]
mod reqwest;

#[cfg(feature = "reqwest")]
pub use self::reqwest::ReqwestTransport;

/// Options for the `reqwest` adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReqwestOptions {
    /// Client-wide timeout.
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub user_agent: Option<String>,
    /// Headers sent with every request.
    pub default_headers: BTreeMap<String, String>,
}

/// Which adapter carries requests to the network.
#[derive(Clone)]
pub enum TransportKind {
    Reqwest(ReqwestOptions),
    Custom(Arc<dyn Transport>),
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::Reqwest(ReqwestOptions::default())
    }
}

impl std::fmt::Debug for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Reqwest(options) => f.debug_tuple("Reqwest").field(options).finish(),
            TransportKind::Custom(_) => f.write_str("Custom(<transport>)"),
        }
    }
}

/// Build the transport described by `kind`.
pub fn create_transport(kind: TransportKind) -> Result<Arc<dyn Transport>, RequestError> {
    match kind {
        TransportKind::Custom(transport) => Ok(transport),
        TransportKind::Reqwest(options) => reqwest_transport(&options),
    }
}

/// Build an [`InterceptorClient`] over the transport described by `kind`.
pub fn create_client(kind: TransportKind) -> Result<InterceptorClient, RequestError> {
    Ok(InterceptorClient::new(create_transport(kind)?))
}

#[cfg(feature = "reqwest")]
fn reqwest_transport(options: &ReqwestOptions) -> Result<Arc<dyn Transport>, RequestError> {
    match ReqwestTransport::from_options(options) {
        Ok(transport) => Ok(Arc::new(transport)),
        Err(err) => {
            tracing::warn!(error = %err, "configured reqwest client unavailable; falling back to default client");
            Ok(Arc::new(ReqwestTransport::new()?))
        }
    }
}

#[cfg(not(feature = "reqwest"))]
fn reqwest_transport(_options: &ReqwestOptions) -> Result<Arc<dyn Transport>, RequestError> {
    Err(RequestError::Configuration(
        "reqwest transport requested but the `reqwest` feature is disabled".to_string(),
    ))
}
