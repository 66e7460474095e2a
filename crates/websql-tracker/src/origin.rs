//! Security origin identity
//!
//! An origin is the (scheme, host, port) triple that partitions quota and
//! catalog entries. It is keyed by its canonical database identifier
//! `scheme_host_port`, with port 0 standing for the scheme's default port.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use url::Url;

use crate::error::TrackerError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Origin {
    identifier: Arc<str>,
}

impl Origin {
    pub fn new(scheme: &str, host: &str, port: Option<u16>) -> Self {
        let identifier = format!(
            "{}_{}_{}",
            scheme.to_ascii_lowercase(),
            host.to_ascii_lowercase(),
            port.unwrap_or(0)
        );
        Self {
            identifier: identifier.into(),
        }
    }

    /// Origin of a document URL. Default ports collapse to 0.
    pub fn from_url(url: &Url) -> Self {
        Self::new(url.scheme(), url.host_str().unwrap_or(""), url.port())
    }

    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| TrackerError::InvalidOrigin(e.to_string()))?;
        Ok(Self::from_url(&url))
    }

    /// Rebuild an origin from the identifier stored in the catalog.
    pub fn from_database_identifier(identifier: &str) -> Result<Self> {
        let invalid = || TrackerError::InvalidOrigin(identifier.to_string());

        let (scheme, rest) = identifier.split_once('_').ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once('_').ok_or_else(invalid)?;
        if scheme.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;

        Ok(Self::new(scheme, host, (port != 0).then_some(port)))
    }

    pub fn database_identifier(&self) -> &str {
        &self.identifier
    }

    pub fn scheme(&self) -> &str {
        self.identifier
            .split_once('_')
            .map(|(scheme, _)| scheme)
            .unwrap_or_default()
    }

    pub fn host(&self) -> &str {
        self.identifier
            .split_once('_')
            .and_then(|(_, rest)| rest.rsplit_once('_'))
            .map(|(host, _)| host)
            .unwrap_or_default()
    }

    /// Explicit port, or `None` for the scheme default.
    pub fn port(&self) -> Option<u16> {
        self.identifier
            .rsplit_once('_')
            .and_then(|(_, port)| port.parse().ok())
            .filter(|port| *port != 0)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}
