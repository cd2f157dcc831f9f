//! Protocol client seam
//!
//! The bridge does not interpret protocol traffic. Whatever speaks the
//! protocol is created from a connected `DuplexHandle` and only ever
//! started and stopped by the connection manager.

use crate::connection::DuplexHandle;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lsp_bridge_shared::defaults;
use std::fmt;
use std::str::FromStr;

/// Document-matching criterion handed to the protocol client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSelector {
    pub scheme: Option<String>,
    pub language: Option<String>,
}

impl DocumentSelector {
    pub fn new(scheme: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            scheme: Some(scheme.into()),
            language: Some(language.into()),
        }
    }
}

/// Parses `scheme:language`, `scheme:` or a bare `language`
impl FromStr for DocumentSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let non_empty = |part: &str| {
            let part = part.trim();
            (!part.is_empty()).then(|| part.to_string())
        };

        let (scheme, language) = match s.split_once(':') {
            Some((scheme, language)) => (non_empty(scheme), non_empty(language)),
            None => (None, non_empty(s)),
        };

        if scheme.is_none() && language.is_none() {
            return Err(anyhow!("empty document selector {:?}", s));
        }
        Ok(Self { scheme, language })
    }
}

impl fmt::Display for DocumentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.scheme.as_deref().unwrap_or("*"),
            self.language.as_deref().unwrap_or("*")
        )
    }
}

/// Options passed through untouched to every protocol client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub selectors: Vec<DocumentSelector>,
    /// File-watch glob the client should synchronise
    pub watch_pattern: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            selectors: vec![DocumentSelector::new(
                defaults::SELECTOR_SCHEME,
                defaults::SELECTOR_LANGUAGE,
            )],
            watch_pattern: defaults::WATCH_PATTERN.into(),
        }
    }
}

/// A started-or-startable protocol client bound to one connection
#[async_trait]
pub trait ProtocolClient: Send {
    async fn start(&mut self) -> Result<()>;

    /// Stop the client; must tolerate being called on a client that never started
    async fn stop(&mut self) -> Result<()>;
}

/// Builds a protocol client for each successful connection
pub trait ProtocolClientFactory: Send + Sync + 'static {
    fn create(
        &self,
        stream: DuplexHandle,
        options: &ClientOptions,
    ) -> Result<Box<dyn ProtocolClient>>;
}
