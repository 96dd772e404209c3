use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use tracing::{info, warn};

use common::{Error, Result};

use crate::document::{PolicyDocument, StrategyPolicy};

/// Read-only view of the strategy policies, refreshed from disk once per pass.
pub struct PolicyStore {
    path: Option<PathBuf>,
    current: RwLock<PolicyDocument>,
}

impl PolicyStore {
    /// Load the document at startup, retrying a fixed number of times.
    /// Exhausting the attempts is a startup fault.
    pub async fn load(path: impl Into<PathBuf>, attempts: u32, delay: Duration) -> Result<Self> {
        let path = path.into();
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match read_document(&path) {
                Ok(doc) => {
                    info!(
                        path = %path.display(),
                        strategies = doc.strategies.len(),
                        "Policy document loaded"
                    );
                    return Ok(Self {
                        path: Some(path),
                        current: RwLock::new(doc),
                    });
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        path = %path.display(),
                        attempt,
                        error = %e,
                        "Policy document unreadable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A fixed document with no backing file; `refresh` is a no-op.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(Self {
            path: None,
            current: RwLock::new(PolicyDocument::parse(content)?),
        })
    }

    /// Re-read the backing file. On failure the last good document stays
    /// in effect.
    pub fn refresh(&self) {
        let Some(path) = &self.path else {
            return;
        };
        match read_document(path) {
            Ok(doc) => {
                *self.current.write().unwrap_or_else(|p| p.into_inner()) = doc;
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Policy refresh failed, keeping last good document"
                );
            }
        }
    }

    pub fn policy(&self, strategy_id: &str) -> Result<Option<StrategyPolicy>> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .policy(strategy_id)
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .strategy_ids()
    }
}

fn read_document(path: &Path) -> Result<PolicyDocument> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read '{}': {e}", path.display())))?;
    PolicyDocument::parse(&content)
}
