use eyre::{eyre, Result};
use serde::Deserialize;
use std::{fs, path::Path};

/// Bootstrap artifact: identifies this node and optionally seeds the
/// destinations document into the store at startup.
///
/// We intentionally keep this loose: extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapArtifact {
    pub database_id: String,

    /// Public URL of this node. Can also come from `--local-url` or the
    /// DOCRELAY_LOCAL_URL environment variable.
    #[serde(default)]
    pub local_url: Option<String>,

    /// Stored verbatim as `Raven/Replication/Destinations` when present.
    #[serde(default)]
    pub destinations: Option<serde_json::Value>,
}

impl BootstrapArtifact {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| eyre!("failed to read bootstrap artifact {}: {e}", path.display()))?;
        let artifact: BootstrapArtifact = serde_json::from_str(&raw).map_err(|e| {
            eyre!(
                "failed to parse bootstrap artifact {}: {e}",
                path.display()
            )
        })?;

        if artifact.database_id.trim().is_empty() {
            return Err(eyre!("bootstrap artifact databaseId is empty"));
        }
        if artifact.destinations.is_none() {
            tracing::warn!(
                "bootstrap artifact has no destinations; the keeper will idle until a destinations document is written"
            );
        }

        Ok(artifact)
    }
}
