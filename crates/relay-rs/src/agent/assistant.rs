//! Remote assistant profile, cached on disk.
//!
//! The assistant id lives in `<saved>/assistant.json` next to the
//! instructions and model it was created with. When either changes the old
//! profile is deleted (best effort) and a fresh one is created and cached.

use crate::ToolDef;
use crate::api::retry::{RetryConfig, retry_remote};
use crate::api::service::{AssistantSpec, RunService};
use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AssistantRecord {
    pub id: String,
    pub instructions: String,
    pub model: String,
}

impl AssistantRecord {
    fn matches(&self, instructions: &str, model: &str) -> bool {
        self.instructions == instructions && self.model == model
    }
}

pub struct AssistantProfile {
    path: PathBuf,
    name: String,
    model: String,
    instructions: String,
    cached: Mutex<Option<AssistantRecord>>,
}

impl AssistantProfile {
    pub fn new(
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        model: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            model: model.into(),
            instructions: instructions.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    /// Return the id of an assistant matching the current instructions and
    /// model, creating one if needed. Concurrent callers share one creation.
    pub async fn ensure(
        &self,
        service: &dyn RunService,
        tools: &[ToolDef],
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<String, RelayError> {
        let mut cached = self.cached.lock().await;
        if let Some(record) = cached.as_ref()
            && record.matches(&self.instructions, &self.model)
        {
            return Ok(record.id.clone());
        }

        let stale = match self.read_record().await {
            Some(record) if record.matches(&self.instructions, &self.model) => {
                debug!("Reusing cached assistant {}", record.id);
                let id = record.id.clone();
                *cached = Some(record);
                return Ok(id);
            }
            other => other,
        };

        if let Some(old) = stale {
            info!("Assistant instructions or model changed; replacing {}", old.id);
            if let Err(e) = service.delete_assistant(&old.id).await {
                warn!("Failed to delete stale assistant {}: {e}", old.id);
            }
        }

        let spec = AssistantSpec {
            name: self.name.clone(),
            model: self.model.clone(),
            instructions: self.instructions.clone(),
            tools: tools.to_vec(),
        };
        let id = retry_remote(retry, cancel, "create assistant", || {
            service.create_assistant(&spec)
        })
        .await?;
        info!("Created assistant {id} ({})", self.model);

        let record = AssistantRecord {
            id: id.clone(),
            instructions: self.instructions.clone(),
            model: self.model.clone(),
        };
        if let Err(e) = self.write_record(&record).await {
            warn!("Failed to cache assistant id at {}: {e}", self.path.display());
        }
        *cached = Some(record);
        Ok(id)
    }

    async fn read_record(&self) -> Option<AssistantRecord> {
        let json = tokio::fs::read_to_string(&self.path).await.ok()?;
        match serde_json::from_str(&json) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring malformed {}: {e}", self.path.display());
                None
            }
        }
    }

    async fn write_record(&self, record: &AssistantRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}
