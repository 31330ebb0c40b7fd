use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::Result;

/// Inference results kept as one JSON file per task.
#[derive(Clone, Debug)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Writes the result and returns its reference. Write-then-rename so a
    /// crash never leaves a half-written file behind a valid reference.
    pub async fn write(&self, task_id: Uuid, result: &serde_json::Value) -> Result<String> {
        let tmp = self.dir.join(format!("tmp_{task_id}.json"));
        let path = self.dir.join(format!("{task_id}.json"));
        let bytes = serde_json::to_vec_pretty(result)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    pub async fn read(&self, result_ref: &str) -> Result<serde_json::Value> {
        let bytes = tokio::fs::read(Path::new(result_ref)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn remove(&self, result_ref: &str) -> Result<()> {
        let path = Path::new(result_ref);
        // Only ever delete what this store wrote.
        if path.starts_with(&self.dir) {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
