use crate::error::Result;
use drover_core::model::Pipeline;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A request to execute a pipeline against concrete input files. Arrives
/// either through `Manager::enqueue` or as a JSON file dropped into the
/// queue spool directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub pipeline: Pipeline,
    pub inputs: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Drains the spool directory, oldest file first. Requests that fail to
/// parse are renamed aside with a `.bad` suffix rather than retried
/// forever.
pub fn drain_spool(queue_dir: &Path) -> Result<Vec<RunRequest>> {
    if !queue_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = fs_err::read_dir(queue_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut requests = Vec::new();
    for path in files {
        let content = fs_err::read_to_string(&path)?;
        match serde_json::from_str::<RunRequest>(&content) {
            Ok(request) => {
                tracing::info!(
                    "Queued run request '{}' from {}",
                    request.pipeline.name,
                    path.display()
                );
                fs_err::remove_file(&path)?;
                requests.push(request);
            }
            Err(e) => {
                tracing::warn!("Unparseable run request {}: {}", path.display(), e);
                let _ = fs_err::rename(&path, path.with_extension("json.bad"));
            }
        }
    }
    Ok(requests)
}
