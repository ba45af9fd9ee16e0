//! Append-only log of failed requests.
//!
//! Every uncaught handler failure is appended as one structured JSON line
//! (timestamp, path, request body, error). `/log` returns the file to an
//! authenticated authority so operators can inspect a peer without shell
//! access to its host.

use chrono::Utc;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct FaultLog {
    path: String,
}

impl FaultLog {
    pub fn new(path: &str) -> Self {
        FaultLog {
            path: path.to_string(),
        }
    }

    pub async fn append(&self, request_path: &str, body: &str, error: &str) {
        let line = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "path": request_path,
            "body": body,
            "error": error,
        })
        .to_string();

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, path = %self.path, "failed to append to fault log");
        }
    }

    pub async fn read_all(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::Internal(format!("failed to read fault log: {e}"))),
        }
    }
}
