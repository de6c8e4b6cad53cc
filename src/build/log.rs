use std::sync::Arc;

use uuid::Uuid;

use crate::db::BuildJobStore;

/// Appends progress lines to one build job's persisted log.
///
/// Log writes are best-effort: a failed append is traced and the build
/// carries on.
#[derive(Clone)]
pub struct BuildLog {
    store: Arc<dyn BuildJobStore>,
    build_id: Uuid,
}

impl BuildLog {
    pub fn new(store: Arc<dyn BuildJobStore>, build_id: Uuid) -> Self {
        Self { store, build_id }
    }

    pub fn build_id(&self) -> Uuid {
        self.build_id
    }

    pub fn store(&self) -> &Arc<dyn BuildJobStore> {
        &self.store
    }

    /// Append `msg` followed by a newline.
    pub async fn line(&self, msg: impl AsRef<str>) {
        self.append(&format!("{}\n", msg.as_ref())).await;
    }

    /// Append raw text.
    pub async fn append(&self, text: &str) {
        if let Err(e) = self.store.append_build_log(self.build_id, text).await {
            tracing::warn!(build_id = %self.build_id, error = %e, "Failed to append build log");
        }
    }

    /// The log accumulated so far.
    pub async fn contents(&self) -> String {
        match self.store.get_build_job(self.build_id).await {
            Ok(Some(job)) => job.logs,
            Ok(None) => String::new(),
            Err(e) => {
                tracing::warn!(build_id = %self.build_id, error = %e, "Failed to read build log");
                String::new()
            }
        }
    }
}
