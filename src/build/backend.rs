use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::build::log::BuildLog;
use crate::error::BuildError;
use crate::tools::DockerConfig;

/// One queued image build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub build_id: Uuid,
    /// `<category>/<tool id>`; builds for the same tool are serialised on it.
    pub tool_id: String,
    pub docker: DockerConfig,
    /// Tag the finished image is built under.
    pub image_tag: String,
}

/// Something that can turn a `BuildRequest` into a published image.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Build and publish. Returns the image reference the tool should run.
    ///
    /// Progress goes to `log`. Status transitions are the caller's job.
    async fn build(
        &self,
        request: &BuildRequest,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> Result<String, BuildError>;
}
