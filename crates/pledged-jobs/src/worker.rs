use async_trait::async_trait;
use pledged_store::Payload;
use tokio_util::sync::CancellationToken;

use crate::error::JobResult;
use crate::message::WorkDescriptor;

/// Executes micro-jobs. Implementations are expected to watch `cancel` and
/// give up promptly with a cancellation error when it fires.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(
        &self,
        work: WorkDescriptor,
        input: Option<Payload>,
        cancel: CancellationToken,
    ) -> JobResult<Payload>;

    async fn health_check(&self) -> JobResult<()> {
        Ok(())
    }
}
