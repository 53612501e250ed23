use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use portal_format::{BlockRef, Offset, PortalBlock};

use crate::{
    error::ForkDetected,
    resumable::{Batch, ResumableStream},
};

/// Downstream sink driven by [`ResumableStream::pipe_to`].
#[async_trait]
pub trait Target<B: Send + 'static>: Send {
    async fn write(&mut self, batch: Batch<B>) -> Result<()>;

    /// Whether [`Target::fork`] is implemented.
    fn supports_fork(&self) -> bool {
        false
    }

    /// Rolls written data back to the newest of `previous_blocks` the target still agrees
    /// with and returns it. `None` if there is no such block.
    async fn fork(&mut self, previous_blocks: &[BlockRef]) -> Result<Option<BlockRef>> {
        let _ = previous_blocks;
        Ok(None)
    }
}

impl<B: PortalBlock> ResumableStream<B> {
    /// Writes every batch to `target`, acknowledging each one after it was written.
    ///
    /// Without a state that handles rollbacks, forks are resolved by the target.
    pub async fn pipe_to<T: Target<B>>(&mut self, target: &mut T) -> Result<()> {
        loop {
            let batch = match self.next().await {
                None => return Ok(()),
                Some(Ok(batch)) => batch,
                Some(Err(e)) => {
                    let Some(fork) = e.downcast_ref::<ForkDetected>() else {
                        return Err(e);
                    };
                    if !target.supports_fork() {
                        bail!("Target does not support fork");
                    }

                    let cursor = target
                        .fork(&fork.previous_blocks)
                        .await
                        .context("roll back target")?
                        .ok_or_else(|| {
                            anyhow!("Fork has been detected, but pipeline couldn't find the cursor to continue from")
                        })?;

                    log::info!("Target rolled back to block {} ({})", cursor.number, cursor.hash);
                    self.restart_from(&Offset::from(&cursor));
                    continue;
                }
            };

            let handle = batch.offset.clone();
            target.write(batch).await.context("write batch to target")?;
            self.ack(&handle).await?;
        }
    }
}
