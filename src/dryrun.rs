//! Dry-run collaborator: prints what would be posted instead of calling Discord.
//!
//! Every destination resolves as new; its handle is the destination key (or
//! the display name for the root destination, whose key is empty).

use async_trait::async_trait;
use std::io::Write;
use std::sync::Mutex;
use tree_mirror_core::contract::{
    Ack, ChunkPoster, DestinationHandle, DestinationRequest, DestinationResolver, ExistenceRecord,
};
use tree_mirror_core::error::CollaboratorError;

pub struct DryRun {
    out: Mutex<Box<dyn Write + Send>>,
}

impl DryRun {
    pub fn stdout() -> Self {
        Self::to_writer(std::io::stdout())
    }

    pub fn to_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
        }
    }

    fn emit(&self, text: &str) -> Result<(), CollaboratorError> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| "dry-run output lock poisoned")?;
        out.write_all(text.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

#[async_trait]
impl DestinationResolver for DryRun {
    async fn resolve(
        &self,
        request: &DestinationRequest,
    ) -> Result<ExistenceRecord, CollaboratorError> {
        let name = if request.key.is_empty() {
            request.display_name.clone()
        } else {
            request.key.clone()
        };
        self.emit(&format!(
            "=== [dry-run] {:?} {} ===\n",
            request.kind_hint, name
        ))?;
        Ok(ExistenceRecord {
            key: request.key.clone(),
            already_exists: false,
            handle: DestinationHandle(name),
        })
    }
}

#[async_trait]
impl ChunkPoster for DryRun {
    async fn post_chunk(
        &self,
        handle: &DestinationHandle,
        text: &str,
    ) -> Result<Ack, CollaboratorError> {
        self.emit(&format!("--- [dry-run] {handle} ---\n{text}"))?;
        if !text.ends_with('\n') {
            self.emit("\n")?;
        }
        Ok(Ack::default())
    }
}
