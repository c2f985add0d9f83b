//! Identity query.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::context::WorkletContext;
use crate::id_encoding;

/// Canonical encoding of the backend's public key, once ready.
pub(crate) async fn query(ctx: Arc<WorkletContext>) -> Result<String> {
    ctx.ensure_ready().await?;

    let key = ctx
        .backend()
        .swarm()
        .public_key()
        .context("Backend is ready but has no public key")?;
    Ok(id_encoding::encode(&key)?)
}
