//! Sync reconciliation
//!
//! Keeps the derived credential secret of a Sync in existence. The secret is
//! created once and never rewritten, so a generated SSH keypair stays stable
//! for the lifetime of the Sync. Deletion is left to garbage collection
//! through the owner reference.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use super::{backoff_error_policy, Context};
use crate::builder::build_sync_secret;
use crate::crd::JuiceFsSync;
use crate::error::ignore_already_exists;
use crate::events::{actions, reasons};
use crate::naming::{object_key, sync_secret_name};
use crate::Error;

/// Reconcile a Sync
#[instrument(skip(sync, ctx), fields(sync = %sync.name_any(), namespace = ?sync.namespace()))]
pub async fn reconcile(sync: Arc<JuiceFsSync>, ctx: Arc<Context>) -> Result<Action, Error> {
    if sync.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let namespace = sync.namespace().unwrap_or_default();
    let secret_name = sync_secret_name(&sync.name_any());

    if ctx.kube.get_secret(&namespace, &secret_name).await?.is_some() {
        debug!(secret = %secret_name, "derived secret present");
    } else if !ctx.is_shutting_down() {
        let secret = build_sync_secret(&sync)?;
        ignore_already_exists(ctx.kube.create_secret(&namespace, &secret).await)?;
        info!(secret = %secret_name, distributed = sync.spec.is_distributed(), "created derived secret");
        ctx.events
            .publish(
                &sync.object_ref(&()),
                EventType::Normal,
                reasons::SECRET_CREATED,
                actions::CREATE,
                Some(format!("Created secret {secret_name}")),
            )
            .await;
    }

    ctx.backoff.reset(&object_key(sync.as_ref()));
    Ok(Action::await_change())
}

/// Requeue a failed Sync reconcile on its own backoff
pub fn error_policy(sync: Arc<JuiceFsSync>, error: &Error, ctx: Arc<Context>) -> Action {
    backoff_error_policy("Sync", sync.as_ref(), error, &ctx)
}
