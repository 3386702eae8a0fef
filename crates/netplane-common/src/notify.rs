//! Cluster member notification.

use async_trait::async_trait;
use netplane_types::NetworkPut;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::{NetError, NetResult};

/// Handle to another cluster member.
#[async_trait]
pub trait MemberClient: Send + Sync {
    /// Member name, used in transport errors.
    fn name(&self) -> &str;

    /// Relays a network update. The receiving member applies it with
    /// `ClientType::Notifier`.
    async fn update_network(&self, project: &str, name: &str, put: &NetworkPut) -> NetResult<()>;
}

/// Source of client handles for every other online member.
#[async_trait]
pub trait ClusterNotifier: Send + Sync {
    async fn peers(&self) -> NetResult<Vec<Arc<dyn MemberClient>>>;
}

/// Invokes `f` against every other member, in order.
///
/// The first failing member aborts the notification with
/// `TransportFailure`. Members already notified are not rolled back.
pub async fn notify_all<F, Fut>(notifier: &dyn ClusterNotifier, f: F) -> NetResult<()>
where
    F: Fn(Arc<dyn MemberClient>) -> Fut,
    Fut: Future<Output = NetResult<()>>,
{
    let peers = notifier.peers().await?;
    for client in peers {
        let member = client.name().to_string();
        debug!(member = %member, "Notifying cluster member");
        f(client).await.map_err(|e| match e {
            e @ NetError::TransportFailure { .. } => e,
            other => NetError::transport(member.clone(), other.to_string()),
        })?;
    }
    Ok(())
}
