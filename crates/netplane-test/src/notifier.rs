//! Recording cluster notifier

use async_trait::async_trait;
use netplane_common::{ClusterNotifier, MemberClient, NetError, NetResult};
use netplane_types::NetworkPut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A network update received by a [`FakeMember`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedUpdate {
    pub project: String,
    pub name: String,
    pub put: NetworkPut,
}

/// Member client that records relayed updates.
pub struct FakeMember {
    name: String,
    unreachable: AtomicBool,
    received: Mutex<Vec<ReceivedUpdate>>,
}

impl FakeMember {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            unreachable: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
        })
    }

    /// Makes every following call fail as if the member were offline.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<ReceivedUpdate> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl MemberClient for FakeMember {
    fn name(&self) -> &str {
        &self.name
    }

    async fn update_network(&self, project: &str, name: &str, put: &NetworkPut) -> NetResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(NetError::transport(&self.name, "connection refused"));
        }
        self.received.lock().push(ReceivedUpdate {
            project: project.to_string(),
            name: name.to_string(),
            put: put.clone(),
        });
        Ok(())
    }
}

/// Notifier over a fixed member list. Empty for a standalone member.
#[derive(Default)]
pub struct FakeNotifier {
    members: Mutex<Vec<Arc<FakeMember>>>,
}

impl FakeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let notifier = Self::new();
        for name in names {
            notifier.members.lock().push(FakeMember::new(name));
        }
        notifier
    }

    pub fn member(&self, name: &str) -> Option<Arc<FakeMember>> {
        self.members.lock().iter().find(|m| m.name == name).cloned()
    }

    pub fn members(&self) -> Vec<Arc<FakeMember>> {
        self.members.lock().clone()
    }
}

#[async_trait]
impl ClusterNotifier for FakeNotifier {
    async fn peers(&self) -> NetResult<Vec<Arc<dyn MemberClient>>> {
        Ok(self
            .members
            .lock()
            .iter()
            .map(|m| m.clone() as Arc<dyn MemberClient>)
            .collect())
    }
}
