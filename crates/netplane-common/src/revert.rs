//! Ordered undo stack for multi-step operations.
//!
//! Undo actions are pushed as a forward pass progresses. On failure the
//! caller runs [`Reverter::fail`], which invokes every action in reverse
//! order; on success [`Reverter::success`] discards them.
//!
//! Each action receives `&mut C`, usually the driver running the
//! operation, so an undo step can replay a forward protocol (for example
//! re-applying the old config through `update`).
//!
//! ```ignore
//! let mut revert = Reverter::new();
//! revert.add(move |net: &mut Physical| async move {
//!     let _ = net.common.update(old, None, ClientType::Normal).await;
//! }.boxed());
//!
//! if let Err(e) = net.setup().await {
//!     revert.fail(net).await;
//!     return Err(e);
//! }
//! revert.success();
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

type UndoFn<C> = Box<dyn for<'a> FnOnce(&'a mut C) -> BoxFuture<'a, ()> + Send>;

/// LIFO list of undo actions over a context `C`.
pub struct Reverter<C> {
    undo: Vec<UndoFn<C>>,
}

impl<C> Default for Reverter<C> {
    fn default() -> Self {
        Self { undo: Vec::new() }
    }
}

impl<C: Send> Reverter<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an undo action that needs mutable access to the context.
    pub fn add<F>(&mut self, f: F)
    where
        F: for<'a> FnOnce(&'a mut C) -> BoxFuture<'a, ()> + Send + 'static,
    {
        self.undo.push(Box::new(f));
    }

    /// Pushes an undo action that does not touch the context.
    pub fn add_detached<F, Fut>(&mut self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(move |_ctx: &mut C| f().boxed());
    }

    /// Number of pending undo actions.
    pub fn len(&self) -> usize {
        self.undo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }

    /// Runs every pending action in reverse order.
    pub async fn fail(mut self, ctx: &mut C) {
        tracing::debug!(steps = self.undo.len(), "Reverting partial operation");
        while let Some(undo) = self.undo.pop() {
            undo(ctx).await;
        }
    }

    /// Discards every pending action.
    pub fn success(mut self) {
        self.undo.clear();
    }
}

impl<C> Drop for Reverter<C> {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            tracing::warn!(
                steps = self.undo.len(),
                "Reverter dropped without success or fail, undo actions discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Journal {
        entries: Vec<String>,
    }

    #[tokio::test]
    async fn test_fail_runs_in_reverse() {
        let mut journal = Journal::default();
        let mut revert = Reverter::new();

        for step in ["vlan", "mtu", "bgp"] {
            revert.add(move |j: &mut Journal| {
                async move { j.entries.push(format!("undo {}", step)) }.boxed()
            });
        }
        assert_eq!(revert.len(), 3);

        revert.fail(&mut journal).await;
        assert_eq!(journal.entries, vec!["undo bgp", "undo mtu", "undo vlan"]);
    }

    #[tokio::test]
    async fn test_success_discards() {
        let mut journal = Journal::default();
        let mut revert = Reverter::new();
        revert.add(|j: &mut Journal| async move { j.entries.push("undo".into()) }.boxed());
        revert.success();

        assert!(journal.entries.is_empty());
        journal.entries.push("kept".into());
        assert_eq!(journal.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_detached_actions_interleave() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut journal = Journal::default();
        let mut revert = Reverter::new();

        let s = seen.clone();
        revert.add_detached(move || async move { s.lock().unwrap().push("detached") });
        revert.add(|j: &mut Journal| async move { j.entries.push("ctx".into()) }.boxed());

        revert.fail(&mut journal).await;
        assert_eq!(journal.entries, vec!["ctx"]);
        assert_eq!(*seen.lock().unwrap(), vec!["detached"]);
    }
}
