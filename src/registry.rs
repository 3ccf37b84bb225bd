//! The per-UA dialog registry (spec §4.2).
//!
//! Three indexes over one canonical store: by `id`, by `call_id` (for
//! forked calls, spec §4.1), and by unordered tag pair (for routing
//! in-dialog requests whose From/To tags arrive swapped relative to how
//! the dialog recorded them). Structural changes (insert/re-key/remove)
//! take the registry's write lock; a dialog's own state/sequence/target
//! mutation goes through its own per-dialog mutex and never touches the
//! registry lock (spec §5).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::config::DialogConfig;
use crate::dialog::{Dialog, DialogId, TagPairKey};
use crate::errors::{DialogError, DialogResult};

/// Shared, lockable handle to one dialog. Cloning a `DialogHandle` is
/// cheap (it's an `Arc`); cloning the `Dialog` it guards requires taking
/// the lock.
pub type DialogHandle = Arc<Mutex<Dialog>>;

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<DialogId, DialogHandle>,
    by_call_id: HashMap<String, HashSet<DialogId>>,
    by_tag_pair: HashMap<TagPairKey, DialogId>,
}

/// The per-[`crate::ua::UserAgent`] dialog table (spec §4.2).
pub struct DialogRegistry {
    inner: RwLock<RegistryInner>,
    config: DialogConfig,
}

impl DialogRegistry {
    pub fn new(config: DialogConfig) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            config,
        }
    }

    /// Inserts a newly created dialog. Fails with `DuplicateId` if `id`
    /// is already present — this should never happen for UAC dialogs
    /// (fresh random tags) but guards against a UAS re-registering the
    /// same tag triple.
    pub async fn register(&self, dialog: Dialog) -> DialogResult<DialogHandle> {
        let mut inner = self.inner.write().await;
        if inner.by_id.contains_key(&dialog.id) {
            return Err(DialogError::DuplicateId {
                id: dialog.id.to_string(),
            });
        }
        if let Some(max) = self.config.max_dialogs {
            if inner.by_id.len() >= max {
                return Err(DialogError::internal(
                    "DialogRegistry::register",
                    "max_dialogs exceeded",
                ));
            }
        }
        let id = dialog.id.clone();
        let call_id = dialog.call_id.clone();
        self.index_tag_pair(&mut inner, &id);
        inner.by_call_id.entry(call_id).or_default().insert(id.clone());
        let handle = Arc::new(Mutex::new(dialog));
        inner.by_id.insert(id, handle.clone());
        Ok(handle)
    }

    fn index_tag_pair(&self, inner: &mut RegistryInner, id: &DialogId) {
        if id.has_remote_tag() {
            inner.by_tag_pair.insert(id.tag_pair_key(), id.clone());
        }
    }

    pub async fn unregister(&self, id: &DialogId) -> Option<DialogHandle> {
        let mut inner = self.inner.write().await;
        self.remove_locked(&mut inner, id)
    }

    fn remove_locked(&self, inner: &mut RegistryInner, id: &DialogId) -> Option<DialogHandle> {
        let handle = inner.by_id.remove(id)?;
        inner.by_tag_pair.remove(&id.tag_pair_key());
        if let Some(set) = inner.by_call_id.get_mut(&id.call_id) {
            set.remove(id);
            if set.is_empty() {
                inner.by_call_id.remove(&id.call_id);
            }
        }
        Some(handle)
    }

    pub async fn by_id(&self, id: &DialogId) -> Option<DialogHandle> {
        self.inner.read().await.by_id.get(id).cloned()
    }

    pub async fn by_call_id(&self, call_id: &str) -> Vec<DialogHandle> {
        let inner = self.inner.read().await;
        inner
            .by_call_id
            .get(call_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    pub async fn by_tags(&self, call_id: &str, tag_a: &str, tag_b: &str) -> Option<DialogHandle> {
        let inner = self.inner.read().await;
        let key = TagPairKey::new(call_id, tag_a, tag_b);
        let id = inner.by_tag_pair.get(&key)?;
        inner.by_id.get(id).cloned()
    }

    /// Atomic re-keying when the remote tag is learned late (UAC) or the
    /// local tag is finally chosen (UAS), moving a dialog from its
    /// provisional id to its final `<call-id>:<local-tag>:<remote-tag>`
    /// form without ever exposing a partially-updated index set to a
    /// concurrent lookup.
    pub async fn update_id(&self, old: &DialogId, new: DialogId) -> DialogResult<()> {
        let mut inner = self.inner.write().await;
        let handle = inner
            .by_id
            .remove(old)
            .ok_or_else(|| DialogError::not_found_id(old))?;
        inner.by_tag_pair.remove(&old.tag_pair_key());
        if let Some(set) = inner.by_call_id.get_mut(&old.call_id) {
            set.remove(old);
        }

        inner.by_call_id.entry(new.call_id.clone()).or_default().insert(new.clone());
        self.index_tag_pair(&mut inner, &new);
        inner.by_id.insert(new, handle);
        Ok(())
    }

    /// Removes dialogs that reached `Terminated` more than
    /// `config.termination_grace` ago (spec §5). Returns the number
    /// removed.
    pub async fn cleanup_terminated(&self) -> usize {
        let grace = chrono::Duration::from_std(self.config.termination_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(32));
        let now = chrono::Utc::now();

        let mut inner = self.inner.write().await;
        let mut to_remove = Vec::new();
        for (id, handle) in inner.by_id.iter() {
            let dialog = handle.lock().await;
            if dialog.is_terminated() && now - dialog.last_activity_at > grace {
                to_remove.push(id.clone());
            }
        }
        let removed = to_remove.len();
        for id in to_remove {
            self.remove_locked(&mut inner, &id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all_handles(&self) -> Vec<DialogHandle> {
        self.inner.read().await.by_id.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::DialogState;

    fn uri(s: &str) -> rvoip_sip_core::prelude::Uri {
        s.parse().unwrap()
    }

    fn uac_dialog(call_id: &str, local_tag: &str) -> Dialog {
        Dialog::new_uac(
            call_id,
            uri("sip:alice@127.0.0.1"),
            uri("sip:bob@127.0.0.1"),
            local_tag,
            uri("sip:alice@127.0.0.1:5060"),
        )
    }

    #[tokio::test]
    async fn register_then_lookup_by_id() {
        let registry = DialogRegistry::new(DialogConfig::default());
        let id = DialogId::provisional("c1", "a1");
        let handle = registry.register(uac_dialog("c1", "a1")).await.unwrap();
        assert!(registry.by_id(&id).await.is_some());
        drop(handle);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let registry = DialogRegistry::new(DialogConfig::default());
        registry.register(uac_dialog("c1", "a1")).await.unwrap();
        let err = registry.register(uac_dialog("c1", "a1")).await.unwrap_err();
        assert!(matches!(err, DialogError::DuplicateId { .. }));
    }

    #[tokio::test]
    async fn update_id_then_by_tags_is_order_independent() {
        let registry = DialogRegistry::new(DialogConfig::default());
        let handle = registry.register(uac_dialog("c1", "a1")).await.unwrap();
        {
            let mut dialog = handle.lock().await;
            dialog.remote_tag = "b1".to_string();
            let old = dialog.id.clone();
            dialog.id = DialogId::new("c1", "a1", "b1");
            registry.update_id(&old, dialog.id.clone()).await.unwrap();
        }
        assert!(registry.by_tags("c1", "b1", "a1").await.is_some());
        assert!(registry.by_tags("c1", "a1", "b1").await.is_some());
    }

    #[tokio::test]
    async fn forked_call_indexed_under_one_call_id() {
        let registry = DialogRegistry::new(DialogConfig::default());
        let h1 = registry.register(uac_dialog("c1", "a1")).await.unwrap();
        {
            let mut d = h1.lock().await;
            d.remote_tag = "b1".into();
            d.id = DialogId::new("c1", "a1", "b1");
        }
        registry
            .update_id(&DialogId::provisional("c1", "a1"), DialogId::new("c1", "a1", "b1"))
            .await
            .unwrap();

        let mut d2 = uac_dialog("c1", "a1");
        d2.id = DialogId::new("c1", "a1", "b2");
        d2.remote_tag = "b2".into();
        registry.register(d2).await.unwrap();

        assert_eq!(registry.by_call_id("c1").await.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_terminated_dialogs() {
        let config = DialogConfig::default().with_termination_grace(std::time::Duration::from_secs(0));
        let registry = DialogRegistry::new(config);
        let handle = registry.register(uac_dialog("c1", "a1")).await.unwrap();
        {
            let mut d = handle.lock().await;
            d.state = DialogState::Terminated;
            d.last_activity_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        }
        let removed = registry.cleanup_terminated().await;
        assert_eq!(removed, 1);
        assert_eq!(registry.len().await, 0);
    }
}
