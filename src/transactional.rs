//! The transactional container: a static container that additionally
//! drives the `begin → prepare → (commit | abort)` two-phase-commit
//! protocol over the subset of its children marked transactional, plus a
//! deferred-action log replayed at `commit`/`resume`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::component::{CheckupData, Component};
use crate::container::StaticContainer;
use crate::context::Context;
use crate::error::Result;
use crate::loader::ModuleLoader;
use crate::spec::Spec;
use crate::util::cooperative_yield;

/// One deferred method call, recorded by `log_action` at `begin`/`prepare`
/// time and replayed against `log_actions_target` at `commit`/`resume`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogAction {
    pub method: String,
    pub args: Value,
}

/// The externally-persistable result of `prepare`: per-transactional-child
/// prepare results, plus this container's own state and pending log if
/// either is non-empty.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub children: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_actions: Option<Vec<LogAction>>,
}

/// The object deferred log actions are ultimately replayed against.
/// Stands in for the source's reflective "call this method by name on
/// that object" replay, since Rust has no runtime method dispatch by
/// name.
#[async_trait(?Send)]
pub trait TransactionalTarget {
    async fn apply(&self, method: &str, args: Value) -> Result<()>;
}

/// A static container that also participates in two-phase commit.
///
/// Wraps a [`StaticContainer`] by composition rather than inheritance
/// (consistent with every other kernel in this crate): ordinary
/// supervision (`checkup`/`shutdown`) delegates straight through to the
/// embedded container, and this type layers `state`/`stateBackup`/
/// `logActions`/`logActionsTarget` and the 2PC operations on top.
pub struct TransactionalContainer {
    inner: Rc<StaticContainer>,
    state: RefCell<Value>,
    state_backup: RefCell<Option<String>>,
    log_actions: RefCell<Vec<LogAction>>,
    log_actions_target: RefCell<Option<Rc<dyn TransactionalTarget>>>,
}

impl TransactionalContainer {
    pub async fn new_root(spec: Spec, loader: Rc<dyn ModuleLoader>) -> Result<Rc<TransactionalContainer>> {
        let inner = StaticContainer::new_root(spec, loader).await?;
        Ok(Rc::new(TransactionalContainer::wrap(inner)))
    }

    pub async fn new_child(spec: Spec, parent_context: Context) -> Result<Rc<TransactionalContainer>> {
        let inner = StaticContainer::new_child(spec, parent_context).await?;
        Ok(Rc::new(TransactionalContainer::wrap(inner)))
    }

    fn wrap(inner: Rc<StaticContainer>) -> Self {
        TransactionalContainer {
            inner,
            state: RefCell::new(Value::Null),
            state_backup: RefCell::new(None),
            log_actions: RefCell::new(Vec::new()),
            log_actions_target: RefCell::new(None),
        }
    }

    pub fn state(&self) -> Value {
        self.state.borrow().clone()
    }

    pub fn set_state(&self, value: Value) {
        *self.state.borrow_mut() = value;
    }

    pub fn set_log_actions_target(&self, target: Rc<dyn TransactionalTarget>) {
        *self.log_actions_target.borrow_mut() = Some(target);
    }

    /// Defers `method(args)` until the next `commit`/`resume` replay,
    /// rather than applying it immediately (the source's `lazyApply`).
    pub fn log_action(&self, method: impl Into<String>, args: Value) {
        self.log_actions.borrow_mut().push(LogAction {
            method: method.into(),
            args,
        });
    }

    async fn transactional_children(&self) -> Vec<(String, Rc<dyn Component>)> {
        let mut result = Vec::new();
        for spec in self.inner.expected() {
            if let Some(child) = self.inner.children().get(&spec.name) {
                if child.is_transactional() {
                    result.push((spec.name.clone(), child));
                }
            }
        }
        result
    }

    async fn replay_log(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.log_actions.borrow_mut());
        if pending.is_empty() {
            return Ok(());
        }
        let target = self.log_actions_target.borrow().clone();
        let Some(target) = target else {
            // No target configured: put the actions back so a future
            // `set_log_actions_target` + retry can still replay them.
            *self.log_actions.borrow_mut() = pending;
            return Err(crate::error::Error::Fatal(
                "transactional container has deferred log actions but no log_actions_target set".to_string(),
            ));
        };
        for action in pending {
            target.apply(&action.method, action.args).await?;
            cooperative_yield().await;
        }
        Ok(())
    }

    /// Clears the log and applies `init` to every transactional child in
    /// declaration order.
    pub async fn init(&self) -> Result<()> {
        self.log_actions.borrow_mut().clear();
        for (_, child) in self.transactional_children().await {
            child.tx_init().await?;
            cooperative_yield().await;
        }
        Ok(())
    }

    /// Replays a previously prepared checkpoint: `resume`s every
    /// transactional child in declaration order, restores `state`/
    /// `log_actions` from the checkpoint if present, then replays the
    /// restored log.
    pub async fn resume(&self, checkpoint: Checkpoint) -> Result<()> {
        for (name, child) in self.transactional_children().await {
            if let Some(value) = checkpoint.children.get(&name) {
                child.tx_resume(value.clone()).await?;
            }
            cooperative_yield().await;
        }
        if let Some(state) = checkpoint.state {
            *self.state.borrow_mut() = state;
        }
        if let Some(log_actions) = checkpoint.log_actions {
            *self.log_actions.borrow_mut() = log_actions;
        }
        self.replay_log().await
    }

    /// Snapshots `state` into `state_backup`, clears the log, and
    /// propagates `begin(msg)` to every transactional child in order.
    pub async fn begin(&self, msg: Value) -> Result<()> {
        let snapshot = serde_json::to_string(&*self.state.borrow())
            .map_err(|err| crate::error::Error::Fatal(format!("state is not serialisable: {err}")))?;
        *self.state_backup.borrow_mut() = Some(snapshot);
        self.log_actions.borrow_mut().clear();
        for (_, child) in self.transactional_children().await {
            child.tx_begin(msg.clone()).await?;
            cooperative_yield().await;
        }
        Ok(())
    }

    /// Calls `prepare` on every transactional child in order and combines
    /// the results with this container's own state/log into a
    /// [`Checkpoint`] the caller is expected to persist externally before
    /// proceeding to `commit`.
    pub async fn prepare(&self) -> Result<Checkpoint> {
        let mut children = BTreeMap::new();
        for (name, child) in self.transactional_children().await {
            let result = child.tx_prepare().await?;
            children.insert(name, result);
            cooperative_yield().await;
        }
        let state = self.state.borrow().clone();
        let state = if state.is_null() { None } else { Some(state) };
        let log_actions = self.log_actions.borrow().clone();
        let log_actions = if log_actions.is_empty() { None } else { Some(log_actions) };
        Ok(Checkpoint {
            children,
            state,
            log_actions,
        })
    }

    /// Calls `commit` on every transactional child in order, then replays
    /// the log. A failure at this stage is unrecoverable for this
    /// container (the checkpoint has already been persisted by the
    /// caller): this container shuts itself down and propagates the
    /// error rather than attempting to limp along — the platform's
    /// `resume` path on restart is the sanctioned recovery route.
    pub async fn commit(&self) -> Result<()> {
        for (_, child) in self.transactional_children().await {
            if let Err(err) = child.tx_commit().await {
                error!(%err, "commit failed on a transactional child, shutting down");
                let _ = self.shutdown(CheckupData::fresh()).await;
                return Err(err);
            }
            cooperative_yield().await;
        }
        if let Err(err) = self.replay_log().await {
            error!(%err, "log replay failed during commit, shutting down");
            let _ = self.shutdown(CheckupData::fresh()).await;
            return Err(err);
        }
        Ok(())
    }

    /// Restores `state` from `state_backup` (if any was taken), clears
    /// the log, and propagates `abort` to every transactional child in
    /// order.
    pub async fn abort(&self) -> Result<()> {
        if let Some(backup) = self.state_backup.borrow_mut().take() {
            let restored: Value = serde_json::from_str(&backup).unwrap_or(Value::Null);
            *self.state.borrow_mut() = restored;
        }
        self.log_actions.borrow_mut().clear();
        for (_, child) in self.transactional_children().await {
            child.tx_abort().await?;
            cooperative_yield().await;
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Component for TransactionalContainer {
    fn spec(&self) -> &Spec {
        self.inner.spec()
    }

    fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    async fn checkup(&self, data: CheckupData) -> Result<CheckupData> {
        self.inner.checkup(data).await
    }

    async fn shutdown(&self, data: CheckupData) -> Result<()> {
        self.inner.shutdown(data).await
    }

    /// A transactional container can itself be a transactional child of
    /// an enclosing transactional container.
    fn is_transactional(&self) -> bool {
        true
    }

    async fn tx_init(&self) -> Result<()> {
        self.init().await
    }

    async fn tx_resume(&self, checkpoint: Value) -> Result<()> {
        let checkpoint: Checkpoint = serde_json::from_value(checkpoint)
            .map_err(|err| crate::error::Error::invalid_spec(&self.spec().name, format!("bad checkpoint: {err}")))?;
        self.resume(checkpoint).await
    }

    async fn tx_begin(&self, msg: Value) -> Result<()> {
        self.begin(msg).await
    }

    async fn tx_prepare(&self) -> Result<Value> {
        let checkpoint = self.prepare().await?;
        serde_json::to_value(checkpoint)
            .map_err(|err| crate::error::Error::Fatal(format!("checkpoint is not serialisable: {err}")))
    }

    async fn tx_commit(&self) -> Result<()> {
        self.commit().await
    }

    async fn tx_abort(&self) -> Result<()> {
        self.abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::GenComponent;
    use crate::loader::{Loader, ModuleEntry, ModuleResolver, StaticTableResolver};
    use serde_json::json;
    use std::rc::Weak;

    /// A minimal transactional leaf whose `state` can be mutated through
    /// `log_action`/`replay`, exercised directly rather than through the
    /// generic `Component::tx_*` default path.
    struct CountingLeaf {
        kernel: GenComponent,
        value: RefCell<i64>,
    }

    #[async_trait(?Send)]
    impl Component for CountingLeaf {
        fn spec(&self) -> &Spec {
            self.kernel.spec()
        }
        fn is_shutdown(&self) -> bool {
            self.kernel.is_shutdown()
        }
        async fn checkup(&self, data: CheckupData) -> Result<CheckupData> {
            self.kernel.checkup(data)
        }
        async fn shutdown(&self, _data: CheckupData) -> Result<()> {
            self.kernel.shutdown();
            Ok(())
        }
        fn is_transactional(&self) -> bool {
            true
        }
        async fn tx_prepare(&self) -> Result<Value> {
            Ok(json!({ "value": *self.value.borrow() }))
        }
        async fn tx_commit(&self) -> Result<()> {
            Ok(())
        }
        async fn tx_abort(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn counting_leaf_factory(spec: Spec, context: Context) -> Result<Rc<dyn Component>> {
        Ok(Rc::new_cyclic(|weak: &Weak<CountingLeaf>| {
            let kernel = GenComponent::new(spec, context);
            kernel.set_self_ref(weak.clone() as Weak<dyn Component>);
            CountingLeaf {
                kernel,
                value: RefCell::new(0),
            }
        }))
    }

    fn test_loader() -> Rc<dyn ModuleLoader> {
        let resolver = StaticTableResolver::new("local")
            .register("counter_pkg", ModuleEntry::factory(counting_leaf_factory));
        Rc::new(Loader::new(vec![Rc::new(resolver) as Rc<dyn ModuleResolver>]))
    }

    fn container_spec() -> Spec {
        Spec::new("tx")
            .with_env("maxRetries", json!(1))
            .with_env("retryDelay", json!(0))
            .with_components(vec![Spec::new("counter").with_module("counter_pkg")])
    }

    #[tokio::test(flavor = "current_thread")]
    async fn abort_restores_state_from_begin_snapshot() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let container = TransactionalContainer::new_root(container_spec(), test_loader())
                    .await
                    .unwrap();
                container.set_state(json!({ "language": "english" }));
                container.begin(Value::Null).await.unwrap();
                container.set_state(json!({ "language": "french" }));
                container.abort().await.unwrap();
                assert_eq!(container.state(), json!({ "language": "english" }));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn prepare_collects_every_transactional_child_result() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let container = TransactionalContainer::new_root(container_spec(), test_loader())
                    .await
                    .unwrap();
                container.begin(Value::Null).await.unwrap();
                let checkpoint = container.prepare().await.unwrap();
                assert_eq!(checkpoint.children.get("counter"), Some(&json!({ "value": 0 })));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn commit_replays_and_then_clears_the_log() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                struct Recorder(RefCell<Vec<(String, Value)>>);
                #[async_trait(?Send)]
                impl TransactionalTarget for Recorder {
                    async fn apply(&self, method: &str, args: Value) -> Result<()> {
                        self.0.borrow_mut().push((method.to_string(), args));
                        Ok(())
                    }
                }

                let container = TransactionalContainer::new_root(container_spec(), test_loader())
                    .await
                    .unwrap();
                let recorder = Rc::new(Recorder(RefCell::new(Vec::new())));
                container.set_log_actions_target(Rc::clone(&recorder) as Rc<dyn TransactionalTarget>);

                container.begin(Value::Null).await.unwrap();
                container.log_action("setLanguage", json!("french"));
                container.commit().await.unwrap();

                assert_eq!(
                    recorder.0.borrow().as_slice(),
                    &[("setLanguage".to_string(), json!("french"))]
                );
            })
            .await;
    }
}
