//! The dynamic container: a component whose children are created and
//! deleted at runtime, supervised `one-for-one` — one failing child is
//! restarted on its own, without disturbing its siblings.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::component::{CheckupData, Component, GenComponent};
use crate::container::{check_and_restart_child, require_retry_policy, shutdown_child};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::loader::ModuleLoader;
use crate::spec::{is_reserved_name, Spec, ENV_NOT_UNKNOWN, ENV_TEMPORARY};
use crate::util::{cooperative_yield, shard_for, DYNAMIC_CONTAINER_SHARDS};

/// One request processed by a shard's serial worker: create-or-adopt, or
/// delete, a single named child. The response channel lets the caller
/// await the outcome without blocking other shards.
enum ShardOp {
    Instance {
        spec: Spec,
        reply: oneshot::Sender<Result<Rc<dyn Component>>>,
    },
    Delete {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A dynamic-container child set, restart policy, and the 47 sharded
/// serial queues that serialise same-name create/delete operations while
/// leaving distinct names free to run concurrently.
pub struct DynamicContainer {
    kernel: GenComponent,
    max_retries: u32,
    retry_delay: Duration,
    expected: RefCell<HashMap<String, Spec>>,
    children: Context,
    loader: Rc<dyn ModuleLoader>,
    shards: Vec<mpsc::UnboundedSender<ShardOp>>,
}

impl DynamicContainer {
    pub async fn new_child(spec: Spec, parent_context: Context) -> Result<Rc<DynamicContainer>> {
        spec.validate()?;
        let (max_retries, retry_delay) = require_retry_policy(&spec)?;
        let loader = parent_context
            .loader()
            .ok_or_else(|| Error::Fatal("container context has no loader".to_string()))?;
        let children = parent_context.child();

        let container = Rc::new_cyclic(|weak| {
            let mut shards = Vec::with_capacity(DYNAMIC_CONTAINER_SHARDS as usize);
            for _ in 0..DYNAMIC_CONTAINER_SHARDS {
                let (tx, rx) = mpsc::unbounded_channel();
                spawn_shard_worker(rx, weak.clone());
                shards.push(tx);
            }
            DynamicContainer {
                kernel: GenComponent::new(spec, parent_context),
                max_retries,
                retry_delay,
                expected: RefCell::new(HashMap::new()),
                children,
                loader,
                shards,
            }
        });
        container
            .kernel
            .set_self_ref(Rc::downgrade(&container) as std::rc::Weak<dyn Component>);
        Ok(container)
    }

    pub fn children(&self) -> &Context {
        &self.children
    }

    pub fn get_child_spec(&self, name: &str) -> Option<Spec> {
        self.expected.borrow().get(name).cloned()
    }

    pub fn all_children(&self) -> Vec<Spec> {
        self.expected.borrow().values().cloned().collect()
    }

    /// Creates `spec.name` if absent, otherwise returns the existing
    /// child untouched (its spec may differ — callers that need a
    /// specific spec must `delete_child` first). Routed through the
    /// shard owning this name so concurrent calls for the same name are
    /// totally ordered.
    pub async fn instance_child(&self, spec: Spec) -> Result<Rc<dyn Component>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let shard = shard_for(&spec.name) as usize;
        self.shards[shard]
            .send(ShardOp::Instance { spec, reply: reply_tx })
            .map_err(|_| Error::Fatal("dynamic container shard worker gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Fatal("dynamic container shard worker dropped reply".to_string()))?
    }

    pub async fn delete_child(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        let shard = shard_for(&name) as usize;
        self.shards[shard]
            .send(ShardOp::Delete { name, reply: reply_tx })
            .map_err(|_| Error::Fatal("dynamic container shard worker gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Fatal("dynamic container shard worker dropped reply".to_string()))?
    }

    /// Internal, non-queued create: only ever called from a shard worker,
    /// which already guarantees this name is not concurrently touched.
    async fn create_child_internal(&self, spec: Spec) -> Result<Rc<dyn Component>> {
        if let Some(existing) = self.children.get(&spec.name) {
            return Ok(existing);
        }
        let temporary = spec.env_bool(ENV_TEMPORARY).unwrap_or(false);
        self.expected.borrow_mut().insert(spec.name.clone(), spec.clone());

        match self.loader.instantiate(spec.clone(), self.children.clone()).await {
            Ok(component) => {
                if let Err(err) = component.checkup(CheckupData::fresh()).await {
                    if temporary {
                        self.expected.borrow_mut().remove(&spec.name);
                    }
                    return Err(err);
                }
                self.children.insert(spec.name.clone(), Rc::clone(&component));
                Ok(component)
            }
            Err(err) => {
                if temporary {
                    self.expected.borrow_mut().remove(&spec.name);
                }
                Err(err)
            }
        }
    }

    async fn delete_child_internal(&self, name: &str) -> Result<()> {
        self.expected.borrow_mut().remove(name);
        shutdown_child(&self.children, self.max_retries, self.retry_delay, name).await
    }

    async fn shutdown_unknowns(&self) {
        let expected = self.expected.borrow().keys().cloned().collect::<Vec<_>>();
        for name in self.children.names() {
            if expected.iter().any(|e| e == &name) || is_reserved_name(&name) {
                continue;
            }
            if let Some(child) = self.children.get(&name) {
                if child.spec().env_bool(ENV_NOT_UNKNOWN).unwrap_or(false) {
                    continue;
                }
            }
            if let Err(err) =
                shutdown_child(&self.children, self.max_retries, self.retry_delay, &name).await
            {
                debug!(child = %name, %err, "failed to shut down unknown child");
            }
            cooperative_yield().await;
        }
    }
}

/// Drains one shard's op queue, giving the dynamic container totally
/// ordered create/delete handling for every name hashed to this shard.
fn spawn_shard_worker(mut rx: mpsc::UnboundedReceiver<ShardOp>, owner: std::rc::Weak<DynamicContainer>) {
    tokio::task::spawn_local(async move {
        while let Some(op) = rx.recv().await {
            let Some(owner) = owner.upgrade() else { break };
            match op {
                ShardOp::Instance { spec, reply } => {
                    let result = owner.create_child_internal(spec).await;
                    let _ = reply.send(result);
                }
                ShardOp::Delete { name, reply } => {
                    let result = owner.delete_child_internal(&name).await;
                    let _ = reply.send(result);
                }
            }
        }
    });
}

#[async_trait(?Send)]
impl Component for DynamicContainer {
    fn spec(&self) -> &Spec {
        self.kernel.spec()
    }

    fn is_shutdown(&self) -> bool {
        self.kernel.is_shutdown()
    }

    async fn checkup(&self, data: CheckupData) -> Result<CheckupData> {
        self.kernel.checkup(data)?;
        self.shutdown_unknowns().await;

        let expected: Vec<Spec> = self.expected.borrow().values().cloned().collect();
        for spec in &expected {
            if let Err(err) = check_and_restart_child(
                &self.children,
                &self.loader,
                self.max_retries,
                self.retry_delay,
                spec,
                data,
            )
            .await
            {
                // Catastrophic: this one-for-one child could not be
                // reconciled even after retrying. The container cannot
                // stay up in a half-reconciled state, so it shuts itself
                // down and propagates the original error (§4.5, mirroring
                // `StaticContainer::restart_all`'s own escalation).
                self.kernel.shutdown();
                return Err(err);
            }
            cooperative_yield().await;
        }
        Ok(data)
    }

    async fn shutdown(&self, _data: CheckupData) -> Result<()> {
        self.shutdown_unknowns().await;
        let names: Vec<String> = self
            .children
            .names()
            .into_iter()
            .chain(self.expected.borrow().keys().cloned())
            .collect();
        let shutdowns = names.iter().map(|name| {
            shutdown_child(&self.children, self.max_retries, self.retry_delay, name)
        });
        for result in futures::future::join_all(shutdowns).await {
            if let Err(err) = result {
                debug!(%err, "child failed to shut down during dynamic container teardown");
            }
        }
        self.kernel.shutdown();
        Ok(())
    }
}
