//! The `Component` trait every node in a tree implements, and the small
//! kernel struct (`GenComponent`) that container/supervisor types embed
//! rather than inherit from.
//!
//! The source this crate's behaviour is modeled on uses prototypal
//! inheritance: a "derived kernel" captures its parent's method in a
//! closure, then installs its own override that calls the captured one.
//! Rust has no open recursion on structs, so every container type here
//! instead *holds* a `GenComponent` and calls its associated functions
//! explicitly wherever the source would have fallen through to the
//! inherited behaviour.

use std::cell::{Cell, RefCell};
use std::rc::Weak;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::spec::Spec;

/// Threaded through a `checkup` call as it walks the tree: a child's
/// checkup can ask its parent to skip restarting it (`do_not_restart`) or
/// to restart every sibling rather than just itself (`restart_all`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckupData {
    pub do_not_restart: bool,
    pub restart_all: bool,
}

impl CheckupData {
    pub fn fresh() -> Self {
        Self::default()
    }
}

/// The uniform interface every tree node — leaf component, static
/// container, dynamic container, transactional container, supervisor —
/// presents to its parent.
///
/// Implementations are never required to be `Send`: the whole tree runs on
/// one cooperative event loop, so `#[async_trait(?Send)]` keeps the trait
/// object-safe without forcing `Arc`/`Mutex` on leaf authors who only ever
/// need `Rc`/`RefCell`.
#[async_trait(?Send)]
pub trait Component {
    /// The spec this component was instantiated from.
    fn spec(&self) -> &Spec;

    /// `true` once `shutdown` has run to completion on this component.
    fn is_shutdown(&self) -> bool;

    /// Health-check this component (and, for containers, cascade into
    /// children). Returns the (possibly mutated) `CheckupData` the caller
    /// should propagate to siblings.
    async fn checkup(&self, data: CheckupData) -> Result<CheckupData>;

    /// Tear this component down. Idempotent: calling it twice is a no-op
    /// the second time.
    async fn shutdown(&self, data: CheckupData) -> Result<()>;

    /// Two-phase-commit participation (§4.6). Default-`false`/no-op so
    /// ordinary components don't need to implement a protocol that
    /// doesn't apply to them; a transactional container only invokes the
    /// `tx_*` methods on children for which this returns `true`.
    ///
    /// Kept on `Component` itself rather than a separate trait object so a
    /// transactional container's children stay ordinary `Rc<dyn
    /// Component>` entries in the same `Context` every other container
    /// uses — no parallel registry, no trait-object upcasting.
    fn is_transactional(&self) -> bool {
        false
    }

    async fn tx_init(&self) -> Result<()> {
        Ok(())
    }

    async fn tx_resume(&self, _checkpoint: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn tx_begin(&self, _msg: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn tx_prepare(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn tx_commit(&self) -> Result<()> {
        Ok(())
    }

    async fn tx_abort(&self) -> Result<()> {
        Ok(())
    }
}

/// The state every component carries regardless of its own behaviour: its
/// spec, a shutdown flag, and a handle back to the parent context it's
/// registered into (so it can deregister itself on shutdown).
///
/// Container types embed one of these and delegate to its accessors and
/// `checkup`/`shutdown` associated functions instead of duplicating the
/// bookkeeping. A container's *own* children live in a separate `Context`
/// the container type owns directly — `GenComponent` only ever knows about
/// the namespace it itself is registered in, one level up.
pub struct GenComponent {
    spec: Spec,
    is_shutdown: Cell<bool>,
    parent_context: Context,
    self_ref: RefCell<Option<Weak<dyn Component>>>,
}

impl GenComponent {
    pub fn new(spec: Spec, parent_context: Context) -> Self {
        GenComponent {
            spec,
            is_shutdown: Cell::new(false),
            parent_context,
            self_ref: RefCell::new(None),
        }
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn parent_context(&self) -> &Context {
        &self.parent_context
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.get()
    }

    /// Called once, immediately after the embedding container is built via
    /// `Rc::new_cyclic`, so `shutdown` can later recognise "am I still the
    /// object registered under my own name" by pointer identity rather
    /// than by name alone.
    pub fn set_self_ref(&self, self_ref: Weak<dyn Component>) {
        *self.self_ref.borrow_mut() = Some(self_ref);
    }

    /// The base-level checkup: fails if this component has already shut
    /// down, otherwise passes `data` through unchanged.
    pub fn checkup(&self, data: CheckupData) -> Result<CheckupData> {
        if self.is_shutdown() {
            Err(Error::ShutdownChild(self.spec.name.clone()))
        } else {
            Ok(data)
        }
    }

    /// The base-level shutdown: marks this component shut down (a no-op if
    /// already shut down) and, if the parent context still holds this
    /// exact object under `spec.name`, removes that binding.
    pub fn shutdown(&self) {
        if !self.mark_shutdown() {
            return;
        }
        let still_registered = match (
            self.parent_context.get(&self.spec.name),
            self.self_ref.borrow().as_ref(),
        ) {
            (Some(bound), Some(self_ref)) => self_ref
                .upgrade()
                .map(|strong| std::rc::Rc::ptr_eq(&strong, &bound))
                .unwrap_or(false),
            _ => false,
        };
        if still_registered {
            self.parent_context.remove(&self.spec.name);
        }
    }

    /// Marks this kernel shut down. Returns `false` if it already was,
    /// so callers can treat a second `shutdown()` call as a no-op.
    fn mark_shutdown(&self) -> bool {
        if self.is_shutdown.get() {
            false
        } else {
            self.is_shutdown.set(true);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::rc::Rc;

    struct Leaf(GenComponent);

    #[async_trait(?Send)]
    impl Component for Leaf {
        fn spec(&self) -> &Spec {
            self.0.spec()
        }
        fn is_shutdown(&self) -> bool {
            self.0.is_shutdown()
        }
        async fn checkup(&self, data: CheckupData) -> Result<CheckupData> {
            self.0.checkup(data)
        }
        async fn shutdown(&self, _data: CheckupData) -> Result<()> {
            self.0.shutdown();
            Ok(())
        }
    }

    fn new_leaf(spec: Spec, parent_context: Context) -> Rc<dyn Component> {
        Rc::new_cyclic(|weak| {
            let kernel = GenComponent::new(spec, parent_context);
            kernel.set_self_ref(weak.clone() as Weak<dyn Component>);
            Leaf(kernel)
        })
    }

    #[test]
    fn checkup_fails_once_shut_down() {
        let kernel = GenComponent::new(Spec::new("leaf").with_module("m"), Context::detached());
        assert!(kernel.checkup(CheckupData::fresh()).is_ok());
        kernel.shutdown();
        assert!(kernel.checkup(CheckupData::fresh()).is_err());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let kernel = GenComponent::new(Spec::new("leaf").with_module("m"), Context::detached());
        kernel.shutdown();
        assert!(kernel.is_shutdown());
        kernel.shutdown();
        assert!(kernel.is_shutdown());
    }

    #[test]
    fn shutdown_deregisters_only_if_still_the_bound_object() {
        let parent = Context::detached();
        let leaf = new_leaf(Spec::new("a").with_module("m"), parent.clone());
        parent.insert("a", Rc::clone(&leaf));
        assert!(parent.contains("a"));

        // Replace the binding with a different object under the same name
        // before shutting the original down: it must NOT be deregistered.
        let other = new_leaf(Spec::new("a").with_module("m"), parent.clone());
        parent.insert("a", Rc::clone(&other));

        futures::executor::block_on(leaf.shutdown(CheckupData::fresh())).unwrap();
        assert!(parent.contains("a"));
        assert!(Rc::ptr_eq(&parent.get("a").unwrap(), &other));
    }
}
