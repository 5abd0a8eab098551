//! The static container: a component with a fixed, declaration-ordered set
//! of children and `one-for-all` supervision — a single failing child
//! triggers a full shutdown-and-recreate cascade across every child.

use std::collections::HashSet;
use std::rc::{Rc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::component::{CheckupData, Component, GenComponent};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::loader::ModuleLoader;
use crate::spec::{is_reserved_name, Spec, ENV_NOT_UNKNOWN, ENV_TEMPORARY};
use crate::util::{cooperative_yield, retry_with_delay};

/// Reads the `maxRetries`/`retryDelay` pair every container kernel
/// requires, failing fast (§4.4: "Requires `env.maxRetries`... and
/// `env.retryDelay`...") if either is absent.
pub(crate) fn require_retry_policy(spec: &Spec) -> Result<(u32, Duration)> {
    let max_retries = spec.env_u64("maxRetries").ok_or_else(|| {
        Error::invalid_spec(&spec.name, "container spec is missing required env.maxRetries")
    })?;
    let retry_delay = spec.env_u64("retryDelay").ok_or_else(|| {
        Error::invalid_spec(&spec.name, "container spec is missing required env.retryDelay")
    })?;
    Ok((max_retries as u32, Duration::from_millis(retry_delay)))
}

/// Calls a child's `checkup`; `MissingChild` if it isn't registered.
pub(crate) async fn check_child(children: &Context, name: &str) -> Result<()> {
    match children.get(name) {
        Some(child) => {
            child.checkup(CheckupData::fresh()).await?;
            Ok(())
        }
        None => Err(Error::MissingChild(name.to_string())),
    }
}

/// Idempotent: shutting down a name that isn't registered succeeds
/// immediately. Otherwise retries the child's `shutdown` up to the
/// container's configured bound.
pub(crate) async fn shutdown_child(
    children: &Context,
    max_retries: u32,
    retry_delay: Duration,
    name: &str,
) -> Result<()> {
    let Some(child) = children.get(name) else {
        return Ok(());
    };
    retry_with_delay(max_retries, retry_delay, move || {
        let child = Rc::clone(&child);
        async move { child.shutdown(CheckupData::fresh()).await }
    })
    .await
}

/// `shutdownChild` then `loader.instantiate`, so a stale registration is
/// never left behind a fresh create attempt; retries the whole sequence
/// up to the container's configured bound.
pub(crate) async fn create_child(
    children: &Context,
    loader: &Rc<dyn ModuleLoader>,
    max_retries: u32,
    retry_delay: Duration,
    spec: &Spec,
) -> Result<()> {
    shutdown_child(children, max_retries, retry_delay, &spec.name).await?;
    retry_with_delay(max_retries, retry_delay, move || {
        let children = children.clone();
        let loader = Rc::clone(loader);
        let spec = spec.clone();
        async move {
            let component = loader.instantiate(spec.clone(), children.clone()).await?;
            component.checkup(CheckupData::fresh()).await?;
            children.insert(spec.name.clone(), component);
            Ok(())
        }
    })
    .await
}

/// `checkChild`, with the temporary-child and `doNotRestart` policy
/// interplay decided in DESIGN.md: `doNotRestart` suppresses every
/// restart; `__ca_temporary__` suppresses the failure's propagation
/// regardless of `doNotRestart`.
pub(crate) async fn check_and_restart_child(
    children: &Context,
    loader: &Rc<dyn ModuleLoader>,
    max_retries: u32,
    retry_delay: Duration,
    spec: &Spec,
    data: CheckupData,
) -> Result<()> {
    match check_child(children, &spec.name).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if spec.env_bool(ENV_TEMPORARY).unwrap_or(false) {
                debug!(child = %spec.name, %err, "temporary child failed checkup, not restarting");
                Ok(())
            } else if data.do_not_restart {
                Err(err)
            } else {
                create_child(children, loader, max_retries, retry_delay, spec).await
            }
        }
    }
}

/// A component with a fixed, declaration-ordered child set and
/// `one-for-all` supervision.
pub struct StaticContainer {
    kernel: GenComponent,
    max_retries: u32,
    retry_delay: Duration,
    expected: Vec<Spec>,
    children: Context,
    loader: Rc<dyn ModuleLoader>,
}

impl StaticContainer {
    /// Builds this container as the tree root: its own parent context's
    /// `_` back-reference resolves to itself.
    pub async fn new_root(spec: Spec, loader: Rc<dyn ModuleLoader>) -> Result<Rc<StaticContainer>> {
        spec.validate()?;
        let (max_retries, retry_delay) = require_retry_policy(&spec)?;
        let expected = spec.components.clone().unwrap_or_default();

        let container = Rc::new_cyclic(|weak: &Weak<StaticContainer>| {
            let weak_component = weak.clone() as Weak<dyn Component>;
            let parent_context = Context::new_root(weak_component.clone(), Rc::clone(&loader));
            let children = parent_context.child();
            StaticContainer {
                kernel: GenComponent::new(spec, parent_context),
                max_retries,
                retry_delay,
                expected,
                children,
                loader,
            }
        });
        container
            .kernel
            .set_self_ref(Rc::downgrade(&container) as Weak<dyn Component>);
        container.start_children().await?;
        Ok(container)
    }

    /// Builds this container as a non-root node, registered into
    /// `parent_context` under `spec.name` once construction succeeds.
    pub async fn new_child(spec: Spec, parent_context: Context) -> Result<Rc<StaticContainer>> {
        spec.validate()?;
        let (max_retries, retry_delay) = require_retry_policy(&spec)?;
        let expected = spec.components.clone().unwrap_or_default();
        let loader = parent_context
            .loader()
            .ok_or_else(|| Error::Fatal("container context has no loader".to_string()))?;
        let children = parent_context.child();

        let container = Rc::new_cyclic(|weak: &Weak<StaticContainer>| StaticContainer {
            kernel: GenComponent::new(spec, parent_context),
            max_retries,
            retry_delay,
            expected,
            children,
            loader,
        });
        container
            .kernel
            .set_self_ref(Rc::downgrade(&container) as Weak<dyn Component>);
        container.start_children().await?;
        Ok(container)
    }

    async fn start_children(&self) -> Result<()> {
        for spec in &self.expected {
            create_child(
                &self.children,
                &self.loader,
                self.max_retries,
                self.retry_delay,
                spec,
            )
            .await?;
            cooperative_yield().await;
        }
        Ok(())
    }

    pub fn children(&self) -> &Context {
        &self.children
    }

    pub fn expected(&self) -> &[Spec] {
        &self.expected
    }

    /// Shuts down every child not in `self.expected`, reserved, or marked
    /// `__ca_isNotUnknown__`. Best-effort: a failure is logged, never
    /// propagated (§4.4 step 2).
    async fn shutdown_unknowns(&self) {
        let expected_names: HashSet<&str> = self.expected.iter().map(|s| s.name.as_str()).collect();
        for name in self.children.names() {
            if expected_names.contains(name.as_str()) || is_reserved_name(&name) {
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

    /// The full shutdown-then-recreate cascade triggered when any expected
    /// child fails its health check. `original_error` is what's ultimately
    /// propagated if recreation also fails.
    async fn restart_all(&self, original_error: Error) -> Result<CheckupData> {
        warn!(container = %self.kernel.spec().name, "one-for-all restart triggered");
        for spec in self.expected.iter().rev() {
            if let Err(err) =
                shutdown_child(&self.children, self.max_retries, self.retry_delay, &spec.name).await
            {
                debug!(child = %spec.name, %err, "failed to shut down child during cascade");
            }
            cooperative_yield().await;
        }
        for spec in &self.expected {
            if let Err(err) = create_child(
                &self.children,
                &self.loader,
                self.max_retries,
                self.retry_delay,
                spec,
            )
            .await
            {
                warn!(child = %spec.name, %err, "cascade recreation failed, shutting down container");
                self.kernel.shutdown();
                return Err(original_error);
            }
            cooperative_yield().await;
        }
        Ok(CheckupData {
            restart_all: true,
            ..CheckupData::fresh()
        })
    }
}

#[async_trait(?Send)]
impl Component for StaticContainer {
    fn spec(&self) -> &Spec {
        self.kernel.spec()
    }

    fn is_shutdown(&self) -> bool {
        self.kernel.is_shutdown()
    }

    async fn checkup(&self, data: CheckupData) -> Result<CheckupData> {
        self.kernel.checkup(data)?;

        self.shutdown_unknowns().await;

        let mut failure: Option<Error> = None;
        for spec in &self.expected {
            if let Err(err) = check_child(&self.children, &spec.name).await {
                if spec.env_bool(ENV_TEMPORARY).unwrap_or(false) {
                    debug!(child = %spec.name, %err, "temporary child failed checkup");
                    continue;
                }
                failure = Some(err);
                break;
            }
            cooperative_yield().await;
        }

        match failure {
            None => Ok(data),
            Some(err) if data.do_not_restart => Err(err),
            Some(err) => self.restart_all(err).await,
        }
    }

    async fn shutdown(&self, _data: CheckupData) -> Result<()> {
        self.shutdown_unknowns().await;
        for spec in self.expected.iter().rev() {
            if let Err(err) =
                shutdown_child(&self.children, self.max_retries, self.retry_delay, &spec.name).await
            {
                debug!(child = %spec.name, %err, "child failed to shut down");
            }
            cooperative_yield().await;
        }
        self.kernel.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{Loader, ModuleEntry, StaticTableResolver};

    struct Hello(GenComponent);

    #[async_trait(?Send)]
    impl Component for Hello {
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

    async fn hello_factory(spec: Spec, context: Context) -> Result<Rc<dyn Component>> {
        Ok(Rc::new_cyclic(|weak: &Weak<Hello>| {
            let kernel = GenComponent::new(spec, context);
            kernel.set_self_ref(weak.clone() as Weak<dyn Component>);
            Hello(kernel)
        }))
    }

    fn test_loader() -> Rc<dyn ModuleLoader> {
        let resolver = StaticTableResolver::new("local")
            .register("hello_pkg", ModuleEntry::factory(hello_factory));
        Rc::new(Loader::new(vec![Rc::new(resolver) as Rc<dyn crate::loader::ModuleResolver>]))
    }

    fn container_spec(children: Vec<Spec>) -> Spec {
        Spec::new("root")
            .with_env("maxRetries", serde_json::json!(2))
            .with_env("retryDelay", serde_json::json!(0))
            .with_components(children)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn starts_children_in_declaration_order_and_registers_them() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let spec = container_spec(vec![
                    Spec::new("a").with_module("hello_pkg"),
                    Spec::new("b").with_module("hello_pkg"),
                ]);
                let container = StaticContainer::new_root(spec, test_loader()).await.unwrap();
                assert!(container.children().contains("a"));
                assert!(container.children().contains("b"));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn checkup_restarts_all_children_when_one_is_missing() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let spec = container_spec(vec![
                    Spec::new("a").with_module("hello_pkg"),
                    Spec::new("b").with_module("hello_pkg"),
                ]);
                let container = StaticContainer::new_root(spec, test_loader()).await.unwrap();
                let before = container.children().get("b").unwrap();

                // Simulate "a" having died out from under the container.
                container.children().remove("a");

                container.checkup(CheckupData::fresh()).await.unwrap();
                assert!(container.children().contains("a"));
                let after = container.children().get("b").unwrap();
                assert!(
                    !Rc::ptr_eq(&before, &after),
                    "surviving sibling should have been recreated by the one-for-all cascade"
                );
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shutdown_tears_down_every_child_and_is_idempotent() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let spec = container_spec(vec![Spec::new("a").with_module("hello_pkg")]);
                let container = StaticContainer::new_root(spec, test_loader()).await.unwrap();
                container.shutdown(CheckupData::fresh()).await.unwrap();
                assert!(container.is_shutdown());
                container.shutdown(CheckupData::fresh()).await.unwrap();
                assert!(container.is_shutdown());
            })
            .await;
    }
}
