//! The supervisor: the periodic health-check driver that sits at the root
//! of a tree, extending the static container with a ticking timer, hang
//! detection, and terminal process-exit escalation.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::error;

use crate::component::{CheckupData, Component};
use crate::container::StaticContainer;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::loader::ModuleLoader;
use crate::spec::Spec;

/// One outcome of a health-check tick, delivered to a subscribed notifier.
/// Lets `helloworld`/`supervisor`/`dynamic`-style end-to-end scenarios
/// observe the supervisor's progress without polling internal state.
#[derive(Clone, Debug)]
pub enum TickReport {
    Ok(CheckupData),
    HangRetrying { consecutive: u32 },
    Fatal(String),
}

fn require_supervisor_policy(spec: &Spec) -> Result<(Duration, Option<Duration>, u32)> {
    let interval_ms = spec
        .env_u64("interval")
        .ok_or_else(|| Error::invalid_spec(&spec.name, "supervisor spec is missing required env.interval"))?;
    let die_delay_ms = spec
        .env_i64("dieDelay")
        .ok_or_else(|| Error::invalid_spec(&spec.name, "supervisor spec is missing required env.dieDelay"))?;
    let max_hang_retries = spec.env_u64("maxHangRetries").ok_or_else(|| {
        Error::invalid_spec(&spec.name, "supervisor spec is missing required env.maxHangRetries")
    })?;
    let die_delay = if die_delay_ms < 0 {
        None
    } else {
        Some(Duration::from_millis(die_delay_ms as u64))
    };
    Ok((Duration::from_millis(interval_ms), die_delay, max_hang_retries as u32))
}

/// A static container driven by a periodic timer, with hang detection and
/// terminal escalation (`die`) on an unrecoverable failure.
///
/// Wraps a [`StaticContainer`] by composition, the same shape every other
/// kernel in this crate uses instead of inheritance. In lazy-start mode
/// the container isn't built at all until the first tick fires — `spec`/
/// `loader` are kept around for that deferred construction.
pub struct Supervisor {
    spec: Spec,
    loader: Rc<dyn ModuleLoader>,
    container: RefCell<Option<Rc<StaticContainer>>>,
    interval: Duration,
    die_delay: Option<Duration>,
    max_hang_retries: u32,
    pending: Cell<bool>,
    hang_count: Cell<u32>,
    notifier: RefCell<Option<mpsc::UnboundedSender<TickReport>>>,
    dead: Cell<bool>,
}

impl Supervisor {
    /// Synchronous start: builds the tree, runs one health-check before
    /// returning, and only starts the timer if that check passes.
    pub async fn start(spec: Spec, loader: Rc<dyn ModuleLoader>) -> Result<Rc<Supervisor>> {
        Supervisor::start_with_notifier(spec, loader, None).await
    }

    pub async fn start_with_notifier(
        spec: Spec,
        loader: Rc<dyn ModuleLoader>,
        notifier: Option<mpsc::UnboundedSender<TickReport>>,
    ) -> Result<Rc<Supervisor>> {
        let (interval, die_delay, max_hang_retries) = require_supervisor_policy(&spec)?;
        let container = StaticContainer::new_root(spec.clone(), Rc::clone(&loader)).await?;
        container.checkup(CheckupData::fresh()).await?;

        let supervisor = Rc::new(Supervisor {
            spec,
            loader,
            container: RefCell::new(Some(container)),
            interval,
            die_delay,
            max_hang_retries,
            pending: Cell::new(false),
            hang_count: Cell::new(0),
            notifier: RefCell::new(notifier),
            dead: Cell::new(false),
        });
        supervisor.spawn_tick_loop();
        Ok(supervisor)
    }

    /// Lazy start: returns immediately without awaiting tree construction
    /// or a health check; the first tick builds the tree and reports its
    /// own result through the notifier.
    pub fn start_lazy(spec: Spec, loader: Rc<dyn ModuleLoader>) -> Result<Rc<Supervisor>> {
        Supervisor::start_lazy_with_notifier(spec, loader, None)
    }

    pub fn start_lazy_with_notifier(
        spec: Spec,
        loader: Rc<dyn ModuleLoader>,
        notifier: Option<mpsc::UnboundedSender<TickReport>>,
    ) -> Result<Rc<Supervisor>> {
        let (interval, die_delay, max_hang_retries) = require_supervisor_policy(&spec)?;
        let supervisor = Rc::new(Supervisor {
            spec,
            loader,
            container: RefCell::new(None),
            interval,
            die_delay,
            max_hang_retries,
            pending: Cell::new(false),
            hang_count: Cell::new(0),
            notifier: RefCell::new(notifier),
            dead: Cell::new(false),
        });
        supervisor.spawn_tick_loop();
        Ok(supervisor)
    }

    pub fn children(&self) -> Option<Context> {
        self.container.borrow().as_ref().map(|c| c.children().clone())
    }

    pub fn is_dead(&self) -> bool {
        self.dead.get()
    }

    pub fn set_notifier(&self, notifier: mpsc::UnboundedSender<TickReport>) {
        *self.notifier.borrow_mut() = Some(notifier);
    }

    fn notify(&self, report: TickReport) {
        if let Some(sender) = self.notifier.borrow().as_ref() {
            let _ = sender.send(report);
        }
    }

    fn spawn_tick_loop(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        let interval = self.interval;
        tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick fires immediately; consume it up front
            loop {
                ticker.tick().await;
                let Some(supervisor) = weak.upgrade() else { break };
                if supervisor.dead.get() {
                    break;
                }
                if supervisor.pending.get() {
                    let consecutive = supervisor.hang_count.get() + 1;
                    supervisor.hang_count.set(consecutive);
                    if consecutive > supervisor.max_hang_retries {
                        supervisor
                            .die(format!(
                                "health check still in progress after {consecutive} consecutive ticks"
                            ))
                            .await;
                        break;
                    }
                    supervisor.notify(TickReport::HangRetrying { consecutive });
                    continue;
                }
                supervisor.pending.set(true);
                let supervisor = Rc::clone(&supervisor);
                tokio::task::spawn_local(async move {
                    supervisor.run_one_tick().await;
                });
            }
        });
    }

    async fn run_one_tick(self: Rc<Self>) {
        let result = self.checkup_once().await;
        self.pending.set(false);
        self.hang_count.set(0);
        match result {
            Ok(data) => self.notify(TickReport::Ok(data)),
            Err(err) => self.notify(TickReport::Fatal(err.to_string())),
        }
    }

    async fn ensure_container(&self) -> Result<Rc<StaticContainer>> {
        if let Some(existing) = self.container.borrow().clone() {
            return Ok(existing);
        }
        let built = StaticContainer::new_root(self.spec.clone(), Rc::clone(&self.loader)).await?;
        *self.container.borrow_mut() = Some(Rc::clone(&built));
        Ok(built)
    }

    async fn checkup_once(&self) -> Result<CheckupData> {
        let container = match self.ensure_container().await {
            Ok(container) => container,
            Err(err) => {
                self.die(format!("failed to construct component tree: {err}")).await;
                return Err(err);
            }
        };
        match container.checkup(CheckupData::fresh()).await {
            Ok(data) => Ok(data),
            Err(err) => {
                self.die(format!("unrecoverable checkup failure: {err}")).await;
                Err(err)
            }
        }
    }

    /// Logs, optionally schedules a process exit, and shuts the tree down.
    /// The only place in this crate that may terminate the process.
    async fn die(&self, message: String) {
        error!(supervisor = %self.spec.name, %message, "supervisor terminating");
        self.dead.set(true);
        if let Some(delay) = self.die_delay {
            tokio::task::spawn_local(async move {
                tokio::time::sleep(delay).await;
                std::process::exit(1);
            });
        }
        if let Some(container) = self.container.borrow_mut().take() {
            let _ = container.shutdown(CheckupData::fresh()).await;
        }
        self.notify(TickReport::Fatal(message));
    }
}

#[async_trait(?Send)]
impl Component for Supervisor {
    fn spec(&self) -> &Spec {
        &self.spec
    }

    fn is_shutdown(&self) -> bool {
        self.dead.get() || self.container.borrow().as_ref().map(|c| c.is_shutdown()).unwrap_or(false)
    }

    async fn checkup(&self, _data: CheckupData) -> Result<CheckupData> {
        self.checkup_once().await
    }

    async fn shutdown(&self, data: CheckupData) -> Result<()> {
        self.dead.set(true);
        if let Some(container) = self.container.borrow_mut().take() {
            container.shutdown(data).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::GenComponent;
    use crate::loader::{Loader, ModuleEntry, ModuleResolver, StaticTableResolver};
    use serde_json::json;
    use std::rc::Weak;

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

    /// A leaf whose `checkup` never resolves, used to simulate an
    /// overlapping ("hung") health-check tick.
    struct HangingLeaf(GenComponent);

    #[async_trait(?Send)]
    impl Component for HangingLeaf {
        fn spec(&self) -> &Spec {
            self.0.spec()
        }
        fn is_shutdown(&self) -> bool {
            self.0.is_shutdown()
        }
        async fn checkup(&self, _data: CheckupData) -> Result<CheckupData> {
            std::future::pending::<()>().await;
            unreachable!()
        }
        async fn shutdown(&self, _data: CheckupData) -> Result<()> {
            self.0.shutdown();
            Ok(())
        }
    }

    async fn hanging_factory(spec: Spec, context: Context) -> Result<Rc<dyn Component>> {
        Ok(Rc::new_cyclic(|weak: &Weak<HangingLeaf>| {
            let kernel = GenComponent::new(spec, context);
            kernel.set_self_ref(weak.clone() as Weak<dyn Component>);
            HangingLeaf(kernel)
        }))
    }

    fn test_loader() -> Rc<dyn ModuleLoader> {
        let resolver = StaticTableResolver::new("local")
            .register("hello_pkg", ModuleEntry::factory(hello_factory))
            .register("hanging_pkg", ModuleEntry::factory(hanging_factory));
        Rc::new(Loader::new(vec![Rc::new(resolver) as Rc<dyn ModuleResolver>]))
    }

    fn supervisor_spec(children: Vec<Spec>, max_hang_retries: u64) -> Spec {
        Spec::new("root")
            .with_env("maxRetries", json!(1))
            .with_env("retryDelay", json!(0))
            .with_env("interval", json!(50))
            .with_env("dieDelay", json!(-1))
            .with_env("maxHangRetries", json!(max_hang_retries))
            .with_components(children)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn start_fails_synchronously_when_initial_checkup_fails() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let spec = supervisor_spec(vec![Spec::new("a").with_module("missing_pkg")], 3);
                let result = Supervisor::start(spec, test_loader()).await;
                assert!(result.is_err());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn start_lazy_builds_the_tree_on_first_tick_and_notifies() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let spec = supervisor_spec(vec![Spec::new("a").with_module("hello_pkg")], 3);
                let supervisor = Supervisor::start_lazy_with_notifier(spec, test_loader(), Some(tx)).unwrap();
                assert!(supervisor.children().is_none());

                tokio::time::advance(Duration::from_millis(200)).await;
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;

                let report = rx.recv().await.unwrap();
                assert!(matches!(report, TickReport::Ok(_)));
                assert!(supervisor.children().unwrap().contains("a"));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn persistent_hang_triggers_die_after_max_hang_retries() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let spec = supervisor_spec(vec![Spec::new("h").with_module("hanging_pkg")], 1);
                let supervisor = Supervisor::start_lazy_with_notifier(spec, test_loader(), Some(tx)).unwrap();

                let mut saw_fatal = false;
                for _ in 0..6 {
                    tokio::time::advance(Duration::from_millis(50)).await;
                    tokio::task::yield_now().await;
                    tokio::task::yield_now().await;
                    while let Ok(report) = rx.try_recv() {
                        if matches!(report, TickReport::Fatal(_)) {
                            saw_fatal = true;
                        }
                    }
                    if saw_fatal {
                        break;
                    }
                }

                assert!(saw_fatal, "expected a Fatal tick report once hang retries were exhausted");
                assert!(supervisor.is_dead());
            })
            .await;
    }
}
