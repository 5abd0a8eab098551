//! Resolving a module path's first segment (`pkg` in `pkg#ns#factory`) to
//! a registered tree of factories, and walking the remaining `#`-joined
//! segments down to the leaf factory.

use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;

use crate::component::Component;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::spec::Spec;

/// Builds one component instance from a resolved spec and the context it
/// will live in.
#[async_trait(?Send)]
pub trait Factory {
    async fn create(&self, spec: Spec, context: Context) -> Result<Rc<dyn Component>>;
}

/// Allows an ordinary async closure to act as a [`Factory`], mirroring the
/// source's convention of exporting bare functions as module members.
#[async_trait(?Send)]
impl<F, Fut> Factory for F
where
    F: Fn(Spec, Context) -> Fut,
    Fut: std::future::Future<Output = Result<Rc<dyn Component>>>,
{
    async fn create(&self, spec: Spec, context: Context) -> Result<Rc<dyn Component>> {
        (self)(spec, context).await
    }
}

/// One node of a module's exported tree: either a factory directly, or a
/// namespace of further-nested entries (the `ns` segments of a
/// `pkg#ns#factory` path).
pub enum ModuleEntry {
    Factory(Rc<dyn Factory>),
    Namespace(HashMap<String, ModuleEntry>),
}

impl ModuleEntry {
    pub fn factory(factory: impl Factory + 'static) -> Self {
        ModuleEntry::Factory(Rc::new(factory))
    }

    pub fn namespace(entries: impl IntoIterator<Item = (String, ModuleEntry)>) -> Self {
        ModuleEntry::Namespace(entries.into_iter().collect())
    }

    /// Walks `accessors` down through nested namespaces to the factory at
    /// the end of the chain.
    pub fn descend(&self, module_name: &str, accessors: &[&str]) -> Result<&Rc<dyn Factory>> {
        let mut current = self;
        for segment in accessors {
            match current {
                ModuleEntry::Namespace(map) => {
                    current = map.get(*segment).ok_or_else(|| {
                        Error::invalid_spec(
                            module_name,
                            format!("module `{module_name}` has no member `{segment}`"),
                        )
                    })?;
                }
                ModuleEntry::Factory(_) => {
                    return Err(Error::invalid_spec(
                        module_name,
                        format!("`{segment}` accessed past a factory, not a namespace"),
                    ));
                }
            }
        }
        match current {
            ModuleEntry::Factory(factory) => Ok(factory),
            ModuleEntry::Namespace(_) => Err(Error::invalid_spec(
                module_name,
                "module path resolves to a namespace, not a factory",
            )),
        }
    }
}

/// Resolves a single `pkg` segment of a module path to its exported tree.
#[async_trait(?Send)]
pub trait ModuleResolver {
    /// A short name for this resolver, used in `ArtefactNotFound`'s
    /// `tried` list when every resolver in a chain fails.
    fn name(&self) -> &str;

    async fn resolve(&self, module_name: &str) -> Option<ModuleEntry>;
}

/// A resolver backed by an in-process table, registered up front by the
/// embedding application — the closest Rust analogue to the source's
/// `require()`-based module lookup, since this crate cannot dynamically
/// load arbitrary code at runtime.
pub struct StaticTableResolver {
    name: String,
    table: HashMap<String, Rc<ModuleEntry>>,
}

impl StaticTableResolver {
    pub fn new(name: impl Into<String>) -> Self {
        StaticTableResolver {
            name: name.into(),
            table: HashMap::new(),
        }
    }

    pub fn register(mut self, module_name: impl Into<String>, entry: ModuleEntry) -> Self {
        self.table.insert(module_name.into(), Rc::new(entry));
        self
    }
}

#[async_trait(?Send)]
impl ModuleResolver for StaticTableResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, module_name: &str) -> Option<ModuleEntry> {
        // `ModuleEntry` isn't `Clone` (factories are arbitrary trait
        // objects); namespaces are rebuilt on each lookup rather than
        // cached, which is fine since resolution only happens once per
        // component instantiation.
        self.table.get(module_name).map(|entry| clone_entry(entry))
    }
}

pub(super) fn clone_entry(entry: &ModuleEntry) -> ModuleEntry {
    match entry {
        ModuleEntry::Factory(factory) => ModuleEntry::Factory(Rc::clone(factory)),
        ModuleEntry::Namespace(map) => {
            ModuleEntry::Namespace(map.iter().map(|(k, v)| (k.clone(), clone_entry(v))).collect())
        }
    }
}

/// Chains several resolvers, trying each in order until one resolves the
/// requested module name. Mirrors the loader falling back from a local
/// registry to a remote one.
pub struct RegistryResolver {
    resolvers: Vec<Rc<dyn ModuleResolver>>,
}

impl RegistryResolver {
    pub fn new(resolvers: Vec<Rc<dyn ModuleResolver>>) -> Self {
        RegistryResolver { resolvers }
    }

    pub async fn resolve(&self, module_name: &str) -> Result<ModuleEntry> {
        let mut tried = Vec::new();
        for resolver in &self.resolvers {
            if let Some(entry) = resolver.resolve(module_name).await {
                return Ok(entry);
            }
            tried.push(resolver.name().to_string());
        }
        Err(Error::ArtefactNotFound {
            name: module_name.to_string(),
            tried,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{CheckupData, GenComponent};

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
            Ok(data)
        }
        async fn shutdown(&self, _data: CheckupData) -> Result<()> {
            self.0.shutdown();
            Ok(())
        }
    }

    async fn make_leaf(spec: Spec, context: Context) -> Result<Rc<dyn Component>> {
        Ok(Rc::new(Leaf(GenComponent::new(spec, context))))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn resolves_nested_accessor_chain() {
        let entry = ModuleEntry::namespace([(
            "ns".to_string(),
            ModuleEntry::namespace([("factory".to_string(), ModuleEntry::factory(make_leaf))]),
        )]);
        let factory = entry.descend("pkg", &["ns", "factory"]).unwrap();
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let component = factory
                    .create(Spec::new("a").with_module("pkg#ns#factory"), Context::detached())
                    .await
                    .unwrap();
                assert_eq!(component.spec().name, "a");
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn registry_resolver_reports_every_tried_name_on_failure() {
        let a: Rc<dyn ModuleResolver> = Rc::new(StaticTableResolver::new("local"));
        let b: Rc<dyn ModuleResolver> = Rc::new(StaticTableResolver::new("remote"));
        let registry = RegistryResolver::new(vec![a, b]);
        let err = registry.resolve("missing").await.unwrap_err();
        match err {
            Error::ArtefactNotFound { tried, .. } => {
                assert_eq!(tried, vec!["local".to_string(), "remote".to_string()])
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
