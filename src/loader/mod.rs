//! Turning a resolved [`Spec`](crate::spec::Spec) tree into a live
//! component tree: resolving each node's module path to a factory and
//! invoking it, file I/O for description/delta documents, and the
//! resolver chain modules register their factories through.

mod description;
mod resolver;

pub use description::{load_component, load_description, load_resource};
pub use resolver::{Factory, ModuleEntry, ModuleResolver, RegistryResolver, StaticTableResolver};

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use async_trait::async_trait;

use crate::component::Component;
use crate::context::Context;
use crate::error::Result;
use crate::spec::Spec;

/// The context-visible handle to module resolution and instantiation.
/// Every context descended from the tree root carries an `Rc<dyn
/// ModuleLoader>` so any component can instantiate a fresh subtree (the
/// dynamic container's `instanceChild`, the supervisor's restart path)
/// without needing its own copy of the resolver chain.
#[async_trait(?Send)]
pub trait ModuleLoader {
    async fn resolve_module(&self, module_name: &str) -> Result<ModuleEntry>;

    /// Instantiates `spec` by resolving its module path and invoking the
    /// factory, with panic-safety via [`load_component`].
    async fn instantiate(&self, spec: Spec, context: Context) -> Result<Rc<dyn Component>> {
        load_component(self, spec, context).await
    }

    /// Reads and resolves a description file: base ← sibling delta
    /// (`overrideName=false`) ← `spec_override` (`overrideName=true`),
    /// then env resolution and top-env linking (§4.2's `loadDescription`).
    /// The default implementation is stateless (always reads and
    /// reparses from disk); [`Loader`] overrides this to consult its own
    /// parsed-description cache first.
    async fn load_description(&self, path: &Path, spec_override: Option<&Spec>) -> Result<Spec> {
        description::load_description(path, spec_override).await
    }
}

/// The default [`ModuleLoader`]: a chain of [`ModuleResolver`]s consulted
/// in order behind a static-artefact override table, with a cache of
/// already-parsed description files and a record of which resolver (or
/// the static table) supplied each resolved module.
pub struct Loader {
    resolvers: RefCell<Vec<Rc<dyn ModuleResolver>>>,
    static_artifacts: RefCell<HashMap<String, ModuleEntry>>,
    module_index: RefCell<HashMap<String, String>>,
    description_cache: RefCell<HashMap<String, Spec>>,
}

/// The resolver id recorded in the module index when an artefact was
/// served from the static override table rather than a real resolver.
const STATIC_TABLE_INDEX_NAME: &str = "static";

impl Loader {
    pub fn new(resolvers: Vec<Rc<dyn ModuleResolver>>) -> Self {
        Loader {
            resolvers: RefCell::new(resolvers),
            static_artifacts: RefCell::new(HashMap::new()),
            module_index: RefCell::new(HashMap::new()),
            description_cache: RefCell::new(HashMap::new()),
        }
    }

    /// Replaces the resolver chain wholesale. Clears the parsed-description
    /// cache, since a new resolver chain may serve different bytes for the
    /// same logical path (§4.2: "replace the resolver sequence; clears the
    /// description cache").
    pub fn set_modules(&self, resolvers: Vec<Rc<dyn ModuleResolver>>) {
        *self.resolvers.borrow_mut() = resolvers;
        self.description_cache.borrow_mut().clear();
    }

    /// Installs a table of pre-loaded modules that bypasses resolver
    /// lookup entirely, returning whatever table was installed before.
    pub fn set_static_artifacts(&self, table: HashMap<String, ModuleEntry>) -> HashMap<String, ModuleEntry> {
        std::mem::replace(&mut *self.static_artifacts.borrow_mut(), table)
    }

    /// Which resolver (or `"static"` for the override table) last supplied
    /// each successfully resolved module name. Exposed for introspection
    /// and tests; not consulted by resolution itself.
    pub fn module_index(&self) -> HashMap<String, String> {
        self.module_index.borrow().clone()
    }

    /// Caches a resolved base description under `path` so a later
    /// `load_description` for the same path skips re-reading and
    /// re-parsing the file (the delta sibling and any spec-override are
    /// still re-applied fresh every call).
    fn cached_template(&self, path: &str) -> Option<Spec> {
        self.description_cache.borrow().get(path).cloned()
    }

    fn cache_template(&self, path: String, template: Spec) {
        self.description_cache.borrow_mut().insert(path, template);
    }
}

#[async_trait(?Send)]
impl ModuleLoader for Loader {
    async fn resolve_module(&self, module_name: &str) -> Result<ModuleEntry> {
        if let Some(entry) = self.static_artifacts.borrow().get(module_name) {
            let entry = resolver::clone_entry(entry);
            self.module_index
                .borrow_mut()
                .insert(module_name.to_string(), STATIC_TABLE_INDEX_NAME.to_string());
            return Ok(entry);
        }

        let resolvers = self.resolvers.borrow().clone();
        let mut tried = Vec::new();
        for resolver in &resolvers {
            if let Some(entry) = resolver.resolve(module_name).await {
                self.module_index
                    .borrow_mut()
                    .insert(module_name.to_string(), resolver.name().to_string());
                return Ok(entry);
            }
            tried.push(resolver.name().to_string());
        }
        Err(crate::error::Error::ArtefactNotFound {
            name: module_name.to_string(),
            tried,
        })
    }

    async fn load_description(&self, path: &Path, spec_override: Option<&Spec>) -> Result<Spec> {
        let key = path.to_string_lossy().to_string();
        let template = match self.cached_template(&key) {
            Some(cached) => cached,
            None => {
                let parsed = description::load_description_template(path).await?;
                self.cache_template(key, parsed.clone());
                parsed
            }
        };
        description::resolve_description(path, template, spec_override).await
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
            self.0.checkup(data)
        }
        async fn shutdown(&self, _data: CheckupData) -> Result<()> {
            self.0.shutdown();
            Ok(())
        }
    }

    async fn leaf_factory(spec: Spec, context: Context) -> Result<Rc<dyn Component>> {
        Ok(Rc::new(Leaf(GenComponent::new(spec, context))))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn static_artifacts_bypass_resolvers_and_are_recorded_in_the_module_index() {
        let loader = Loader::new(Vec::new());
        let mut table = HashMap::new();
        table.insert("hello_pkg".to_string(), ModuleEntry::factory(leaf_factory));
        let previous = loader.set_static_artifacts(table);
        assert!(previous.is_empty());

        loader.resolve_module("hello_pkg").await.unwrap();
        assert_eq!(
            loader.module_index().get("hello_pkg").map(String::as_str),
            Some(STATIC_TABLE_INDEX_NAME)
        );
    }

    #[test]
    fn set_modules_clears_the_description_cache() {
        let loader = Loader::new(Vec::new());
        loader.cache_template("a.json".to_string(), Spec::new("a").with_module("m"));
        assert!(loader.cached_template("a.json").is_some());
        loader.set_modules(Vec::new());
        assert!(loader.cached_template("a.json").is_none());
    }
}
