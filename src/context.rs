//! The per-container namespace of live children, plus the two reserved
//! entries every context carries a reference to rather than a copy of:
//! the tree root (`_`) and, at the top level only, the module loader
//! (`loader`).
//!
//! A container creates one fresh `Context` per instantiation and hands a
//! *child* of it (via [`Context::child`]) to each of its own children, so
//! `_` always resolves to the same root no matter how deep in the tree a
//! lookup happens.

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::component::Component;
use crate::loader::ModuleLoader;

struct Shared {
    root: Option<Weak<dyn Component>>,
    loader: Option<Rc<dyn ModuleLoader>>,
}

/// A namespace mapping child names to live components, plus a shared
/// back-reference to the tree root and (at the top) the loader.
///
/// Cheap to clone: the map and the shared root/loader pointer are both
/// behind an `Rc`, so cloning a `Context` aliases the same namespace
/// rather than copying it. Use [`Context::child`] when you want a fresh,
/// independent namespace that still shares the root/loader.
#[derive(Clone)]
pub struct Context {
    children: Rc<std::cell::RefCell<HashMap<String, Rc<dyn Component>>>>,
    shared: Rc<Shared>,
}

impl Context {
    /// A context for the tree root itself. `root` is usually a `Weak`
    /// pointer obtained via `Rc::new_cyclic` while the root component is
    /// still being constructed.
    pub fn new_root(root: Weak<dyn Component>, loader: Rc<dyn ModuleLoader>) -> Self {
        Context {
            children: Rc::new(std::cell::RefCell::new(HashMap::new())),
            shared: Rc::new(Shared {
                root: Some(root),
                loader: Some(loader),
            }),
        }
    }

    /// A context with a loader but no real tree root — useful for
    /// exercising a single container in isolation (tests, or a
    /// standalone dynamic container not mounted under a supervisor).
    pub fn with_loader(loader: Rc<dyn ModuleLoader>) -> Self {
        Context {
            children: Rc::new(std::cell::RefCell::new(HashMap::new())),
            shared: Rc::new(Shared {
                root: None,
                loader: Some(loader),
            }),
        }
    }

    /// A context with no root and no loader, usable only for components
    /// that will never look either up (unit tests, leaf components
    /// exercised in isolation).
    pub fn detached() -> Self {
        Context {
            children: Rc::new(std::cell::RefCell::new(HashMap::new())),
            shared: Rc::new(Shared {
                root: None,
                loader: None,
            }),
        }
    }

    /// A fresh, independent namespace for a new container's children,
    /// sharing this context's root and loader.
    pub fn child(&self) -> Context {
        Context {
            children: Rc::new(std::cell::RefCell::new(HashMap::new())),
            shared: Rc::clone(&self.shared),
        }
    }

    pub fn insert(&self, name: impl Into<String>, component: Rc<dyn Component>) {
        self.children.borrow_mut().insert(name.into(), component);
    }

    pub fn remove(&self, name: &str) -> Option<Rc<dyn Component>> {
        self.children.borrow_mut().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn Component>> {
        self.children.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.children.borrow().contains_key(name)
    }

    /// Names currently registered, in no particular order — callers that
    /// need declaration order track it separately (containers keep their
    /// own `spec.components` list for that).
    pub fn names(&self) -> Vec<String> {
        self.children.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.children.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.borrow().is_empty()
    }

    /// The tree root, if one was set and is still alive.
    pub fn root(&self) -> Option<Rc<dyn Component>> {
        self.shared.root.as_ref().and_then(Weak::upgrade)
    }

    /// The module loader, present only on contexts descended from
    /// [`Context::new_root`].
    pub fn loader(&self) -> Option<Rc<dyn ModuleLoader>> {
        self.shared.loader.clone()
    }
}
