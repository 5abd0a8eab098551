/*!
A component lifecycle and supervision framework for single-threaded,
cooperatively-scheduled component trees, in the style of an OTP
supervision tree.

# Main concepts

A [`spec::Spec`] declares a component tree: a name, a module path to a
factory, an `env` map of configuration, and (for containers) a
declaration-ordered list of child specs. [`loader::Loader`] resolves
module paths to [`loader::Factory`] implementations and instantiates a
[`component::Component`] tree from a resolved spec.

Every node in the tree — a plain leaf, a [`container::StaticContainer`]
("`one-for-all`": a single failing child restarts every sibling), a
[`dynamic_container::DynamicContainer`] ("`one-for-one`": children are
created and deleted at runtime, each restarted independently), or a
[`transactional::TransactionalContainer`] (adds two-phase commit over a
subset of its children) — implements [`component::Component`]. A
[`supervisor::Supervisor`] sits at the root, driving the tree with a
periodic health-check tick and escalating to process exit if the tree
becomes unrecoverable.

Components never need `Send`: the whole tree runs on one
`tokio::task::LocalSet` driven by a current-thread runtime, so
`Rc`/`RefCell`/`Cell` are used throughout instead of `Arc`/`Mutex`.

# Loading a tree from disk

[`loader::load_description`] reads a JSON description file, optionally
merged with a sibling `++`-suffixed delta file and then a caller-supplied
spec-override, into a resolved [`spec::Spec`], applying
`process.env.NAME||default` and `$._.env.KEY` substitution. The
`componentry` binary wires this up behind a small `clap` CLI as the
filesystem-facing edge of the crate; the library itself never touches a
path directly except through a [`loader::ModuleLoader`]'s resolver
chain.
*/

pub mod component;
pub mod container;
pub mod context;
pub mod dynamic_container;
pub mod env_resolve;
pub mod error;
pub mod loader;
pub mod merge;
pub mod spec;
pub mod supervisor;
pub mod transactional;
pub mod util;

pub use component::{CheckupData, Component, GenComponent};
pub use container::StaticContainer;
pub use context::Context;
pub use dynamic_container::DynamicContainer;
pub use error::{Error, Result};
pub use loader::{Loader, ModuleLoader};
pub use spec::Spec;
pub use supervisor::{Supervisor, TickReport};
pub use transactional::TransactionalContainer;
