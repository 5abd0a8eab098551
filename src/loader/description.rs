//! Reading description files off disk, applying sibling delta files, and
//! instantiating the component tree they describe.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::component::Component;
use crate::context::Context;
use crate::env_resolve::{resolve_env, resolve_links};
use crate::error::{Error, Result};
use crate::merge::merge;
use crate::spec::Spec;

use super::ModuleLoader;

/// Reads a file's raw contents. Broken out as its own function, mirroring
/// the source's separation between "fetch bytes" and "parse spec", since
/// the loader's other callers (module bytecode, transactional state
/// dumps) read files without ever parsing them as a `Spec`.
pub async fn load_resource(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    tokio::fs::read_to_string(path).await.map_err(|err| {
        Error::invalid_spec(
            path.to_string_lossy(),
            format!("failed to read resource: {err}"),
        )
    })
}

/// Loads `path` as a `Spec`, then looks for a sibling `<base>++.json` delta
/// file (e.g. `app.json` → `app++.json`) and merges it on top if present,
/// then merges `spec_override` on top (`overrideName=true`, §4.2 step 4:
/// `base ← delta[overrideName=false] ← specOverride[overrideName=true]`),
/// then runs environment resolution and top-env linking over the result.
///
/// The returned spec is fully resolved: ready for [`load_component`]
/// without any further processing. Stateless: re-reads and re-parses
/// `path` on every call. [`super::Loader`] instead caches the parsed base
/// template and calls [`load_description_template`]/[`resolve_description`]
/// directly so repeated loads of the same path skip the re-parse.
pub async fn load_description(path: impl AsRef<Path>, spec_override: Option<&Spec>) -> Result<Spec> {
    let path = path.as_ref();
    let template = load_description_template(path).await?;
    resolve_description(path, template, spec_override).await
}

/// The first half of [`load_description`]: validates the `.json`
/// extension and reads+parses the base description, with no delta
/// merging or env/link resolution applied yet. This is the piece
/// [`super::Loader`] caches by path.
pub(super) async fn load_description_template(path: &Path) -> Result<Spec> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return Err(Error::invalid_spec(
            path.to_string_lossy(),
            "description file name must end with `.json`",
        ));
    }
    let raw = load_resource(path).await?;
    serde_json::from_str(&raw)
        .map_err(|err| Error::invalid_spec(path.to_string_lossy(), format!("invalid JSON: {err}")))
}

/// The second half of [`load_description`]: merges `template` with its
/// sibling `++.json` delta (if any, `overrideName=false`), then merges
/// `spec_override` on top (if any, `overrideName=true` — the caller is
/// allowed to rename the root), and runs env resolution/top-env linking.
/// Always re-run fresh, even when `template` came from the loader's
/// cache, since the delta file, the caller's override, and the
/// environment can all change independently of the base description.
pub(super) async fn resolve_description(
    path: &Path,
    template: Spec,
    spec_override: Option<&Spec>,
) -> Result<Spec> {
    let delta_path = sibling_delta_path(path);
    let mut resolved = if tokio::fs::try_exists(&delta_path).await.unwrap_or(false) {
        let delta_raw = load_resource(&delta_path).await?;
        let delta: Spec = serde_json::from_str(&delta_raw).map_err(|err| {
            Error::invalid_spec(delta_path.to_string_lossy(), format!("invalid JSON: {err}"))
        })?;
        merge(&template, &delta, false)?
    } else {
        template
    };

    if let Some(spec_override) = spec_override {
        resolved = merge(&resolved, spec_override, true)?;
    }

    resolved.validate()?;
    resolve_env(&mut resolved)?;
    resolve_links(&mut resolved)?;
    Ok(resolved)
}

fn sibling_delta_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());
    let file_name = match ext {
        Some(ext) => format!("{stem}++.{ext}"),
        None => format!("{stem}++"),
    };
    path.with_file_name(file_name)
}

/// Resolves `spec`'s module path through `loader` and invokes the factory,
/// guarding against the factory function panicking instead of returning
/// an error.
///
/// The factory call runs on a spawned local task so a panic inside it
/// surfaces as a `JoinError` rather than unwinding through the caller —
/// the same boundary the source draws between "the factory threw" and
/// "the loader itself failed".
pub async fn load_component(
    loader: &dyn ModuleLoader,
    spec: Spec,
    context: Context,
) -> Result<Rc<dyn Component>> {
    spec.validate()?;
    let (module_name, accessors) = spec.module_accessor_chain()?;
    let module_name = module_name.to_string();
    let accessors: Vec<String> = accessors.into_iter().map(str::to_string).collect();

    let entry = loader.resolve_module(&module_name).await?;
    let accessor_refs: Vec<&str> = accessors.iter().map(String::as_str).collect();
    let factory = Rc::clone(entry.descend(&module_name, &accessor_refs)?);

    let local = tokio::task::spawn_local(async move { factory.create(spec, context).await });
    match local.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(Error::FactoryException {
            module: module_name,
            message: "factory panicked".to_string(),
            was_thrown: true,
        }),
        Err(join_err) => Err(Error::FactoryException {
            module: module_name,
            message: format!("factory task failed to run: {join_err}"),
            was_thrown: false,
        }),
    }
}
