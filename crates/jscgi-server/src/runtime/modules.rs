//! `require` for scripts and modules
//!
//! Modules use the CommonJS shape: the file body runs inside a function
//! receiving `exports`, `require`, `module`, `__filename` and `__dirname`
//! (plus the shared capabilities), and whatever ends up in `module.exports`
//! is what `require` returns. `.json` files are parsed instead of run.
//!
//! Specifiers starting with `./` or `../` resolve against the directory of
//! the requiring file; absolute paths are used as-is. Bare package names are
//! rejected since there is no package lookup. Resolved paths are
//! canonicalized, so the cache and the watcher agree on keys.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject},
    value::JsValue,
    Context, JsError, JsNativeError, JsResult, Source,
};
use boa_gc::{Finalize, Trace};
use jscgi_common::{CgiError, Result};

use crate::module_cache::ModuleCache;
use crate::runtime::bindings::{Capabilities, CAPABILITY_PARAMS};
use crate::runtime::conversions::json_to_js_value;
use crate::watcher::FileWatcher;

const MODULE_PARAMS: &str = "exports, require, module, __filename, __dirname";

/// What a `require` function closes over.
#[derive(Trace, Finalize)]
struct RequireCaptures {
    #[unsafe_ignore_trace]
    loader: Rc<ModuleLoader>,
    #[unsafe_ignore_trace]
    base_dir: PathBuf,
}

/// Loads, caches and (optionally) watches modules for one worker.
pub struct ModuleLoader {
    cache: Rc<ModuleCache<JsValue>>,
    watcher: Option<FileWatcher>,
    capabilities: Capabilities,
}

impl ModuleLoader {
    pub fn new(capabilities: Capabilities, watcher: Option<FileWatcher>) -> Self {
        Self {
            cache: Rc::new(ModuleCache::new()),
            watcher,
            capabilities,
        }
    }

    pub fn cache(&self) -> &Rc<ModuleCache<JsValue>> {
        &self.cache
    }

    pub fn watcher(&self) -> Option<&FileWatcher> {
        self.watcher.as_ref()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Builds the `require` function for a file living in `base_dir`.
    pub fn require_function(self: &Rc<Self>, base_dir: &Path, ctx: &mut Context) -> JsValue {
        let function = NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &RequireCaptures, ctx| {
                let specifier = match args.first() {
                    Some(value) if value.is_string() => value.to_string(ctx)?.to_std_string_escaped(),
                    _ => {
                        return Err(JsNativeError::typ()
                            .with_message("require: module name must be a string")
                            .into())
                    }
                };
                captures.loader.require(&specifier, &captures.base_dir, ctx)
            },
            RequireCaptures {
                loader: self.clone(),
                base_dir: base_dir.to_path_buf(),
            },
        );

        FunctionObjectBuilder::new(ctx.realm(), function)
            .name(js_string!("require"))
            .length(1)
            .build()
            .into()
    }

    /// Resolves `specifier`, registers a watch, and returns the module's exports.
    pub fn require(self: &Rc<Self>, specifier: &str, base_dir: &Path, ctx: &mut Context) -> JsResult<JsValue> {
        let path = resolve_module(specifier, base_dir).map_err(js_error)?;

        if let Some(watcher) = &self.watcher {
            if let Err(err) = watcher.watch(&path) {
                tracing::warn!("{}", err);
            }
        }

        // Keeps the module's own exception so it reaches the caller intact
        let mut thrown: Option<JsError> = None;
        let loaded = self.cache.load(&path, |path| {
            self.compile(path, ctx).map_err(|err| {
                let message = err.to_string();
                thrown = Some(err);
                CgiError::Module(message)
            })
        });

        match loaded {
            Ok(exports) => Ok(exports),
            Err(err) => Err(thrown.take().unwrap_or_else(|| js_error(err))),
        }
    }

    fn compile(self: &Rc<Self>, path: &Path, ctx: &mut Context) -> JsResult<JsValue> {
        let code = std::fs::read_to_string(path).map_err(|e| {
            JsNativeError::error().with_message(format!("Cannot read module '{}': {}", path.display(), e))
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            let json: serde_json::Value = serde_json::from_str(&code).map_err(|e| {
                JsNativeError::syntax().with_message(format!("{}: {}", path.display(), e))
            })?;
            return json_to_js_value(json, ctx).map_err(js_error);
        }

        let dir = path.parent().unwrap_or(Path::new("/"));
        let wrapped = format!(
            "(function ({}, {}) {{\n{}\n}})",
            MODULE_PARAMS, CAPABILITY_PARAMS, code
        );
        let function = ctx.eval(Source::from_bytes(&wrapped))?;
        let function = function
            .as_object()
            .map(|obj| obj.clone())
            .filter(|obj| obj.is_callable())
            .ok_or_else(|| JsNativeError::typ().with_message("module wrapper is not a function"))?;

        let exports = JsObject::with_object_proto(ctx.intrinsics());
        let module = JsObject::with_object_proto(ctx.intrinsics());
        module.set(js_string!("exports"), exports.clone(), false, ctx)?;
        module.set(
            js_string!("filename"),
            JsValue::new(js_string!(path.display().to_string())),
            false,
            ctx,
        )?;

        let mut args = vec![
            JsValue::from(exports.clone()),
            self.require_function(dir, ctx),
            JsValue::from(module.clone()),
            JsValue::new(js_string!(path.display().to_string())),
            JsValue::new(js_string!(dir.display().to_string())),
        ];
        args.extend(self.capabilities.values());

        function.call(&JsValue::from(exports), &args, ctx)?;
        module.get(js_string!("exports"), ctx)
    }
}

/// Maps a `require` specifier onto an existing file.
///
/// Tries the path itself, then with `.js` and `.json` appended, then
/// `index.js` inside it.
pub fn resolve_module(specifier: &str, base_dir: &Path) -> Result<PathBuf> {
    let relative = specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier == "."
        || specifier == "..";

    let target = if relative {
        base_dir.join(specifier)
    } else if Path::new(specifier).is_absolute() {
        PathBuf::from(specifier)
    } else {
        return Err(CgiError::Module(specifier.to_string()));
    };

    let candidates = [
        target.clone(),
        PathBuf::from(format!("{}.js", target.display())),
        PathBuf::from(format!("{}.json", target.display())),
        target.join("index.js"),
    ];

    candidates
        .iter()
        .find(|candidate| candidate.is_file())
        .and_then(|found| found.canonicalize().ok())
        .ok_or_else(|| CgiError::Module(specifier.to_string()))
}

fn js_error(err: CgiError) -> JsError {
    JsNativeError::error().with_message(err.to_string()).into()
}
