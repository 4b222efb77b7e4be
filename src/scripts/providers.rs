use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::{ExecutionMode, ScriptError, ScriptHost, ScriptParameter, ScriptValue};

mod rhai;

/// Trait for script providers.
///
/// A script provider compiles script source files written in a given language.
pub trait Provider: std::fmt::Debug + Send + Sync {
    /// Returns if this provider supports the given script file
    ///
    /// # Parameters
    ///
    /// * `path`: path to the script file
    fn supports(&self, path: &Path) -> bool;

    /// Compile a script
    ///
    /// # Parameters
    ///
    /// * `name`: name of the script, used in log messages
    /// * `source`: script source code
    fn compile(&self, name: &str, source: &str) -> Result<Arc<dyn CompiledScript>, ScriptError>;
}

/// A successfully compiled script
pub trait CompiledScript: Send + Sync {
    /// Create a new instance of this script bound to `host`.
    ///
    /// Each parameter in `parameters` is visible to the script under its name, with its bound
    /// value.
    fn instantiate(
        &self,
        host: Arc<dyn ScriptHost>,
        mode: ExecutionMode,
        parameters: &BTreeMap<String, ScriptParameter>,
    ) -> Result<Box<dyn ScriptInstance>, ScriptError>;
}

/// A script bound to a host, ready to run
pub trait ScriptInstance: Send {
    /// Run the script body
    fn run(&mut self) -> Result<(), ScriptError>;

    /// Invoke a callback the script registered with its host
    fn call(&mut self, action: &ScriptValue) -> Result<(), ScriptError>;
}

#[derive(Debug)]
pub struct Providers {
    providers: Vec<Arc<dyn Provider>>,
}

impl Default for Providers {
    fn default() -> Self {
        Self::new()
    }
}

impl Providers {
    pub fn new() -> Self {
        Self {
            providers: vec![Arc::new(rhai::RhaiProvider::new())],
        }
    }

    pub fn get(&self, path: &Path) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|provider| provider.supports(path))
            .cloned()
    }

    /// Name of the script stored at `path`: its file name without extension
    pub fn script_name(path: &Path) -> Option<String> {
        path.file_stem()
            .and_then(std::ffi::OsStr::to_str)
            .filter(|name| !name.is_empty() && !name.starts_with('.'))
            .map(str::to_owned)
    }
}
