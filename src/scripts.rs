//! Animation scripts: parameters, providers, introspection and execution

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_derive::Serialize;
use thiserror::Error;

mod host;
pub use host::*;

pub mod introspect;
pub use introspect::*;

mod parameter;
pub use parameter::*;

pub mod providers;
pub use providers::{CompiledScript, Provider, Providers, ScriptInstance};

mod runtime;
pub use runtime::*;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no provider for {0}")]
    Unsupported(PathBuf),
    #[error("compile error: {0}")]
    Compile(String),
    #[error("cannot instantiate script: {0}")]
    Instantiation(String),
    #[error("script error: {0}")]
    Runtime(String),
    #[error("script terminated")]
    Terminated,
    #[error("introspection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A compiled script and its declared parameters
#[derive(Clone)]
pub struct ScriptInfo {
    pub name: String,
    pub path: PathBuf,
    pub parameters: BTreeMap<String, ScriptParameter>,
    pub script: Arc<dyn CompiledScript>,
}

impl ScriptInfo {
    /// Public view of this script: unsupported parameters are left out
    pub fn descriptor(&self) -> ScriptDescriptor {
        ScriptDescriptor {
            name: self.name.clone(),
            parameters: self
                .parameters
                .values()
                .filter(|parameter| parameter.is_supported())
                .cloned()
                .collect(),
        }
    }
}

impl std::fmt::Debug for ScriptInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptInfo")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("parameters", &self.parameters)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptDescriptor {
    pub name: String,
    pub parameters: Vec<ScriptParameter>,
}
