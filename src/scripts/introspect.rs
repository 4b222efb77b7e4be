//! Dry run extracting the parameters a script declares

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    CompiledScript, ExecutionMode, HostError, ScriptError, ScriptHost, ScriptParameter,
    ScriptValue, TimerHandle,
};
use crate::color::ColorRgb;

/// Host used for dry runs: records the declared parameters, then aborts the script.
///
/// Any other capability is unavailable and aborts the dry run as well.
#[derive(Debug, Default)]
pub struct IntrospectHost {
    parameters: Mutex<Option<Vec<ScriptParameter>>>,
    violation: Mutex<Option<&'static str>>,
}

impl IntrospectHost {
    fn unavailable<T>(&self, operation: &'static str) -> Result<T, HostError> {
        self.violation.lock().get_or_insert(operation);
        Err(HostError::NotAvailable(operation))
    }

    /// First unavailable operation the script attempted
    pub fn violation(&self) -> Option<&'static str> {
        *self.violation.lock()
    }

    pub fn take_parameters(&self) -> BTreeMap<String, ScriptParameter> {
        self.parameters
            .lock()
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|parameter| (parameter.name().to_owned(), parameter))
            .collect()
    }
}

impl ScriptHost for IntrospectHost {
    fn led_count(&self) -> Result<usize, HostError> {
        self.unavailable("led_count")
    }

    fn set_led_count(&self, _count: usize) -> Result<(), HostError> {
        self.unavailable("set_led_count")
    }

    fn set_pixel(&self, _index: i64, _color: ColorRgb) -> Result<(), HostError> {
        self.unavailable("set_pixel")
    }

    fn set_all(&self, _color: ColorRgb) -> Result<(), HostError> {
        self.unavailable("set_all")
    }

    fn publish(&self) -> Result<(), HostError> {
        self.unavailable("publish")
    }

    fn after(&self, _delay_ms: i64, _action: ScriptValue) -> Result<TimerHandle, HostError> {
        self.unavailable("after")
    }

    fn every(&self, _interval_ms: i64, _action: ScriptValue) -> Result<TimerHandle, HostError> {
        self.unavailable("every")
    }

    fn cancel(&self, _handle: TimerHandle) -> Result<(), HostError> {
        self.unavailable("cancel")
    }

    fn declare_parameters(&self, parameters: Vec<ScriptParameter>) -> Result<(), HostError> {
        self.parameters.lock().get_or_insert(parameters);
        Err(HostError::ParametersDeclared)
    }

    fn stop(&self) -> Result<(), HostError> {
        self.unavailable("stop")
    }

    fn interrupted(&self) -> bool {
        self.parameters.lock().is_some() || self.violation.lock().is_some()
    }
}

/// Run `script` against an [IntrospectHost] and return the parameters it declares.
///
/// Script errors end the dry run early and are not reported: a script that fails before declaring
/// anything has no parameters.
pub fn introspect(
    name: &str,
    script: &dyn CompiledScript,
) -> Result<BTreeMap<String, ScriptParameter>, ScriptError> {
    let host = Arc::new(IntrospectHost::default());
    let mut instance = script.instantiate(host.clone(), ExecutionMode::Introspect, &BTreeMap::new())?;

    match instance.run() {
        Ok(()) | Err(ScriptError::Terminated) => {}
        Err(error) => {
            debug!(script = %name, error = %error, "dry run failed");
        }
    }

    if let Some(operation) = host.violation() {
        debug!(script = %name, operation = %operation, "dry run aborted");
    }

    Ok(host.take_parameters())
}
