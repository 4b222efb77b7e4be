//! Capabilities exposed to running scripts

use std::any::Any;
use std::sync::Arc;

use parse_display::Display;
use thiserror::Error;

use super::ScriptParameter;
use crate::color::ColorRgb;
use crate::device::DeviceError;

slotmap::new_key_type! {
    /// Handle to a scheduled timer
    pub struct TimerHandle;
}

/// Language-specific value held by the host on behalf of a script, such as a timer callback
#[derive(Clone)]
pub struct ScriptValue(Arc<dyn Any + Send + Sync>);

impl ScriptValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScriptValue(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "lowercase")]
pub enum ExecutionMode {
    /// Dry run extracting the declared parameters
    Introspect,
    /// Real run painting the device
    Live,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("negative delay: {0}ms")]
    NegativeDelay(i64),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("parameters declared")]
    ParametersDeclared,
    #[error("{0} is not available while introspecting")]
    NotAvailable(&'static str),
}

impl HostError {
    /// `true` if this error must end the script instead of being reported to it
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::ParametersDeclared | Self::NotAvailable(_))
    }
}

/// Operations a script can perform on its host.
///
/// The same interface backs the introspection dry run and live execution, so script providers
/// never depend on which one they are bound to.
pub trait ScriptHost: Send + Sync {
    fn led_count(&self) -> Result<usize, HostError>;

    fn set_led_count(&self, count: usize) -> Result<(), HostError>;

    fn set_pixel(&self, index: i64, color: ColorRgb) -> Result<(), HostError>;

    fn set_all(&self, color: ColorRgb) -> Result<(), HostError>;

    fn publish(&self) -> Result<(), HostError>;

    /// Run `action` once after `delay_ms` milliseconds
    fn after(&self, delay_ms: i64, action: ScriptValue) -> Result<TimerHandle, HostError>;

    /// Run `action` every `interval_ms` milliseconds
    fn every(&self, interval_ms: i64, action: ScriptValue) -> Result<TimerHandle, HostError>;

    /// Cancel a timer. Cancelling a timer that already ran or was cancelled is a no-op.
    fn cancel(&self, handle: TimerHandle) -> Result<(), HostError>;

    /// Record the parameters the script accepts
    fn declare_parameters(&self, parameters: Vec<ScriptParameter>) -> Result<(), HostError>;

    /// Request the script to stop
    fn stop(&self) -> Result<(), HostError>;

    /// `true` once the script should stop executing
    fn interrupted(&self) -> bool;
}
