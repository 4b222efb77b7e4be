//! Execution of a script on its own worker thread

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use super::{
    ExecutionMode, HostError, ScriptError, ScriptHost, ScriptInfo, ScriptInstance,
    ScriptParameter, ScriptValue, TimerHandle,
};
use crate::color::ColorRgb;
use crate::device::{DeviceChannel, DeviceError};

mod timers;
use timers::TimerQueue;


#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Instantiation(#[from] ScriptError),
    #[error("cannot spawn script worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("the script is already running")]
    AlreadyStarted,
}

enum ControlMessage {
    Stop,
}

struct RuntimeShared {
    stop_requested: AtomicBool,
    completed: AtomicBool,
    completion: watch::Sender<bool>,
    timers: Mutex<TimerQueue>,
}

impl RuntimeShared {
    fn new() -> Self {
        Self {
            stop_requested: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            completion: watch::channel(false).0,
            timers: Mutex::new(TimerQueue::new()),
        }
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Returns `true` if a stop was already requested
    fn request_stop(&self) -> bool {
        self.stop_requested.swap(true, Ordering::SeqCst)
    }

    fn complete(&self) {
        if !self.completed.swap(true, Ordering::SeqCst) {
            self.timers.lock().clear();
            self.completion.send_replace(true);
        }
    }
}

/// Host given to live scripts: paints the device and schedules on the runtime's timers
struct LiveHost {
    device: Arc<DeviceChannel>,
    shared: Arc<RuntimeShared>,
}

impl LiveHost {
    fn schedule(
        &self,
        delay_ms: i64,
        interval: bool,
        action: ScriptValue,
    ) -> Result<TimerHandle, HostError> {
        if delay_ms < 0 {
            return Err(HostError::NegativeDelay(delay_ms));
        }

        let delay = Duration::from_millis(delay_ms as u64);
        let interval = interval.then(|| delay.max(Duration::from_millis(1)));

        Ok(self
            .shared
            .timers
            .lock()
            .schedule(action, delay, interval, Instant::now()))
    }
}

impl ScriptHost for LiveHost {
    fn led_count(&self) -> Result<usize, HostError> {
        Ok(self.device.led_count())
    }

    fn set_led_count(&self, count: usize) -> Result<(), HostError> {
        Ok(self.device.set_led_count(count)?)
    }

    fn set_pixel(&self, index: i64, color: ColorRgb) -> Result<(), HostError> {
        let index = usize::try_from(index).map_err(|_| DeviceError::OutOfRange {
            index,
            count: self.device.led_count(),
        })?;

        Ok(self.device.set_pixel(index, color)?)
    }

    fn set_all(&self, color: ColorRgb) -> Result<(), HostError> {
        self.device.set_all(color);
        Ok(())
    }

    fn publish(&self) -> Result<(), HostError> {
        self.device.publish();
        Ok(())
    }

    fn after(&self, delay_ms: i64, action: ScriptValue) -> Result<TimerHandle, HostError> {
        self.schedule(delay_ms, false, action)
    }

    fn every(&self, interval_ms: i64, action: ScriptValue) -> Result<TimerHandle, HostError> {
        self.schedule(interval_ms, true, action)
    }

    fn cancel(&self, handle: TimerHandle) -> Result<(), HostError> {
        self.shared.timers.lock().cancel(handle);
        Ok(())
    }

    fn declare_parameters(&self, _parameters: Vec<ScriptParameter>) -> Result<(), HostError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), HostError> {
        self.shared.request_stop();
        Ok(())
    }

    fn interrupted(&self) -> bool {
        self.shared.stopping()
    }
}

/// A script instance bound to the device, running its body and timers on a dedicated worker.
///
/// The runtime signals completion exactly once, after the worker has exited. No timer callback
/// starts after completion.
pub struct ScriptRuntime {
    info: ScriptInfo,
    shared: Arc<RuntimeShared>,
    instance: Option<Box<dyn ScriptInstance>>,
    control_tx: Sender<ControlMessage>,
    control_rx: Receiver<ControlMessage>,
    worker: Option<JoinHandle<()>>,
}

impl ScriptRuntime {
    /// Bind `parameters` to the script's declared parameters and instantiate it.
    ///
    /// Missing or unparsable parameter values fall back to their defaults.
    pub fn new(
        info: &ScriptInfo,
        parameters: &HashMap<String, String>,
        device: Arc<DeviceChannel>,
    ) -> Result<Self, RuntimeError> {
        let mut info = info.clone();
        for (name, parameter) in info.parameters.iter_mut() {
            parameter.bind(parameters.get(name).map(String::as_str));
        }

        let shared = Arc::new(RuntimeShared::new());
        let host = Arc::new(LiveHost {
            device,
            shared: shared.clone(),
        });

        let instance = info
            .script
            .instantiate(host, ExecutionMode::Live, &info.parameters)?;

        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            info,
            shared,
            instance: Some(instance),
            control_tx,
            control_rx,
            worker: None,
        })
    }

    /// Script being run, with its bound parameter values
    pub fn info(&self) -> &ScriptInfo {
        &self.info
    }

    /// Start the script body on the worker thread
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let instance = self.instance.take().ok_or(RuntimeError::AlreadyStarted)?;

        if self.shared.stopping() {
            return Ok(());
        }

        let name = self.info.name.clone();
        let shared = self.shared.clone();
        let control = self.control_rx.clone();

        self.worker = Some(
            std::thread::Builder::new()
                .name(format!("script-{}", name))
                .spawn(move || {
                    let span = info_span!("script", name = %name);
                    let _enter = span.enter();

                    run_script(instance, &shared, &control);

                    shared.complete();
                    debug!("script completed");
                })?,
        );

        Ok(())
    }

    /// Request the script to stop. Pending timers are discarded. Calling this more than once has
    /// no further effect.
    pub fn stop(&self) {
        if self.shared.request_stop() {
            return;
        }

        if self.worker.is_some() {
            // The worker may already be gone
            self.control_tx.send(ControlMessage::Stop).ok();
        } else {
            self.shared.complete();
        }
    }

    pub fn is_completed(&self) -> bool {
        *self.shared.completion.borrow()
    }

    /// Receiver whose value turns `true` once the runtime completes
    pub fn completion_receiver(&self) -> watch::Receiver<bool> {
        self.shared.completion.subscribe()
    }

    /// Resolves once the runtime has completed
    pub fn completion(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.completion_receiver();

        async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("name", &self.info.name)
            .field("stopping", &self.shared.stopping())
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Drop for ScriptRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn report(result: Result<(), ScriptError>, shared: &RuntimeShared) -> bool {
    match result {
        Ok(()) => true,
        Err(error) => {
            if matches!(error, ScriptError::Terminated) || shared.stopping() {
                debug!(error = %error, "script interrupted");
            } else {
                error!(error = %error, "script failed");
            }

            shared.request_stop();
            false
        }
    }
}

fn run_script(
    mut instance: Box<dyn ScriptInstance>,
    shared: &RuntimeShared,
    control: &Receiver<ControlMessage>,
) {
    if !report(instance.run(), shared) {
        return;
    }

    loop {
        if shared.stopping() {
            break;
        }

        let now = Instant::now();
        let due = shared.timers.lock().pop_due(now);
        if let Some(action) = due {
            if !report(instance.call(&action), shared) {
                break;
            }

            continue;
        }

        let next_deadline = shared.timers.lock().next_deadline();
        let message = match next_deadline {
            Some(deadline) => control.recv_deadline(deadline),
            None => control
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match message {
            Ok(ControlMessage::Stop) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
