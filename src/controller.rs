//! Serialized script switching and aggregate state publication

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parse_display::Display;
use serde_derive::Serialize;
use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
};
use tokio_stream::wrappers::WatchStream;

use crate::catalog::CatalogSnapshot;
use crate::color::{ColorRgb, ColorRgbExt};
use crate::device::DeviceChannel;
use crate::scripts::{RuntimeError, ScriptDescriptor, ScriptRuntime};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("script not found: {name}")]
    NotFound { name: String },
    #[error("cannot start script: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("the controller is no longer running")]
    Closed,
}

impl<T> From<mpsc::error::SendError<T>> for ControllerError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::Closed
    }
}

impl From<oneshot::error::RecvError> for ControllerError {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum Mode {
    #[serde(rename = "none")]
    #[display("none")]
    Idle,
    #[serde(rename = "script")]
    #[display("script")]
    Running,
}

/// Aggregate controller state, as published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub mode: Mode,
    pub active_script: Option<ScriptDescriptor>,
    pub available_scripts: Vec<ScriptDescriptor>,
}

#[derive(Debug)]
enum ControllerMessage {
    SetScript {
        name: String,
        parameters: HashMap<String, String>,
        tx: oneshot::Sender<Result<(), ControllerError>>,
    },
    Stop(oneshot::Sender<()>),
    CurrentScript(oneshot::Sender<Option<String>>),
    AvailableScripts(oneshot::Sender<Vec<String>>),
    State(oneshot::Sender<StateSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ControllerControl {
    Continue,
    Break,
}

/// Owner of the running script.
///
/// All requests go through [ControllerHandle] and are processed one at a time by
/// [Controller::run], so a script is always fully stopped and the LEDs turned off before the next
/// one starts.
pub struct Controller {
    device: Arc<DeviceChannel>,
    catalog_rx: Option<watch::Receiver<CatalogSnapshot>>,
    scripts: CatalogSnapshot,
    active: Option<ScriptRuntime>,
    handle_rx: mpsc::Receiver<ControllerMessage>,
    state_tx: watch::Sender<StateSnapshot>,
}

impl Controller {
    pub fn new(
        device: Arc<DeviceChannel>,
        mut catalog_rx: watch::Receiver<CatalogSnapshot>,
    ) -> (Self, ControllerHandle) {
        let scripts = catalog_rx.borrow_and_update().clone();

        let (tx, handle_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(Self::snapshot_of(&scripts, None));

        (
            Self {
                device,
                catalog_rx: Some(catalog_rx),
                scripts,
                active: None,
                handle_rx,
                state_tx,
            },
            ControllerHandle { tx, state_rx },
        )
    }

    fn snapshot_of(scripts: &CatalogSnapshot, active: Option<&ScriptRuntime>) -> StateSnapshot {
        StateSnapshot {
            mode: if active.is_some() {
                Mode::Running
            } else {
                Mode::Idle
            },
            active_script: active.map(|runtime| runtime.info().descriptor()),
            available_scripts: scripts.values().map(|info| info.descriptor()).collect(),
        }
    }

    fn state(&self) -> StateSnapshot {
        Self::snapshot_of(&self.scripts, self.active.as_ref())
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.state());
    }

    fn active_completion(&self) -> BoxFuture<'static, ()> {
        match &self.active {
            Some(runtime) => runtime.completion().boxed(),
            None => futures::future::pending().boxed(),
        }
    }

    async fn catalog_changed(catalog_rx: &mut Option<watch::Receiver<CatalogSnapshot>>) -> bool {
        match catalog_rx {
            Some(rx) => rx.changed().await.is_ok(),
            None => futures::future::pending().await,
        }
    }

    /// Stop the active script, wait for it to complete and turn the LEDs off
    async fn enter_idle(&mut self) {
        if let Some(runtime) = self.active.take() {
            runtime.stop();
            runtime.completion().await;
            info!(name = %runtime.info().name, "stopped script");
            drop(runtime);

            self.device.set_all(ColorRgb::off());
            self.device.publish();
        }
    }

    /// Go back to idle if the active script completed on its own
    async fn reap_completed(&mut self) {
        if self
            .active
            .as_ref()
            .map_or(false, |runtime| runtime.is_completed())
        {
            self.enter_idle().await;
            self.publish_state();
        }
    }

    async fn set_script(
        &mut self,
        name: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<(), ControllerError> {
        let info = self
            .scripts
            .get(name)
            .ok_or_else(|| ControllerError::NotFound {
                name: name.to_owned(),
            })?;

        let mut runtime = ScriptRuntime::new(info, parameters, self.device.clone())?;

        self.enter_idle().await;

        runtime.run()?;
        info!(name = %name, "started script");
        self.active = Some(runtime);

        Ok(())
    }

    async fn handle_message(&mut self, message: ControllerMessage) -> ControllerControl {
        // ok: the controller doesn't care if the requester went away

        self.reap_completed().await;

        match message {
            ControllerMessage::SetScript {
                name,
                parameters,
                tx,
            } => {
                let result = self.set_script(&name, &parameters).await;
                if let Err(error) = &result {
                    warn!(name = %name, error = %error, "cannot set script");
                }

                self.publish_state();
                tx.send(result).ok();
            }
            ControllerMessage::Stop(tx) => {
                self.enter_idle().await;
                self.publish_state();
                tx.send(()).ok();
            }
            ControllerMessage::CurrentScript(tx) => {
                tx.send(self.active.as_ref().map(|runtime| runtime.info().name.clone()))
                    .ok();
            }
            ControllerMessage::AvailableScripts(tx) => {
                tx.send(self.scripts.keys().cloned().collect()).ok();
            }
            ControllerMessage::State(tx) => {
                tx.send(self.state()).ok();
            }
            ControllerMessage::Shutdown(tx) => {
                self.enter_idle().await;
                self.publish_state();
                tx.send(()).ok();
                return ControllerControl::Break;
            }
        }

        ControllerControl::Continue
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        loop {
            let completion = self.active_completion();

            select! {
                biased;

                _ = completion => {
                    // The script stopped by itself or failed
                    self.enter_idle().await;
                    self.publish_state();
                },
                message = self.handle_rx.recv() => {
                    trace!(message = ?message, "controller msg");

                    if let Some(message) = message {
                        if ControllerControl::Break == self.handle_message(message).await {
                            break;
                        }
                    } else {
                        // All handles dropped
                        break;
                    }
                },
                changed = Self::catalog_changed(&mut self.catalog_rx) => {
                    if changed {
                        if let Some(rx) = &mut self.catalog_rx {
                            self.scripts = rx.borrow_and_update().clone();
                        }

                        trace!(scripts = %self.scripts.len(), "catalog changed");
                    } else {
                        debug!("catalog closed");
                        self.catalog_rx = None;
                    }

                    self.publish_state();
                },
            }
        }

        self.enter_idle().await;
        debug!("controller exiting");
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("active", &self.active)
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

/// Cloneable access to a running [Controller]
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerMessage>,
    state_rx: watch::Receiver<StateSnapshot>,
}

impl ControllerHandle {
    /// Stop the current script, if any, and start `name` with the given parameter values
    pub async fn set_script(
        &self,
        name: impl Into<String>,
        parameters: HashMap<String, String>,
    ) -> Result<(), ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ControllerMessage::SetScript {
                name: name.into(),
                parameters,
                tx,
            })
            .await?;
        rx.await?
    }

    pub async fn stop(&self) -> Result<(), ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControllerMessage::Stop(tx)).await?;
        Ok(rx.await?)
    }

    /// Name of the running script
    pub async fn current_script(&self) -> Result<Option<String>, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControllerMessage::CurrentScript(tx)).await?;
        Ok(rx.await?)
    }

    /// Names of the scripts in the catalog, sorted
    pub async fn available_scripts(&self) -> Result<Vec<String>, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControllerMessage::AvailableScripts(tx)).await?;
        Ok(rx.await?)
    }

    pub async fn state(&self) -> Result<StateSnapshot, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControllerMessage::State(tx)).await?;
        Ok(rx.await?)
    }

    /// Stream of state snapshots, starting with the current one
    pub fn subscribe(&self) -> WatchStream<StateSnapshot> {
        WatchStream::new(self.state_rx.clone())
    }

    /// Stop the current script and terminate the controller
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControllerMessage::Shutdown(tx)).await?;
        Ok(rx.await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::time::{sleep, timeout};
    use tokio_stream::StreamExt;

    use super::*;
    use crate::catalog::ScriptCatalog;
    use crate::device::{protocol, testing::SharedBuffer};
    use crate::scripts::Providers;

    const SOLID: &str = r##"
        parameters(#{ "color": #{ "type": "color", "default": "#000000" } });
        set_all(color);
        publish();
    "##;

    const BLINK: &str = r#"
        every(5, || {
            set_all(rgb(0, 0, 255));
            publish();
        });
    "#;

    const DELAYED: &str = r#"
        after(300, || {
            set_all(rgb(0, 255, 0));
            publish();
        });
    "#;

    const ONCE: &str = r#"
        set_all(rgb(0, 255, 0));
        publish();
        stop();
    "#;

    const LED_COUNT: usize = 5;

    struct Fixture {
        _dir: tempfile::TempDir,
        catalog: ScriptCatalog,
        device: Arc<DeviceChannel>,
        buffer: SharedBuffer,
        handle: ControllerHandle,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            for (name, source) in [("solid", SOLID), ("blink", BLINK), ("once", ONCE)] {
                std::fs::write(dir.path().join(format!("{}.rhai", name)), source).unwrap();
            }

            let catalog = ScriptCatalog::start(dir.path(), Arc::new(Providers::new()))
                .await
                .unwrap();

            let buffer = SharedBuffer::new();
            let device = Arc::new(DeviceChannel::new());
            device.set_led_count(LED_COUNT).unwrap();
            device.open(Box::new(buffer.clone())).unwrap();

            let (controller, handle) = Controller::new(device.clone(), catalog.subscribe());
            tokio::spawn(controller.run());

            Self {
                _dir: dir,
                catalog,
                device,
                buffer,
                handle,
            }
        }

        fn path(&self, name: &str) -> std::path::PathBuf {
            self.catalog.path().join(format!("{}.rhai", name))
        }

        async fn finish(self) {
            self.handle.shutdown().await.unwrap();
            self.catalog.shutdown().await;
            self.device.close().unwrap();
        }
    }

    fn encoded(color: ColorRgb) -> Vec<u8> {
        let mut dst = BytesMut::new();
        protocol::encode(&[color; LED_COUNT], &mut dst);
        dst.to_vec()
    }

    async fn wait_for_frame(device: &DeviceChannel, color: ColorRgb) -> bool {
        for _ in 0..250 {
            if device.current_frame() == vec![color; LED_COUNT] {
                return true;
            }

            sleep(Duration::from_millis(20)).await;
        }

        false
    }

    async fn wait_for_bytes(buffer: &SharedBuffer, expected: &[u8]) -> bool {
        for _ in 0..250 {
            if buffer.bytes().ends_with(expected) {
                return true;
            }

            sleep(Duration::from_millis(20)).await;
        }

        false
    }

    fn params(values: &[(&str, &str)]) -> HashMap<String, String> {
        values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_solid_end_to_end() {
        let fixture = Fixture::new().await;

        fixture
            .handle
            .set_script("solid", params(&[("color", "ff0000")]))
            .await
            .unwrap();

        let red = ColorRgb::new(255, 0, 0);
        assert!(wait_for_bytes(&fixture.buffer, &encoded(red)).await);

        let state = fixture.handle.state().await.unwrap();
        assert_eq!(state.mode, Mode::Running);
        let active = state.active_script.unwrap();
        assert_eq!(active.name, "solid");
        assert_eq!(
            serde_json::to_value(&active.parameters[0]).unwrap(),
            serde_json::json!({
                "name": "color",
                "type": "color",
                "default": "000000",
                "current": "ff0000"
            })
        );
        assert_eq!(
            fixture.handle.current_script().await.unwrap().as_deref(),
            Some("solid")
        );

        fixture.finish().await;
    }

    #[tokio::test]
    async fn test_available_scripts() {
        let fixture = Fixture::new().await;

        assert_eq!(
            fixture.handle.available_scripts().await.unwrap(),
            vec!["blink", "once", "solid"]
        );
        assert_eq!(fixture.handle.current_script().await.unwrap(), None);

        let state = fixture.handle.state().await.unwrap();
        assert_eq!(state.mode, Mode::Idle);
        assert_eq!(state.available_scripts.len(), 3);
        assert!(state
            .available_scripts
            .iter()
            .all(|script| script.parameters.iter().all(|p| p.current().is_none())));

        fixture.finish().await;
    }

    #[tokio::test]
    async fn test_switch_turns_off_in_between() {
        let fixture = Fixture::new().await;

        std::fs::write(fixture.path("delayed"), DELAYED).unwrap();
        let mut listed = false;
        for _ in 0..250 {
            if fixture
                .handle
                .available_scripts()
                .await
                .unwrap()
                .iter()
                .any(|name| name == "delayed")
            {
                listed = true;
                break;
            }

            sleep(Duration::from_millis(20)).await;
        }
        assert!(listed);

        fixture
            .handle
            .set_script("blink", HashMap::new())
            .await
            .unwrap();
        assert!(wait_for_frame(&fixture.device, ColorRgb::new(0, 0, 255)).await);

        fixture
            .handle
            .set_script("delayed", HashMap::new())
            .await
            .unwrap();

        // Dark before the new script paints anything
        assert_eq!(fixture.device.current_frame(), vec![ColorRgb::off(); LED_COUNT]);
        assert!(wait_for_bytes(&fixture.buffer, &encoded(ColorRgb::off())).await);

        let green = ColorRgb::new(0, 255, 0);
        assert!(wait_for_bytes(&fixture.buffer, &encoded(green)).await);

        // Nothing from the previous script after the switch
        sleep(Duration::from_millis(50)).await;
        assert!(fixture.buffer.bytes().ends_with(&encoded(green)));
        assert_eq!(
            fixture.handle.current_script().await.unwrap().as_deref(),
            Some("delayed")
        );

        fixture.finish().await;
    }

    #[tokio::test]
    async fn test_not_found_keeps_previous() {
        let fixture = Fixture::new().await;

        fixture
            .handle
            .set_script("blink", HashMap::new())
            .await
            .unwrap();

        let result = fixture.handle.set_script("missing", HashMap::new()).await;
        assert!(matches!(result, Err(ControllerError::NotFound { name }) if name == "missing"));
        assert_eq!(
            fixture.handle.current_script().await.unwrap().as_deref(),
            Some("blink")
        );

        fixture.finish().await;
    }

    #[tokio::test]
    async fn test_stop() {
        let fixture = Fixture::new().await;

        fixture
            .handle
            .set_script("solid", params(&[("color", "ffffff")]))
            .await
            .unwrap();
        assert!(wait_for_frame(&fixture.device, ColorRgb::new(255, 255, 255)).await);

        fixture.handle.stop().await.unwrap();
        assert_eq!(fixture.device.current_frame(), vec![ColorRgb::off(); LED_COUNT]);
        assert!(wait_for_bytes(&fixture.buffer, &encoded(ColorRgb::off())).await);
        assert_eq!(fixture.handle.state().await.unwrap().mode, Mode::Idle);

        // Stopping while idle is fine
        fixture.handle.stop().await.unwrap();

        fixture.finish().await;
    }

    #[tokio::test]
    async fn test_self_stopping_script() {
        let fixture = Fixture::new().await;

        fixture
            .handle
            .set_script("once", HashMap::new())
            .await
            .unwrap();

        let mut idle = false;
        for _ in 0..250 {
            if fixture.handle.current_script().await.unwrap().is_none() {
                idle = true;
                break;
            }

            sleep(Duration::from_millis(20)).await;
        }

        assert!(idle);
        assert_eq!(fixture.device.current_frame(), vec![ColorRgb::off(); LED_COUNT]);
        assert_eq!(fixture.handle.state().await.unwrap().mode, Mode::Idle);

        fixture.finish().await;
    }

    #[tokio::test]
    async fn test_completed_script_reads_idle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("once.rhai"), ONCE).unwrap();
        let catalog = ScriptCatalog::start(dir.path(), Arc::new(Providers::new()))
            .await
            .unwrap();

        let device = Arc::new(DeviceChannel::new());
        device.set_led_count(LED_COUNT).unwrap();

        // Driven by hand so the completion is not observed by the loop first
        let (mut controller, _handle) = Controller::new(device.clone(), catalog.subscribe());
        controller.set_script("once", &HashMap::new()).await.unwrap();

        let completion = controller.active.as_ref().unwrap().completion();
        timeout(Duration::from_secs(10), completion).await.unwrap();

        let (tx, rx) = oneshot::channel();
        controller
            .handle_message(ControllerMessage::State(tx))
            .await;
        let state = rx.await.unwrap();

        assert_eq!(state.mode, Mode::Idle);
        assert!(state.active_script.is_none());
        assert_eq!(device.current_frame(), vec![ColorRgb::off(); LED_COUNT]);

        catalog.shutdown().await;
    }

    #[tokio::test]
    async fn test_catalog_changes_are_published() {
        let fixture = Fixture::new().await;
        let mut states = fixture.handle.subscribe();

        let first = states.next().await.unwrap();
        assert_eq!(first.available_scripts.len(), 3);

        std::fs::remove_file(fixture.path("blink")).unwrap();

        let removed = timeout(Duration::from_secs(10), async {
            while let Some(state) = states.next().await {
                if state.available_scripts.iter().all(|script| script.name != "blink") {
                    return true;
                }
            }

            false
        })
        .await;

        assert!(matches!(removed, Ok(true)));
        assert_eq!(
            fixture.handle.available_scripts().await.unwrap(),
            vec!["once", "solid"]
        );

        fixture.finish().await;
    }

    #[test]
    fn test_state_json() {
        let state = StateSnapshot {
            mode: Mode::Idle,
            active_script: None,
            available_scripts: Vec::new(),
        };

        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            serde_json::json!({
                "mode": "none",
                "active_script": null,
                "available_scripts": []
            })
        );
        assert_eq!(Mode::Running.to_string(), "script");
    }
}
