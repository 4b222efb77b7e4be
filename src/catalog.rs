//! Hot-reloaded catalog of the scripts found in a watched directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::scripts::{
    introspect, ExecutionMode, IntrospectHost, Providers, ScriptError, ScriptInfo,
};

/// Immutable view of the catalog: compiled scripts by name
pub type CatalogSnapshot = Arc<BTreeMap<String, ScriptInfo>>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot watch the script directory: {0}")]
    Watch(#[from] notify::Error),
    #[error("cannot read the script directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileEvent {
    Changed(PathBuf),
    Removed(PathBuf),
}

fn file_events(event: Event) -> Vec<FileEvent> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => {
            event.paths.into_iter().map(FileEvent::Changed).collect()
        }
        EventKind::Remove(_) => event.paths.into_iter().map(FileEvent::Removed).collect(),
        _ => Vec::new(),
    }
}

/// Scripts available in a directory, kept up to date as files change.
///
/// Every file event is processed by a single worker task, which compiles and introspects the
/// script and publishes a new snapshot of the whole catalog.
pub struct ScriptCatalog {
    path: PathBuf,
    watcher: Option<RecommendedWatcher>,
    worker: Option<JoinHandle<()>>,
    snapshot: Arc<watch::Sender<CatalogSnapshot>>,
}

impl ScriptCatalog {
    /// Load the scripts in `path` and start watching it for changes
    pub async fn start(
        path: impl Into<PathBuf>,
        providers: Arc<Providers>,
    ) -> Result<Self, CatalogError> {
        let path = path.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for event in file_events(event) {
                        // Closed once the worker is done
                        event_tx.send(event).ok();
                    }
                }
                Err(error) => {
                    warn!(error = %error, "watch error");
                }
            }
        })?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        let snapshot = Arc::new(watch::channel(CatalogSnapshot::default()).0);
        let mut worker = CatalogWorker {
            providers,
            scripts: BTreeMap::new(),
            snapshot: snapshot.clone(),
        };

        // Initial enumeration, before any live event
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }

        paths.sort();
        for path in paths {
            worker.handle(FileEvent::Changed(path)).await;
        }

        worker.publish();
        info!(path = %path.display(), scripts = %worker.scripts.len(), "script catalog loaded");

        let worker = tokio::spawn(worker.run(path.clone(), event_rx));

        Ok(Self {
            path,
            watcher: Some(watcher),
            worker: Some(worker),
            snapshot,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> CatalogSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified of every new snapshot. The current snapshot is immediately available.
    pub fn subscribe(&self) -> watch::Receiver<CatalogSnapshot> {
        self.snapshot.subscribe()
    }

    /// Stop watching, process pending events, then publish an empty catalog
    pub async fn shutdown(mut self) {
        // Dropping the watcher closes the event channel
        drop(self.watcher.take());

        if let Some(worker) = self.worker.take() {
            if let Err(error) = worker.await {
                error!(error = %error, "catalog worker failed");
            }
        }

        self.snapshot.send_replace(CatalogSnapshot::default());
        debug!(path = %self.path.display(), "script catalog stopped");
    }
}

impl std::fmt::Debug for ScriptCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCatalog")
            .field("path", &self.path)
            .field("scripts", &self.snapshot.borrow().len())
            .finish()
    }
}

struct CatalogWorker {
    providers: Arc<Providers>,
    scripts: BTreeMap<String, ScriptInfo>,
    snapshot: Arc<watch::Sender<CatalogSnapshot>>,
}

impl CatalogWorker {
    #[instrument(name = "catalog", skip(self, events))]
    async fn run(mut self, path: PathBuf, mut events: mpsc::UnboundedReceiver<FileEvent>) {
        while let Some(event) = events.recv().await {
            trace!(event = ?event, "file event");
            self.handle(event).await;
            self.publish();
        }

        debug!("catalog worker exiting");
    }

    async fn handle(&mut self, event: FileEvent) {
        match event {
            FileEvent::Changed(path) => {
                let name = match self.script_name(&path) {
                    Some(name) => name,
                    None => return,
                };

                match self.load(&name, &path).await {
                    Ok(Some(info)) => {
                        info!(name = %name, parameters = %info.parameters.len(), "loaded script");
                        self.scripts.insert(name, info);
                    }
                    Ok(None) => self.remove(&name),
                    Err(error) => {
                        warn!(name = %name, path = %path.display(), error = %error, "failed to load script");
                        self.scripts.remove(&name);
                    }
                }
            }
            FileEvent::Removed(path) => {
                if let Some(name) = self.script_name(&path) {
                    self.remove(&name);
                }
            }
        }
    }

    fn script_name(&self, path: &Path) -> Option<String> {
        self.providers.get(path)?;
        Providers::script_name(path)
    }

    fn remove(&mut self, name: &str) {
        if self.scripts.remove(name).is_some() {
            info!(name = %name, "removed script");
        }
    }

    /// Compile and introspect the script at `path`. Returns `None` if the file is gone.
    async fn load(&self, name: &str, path: &Path) -> Result<Option<ScriptInfo>, ScriptError> {
        let provider = self
            .providers
            .get(path)
            .ok_or_else(|| ScriptError::Unsupported(path.to_owned()))?;

        let source = match tokio::fs::read_to_string(path).await {
            Ok(source) => source,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let name = name.to_owned();
        let path = path.to_owned();

        // Compilation and the dry run are CPU-bound
        tokio::task::spawn_blocking(move || -> Result<_, ScriptError> {
            let script = provider.compile(&name, &source)?;
            let parameters = introspect(&name, script.as_ref())?;

            // Scripts that can never be instantiated are not listed
            script.instantiate(
                Arc::new(IntrospectHost::default()),
                ExecutionMode::Introspect,
                &parameters,
            )?;

            Ok(Some(ScriptInfo {
                name,
                path,
                parameters,
                script,
            }))
        })
        .await?
    }

    fn publish(&self) {
        self.snapshot.send_replace(Arc::new(self.scripts.clone()));
    }
}
