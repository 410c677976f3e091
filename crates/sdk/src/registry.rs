//! Service registry client.
//!
//! A [`ServiceRegistry`] owns one coordination session. Instances it registers
//! are ephemeral, sequentially numbered children of the service namespace:
//!
//! ```text
//! <root>/<service_id>/instance-0000000000   {"uri": "...", "zone": "..."}
//! <root>/<service_id>/instance-0000000001   ...
//! ```
//!
//! They disappear when this client deregisters them, closes, or loses its
//! session. Reads return the live membership most recently registered first,
//! and watches deliver a complete snapshot after every membership change.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::{ResultExt, ensure};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::RegistryConfig,
    coordination::{
        ChildNode, ChildWatch, CoordinationError, CoordinationResult, CoordinationSession,
        Coordinator, SessionId, SessionState,
    },
    error::{CodecSnafu, ConfigSnafu, DiscoveryError, RegistrationSnafu, Result, SessionLostSnafu},
    instance::{DEFAULT_ZONE, HostAndZone, ServiceInstance, ServiceSnapshot},
};

/// Name prefix of instance nodes.
const INSTANCE_PREFIX: &str = "instance-";

/// Receives membership snapshots for a watched service.
///
/// Deliveries for one service are serialized: the next snapshot is not
/// delivered until `on_snapshot` returns.
#[async_trait]
pub trait SnapshotWatcher: Send + Sync + 'static {
    /// Called with the complete membership after each change.
    async fn on_snapshot(&self, snapshot: ServiceSnapshot);

    /// Called when the watch hits an error. A [`DiscoveryError::SessionLost`]
    /// ends the watch.
    fn on_error(&self, error: DiscoveryError) {
        warn!(error = %error, "Service watch error");
    }
}

#[async_trait]
impl<F> SnapshotWatcher for F
where
    F: Fn(ServiceSnapshot) + Send + Sync + 'static,
{
    async fn on_snapshot(&self, snapshot: ServiceSnapshot) {
        self(snapshot);
    }
}

#[derive(Debug)]
struct WatchTask {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchTask {
    fn stop(self) {
        self.token.cancel();
        drop(self.task);
    }
}

/// Client of the service registry.
///
/// All methods take `&self`; share a registry with `Arc` when several tasks
/// register or discover through the same session.
///
/// # Example
///
/// ```no_run
/// # use lodestar_sdk::{MemoryEnsemble, RegistryConfig, ServiceRegistry};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let ensemble = MemoryEnsemble::new();
/// let config = RegistryConfig::builder().with_connect_string("localhost:2181").build()?;
/// let registry = ServiceRegistry::connect(&ensemble, config).await?;
///
/// registry.register_in_zone("billing", &"dns://10.0.0.1:8080".parse()?, "us-east-1a").await?;
/// for entry in registry.discover("billing").await? {
///     println!("{entry}");
/// }
/// registry.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ServiceRegistry {
    session: Arc<dyn CoordinationSession>,
    config: RegistryConfig,
    registered: Mutex<Vec<ServiceInstance>>,
    watches: Mutex<HashMap<String, WatchTask>>,
    closed: AtomicBool,
}

impl ServiceRegistry {
    /// Opens a session with the coordination ensemble.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError::Coordination`] error if the ensemble cannot
    /// be reached.
    pub async fn connect(coordinator: &dyn Coordinator, config: RegistryConfig) -> Result<Self> {
        let session = coordinator.connect(config.connect_string(), config.session_timeout()).await?;
        info!(
            session = %session.id(),
            servers = %config.connect_string(),
            root = config.root_path(),
            "Registry session opened"
        );
        Ok(Self::from_session(session, config))
    }

    /// Wraps an already established session.
    #[must_use]
    pub fn from_session(session: Arc<dyn CoordinationSession>, config: RegistryConfig) -> Self {
        Self {
            session,
            config,
            registered: Mutex::new(Vec::new()),
            watches: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns the coordination session identifier.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Returns the coordination session state.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Returns the instances this client registered and still owns.
    #[must_use]
    pub fn registered(&self) -> Vec<ServiceInstance> {
        self.registered.lock().clone()
    }

    /// Registers `uri` for `service_id` in [`DEFAULT_ZONE`].
    ///
    /// # Errors
    ///
    /// See [`register_in_zone`](Self::register_in_zone).
    pub async fn register(&self, service_id: &str, uri: &Url) -> Result<ServiceInstance> {
        self.register_in_zone(service_id, uri, DEFAULT_ZONE).await
    }

    /// Registers `uri` for `service_id` in `zone`.
    ///
    /// The instance lives until it is deregistered or this client's session
    /// ends. Every watcher of the service is notified.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Registration`] if the session is not
    /// connected or the ensemble cannot be reached, or a
    /// [`DiscoveryError::Coordination`] error for other backend failures.
    pub async fn register_in_zone(
        &self,
        service_id: &str,
        uri: &Url,
        zone: &str,
    ) -> Result<ServiceInstance> {
        validate_service_id(service_id)?;
        self.ensure_connected(service_id)?;

        let service_path = self.config.service_path(service_id);
        let payload = serde_json::to_vec(&HostAndZone::new(uri.clone(), zone))
            .context(CodecSnafu { path: &service_path })?;

        self.bounded("ensure_path", self.session.ensure_path(&service_path))
            .await
            .map_err(|e| registration_error(service_id, e))?;
        let node = self
            .bounded(
                "create",
                self.session.create_ephemeral_sequential(&service_path, INSTANCE_PREFIX, payload),
            )
            .await
            .map_err(|e| registration_error(service_id, e))?;

        let instance = ServiceInstance::new(service_id, uri.clone(), zone, node.sequence, node.path);
        self.registered.lock().push(instance.clone());

        info!(
            service_id,
            uri = %uri,
            zone,
            path = instance.path(),
            "Registered service instance"
        );
        Ok(instance)
    }

    /// Removes the instances of `uri` this client registered for `service_id`.
    ///
    /// With `zone` set, only instances in that zone are removed; `None` matches
    /// any zone. Instances registered by other clients are never touched.
    /// Returns how many instances were removed; calling again returns 0.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Registration`] if the session is not
    /// connected or the ensemble cannot be reached. Instances whose removal
    /// failed stay tracked, so the call can be repeated.
    pub async fn deregister(&self, service_id: &str, uri: &Url, zone: Option<&str>) -> Result<usize> {
        self.ensure_connected(service_id)?;

        let matching: Vec<ServiceInstance> = self
            .registered
            .lock()
            .iter()
            .filter(|i| {
                i.service_id() == service_id
                    && i.uri() == uri
                    && zone.is_none_or(|zone| i.zone() == zone)
            })
            .cloned()
            .collect();

        let mut removed = 0;
        for instance in &matching {
            let existed = self
                .bounded("delete", self.session.delete(instance.path()))
                .await
                .map_err(|e| registration_error(service_id, e))?;
            // Untracked only once the node is gone.
            self.registered.lock().retain(|i| i.path() != instance.path());
            if existed {
                removed += 1;
            }
        }

        info!(service_id, uri = %uri, zone = zone.unwrap_or("*"), removed, "Deregistered service instances");
        Ok(removed)
    }

    /// Returns the live membership of `service_id`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError`] if the session is gone, the backend fails
    /// or a payload does not decode.
    pub async fn discover(&self, service_id: &str) -> Result<ServiceSnapshot> {
        validate_service_id(service_id)?;
        let service_path = self.config.service_path(service_id);
        let children = self.bounded("children", self.session.children(&service_path)).await?;
        decode_snapshot(children)
    }

    /// Returns the URIs of the live membership of `service_id`, most recent
    /// first.
    ///
    /// # Errors
    ///
    /// See [`discover`](Self::discover).
    pub async fn discover_unzoned(&self, service_id: &str) -> Result<Vec<Url>> {
        Ok(self.discover(service_id).await?.uris())
    }

    /// Installs `watcher` for `service_id`, replacing any previous watcher this
    /// registry installed for the same service.
    ///
    /// No snapshot is delivered for the current membership; call
    /// [`discover`](Self::discover) for that. After every later add or
    /// remove, from any client, the watcher receives the complete membership,
    /// in order.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError`] if the watch cannot be installed.
    pub async fn watch_for_updates<W>(&self, service_id: &str, watcher: W) -> Result<()>
    where
        W: SnapshotWatcher,
    {
        validate_service_id(service_id)?;
        ensure!(
            !self.closed.load(Ordering::SeqCst),
            SessionLostSnafu { session_id: self.session.id() }
        );

        let service_path = self.config.service_path(service_id);
        let watch = self.bounded("watch", self.session.watch_children(&service_path)).await?;

        let token = CancellationToken::new();
        let task = tokio::spawn(run_watch(
            service_id.to_owned(),
            self.session.id(),
            watch,
            watcher,
            token.clone(),
        ));

        if let Some(previous) =
            self.watches.lock().insert(service_id.to_owned(), WatchTask { token, task })
        {
            debug!(service_id, "Replaced existing service watch");
            previous.stop();
        }
        Ok(())
    }

    /// Detaches the watcher of `service_id`, if any.
    pub fn unwatch(&self, service_id: &str) -> bool {
        match self.watches.lock().remove(service_id) {
            Some(watch) => {
                watch.stop();
                true
            },
            None => false,
        }
    }

    /// Deletes the whole namespace of `service_id`, including instances owned
    /// by other clients.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError`] if the backend fails.
    pub async fn remove_service_registry(&self, service_id: &str) -> Result<()> {
        validate_service_id(service_id)?;
        let service_path = self.config.service_path(service_id);
        self.bounded("delete_recursive", self.session.delete_recursive(&service_path)).await?;
        self.registered.lock().retain(|i| i.service_id() != service_id);
        info!(service_id, "Removed service registry");
        Ok(())
    }

    /// Ends the session. Every instance this client registered disappears and
    /// its watches stop. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError`] if the backend fails to close the session.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for (_, watch) in self.watches.lock().drain() {
            watch.stop();
        }
        let registered = std::mem::take(&mut *self.registered.lock()).len();

        self.bounded("close", self.session.close()).await?;
        info!(session = %self.session.id(), registered, "Registry session closed");
        Ok(())
    }

    fn ensure_connected(&self, service_id: &str) -> Result<()> {
        let state = self.session.state();
        ensure!(
            !self.closed.load(Ordering::SeqCst) && state.is_connected(),
            RegistrationSnafu { service_id, message: format!("session is {state}") }
        );
        Ok(())
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = CoordinationResult<T>>,
    ) -> CoordinationResult<T> {
        let timeout = self.config.operation_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::ConnectionLoss {
                message: format!("{operation} timed out after {}", format_duration(timeout)),
            }),
        }
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        for (_, watch) in self.watches.get_mut().drain() {
            watch.stop();
        }
        if !self.closed.load(Ordering::SeqCst)
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            let session = Arc::clone(&self.session);
            handle.spawn(async move {
                if let Err(e) = session.close().await {
                    debug!(error = %e, "Closing dropped registry session failed");
                }
            });
        }
    }
}

async fn run_watch<W: SnapshotWatcher>(
    service_id: String,
    session_id: SessionId,
    mut watch: ChildWatch,
    watcher: W,
    token: CancellationToken,
) {
    debug!(service_id, path = watch.parent(), "Service watch started");
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(service_id, "Service watch detached");
                break;
            }
            event = watch.next() => match event {
                Some(event) => match decode_snapshot(event.children) {
                    Ok(snapshot) => {
                        debug!(service_id, instances = snapshot.len(), "Service membership changed");
                        watcher.on_snapshot(snapshot).await;
                    },
                    Err(e) => watcher.on_error(e),
                },
                None => {
                    warn!(service_id, session = %session_id, "Service watch ended: session lost");
                    watcher.on_error(DiscoveryError::SessionLost { session_id });
                    break;
                },
            },
        }
    }
}

/// Decodes instance nodes into a snapshot, most recently registered first.
fn decode_snapshot(mut children: Vec<ChildNode>) -> Result<ServiceSnapshot> {
    children.sort_by(|a, b| b.sequence.cmp(&a.sequence));
    let entries = children
        .iter()
        .map(|child| {
            serde_json::from_slice::<HostAndZone>(&child.data).context(CodecSnafu { path: &child.path })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ServiceSnapshot::new(entries))
}

fn registration_error(service_id: &str, err: CoordinationError) -> DiscoveryError {
    if err.is_session_error() || err.is_transient() {
        RegistrationSnafu { service_id, message: err.to_string() }.build()
    } else {
        err.into()
    }
}

fn validate_service_id(service_id: &str) -> Result<()> {
    ensure!(
        !service_id.is_empty()
            && !service_id.contains('/')
            && !service_id.contains(char::is_whitespace),
        ConfigSnafu { message: format!("invalid service id '{service_id}'") }
    );
    Ok(())
}

fn format_duration(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}
