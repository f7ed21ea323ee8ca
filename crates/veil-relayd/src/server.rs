//! Supervisor: construction, wiring, and ordered shutdown.
//!
//! Startup brings components up leaves-first: identity and link keys, mix
//! key store, PKI cache (worker not yet started), scheduler, crypto
//! workers, connector, PKI worker, listeners, periodic tick. Shutdown is
//! the strict reverse with one exception: the connector halts before the
//! PKI because PKI updates call into the connector.
//!
//! Construction past the point where files are open cleans up a partially
//! constructed instance by running the same shutdown sequence over it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use veil_crypto::ed25519::SigningKey;
use veil_crypto::keyfile;
use veil_crypto::x25519::X25519StaticSecret;
use veil_mixkey::MixKeyStore;
use veil_types::epoch::EpochTime;
use veil_types::NodeId;

use crate::config::Config;
use crate::connector::Connector;
use crate::listener::{Listener, ListenerContext};
use crate::packet::Counters;
use crate::periodic::PeriodicTimer;
use crate::pki::{Pki, PkiClient};
use crate::provider::{ProviderBackend, UserDb};
use crate::scheduler::{Dispatch, Scheduler};
use crate::worker::{CryptoWorker, SharedIngress, WorkerContext};
use crate::{Error, Result};

/// External collaborators injected at construction.
#[derive(Default)]
pub struct Externals {
    /// The PKI document fetcher. Absent = the PKI interface idles.
    pub pki_client: Option<Arc<dyn PkiClient>>,
    /// Local-delivery backend, for providers.
    pub provider: Option<Arc<dyn ProviderBackend>>,
    /// User database, for provider client sessions.
    pub user_db: Option<Arc<dyn UserDb>>,
}

/// Dispatch seam filled in once the connector exists; the scheduler is
/// constructed first per the startup order and drops packets until then.
#[derive(Default)]
struct LazyDispatch {
    inner: OnceLock<Arc<dyn Dispatch>>,
}

impl Dispatch for LazyDispatch {
    fn dispatch(&self, next_hop: NodeId, packet: Vec<u8>) {
        if let Some(dispatch) = self.inner.get() {
            dispatch.dispatch(next_hop, packet);
        }
    }
}

/// A running relay instance.
pub struct Server {
    cfg: Config,
    node_id: NodeId,
    identity_signing: Arc<SigningKey>,
    link: X25519StaticSecret,
    counters: Arc<Counters>,

    mix_keys: Option<Arc<MixKeyStore>>,
    pki: Option<Arc<Pki>>,
    pki_halt_tx: Option<broadcast::Sender<()>>,
    pki_worker: Option<JoinHandle<()>>,
    egress: Arc<LazyDispatch>,
    scheduler: Option<Arc<Scheduler>>,
    workers: Vec<CryptoWorker>,
    connector: Option<Arc<Connector>>,
    listeners: Vec<Listener>,
    periodic: Option<PeriodicTimer>,

    halted: AtomicBool,
}

impl Server {
    /// Construct and start a relay from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GenerateOnly`] after persisting all keys when
    /// `debug.generate_only` is set; this is a successful termination.
    /// All other errors are startup failures, after which any partially
    /// constructed components have already been shut down.
    pub async fn new(cfg: Config, externals: Externals) -> Result<Server> {
        cfg.validate()?;
        init_data_dir(&cfg.server.data_dir)?;

        if cfg.debug.is_unsafe() {
            warn!("unsafe debug configuration options are set");
        }
        if cfg.logging.level == "DEBUG" {
            warn!("unsafe debug logging is enabled");
        }
        info!(identifier = %cfg.server.identifier, "server identifier");

        let identity = keyfile::load_or_generate_identity(&cfg.server.data_dir.join("identity.key"))?;
        info!(
            key = %hex_string(&identity.node_id()),
            "server identity public key"
        );
        let link = keyfile::load_or_generate_link(&cfg.server.data_dir.join("link.key"))?;
        info!(
            key = %hex_string(&link.public_key().to_bytes()),
            "server link public key"
        );

        let mix_keys = Arc::new(MixKeyStore::new(&cfg.server.data_dir, EpochTime::now())?);

        let node_id = identity.node_id();
        let mut server = Server {
            cfg,
            node_id,
            identity_signing: Arc::new(identity.signing_key.clone()),
            link,
            counters: Arc::new(Counters::default()),
            mix_keys: Some(mix_keys),
            pki: None,
            pki_halt_tx: None,
            pki_worker: None,
            egress: Arc::new(LazyDispatch::default()),
            scheduler: None,
            workers: Vec::new(),
            connector: None,
            listeners: Vec::new(),
            periodic: None,
            halted: AtomicBool::new(false),
        };

        if server.cfg.debug.generate_only {
            // All key material exists on disk; stop before starting any
            // worker. Dropping the instance closes the mix keys cleanly.
            return Err(Error::GenerateOnly);
        }

        match server.init_components(externals) {
            Ok(()) => Ok(server),
            Err(e) => {
                // Clean up the partially constructed instance.
                server.shutdown().await;
                Err(e)
            }
        }
    }

    fn init_components(&mut self, externals: Externals) -> Result<()> {
        let mix_keys = Arc::clone(self.mix_keys.as_ref().expect("mix keys initialized"));

        // The PKI cache; its worker starts only after the connector is up,
        // because document updates force-update the connector.
        let pki = Arc::new(Pki::new(
            self.node_id,
            self.cfg.server.identifier.clone(),
            self.cfg.server.is_provider,
            self.cfg.debug.disable_mix_authentication,
            externals.pki_client,
        ));
        self.pki = Some(Arc::clone(&pki));

        let scheduler = Arc::new(Scheduler::spawn(
            Arc::clone(&self.egress) as Arc<dyn Dispatch>,
            self.cfg.debug.ingress_queue_depth,
            Arc::clone(&self.counters),
        ));
        self.scheduler = Some(Arc::clone(&scheduler));

        let (ingress_tx, ingress_rx) = mpsc::channel(self.cfg.debug.ingress_queue_depth);
        let ingress: SharedIngress = Arc::new(tokio::sync::Mutex::new(ingress_rx));

        for id in 0..self.cfg.debug.num_sphinx_workers {
            self.workers.push(CryptoWorker::spawn(
                id,
                Arc::clone(&ingress),
                WorkerContext {
                    mix_keys: Arc::clone(&mix_keys),
                    pki: Arc::clone(&pki),
                    scheduler: Arc::clone(&scheduler),
                    provider: externals.provider.clone(),
                    counters: Arc::clone(&self.counters),
                },
            ));
        }

        let connector = Connector::new(
            Arc::clone(&pki),
            Arc::clone(&self.identity_signing),
            self.link.public_key().to_bytes(),
            Arc::clone(&self.counters),
        )?;
        self.egress
            .inner
            .set(Arc::clone(&connector) as Arc<dyn Dispatch>)
            .ok();
        self.connector = Some(Arc::clone(&connector));

        let (pki_halt_tx, pki_halt_rx) = broadcast::channel(1);
        self.pki_worker = Some(Arc::clone(&pki).start_worker(connector, pki_halt_rx));
        self.pki_halt_tx = Some(pki_halt_tx);

        let listener_ctx = ListenerContext {
            pki,
            ingress: ingress_tx,
            identity: Arc::clone(&self.identity_signing),
            link_public: self.link.public_key().to_bytes(),
            counters: Arc::clone(&self.counters),
            is_provider: self.cfg.server.is_provider,
            user_db: externals.user_db,
        };
        for (id, addr) in self.cfg.listen_addresses().into_iter().enumerate() {
            self.listeners
                .push(Listener::spawn(id, addr, listener_ctx.clone())?);
        }

        let mailboxes = self.workers.iter().map(|w| w.mailbox()).collect();
        self.periodic = Some(PeriodicTimer::spawn(mix_keys, mailboxes));

        Ok(())
    }

    /// The node id (identity public key bytes).
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The bound listener addresses.
    pub fn listener_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.listeners.iter().map(Listener::local_addr).collect()
    }

    /// Cleanly shut the instance down. Idempotent; the ordering here is
    /// deliberate and must not be altered without understanding how the
    /// components fit together.
    pub async fn shutdown(&mut self) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting graceful shutdown");

        // Stop the 1 Hz periodic utility timer.
        if let Some(mut periodic) = self.periodic.take() {
            periodic.halt().await;
        }

        // Stop the listeners, closing all incoming sessions.
        for listener in &mut self.listeners {
            listener.halt().await;
        }
        self.listeners.clear();

        // Close all outgoing sessions. The connector object stays alive
        // until the PKI is down, because the PKI calls into it.
        if let Some(connector) = &self.connector {
            connector.halt().await;
        }

        // Stop the Sphinx workers.
        for worker in &mut self.workers {
            worker.halt().await;
        }
        self.workers.clear();

        // Stop the scheduler, dropping queued packets.
        if let Some(scheduler) = &self.scheduler {
            scheduler.halt().await;
        }
        self.scheduler = None;

        // Stop the PKI worker.
        if let Some(halt_tx) = self.pki_halt_tx.take() {
            let _ = halt_tx.send(());
        }
        if let Some(handle) = self.pki_worker.take() {
            let _ = handle.await;
        }
        self.pki = None;
        self.connector = None;

        // Flush and close the mix keys.
        if let Some(mix_keys) = self.mix_keys.take() {
            mix_keys.halt();
        }

        debug!(
            shed = self.counters.ingress_shed.load(Ordering::Relaxed),
            unwrap_failures = self.counters.unwrap_failures.load(Ordering::Relaxed),
            replays = self.counters.replay_drops.load(Ordering::Relaxed),
            "final packet counters"
        );
        info!("shutdown complete");
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Ensure the data directory exists with owner-only permissions.
fn init_data_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
    const DIR_MODE: u32 = 0o700;

    match std::fs::symlink_metadata(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::DirBuilder::new()
                .mode(DIR_MODE)
                .create(dir)
                .map_err(|e| Error::DataDir(format!("create {}: {e}", dir.display())))?;
            // The umask may have narrowed the mode; force it.
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIR_MODE))
                .map_err(|e| Error::DataDir(format!("chmod {}: {e}", dir.display())))?;
            Ok(())
        }
        Err(e) => Err(Error::DataDir(format!("stat {}: {e}", dir.display()))),
        Ok(md) => {
            if !md.is_dir() {
                return Err(Error::DataDir(format!(
                    "{} is not a directory",
                    dir.display(),
                )));
            }
            let mode = md.permissions().mode() & 0o777;
            if mode != DIR_MODE {
                return Err(Error::DataDir(format!(
                    "{} has invalid permissions {mode:o}",
                    dir.display(),
                )));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn test_config(data_dir: &Path, generate_only: bool) -> Config {
        Config::parse(&format!(
            r#"
                [server]
                identifier = "mix1"
                data_dir = "{}"
                addresses = ["127.0.0.1:0"]

                [debug]
                generate_only = {generate_only}
            "#,
            data_dir.display(),
        ))
        .expect("config")
    }

    #[tokio::test]
    async fn test_generate_only_creates_key_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(dir.path(), true);

        let result = Server::new(cfg, Externals::default()).await;
        assert!(matches!(result, Err(Error::GenerateOnly)));

        let epoch = EpochTime::now().epoch;
        for name in [
            "identity.key".to_string(),
            "link.key".to_string(),
            format!("mixkey-{epoch}.db"),
        ] {
            let path = dir.path().join(&name);
            assert!(path.exists(), "{name} must exist");
            let mode = std::fs::metadata(&path)
                .expect("metadata")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600, "{name} must be owner-only");
        }
    }

    #[tokio::test]
    async fn test_identity_stable_across_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");

        let first = Server::new(test_config(dir.path(), true), Externals::default()).await;
        assert!(matches!(first, Err(Error::GenerateOnly)));
        let identity =
            keyfile::load_or_generate_identity(&dir.path().join("identity.key")).expect("load");

        let mut server = Server::new(test_config(dir.path(), false), Externals::default())
            .await
            .expect("server");
        assert_eq!(server.node_id(), identity.node_id());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_and_bounded_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut server = Server::new(test_config(dir.path(), false), Externals::default())
            .await
            .expect("server");

        assert_eq!(server.listener_addrs().len(), 1);

        tokio::time::timeout(Duration::from_secs(5), server.shutdown())
            .await
            .expect("shutdown within bounds");

        // Idempotent.
        tokio::time::timeout(Duration::from_secs(1), server.shutdown())
            .await
            .expect("second shutdown is a no-op");
    }

    #[tokio::test]
    async fn test_data_dir_bad_mode_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().join("data");
        std::fs::create_dir(&data_dir).expect("mkdir");
        std::fs::set_permissions(&data_dir, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let result = Server::new(test_config(&data_dir, true), Externals::default()).await;
        assert!(matches!(result, Err(Error::DataDir(_))));
    }

    #[tokio::test]
    async fn test_data_dir_created_with_owner_only_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().join("fresh");

        let result = Server::new(test_config(&data_dir, true), Externals::default()).await;
        assert!(matches!(result, Err(Error::GenerateOnly)));

        let mode = std::fs::metadata(&data_dir)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
