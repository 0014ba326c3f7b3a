// src/core/state.rs

//! Defines the central `NodeContext` struct, holding all shared node-wide state.
//!
//! The context is wrapped in an `Arc` and passed to every task and request
//! handler; there is no process-global singleton.

use crate::config::NodeConfig;
use crate::core::cluster::keepalive::HeartbeatTable;
use crate::core::cluster::regpool::RegPool;
use crate::core::meta::{
    BMD_FNAME, BmdOwner, CONF_FNAME, ClusterConfig, ConfigOwner, RMD_FNAME, RmdOwner, SMAP_FNAME,
    Smap, SmapOwner, Snode,
};
use crate::core::notifs::{NotifEvent, NotifTables};
use crate::core::{HDR_CALLER_ID, HDR_CALLER_NAME, HDR_CALLER_SMAP_VERSION, OpalError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Node-local mountpath registry snapshot, relative to the data dir.
pub const MOUNTPATHS_FNAME: &str = "node.mountpaths";

/// A target-attached storage path. The data path below it is out of scope;
/// the control plane only tracks the registry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Mountpath {
    pub path: String,
    pub enabled: bool,
}

fn load_mountpaths(dir: &Path) -> Result<Vec<Mountpath>, OpalError> {
    match std::fs::read_to_string(dir.join(MOUNTPATHS_FNAME)) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Contains the initialized context plus the channel ends consumed by the
/// background-task spawner.
pub struct NodeInit {
    pub ctx: Arc<NodeContext>,
    /// Completion events from the notification tables.
    pub notif_event_rx: mpsc::UnboundedReceiver<NotifEvent>,
}

/// The central struct holding all shared, node-wide state.
pub struct NodeContext {
    /// The node-local file configuration.
    pub config: RwLock<NodeConfig>,
    /// This node's own descriptor. Flags mirror the latest cluster map.
    pub snode: RwLock<Snode>,

    // --- Revision owners ---
    pub smap: SmapOwner,
    pub bmd: BmdOwner,
    pub rmd: RmdOwner,
    pub cluconf: ConfigOwner,
    /// The loaded-from-disk cluster map passed validation at startup.
    pub loaded_smap_reliable: AtomicBool,

    // --- Cluster machinery ---
    pub client: reqwest::Client,
    pub notifs: NotifTables,
    pub regpool: RegPool,
    pub hb: HeartbeatTable,

    // --- Lifecycle flags ---
    /// An election involving this node is in flight; ownership tables refuse
    /// incoming revisions until it settles.
    pub vote_in_progress: AtomicBool,
    /// Shutdown has begun; metasync receivers answer ServiceUnavailable.
    pub stopping: AtomicBool,
    /// The registration window is open; joins land in the regpool instead of
    /// being applied directly.
    pub in_startup: AtomicBool,
    /// Rebalance triggering is held back until primary startup completes.
    pub rmd_starting: AtomicBool,

    /// Wall-clock of the last adopted cluster-map change; gates the
    /// interrupted-rebalance resume.
    pub last_smap_change: Mutex<Instant>,
    /// Get-from-neighbor window refcount (targets).
    pub gfn_active: AtomicU64,
    /// When the GFN window is due to close; a `stop` schedules deactivation
    /// after a linger rather than dropping the count immediately.
    pub gfn_deadline: Mutex<Option<Instant>>,
    /// Attached storage paths (targets).
    pub mountpaths: RwLock<Vec<Mountpath>>,
    /// Stats of operations running locally on this node, answered to IC
    /// housekeeping probes.
    pub local_xactions: DashMap<String, serde_json::Value>,
    /// Transaction UUIDs between commit-before and commit-after.
    pub pending_txns: Mutex<HashSet<String>>,

    /// A handle to the logging filter, allowing for dynamic log level
    /// changes via set-config.
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub start_time: Instant,
}

impl NodeContext {
    /// Initializes the node context from the given configuration, loading
    /// any persisted revisions from the data dir.
    pub fn initialize(
        config: NodeConfig,
        shutdown_tx: broadcast::Sender<()>,
        log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    ) -> Result<NodeInit, OpalError> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)?;

        let snode = config
            .snode()
            .map_err(|e| OpalError::Internal(e.to_string()))?;
        info!("node identity: {} at {}", snode, snode.control_url);

        let (smap, smap_loaded) = SmapOwner::load_or_default(data_dir.join(SMAP_FNAME))?;
        let (bmd, _) = BmdOwner::load_or_default(data_dir.join(BMD_FNAME))?;
        let (rmd, _) = RmdOwner::load_or_default(data_dir.join(RMD_FNAME))?;
        let (cluconf, _) = ConfigOwner::load_or_default(data_dir.join(CONF_FNAME))?;

        let mountpaths = load_mountpaths(&data_dir)?;
        if !mountpaths.is_empty() {
            info!("loaded {} persisted mountpath(s)", mountpaths.len());
        }

        let client = reqwest::Client::builder()
            .timeout(config.cluster.timeout.max_host_busy)
            .connect_timeout(config.cluster.timeout.cplane_operation)
            .build()?;

        let (notifs, notif_event_rx) = NotifTables::new();

        let ctx = Arc::new(NodeContext {
            config: RwLock::new(config),
            snode: RwLock::new(snode),
            smap,
            bmd,
            rmd,
            cluconf,
            loaded_smap_reliable: AtomicBool::new(smap_loaded),
            client,
            notifs,
            regpool: RegPool::new(),
            hb: HeartbeatTable::new(),
            vote_in_progress: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            in_startup: AtomicBool::new(true),
            rmd_starting: AtomicBool::new(false),
            last_smap_change: Mutex::new(Instant::now()),
            gfn_active: AtomicU64::new(0),
            gfn_deadline: Mutex::new(None),
            mountpaths: RwLock::new(mountpaths),
            local_xactions: DashMap::new(),
            pending_txns: Mutex::new(HashSet::new()),
            log_reload_handle,
            shutdown_tx,
            start_time: Instant::now(),
        });

        Ok(NodeInit { ctx, notif_event_rx })
    }

    pub fn self_id(&self) -> String {
        self.snode.read().id.clone()
    }

    pub fn self_snode(&self) -> Snode {
        self.snode.read().clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Whether the latest adopted cluster map designates this node primary.
    pub async fn is_primary(&self) -> bool {
        let smap = self.smap.get().await;
        smap.is_primary(&self.snode.read().id)
    }

    /// The effective cluster configuration: the replicated revision once one
    /// exists, the local seed section before that.
    pub async fn cluster_config(&self) -> Arc<ClusterConfig> {
        let rev = self.cluconf.get().await;
        if !rev.is_empty() {
            return rev;
        }
        Arc::new(self.config.read().cluster.clone())
    }

    /// Builds an intra-cluster request with the caller-identity headers and
    /// the optional bearer token attached.
    pub async fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let smap_version = self.smap.get().await.version;
        let (id, name, token) = {
            let snode = self.snode.read();
            let config = self.config.read();
            (
                snode.id.clone(),
                format!("{}", *snode),
                config.auth_token.clone(),
            )
        };
        let mut rb = self
            .client
            .request(method, url)
            .header(HDR_CALLER_ID, id)
            .header(HDR_CALLER_NAME, name)
            .header(HDR_CALLER_SMAP_VERSION, smap_version.to_string());
        if let Some(token) = token {
            rb = rb.bearer_auth(token);
        }
        rb
    }

    /// Installs a freshly adopted cluster map into the node's derived state:
    /// own flags, heartbeat table, notification tables, change timestamp.
    pub fn react_smap_change(&self, smap: &Smap) {
        *self.last_smap_change.lock() = Instant::now();
        let self_id = self.self_id();
        if let Some(own) = smap.get_node(&self_id) {
            self.snode.write().flags_raw = own.flags_raw;
        }
        self.hb.retain_members(smap);
        let aborted = self.notifs.handle_smap_change(smap);
        for uuid in aborted {
            info!("aborted operation {uuid}: notifier left the cluster map");
        }
    }

    /// Snapshot of all four revisions plus flags, for joins and discovery.
    pub async fn clu_meta(&self) -> crate::core::meta::CluMeta {
        let smap = self.smap.get().await;
        let bmd = self.bmd.get().await;
        let rmd = self.rmd.get().await;
        let config = self.cluconf.get().await;
        crate::core::meta::CluMeta {
            smap: (!smap.is_empty()).then(|| (*smap).clone()),
            bmd: (!bmd.is_empty()).then(|| (*bmd).clone()),
            rmd: (!rmd.is_empty()).then(|| (*rmd).clone()),
            config: (!config.is_empty()).then(|| (*config).clone()),
            vote_in_progress: self.vote_in_progress.load(Ordering::SeqCst),
        }
    }

    /// Attaches (or, with `enable_only`, re-enables) a mountpath and
    /// persists the registry. Returns the updated list.
    pub fn attach_mountpath(
        &self,
        path: &str,
        enable_only: bool,
    ) -> Result<Vec<Mountpath>, OpalError> {
        let snapshot = {
            let mut mps = self.mountpaths.write();
            match mps.iter_mut().find(|m| m.path == path) {
                Some(mp) => mp.enabled = true,
                None if enable_only => {
                    return Err(OpalError::NotFound(format!("mountpath {path}")));
                }
                None => mps.push(Mountpath {
                    path: path.to_string(),
                    enabled: true,
                }),
            }
            mps.clone()
        };
        self.persist_mountpaths(&snapshot)?;
        Ok(snapshot)
    }

    /// Detaches (or, with `disable_only`, disables) a mountpath and
    /// persists the registry. Returns the updated list.
    pub fn detach_mountpath(
        &self,
        path: &str,
        disable_only: bool,
    ) -> Result<Vec<Mountpath>, OpalError> {
        let snapshot = {
            let mut mps = self.mountpaths.write();
            if disable_only {
                match mps.iter_mut().find(|m| m.path == path) {
                    Some(mp) => mp.enabled = false,
                    None => return Err(OpalError::NotFound(format!("mountpath {path}"))),
                }
            } else {
                let before = mps.len();
                mps.retain(|m| m.path != path);
                if mps.len() == before {
                    return Err(OpalError::NotFound(format!("mountpath {path}")));
                }
            }
            mps.clone()
        };
        self.persist_mountpaths(&snapshot)?;
        Ok(snapshot)
    }

    // Same atomic tmp-file-then-rename idiom the revision owners use.
    fn persist_mountpaths(&self, mps: &[Mountpath]) -> Result<(), OpalError> {
        let path = self.config.read().data_dir().join(MOUNTPATHS_FNAME);
        let content = serde_json::to_string_pretty(mps)?;
        let tmp = path.with_extension(format!("tmp-{}", rand::random::<u32>()));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Purges this node's persisted control-plane state (decommission).
    pub async fn wipe_persisted_state(&self) {
        self.smap.remove_snapshot();
        self.bmd.remove_snapshot();
        self.rmd.remove_snapshot();
        self.cluconf.remove_snapshot();
        let dir = self.config.read().data_dir();
        let _ = std::fs::remove_file(dir.join(MOUNTPATHS_FNAME));
        for marker in [
            crate::core::meta::REBALANCE_MARKER,
            crate::core::meta::RESTARTED_MARKER,
        ] {
            let _ = std::fs::remove_file(dir.join(marker));
        }
    }

    pub fn marker_path(&self, name: &str) -> std::path::PathBuf {
        self.config.read().data_dir().join(name)
    }

    pub fn marker_exists(&self, name: &str) -> bool {
        self.marker_path(name).exists()
    }

    pub fn put_marker(&self, name: &str) -> Result<(), OpalError> {
        std::fs::write(self.marker_path(name), b"")?;
        Ok(())
    }

    pub fn remove_marker(&self, name: &str) {
        let _ = std::fs::remove_file(self.marker_path(name));
    }

    /// Rebalance status string reported on health queries.
    pub fn rebalance_status(&self) -> &'static str {
        if self.marker_exists(crate::core::meta::REBALANCE_MARKER) {
            "running"
        } else {
            "idle"
        }
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("snode", &*self.snode.read())
            .finish_non_exhaustive()
    }
}
