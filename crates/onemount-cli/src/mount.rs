//! Mount orchestration
//!
//! Assembles the engine from its components, mounts the FUSE filesystem,
//! starts the background tasks, and runs the ordered shutdown on signal:
//! cache cleanup → delta loop → download manager → upload manager →
//! unmount, each with a bounded grace period.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use onemount_cache::{eviction, ContentCache};
use onemount_core::config::Config;
use onemount_core::ports::publisher::NullPublisher;
use onemount_core::ports::{IRemoteClient, IStatusPublisher, ITokenProvider};
use onemount_fs::publisher::DbusPublisher;
use onemount_fs::{
    DownloadManager, FsConfig, InodeTree, OneMountFs, OnlineState, StatusEngine,
    TreeEvictionGate, UploadManager,
};
use onemount_graph::auth::FileTokenProvider;
use onemount_graph::DriveClient;
use onemount_store::MetadataStore;
use onemount_sync::{SchedulerConfig, SyncEngine, SyncScheduler};

/// Download worker pool size.
const DOWNLOAD_WORKERS: usize = 8;

/// Grace period for each shutdown stage.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Retries per shutdown stage.
const SHUTDOWN_RETRIES: u32 = 3;

/// How the mount ended.
pub enum MountExit {
    /// SIGINT/SIGTERM; the caller exits 128
    Signal,
    /// The session ended on its own (unmounted externally)
    Finished,
}

/// Verifies the token file yields a usable bearer token.
pub async fn verify_auth(
    config: &Config,
    mountpoint: &Path,
    _no_browser: bool,
) -> anyhow::Result<String> {
    let token_path = config.auth_tokens_path(mountpoint);
    let provider = FileTokenProvider::new(token_path.clone());
    provider.bearer().await.with_context(|| {
        format!(
            "no valid tokens at {} (run your authentication agent first)",
            token_path.display()
        )
    })?;
    Ok(token_path.display().to_string())
}

/// Mounts and runs until a signal or external unmount.
pub async fn run(config: Config, mountpoint: std::path::PathBuf, debug: bool) -> anyhow::Result<MountExit> {
    let mount_dir = config.mount_cache_dir(&mountpoint);
    std::fs::create_dir_all(&mount_dir)
        .with_context(|| format!("creating cache directory {}", mount_dir.display()))?;

    // --- persistent state ---
    let store = Arc::new(
        MetadataStore::open(&config.database_path(&mountpoint))
            .await
            .context("opening metadata store")?,
    );
    let cache = Arc::new(ContentCache::new(&mount_dir).context("opening content cache")?);

    // --- remote client ---
    let tokens: Arc<dyn ITokenProvider> = Arc::new(FileTokenProvider::new(
        config.auth_tokens_path(&mountpoint),
    ));
    let remote: Arc<dyn IRemoteClient> = Arc::new(DriveClient::new(tokens));

    // --- engine state ---
    let tree = Arc::new(InodeTree::new());
    let online = Arc::new(OnlineState::new());

    let publisher: Arc<dyn IStatusPublisher> = match DbusPublisher::connect().await {
        Ok(publisher) => Arc::new(publisher),
        Err(e) => {
            info!(error = %e, "no session bus, status limited to xattrs");
            Arc::new(NullPublisher)
        }
    };
    let statuses = Arc::new(StatusEngine::new(
        Arc::clone(&tree),
        Arc::clone(&store),
        publisher,
    ));

    let download_cancel = CancellationToken::new();
    let downloads = Arc::new(DownloadManager::new(
        Arc::clone(&remote),
        Arc::clone(&cache),
        Arc::clone(&tree),
        Arc::clone(&statuses),
        Arc::clone(&online),
        DOWNLOAD_WORKERS,
        download_cancel.clone(),
    ));

    let upload_cancel = CancellationToken::new();
    let uploads = UploadManager::new(
        Arc::clone(&remote),
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&tree),
        Arc::clone(&statuses),
        Arc::clone(&online),
        upload_cancel.clone(),
    );
    let upload_task = tokio::spawn(Arc::clone(&uploads).run());

    // --- filesystem ---
    let fs_config = FsConfig {
        fsync_timeout: Duration::from_secs(config.mount_timeout),
        ..FsConfig::default()
    };
    let fs = OneMountFs::new(
        tokio::runtime::Handle::current(),
        Arc::clone(&tree),
        Arc::clone(&cache),
        Arc::clone(&store),
        Arc::clone(&remote),
        Arc::clone(&downloads),
        Arc::clone(&uploads),
        Arc::clone(&statuses),
        Arc::clone(&online),
        fs_config,
    );
    let open_counts = fs.open_counts();

    let mut options = vec![
        fuser::MountOption::FSName("onemount".to_string()),
        fuser::MountOption::NoAtime,
        fuser::MountOption::DefaultPermissions,
    ];
    if debug {
        options.push(fuser::MountOption::AutoUnmount);
    }
    let session = fuser::spawn_mount2(fs, &mountpoint, &options)
        .with_context(|| format!("mounting at {}", mountpoint.display()))?;
    info!(mountpoint = %mountpoint.display(), "mounted");

    // --- background tasks ---
    let gate = Arc::new(TreeEvictionGate::new(
        Arc::clone(&tree),
        Arc::clone(&store),
        open_counts,
        tokio::runtime::Handle::current(),
    ));
    let cleanup = eviction::start_cleanup(
        Arc::clone(&cache),
        gate,
        Duration::from_secs(config.cache_cleanup_interval),
        config.cache_expiration,
        config.max_cache_size * 1024 * 1024,
    );

    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&remote),
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&tree),
        Arc::clone(&uploads),
        Arc::clone(&statuses),
        Arc::clone(&online),
    ));

    if config.sync_tree {
        let walker = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = walker.walk_tree().await {
                warn!(error = %e, "background tree walk failed");
            }
        });
    }

    let delta_cancel = CancellationToken::new();
    let scheduler = SyncScheduler::new(
        Arc::clone(&engine),
        None, // push channel endpoint provisioning is deployment-specific
        SchedulerConfig {
            poll_interval: Duration::from_secs(config.delta_interval),
        },
        delta_cancel.clone(),
    );
    let delta_task = tokio::spawn(scheduler.run());

    // --- wait for a signal ---
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    // --- ordered shutdown ---
    info!("shutting down: cleanup, delta, downloads, uploads, unmount");
    with_grace("cache cleanup", cleanup.stop()).await;

    delta_cancel.cancel();
    with_grace("delta loop", async {
        let _ = delta_task.await;
    })
    .await;

    // shutdown() cancels download_cancel and waits for the worker tasks
    with_grace("download manager", downloads.shutdown()).await;

    upload_cancel.cancel();
    with_grace("upload manager", async {
        let _ = upload_task.await;
    })
    .await;

    drop(session); // unmount
    info!("unmounted");
    Ok(MountExit::Signal)
}

/// Awaits a shutdown stage with the bounded grace period, retrying the
/// wait a few times before giving up on the stage.
async fn with_grace<F: std::future::Future<Output = ()>>(stage: &str, fut: F) {
    tokio::pin!(fut);
    for attempt in 1..=SHUTDOWN_RETRIES {
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut fut).await.is_ok() {
            return;
        }
        warn!(stage, attempt, "shutdown stage still running");
    }
    warn!(stage, "abandoning shutdown stage");
}
