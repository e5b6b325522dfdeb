use std::sync::Arc;

use docfs::backend::dir::DirStore;
use docfs::mount::{MountContext, MountError, MountOptions};
use docfs::telemetry::StatsSink;
use thiserror::Error;
use tokio::select;
use tracing::{debug, info, warn};

use crate::app_config::{self, BackendConfig};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Mount(#[from] MountError),
}

mod managed_fuse {
    //! fuser will not attempt to force an unmount when the `BackgroundSession` goes away, and will
    //! only do a regular unmount. `ManagedFuse` outlives the session and makes sure the mount point
    //! is really detached.
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use docfs::backend::StorageBackend;
    use docfs::fs::fuser::FuserAdapter;
    use docfs::mount::MountContext;
    use fuser::BackgroundSession;
    use nix::errno::Errno;
    use tracing::{debug, error};

    use super::app_config;

    pub struct FuseCoreScope {
        session: BackgroundSession,
    }

    impl FuseCoreScope {
        pub fn spawn<B: StorageBackend>(
            ctx: Arc<MountContext<B>>,
            config: &app_config::Config,
            handle: tokio::runtime::Handle,
        ) -> Result<Self, std::io::Error> {
            let fuse_adapter = FuserAdapter::new(ctx, handle, (config.uid, config.gid));
            let mount_opts = [
                fuser::MountOption::FSName("docfs".to_owned()),
                fuser::MountOption::Subtype("docfs".to_owned()),
                fuser::MountOption::RO,
                fuser::MountOption::NoDev,
                fuser::MountOption::NoSuid,
                fuser::MountOption::AutoUnmount,
                fuser::MountOption::DefaultPermissions,
            ];

            Ok(Self {
                session: fuser::spawn_mount2(fuse_adapter, &config.mount_point, &mount_opts)?,
            })
        }

        /// Unmount and wait for the session thread, which tears the mount context down on its way
        /// out.
        pub fn join(self) {
            self.session.join();
        }
    }

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(config: &app_config::Config) -> Self {
            Self {
                mount_point: config.mount_point.clone(),
            }
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for attempt in 1..=UMOUNT_ATTEMPT_COUNT {
                match nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH) {
                    Ok(()) => {
                        debug!(attempt, "Detached FUSE filesystem.");
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(attempt, "FUSE filesystem still busy, retrying...");
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!(attempt, "FUSE filesystem already unmounted.");
                        break;
                    }
                    Err(e) => {
                        error!(attempt, error = %e, "Failed to unmount FUSE filesystem.");
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Build the library-side mount options from the application config.
pub fn mount_options(config: &app_config::Config) -> Result<MountOptions, std::io::Error> {
    let stats = match &config.stats.path {
        Some(path) => StatsSink::to_file(path, config.stats.capacity)?,
        None => StatsSink::disabled(),
    };
    Ok(MountOptions {
        dispatcher: config.dispatcher.options(),
        request_timeout: config.dispatcher.request_timeout(),
        watchdog_deadline: config.shutdown.watchdog_deadline(),
        stats,
    })
}

/// Connect to the configured store.
pub fn connect(config: &app_config::Config) -> Result<Arc<MountContext<DirStore>>, DaemonError> {
    let options = mount_options(config)?;
    match &config.backend {
        BackendConfig::Directory { root } => {
            info!(root = %root.display(), "Connecting to directory store.");
            Ok(MountContext::<DirStore>::init(root, options)?)
        }
    }
}

/// Main entry point for the daemon.
pub async fn run(
    config: app_config::Config,
    handle: tokio::runtime::Handle,
) -> Result<(), DaemonError> {
    prepare_mount_point(&config.mount_point).await?;

    let ctx = connect(&config)?;
    info!("Mounting filesystem at {}.", config.mount_point.display());

    // Declared before the session so the forced unmount runs after the session is gone.
    let _fuse = managed_fuse::ManagedFuse::new(&config);
    {
        let session = managed_fuse::FuseCoreScope::spawn(Arc::clone(&ctx), &config, handle)?;
        info!("docfs is running. Press Ctrl+C to stop.");

        let waited = wait_for_exit().await;
        // Joining waits out teardown, which may block for up to the watchdog deadline.
        tokio::task::block_in_place(|| session.join());
        waited?;
    }

    // The kernel session normally tears the mount down from `destroy`; this covers sessions that
    // ended without it.
    match ctx.shutdown() {
        Ok(report) => warn!(?report, "mount torn down after the kernel session ended"),
        Err(e) => debug!(error = %e, "mount already torn down"),
    }
    Ok(())
}

pub fn spawn(config: app_config::Config) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("docfs-rt")
        .build()?;
    runtime.block_on(run(config, runtime.handle().clone()))
}
