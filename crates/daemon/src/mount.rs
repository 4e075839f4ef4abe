//! Mount lifecycle: build the backend, recover the engine, expose it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use common::bus::{InvalidationTransport, LocalHub};
use common::{MountOptions, ObjectFs};
use object_store::Storage;
use tracing::{info, warn};

use crate::config::MountConfig;

/// A running mount.
///
/// The engine is shared with the FUSE session, if there is one. Dropping a
/// `Mount` without calling [`Mount::unmount`] leaves the kernel mount to
/// `auto_unmount` and whatever is dirty to journal recovery on the next
/// start.
pub struct Mount {
    fs: Arc<ObjectFs>,
    config: MountConfig,
    #[cfg(feature = "fuse")]
    session: Option<fuser::BackgroundSession>,
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("mount_id", &self.fs.mount_id())
            .field("state_dir", &self.config.state_dir)
            .field("mount_point", &self.config.mount_point)
            .finish()
    }
}

impl Mount {
    /// Start a mount whose invalidation events stay inside this process.
    pub async fn start(config: MountConfig) -> anyhow::Result<Self> {
        Self::start_with_transport(config, Arc::new(LocalHub::new())).await
    }

    /// Start a mount that exchanges invalidation events over `transport`.
    pub async fn start_with_transport(
        config: MountConfig,
        transport: Arc<dyn InvalidationTransport>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let storage = Storage::new(config.storage.clone())
            .await
            .context("failed to open object storage")?;
        let options = MountOptions::new(Arc::new(storage), transport, config.state_dir.clone())
            .with_config(config.engine.clone());
        let fs = ObjectFs::mount(options)
            .await
            .with_context(|| format!("failed to mount {}", config.state_dir.display()))?;
        let fs = Arc::new(fs);
        info!(
            mount = %fs.mount_id(),
            state_dir = %config.state_dir.display(),
            "filesystem ready"
        );

        #[cfg(feature = "fuse")]
        let session = match &config.mount_point {
            Some(mount_point) => {
                let session = crate::fuse::spawn(
                    fs.clone(),
                    mount_point,
                    &config.fuse,
                    tokio::runtime::Handle::current(),
                )
                .with_context(|| format!("failed to mount at {}", mount_point.display()))?;
                info!(mount_point = %mount_point.display(), "fuse session started");
                Some(session)
            }
            None => None,
        };

        #[cfg(not(feature = "fuse"))]
        if let Some(mount_point) = &config.mount_point {
            warn!(
                mount_point = %mount_point.display(),
                "built without fuse support, running headless"
            );
        }

        Ok(Self {
            fs,
            config,
            #[cfg(feature = "fuse")]
            session,
        })
    }

    /// Stop the FUSE session, then flush everything and stop the engine.
    pub async fn unmount(mut self) -> anyhow::Result<()> {
        #[cfg(feature = "fuse")]
        if let Some(session) = self.session.take() {
            tokio::task::spawn_blocking(move || session.join())
                .await
                .context("fuse session panicked")?;
            info!("fuse session stopped");
        }

        match Arc::try_unwrap(self.fs) {
            Ok(fs) => fs.shutdown().await.context("unclean shutdown")?,
            Err(fs) => {
                warn!(
                    mount = %fs.mount_id(),
                    "engine still shared at unmount, syncing instead of shutting down"
                );
                fs.sync_all().await.context("final sync failed")?;
            }
        }
        Ok(())
    }

    /* Getters */

    pub fn fs(&self) -> &Arc<ObjectFs> {
        &self.fs
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.config.mount_point.as_deref()
    }

    pub fn is_fuse_mounted(&self) -> bool {
        #[cfg(feature = "fuse")]
        {
            self.session.is_some()
        }
        #[cfg(not(feature = "fuse"))]
        {
            false
        }
    }
}
