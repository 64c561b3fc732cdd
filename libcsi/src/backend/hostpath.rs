//! Host-directory node backend.
//!
//! [`HostPathBackend`] implements [`CsiNode`] for volumes that are plain
//! directories already present on the host under a configured root.  Staging
//! records the volume in the durable [`StateStore`] and fires its stage hook;
//! publishing bind-mounts the source directory read-only at the workload's
//! target path.
//!
//! # Locking
//!
//! Every lifecycle operation runs under one [`tokio::sync::Mutex`] for its
//! whole duration, hook calls and mount syscalls included.  This keeps the
//! state file and the active index consistent with each other at the cost of
//! serializing all volumes on the node.
//!
//! # Ordering
//!
//! * stage: mkdir → stage hook → active index → state file
//! * unstage: unstage hook → remove staging dir → state file → active index
//!
//! A hook failure aborts the operation before the state file is touched, so
//! the caller can retry safely.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::NodeConfig;
use crate::error::CsiError;
use crate::hook::{HookInvoker, HttpHook};
use crate::mount::{Binding, HostMounter, Mounter};
use crate::node::CsiNode;
use crate::state::{StateStore, VolumeRecord};
use crate::types::*;
use crate::validate::{VolumeContext, read_volume_capability};

/// Permissions of freshly created staging and target directories.
const DIR_MODE: u32 = 0o750;

/// In-memory view of a staged volume whose stage hook has succeeded.
///
/// The stage hook is not kept: once active, only deactivation needs a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveVolume {
    mount_path: PathBuf,
    unstage_hook_url: Option<Url>,
}

impl From<&VolumeRecord> for ActiveVolume {
    fn from(record: &VolumeRecord) -> Self {
        Self {
            mount_path: record.mount_path.clone(),
            unstage_hook_url: record.unstage_hook_url.clone(),
        }
    }
}

/// Everything guarded by the lifecycle lock.
#[derive(Debug)]
struct NodeState {
    store: StateStore,
    /// Active volumes, keyed by staging path.
    active: HashMap<PathBuf, ActiveVolume>,
}

/// Concrete CSI node backend for pre-existing host directories.
pub struct HostPathBackend {
    node_id: String,
    mount_root: PathBuf,
    allow_writer_access: bool,
    hooks: Arc<dyn HookInvoker>,
    mounter: Arc<dyn Mounter>,
    state: Mutex<NodeState>,
}

impl HostPathBackend {
    /// Create a backend talking to the real host: HTTP hooks, kernel mounts
    /// and the state file named in `config`.
    ///
    /// Call [`Self::reconcile`] afterwards to re-activate volumes staged by a
    /// previous process run.
    pub async fn open(config: &NodeConfig) -> Result<Self, CsiError> {
        let store = StateStore::load_or_init(&config.state_file).await?;
        let hooks = Arc::new(HttpHook::new(config.hook)?);
        Ok(Self::with_parts(
            config,
            store,
            hooks,
            Arc::new(HostMounter::new()),
        ))
    }

    /// Create a backend from already constructed collaborators.
    pub fn with_parts(
        config: &NodeConfig,
        store: StateStore,
        hooks: Arc<dyn HookInvoker>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            mount_root: config.mount_root.clone(),
            allow_writer_access: config.allow_writer_access,
            hooks,
            mounter,
            state: Mutex::new(NodeState {
                store,
                active: HashMap::new(),
            }),
        }
    }

    /// Re-activate every persisted volume whose staging directory still
    /// exists, firing its stage hook again.
    ///
    /// Volumes whose staging directory is gone are skipped but kept in the
    /// state file; a later unstage removes them.  A failing stage hook leaves
    /// the volume inactive without failing the whole pass.  Returns the number
    /// of volumes activated.
    pub async fn reconcile(&self) -> usize {
        let mut state = self.state.lock().await;
        let records: Vec<(VolumeId, VolumeRecord)> = state
            .store
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();

        let mut activated = 0;
        for (volume_id, record) in records {
            match tokio::fs::try_exists(&record.staging_path).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        %volume_id,
                        staging_path = %record.staging_path.display(),
                        "staging path missing, skipping reconciliation",
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        %volume_id,
                        staging_path = %record.staging_path.display(),
                        error = %e,
                        "cannot stat staging path, skipping reconciliation",
                    );
                    continue;
                }
            }

            match self.activate(&mut state, &volume_id, &record).await {
                Ok(()) => activated += 1,
                Err(e) => {
                    warn!(%volume_id, error = %e, "failed to re-activate volume, leaving it inactive");
                }
            }
        }

        info!(
            persisted = state.store.len(),
            activated,
            "reconciliation complete",
        );
        activated
    }

    /// Fire the unstage hook of every active volume, best effort.
    ///
    /// Used on shutdown: failures are logged and never propagated, and the
    /// active index is emptied so a second drain does nothing.
    pub async fn drain(&self) {
        let mut state = self.state.lock().await;
        let active = std::mem::take(&mut state.active);
        for (staging_path, volume) in active {
            let Some(url) = &volume.unstage_hook_url else {
                continue;
            };
            match self.hooks.invoke(url).await {
                Ok(response) => info!(
                    staging_path = %staging_path.display(),
                    mount_path = %volume.mount_path.display(),
                    unstage_hook_url = %url,
                    %response,
                    "successfully called hook",
                ),
                Err(e) => error!(
                    staging_path = %staging_path.display(),
                    unstage_hook_url = %url,
                    error = %e,
                    "failed to call hook",
                ),
            }
        }
        info!("active volumes drained");
    }

    /// Fire the stage hook and add the volume to the active index.
    async fn activate(
        &self,
        state: &mut NodeState,
        volume_id: &VolumeId,
        record: &VolumeRecord,
    ) -> Result<(), CsiError> {
        if let Some(url) = &record.stage_hook_url {
            let response = self.hooks.invoke(url).await.inspect_err(|e| {
                error!(%volume_id, stage_hook_url = %url, error = %e, "failed to call hook");
            })?;
            info!(%volume_id, stage_hook_url = %url, %response, "successfully called hook");
        }
        state
            .active
            .insert(record.staging_path.clone(), ActiveVolume::from(record));
        Ok(())
    }
}

/// `mkdir -p` with [`DIR_MODE`], then an optional explicit chmod.
async fn create_dir(path: &Path, mode: Option<u32>) -> Result<(), CsiError> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .await
        .map_err(|e| {
            error!(path = %path.display(), error = %e, "failed to mkdir");
            CsiError::Internal(format!("mkdir {}: {e}", path.display()))
        })?;

    if let Some(mode) = mode {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| {
                error!(path = %path.display(), mode = %format!("{mode:o}"), error = %e, "failed to chmod");
                CsiError::Internal(format!("chmod {}: {e}", path.display()))
            })?;
    }
    Ok(())
}

/// `rm -rf` that treats a missing path as already removed.
async fn remove_dir(path: &Path) -> Result<(), CsiError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to remove directory");
            Err(CsiError::Internal(format!("remove {}: {e}", path.display())))
        }
    }
}

fn require(value: &str, what: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::invalid(format!("{what} missing in request")));
    }
    Ok(())
}

/// Like [`require`], and the value must also be an absolute path.
fn require_absolute<'a>(value: &'a str, what: &str) -> Result<&'a Path, CsiError> {
    require(value, what)?;
    let path = Path::new(value);
    if !path.is_absolute() {
        return Err(CsiError::invalid(format!(
            "{what} must be an absolute path, got {value:?}"
        )));
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for HostPathBackend {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, staging = %req.staging_target_path))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require(&req.volume_id.0, "VolumeId")?;
        require_absolute(&req.staging_target_path, "StagingTargetPath")?;
        let capability =
            read_volume_capability(req.volume_capability.as_ref(), self.allow_writer_access)?;
        let context = VolumeContext::parse(&req.volume_context, &self.mount_root)?;
        let staging = PathBuf::from(&req.staging_target_path);

        let mut state = self.state.lock().await;

        if let Some(existing) = state.store.get(&req.volume_id) {
            if existing.staging_path == staging {
                debug!("volume already staged at this path, assuming idempotent retry");
                return Ok(());
            }
            return Err(CsiError::Conflict(format!(
                "volume {} is already staged to {}",
                req.volume_id,
                existing.staging_path.display()
            )));
        }

        if let Some(owner) = state.store.find_by_staging_path(&staging) {
            return Err(CsiError::Conflict(format!(
                "volume {owner} is already staged to requested StagingTargetPath"
            )));
        }
        if state.active.contains_key(&staging) {
            return Err(CsiError::Conflict(
                "another volume is already staged to requested StagingTargetPath".to_owned(),
            ));
        }

        create_dir(&staging, capability.mode).await?;

        let record = VolumeRecord {
            mount_path: context.mount_path,
            staging_path: staging.clone(),
            stage_hook_url: context.stage_hook_url,
            unstage_hook_url: context.unstage_hook_url,
            variables: context.variables,
        };
        self.activate(&mut state, &req.volume_id, &record).await?;

        state.store.insert(req.volume_id.clone(), record);
        if let Err(e) = state.store.save().await {
            error!(error = %e, "failed to persist staged volume");
            state.store.remove(&req.volume_id);
            state.active.remove(&staging);
            return Err(e);
        }

        info!("volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require(&volume_id.0, "VolumeId")?;
        let staging = require_absolute(staging_target_path, "StagingTargetPath")?.to_path_buf();

        let mut state = self.state.lock().await;

        match state.store.get(volume_id) {
            Some(record) if record.staging_path == staging => {}
            _ => {
                debug!("volume not staged here, nothing to unstage");
                return Ok(());
            }
        }

        if let Some(url) = state
            .active
            .get(&staging)
            .and_then(|v| v.unstage_hook_url.as_ref())
        {
            let response = self.hooks.invoke(url).await.inspect_err(|e| {
                error!(unstage_hook_url = %url, error = %e, "failed to call hook");
            })?;
            info!(unstage_hook_url = %url, %response, "successfully called hook");
        }

        remove_dir(&staging).await?;

        let Some(record) = state.store.remove(volume_id) else {
            return Ok(());
        };
        if let Err(e) = state.store.save().await {
            error!(error = %e, "failed to persist unstaged volume");
            state.store.insert(volume_id.clone(), record);
            return Err(e);
        }
        state.active.remove(&staging);

        info!("volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require(&req.volume_id.0, "VolumeId")?;
        require_absolute(&req.target_path, "TargetPath")?;
        read_volume_capability(req.volume_capability.as_ref(), self.allow_writer_access)?;
        if req.staging_target_path.is_empty() {
            return Err(CsiError::FailedPrecondition(
                "StagingTargetPath missing in request".to_owned(),
            ));
        }
        let target = PathBuf::from(&req.target_path);

        let state = self.state.lock().await;

        let record = state
            .store
            .get(&req.volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(req.volume_id.to_string()))?;
        if record.staging_path != Path::new(&req.staging_target_path) {
            return Err(CsiError::invalid(
                "incompatible VolumeId and StagingTargetPath",
            ));
        }
        let source = record.mount_path.clone();

        match self.mounter.binding(&source, &target).await {
            Ok(Binding::Source) => {
                debug!("target already bound to volume, assuming idempotent retry");
                return Ok(());
            }
            Ok(Binding::Other(bound)) => {
                return Err(CsiError::invalid(format!(
                    "TargetPath is already bound to {bound}"
                )));
            }
            Ok(Binding::Unbound) => {}
            Err(e) => {
                error!(error = %e, "failed to read mountinfo");
                return Err(e);
            }
        }

        create_dir(&target, None).await?;
        self.mounter
            .bind_read_only(&source, &target)
            .await
            .inspect_err(|e| error!(source = %source.display(), error = %e, "failed to mount"))?;

        info!(source = %source.display(), "volume published (read-only bind mount)");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        require(&volume_id.0, "VolumeId")?;
        let target = require_absolute(target_path, "TargetPath")?;

        let _state = self.state.lock().await;

        self.mounter
            .unmount(target)
            .await
            .inspect_err(|e| error!(error = %e, "failed to unmount"))?;
        remove_dir(target).await?;

        info!("volume unpublished");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::StatusCode;

    /// Records every hook call; URLs listed in `failing` return an error.
    #[derive(Default)]
    struct RecordingHooks {
        calls: std::sync::Mutex<Vec<String>>,
        failing: std::sync::Mutex<HashSet<String>>,
    }

    impl RecordingHooks {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, url: &str) -> usize {
            self.calls().iter().filter(|c| c.as_str() == url).count()
        }

        fn fail(&self, url: &str) {
            self.failing.lock().unwrap().insert(url.to_owned());
        }

        fn heal(&self, url: &str) {
            self.failing.lock().unwrap().remove(url);
        }
    }

    #[async_trait]
    impl HookInvoker for RecordingHooks {
        async fn invoke(&self, url: &Url) -> Result<String, CsiError> {
            self.calls.lock().unwrap().push(url.to_string());
            if self.failing.lock().unwrap().contains(url.as_str()) {
                return Err(CsiError::Hook {
                    url: url.to_string(),
                    reason: "connection refused".into(),
                });
            }
            Ok("ok".into())
        }
    }

    /// In-memory mount table.
    #[derive(Default)]
    struct FakeMounter {
        table: std::sync::Mutex<HashMap<PathBuf, String>>,
        binds: AtomicUsize,
    }

    #[async_trait]
    impl Mounter for FakeMounter {
        async fn bind_read_only(&self, source: &Path, target: &Path) -> Result<(), CsiError> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            self.table
                .lock()
                .unwrap()
                .insert(target.to_path_buf(), source.display().to_string());
            Ok(())
        }

        async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
            self.table.lock().unwrap().remove(target);
            Ok(())
        }

        async fn binding(&self, source: &Path, target: &Path) -> Result<Binding, CsiError> {
            Ok(match self.table.lock().unwrap().get(target) {
                None => Binding::Unbound,
                Some(bound) if Path::new(bound) == source => Binding::Source,
                Some(bound) => Binding::Other(bound.clone()),
            })
        }
    }

    const ON: &str = "http://h/on";
    const OFF: &str = "http://h/off";

    struct Fixture {
        tmp: tempfile::TempDir,
        config: NodeConfig,
        hooks: Arc<RecordingHooks>,
        mounter: Arc<FakeMounter>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let mut config = NodeConfig::new("test-node");
            config.state_file = tmp.path().join("state/state.json");
            config.mount_root = tmp.path().join("data");
            std::fs::create_dir_all(config.mount_root.join("v1")).unwrap();
            Self {
                tmp,
                config,
                hooks: Arc::new(RecordingHooks::default()),
                mounter: Arc::new(FakeMounter::default()),
            }
        }

        async fn backend(&self) -> HostPathBackend {
            let store = StateStore::load_or_init(&self.config.state_file)
                .await
                .unwrap();
            HostPathBackend::with_parts(
                &self.config,
                store,
                Arc::clone(&self.hooks) as Arc<dyn HookInvoker>,
                Arc::clone(&self.mounter) as Arc<dyn Mounter>,
            )
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.tmp.path().join(rel)
        }

        fn mount_path(&self) -> PathBuf {
            self.config.mount_root.join("v1")
        }

        fn stage_req(&self, id: &str, staging: &str) -> NodeStageVolumeRequest {
            NodeStageVolumeRequest {
                volume_id: id.into(),
                staging_target_path: self.path(staging).display().to_string(),
                volume_capability: Some(VolumeCapability::default()),
                volume_context: HashMap::from([
                    ("mountPath".to_owned(), self.mount_path().display().to_string()),
                    ("stageHookURL".to_owned(), ON.to_owned()),
                    ("unstageHookURL".to_owned(), OFF.to_owned()),
                    ("${tenant}".to_owned(), "acme".to_owned()),
                ]),
            }
        }

        fn publish_req(&self, id: &str, staging: &str, target: &str) -> NodePublishVolumeRequest {
            NodePublishVolumeRequest {
                volume_id: id.into(),
                staging_target_path: self.path(staging).display().to_string(),
                target_path: self.path(target).display().to_string(),
                volume_capability: Some(VolumeCapability::default()),
            }
        }

        fn path_str(&self, rel: &str) -> String {
            self.path(rel).display().to_string()
        }
    }

    #[tokio::test]
    async fn end_to_end_lifecycle() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        assert_eq!(fx.hooks.calls(), vec![ON.to_owned()]);
        assert!(fx.path("stage/v1").is_dir());

        let persisted = StateStore::load_or_init(&fx.config.state_file).await.unwrap();
        let record = persisted.get(&"v1".into()).unwrap();
        assert_eq!(record.mount_path, fx.mount_path());
        assert_eq!(record.staging_path, fx.path("stage/v1"));
        assert_eq!(record.stage_hook_url.as_ref().unwrap().as_str(), ON);
        assert_eq!(record.unstage_hook_url.as_ref().unwrap().as_str(), OFF);
        assert_eq!(record.variables["tenant"], "acme");

        backend
            .publish_volume(fx.publish_req("v1", "stage/v1", "pub/v1"))
            .await
            .unwrap();
        assert_eq!(
            fx.mounter.table.lock().unwrap().get(&fx.path("pub/v1")),
            Some(&fx.mount_path().display().to_string())
        );
        assert!(fx.path("pub/v1").is_dir());

        let target = fx.path_str("pub/v1");
        backend.unpublish_volume(&"v1".into(), &target).await.unwrap();
        backend.unpublish_volume(&"v1".into(), &target).await.unwrap();
        assert!(!fx.path("pub/v1").exists());
        assert!(fx.mounter.table.lock().unwrap().is_empty());

        backend
            .unstage_volume(&"v1".into(), &fx.path_str("stage/v1"))
            .await
            .unwrap();
        assert_eq!(fx.hooks.count(OFF), 1);
        assert_eq!(fx.hooks.count(ON), 1);
        assert!(!fx.path("stage/v1").exists());

        let persisted = StateStore::load_or_init(&fx.config.state_file).await.unwrap();
        assert!(persisted.is_empty());
        assert!(backend.state.lock().await.active.is_empty());
    }

    #[tokio::test]
    async fn stage_is_idempotent_for_same_path() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        assert_eq!(fx.hooks.count(ON), 1);
    }

    #[tokio::test]
    async fn stage_to_another_path_conflicts() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        let err = backend
            .stage_volume(fx.stage_req("v1", "stage/other"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Conflict(_)));
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert!(!fx.path("stage/other").exists());
    }

    #[tokio::test]
    async fn staging_path_is_unique_across_volumes() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        backend.stage_volume(fx.stage_req("v1", "stage/shared")).await.unwrap();
        let err = backend
            .stage_volume(fx.stage_req("v2", "stage/shared"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert_eq!(fx.hooks.count(ON), 1);
    }

    #[tokio::test]
    async fn concurrent_stages_on_one_path_admit_one() {
        let fx = Fixture::new();
        let backend = Arc::new(fx.backend().await);

        let (a, b) = tokio::join!(
            {
                let backend = Arc::clone(&backend);
                let req = fx.stage_req("v1", "stage/shared");
                async move { backend.stage_volume(req).await }
            },
            {
                let backend = Arc::clone(&backend);
                let req = fx.stage_req("v2", "stage/shared");
                async move { backend.stage_volume(req).await }
            },
        );

        assert_eq!(
            [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(),
            1,
            "exactly one stage must win: {a:?} / {b:?}"
        );
        let loser = a.err().or(b.err()).unwrap();
        assert!(matches!(loser, CsiError::Conflict(_)));
        assert_eq!(backend.state.lock().await.store.len(), 1);
    }

    #[tokio::test]
    async fn stage_hook_failure_persists_nothing() {
        let fx = Fixture::new();
        let backend = fx.backend().await;
        fx.hooks.fail(ON);

        let err = backend
            .stage_volume(fx.stage_req("v1", "stage/v1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);
        {
            let state = backend.state.lock().await;
            assert!(state.store.is_empty());
            assert!(state.active.is_empty());
        }
        let persisted = StateStore::load_or_init(&fx.config.state_file).await.unwrap();
        assert!(persisted.is_empty());

        // Retrying once the hook recovers stages the volume normally.
        fx.hooks.heal(ON);
        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        assert_eq!(fx.hooks.count(ON), 2);
    }

    #[tokio::test]
    async fn stage_applies_mode_flag() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        let mut req = fx.stage_req("v1", "stage/v1");
        req.volume_capability = Some(VolumeCapability {
            access_mode: AccessMode::SingleNodeReaderOnly,
            access_type: AccessType::Mount {
                fs_type: "ext4".into(),
                mount_flags: vec!["mode=0700".into()],
            },
        });
        backend.stage_volume(req).await.unwrap();

        let mode = std::fs::metadata(fx.path("stage/v1"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o700);
    }

    #[tokio::test]
    async fn stage_rejects_invalid_requests_before_touching_state() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        let no_id = fx.stage_req("", "stage/v1");
        let mut outside_root = fx.stage_req("v1", "stage/v1");
        outside_root
            .volume_context
            .insert("mountPath".into(), "/etc".into());
        let mut writer = fx.stage_req("v1", "stage/v1");
        writer.volume_capability = Some(VolumeCapability {
            access_mode: AccessMode::MultiNodeMultiWriter,
            ..VolumeCapability::default()
        });
        let mut bad_hook = fx.stage_req("v1", "stage/v1");
        bad_hook
            .volume_context
            .insert("stageHookURL".into(), "h/on".into());

        for req in [no_id, outside_root, writer, bad_hook] {
            let err = backend.stage_volume(req).await.unwrap_err();
            assert_eq!(err.code(), StatusCode::InvalidArgument, "{err}");
        }
        assert!(fx.hooks.calls().is_empty());
        assert!(!fx.path("stage/v1").exists());
    }

    #[tokio::test]
    async fn stage_without_hooks_skips_calls() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        let mut req = fx.stage_req("v1", "stage/v1");
        req.volume_context.remove("stageHookURL");
        req.volume_context.insert("unstageHookURL".into(), String::new());
        backend.stage_volume(req).await.unwrap();
        backend
            .unstage_volume(&"v1".into(), &fx.path_str("stage/v1"))
            .await
            .unwrap();
        assert!(fx.hooks.calls().is_empty());
    }

    #[tokio::test]
    async fn unstage_unknown_volume_is_noop() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        backend
            .unstage_volume(&"ghost".into(), &fx.path_str("stage/ghost"))
            .await
            .unwrap();

        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        // Wrong staging path for a known volume is also a no-op.
        backend
            .unstage_volume(&"v1".into(), &fx.path_str("stage/elsewhere"))
            .await
            .unwrap();
        assert!(fx.path("stage/v1").exists());
        assert_eq!(fx.hooks.count(OFF), 0);
    }

    #[tokio::test]
    async fn unstage_then_restage_is_fresh() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        backend
            .unstage_volume(&"v1".into(), &fx.path_str("stage/v1"))
            .await
            .unwrap();
        backend
            .unstage_volume(&"v1".into(), &fx.path_str("stage/v1"))
            .await
            .unwrap();
        assert_eq!(fx.hooks.count(OFF), 1);

        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        assert_eq!(fx.hooks.count(ON), 2);
        assert!(fx.path("stage/v1").is_dir());
    }

    #[tokio::test]
    async fn unstage_hook_failure_removes_nothing() {
        let fx = Fixture::new();
        let backend = fx.backend().await;
        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        fx.hooks.fail(OFF);

        let err = backend
            .unstage_volume(&"v1".into(), &fx.path_str("stage/v1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Hook { .. }));
        assert!(fx.path("stage/v1").is_dir());
        let persisted = StateStore::load_or_init(&fx.config.state_file).await.unwrap();
        assert!(persisted.get(&"v1".into()).is_some());
        assert_eq!(backend.state.lock().await.active.len(), 1);
    }

    #[tokio::test]
    async fn publish_requires_staged_volume() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        let err = backend
            .publish_volume(fx.publish_req("v1", "stage/v1", "pub/v1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::NotFound);

        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        let err = backend
            .publish_volume(fx.publish_req("v1", "stage/other", "pub/v1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);

        let mut no_staging = fx.publish_req("v1", "stage/v1", "pub/v1");
        no_staging.staging_target_path.clear();
        let err = backend.publish_volume(no_staging).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);

        let mut no_cap = fx.publish_req("v1", "stage/v1", "pub/v1");
        no_cap.volume_capability = None;
        let err = backend.publish_volume(no_cap).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert_eq!(fx.mounter.binds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_is_idempotent_on_correct_binding() {
        let fx = Fixture::new();
        let backend = fx.backend().await;
        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();

        backend
            .publish_volume(fx.publish_req("v1", "stage/v1", "pub/v1"))
            .await
            .unwrap();
        backend
            .publish_volume(fx.publish_req("v1", "stage/v1", "pub/v1"))
            .await
            .unwrap();
        assert_eq!(fx.mounter.binds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_onto_foreign_binding_fails() {
        let fx = Fixture::new();
        let backend = fx.backend().await;
        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        fx.mounter
            .table
            .lock()
            .unwrap()
            .insert(fx.path("pub/v1"), "/somewhere/else".into());

        let err = backend
            .publish_volume(fx.publish_req("v1", "stage/v1", "pub/v1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert_eq!(fx.mounter.binds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_is_idempotent_when_mount_root_is_its_own_mount() {
        let fx = Fixture::new();
        let table = fx.path("mountinfo");
        std::fs::write(
            &table,
            format!(
                "22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw\n\
                 40 22 8:2 /srv/data {root} rw,relatime shared:2 - ext4 /dev/sdb1 rw\n\
                 97 22 8:2 /srv/data/v1 {target} ro,relatime shared:2 - ext4 /dev/sdb1 rw\n",
                root = fx.config.mount_root.display(),
                target = fx.path("pub/v1").display(),
            ),
        )
        .unwrap();
        let store = StateStore::load_or_init(&fx.config.state_file)
            .await
            .unwrap();
        let backend = HostPathBackend::with_parts(
            &fx.config,
            store,
            Arc::clone(&fx.hooks) as Arc<dyn HookInvoker>,
            Arc::new(HostMounter::with_mountinfo(&table)),
        );
        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();

        backend
            .publish_volume(fx.publish_req("v1", "stage/v1", "pub/v1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn relative_paths_are_rejected() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        let mut stage = fx.stage_req("v1", "stage/v1");
        stage.staging_target_path = "stage/v1".into();
        let err = backend.stage_volume(stage).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);

        let err = backend
            .unstage_volume(&"v1".into(), "stage/v1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);

        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        let mut publish = fx.publish_req("v1", "stage/v1", "pub/v1");
        publish.target_path = "pub/v1".into();
        let err = backend.publish_volume(publish).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert_eq!(fx.mounter.binds.load(Ordering::SeqCst), 0);

        let err = backend
            .unpublish_volume(&"v1".into(), "pub/v1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn unpublish_never_published_target() {
        let fx = Fixture::new();
        let backend = fx.backend().await;

        let target = fx.path_str("pub/never");
        backend.unpublish_volume(&"v1".into(), &target).await.unwrap();
        backend.unpublish_volume(&"v1".into(), &target).await.unwrap();

        let err = backend.unpublish_volume(&"v1".into(), "").await.unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn reconcile_reactivates_existing_staging_dirs() {
        let fx = Fixture::new();
        {
            let backend = fx.backend().await;
            backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        }

        let restarted = fx.backend().await;
        assert!(restarted.state.lock().await.active.is_empty());
        assert_eq!(restarted.reconcile().await, 1);
        assert_eq!(fx.hooks.count(ON), 2);
        assert!(
            restarted
                .state
                .lock()
                .await
                .active
                .contains_key(&fx.path("stage/v1"))
        );

        // Publishable immediately, without re-staging.
        restarted
            .publish_volume(fx.publish_req("v1", "stage/v1", "pub/v1"))
            .await
            .unwrap();

        // And unstage fires the deactivation hook again.
        restarted
            .unstage_volume(&"v1".into(), &fx.path_str("stage/v1"))
            .await
            .unwrap();
        assert_eq!(fx.hooks.count(OFF), 1);
    }

    #[tokio::test]
    async fn reconcile_skips_missing_staging_dirs() {
        let fx = Fixture::new();
        {
            let backend = fx.backend().await;
            backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        }
        std::fs::remove_dir_all(fx.path("stage/v1")).unwrap();

        let restarted = fx.backend().await;
        assert_eq!(restarted.reconcile().await, 0);
        assert_eq!(fx.hooks.count(ON), 1);
        {
            let state = restarted.state.lock().await;
            assert!(state.active.is_empty());
            assert!(state.store.get(&"v1".into()).is_some());
        }

        // The orphaned record is still cleaned up by a later unstage, without
        // calling the unstage hook of a volume that never re-activated.
        restarted
            .unstage_volume(&"v1".into(), &fx.path_str("stage/v1"))
            .await
            .unwrap();
        assert_eq!(fx.hooks.count(OFF), 0);
        assert!(restarted.state.lock().await.store.is_empty());
    }

    #[tokio::test]
    async fn reconcile_tolerates_hook_failure() {
        let fx = Fixture::new();
        {
            let backend = fx.backend().await;
            backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();
        }
        fx.hooks.fail(ON);

        let restarted = fx.backend().await;
        assert_eq!(restarted.reconcile().await, 0);
        assert!(restarted.state.lock().await.active.is_empty());
        restarted
            .publish_volume(fx.publish_req("v1", "stage/v1", "pub/v1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drain_calls_unstage_hooks_best_effort() {
        let fx = Fixture::new();
        let backend = fx.backend().await;
        std::fs::create_dir_all(fx.config.mount_root.join("v2")).unwrap();
        backend.stage_volume(fx.stage_req("v1", "stage/v1")).await.unwrap();

        let mut second = fx.stage_req("v2", "stage/v2");
        second.volume_context.insert(
            "mountPath".into(),
            fx.config.mount_root.join("v2").display().to_string(),
        );
        second
            .volume_context
            .insert("unstageHookURL".into(), "http://h/off2".into());
        backend.stage_volume(second).await.unwrap();

        fx.hooks.fail(OFF);
        backend.drain().await;
        assert_eq!(fx.hooks.count(OFF), 1);
        assert_eq!(fx.hooks.count("http://h/off2"), 1);
        assert!(backend.state.lock().await.active.is_empty());

        // Records survive the drain; the next process run re-activates them.
        assert_eq!(backend.state.lock().await.store.len(), 2);

        backend.drain().await;
        assert_eq!(fx.hooks.count(OFF), 1);
    }

    #[tokio::test]
    async fn node_info_and_capabilities() {
        let fx = Fixture::new();
        let backend = fx.backend().await;
        assert_eq!(backend.get_info().await.unwrap().node_id, "test-node");
        assert_eq!(
            backend.get_capabilities().await.unwrap(),
            vec![NodeCapability::StageUnstageVolume]
        );
    }
}
