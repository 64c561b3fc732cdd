//! Request validation for the Node service.
//!
//! Everything the orchestrator hands us is checked here before the lifecycle
//! lock is taken: the requested capability must describe a read-only mount,
//! and the volume context must name a source directory below the configured
//! mount root plus well-formed hook endpoints.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use url::Url;

use crate::error::CsiError;
use crate::types::{AccessMode, AccessType, VolumeCapability};

/// The only filesystem type accepted in a capability; external provisioners
/// fill it in even though the volume is a plain directory.
pub const SUPPORTED_FS_TYPE: &str = "ext4";

/// Volume context key holding the source directory.
pub const CTX_MOUNT_PATH: &str = "mountPath";
/// Volume context key holding the activation hook.
pub const CTX_STAGE_HOOK_URL: &str = "stageHookURL";
/// Volume context key holding the deactivation hook.
pub const CTX_UNSTAGE_HOOK_URL: &str = "unstageHookURL";

const MODE_FLAG_PREFIX: &str = "mode=";
const MAX_MODE: u32 = 0o7777;

/// What a validated capability asks of the staging directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCapability {
    /// Permission bits to apply after creating the staging directory.
    pub mode: Option<u32>,
}

/// Validate a capability and extract the staging permissions.
///
/// `allow_writer` additionally admits [`AccessMode::SingleNodeWriter`], which
/// CSI sanity suites request even against read-only drivers.
pub fn read_volume_capability(
    capability: Option<&VolumeCapability>,
    allow_writer: bool,
) -> Result<StageCapability, CsiError> {
    let capability =
        capability.ok_or_else(|| CsiError::invalid("VolumeCapability missing in request"))?;

    match capability.access_mode {
        AccessMode::SingleNodeReaderOnly | AccessMode::MultiNodeReaderOnly => {}
        AccessMode::SingleNodeWriter if allow_writer => {}
        other => {
            return Err(CsiError::invalid(format!(
                "unsupported access mode {other:?}"
            )));
        }
    }

    let AccessType::Mount {
        fs_type,
        mount_flags,
    } = &capability.access_type
    else {
        return Err(CsiError::invalid("AccessType must be mount"));
    };

    if !fs_type.is_empty() && fs_type != SUPPORTED_FS_TYPE {
        return Err(CsiError::invalid(format!(
            "unsupported filesystem type {fs_type:?}"
        )));
    }

    let mut stage = StageCapability::default();
    for flag in mount_flags {
        if let Some(raw) = flag.strip_prefix(MODE_FLAG_PREFIX) {
            stage.mode = Some(parse_mode(raw)?);
        }
    }
    Ok(stage)
}

fn parse_mode(raw: &str) -> Result<u32, CsiError> {
    let invalid = || CsiError::invalid(format!("invalid mount flag mode={raw:?}"));
    if raw.is_empty() || !raw.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return Err(invalid());
    }
    let mode = u32::from_str_radix(raw, 8).map_err(|_| invalid())?;
    if mode > MAX_MODE {
        return Err(invalid());
    }
    Ok(mode)
}

/// The parsed and validated volume context of a stage request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeContext {
    /// Source directory, strictly inside the mount root.
    pub mount_path: PathBuf,
    /// Called once the volume becomes active; `None` is a no-op.
    pub stage_hook_url: Option<Url>,
    /// Called once the volume becomes inactive; `None` is a no-op.
    pub unstage_hook_url: Option<Url>,
    /// `${name}` entries with the braces stripped.
    pub variables: BTreeMap<String, String>,
}

impl VolumeContext {
    /// Parse the raw context map of a stage request.
    pub fn parse(raw: &HashMap<String, String>, mount_root: &Path) -> Result<Self, CsiError> {
        let raw_mount_path = raw.get(CTX_MOUNT_PATH).map(String::as_str).unwrap_or("");
        let mount_path = validate_mount_path(raw_mount_path, mount_root).map_err(|reason| {
            CsiError::invalid(format!("mountPath '{raw_mount_path}' invalid: {reason}"))
        })?;

        let stage_hook_url = parse_hook_url(CTX_STAGE_HOOK_URL, raw)?;
        let unstage_hook_url = parse_hook_url(CTX_UNSTAGE_HOOK_URL, raw)?;

        let variables = raw
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("${")
                    .and_then(|k| k.strip_suffix('}'))
                    .map(|name| (name.to_owned(), v.clone()))
            })
            .collect();

        Ok(Self {
            mount_path,
            stage_hook_url,
            unstage_hook_url,
            variables,
        })
    }
}

/// Check that `path` is absolute and lexically contained in `root`.
///
/// Returns the reason as plain text so callers can wrap it with the field
/// name they were validating.
pub fn validate_mount_path(path: &str, root: &Path) -> Result<PathBuf, &'static str> {
    if path.is_empty() {
        return Err("empty: required");
    }
    let path = Path::new(path);
    if !path.is_absolute() {
        return Err("not absolute");
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err("contains '..'");
    }
    match path.strip_prefix(root) {
        Ok(rest) if rest.components().next().is_some() => Ok(path.components().collect()),
        _ => Err("outside of root"),
    }
}

/// Empty or missing means "no hook"; anything else must be an absolute
/// http(s) URL.
fn parse_hook_url(key: &str, raw: &HashMap<String, String>) -> Result<Option<Url>, CsiError> {
    let value = raw.get(key).map(String::as_str).unwrap_or("");
    if value.is_empty() {
        return Ok(None);
    }
    let url = Url::parse(value)
        .map_err(|e| CsiError::invalid(format!("{key} invalid value {value:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || !url.has_host() {
        return Err(CsiError::invalid(format!(
            "{key} invalid value {value:?}: not an absolute http(s) URL"
        )));
    }
    Ok(Some(url))
}
