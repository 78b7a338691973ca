//! Host directory layout for bind-mount sources.
//!
//! Every slot owns `{data_root}/servers/{server}/slots/{slot}`; volume
//! subpaths resolve beneath it and may never escape it.

use std::path::{Component, Path, PathBuf};

use hostmgr_session::{ServerId, SlotId};

use crate::runtime::BindMount;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path must be relative: {0}")]
    Absolute(String),
    #[error("path traversal is not allowed: {0}")]
    Traversal(String),
    #[error("container path must be absolute: {0}")]
    ContainerPath(String),
    #[error("volume name is empty")]
    EmptyName,
    #[error("duplicate volume name: {0}")]
    DuplicateName(String),
}

pub fn normalize_rel_path(rel: &str) -> Result<PathBuf, PathError> {
    let rel = rel.trim();
    if rel.is_empty() {
        return Ok(PathBuf::new());
    }

    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(PathError::Absolute(rel.to_string()));
    }

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => return Err(PathError::Traversal(rel.to_string())),
            Component::Prefix(_) | Component::RootDir => {
                return Err(PathError::Absolute(rel.to_string()));
            }
        }
    }

    Ok(out)
}

pub fn slot_root(data_root: &Path, server: ServerId, slot: SlotId) -> PathBuf {
    data_root
        .join("servers")
        .join(server.to_string())
        .join("slots")
        .join(slot.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    pub name: String,
    pub container_path: String,
    /// Relative to the slot root. Empty means "use the volume name".
    pub host_subpath: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVolume {
    pub name: String,
    pub container_path: String,
    pub host_path: PathBuf,
}

impl ResolvedVolume {
    pub fn bind(&self) -> BindMount {
        BindMount {
            host_path: self.host_path.to_string_lossy().into_owned(),
            container_path: self.container_path.clone(),
        }
    }
}

pub fn resolve(
    data_root: &Path,
    server: ServerId,
    slot: SlotId,
    requests: &[VolumeRequest],
) -> Result<Vec<ResolvedVolume>, PathError> {
    let root = slot_root(data_root, server, slot);
    let mut out: Vec<ResolvedVolume> = Vec::with_capacity(requests.len());
    for req in requests {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(PathError::EmptyName);
        }
        if out.iter().any(|v| v.name == name) {
            return Err(PathError::DuplicateName(name.to_string()));
        }
        let container_path = req.container_path.trim();
        if !container_path.starts_with('/') {
            return Err(PathError::ContainerPath(container_path.to_string()));
        }

        let mut rel = normalize_rel_path(&req.host_subpath)?;
        if rel.as_os_str().is_empty() {
            rel = normalize_rel_path(name)?;
        }
        if rel.as_os_str().is_empty() {
            return Err(PathError::EmptyName);
        }

        out.push(ResolvedVolume {
            name: name.to_string(),
            container_path: container_path.to_string(),
            host_path: root.join(rel),
        });
    }
    Ok(out)
}

/// Bind-mount sources must exist before the container is created.
pub async fn ensure_dirs(volumes: &[ResolvedVolume]) -> std::io::Result<()> {
    for v in volumes {
        tokio::fs::create_dir_all(&v.host_path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&v.host_path).await?.permissions();
            if perms.mode() & 0o777 != 0o755 {
                perms.set_mode(0o755);
                tokio::fs::set_permissions(&v.host_path, perms).await?;
            }
        }
    }
    Ok(())
}
