//! Forwarded port file

use crate::Result;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

/// Write `port` in decimal and hand the file to `uid:gid` with mode 0644
pub async fn write(path: &Path, port: u16, uid: u32, gid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    fs::write(path, port.to_string()).await?;

    #[cfg(unix)]
    {
        use nix::unistd::{chown, Gid, Uid};
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await?;
        match chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
            Ok(()) => {}
            Err(nix::errno::Errno::EPERM) => {
                warn!("Not allowed to chown {} to {}:{}", path.display(), uid, gid);
            }
            Err(e) => return Err(e.into()),
        }
    }

    debug!("Wrote forwarded port {} to {}", port, path.display());
    Ok(())
}

/// Remove the file, a missing file is fine
pub async fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("forwarded_port");

        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        write(&path, 51413, uid, gid).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "51413");

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        remove(&path).await.unwrap();
        assert!(!path.exists());
        remove(&path).await.unwrap();
    }
}
