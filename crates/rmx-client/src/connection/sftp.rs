//! File upload over the SFTP subsystem

use std::collections::HashSet;
use std::path::PathBuf;

use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;

use rmx_core::ConnectError;

use super::ssh::SshSession;

/// One file to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub local: PathBuf,
    /// Remote path, `/`-separated; relative paths resolve against the login home
    pub remote: String,
}

fn sftp_error(context: &str, e: impl std::fmt::Display) -> ConnectError {
    ConnectError::Channel(format!("sftp {}: {}", context, e))
}

/// Upload files, creating parent directories as needed. Returns bytes written.
pub(super) async fn upload(session: &SshSession, files: &[UploadFile]) -> Result<u64, ConnectError> {
    let channel = session
        .channel_open_session()
        .await
        .map_err(|e| ConnectError::Channel(format!("open session: {}", e)))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| sftp_error("subsystem", e))?;
    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| sftp_error("init", e))?;

    let mut created = HashSet::new();
    let mut total = 0u64;

    for file in files {
        if let Some((parent, _)) = file.remote.rsplit_once('/') {
            ensure_dir(&sftp, parent, &mut created).await?;
        }

        let data = tokio::fs::read(&file.local).await.map_err(|e| {
            ConnectError::Channel(format!("read {}: {}", file.local.display(), e))
        })?;
        let mut remote = sftp
            .create(file.remote.clone())
            .await
            .map_err(|e| sftp_error(&format!("create {}", file.remote), e))?;
        remote
            .write_all(&data)
            .await
            .map_err(|e| sftp_error(&format!("write {}", file.remote), e))?;
        remote
            .shutdown()
            .await
            .map_err(|e| sftp_error(&format!("close {}", file.remote), e))?;

        tracing::debug!("Uploaded {} ({} bytes)", file.remote, data.len());
        total += data.len() as u64;
    }

    let _ = sftp.close().await;
    Ok(total)
}

/// `mkdir -p` over SFTP
async fn ensure_dir(
    sftp: &SftpSession,
    dir: &str,
    created: &mut HashSet<String>,
) -> Result<(), ConnectError> {
    let mut path = String::new();
    if dir.starts_with('/') {
        path.push('/');
    }
    for part in dir.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if !path.is_empty() && !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(part);

        if created.contains(&path) {
            continue;
        }
        let exists = sftp
            .try_exists(path.clone())
            .await
            .map_err(|e| sftp_error(&format!("stat {}", path), e))?;
        if !exists {
            sftp.create_dir(path.clone())
                .await
                .map_err(|e| sftp_error(&format!("mkdir {}", path), e))?;
        }
        created.insert(path.clone());
    }
    Ok(())
}
