//! File transfer commands.
//!
//! Files go to every connected peer, or to one of them, over dedicated
//! data channels; see
//! `skyway_media::transfer` for the chunk protocol.

use std::path::Path;

use bytes::Bytes;
use skyway_media::PeerConnector;
use skyway_shared::data_message::FileInfo;
use skyway_shared::error::TransferError;
use skyway_shared::types::PeerId;
use tracing::{info, warn};

use crate::bridge::Bridge;

impl<C: PeerConnector> Bridge<C> {
    pub(crate) fn send_file(
        &mut self,
        file: FileInfo,
        data: Bytes,
        target: Option<PeerId>,
    ) -> Result<String, TransferError> {
        if file.size != data.len() as u64 {
            warn!(declared = file.size, actual = data.len(), "File size mismatch, using payload length");
        }
        let file = FileInfo {
            size: data.len() as u64,
            ..file
        };
        let name = file.name.clone();
        let item_id = self.machine.send_file(file, data, target.as_ref())?;
        info!(name = %name, item = %item_id, "File transfer started");
        Ok(item_id)
    }
}

/// Read a file from disk and describe it for [`SkywayClient::send_file`].
///
/// [`SkywayClient::send_file`]: crate::SkywayClient::send_file
pub async fn load_file(path: &Path) -> std::io::Result<(FileInfo, Bytes)> {
    let data = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let item_type = content_type(path).to_string();

    let info = FileInfo {
        name,
        size: data.len() as u64,
        item_type,
    };
    Ok((info, Bytes::from(data)))
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}
