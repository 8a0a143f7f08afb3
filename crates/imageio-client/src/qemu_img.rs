//! qemu-img subprocess wrapper.

use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;

use imageio_proto::{Error, ImageResult};

/// Subset of `qemu-img info --output json` we care about.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    pub format: String,
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
}

/// Probe a local image for format and virtual size.
pub async fn info(path: &Path) -> ImageResult<ImageInfo> {
    let output = Command::new("qemu-img")
        .args(["info", "--output", "json"])
        .arg(path)
        .output()
        .await
        .map_err(|e| Error::Internal(format!("cannot run qemu-img: {e}")))?;

    if !output.status.success() {
        return Err(Error::Internal(format!(
            "qemu-img info failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| Error::Internal(format!("cannot parse qemu-img info: {e}")))
}

/// Create a local image of the given format and virtual size.
pub async fn create(path: &Path, format: &str, size: u64) -> ImageResult<()> {
    let output = Command::new("qemu-img")
        .args(["create", "-f", format])
        .arg(path)
        .arg(size.to_string())
        .output()
        .await
        .map_err(|e| Error::Internal(format!("cannot run qemu-img: {e}")))?;

    if !output.status.success() {
        return Err(Error::Internal(format!(
            "qemu-img create failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info() {
        let out = r#"{
            "virtual-size": 1073741824,
            "filename": "disk.qcow2",
            "cluster-size": 65536,
            "format": "qcow2",
            "dirty-flag": false
        }"#;
        let info: ImageInfo = serde_json::from_str(out).unwrap();
        assert_eq!(info.format, "qcow2");
        assert_eq!(info.virtual_size, 1 << 30);
    }
}
