//! File-backed volumes and images managed with `qemu-img`.
//!
//! Works for any storage that exposes a mounted directory, so the same
//! drivers serve both local filesystems and NFS exports.

use std::io::ErrorKind;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::process::run;
use super::{
    DriverError, DriverResult, ImageDriver, ImageInfo, ImageSpec, VolumeDriver, VolumeInfo,
    VolumeSpec,
};

#[derive(Debug, Deserialize)]
struct QemuImgInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
    #[serde(rename = "actual-size", default)]
    actual_size: u64,
}

fn parse_info(output: &str) -> DriverResult<QemuImgInfo> {
    serde_json::from_str(output).map_err(|e| DriverError::Parse(format!("qemu-img info: {e}")))
}

async fn image_info(path: &str) -> DriverResult<QemuImgInfo> {
    let output = run("qemu-img", &["info", "--output=json", "-U", path]).await?;
    parse_info(&output)
}

async fn remove_file(path: &str) -> DriverResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Volume driver for qcow2/raw files on a mounted storage.
#[derive(Debug, Default)]
pub struct QemuVolumes;

impl QemuVolumes {
    async fn info(&self, path: String) -> DriverResult<VolumeInfo> {
        let info = image_info(&path).await?;
        Ok(VolumeInfo {
            size: info.virtual_size,
            used: info.actual_size,
            path,
        })
    }
}

#[async_trait]
impl VolumeDriver for QemuVolumes {
    async fn create(&self, volume: &VolumeSpec) -> DriverResult<VolumeInfo> {
        let path = volume.file_path();
        let size = volume.size.to_string();
        run(
            "qemu-img",
            &["create", "-f", volume.format.as_str(), &path, &size],
        )
        .await?;
        info!(volume_id = %volume.id, path = %path, "Volume file created");
        self.info(path).await
    }

    async fn delete(&self, volume: &VolumeSpec) -> DriverResult<()> {
        let path = volume.file_path();
        remove_file(&path).await?;
        info!(volume_id = %volume.id, path = %path, "Volume file removed");
        Ok(())
    }

    async fn extend(&self, volume: &VolumeSpec, new_size: u64) -> DriverResult<VolumeInfo> {
        let path = volume.file_path();
        let size = new_size.to_string();
        run(
            "qemu-img",
            &["resize", "-f", volume.format.as_str(), &path, &size],
        )
        .await?;
        info!(volume_id = %volume.id, new_size, "Volume file resized");
        self.info(path).await
    }

    async fn query_info(&self, volume: &VolumeSpec) -> DriverResult<VolumeInfo> {
        let path = volume.file_path();
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(DriverError::NotFound(path));
        }
        self.info(path).await
    }
}

/// Image driver that imports a source file with `qemu-img convert`.
#[derive(Debug, Default)]
pub struct QemuImages;

#[async_trait]
impl ImageDriver for QemuImages {
    async fn upload(&self, image: &ImageSpec) -> DriverResult<ImageInfo> {
        let path = image.file_path();
        run(
            "qemu-img",
            &["convert", "-O", image.format.as_str(), &image.source, &path],
        )
        .await?;
        let info = image_info(&path).await?;
        info!(image_id = %image.id, path = %path, "Image imported");
        Ok(ImageInfo {
            size: info.virtual_size,
            path,
        })
    }

    async fn delete(&self, image: &ImageSpec) -> DriverResult<()> {
        remove_file(&image.file_path()).await
    }

    async fn query_info(&self, image: &ImageSpec) -> DriverResult<ImageInfo> {
        let path = image.file_path();
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(DriverError::NotFound(path));
        }
        let info = image_info(&path).await?;
        Ok(ImageInfo {
            size: info.virtual_size,
            path,
        })
    }
}
