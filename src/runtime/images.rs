//! Image service operations at the facade boundary.
//!
//! Thin over the store; the one piece of policy added here is idempotency:
//! removing an image that is already gone reports success, matching how the
//! kubelet retries garbage collection.

use std::sync::Arc;

use crate::cri::{AuthConfig, FilesystemUsage};
use crate::error::Result;
use crate::image::reference::ImageRef;
use crate::image::ImageInfo;
use crate::request_log;
use crate::runtime::Runtime;

impl Runtime {
    /// Pull an image and return its id.
    pub async fn pull_image(
        &self,
        image: &str,
        auth: Option<&AuthConfig>,
    ) -> Result<String> {
        let result = self.pull_image_inner(image, auth).await;
        request_log!("PullImage", image, result);
        result
    }

    async fn pull_image_inner(
        &self,
        image: &str,
        auth: Option<&AuthConfig>,
    ) -> Result<String> {
        let reference = ImageRef::parse(image)?;
        let info = self.images.pull(reference, auth).await?;
        Ok(info.id().to_string())
    }

    /// Remove an image by id or reference. Absent images are a no-op; a
    /// pinned image still refuses.
    pub async fn remove_image(&self, image: &str) -> Result<()> {
        let result = self.remove_image_inner(image).await;
        request_log!("RemoveImage", image, result);
        result
    }

    async fn remove_image_inner(&self, image: &str) -> Result<()> {
        match self.images.remove(image).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Status of one image; `None` when it is not stored.
    pub fn image_status(&self, image: &str) -> Result<Option<Arc<ImageInfo>>> {
        let result = match self.images.find(image) {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        };
        request_log!("ImageStatus", image, result.as_ref().map(|found| found.is_some()));
        result
    }

    /// Snapshot of all stored images.
    pub fn list_images(&self) -> Vec<Arc<ImageInfo>> {
        self.images.list()
    }

    /// Validate the signature chain of a stored image.
    pub async fn verify_image(&self, image: &str) -> Result<()> {
        let result = self.images.verify(image).await;
        request_log!("VerifyImage", image, result);
        result
    }

    /// Usage of the filesystem backing the image store.
    pub fn image_fs_info(&self) -> Result<FilesystemUsage> {
        self.images.fs_usage()
    }
}
