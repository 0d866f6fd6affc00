//! Image metadata: the in-memory image record and its durable JSON form.
//!
//! An image is content-addressed: its id is the sha256 of the artifact on
//! disk and its path is derived from that id, so neither ever changes.
//! What does change over an image's lifetime is its reference (tags and
//! digests migrate between records on re-pulls) and the set of containers
//! pinning it against deletion.

pub mod pull;
pub mod reference;
pub mod sif;
pub mod store;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use reference::{ImageRef, RefRecord};

/// The OCI image config embedded in a docker-origin SIF. Field names follow
/// the OCI image-spec `config` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, rename = "Env")]
    pub env: Vec<String>,
    #[serde(default, rename = "Entrypoint")]
    pub entrypoint: Vec<String>,
    #[serde(default, rename = "Cmd")]
    pub cmd: Vec<String>,
    #[serde(default, rename = "WorkingDir")]
    pub working_dir: String,
    #[serde(default, rename = "User")]
    pub user: String,
}

/// One stored image.
#[derive(Debug)]
pub struct ImageInfo {
    /// Hex sha256 of the artifact; equal to the file name under the store.
    id: String,
    /// Artifact size in bytes.
    size: u64,
    /// Absolute path on the store volume; immutable for the record's life.
    path: PathBuf,
    /// How the cluster addresses this image. Interior-mutable: re-pulls
    /// merge and migrate tags while the record stays in the index.
    reference: ImageRef,
    /// Embedded OCI config, present iff the image is a docker-origin SIF.
    oci_config: Option<ImageConfig>,
    /// Container ids currently pinning this image against removal.
    holders: Mutex<BTreeSet<String>>,
}

/// Durable form of [`ImageInfo`], one JSON object per registry line.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub sha256: String,
    pub size: u64,
    pub path: PathBuf,
    #[serde(rename = "ref")]
    pub reference: RefRecord,
    #[serde(rename = "ociConfig", skip_serializing_if = "Option::is_none")]
    pub oci_config: Option<ImageConfig>,
}

impl ImageInfo {
    pub fn new(
        id: String,
        size: u64,
        path: PathBuf,
        reference: ImageRef,
        oci_config: Option<ImageConfig>,
    ) -> Self {
        ImageInfo {
            id,
            size,
            path,
            reference,
            oci_config,
            holders: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn reference(&self) -> &ImageRef {
        &self.reference
    }

    pub fn oci_config(&self) -> Option<&ImageConfig> {
        self.oci_config.as_ref()
    }

    /// Record a container as a holder. Idempotent in the container id.
    pub fn pin(&self, container_id: &str) {
        self.holders.lock().unwrap().insert(container_id.to_string());
    }

    /// Drop a container from the holder set. Idempotent in the container id.
    pub fn unpin(&self, container_id: &str) {
        self.holders.lock().unwrap().remove(container_id);
    }

    /// True while any container pins this image.
    pub fn is_pinned(&self) -> bool {
        !self.holders.lock().unwrap().is_empty()
    }

    /// Snapshot of the pinning container ids.
    pub fn holders(&self) -> Vec<String> {
        self.holders.lock().unwrap().iter().cloned().collect()
    }

    pub fn to_record(&self) -> ImageRecord {
        ImageRecord {
            id: self.id.clone(),
            sha256: self.id.clone(),
            size: self.size,
            path: self.path.clone(),
            reference: self.reference.to_record(),
            oci_config: self.oci_config.clone(),
        }
    }

    /// Rebuild from a durable record; holder sets never persist, they are
    /// reconstructed from the live container set.
    pub fn from_record(record: ImageRecord, strict: bool) -> Result<Self> {
        Ok(ImageInfo::new(
            record.id,
            record.size,
            record.path,
            ImageRef::from_record(record.reference, strict)?,
            record.oci_config,
        ))
    }
}
