//! Content-addressed image store with durable metadata.
//!
//! Layout:
//! ```text
//! <storage-dir>/<sha256>        one file per image, named by content hash
//! <storage-dir>/registry.json   newline-delimited JSON, the durable index
//! ```
//!
//! The store is the exclusive owner of everything under `<storage-dir>`.
//! All mutations serialize on the store's locks, which is why the registry
//! can be rewritten wholesale on every change instead of journaled: no
//! reader can observe the truncated file mid-write.
//!
//! In-memory state is double-indexed: the truncated-ID index resolves ids
//! and id prefixes, and a reference map resolves every tag and digest to the
//! owning id. Pulls that hash to an existing id merge reference sets; a tag
//! claimed by a newer pull of different content migrates to the new image
//! unconditionally, possibly leaving the loser with no references at all.
//! The loser is not deleted; it may still be pinned.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::cri::{AuthConfig, FilesystemUsage};
use crate::error::{Error, Result};
use crate::image::pull::fetch;
use crate::image::reference::{ImageRef, ImageUri};
use crate::image::{sif, ImageInfo, ImageRecord};
use crate::index::TruncIndex;

/// Name of the durable metadata file under the store root.
const REGISTRY_FILE: &str = "registry.json";

/// Diagnostic the verifier prints when an image simply carries no signature.
const NO_SIGNATURES: &str = "no signatures found";

/// The content-addressed image store.
#[derive(Debug)]
pub struct ImageStore {
    store_dir: PathBuf,
    runtime_binary: PathBuf,

    /// Id and id-prefix lookups; internally synchronized.
    index: TruncIndex<ImageInfo>,

    /// Tag/digest key → owning image id.
    refs: Mutex<HashMap<String, String>>,

    /// Guards the durable file; taken after in-memory mutation settles.
    registry: AsyncMutex<()>,

    /// Per-reference pull gates: at most one fetch per normalized reference
    /// string is in flight, later callers wait and re-probe.
    inflight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ImageStore {
    /// Open the store, creating the directory and replaying the registry.
    pub fn open(store_dir: impl Into<PathBuf>, runtime_binary: impl Into<PathBuf>) -> Result<Self> {
        let store = ImageStore {
            store_dir: store_dir.into(),
            runtime_binary: runtime_binary.into(),
            index: TruncIndex::new(),
            refs: Mutex::new(HashMap::new()),
            registry: AsyncMutex::new(()),
            inflight: Mutex::new(HashMap::new()),
        };
        std::fs::create_dir_all(&store.store_dir)?;
        store.replay_registry()?;
        Ok(store)
    }

    fn registry_path(&self) -> PathBuf {
        self.store_dir.join(REGISTRY_FILE)
    }

    /// Load every newline-delimited record back into the two in-memory maps.
    fn replay_registry(&self) -> Result<()> {
        let file = match std::fs::File::open(self.registry_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ImageRecord = serde_json::from_str(&line)
                .map_err(|e| Error::Corrupt(format!("registry record: {e}")))?;
            let info = ImageInfo::from_record(record, false)?;
            let id = info.id().to_string();
            self.claim_keys(&info);
            self.index
                .add(&id, info)
                .map_err(|_| Error::Corrupt("registry holds duplicate image ids".into()))?;
        }
        Ok(())
    }

    /// Point every tag/digest key of `info` at its id, stripping each key
    /// from any previous owner first.
    fn claim_keys(&self, info: &ImageInfo) {
        let mut refs = self.refs.lock().unwrap();
        for (named, key) in keyed_names(info) {
            if let Some(old_id) = refs.insert(key, info.id().to_string()) {
                if old_id != info.id() {
                    if let Ok(loser) = self.index.get(&old_id) {
                        loser.reference().remove_tag(&named);
                        loser.reference().remove_digest(&named);
                        debug!(image = %old_id, reference = %named, "reference migrated");
                    }
                }
            }
        }
    }

    /// Forget every tag/digest key still owned by `info`.
    fn release_keys(&self, info: &ImageInfo) {
        let mut refs = self.refs.lock().unwrap();
        for (_, key) in keyed_names(info) {
            if refs.get(&key).map(String::as_str) == Some(info.id()) {
                refs.remove(&key);
            }
        }
    }

    /// Rewrite the registry file from the current in-memory set.
    async fn persist(&self) -> Result<()> {
        let mut lines = String::new();
        self.index.iterate(|_, info| {
            // Serialization of our own records never fails.
            lines.push_str(&serde_json::to_string(&info.to_record()).unwrap());
            lines.push('\n');
        });
        let _guard = self.registry.lock().await;
        tokio::fs::write(self.registry_path(), lines).await?;
        Ok(())
    }

    /// Pull an image and return its (possibly pre-existing) record.
    ///
    /// The fetch lands in a hidden temp file that is hashed, then renamed to
    /// its content address; any failure removes the temp and leaves the
    /// store untouched. Concurrent pulls of the same reference string share
    /// one fetch.
    pub async fn pull(
        &self,
        reference: ImageRef,
        auth: Option<&AuthConfig>,
    ) -> Result<Arc<ImageInfo>> {
        let key = reference.string();
        let gate = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight.entry(key.clone()).or_default().clone()
        };
        let _in_flight = gate.lock().await;

        // A waiter that queued behind an identical pull finds the result
        // already indexed and skips the network entirely.
        if let Some(already) = self.lookup_by_reference(&key) {
            debug!(reference = %key, image = already.id(), "pull satisfied by in-flight peer");
            return Ok(already);
        }

        let temp = tempfile::Builder::new()
            .prefix(".")
            .tempfile_in(&self.store_dir)?;
        let temp_path = temp.path().to_path_buf();
        fetch(&self.runtime_binary, &reference, auth, &temp_path).await?;

        let id = sha256_hex_of(&temp_path).await?;
        let size = tokio::fs::metadata(&temp_path).await?.len();
        let oci_config = {
            let probe = temp_path.clone();
            tokio::task::spawn_blocking(move || sif::embedded_image_config(&probe))
                .await
                .map_err(|e| Error::transient(format!("config probe task: {e}")))??
        };

        let image = match self.index.get(&id) {
            // Same content already stored: file untouched, sets unioned.
            Ok(existing) => {
                drop(temp);
                existing.reference().add_tags(reference.tags());
                existing.reference().add_digests(reference.digests());
                existing
            }
            Err(e) if e.is_not_found() => {
                let final_path = self.store_dir.join(&id);
                temp.persist(&final_path).map_err(|e| e.error)?;
                let info = ImageInfo::new(id.clone(), size, final_path, reference, oci_config);
                self.index.add(&id, info)?;
                self.index.get(&id)?
            }
            Err(e) => return Err(e),
        };
        self.claim_keys(&image);
        self.persist().await?;
        Ok(image)
    }

    fn lookup_by_reference(&self, key: &str) -> Option<Arc<ImageInfo>> {
        let id = self.refs.lock().unwrap().get(key)?.clone();
        self.index.get(&id).ok()
    }

    /// Resolve an id, id prefix, or reference string to an image.
    pub fn find(&self, id_or_ref: &str) -> Result<Arc<ImageInfo>> {
        match self.index.get(id_or_ref) {
            Err(e) if e.is_not_found() => {}
            resolved => return resolved,
        }
        let key = ImageRef::parse(id_or_ref)?.string();
        self.lookup_by_reference(&key)
            .ok_or_else(|| Error::not_found(format!("image {id_or_ref}")))
    }

    /// Remove an image file and its record. Fails while containers pin it.
    pub async fn remove(&self, id_or_ref: &str) -> Result<()> {
        let image = self.find(id_or_ref)?;
        if image.is_pinned() {
            return Err(Error::InUse(format!(
                "{} (held by {})",
                image.id(),
                image.holders().join(", ")
            )));
        }
        match tokio::fs::remove_file(image.path()).await {
            Ok(()) => {}
            // The record is authoritative; a missing file is just repaired.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(image = image.id(), "image file already gone")
            }
            Err(e) => return Err(e.into()),
        }
        self.release_keys(&image);
        self.index.delete(image.id())?;
        self.persist().await
    }

    /// Pin an image on behalf of a container. Idempotent in `who`.
    pub fn borrow(&self, id: &str, who: &str) -> Result<()> {
        self.find(id)?.pin(who);
        Ok(())
    }

    /// Release a container's pin. Idempotent in `who`.
    pub fn give_back(&self, id: &str, who: &str) -> Result<()> {
        self.find(id)?.unpin(who);
        Ok(())
    }

    /// Snapshot of every stored image.
    pub fn list(&self) -> Vec<Arc<ImageInfo>> {
        let mut images = Vec::with_capacity(self.index.len());
        self.index.iterate(|_, info| images.push(info.clone()));
        images
    }

    /// Validate the signature chain of a stored SIF image.
    ///
    /// An unsigned image is not an error: the verifier's "no signatures
    /// found" diagnostic downgrades to a warning. Non-SIF artifacts have
    /// nothing to verify.
    pub async fn verify(&self, id_or_ref: &str) -> Result<()> {
        let image = self.find(id_or_ref)?;
        let probe = image.path().clone();
        let is_sif = tokio::task::spawn_blocking(move || sif::is_sif(&probe))
            .await
            .map_err(|e| Error::transient(format!("sif probe task: {e}")))??;
        if !is_sif {
            return Ok(());
        }

        let output = Command::new(&self.runtime_binary)
            .arg("verify")
            .arg(image.path())
            .output()
            .await
            .map_err(|e| Error::transient(format!("spawning verifier: {e}")))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains(NO_SIGNATURES) {
            warn!(image = image.id(), "image carries no signatures");
            return Ok(());
        }
        Err(Error::Corrupt(format!(
            "signature verification of {}: {}",
            image.id(),
            stderr.trim()
        )))
    }

    /// Usage of the store directory and the mount point it lives on.
    pub fn fs_usage(&self) -> Result<FilesystemUsage> {
        let mut used_bytes = 0;
        let mut inodes_used = 0;
        for entry in std::fs::read_dir(&self.store_dir)? {
            let entry = entry?;
            inodes_used += 1;
            used_bytes += entry.metadata()?.len();
        }
        Ok(FilesystemUsage {
            timestamp: crate::now(),
            storage_path: self.store_dir.display().to_string(),
            mount_point: mount_point_of(&self.store_dir)?,
            used_bytes,
            inodes_used,
        })
    }
}

/// Every (bare name, domain-prefixed key) pair an image answers to.
fn keyed_names(info: &ImageInfo) -> Vec<(String, String)> {
    let uri = info.reference().uri();
    info.reference()
        .tags()
        .into_iter()
        .chain(info.reference().digests())
        .map(|named| {
            let key = match uri {
                ImageUri::Docker => format!("docker.io/{named}"),
                ImageUri::Library => format!("library://{named}"),
                ImageUri::LocalFile => named.clone(),
            };
            (named, key)
        })
        .collect()
}

/// Hex sha256 of a file, streamed in fixed-size chunks.
async fn sha256_hex_of(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// The deepest mount point containing `path`, from `/proc/self/mountinfo`.
fn mount_point_of(path: &Path) -> Result<String> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
    let mut best = String::from("/");
    for line in mountinfo.lines() {
        // Field 5 (0-based index 4) is the mount point.
        if let Some(mount_point) = line.split_whitespace().nth(4) {
            if path.starts_with(mount_point) && mount_point.len() > best.len() {
                best = mount_point.to_string();
            }
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageConfig;

    fn local_ref(path: &Path) -> ImageRef {
        ImageRef::parse(&format!("local.file/{}", path.display())).unwrap()
    }

    /// A store over a temp dir plus a source dir for image files.
    fn fixture() -> (tempfile::TempDir, tempfile::TempDir, ImageStore) {
        let store_dir = tempfile::tempdir().unwrap();
        let source_dir = tempfile::tempdir().unwrap();
        let store = ImageStore::open(store_dir.path(), "singularity").unwrap();
        (store_dir, source_dir, store)
    }

    fn write_source(dir: &Path, name: &str, config: Option<&ImageConfig>) -> PathBuf {
        let path = dir.join(name);
        sif::write_test_sif(&path, config).unwrap();
        path
    }

    #[tokio::test]
    async fn pull_list_find_remove_happy_path() {
        let (_store_dir, source_dir, store) = fixture();
        let source = write_source(source_dir.path(), "app.sif", None);

        let image = store.pull(local_ref(&source), None).await.unwrap();
        assert!(!image.id().is_empty());
        assert!(image.size() > 0);
        assert!(image.path().exists());
        assert_eq!(image.path().file_name().unwrap().to_str().unwrap(), image.id());

        // Content addressing: the id is the hash of the stored bytes.
        assert_eq!(sha256_hex_of(image.path()).await.unwrap(), image.id());

        assert_eq!(store.list().len(), 1);
        let by_prefix = store.find(&image.id()[..12]).unwrap();
        assert_eq!(by_prefix.id(), image.id());
        let by_ref = store.find(&format!("local.file/{}", source.display())).unwrap();
        assert_eq!(by_ref.id(), image.id());

        store.remove(image.id()).await.unwrap();
        assert!(store.find(image.id()).unwrap_err().is_not_found());
        assert!(!image.path().exists());
    }

    #[tokio::test]
    async fn registry_tracks_adds_and_removes() {
        let (store_dir, source_dir, store) = fixture();
        let source = write_source(source_dir.path(), "app.sif", None);

        let image = store.pull(local_ref(&source), None).await.unwrap();
        let registry = std::fs::read_to_string(store_dir.path().join(REGISTRY_FILE)).unwrap();
        let records: Vec<ImageRecord> = registry
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, image.id());
        assert_eq!(records[0].sha256, image.id());

        store.remove(image.id()).await.unwrap();
        let registry = std::fs::read_to_string(store_dir.path().join(REGISTRY_FILE)).unwrap();
        assert!(registry.trim().is_empty());
    }

    #[tokio::test]
    async fn reopen_replays_registry() {
        let (store_dir, source_dir, store) = fixture();
        let config = ImageConfig {
            entrypoint: vec!["/bin/sh".into()],
            ..ImageConfig::default()
        };
        let source = write_source(source_dir.path(), "app.sif", Some(&config));
        let image = store.pull(local_ref(&source), None).await.unwrap();
        drop(store);

        let reopened = ImageStore::open(store_dir.path(), "singularity").unwrap();
        let found = reopened.find(image.id()).unwrap();
        assert_eq!(found.size(), image.size());
        assert_eq!(found.oci_config(), Some(&config));
        // Reference lookups survive the replay too.
        assert!(reopened
            .find(&format!("local.file/{}", source.display()))
            .is_ok());
    }

    #[tokio::test]
    async fn corrupt_registry_fails_open() {
        let store_dir = tempfile::tempdir().unwrap();
        std::fs::write(store_dir.path().join(REGISTRY_FILE), "not json\n").unwrap();
        assert!(matches!(
            ImageStore::open(store_dir.path(), "singularity"),
            Err(Error::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn same_content_pull_is_a_merge() {
        let (_store_dir, source_dir, store) = fixture();
        // Two source paths, identical bytes: same content address.
        let first = write_source(source_dir.path(), "a.sif", None);
        let second = source_dir.path().join("b.sif");
        std::fs::copy(&first, &second).unwrap();

        let one = store.pull(local_ref(&first), None).await.unwrap();
        let two = store.pull(local_ref(&second), None).await.unwrap();

        assert_eq!(one.id(), two.id());
        assert_eq!(store.list().len(), 1);
        let mut tags = one.reference().tags();
        tags.sort();
        let mut expected = vec![
            first.display().to_string(),
            second.display().to_string(),
        ];
        expected.sort();
        assert_eq!(tags, expected);
    }

    #[tokio::test]
    async fn changed_content_migrates_the_reference() {
        let (_store_dir, source_dir, store) = fixture();
        let source = write_source(source_dir.path(), "app.sif", None);

        let old = store.pull(local_ref(&source), None).await.unwrap();
        // Same path, different bytes: the reference key now belongs to the
        // new content; the old record survives with an empty reference.
        sif::write_test_sif(
            &source,
            Some(&ImageConfig {
                user: "0:0".into(),
                ..ImageConfig::default()
            }),
        )
        .unwrap();
        let new = store.pull(local_ref(&source), None).await.unwrap();

        assert_ne!(old.id(), new.id());
        assert!(old.reference().is_empty());
        assert_eq!(store.find(&format!("local.file/{}", source.display())).unwrap().id(), new.id());
        assert_eq!(store.list().len(), 2);
    }

    #[tokio::test]
    async fn pinned_image_resists_removal() {
        let (_store_dir, source_dir, store) = fixture();
        let source = write_source(source_dir.path(), "app.sif", None);
        let image = store.pull(local_ref(&source), None).await.unwrap();

        store.borrow(image.id(), "container-1").unwrap();
        store.borrow(image.id(), "container-1").unwrap(); // idempotent
        assert!(matches!(
            store.remove(image.id()).await,
            Err(Error::InUse(_))
        ));

        store.give_back(image.id(), "container-1").unwrap();
        store.give_back(image.id(), "container-1").unwrap(); // idempotent
        store.remove(image.id()).await.unwrap();
    }

    #[tokio::test]
    async fn fs_usage_counts_the_store() {
        let (_store_dir, source_dir, store) = fixture();
        let source = write_source(source_dir.path(), "app.sif", None);
        store.pull(local_ref(&source), None).await.unwrap();

        let usage = store.fs_usage().unwrap();
        // Image file + registry.json.
        assert_eq!(usage.inodes_used, 2);
        assert!(usage.used_bytes > 0);
        assert!(!usage.mount_point.is_empty());
    }
}
