//! Image reference parsing and bookkeeping.
//!
//! A reference names where an image came from and how the cluster keeps
//! addressing it: a URI domain (docker registry, library server, or a local
//! file) plus de-duplicated sets of tags and digests. The sets are mutable
//! for the lifetime of the image because a later pull of the same content
//! may claim tags away from, or add digests to, an existing record.

use std::fmt;
use std::sync::Mutex;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where an image is fetched from. The set is closed: pull dispatch is a
/// match, not an open trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageUri {
    /// A docker registry; references are kept without the `docker.io/`
    /// prefix and get it back in [`ImageRef::string`].
    Docker,
    /// A library server speaking the `library://` protocol.
    Library,
    /// A file already on this host, path carried verbatim.
    LocalFile,
}

impl ImageUri {
    fn as_str(self) -> &'static str {
        match self {
            ImageUri::Docker => "docker",
            ImageUri::Library => "library",
            ImageUri::LocalFile => "local-file",
        }
    }

    fn parse(uri: &str, strict: bool) -> Result<Self> {
        match uri {
            "docker" => Ok(ImageUri::Docker),
            "library" => Ok(ImageUri::Library),
            "local-file" => Ok(ImageUri::LocalFile),
            other if strict => Err(Error::InvalidConfig(format!("unknown image uri {other:?}"))),
            // Lenient decode tolerates records written by newer versions;
            // docker is the domain that can pull anything by name.
            _ => Ok(ImageUri::Docker),
        }
    }
}

/// Tag and digest sets, guarded together so merges are atomic.
#[derive(Debug, Default)]
struct RefSets {
    tags: Vec<String>,
    digests: Vec<String>,
}

/// A parsed, normalized image reference.
#[derive(Debug)]
pub struct ImageRef {
    uri: ImageUri,
    sets: Mutex<RefSets>,
}

/// Plain record used for the JSON form; the lock never serializes.
#[derive(Debug, Serialize, Deserialize)]
pub struct RefRecord {
    pub uri: String,
    pub tags: Vec<String>,
    pub digests: Vec<String>,
}

lazy_static! {
    /// Digest suffix of a docker reference: `repo@sha256:HEX`.
    static ref DOCKER_DIGEST_RE: Regex = Regex::new(r"^(.+)@sha256:[0-9a-f]{64}$").unwrap();
    /// Digest-style tag of a library reference: `repo:sha256.HEX`.
    static ref LIBRARY_DIGEST_RE: Regex = Regex::new(r"^(.+):sha256\.[0-9a-f]{64}$").unwrap();
}

const LOCAL_FILE_SCHEME: &str = "local.file/";
const LIBRARY_SCHEME: &str = "library://";
const DOCKER_REGISTRY_PREFIX: &str = "docker.io/";
const DOCKER_DEFAULT_REPO_PREFIX: &str = "library/";
const DEFAULT_TAG: &str = ":latest";

impl ImageRef {
    /// Parse a cluster-supplied reference string.
    ///
    /// Recognizes `local.file/<path>`, `library://<repo>`, and docker short
    /// forms (everything else). Normalization appends `:latest` when the
    /// reference carries neither tag nor digest and strips the `docker.io/`
    /// registry prefix, so equal references always land on equal keys.
    pub fn parse(raw: &str) -> Result<ImageRef> {
        if raw.is_empty() {
            return Err(Error::InvalidConfig("empty image reference".into()));
        }

        if let Some(path) = raw.strip_prefix(LOCAL_FILE_SCHEME) {
            // The remainder is a filesystem path, verbatim: no tag grammar.
            return Ok(ImageRef::assemble(ImageUri::LocalFile, vec![path.to_string()], vec![]));
        }

        if let Some(rest) = raw.strip_prefix(LIBRARY_SCHEME) {
            let named = normalized(rest);
            return Ok(if LIBRARY_DIGEST_RE.is_match(&named) {
                ImageRef::assemble(ImageUri::Library, vec![], vec![named])
            } else {
                ImageRef::assemble(ImageUri::Library, vec![named], vec![])
            });
        }

        let mut named = raw.strip_prefix(DOCKER_REGISTRY_PREFIX).unwrap_or(raw);
        named = named.strip_prefix(DOCKER_DEFAULT_REPO_PREFIX).unwrap_or(named);
        let named = normalized(named);
        Ok(if DOCKER_DIGEST_RE.is_match(&named) {
            ImageRef::assemble(ImageUri::Docker, vec![], vec![named])
        } else {
            ImageRef::assemble(ImageUri::Docker, vec![named], vec![])
        })
    }

    fn assemble(uri: ImageUri, tags: Vec<String>, digests: Vec<String>) -> ImageRef {
        ImageRef {
            uri,
            sets: Mutex::new(RefSets { tags, digests }),
        }
    }

    pub fn uri(&self) -> ImageUri {
        self.uri
    }

    /// Snapshot of the tag set.
    pub fn tags(&self) -> Vec<String> {
        self.sets.lock().unwrap().tags.clone()
    }

    /// Snapshot of the digest set.
    pub fn digests(&self) -> Vec<String> {
        self.sets.lock().unwrap().digests.clone()
    }

    /// De-duplicated merge into the tag set.
    pub fn add_tags(&self, tags: Vec<String>) {
        let mut sets = self.sets.lock().unwrap();
        for tag in tags {
            if !sets.tags.contains(&tag) {
                sets.tags.push(tag);
            }
        }
    }

    /// De-duplicated merge into the digest set.
    pub fn add_digests(&self, digests: Vec<String>) {
        let mut sets = self.sets.lock().unwrap();
        for digest in digests {
            if !sets.digests.contains(&digest) {
                sets.digests.push(digest);
            }
        }
    }

    /// Remove the first occurrence of a tag, if present.
    pub fn remove_tag(&self, tag: &str) {
        let mut sets = self.sets.lock().unwrap();
        if let Some(at) = sets.tags.iter().position(|t| t == tag) {
            sets.tags.remove(at);
        }
    }

    /// Remove the first occurrence of a digest, if present.
    pub fn remove_digest(&self, digest: &str) {
        let mut sets = self.sets.lock().unwrap();
        if let Some(at) = sets.digests.iter().position(|d| d == digest) {
            sets.digests.remove(at);
        }
    }

    /// The canonical pullable string: the first tag, or the first digest
    /// when no tag remains, carrying the domain scheme back (`docker.io/`
    /// for docker, `library://` for the library domain).
    pub fn string(&self) -> String {
        let sets = self.sets.lock().unwrap();
        let named = sets
            .tags
            .first()
            .or_else(|| sets.digests.first())
            .cloned()
            .unwrap_or_default();
        match self.uri {
            ImageUri::Docker => format!("{DOCKER_REGISTRY_PREFIX}{named}"),
            ImageUri::Library => format!("{LIBRARY_SCHEME}{named}"),
            ImageUri::LocalFile => named,
        }
    }

    /// Convert to the plain JSON record.
    pub fn to_record(&self) -> RefRecord {
        let sets = self.sets.lock().unwrap();
        RefRecord {
            uri: self.uri.as_str().to_string(),
            tags: sets.tags.clone(),
            digests: sets.digests.clone(),
        }
    }

    /// Rebuild from the plain JSON record. `strict` rejects unknown URIs
    /// instead of defaulting them.
    pub fn from_record(record: RefRecord, strict: bool) -> Result<ImageRef> {
        let uri = ImageUri::parse(&record.uri, strict)?;
        Ok(ImageRef::assemble(uri, record.tags, record.digests))
    }

    /// An exhausted reference holds neither tags nor digests. Permitted for
    /// an image that lost an overlap to a newer pull.
    pub fn is_empty(&self) -> bool {
        let sets = self.sets.lock().unwrap();
        sets.tags.is_empty() && sets.digests.is_empty()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string())
    }
}

impl PartialEq for ImageRef {
    /// Order-insensitive over both sets.
    fn eq(&self, other: &Self) -> bool {
        if self.uri != other.uri {
            return false;
        }
        let (ours, theirs) = (self.sets.lock().unwrap(), other.sets.lock().unwrap());
        same_multiset(&ours.tags, &theirs.tags) && same_multiset(&ours.digests, &theirs.digests)
    }
}

fn same_multiset(a: &[String], b: &[String]) -> bool {
    let (mut a, mut b) = (a.to_vec(), b.to_vec());
    a.sort();
    b.sort();
    a == b
}

/// Append `:latest` when a name carries neither a tag nor a digest suffix.
fn normalized(named: &str) -> String {
    let after_slash = named.rsplit('/').next().unwrap_or(named);
    if after_slash.contains(':') || after_slash.contains('@') {
        named.to_string()
    } else {
        format!("{named}{DEFAULT_TAG}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

    #[test]
    fn docker_short_form_gets_latest() {
        let r = ImageRef::parse("busybox").unwrap();
        assert_eq!(r.uri(), ImageUri::Docker);
        assert_eq!(r.tags(), vec!["busybox:latest"]);
        assert!(r.digests().is_empty());
        assert_eq!(r.string(), "docker.io/busybox:latest");
    }

    #[test]
    fn docker_registry_prefix_is_stripped() {
        let r = ImageRef::parse("docker.io/library/busybox:1.31").unwrap();
        assert_eq!(r.tags(), vec!["busybox:1.31"]);
        assert_eq!(r.string(), "docker.io/busybox:1.31");
    }

    #[test]
    fn docker_digest_suffix_is_classified() {
        let raw = format!("docker.io/busybox@sha256:{HEX}");
        let r = ImageRef::parse(&raw).unwrap();
        assert!(r.tags().is_empty());
        assert_eq!(r.digests(), vec![format!("busybox@sha256:{HEX}")]);
    }

    #[test]
    fn library_digest_tag_is_classified() {
        let raw = format!("library://user/collection/image:sha256.{HEX}");
        let r = ImageRef::parse(&raw).unwrap();
        assert_eq!(r.uri(), ImageUri::Library);
        assert!(r.tags().is_empty());
        assert_eq!(r.digests(), vec![format!("user/collection/image:sha256.{HEX}")]);
    }

    #[test]
    fn local_file_path_is_verbatim() {
        let r = ImageRef::parse("local.file//var/images/app.sif").unwrap();
        assert_eq!(r.uri(), ImageUri::LocalFile);
        assert_eq!(r.string(), "/var/images/app.sif");
    }

    #[test]
    fn parse_is_idempotent_through_string() {
        for raw in [
            "busybox",
            "docker.io/library/busybox:1.31",
            "library://user/collection/image",
            "local.file//var/images/app.sif",
        ] {
            let first = ImageRef::parse(raw).unwrap();
            let second = ImageRef::parse(&first.string()).unwrap();
            assert_eq!(first, second, "re-parsing {raw:?} drifted");
        }
    }

    #[test]
    fn tag_sets_deduplicate_and_remove_first_occurrence() {
        let r = ImageRef::parse("busybox:1.31").unwrap();
        r.add_tags(vec!["busybox:1.31".into(), "busybox:stable".into()]);
        assert_eq!(r.tags(), vec!["busybox:1.31", "busybox:stable"]);

        r.remove_tag("busybox:1.31");
        assert_eq!(r.tags(), vec!["busybox:stable"]);
        r.remove_tag("busybox:missing");
        assert_eq!(r.tags(), vec!["busybox:stable"]);
    }

    #[test]
    fn record_round_trip_and_strict_uri() {
        let r = ImageRef::parse("busybox").unwrap();
        let record = r.to_record();
        assert_eq!(record.uri, "docker");
        let back = ImageRef::from_record(record, true).unwrap();
        assert_eq!(r, back);

        let bogus = RefRecord {
            uri: "shub".into(),
            tags: vec!["x:latest".into()],
            digests: vec![],
        };
        assert!(ImageRef::from_record(bogus, true).is_err());
    }

    #[test]
    fn equality_ignores_order() {
        let a = ImageRef::parse("busybox:1.31").unwrap();
        a.add_tags(vec!["busybox:stable".into()]);
        let b = ImageRef::parse("busybox:stable").unwrap();
        b.add_tags(vec!["busybox:1.31".into()]);
        assert_eq!(a, b);
    }
}
