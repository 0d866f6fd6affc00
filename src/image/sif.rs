//! Minimal reader for the single-file image format.
//!
//! The store only needs two facts about an image file: whether it is a SIF
//! at all (signature verification applies only to SIFs), and whether the
//! builder embedded an OCI image config in it (docker-origin images carry
//! one; native images do not). Both come from the fixed-layout global
//! header and the descriptor table, so this reader decodes nothing else;
//! partitions, signatures, and everything payload-shaped stay opaque.
//!
//! All integers are little-endian.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result};
use crate::image::ImageConfig;

/// Magic bytes at [`MAGIC_OFFSET`], NUL included.
const MAGIC: &[u8; 10] = b"SIF_MAGIC\0";
/// The magic sits after the 32-byte launch script line.
const MAGIC_OFFSET: u64 = 32;
/// Full global header: launch[32] magic[10] version[3] arch[3] uuid[16]
/// ctime mtime dfree dtotal descroff descrlen dataoff datalen (8 × i64).
const HEADER_LEN: usize = 128;
/// One descriptor: datatype u32, used u32, fileoff i64, filelen i64.
const DESCRIPTOR_LEN: usize = 24;

/// Descriptor datatype of an embedded JSON object. The docker builder
/// writes the image's OCI config as the only object of this type.
const DATA_GENERIC_JSON: u32 = 0x4006;

/// Largest embedded config the reader will load.
const MAX_CONFIG_LEN: i64 = 1024 * 1024;

/// True when the file starts with a SIF global header.
pub fn is_sif(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut prefix = [0u8; MAGIC_OFFSET as usize + MAGIC.len()];
    match file.read_exact(&mut prefix) {
        Ok(()) => Ok(&prefix[MAGIC_OFFSET as usize..] == MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Extract the embedded OCI image config, if the image carries one.
///
/// Returns `Ok(None)` for native SIFs (no JSON descriptor) and for files
/// that are not SIF at all; a descriptor that exists but does not decode is
/// corrupt, not absent.
pub fn embedded_image_config(path: &Path) -> Result<Option<ImageConfig>> {
    let mut file = File::open(path)?;
    let mut header = [0u8; HEADER_LEN];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if &header[MAGIC_OFFSET as usize..MAGIC_OFFSET as usize + MAGIC.len()] != MAGIC {
        return Ok(None);
    }

    // Descriptor table location: dtotal then descroff, see header layout.
    let dtotal = read_i64(&header, 88);
    let descroff = read_i64(&header, 96);
    if dtotal < 0 || descroff < HEADER_LEN as i64 {
        return Err(Error::Corrupt(format!(
            "descriptor table out of bounds in {}",
            path.display()
        )));
    }

    file.seek(SeekFrom::Start(descroff as u64))?;
    for _ in 0..dtotal {
        let mut descriptor = [0u8; DESCRIPTOR_LEN];
        file.read_exact(&mut descriptor)?;
        let datatype = u32::from_le_bytes(descriptor[0..4].try_into().unwrap());
        let used = u32::from_le_bytes(descriptor[4..8].try_into().unwrap());
        if used == 0 || datatype != DATA_GENERIC_JSON {
            continue;
        }
        let fileoff = read_i64(&descriptor, 8);
        let filelen = read_i64(&descriptor, 16);
        if fileoff < 0 || filelen < 0 || filelen > MAX_CONFIG_LEN {
            return Err(Error::Corrupt(format!(
                "JSON descriptor out of bounds in {}",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(fileoff as u64))?;
        let mut blob = vec![0u8; filelen as usize];
        file.read_exact(&mut blob)?;
        let config: ImageConfig = serde_json::from_slice(&blob)
            .map_err(|e| Error::Corrupt(format!("embedded image config: {e}")))?;
        return Ok(Some(config));
    }
    Ok(None)
}

#[inline]
fn read_i64(buffer: &[u8], at: usize) -> i64 {
    i64::from_le_bytes(buffer[at..at + 8].try_into().unwrap())
}

/// Assemble a syntactically valid SIF around an optional embedded config.
/// Test fixture for the store and translator; never used at runtime.
#[cfg(test)]
pub(crate) fn write_test_sif(path: &Path, config: Option<&ImageConfig>) -> Result<()> {
    use std::io::Write;

    let blob = config.map(serde_json::to_vec).transpose()?;
    let descriptor_count: i64 = if blob.is_some() { 1 } else { 0 };
    let descroff = HEADER_LEN as i64;
    let dataoff = descroff + descriptor_count * DESCRIPTOR_LEN as i64;

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&[0u8; MAGIC_OFFSET as usize]); // launch
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(b"01\0"); // version
    header.extend_from_slice(b"02\0"); // arch
    header.extend_from_slice(&[0u8; 16]); // uuid
    for value in [
        0i64, // ctime
        0,    // mtime
        0,    // dfree
        descriptor_count,
        descroff,
        descriptor_count * DESCRIPTOR_LEN as i64,
        dataoff,
        blob.as_ref().map_or(0, |b| b.len() as i64),
    ] {
        header.extend_from_slice(&value.to_le_bytes());
    }
    debug_assert_eq!(header.len(), HEADER_LEN);

    let mut file = File::create(path)?;
    file.write_all(&header)?;
    if let Some(blob) = blob {
        let mut descriptor = Vec::with_capacity(DESCRIPTOR_LEN);
        descriptor.extend_from_slice(&DATA_GENERIC_JSON.to_le_bytes());
        descriptor.extend_from_slice(&1u32.to_le_bytes()); // used
        descriptor.extend_from_slice(&dataoff.to_le_bytes());
        descriptor.extend_from_slice(&(blob.len() as i64).to_le_bytes());
        file.write_all(&descriptor)?;
        file.write_all(&blob)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_sif_files_probe_false() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short");
        std::fs::write(&short, b"ELF").unwrap();
        assert!(!is_sif(&short).unwrap());
        assert!(embedded_image_config(&short).unwrap().is_none());

        let long = dir.path().join("long");
        std::fs::write(&long, vec![0u8; 4096]).unwrap();
        assert!(!is_sif(&long).unwrap());
    }

    #[test]
    fn native_sif_has_no_embedded_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("native.sif");
        write_test_sif(&path, None).unwrap();

        assert!(is_sif(&path).unwrap());
        assert!(embedded_image_config(&path).unwrap().is_none());
    }

    #[test]
    fn docker_built_sif_round_trips_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sif");
        let config = ImageConfig {
            env: vec!["PATH=/usr/bin".into()],
            entrypoint: vec!["/bin/sh".into()],
            cmd: vec!["-c".into(), "echo hi".into()],
            working_dir: "/srv".into(),
            user: "1000:1000".into(),
        };
        write_test_sif(&path, Some(&config)).unwrap();

        assert!(is_sif(&path).unwrap());
        assert_eq!(embedded_image_config(&path).unwrap(), Some(config));
    }

    #[test]
    fn garbage_descriptor_payload_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.sif");
        write_test_sif(
            &path,
            Some(&ImageConfig {
                env: vec![],
                entrypoint: vec![],
                cmd: vec![],
                working_dir: String::new(),
                user: String::new(),
            }),
        )
        .unwrap();
        // Flip a byte inside the JSON payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let at = bytes.len() - 2;
        bytes[at] = b'!';
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            embedded_image_config(&path),
            Err(Error::Corrupt(_))
        ));
    }
}
