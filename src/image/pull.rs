//! Fetch backends for image pulls.
//!
//! The store decides *where* a pulled artifact lands; this module only knows
//! how to materialize the bytes for each reference domain. The set of
//! domains is closed, so dispatch is a match over [`ImageUri`] rather than
//! an open trait object.
//!
//! Docker references go through the external builder, which converts the
//! registry image into a SIF with the OCI config embedded. Library
//! references download the image file over HTTP. Local files are copied in.

use std::path::Path;
use std::process::Stdio;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::cri::AuthConfig;
use crate::error::{Error, Result};
use crate::image::reference::{ImageRef, ImageUri};

/// Library server spoken to when a `library://` reference is pulled.
const DEFAULT_LIBRARY_BASE_URL: &str = "https://library.sylabs.io";

/// Environment variables the builder reads registry credentials from.
const BUILDER_USERNAME_ENV: &str = "SINGULARITY_DOCKER_USERNAME";
const BUILDER_PASSWORD_ENV: &str = "SINGULARITY_DOCKER_PASSWORD";

/// Materialize the referenced image at `dest`.
///
/// `dest` is the store's hidden temp file; on error the caller removes it,
/// so backends are free to leave partial bytes behind.
pub async fn fetch(
    runtime_binary: &Path,
    reference: &ImageRef,
    auth: Option<&AuthConfig>,
    dest: &Path,
) -> Result<()> {
    match reference.uri() {
        ImageUri::Docker => build_from_registry(runtime_binary, reference, auth, dest).await,
        ImageUri::Library => download_from_library(reference, auth, dest).await,
        ImageUri::LocalFile => copy_local(reference, dest).await,
    }
}

/// Run the external builder to produce a SIF from a docker registry image.
async fn build_from_registry(
    runtime_binary: &Path,
    reference: &ImageRef,
    auth: Option<&AuthConfig>,
    dest: &Path,
) -> Result<()> {
    let mut command = Command::new(runtime_binary);
    command
        .arg("build")
        .arg("-F")
        .arg(dest)
        .arg(format!("docker://{}", reference.string()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(auth) = auth {
        command
            .env(BUILDER_USERNAME_ENV, &auth.username)
            .env(BUILDER_PASSWORD_ENV, &auth.password);
    }

    let output = command
        .output()
        .await
        .map_err(|e| Error::transient(format!("spawning builder: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::transient(format!(
            "builder failed for {}: {}",
            reference.string(),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Stream the image file from the library server.
async fn download_from_library(
    reference: &ImageRef,
    auth: Option<&AuthConfig>,
    dest: &Path,
) -> Result<()> {
    let named = reference
        .string()
        .strip_prefix("library://")
        .map(str::to_string)
        .unwrap_or_else(|| reference.string());
    let url = format!("{DEFAULT_LIBRARY_BASE_URL}/v1/imagefile/{named}");

    let client = reqwest::Client::new();
    let mut request = client.get(&url);
    if let Some(auth) = auth {
        request = request.basic_auth(&auth.username, Some(&auth.password));
    }
    let response = request
        .send()
        .await
        .map_err(|e| Error::transient(format!("library request: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::transient(format!(
            "library returned {} for {named}",
            response.status()
        )));
    }

    let mut file = fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    use futures::StreamExt;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::transient(format!("library download: {e}")))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Copy a host-local image file into the store's temp location.
async fn copy_local(reference: &ImageRef, dest: &Path) -> Result<()> {
    let source = reference.string();
    if source.is_empty() {
        return Err(Error::InvalidConfig("empty local file path".into()));
    }
    match fs::copy(&source, dest).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::not_found(format!("local image file {source}")))
        }
        Err(e) => Err(e.into()),
    }
}
