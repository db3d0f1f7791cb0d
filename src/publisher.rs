// src/publisher.rs

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeZone};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Display;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;
use url::Url;

use crate::error::PipelineError;
use crate::training::artifact::{self, METADATA_FILE};
use crate::training::checkpoint::CHECKPOINTS_DIR;

/// Bytes of each file sent to the pre-upload negotiation.
const SAMPLE_BYTES: usize = 512;
/// Files above this size go through LFS when the hub does not say otherwise.
const LFS_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;
const LFS_CONTENT_TYPE: &str = "application/vnd.git-lfs+json";

/// Human-readable commit message carrying the upload time.
pub fn commit_message<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    format!("Fine-tuned model - {}", now.format("%Y-%m-%d %H:%M"))
}

/// Checks the `namespace/name` form registries expect.
pub fn validate_repo_id(repo_id: &str) -> Result<(), PipelineError> {
    let mut parts = repo_id.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => Ok(()),
        _ => Err(PipelineError::Config(format!(
            "repository id must look like 'owner/name', got '{}'",
            repo_id
        ))),
    }
}

/// One file of the artifact as it will appear in the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactFile {
    pub path_in_repo: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Lists the files that make up the deployable artifact.
///
/// Checkpoint directories and hidden entries (staging directories, dotfiles)
/// are not part of the unit. Paths are sorted for a stable commit layout.
pub fn collect_artifact_files(dir: &Path) -> Result<Vec<ArtifactFile>> {
    let mut files = Vec::new();
    collect_into(dir, dir, &mut files)?;
    files.sort_by(|a, b| a.path_in_repo.cmp(&b.path_in_repo));
    Ok(files)
}

fn collect_into(root: &Path, dir: &Path, files: &mut Vec<ArtifactFile>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            if dir == root && name == CHECKPOINTS_DIR {
                continue;
            }
            collect_into(root, &path, files)?;
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
        let path_in_repo = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let mut file = File::open(&path)?;
        let mut hasher = Sha256::new();
        let size = std::io::copy(&mut file, &mut hasher)
            .with_context(|| format!("Failed to hash {}", path.display()))?;
        files.push(ArtifactFile {
            path_in_repo,
            local_path: path,
            size,
            sha256: format!("{:x}", hasher.finalize()),
        });
    }
    Ok(())
}

/// Result of a registry commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub commit_url: Option<String>,
    pub files: usize,
}

/// A versioned store that accepts a whole directory as one commit.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn upload_folder(
        &self,
        folder: &Path,
        repo_id: &str,
        commit_message: &str,
    ) -> Result<CommitInfo>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadMode {
    Regular,
    Lfs,
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreuploadFile {
    path: String,
    upload_mode: String,
}

#[derive(Debug, Deserialize)]
struct PreuploadResponse {
    files: Vec<PreuploadFile>,
}

#[derive(Debug, Deserialize)]
struct LfsAction {
    href: String,
    #[serde(default)]
    header: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct LfsActions {
    upload: Option<LfsAction>,
    verify: Option<LfsAction>,
}

#[derive(Debug, Deserialize)]
struct LfsError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct LfsObject {
    oid: String,
    actions: Option<LfsActions>,
    error: Option<LfsError>,
}

#[derive(Debug, Deserialize)]
struct LfsBatchResponse {
    objects: Vec<LfsObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponse {
    commit_url: Option<String>,
}

/// Hugging Face Hub client using the commit API with Git LFS for large files.
pub struct HfHubRegistry {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HfHubRegistry {
    pub fn new(endpoint: &str, token: String) -> Result<Self> {
        let parsed = Url::parse(endpoint)
            .with_context(|| format!("Invalid registry endpoint '{}'", endpoint))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("feedback_finetune/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: parsed.as_str().trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn whoami(&self) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/api/whoami-v2", self.endpoint))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("Authentication request failed")?;
        if !response.status().is_success() {
            bail!("Authentication rejected: HTTP {}", response.status());
        }
        let who: WhoAmI = response.json().await.context("Malformed whoami response")?;
        Ok(who.name)
    }

    async fn create_repo(&self, repo_id: &str) -> Result<()> {
        let (organization, name) = repo_id
            .split_once('/')
            .ok_or_else(|| anyhow!("Invalid repository id '{}'", repo_id))?;
        let response = self
            .client
            .post(format!("{}/api/repos/create", self.endpoint))
            .bearer_auth(&self.token)
            .json(&json!({
                "name": name,
                "organization": organization,
                "type": "model",
                "private": false,
            }))
            .send()
            .await
            .context("Create repository request failed")?;

        let status = response.status();
        if status.is_success() {
            info!("Created repository {}", repo_id);
            Ok(())
        } else if status.as_u16() == 409 {
            debug!("Repository {} already exists", repo_id);
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            bail!("Failed to create repository {}: HTTP {}: {}", repo_id, status, body)
        }
    }

    async fn preupload(
        &self,
        repo_id: &str,
        files: &[ArtifactFile],
    ) -> Result<HashMap<String, UploadMode>> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let sample = read_sample(&file.local_path)?;
            entries.push(json!({
                "path": file.path_in_repo,
                "size": file.size,
                "sample": BASE64.encode(sample),
            }));
        }

        let response = self
            .client
            .post(format!("{}/api/models/{}/preupload/main", self.endpoint, repo_id))
            .bearer_auth(&self.token)
            .json(&json!({ "files": entries }))
            .send()
            .await
            .context("Pre-upload request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Pre-upload rejected: HTTP {}: {}", status, body);
        }
        let parsed: PreuploadResponse = response
            .json()
            .await
            .context("Malformed pre-upload response")?;

        let mut modes: HashMap<String, UploadMode> = files
            .iter()
            .map(|f| (f.path_in_repo.clone(), default_mode(f.size)))
            .collect();
        for file in parsed.files {
            let mode = if file.upload_mode == "lfs" {
                UploadMode::Lfs
            } else {
                UploadMode::Regular
            };
            modes.insert(file.path, mode);
        }
        Ok(modes)
    }

    async fn upload_lfs(&self, repo_id: &str, files: &[&ArtifactFile]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let objects: Vec<_> = files
            .iter()
            .map(|f| json!({ "oid": f.sha256, "size": f.size }))
            .collect();
        let response = self
            .client
            .post(format!("{}/{}.git/info/lfs/objects/batch", self.endpoint, repo_id))
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, LFS_CONTENT_TYPE)
            .header(reqwest::header::CONTENT_TYPE, LFS_CONTENT_TYPE)
            .body(
                json!({
                    "operation": "upload",
                    "transfers": ["basic"],
                    "objects": objects,
                    "hash_algo": "sha256",
                })
                .to_string(),
            )
            .send()
            .await
            .context("LFS batch request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LFS batch rejected: HTTP {}: {}", status, body);
        }
        let batch: LfsBatchResponse = response
            .json()
            .await
            .context("Malformed LFS batch response")?;

        for object in batch.objects {
            if let Some(error) = object.error {
                bail!("LFS object {} refused ({}): {}", object.oid, error.code, error.message);
            }
            let file = files
                .iter()
                .find(|f| f.sha256 == object.oid)
                .ok_or_else(|| anyhow!("LFS batch returned unknown object {}", object.oid))?;
            let Some(actions) = object.actions else {
                debug!("{} already stored on the hub", file.path_in_repo);
                continue;
            };

            if let Some(upload) = actions.upload {
                let start = Instant::now();
                let bytes = tokio::fs::read(&file.local_path)
                    .await
                    .with_context(|| format!("Failed to read {}", file.local_path.display()))?;
                let mut request = self.client.put(&upload.href).body(bytes);
                for (key, value) in &upload.header {
                    request = request.header(key.as_str(), value.as_str());
                }
                let response = request
                    .send()
                    .await
                    .with_context(|| format!("Upload of {} failed", file.path_in_repo))?;
                if !response.status().is_success() {
                    bail!("Upload of {} rejected: HTTP {}", file.path_in_repo, response.status());
                }
                info!(
                    "Uploaded {} ({} bytes) in {:.2?}",
                    file.path_in_repo,
                    file.size,
                    start.elapsed()
                );
            }

            if let Some(verify) = actions.verify {
                let mut request = self
                    .client
                    .post(&verify.href)
                    .bearer_auth(&self.token)
                    .json(&json!({ "oid": file.sha256, "size": file.size }));
                for (key, value) in &verify.header {
                    request = request.header(key.as_str(), value.as_str());
                }
                let response = request
                    .send()
                    .await
                    .with_context(|| format!("Verification of {} failed", file.path_in_repo))?;
                if !response.status().is_success() {
                    bail!(
                        "Verification of {} rejected: HTTP {}",
                        file.path_in_repo,
                        response.status()
                    );
                }
            }
        }
        Ok(())
    }

    async fn commit(
        &self,
        repo_id: &str,
        message: &str,
        files: &[ArtifactFile],
        modes: &HashMap<String, UploadMode>,
    ) -> Result<CommitInfo> {
        let mut lines = Vec::with_capacity(files.len() + 1);
        lines.push(
            json!({
                "key": "header",
                "value": { "summary": message, "description": "" },
            })
            .to_string(),
        );
        for file in files {
            let line = match modes.get(&file.path_in_repo) {
                Some(UploadMode::Lfs) => json!({
                    "key": "lfsFile",
                    "value": {
                        "path": file.path_in_repo,
                        "algo": "sha256",
                        "oid": file.sha256,
                        "size": file.size,
                    },
                }),
                _ => {
                    let content = fs::read(&file.local_path)
                        .with_context(|| format!("Failed to read {}", file.local_path.display()))?;
                    json!({
                        "key": "file",
                        "value": {
                            "path": file.path_in_repo,
                            "content": BASE64.encode(content),
                            "encoding": "base64",
                        },
                    })
                }
            };
            lines.push(line.to_string());
        }

        let response = self
            .client
            .post(format!("{}/api/models/{}/commit/main", self.endpoint, repo_id))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(lines.join("\n"))
            .send()
            .await
            .context("Commit request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Commit rejected: HTTP {}: {}", status, body);
        }
        let parsed: CommitResponse = response.json().await.context("Malformed commit response")?;
        Ok(CommitInfo {
            commit_url: parsed.commit_url,
            files: files.len(),
        })
    }
}

#[async_trait]
impl ModelRegistry for HfHubRegistry {
    async fn upload_folder(
        &self,
        folder: &Path,
        repo_id: &str,
        commit_message: &str,
    ) -> Result<CommitInfo> {
        let user = self.whoami().await?;
        info!("Authenticated to the model registry as {}", user);

        self.create_repo(repo_id).await?;

        let files = collect_artifact_files(folder)?;
        if files.is_empty() {
            bail!("{} has no files to upload", folder.display());
        }
        let modes = self.preupload(repo_id, &files).await?;
        let lfs_files: Vec<&ArtifactFile> = files
            .iter()
            .filter(|f| modes.get(&f.path_in_repo) == Some(&UploadMode::Lfs))
            .collect();
        debug!("{} of {} files go through LFS", lfs_files.len(), files.len());
        self.upload_lfs(repo_id, &lfs_files).await?;

        self.commit(repo_id, commit_message, &files, &modes).await
    }
}

fn default_mode(size: u64) -> UploadMode {
    if size > LFS_THRESHOLD_BYTES {
        UploadMode::Lfs
    } else {
        UploadMode::Regular
    }
}

fn read_sample(path: &Path) -> Result<Vec<u8>> {
    use std::io::Read;
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut sample = Vec::with_capacity(SAMPLE_BYTES);
    file.by_ref()
        .take(SAMPLE_BYTES as u64)
        .read_to_end(&mut sample)?;
    Ok(sample)
}

/// What the publish stage did.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// No registry credential configured.
    Skipped,
    Published {
        repo_id: String,
        commit_message: String,
        commit_url: Option<String>,
        files: usize,
    },
}

/// Uploads a completed artifact directory, or skips when unauthenticated.
pub struct ArtifactPublisher<R: ModelRegistry> {
    registry: Option<R>,
    repo_id: String,
}

impl<R: ModelRegistry> ArtifactPublisher<R> {
    pub fn new(registry: Option<R>, repo_id: impl Into<String>) -> Self {
        Self {
            registry,
            repo_id: repo_id.into(),
        }
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    /// # Arguments
    /// * `artifact_dir` - Promoted artifact directory (must hold `metadata.json`)
    /// * `message` - Commit message for the new version
    ///
    /// # Returns
    /// * `Result<PublishOutcome, PipelineError>` - `Skipped` without a registry
    pub async fn publish(
        &self,
        artifact_dir: &Path,
        message: &str,
    ) -> Result<PublishOutcome, PipelineError> {
        let Some(registry) = &self.registry else {
            warn!("No registry token configured, skipping upload");
            return Ok(PublishOutcome::Skipped);
        };
        if !artifact::is_complete(artifact_dir) {
            return Err(PipelineError::Publish {
                repo_id: self.repo_id.clone(),
                source: anyhow!(
                    "{} has no {}, refusing to publish an incomplete artifact",
                    artifact_dir.display(),
                    METADATA_FILE
                ),
            });
        }

        info!("Uploading {} to {}", artifact_dir.display(), self.repo_id);
        let start = Instant::now();
        let commit = registry
            .upload_folder(artifact_dir, &self.repo_id, message)
            .await
            .map_err(|source| PipelineError::Publish {
                repo_id: self.repo_id.clone(),
                source,
            })?;
        info!(
            "Published {} files to {} in {:.2?}",
            commit.files,
            self.repo_id,
            start.elapsed()
        );

        Ok(PublishOutcome::Published {
            repo_id: self.repo_id.clone(),
            commit_message: message.to_string(),
            commit_url: commit.commit_url,
            files: commit.files,
        })
    }
}
