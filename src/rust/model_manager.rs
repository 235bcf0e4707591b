use std::env;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::RetryPolicy;
use crate::models::ModelInfo;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model not downloaded: {0}")]
    NotDownloaded(String),
    #[error("Download error: {0}")]
    DownloadError(#[from] reqwest::Error),
    #[error("Download failed with HTTP status {0}")]
    HttpStatus(u16),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Model verification failed")]
    VerificationFailed,
    #[error("Hash mismatch: expected {expected}, got {actual} for {name}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

/// Caches feature extractor files on disk and checks their integrity.
///
/// Each model lives in `<models_dir>/<name>/model.onnx`, with the SHA-256 of the
/// downloaded bytes recorded next to it in `model.sha256`.
#[derive(Clone, Debug)]
pub struct ModelManager {
    models_dir: PathBuf,
    download_lock: Arc<Mutex<()>>,
}

impl ModelManager {
    /// Creates a new ModelManager with the default models directory
    pub fn new_default() -> io::Result<Self> {
        Self::new(Self::get_default_models_dir())
    }

    /// Returns the default models directory path
    pub fn get_default_models_dir() -> PathBuf {
        if let Ok(path) = env::var("IMPRINT_CACHE") {
            return PathBuf::from(path).join("models");
        }
        if let Some(cache_dir) = dirs::cache_dir() {
            return cache_dir.join("imprint").join("models");
        }
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(".cache").join("imprint").join("models");
        }
        env::temp_dir().join("imprint").join("models")
    }

    pub fn new<P: AsRef<Path>>(models_dir: P) -> io::Result<Self> {
        let models_dir = models_dir.as_ref().to_path_buf();
        fs::create_dir_all(&models_dir)?;
        Ok(Self {
            models_dir,
            download_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn get_model_path(&self, info: &ModelInfo) -> PathBuf {
        self.models_dir.join(&info.name).join("model.onnx")
    }

    fn get_digest_path(&self, info: &ModelInfo) -> PathBuf {
        self.models_dir.join(&info.name).join("model.sha256")
    }

    pub fn is_model_downloaded(&self, info: &ModelInfo) -> bool {
        let model_path = self.get_model_path(info);
        log::debug!("Model path: {:?} (exists: {})", model_path, model_path.exists());
        model_path.exists()
    }

    pub async fn download_model(&self, info: &ModelInfo) -> Result<(), ModelError> {
        let _lock = self.download_lock.lock().await;

        let model_path = self.get_model_path(info);
        if model_path.exists() && self.verify_model(info)? {
            log::info!("Existing model file verified successfully");
            return Ok(());
        }

        log::info!("Downloading {} from {}", info.name, info.model_url);
        let response = reqwest::get(&info.model_url).await?;
        log::info!("Download response status: {}", response.status());
        if !response.status().is_success() {
            return Err(ModelError::HttpStatus(response.status().as_u16()));
        }
        let bytes = response.bytes().await?;
        log::info!("Downloaded {} bytes", bytes.len());

        match self.store_verified(info, &bytes) {
            Ok(()) => {
                log::info!("Model {} ready to use", info.name);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to set up model file: {}", e);
                let _ = self.remove_download(info);
                Err(e)
            }
        }
    }

    /// Writes model bytes and their digest, checking a pinned hash if present.
    fn store_verified(&self, info: &ModelInfo, bytes: &[u8]) -> Result<(), ModelError> {
        let hash = sha256_hex(bytes);
        if let Some(expected) = &info.model_hash {
            if &hash != expected {
                log::error!("{} hash mismatch: expected {}, got {}", info.name, expected, hash);
                return Err(ModelError::HashMismatch {
                    name: info.name.clone(),
                    expected: expected.clone(),
                    actual: hash,
                });
            }
        }

        let model_path = self.get_model_path(info);
        if let Some(parent) = model_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&model_path, bytes)?;
        fs::write(self.get_digest_path(info), &hash)?;

        if !self.verify_model(info)? {
            return Err(ModelError::VerificationFailed);
        }
        Ok(())
    }

    fn verify_file(&self, path: &Path, expected_hash: &str) -> Result<bool, ModelError> {
        let bytes = fs::read(path)?;
        let hash = sha256_hex(&bytes);
        log::debug!("Calculated hash: {}", hash);
        log::debug!("Expected hash:   {}", expected_hash);
        Ok(hash == expected_hash.trim())
    }

    /// Checks the model file against the pinned hash, or the recorded one.
    ///
    /// A file with neither is reported as unverified.
    pub fn verify_model(&self, info: &ModelInfo) -> Result<bool, ModelError> {
        let model_path = self.get_model_path(info);
        if !model_path.exists() {
            log::info!("Model file {:?} does not exist", model_path);
            return Ok(false);
        }

        let expected = match &info.model_hash {
            Some(hash) => hash.clone(),
            None => match fs::read_to_string(self.get_digest_path(info)) {
                Ok(recorded) => recorded,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log::warn!("No digest recorded for {}", info.name);
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            },
        };

        let ok = self.verify_file(&model_path, &expected)?;
        log::info!("Model hash verification for {}: {}", info.name, ok);
        Ok(ok)
    }

    pub fn remove_download(&self, info: &ModelInfo) -> Result<(), ModelError> {
        for path in [self.get_model_path(info), self.get_digest_path(info)] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Ensures that a model is downloaded and verified.
    /// If the model doesn't exist, it will be downloaded.
    /// If verification fails, it will be re-downloaded.
    pub async fn ensure_model_downloaded(&self, info: &ModelInfo) -> Result<(), ModelError> {
        if !self.is_model_downloaded(info) {
            log::info!("Model {} not found, downloading...", info.name);
            return self.download_model(info).await;
        }
        if !self.verify_model(info)? {
            log::info!("Model verification failed, re-downloading...");
            self.remove_download(info)?;
            self.download_model(info).await?;
        }
        Ok(())
    }

    /// [`ensure_model_downloaded`](Self::ensure_model_downloaded) with retries and
    /// linear backoff between attempts.
    pub async fn ensure_model_downloaded_with_retry(
        &self,
        info: &ModelInfo,
        policy: &RetryPolicy,
    ) -> Result<(), ModelError> {
        retry_with_backoff(policy, || self.ensure_model_downloaded(info)).await
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub(crate) async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                log::error!("Giving up after {} attempts: {}", attempt, e);
                return Err(e);
            }
            Err(e) => {
                let wait = policy.delay_after(attempt);
                log::warn!("Attempt {}/{} failed: {}. Retrying in {:?}", attempt, attempts, e, wait);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}
