//! Dataset bootstrap
//!
//! token (env / .env) -> hub login -> dataset download into a local directory.
//! Every step reports its own failure and the whole run yields `None`; a
//! missing token stops before anything touches the disk.

use anyhow::{Context, Result};
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const HUB_ENDPOINT: &str = "https://huggingface.co";

/// Reads the hub token from the environment, after loading a local env file
pub struct CredentialLoader {
    env_file: PathBuf,
    var: String,
}

impl CredentialLoader {
    pub fn new(env_file: impl Into<PathBuf>, var: impl Into<String>) -> Self {
        Self {
            env_file: env_file.into(),
            var: var.into(),
        }
    }

    /// The token, if one is set and non-blank.
    ///
    /// Variables already present in the environment win over the env file.
    pub fn load(&self) -> Option<String> {
        match dotenvy::from_path(&self.env_file) {
            Ok(()) => debug!(path = %self.env_file.display(), "Loaded env file"),
            Err(e) if e.not_found() => debug!(path = %self.env_file.display(), "No env file"),
            Err(e) => warn!(path = %self.env_file.display(), "Failed to read env file: {}", e),
        }

        std::env::var(&self.var)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }

    pub fn var(&self) -> &str {
        &self.var
    }
}

/// A validated hub login
#[derive(Debug, Clone)]
pub struct HubSession {
    pub user: String,
    token: String,
}

impl HubSession {
    pub fn new(user: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// A dataset that is now on local disk
#[derive(Debug, Clone)]
pub struct LocalDataset {
    pub name: String,
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Remote side of the bootstrap
#[allow(async_fn_in_trait)]
pub trait DatasetHub {
    async fn authenticate(&self, token: &str) -> Result<HubSession>;

    async fn fetch_dataset(&self, session: &HubSession, dataset: &str, data_dir: &Path) -> Result<LocalDataset>;
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    name: String,
}

/// Checks a token against the hub's `whoami-v2` endpoint
pub struct HubAuthenticator {
    endpoint: String,
    client: reqwest::Client,
}

impl HubAuthenticator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn login(&self, token: &str) -> Result<HubSession> {
        let url = format!("{}/api/whoami-v2", self.endpoint);
        let whoami: WhoAmI = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .context("Hub unreachable")?
            .error_for_status()
            .context("Token rejected")?
            .json()
            .await
            .context("Unexpected whoami response")?;

        Ok(HubSession::new(whoami.name, token))
    }
}

/// Downloads every file of a dataset repository into a local directory
pub struct DatasetFetcher;

impl DatasetFetcher {
    pub async fn fetch(&self, session: &HubSession, dataset: &str, data_dir: &Path) -> Result<LocalDataset> {
        let api = ApiBuilder::new()
            .with_token(Some(session.token().to_string()))
            .with_cache_dir(data_dir.to_path_buf())
            .build()
            .context("Failed to create HuggingFace API client")?;
        let repo = api.repo(Repo::new(dataset.to_string(), RepoType::Dataset));

        let listing = repo
            .info()
            .await
            .with_context(|| format!("Failed to list dataset {}", dataset))?;
        info!(dataset, files = listing.siblings.len(), "Downloading dataset");

        let mut files = Vec::with_capacity(listing.siblings.len());
        for sibling in &listing.siblings {
            let path = repo
                .get(&sibling.rfilename)
                .await
                .with_context(|| format!("Failed to download {}/{}", dataset, sibling.rfilename))?;
            debug!(file = %sibling.rfilename, "  ✓ {}", path.display());
            files.push(path);
        }

        Ok(LocalDataset {
            name: dataset.to_string(),
            root: data_dir.to_path_buf(),
            files,
        })
    }
}

/// The real hub: HTTP login plus hf-hub downloads
pub struct HfHub {
    authenticator: HubAuthenticator,
    fetcher: DatasetFetcher,
}

impl HfHub {
    pub fn new() -> Self {
        Self {
            authenticator: HubAuthenticator::new(HUB_ENDPOINT),
            fetcher: DatasetFetcher,
        }
    }
}

impl Default for HfHub {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetHub for HfHub {
    async fn authenticate(&self, token: &str) -> Result<HubSession> {
        self.authenticator.login(token).await
    }

    async fn fetch_dataset(&self, session: &HubSession, dataset: &str, data_dir: &Path) -> Result<LocalDataset> {
        self.fetcher.fetch(session, dataset, data_dir).await
    }
}

/// Run the bootstrap. `None` means some step failed (already logged).
pub async fn bootstrap<H: DatasetHub>(
    hub: &H,
    token: Option<String>,
    dataset: &str,
    data_dir: &Path,
) -> Option<LocalDataset> {
    let Some(token) = token else {
        error!("No hub token found; set it in the environment or the .env file");
        return None;
    };

    let session = match hub.authenticate(&token).await {
        Ok(session) => {
            info!(user = %session.user, "✓ Hub token verified");
            session
        }
        Err(e) => {
            error!("Hub token verification failed: {:#}", e);
            return None;
        }
    };

    if let Err(e) = std::fs::create_dir_all(data_dir) {
        error!(path = %data_dir.display(), "Failed to create data directory: {}", e);
        return None;
    }

    match hub.fetch_dataset(&session, dataset, data_dir).await {
        Ok(local) => {
            info!(dataset, path = %data_dir.display(), files = local.files.len(), "✓ Dataset ready");
            Some(local)
        }
        Err(e) => {
            error!(dataset, "Dataset download failed: {:#}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHub {
        accept_token: bool,
        fetch_ok: bool,
        fetches: AtomicUsize,
    }

    impl FakeHub {
        fn new(accept_token: bool, fetch_ok: bool) -> Self {
            Self {
                accept_token,
                fetch_ok,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    impl DatasetHub for FakeHub {
        async fn authenticate(&self, token: &str) -> Result<HubSession> {
            if self.accept_token {
                Ok(HubSession::new("tester", token))
            } else {
                anyhow::bail!("401 Unauthorized")
            }
        }

        async fn fetch_dataset(&self, _session: &HubSession, dataset: &str, data_dir: &Path) -> Result<LocalDataset> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            assert!(data_dir.is_dir());
            if !self.fetch_ok {
                anyhow::bail!("404 Not Found");
            }
            let file = data_dir.join("train.jsonl");
            std::fs::write(&file, "{}\n")?;
            Ok(LocalDataset {
                name: dataset.to_string(),
                root: data_dir.to_path_buf(),
                files: vec![file],
            })
        }
    }

    #[tokio::test]
    async fn test_missing_token_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("qr-blip3o");
        let hub = FakeHub::new(true, true);

        assert!(bootstrap(&hub, None, "shichen/qr-blip3o", &data_dir).await.is_none());
        assert!(!data_dir.exists());
        assert_eq!(hub.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_token_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("qr-blip3o");
        let hub = FakeHub::new(false, true);

        let result = bootstrap(&hub, Some("bad".into()), "shichen/qr-blip3o", &data_dir).await;
        assert!(result.is_none());
        assert!(!data_dir.exists());
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("qr-blip3o");
        let hub = FakeHub::new(true, false);

        let result = bootstrap(&hub, Some("hf_token".into()), "shichen/qr-blip3o", &data_dir).await;
        assert!(result.is_none());
        assert!(data_dir.is_dir());
        assert_eq!(hub.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successful_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("qr-blip3o");
        let hub = FakeHub::new(true, true);

        let dataset = bootstrap(&hub, Some("hf_token".into()), "shichen/qr-blip3o", &data_dir)
            .await
            .unwrap();
        assert_eq!(dataset.name, "shichen/qr-blip3o");
        assert_eq!(dataset.root, data_dir);
        assert_eq!(dataset.files, vec![data_dir.join("train.jsonl")]);
    }

    #[test]
    fn test_credential_loader_reads_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(&env_file, "CONTROLNET_SWEEP_TEST_TOKEN=hf_from_file\n").unwrap();

        let loader = CredentialLoader::new(&env_file, "CONTROLNET_SWEEP_TEST_TOKEN");
        assert_eq!(loader.load().as_deref(), Some("hf_from_file"));
    }

    #[test]
    fn test_credential_loader_without_token() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(&env_file, "CONTROLNET_SWEEP_TEST_BLANK=   \n").unwrap();

        assert!(CredentialLoader::new(dir.path().join("missing.env"), "CONTROLNET_SWEEP_TEST_UNSET")
            .load()
            .is_none());
        assert!(CredentialLoader::new(&env_file, "CONTROLNET_SWEEP_TEST_BLANK")
            .load()
            .is_none());
    }
}
