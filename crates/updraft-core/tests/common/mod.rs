#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::Notify;
use updraft_core::backend::{
    HttpClient, InstallTarget, NetworkError, Relauncher, SignatureIdentity, SignatureVerifier,
    VerifyError,
};
use updraft_core::{
    Capabilities, Feed, FeedConfig, FeedEvents, GenericIndexSource, MetadataSource, Release,
    StaticTargets, ZipDecoder,
};

pub const REPOSITORY: &str = "acme/tool";
pub const INDEX: &str = "https://updates.example.com/index.json";

pub fn asset_url(version: &str, name: &str) -> String {
    format!("https://updates.example.com/{version}/{name}")
}

/// Index body listing one release per `(version, asset names)` pair.
pub fn index_body(releases: &[(&str, &[&str])]) -> Vec<u8> {
    let releases: Vec<serde_json::Value> = releases
        .iter()
        .map(|(version, names)| {
            let assets: Vec<serde_json::Value> = names
                .iter()
                .map(|name| serde_json::json!({ "url": asset_url(version, name), "name": name }))
                .collect();
            serde_json::json!({ "version": version, "assets": assets })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({ "releases": releases })).expect("index should encode")
}

/// Index body with a single asset `name` published with a sha256 digest.
pub fn index_body_with_sha256(version: &str, name: &str, sha256: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "releases": [{
            "version": version,
            "assets": [{ "url": asset_url(version, name), "name": name, "sha256": sha256 }],
        }],
    }))
    .expect("index should encode")
}

pub fn sha256_hex(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[derive(Default)]
pub struct FakeHttp {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
    held: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakeHttp {
    pub fn respond(&self, url: &str, body: &[u8]) {
        self.responses
            .lock()
            .expect("responses lock")
            .insert(url.to_string(), body.to_vec());
    }

    /// Park every request for `url` until the returned gate is notified.
    pub fn hold(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.held
            .lock()
            .expect("held lock")
            .insert(url.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn forget(&self, url: &str) {
        self.responses.lock().expect("responses lock").remove(url);
    }

    pub fn requests(&self, url: &str) -> usize {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|requested| *requested == url)
            .count()
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn get(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(url.to_string());
        let gate = self.held.lock().expect("held lock").get(url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.responses
            .lock()
            .expect("responses lock")
            .get(url)
            .cloned()
            .ok_or_else(|| NetworkError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })
    }
}

/// Accepts every artifact and counts how often it was asked.
#[derive(Default)]
pub struct CountingVerifier {
    calls: AtomicUsize,
}

impl CountingVerifier {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SignatureVerifier for CountingVerifier {
    fn verify(
        &self,
        _artifact: &Path,
        _installed: Option<&Path>,
    ) -> Result<SignatureIdentity, VerifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SignatureIdentity("counting".to_string()))
    }
}

/// Records every relaunched target instead of starting a process.
#[derive(Default)]
pub struct RecordingRelauncher {
    launched: Mutex<Vec<String>>,
}

impl RecordingRelauncher {
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().expect("launched lock").clone()
    }
}

impl Relauncher for RecordingRelauncher {
    fn relaunch(&self, target: &InstallTarget) -> Result<(), std::io::Error> {
        self.launched
            .lock()
            .expect("launched lock")
            .push(target.name.clone());
        Ok(())
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub feed: Feed,
    pub events: FeedEvents,
    pub http: Arc<FakeHttp>,
    pub targets: Vec<InstallTarget>,
}

impl Harness {
    /// A feed reading [`INDEX`], with one install target per name under
    /// `<temp>/install`.
    pub fn new(target_names: &[&str], verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self::with_installed(target_names, verifier, None)
    }

    pub fn with_installed(
        target_names: &[&str],
        verifier: Arc<dyn SignatureVerifier>,
        installed_version: Option<&str>,
    ) -> Self {
        Self::build(target_names, verifier, installed_version, None)
    }

    pub fn with_relauncher(
        target_names: &[&str],
        verifier: Arc<dyn SignatureVerifier>,
        relauncher: Arc<dyn Relauncher>,
    ) -> Self {
        Self::build(target_names, verifier, None, Some(relauncher))
    }

    fn build(
        target_names: &[&str],
        verifier: Arc<dyn SignatureVerifier>,
        installed_version: Option<&str>,
        relauncher: Option<Arc<dyn Relauncher>>,
    ) -> Self {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let install_dir = temp.path().join("install");
        std::fs::create_dir_all(&install_dir).expect("install dir should be created");
        let targets: Vec<InstallTarget> = target_names
            .iter()
            .map(|name| InstallTarget {
                name: (*name).to_string(),
                path: install_dir.join(name),
            })
            .collect();

        let http = Arc::new(FakeHttp::default());
        let capabilities = Capabilities {
            http: http.clone(),
            archive: Arc::new(ZipDecoder),
            verifier,
            targets: Arc::new(StaticTargets(targets.clone())),
            relauncher,
        };
        let mut config = FeedConfig::new(REPOSITORY, temp.path().join("cache"));
        config.source = MetadataSource::Index(GenericIndexSource::new(INDEX));
        config.installed_version = installed_version.map(str::to_string);

        let (feed, events) = Feed::new(config, capabilities);
        Self {
            temp,
            feed,
            events,
            http,
            targets,
        }
    }

    /// A second feed over the same cache and install targets, as a
    /// restarted process would create it.
    pub fn reopen(
        &self,
        verifier: Arc<dyn SignatureVerifier>,
        installed_version: Option<&str>,
    ) -> (Feed, FeedEvents) {
        let capabilities = Capabilities {
            http: self.http.clone(),
            archive: Arc::new(ZipDecoder),
            verifier,
            targets: Arc::new(StaticTargets(self.targets.clone())),
            relauncher: None,
        };
        let mut config = FeedConfig::new(REPOSITORY, self.temp.path().join("cache"));
        config.source = MetadataSource::Index(GenericIndexSource::new(INDEX));
        config.installed_version = installed_version.map(str::to_string);
        Feed::new(config, capabilities)
    }

    pub fn install_dir(&self) -> PathBuf {
        self.temp.path().join("install")
    }

    pub fn feed_record(&self) -> PathBuf {
        self.feed.store().repository_dir(REPOSITORY).join("feed.json")
    }

    /// Take `release` from `Fetched` through `Verified`.
    pub async fn verify(&self, release: &Release) {
        release.download().await.expect("download should succeed");
        release.extract().await.expect("extract should succeed");
        release.verify().await.expect("verify should succeed");
    }

    /// Publish `version` with one asset per `(name, body)` and check for it.
    pub async fn publish_and_check(&self, version: &str, assets: &[(&str, &[u8])]) -> Release {
        let names: Vec<&str> = assets.iter().map(|(name, _)| *name).collect();
        self.http
            .respond(INDEX, &index_body(&[(version, names.as_slice())]));
        for (name, body) in assets {
            self.http.respond(&asset_url(version, name), body);
        }
        self.feed
            .check()
            .await
            .expect("check should succeed")
            .expect("release should be found")
    }
}

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Sidecar contents signing a single file `body`.
pub fn sidecar_for(key: &SigningKey, body: &[u8]) -> Vec<u8> {
    let digest: [u8; 32] = Sha256::digest(body).into();
    let signature = key.sign(&digest);
    format!(
        "{} {}",
        hex::encode(key.verifying_key().as_bytes()),
        hex::encode(signature.to_bytes())
    )
    .into_bytes()
}

/// Zip archive holding `entries`.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, body) in entries {
        writer.start_file(*name, options).expect("zip entry should start");
        writer.write_all(body).expect("zip entry should be written");
    }
    writer
        .finish()
        .expect("zip should finish")
        .into_inner()
}
