use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::task::{JoinError, JoinSet};
use updraft_backend::{ArchiveDecoder, HttpClient, InstallTarget, SignatureVerifier, TargetError};

use super::{Release, ReleaseState, Stage, StageOutcome, StageReport};
use crate::atomic::remove_path;
use crate::error::{AssetError, CacheError, ReleaseError};
use crate::install::install_units;
use crate::source::{AssetDescriptor, file_name_from_url};
use crate::store::PARTIAL_SUFFIX;

const DOWNLOADS_DIR: &str = "downloads";
const EXTRACTED_DIR: &str = "extracted";
/// Failure key used when the install targets themselves are unavailable.
pub(crate) const TARGETS_KEY: &str = "install-targets";

impl Release {
    fn location(&self) -> Result<PathBuf, ReleaseError> {
        self.cache_location().ok_or(ReleaseError::Precondition {
            stage: Stage::Download,
            required: ReleaseState::Fetched,
            actual: ReleaseState::Empty,
        })
    }

    pub(super) async fn download_assets(self) -> StageOutcome {
        if let Some(report) = self.admit(Stage::Download)? {
            return Ok(report);
        }
        let location = self.location()?;
        let _lease = self.context().store.lease(&location);

        let (assets, done) = {
            let data = self.data();
            (data.assets.clone(), data.downloaded.clone())
        };
        let downloads = location.join(DOWNLOADS_DIR);
        tokio::fs::create_dir_all(&downloads)
            .await
            .map_err(|error| CacheError::io(&downloads, &error))?;

        let names = local_names(&assets);
        let mut tasks = JoinSet::new();
        let mut keys = HashMap::new();
        for (asset, name) in assets.iter().zip(names) {
            if done.contains_key(&asset.url) {
                continue;
            }
            let http = Arc::clone(&self.context().capabilities.http);
            let asset = asset.clone();
            let dest = downloads.join(name);
            let url = asset.url.clone();
            let handle =
                tasks.spawn(async move { download_asset(http.as_ref(), &asset, &dest).await });
            keys.insert(handle.id(), url);
        }
        debug!(
            "Downloading {} of {} asset(s) for {}",
            keys.len(),
            assets.len(),
            self.inner.repository
        );

        let mut report = StageReport::new(Stage::Download);
        collect(&mut tasks, &keys, &mut report).await;

        self.update(|data| {
            data.downloaded.extend(report.succeeded.clone());
            data.failed.clone_from(&report.failed);
            let complete = data
                .assets
                .iter()
                .all(|asset| data.downloaded.contains_key(&asset.url));
            if report.failed.is_empty() && complete {
                data.state = ReleaseState::Downloaded;
            }
        })?;

        report.succeeded = self.data().downloaded.clone();
        if report.is_complete() {
            Ok(report)
        } else {
            Err(ReleaseError::Transfer(report))
        }
    }

    pub(super) async fn extract_assets(self) -> StageOutcome {
        if let Some(report) = self.admit(Stage::Extract)? {
            return Ok(report);
        }
        let location = self.location()?;
        let _lease = self.context().store.lease(&location);

        let (downloaded, done) = {
            let data = self.data();
            (data.downloaded.clone(), data.extracted.clone())
        };
        let extracted = location.join(EXTRACTED_DIR);
        tokio::fs::create_dir_all(&extracted)
            .await
            .map_err(|error| CacheError::io(&extracted, &error))?;

        let mut tasks = JoinSet::new();
        let mut keys = HashMap::new();
        for (url, path) in downloaded {
            if done.contains_key(&url) {
                continue;
            }
            let archive = Arc::clone(&self.context().capabilities.archive);
            let dest_root = extracted.clone();
            let handle = tasks
                .spawn_blocking(move || extract_asset(archive.as_ref(), &path, &dest_root));
            keys.insert(handle.id(), url);
        }

        let mut report = StageReport::new(Stage::Extract);
        collect(&mut tasks, &keys, &mut report).await;

        self.update(|data| {
            data.extracted.extend(report.succeeded.clone());
            data.failed.clone_from(&report.failed);
            let complete = data
                .downloaded
                .keys()
                .all(|url| data.extracted.contains_key(url));
            if report.failed.is_empty() && complete {
                data.state = ReleaseState::Extracted;
            }
        })?;

        report.succeeded = self.data().extracted.clone();
        if report.is_complete() {
            Ok(report)
        } else {
            Err(ReleaseError::Extraction(report))
        }
    }

    pub(super) async fn verify_artifacts(self) -> StageOutcome {
        if let Some(report) = self.admit(Stage::Verify)? {
            return Ok(report);
        }
        let location = self.location()?;
        let _lease = self.context().store.lease(&location);

        let mut report = StageReport::new(Stage::Verify);
        let extracted = self.extracted_assets();
        let require_match = self.context().require_identity_match;

        match self.install_targets() {
            Ok(targets) => {
                let mut tasks = JoinSet::new();
                let mut keys = HashMap::new();
                for target in targets {
                    let Some(artifact) = find_unit(&extracted, &target.name) else {
                        report.failed.insert(
                            target.name.clone(),
                            AssetError::MissingArtifact { name: target.name },
                        );
                        continue;
                    };
                    let verifier = Arc::clone(&self.context().capabilities.verifier);
                    let installed =
                        (require_match && target.path.exists()).then_some(target.path.clone());
                    let handle = tasks.spawn_blocking(move || {
                        verify_unit(verifier.as_ref(), &artifact, installed.as_deref())
                    });
                    keys.insert(handle.id(), target.name);
                }
                collect(&mut tasks, &keys, &mut report).await;
            }
            Err(error) => {
                report.failed.insert(TARGETS_KEY.to_string(), error.into());
            }
        }

        self.update(|data| {
            data.verified.clone_from(&report.succeeded);
            data.failed.clone_from(&report.failed);
            if report.failed.is_empty() {
                data.state = ReleaseState::Verified;
            }
        })?;

        if report.is_complete() {
            Ok(report)
        } else {
            Err(ReleaseError::Verification(report))
        }
    }

    pub(super) async fn install_artifacts(self) -> StageOutcome {
        if let Some(report) = self.admit(Stage::Install)? {
            return Ok(report);
        }
        let location = self.location()?;
        let _lease = self.context().store.lease(&location);

        let mut report = StageReport::new(Stage::Install);
        let verified = self.verified_artifacts();

        let units = match self.install_targets() {
            Ok(targets) => {
                let mut units = Vec::with_capacity(targets.len());
                for target in targets {
                    match verified.get(&target.name) {
                        Some(artifact) => {
                            let artifact = artifact.clone();
                            units.push((target, artifact));
                        }
                        None => {
                            report.failed.insert(
                                target.name.clone(),
                                AssetError::MissingArtifact { name: target.name },
                            );
                        }
                    }
                }
                units
            }
            Err(error) => {
                report.failed.insert(TARGETS_KEY.to_string(), error.into());
                Vec::new()
            }
        };

        if report.failed.is_empty() {
            match tokio::task::spawn_blocking(move || install_units(&units)).await {
                Ok(Ok(installed)) => report.succeeded = installed,
                Ok(Err(failures)) => report.failed = failures,
                Err(error) => {
                    report
                        .failed
                        .insert(TARGETS_KEY.to_string(), worker_failure(&error));
                }
            }
        }

        let installed = report.failed.is_empty();
        self.update(|data| {
            data.failed.clone_from(&report.failed);
            if installed {
                data.state = ReleaseState::Installed;
            }
        })?;

        if installed {
            if let Some(version) = self.version() {
                self.context()
                    .store
                    .set_active(&self.inner.repository, &version);
            }
            Ok(report)
        } else {
            Err(ReleaseError::Install(report))
        }
    }

    fn install_targets(&self) -> Result<Vec<InstallTarget>, TargetError> {
        let targets = self.context().capabilities.targets.targets()?;
        if targets.is_empty() {
            return Err(TargetError::Unavailable {
                details: "no install targets configured".to_string(),
            });
        }
        Ok(targets)
    }
}

async fn collect(
    tasks: &mut JoinSet<Result<PathBuf, AssetError>>,
    keys: &HashMap<tokio::task::Id, String>,
    report: &mut StageReport,
) {
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, Ok(path))) => {
                if let Some(key) = keys.get(&id) {
                    report.succeeded.insert(key.clone(), path);
                }
            }
            Ok((id, Err(error))) => {
                if let Some(key) = keys.get(&id) {
                    warn!("{} failed for {key}: {error}", report.stage);
                    report.failed.insert(key.clone(), error);
                }
            }
            Err(error) => {
                if let Some(key) = keys.get(&error.id()) {
                    report.failed.insert(key.clone(), worker_failure(&error));
                }
            }
        }
    }
}

fn worker_failure(error: &JoinError) -> AssetError {
    AssetError::Worker(error.to_string())
}

/// File names for downloaded assets, stable across retries and unique
/// within the release.
fn local_names(assets: &[AssetDescriptor]) -> Vec<String> {
    let mut seen = HashSet::new();
    assets
        .iter()
        .enumerate()
        .map(|(index, asset)| {
            let base = safe_name(&asset.name)
                .or_else(|| file_name_from_url(&asset.url))
                .unwrap_or_else(|| format!("asset-{index}"));
            if seen.insert(base.clone()) {
                base
            } else {
                let unique = format!("{index}-{base}");
                seen.insert(unique.clone());
                unique
            }
        })
        .collect()
}

fn safe_name(name: &str) -> Option<String> {
    let file_name = Path::new(name).file_name()?.to_str()?;
    (file_name == name && !name.contains("..")).then(|| name.to_string())
}

async fn download_asset(
    http: &dyn HttpClient,
    asset: &AssetDescriptor,
    dest: &Path,
) -> Result<PathBuf, AssetError> {
    let partial = with_suffix(dest, PARTIAL_SUFFIX);
    let bytes = http.download(&asset.url, &partial).await?;

    if let Some(expected) = asset.sha256.clone() {
        let path = partial.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|error| worker_failure(&error))??;
        if !actual.eq_ignore_ascii_case(&expected) {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(AssetError::DigestMismatch { expected, actual });
        }
    }

    tokio::fs::rename(&partial, dest)
        .await
        .map_err(|error| AssetError::io(dest, &error))?;
    info!("Downloaded {} ({bytes} bytes)", asset.url);
    Ok(dest.to_path_buf())
}

fn extract_asset(
    decoder: &dyn ArchiveDecoder,
    path: &Path,
    dest_root: &Path,
) -> Result<PathBuf, AssetError> {
    if !decoder.is_archive(path) {
        return Ok(path.to_path_buf());
    }

    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let dest = dest_root.join(&stem);
    let partial = with_suffix(&dest, PARTIAL_SUFFIX);

    remove_path(&partial).map_err(|error| AssetError::io(&partial, &error))?;
    std::fs::create_dir_all(&partial).map_err(|error| AssetError::io(&partial, &error))?;
    if let Err(error) = decoder.extract(path, &partial) {
        let _ = remove_path(&partial);
        return Err(error.into());
    }

    remove_path(&dest).map_err(|error| AssetError::io(&dest, &error))?;
    std::fs::rename(&partial, &dest).map_err(|error| AssetError::io(&dest, &error))?;
    debug!("Extracted {} into {}", path.display(), dest.display());
    Ok(dest)
}

/// The extracted entry that replaces the target called `name`: either an
/// artifact with that file name, or one directly inside an unpacked archive.
fn find_unit(extracted: &BTreeMap<String, PathBuf>, name: &str) -> Option<PathBuf> {
    extracted.values().find_map(|path| {
        if path.file_name().is_some_and(|file| file == name) {
            Some(path.clone())
        } else if path.is_dir() {
            let inner = path.join(name);
            inner.symlink_metadata().is_ok().then_some(inner)
        } else {
            None
        }
    })
}

fn verify_unit(
    verifier: &dyn SignatureVerifier,
    artifact: &Path,
    installed: Option<&Path>,
) -> Result<PathBuf, AssetError> {
    let identity = verifier.verify(artifact, installed)?;
    debug!("{} carries a valid signature from {identity}", artifact.display());
    Ok(artifact.to_path_buf())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn sha256_file(path: &Path) -> Result<String, AssetError> {
    use std::io::Read;

    let mut file = std::fs::File::open(path).map_err(|error| AssetError::io(path, &error))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|error| AssetError::io(path, &error))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::{find_unit, local_names, sha256_file, with_suffix};
    use crate::source::AssetDescriptor;

    fn asset(url: &str, name: &str) -> AssetDescriptor {
        AssetDescriptor {
            url: url.to_string(),
            name: name.to_string(),
            sha256: None,
        }
    }

    #[test]
    fn local_names_are_unique_and_safe() {
        let names = local_names(&[
            asset("https://a.example/x/app.zip", "app.zip"),
            asset("https://b.example/y/app.zip", "app.zip"),
            asset("https://c.example/z/tool", "../escape"),
            asset("https://c.example/", ""),
        ]);

        assert_eq!(names, vec!["app.zip", "1-app.zip", "tool", "asset-3"]);
    }

    #[test]
    fn with_suffix_appends_to_file_name() {
        assert_eq!(
            with_suffix(std::path::Path::new("/cache/app.zip"), ".partial"),
            PathBuf::from("/cache/app.zip.partial")
        );
    }

    #[test]
    fn sha256_file_returns_known_digest() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("payload.bin");
        std::fs::write(&path, b"abc").expect("payload should be written");

        assert_eq!(
            sha256_file(&path).expect("digest should compute"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn find_unit_matches_file_names_and_archive_contents() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let unpacked = temp.path().join("bundle");
        std::fs::create_dir_all(unpacked.join("Tool.app")).expect("bundle should be created");
        let loose = temp.path().join("helper");
        std::fs::write(&loose, b"bin").expect("file should be written");

        let extracted = BTreeMap::from([
            ("https://e/bundle.zip".to_string(), unpacked.clone()),
            ("https://e/helper".to_string(), loose.clone()),
        ]);

        assert_eq!(find_unit(&extracted, "helper"), Some(loose));
        assert_eq!(find_unit(&extracted, "Tool.app"), Some(unpacked.join("Tool.app")));
        assert_eq!(find_unit(&extracted, "missing"), None);
    }
}
