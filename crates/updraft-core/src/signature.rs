//! Ed25519 trust checks for extracted artifacts.
//!
//! Every installable unit ships with a sidecar file `<unit>.sig` holding one
//! line: the hex encoded public key of the signer followed by the hex encoded
//! signature, separated by whitespace. The signed message is the SHA-256
//! digest of the unit. Directory units (application bundles) are digested by
//! walking their tree in sorted order, feeding each entry's relative path and
//! contents into the hash.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;
use updraft_backend::{SignatureIdentity, SignatureVerifier, VerifyError};

const HASH_BUFFER_SIZE: usize = 8192;
const SIDECAR_EXTENSION: &str = "sig";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid Ed25519 public key {key}: {details}")]
pub struct InvalidKey {
    pub key: String,
    pub details: String,
}

/// Accepts units signed by one of a fixed set of trusted Ed25519 keys.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier {
    trusted: Vec<VerifyingKey>,
}

struct Sidecar {
    signer: VerifyingKey,
    signature: Signature,
}

impl Ed25519Verifier {
    #[must_use]
    pub fn new(trusted: Vec<VerifyingKey>) -> Self {
        Self { trusted }
    }

    /// # Errors
    /// Returns an error for the first key that is not a valid hex encoded
    /// Ed25519 public key.
    pub fn from_hex_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self, InvalidKey> {
        let trusted = keys
            .iter()
            .map(|key| {
                let key = key.as_ref();
                parse_key(key).map_err(|details| InvalidKey {
                    key: key.to_string(),
                    details,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { trusted })
    }

    fn is_trusted(&self, key: &VerifyingKey) -> bool {
        self.trusted.iter().any(|trusted| trusted == key)
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(
        &self,
        artifact: &Path,
        installed: Option<&Path>,
    ) -> Result<SignatureIdentity, VerifyError> {
        let sidecar = read_sidecar(artifact)?;
        if !self.is_trusted(&sidecar.signer) {
            warn!("{} is signed by an untrusted key", artifact.display());
            return Err(VerifyError::UntrustedSigner {
                path: artifact.display().to_string(),
            });
        }
        check_signature(artifact, &sidecar)?;
        let identity = SignatureIdentity(hex::encode(sidecar.signer.as_bytes()));

        if let Some(installed) = installed {
            let current = read_sidecar(installed)?;
            check_signature(installed, &current)?;
            let expected = hex::encode(current.signer.as_bytes());
            if expected != identity.as_str() {
                return Err(VerifyError::IdentityMismatch {
                    expected,
                    actual: identity.0,
                });
            }
        }

        debug!("{} verified, signed by {identity}", artifact.display());
        Ok(identity)
    }
}

/// Path of the signature sidecar belonging to `unit`.
#[must_use]
pub fn sidecar_path(unit: &Path) -> PathBuf {
    let mut name = unit.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    unit.with_file_name(name)
}

fn parse_key(key: &str) -> Result<VerifyingKey, String> {
    let bytes: [u8; 32] = hex::decode(key.trim())
        .map_err(|error| error.to_string())?
        .try_into()
        .map_err(|bytes: Vec<u8>| format!("expected 32 bytes, got {}", bytes.len()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|error| error.to_string())
}

fn read_sidecar(unit: &Path) -> Result<Sidecar, VerifyError> {
    let path = sidecar_path(unit);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(VerifyError::MissingSignature {
                path: unit.display().to_string(),
            });
        }
        Err(error) => return Err(VerifyError::io(&path, &error)),
    };

    let invalid = |details: String| VerifyError::InvalidSignature {
        path: unit.display().to_string(),
        details,
    };

    let mut fields = contents.split_whitespace();
    let (Some(key), Some(signature), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(invalid("expected `<public key> <signature>` in sidecar".to_string()));
    };

    let signer = parse_key(key).map_err(invalid)?;
    let signature: [u8; 64] = hex::decode(signature)
        .map_err(|error| invalid(error.to_string()))?
        .try_into()
        .map_err(|bytes: Vec<u8>| {
            invalid(format!(
                "expected 64 signature bytes, got {}",
                bytes.len()
            ))
        })?;

    Ok(Sidecar {
        signer,
        signature: Signature::from_bytes(&signature),
    })
}

fn check_signature(unit: &Path, sidecar: &Sidecar) -> Result<(), VerifyError> {
    let digest = unit_digest(unit)?;
    sidecar
        .signer
        .verify(&digest, &sidecar.signature)
        .map_err(|error| VerifyError::InvalidSignature {
            path: unit.display().to_string(),
            details: error.to_string(),
        })
}

/// SHA-256 digest of a file, or of a directory tree walked in sorted order.
///
/// # Errors
/// Returns an error when the unit or one of its entries cannot be read.
pub fn unit_digest(unit: &Path) -> Result<[u8; 32], VerifyError> {
    let mut hasher = Sha256::new();
    let metadata = std::fs::metadata(unit).map_err(|error| VerifyError::io(unit, &error))?;
    if metadata.is_dir() {
        hash_tree(unit, unit, &mut hasher)?;
    } else {
        hash_file(unit, &mut hasher)?;
    }
    Ok(hasher.finalize().into())
}

fn hash_tree(root: &Path, dir: &Path, hasher: &mut Sha256) -> Result<(), VerifyError> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|error| VerifyError::io(dir, &error))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| VerifyError::io(dir, &error))?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(&path);
        let file_type = entry
            .file_type()
            .map_err(|error| VerifyError::io(&path, &error))?;

        hasher.update(relative.to_string_lossy().replace('\\', "/").as_bytes());
        hasher.update([0_u8]);

        if file_type.is_symlink() {
            let target =
                std::fs::read_link(&path).map_err(|error| VerifyError::io(&path, &error))?;
            hasher.update(b"link:");
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_dir() {
            hasher.update(b"dir");
            hash_tree(root, &path, hasher)?;
        } else {
            hash_file(&path, hasher)?;
        }
        hasher.update([0_u8]);
    }
    Ok(())
}

fn hash_file(path: &Path, hasher: &mut Sha256) -> Result<(), VerifyError> {
    let mut file = File::open(path).map_err(|error| VerifyError::io(path, &error))?;
    let mut buffer = [0_u8; HASH_BUFFER_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|error| VerifyError::io(path, &error))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(())
}
