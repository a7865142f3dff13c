mod error;
mod traits;
mod types;

pub use error::{ArchiveError, NetworkError, NetworkStage, TargetError, VerifyError};
pub use traits::{ArchiveDecoder, HttpClient, InstallTargets, Relauncher, SignatureVerifier};
pub use types::{InstallTarget, SignatureIdentity};
