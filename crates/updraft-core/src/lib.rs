//! Release pipeline for the updraft update client.
//!
//! This crate holds everything independent of the embedding application:
//! - Version validation and ordering ([`VersionScheme`]).
//! - Release discovery from GitHub or a generic JSON index.
//! - The per-version cache ([`AssetStore`]) with atomic state markers.
//! - The [`Release`] state machine and the [`Feed`] that drives it.
//! - Default capabilities: reqwest networking, zip extraction and Ed25519
//!   signature checks.

mod archive;
mod atomic;
mod error;
mod events;
mod feed;
mod http;
mod install;
mod release;
mod signature;
mod single_flight;
mod source;
mod store;
mod version;

#[cfg(test)]
mod test_support;

/// Zip archive decoder.
pub use archive::ZipDecoder;
/// Error types for every layer of the pipeline.
pub use error::{AssetError, CacheError, FeedError, MetadataError, ReleaseError};
/// Notifications delivered to the host through one ordered channel.
pub use events::{FeedEvent, FeedEvents};
/// Feed configuration, capabilities and orchestration.
pub use feed::{Capabilities, Feed, FeedConfig, InstallPolicy};
/// reqwest backed network capability.
pub use http::ReqwestClient;
/// Fixed list of install targets.
pub use install::StaticTargets;
/// Release state machine and per-stage reports.
pub use release::{Release, ReleaseState, Stage, StageReport};
/// Ed25519 signature sidecar verifier.
pub use signature::{Ed25519Verifier, InvalidKey, sidecar_path, unit_digest};
/// Release metadata sources and eligibility rules.
pub use source::{
    AssetDescriptor, Candidate, Eligibility, GenericIndexSource, GitHubReleaseSource,
    MetadataSource, select_eligible,
};
/// On-disk release cache.
pub use store::{AssetStore, CacheLease, ReleaseRecord};
/// Version schemes.
pub use version::VersionScheme;

pub use updraft_backend as backend;
