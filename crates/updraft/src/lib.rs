//! Embeddable update client.
//!
//! [`FeedBuilder`] turns persisted [`FeedSettings`] into a running [`Feed`]
//! backed by the GitHub or index metadata sources, zip extraction, Ed25519
//! signature checks and the running executable as install target. Hosts that
//! need other capabilities can assemble a [`Feed`] directly from
//! [`updraft_core`].

mod builder;
mod error;
mod logging;
mod settings;

pub use builder::FeedBuilder;
pub use error::{SetupError, SetupErrorDetail};
pub use logging::{init_logging, init_logging_at, set_logging_enabled};
pub use settings::{FeedSettings, SourceSetting};

pub use updraft_core::*;
pub use updraft_platform::{AppPaths, AppPathsError, CurrentInstall};
