mod current;
mod paths;

pub use current::CurrentInstall;
pub use paths::{AppPaths, AppPathsError};
