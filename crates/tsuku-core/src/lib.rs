pub mod config;
pub mod fixtures;
pub mod host;
pub mod paths;
pub mod registry;
pub mod reporter;
pub mod state;
pub mod verify;

pub use config::VerifyConfig;
pub use paths::*;
pub use registry::SystemLibraryRegistry;
pub use reporter::{NullReporter, Reporter};
pub use state::{InstallState, InstalledArtifact, SonameIndex};
pub use verify::Verifier;
