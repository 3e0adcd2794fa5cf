pub mod arbitration;
pub mod collaborators;
pub mod lifecycle;
pub mod release;
pub mod server;
pub mod supervisor;

pub use arbitration::ArbitrationLoop;
pub use collaborators::{Collaborator, MediaDetector, NetDetector};
pub use lifecycle::DaemonHooks;
pub use release::{ReleaseWatcher, VersionAnnouncer};
pub use server::{ApiCollaborator, ServerConfig, ServerError, StateBroadcastServer};
pub use supervisor::Supervisor;
