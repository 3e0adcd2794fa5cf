pub mod lifecycle;
pub mod media;
pub mod network;
pub mod release;
pub mod throttle;

pub use lifecycle::ServiceHooks;
pub use media::SessionProbe;
pub use network::UploadCounter;
pub use release::ReleaseFeed;
pub use throttle::{ThrottleError, ThrottleTarget};
