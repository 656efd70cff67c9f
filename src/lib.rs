pub mod admission;
pub mod config;
pub mod dispatch;
pub mod logging;
pub mod media;
pub mod metrics;
pub mod peer;
pub mod room;
pub mod server;
pub mod signal;

pub use peer::PeerSession;
pub use room::{Room, User, UserState};
