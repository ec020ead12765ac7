//! モデレーションセッションの管理

pub mod controller;
pub mod registry;
pub mod stats;

pub use controller::{SessionController, SessionDeps, SessionHandle, SessionRef, SessionStatus};
pub use registry::SessionRegistry;
pub use stats::SessionStats;
