pub mod scripted;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::{ScriptedBackend, ScriptedLoader};

#[cfg(feature = "backend-tract")]
pub use tract::{TractBackend, TractLoader};
