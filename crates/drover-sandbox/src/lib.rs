mod error;
mod layout;
mod sandbox;

pub use error::{Result, SandboxError};
pub use layout::RunLayout;
pub use sandbox::{Action, Sandbox};
