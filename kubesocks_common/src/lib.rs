//! Code shared between the `kubesocks` tools: the proxy session model, pod
//! manifests, our `kubectl` wrapper and the orchestrator which ties them
//! together.

#![warn(missing_docs)]

pub mod errors;
pub mod interrupt;
pub mod kubernetes;
pub mod manifest;
pub mod orchestrator;
pub mod session;
pub mod tracing_support;

/// Common imports used by many modules.
pub mod prelude {
    pub use anyhow::{format_err, Context};
    pub use serde::{Deserialize, Serialize};
    pub use std::{fmt, io::Write, time::Duration};
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use super::{Error, Result};
}

/// Error type for this crate's functions.
pub type Error = anyhow::Error;

/// Result type for this crate's functions.
pub type Result<T, E = Error> = std::result::Result<T, E>;
