//! Custom Resource Definitions for application monitoring
//!
//! This module contains the Instrumentation CRD read by the webhook.

mod instrumentation;
mod types;

pub use instrumentation::{Instrumentation, InstrumentationSpec};
pub use types::{Destination, InstrumentationSettings, LogCollectionSettings, Platform};
