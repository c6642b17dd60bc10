//! Structured logging for Ember, a thin layer over `tracing`.
//!
//! Call [`init`] once at startup; everything else glob-imports
//! [`prelude`] and logs with structured fields:
//!
//! ```
//! use ember_logger::prelude::*;
//!
//! let height = 42;
//! info!(height, "block pushed");
//! ```

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Install the global subscriber. The `EMBER_LOG` environment variable
/// selects the filter (`info` by default, standard `tracing` syntax).
/// Safe to call more than once; only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("EMBER_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    });
}

/// Install a subscriber for tests: debug level, test writer, no-op if
/// a subscriber is already installed.
pub fn test_logger() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

pub mod prelude {
    //! Re-exports of the macros and spans modules log with.

    #[doc(inline)]
    pub use tracing::{debug, error, info, trace, warn};
}
