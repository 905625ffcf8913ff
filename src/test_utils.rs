//! Test utilities and global setup
//!
//! Provides centralized test logging configuration and helpers for tests
//! that drive a real editor process.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG` and writes through the test writer so output is
    /// captured per test.
    ///
    /// ```bash
    /// RUST_LOG=nvim_mirror::rpc=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Global test logging setup
///
/// Add to a test module to initialise logging before any of its tests run.
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Editor executable for integration tests
///
/// `MIRROR_NVIM_PATH` when set, else `nvim` from `PATH`.
#[cfg(all(test, feature = "nvim-integration-tests"))]
pub fn get_test_nvim_path() -> String {
    crate::config::resolve_nvim_path(None)
}

/// Helpers for tests against a real editor process
#[cfg(all(test, feature = "nvim-integration-tests"))]
pub mod integration {
    use std::time::Duration;

    use crate::config::MirrorConfig;

    /// Configuration for an isolated editor: no startup file, bounded calls
    pub fn test_config() -> MirrorConfig {
        MirrorConfig::builder()
            .nvim_path(super::get_test_nvim_path())
            .request_timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }
}
