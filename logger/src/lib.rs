//! Process-wide logging setup on top of `env_logger`.
//!
//! `RUST_LOG` always wins over the default filter passed in.  Every setup
//! function may be called any number of times; only the first call in a
//! process installs a logger.

use {
    env_logger::{Builder, Env},
    log::LevelFilter,
};

const DEFAULT_FILTER: &str = "error";

/// Install with `filter` unless `RUST_LOG` is set.
pub fn setup_with_default(filter: &str) {
    install(Builder::from_env(Env::new().default_filter_or(filter)));
}

/// Install with an explicit filter, ignoring `RUST_LOG`.
pub fn setup_with(filter: &str) {
    let mut builder = Builder::new();
    builder.parse_filters(filter);
    install(builder);
}

/// Install with the `RUST_LOG` filter or, without one, only errors.
pub fn setup() {
    setup_with_default(DEFAULT_FILTER);
}

/// Install with a single level for every target unless `RUST_LOG` is set.
pub fn setup_with_default_filter(level: LevelFilter) {
    setup_with_default(&level.to_string().to_lowercase());
}

fn install(mut builder: Builder) {
    // a logger is already installed when this fails
    let _ = builder.format_timestamp_millis().try_init();
}
