//! Logger installation.
//!
//! Components log through the `log` facade; the module path is the target,
//! so `RUST_LOG=phore_bazaar::net=debug` scopes output to one component.

/// Install `env_logger` with `default_filter` unless `RUST_LOG` is set.
/// Repeated calls are ignored.
pub fn init(default_filter: &str) {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init("info");
        init("debug");
        log::info!("logger installed");
    }
}
