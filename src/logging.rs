use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `BOBBAR_DEBUG` switches the crate to
/// debug output. Calling this more than once is harmless.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn default_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if std::env::var("BOBBAR_DEBUG").is_ok() {
        EnvFilter::new("bob_reason=debug,info")
    } else {
        EnvFilter::new("info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!("logging initialised twice without panicking");
    }
}
