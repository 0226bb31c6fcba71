use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "shared=info";

/// Installs a fmt subscriber for hosts without their own.
///
/// `RUST_LOG` wins over `filter`. Returns `false` if a global subscriber was
/// already set, in which case nothing changes.
pub fn init_tracing(filter: Option<&str>) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        init_tracing(Some("debug"));
        assert!(!init_tracing(None));
    }
}
