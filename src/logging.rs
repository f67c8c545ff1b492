//! Subscriber setup for embedders and tests

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
fn default_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    EnvFilter::new(format!("stackfs={}", level))
}

/// Install a global `fmt` subscriber
///
/// `RUST_LOG` wins over `verbose`. Returns false if a subscriber was
/// already installed, which is harmless when several tests race to log.
pub fn init(verbose: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));

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
    fn test_init_twice() {
        init(false);
        assert!(!init(true));
    }
}
