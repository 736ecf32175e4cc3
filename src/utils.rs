#[cfg(feature = "logging")]
use tracing_subscriber::{EnvFilter, fmt};

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` overrides the default `info` filter. Fails if a subscriber is
/// already installed.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

/// Comma separated list, for log lines.
pub(crate) fn joined<T: std::fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joined() {
        assert_eq!(joined(["a", "b", "c"]), "a, b, c");
        assert_eq!(joined(Vec::<String>::new()), "");
    }
}
