//! Tracing setup for embedding binaries

use sase_common::{EntitlementError, EntitlementResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Returns `false` when a global
/// subscriber was already installed, so repeated calls are harmless.
pub fn init_tracing(default_filter: &str) -> EntitlementResult<bool> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| EntitlementError::Config(format!("invalid log filter: {e}")))?;

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Entitlement engine v{}", env!("CARGO_PKG_VERSION"));
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing("info").unwrap();
        assert!(!init_tracing("debug").unwrap());
    }
}
