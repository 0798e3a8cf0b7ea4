use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global fmt subscriber once. `RUST_LOG` wins; otherwise the
/// composer modules log at `info` and everything else at `warn`.
pub fn init_tracing() {
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,qbuilder=info,tower_http=info"));
        fmt().with_env_filter(filter).with_target(true).init();
    });
}
