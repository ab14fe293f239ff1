use failover_core::{Backend, TestConfig};
use failover_runtime::{router, Controller};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

#[allow(unused)]
pub fn init() {
    static ONCE_LOCK: OnceLock<()> = OnceLock::new();

    ONCE_LOCK.get_or_init(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            error!("Panic occurred: {info:?}");
        }));

        FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .with_env_filter("failover=debug,failover_runtime=debug,mock_db=info")
            .init();
    });
}

/// Serves the control surface on an ephemeral local port.
#[allow(unused)]
pub async fn spawn_server<B: Backend>(
    base: TestConfig,
    backend: Arc<B>,
) -> anyhow::Result<SocketAddr> {
    let controller = Arc::new(Controller::new(base, Box::new(move |_| Ok(backend.clone()))));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router(controller)).await {
            error!("Test server failed: {err}");
        }
    });
    Ok(addr)
}
