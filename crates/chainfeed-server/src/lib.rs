//! chainfeed-server: HTTP control plane and WebSocket gateway.
//!
//! | Method | Path                          | Body                                  |
//! |--------|-------------------------------|---------------------------------------|
//! | GET    | `/api/v1/events/ws`           | WebSocket upgrade                     |
//! | POST   | `/api/v1/events/subscribe`    | `{contractAddress, eventSignatures?}` |
//! | POST   | `/api/v1/monitor/address`     | `{address}`                           |
//! | POST   | `/api/v1/monitor/high-value`  | `{minValue}` (ether)                  |
//! | GET    | `/api/v1/health`              |                                       |

pub mod error;
pub mod routes;
pub mod units;
pub mod ws;

use chainfeed_broadcast::BroadcastService;
use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

pub use error::ApiError;
pub use routes::{router, AppState, HealthResponse};
pub use units::parse_ether;

/// Serve the gateway on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    service: BroadcastService,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "gateway listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}
