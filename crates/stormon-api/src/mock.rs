//! In-process appliance used by transport tests.

use crate::config::ConnectionConfig;
use axum::Router;
use std::net::SocketAddr;

/// Serves `router` on an ephemeral port and returns its address.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Plain-HTTP connection to a mock with basic credentials.
pub fn connection(addr: SocketAddr) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(&addr.to_string()).with_basic_auth("admin", "secret");
    config.scheme = "http".to_string();
    config
}
