//! In-process appliance for collector tests.

use crate::base::CollectorContext;
use axum::Router;
use std::net::SocketAddr;
use stormon_api::ConnectionConfig;

pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Plain-HTTP context pointing at a mock, with basic credentials and a
/// `datacenter` label.
pub fn context(addr: SocketAddr) -> CollectorContext {
    let mut connection = ConnectionConfig::new(&addr.to_string()).with_basic_auth("admin", "secret");
    connection.scheme = "http".to_string();
    let mut ctx = CollectorContext::new("test-poller", connection);
    ctx.labels.insert("datacenter".to_string(), "dc1".to_string());
    ctx
}
