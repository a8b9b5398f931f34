//! Integration test entry point
//!
//! Sessions run through the real driver and connection manager against
//! in-process mock backends, so no MySQL server is needed.

mod handshake;
mod redirect;

use std::sync::Arc;
use std::time::Duration;

use ferry::backend::{BackendConnManager, ManagerConfig};
use ferry::driver::Driver;
use tokio::io::duplex;
use tokio::task::JoinHandle;

use mock::{MockClient, MockCluster, RecordingRouter, CLIENT_CAPS, PASSWORD};

pub const BACKEND1: &str = "backend1:3306";
pub const BACKEND2: &str = "backend2:3306";

/// One proxied session with handles on every side of it
pub struct Session {
    pub cluster: Arc<MockCluster>,
    pub router: Arc<RecordingRouter>,
    pub manager: Arc<BackendConnManager>,
    pub task: JoinHandle<ferry::Result<()>>,
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        connect_timeout: Duration::from_secs(2),
        redirect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Start a session routed to `BACKEND1` and authenticate a client through it
pub async fn start_session(
    cluster: Arc<MockCluster>,
    config: ManagerConfig,
    caps: u32,
) -> (Session, MockClient) {
    let router = RecordingRouter::new(BACKEND1);
    let driver = Driver::new(router.clone(), cluster.clone(), config);
    let (client_side, proxy_side) = duplex(64 * 1024);

    let conn = driver.connection(proxy_side, "client");
    let manager = conn.manager();
    let task = tokio::spawn(conn.run());

    let client = MockClient::connect(client_side, "app", Some("shop"), PASSWORD, caps)
        .await
        .expect("handshake through the proxy");
    let session = Session {
        cluster,
        router,
        manager,
        task,
    };
    (session, client)
}

pub async fn default_session() -> (Session, MockClient) {
    start_session(MockCluster::new(&[BACKEND1, BACKEND2]), test_config(), CLIENT_CAPS).await
}
