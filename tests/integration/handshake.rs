//! First-time authentication through the proxy

use ferry::backend::ConnState;
use ferry::protocol::capabilities::*;
use ferry::ProxyError;
use tokio::io::duplex;

use crate::mock::{
    BackendEvent, BackendSpec, MockClient, MockCluster, Reply, RouterEvent, CHANGE_USER_COLLATION,
    CLIENT_CAPS, PASSWORD,
};
use crate::{default_session, start_session, test_config, BACKEND1};

#[tokio::test]
async fn test_client_authenticates_through_proxy() {
    let (session, mut client) = default_session().await;

    // Waits for the manager to finish installing the backend link
    assert_eq!(session.manager.backend_addr().await.as_deref(), Some(BACKEND1));
    assert_eq!(session.manager.state(), ConnState::Authenticated);
    assert!(session
        .cluster
        .events()
        .contains(&BackendEvent::Authenticated {
            addr: BACKEND1.to_string(),
            user: "app".to_string(),
        }));

    let snapshot = session.manager.session().await;
    assert_eq!(snapshot.user, "app");
    assert_eq!(snapshot.database.as_deref(), Some("shop"));
    assert!(snapshot.token().is_some());

    assert_eq!(client.query("SELECT 1").await.rows(), vec![vec!["1".to_string()]]);
    assert_eq!(session.manager.state(), ConnState::Serving);
}

#[tokio::test]
async fn test_session_capability_is_intersection() {
    let cluster = MockCluster::new(&[]);
    cluster.add(
        BACKEND1,
        BackendSpec {
            caps: DEFAULT_CAPABILITIES & !CLIENT_CONNECT_ATTRS & !CLIENT_LOCAL_FILES,
            accepted_token: None,
        },
    );
    let client_caps = CLIENT_CAPS | CLIENT_MULTI_STATEMENTS | CLIENT_LOCAL_FILES;
    let (session, client) = start_session(cluster, test_config(), client_caps).await;

    let capability = session.manager.session().await.capability;
    assert_eq!(
        capability,
        client_caps & DEFAULT_CAPABILITIES & !CLIENT_CONNECT_ATTRS & !CLIENT_LOCAL_FILES
    );
    assert_ne!(capability & CLIENT_MULTI_STATEMENTS, 0);
    assert_eq!(capability & CLIENT_LOCAL_FILES, 0);
    assert_eq!(capability & CLIENT_SSL, 0);
    assert_eq!(client.capability(), capability);
}

#[tokio::test]
async fn test_backend_without_deprecate_eof_frames_result_sets() {
    let cluster = MockCluster::new(&[]);
    cluster.add(
        BACKEND1,
        BackendSpec {
            caps: DEFAULT_CAPABILITIES & !CLIENT_DEPRECATE_EOF,
            accepted_token: None,
        },
    );
    let (session, mut client) = start_session(cluster, test_config(), CLIENT_CAPS).await;

    assert_eq!(client.capability() & CLIENT_DEPRECATE_EOF, 0);
    assert_eq!(client.capability(), session.manager.session().await.capability);
    assert_eq!(client.query("SELECT 1").await.rows(), vec![vec!["1".to_string()]]);
    assert_eq!(client.query("SELECT 2").await.rows(), vec![vec!["2".to_string()]]);
    assert_eq!(session.manager.state(), ConnState::Serving);
}

#[tokio::test]
async fn test_change_user_is_relayed_and_tracked() {
    let (session, mut client) = default_session().await;

    match client.change_user("report", Some("analytics"), PASSWORD).await {
        Reply::Ok(_) => {}
        other => panic!("expected OK, got {other:?}"),
    }
    let snapshot = session.manager.session().await;
    assert_eq!(snapshot.user, "report");
    assert_eq!(snapshot.database.as_deref(), Some("analytics"));
    assert_eq!(snapshot.collation, CHANGE_USER_COLLATION);
    assert!(session.cluster.events().contains(&BackendEvent::ChangedUser {
        addr: BACKEND1.to_string(),
        user: "report".to_string(),
    }));

    assert_eq!(client.query("SELECT 3").await.rows(), vec![vec!["3".to_string()]]);
    assert_eq!(session.manager.state(), ConnState::Serving);
}

#[tokio::test]
async fn test_rejected_change_user_keeps_identity() {
    let (session, mut client) = default_session().await;

    match client.change_user("report", None, "wrong").await {
        Reply::Err(err) => assert_eq!(err.error_code, 1045),
        other => panic!("expected error, got {other:?}"),
    }
    let snapshot = session.manager.session().await;
    assert_eq!(snapshot.user, "app");
    assert_eq!(snapshot.database.as_deref(), Some("shop"));

    assert_eq!(client.query("SELECT 4").await.rows(), vec![vec!["4".to_string()]]);
    assert_eq!(session.manager.state(), ConnState::Serving);
}

#[tokio::test]
async fn test_wrong_password_is_relayed_and_closes() {
    let cluster = MockCluster::new(&[BACKEND1]);
    let router = crate::mock::RecordingRouter::new(BACKEND1);
    let driver = ferry::driver::Driver::new(router.clone(), cluster, test_config());
    let (client_side, proxy_side) = duplex(64 * 1024);
    let conn = driver.connection(proxy_side, "client");
    let manager = conn.manager();
    let task = tokio::spawn(conn.run());

    let err = match MockClient::connect(client_side, "app", None, "wrong", CLIENT_CAPS).await {
        Ok(_) => panic!("handshake should fail"),
        Err(err) => err,
    };
    assert_eq!(err.error_code, 1045);

    let result = task.await.unwrap();
    assert!(matches!(result, Err(ProxyError::Auth(_))));
    assert_eq!(manager.state(), ConnState::Closed);
    assert_eq!(
        router.events(),
        vec![RouterEvent::Closed {
            addr: BACKEND1.to_string(),
            id: manager.connection_id(),
        }]
    );
}

#[tokio::test]
async fn test_unreachable_backend_rejects_client() {
    let cluster = MockCluster::new(&[]);
    let router = crate::mock::RecordingRouter::new(BACKEND1);
    let driver = ferry::driver::Driver::new(router.clone(), cluster, test_config());
    let (client_side, proxy_side) = duplex(64 * 1024);
    let task = tokio::spawn(driver.connection(proxy_side, "client").run());

    let err = match MockClient::connect(client_side, "app", None, "pw", CLIENT_CAPS).await {
        Ok(_) => panic!("handshake should fail"),
        Err(err) => err,
    };
    assert_eq!(err.error_code, 1105);
    assert!(matches!(task.await.unwrap(), Err(ProxyError::Io(_))));
}

#[tokio::test]
async fn test_backend_error_is_relayed_without_closing() {
    let (session, mut client) = default_session().await;

    match client.query("FAIL now").await {
        Reply::Err(err) => assert_eq!(err.error_code, 1064),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(client.query("SELECT 5").await.rows(), vec![vec!["5".to_string()]]);
    assert_eq!(session.manager.state(), ConnState::Serving);
}

#[tokio::test]
async fn test_quit_closes_session() {
    let (session, client) = default_session().await;
    let id = session.manager.connection_id();

    client.quit().await;
    session.task.await.unwrap().unwrap();

    assert_eq!(session.manager.state(), ConnState::Closed);
    assert_eq!(
        session.router.events(),
        vec![RouterEvent::Closed {
            addr: BACKEND1.to_string(),
            id,
        }]
    );
    assert!(session.cluster.queries_on(BACKEND1).is_empty());
}
