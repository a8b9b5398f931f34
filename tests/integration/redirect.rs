//! Live redirection of authenticated sessions

use std::time::Duration;

use ferry::backend::{ConnState, ManagerConfig};
use ferry::ProxyError;
use tokio::time::timeout;

use crate::mock::{BackendSpec, MockCluster, RouterEvent, CLIENT_CAPS};
use crate::{default_session, start_session, test_config, BACKEND1, BACKEND2};

fn row(value: &str) -> Vec<Vec<String>> {
    vec![vec![value.to_string()]]
}

#[tokio::test]
async fn test_redirect_moves_session_transparently() {
    let (session, mut client) = default_session().await;
    let id = session.manager.connection_id();

    assert_eq!(client.query("SELECT 1").await.rows(), row("1"));
    session.manager.redirect(BACKEND2).await.unwrap();
    assert_eq!(client.query("SELECT 2").await.rows(), row("2"));

    assert_eq!(session.cluster.queries_on(BACKEND1), vec!["SELECT 1"]);
    assert_eq!(session.cluster.queries_on(BACKEND2), vec!["SELECT 2"]);
    assert_eq!(session.manager.backend_addr().await.as_deref(), Some(BACKEND2));
    assert_eq!(session.manager.state(), ConnState::Serving);
    assert_eq!(
        session.router.events(),
        vec![RouterEvent::Succeed {
            from: BACKEND1.to_string(),
            to: BACKEND2.to_string(),
            id,
        }]
    );
}

#[tokio::test]
async fn test_new_backend_sees_session_token() {
    let (session, _client) = default_session().await;

    session.manager.redirect(BACKEND2).await.unwrap();

    let snapshot = session.manager.session().await;
    let token = snapshot.token().unwrap().to_string();
    assert_eq!(session.cluster.tokens_on(BACKEND2), vec![token]);
    assert_eq!(snapshot.connection_id, session.manager.connection_id());
}

#[tokio::test]
async fn test_configured_token_is_presented() {
    let cluster = MockCluster::new(&[BACKEND1]);
    cluster.add(
        BACKEND2,
        BackendSpec {
            accepted_token: Some("shared-secret".to_string()),
            ..Default::default()
        },
    );
    let config = ManagerConfig {
        session_token: Some("shared-secret".to_string()),
        ..test_config()
    };
    let (session, mut client) = start_session(cluster, config, CLIENT_CAPS).await;

    session.manager.redirect(BACKEND2).await.unwrap();
    assert_eq!(client.query("SELECT 7").await.rows(), row("7"));
    assert_eq!(session.cluster.tokens_on(BACKEND2), vec!["shared-secret"]);
}

#[tokio::test]
async fn test_command_during_redirect_runs_once_on_new_backend() {
    let (session, mut client) = default_session().await;
    assert_eq!(client.query("SELECT 1").await.rows(), row("1"));

    let gate = session.cluster.gate(BACKEND2);
    let manager = session.manager.clone();
    let redirect = tokio::spawn(async move { manager.redirect(BACKEND2).await });
    gate.started.notified().await;
    assert!(session.manager.redirect_pending());

    let query = tokio::spawn(async move {
        let reply = client.query("SELECT 2").await;
        (client, reply)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!query.is_finished());

    gate.open.notify_one();
    redirect.await.unwrap().unwrap();
    let (mut client, reply) = timeout(Duration::from_secs(5), query).await.unwrap().unwrap();

    assert_eq!(reply.rows(), row("2"));
    assert_eq!(client.query("SELECT 3").await.rows(), row("3"));
    assert_eq!(session.cluster.queries_on(BACKEND1), vec!["SELECT 1"]);
    assert_eq!(session.cluster.queries_on(BACKEND2), vec!["SELECT 2", "SELECT 3"]);
    assert!(!session.manager.redirect_pending());
}

#[tokio::test]
async fn test_failed_redirect_keeps_backend() {
    let (session, mut client) = default_session().await;
    let id = session.manager.connection_id();
    let unknown = "backend9:3306";

    let result = session.manager.redirect(unknown).await;
    assert!(matches!(result, Err(ProxyError::Io(_))));

    assert_eq!(client.query("SELECT 4").await.rows(), row("4"));
    assert_eq!(session.cluster.queries_on(BACKEND1), vec!["SELECT 4"]);
    assert_eq!(session.manager.backend_addr().await.as_deref(), Some(BACKEND1));
    assert_eq!(
        session.router.events(),
        vec![RouterEvent::Fail {
            from: BACKEND1.to_string(),
            to: unknown.to_string(),
            id,
        }]
    );
}

#[tokio::test]
async fn test_rejected_token_keeps_backend() {
    let cluster = MockCluster::new(&[BACKEND1]);
    cluster.add(
        BACKEND2,
        BackendSpec {
            accepted_token: Some("another-token".to_string()),
            ..Default::default()
        },
    );
    let (session, mut client) = start_session(cluster, test_config(), CLIENT_CAPS).await;

    let gate = session.cluster.gate(BACKEND2);
    let manager = session.manager.clone();
    let redirect = tokio::spawn(async move { manager.redirect(BACKEND2).await });
    gate.started.notified().await;

    let query = tokio::spawn(async move {
        let reply = client.query("SELECT 5").await;
        (client, reply)
    });
    gate.open.notify_one();

    assert!(matches!(redirect.await.unwrap(), Err(ProxyError::Auth(_))));
    let (_client, reply) = timeout(Duration::from_secs(5), query).await.unwrap().unwrap();
    assert_eq!(reply.rows(), row("5"));
    assert_eq!(session.cluster.queries_on(BACKEND1), vec!["SELECT 5"]);
    assert!(session.cluster.queries_on(BACKEND2).is_empty());

    let events = session.router.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], RouterEvent::Fail { to, .. } if to == BACKEND2));
}

#[tokio::test]
async fn test_concurrent_redirect_is_rejected() {
    let (session, _client) = default_session().await;

    let gate = session.cluster.gate(BACKEND2);
    let manager = session.manager.clone();
    let first = tokio::spawn(async move { manager.redirect(BACKEND2).await });
    gate.started.notified().await;

    let second = session.manager.redirect(BACKEND2).await;
    assert!(matches!(second, Err(ProxyError::RedirectBusy)));

    gate.open.notify_one();
    first.await.unwrap().unwrap();

    let events = session.router.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], RouterEvent::Succeed { .. }));
}

#[tokio::test]
async fn test_open_transaction_blocks_redirect() {
    let (session, mut client) = default_session().await;

    client.query("BEGIN").await;
    let result = session.manager.redirect(BACKEND2).await;
    assert!(matches!(result, Err(ProxyError::NotRedirectable(_))));
    assert_eq!(session.manager.backend_addr().await.as_deref(), Some(BACKEND1));

    client.query("COMMIT").await;
    session.manager.redirect(BACKEND2).await.unwrap();
    assert_eq!(client.query("SELECT 6").await.rows(), row("6"));
    assert_eq!(session.cluster.queries_on(BACKEND2), vec!["SELECT 6"]);

    let events = session.router.events();
    assert!(matches!(&events[0], RouterEvent::Fail { .. }));
    assert!(matches!(&events[1], RouterEvent::Succeed { .. }));
}

#[tokio::test]
async fn test_redirect_back_and_forth() {
    let (session, mut client) = default_session().await;

    for (target, value) in [(BACKEND2, "1"), (BACKEND1, "2"), (BACKEND2, "3")] {
        session.manager.redirect(target).await.unwrap();
        assert_eq!(client.query(&format!("SELECT {value}")).await.rows(), row(value));
    }
    assert_eq!(session.cluster.queries_on(BACKEND1), vec!["SELECT 2"]);
    assert_eq!(session.cluster.queries_on(BACKEND2), vec!["SELECT 1", "SELECT 3"]);
    assert_eq!(session.router.events().len(), 3);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (session, _client) = default_session().await;
    let id = session.manager.connection_id();

    session.manager.close().await.unwrap();
    session.manager.close().await.unwrap();

    assert_eq!(session.manager.state(), ConnState::Closed);
    assert!(matches!(
        session.manager.redirect(BACKEND2).await,
        Err(ProxyError::Closed)
    ));
    assert_eq!(
        session.router.events(),
        vec![RouterEvent::Closed {
            addr: BACKEND1.to_string(),
            id,
        }]
    );
}

#[tokio::test]
async fn test_close_aborts_redirect() {
    let (session, _client) = default_session().await;

    let gate = session.cluster.gate(BACKEND2);
    let manager = session.manager.clone();
    let redirect = tokio::spawn(async move { manager.redirect(BACKEND2).await });
    gate.started.notified().await;

    session.manager.close().await.unwrap();
    let result = timeout(Duration::from_secs(5), redirect).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProxyError::Closed)));
    assert_eq!(session.manager.state(), ConnState::Closed);
    assert_eq!(session.manager.backend_addr().await, None);

    let events = session.router.events();
    assert!(events.contains(&RouterEvent::Closed {
        addr: BACKEND1.to_string(),
        id: session.manager.connection_id(),
    }));
    assert!(!events.iter().any(|e| matches!(e, RouterEvent::Succeed { .. })));
}

#[tokio::test]
async fn test_client_gone_closes_session() {
    let (session, client) = default_session().await;

    drop(client);
    timeout(Duration::from_secs(5), session.task).await.unwrap().unwrap().unwrap();
    assert_eq!(session.manager.state(), ConnState::Closed);
}
