use std::sync::Arc;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use tracing::{debug, info, warn};

use super::connector::BackendChannelProvider;
use super::session::Session;
use crate::error::{ProxyError, Result};
use crate::protocol::handshake::{is_auth_more_data, is_ssl_request};
use crate::protocol::packet::{ERR_HEADER, MAX_PACKET_SIZE, OK_HEADER};
use crate::protocol::{
    capabilities::*, ErrPacket, HandshakeResponse, InitialHandshake, PacketIo, SslRequest,
};

/// Plugin name no backend implements; forces an auth switch carrying the backend's salt
pub const UNKNOWN_AUTH_PLUGIN: &str = "ferry_unknown_plugin";

/// Plugin name under which the session token is presented on redirect
pub const SESSION_TOKEN_AUTH_PLUGIN: &str = "ferry_session_token";

/// caching_sha2_password "fast auth success" marker; no client reply follows
const FAST_AUTH_OK: [u8; 2] = [0x01, 0x03];

/// Result of relaying an authentication exchange
#[derive(Debug)]
pub(crate) enum AuthOutcome {
    Accepted(Bytes),
    Rejected(ErrPacket),
}

/// Runs the client-facing and backend-facing handshakes of a session
#[derive(Debug, Clone)]
pub struct Authenticator {
    capability: u32,
    server_version: String,
    session_token: Option<String>,
}

impl Authenticator {
    pub fn new(capability: u32, server_version: impl Into<String>, session_token: Option<String>) -> Self {
        Self {
            capability: capability & !CLIENT_SSL,
            server_version: server_version.into(),
            session_token,
        }
    }

    /// Authenticate the client through a backend channel obtained from `provider`.
    ///
    /// The backend greeting is read first so the client is only offered
    /// capabilities the backend shares; both sides of the session then frame
    /// packets the same way. The session is only written once the backend
    /// accepted the client.
    pub async fn handshake_first_time(
        &self,
        session: &mut Session,
        client: &mut PacketIo,
        provider: &dyn BackendChannelProvider,
        frontend_tls: Option<Arc<ServerConfig>>,
        backend_tls: Option<Arc<ClientConfig>>,
    ) -> Result<PacketIo> {
        client.reset_sequence();
        let mut backend = match provider.backend_channel().await {
            Ok(backend) => backend,
            Err(e) => {
                reject_client(client, 1105, "HY000", "No backend available").await;
                return Err(e);
            }
        };
        let backend_greeting = read_backend_greeting(&mut backend, Some(&mut *client)).await?;

        let shared = self.capability & backend_greeting.capability_flags;
        if shared & CLIENT_PROTOCOL_41 == 0 {
            reject_client(client, 1105, "HY000", "Backend protocol is not supported").await;
            return Err(ProxyError::Auth(format!(
                "backend {} does not support CLIENT_PROTOCOL_41",
                backend.peer_addr()
            )));
        }
        let offered = if frontend_tls.is_some() {
            shared | CLIENT_SSL
        } else {
            shared
        };

        let greeting = InitialHandshake::with_salt(
            session.connection_id as u32,
            session.salt(),
            offered,
            &self.server_version,
        );
        client.write_packet(greeting.encode()).await?;
        client.flush().await?;

        let mut payload = client.read_packet().await?;
        if is_ssl_request(&payload) {
            let Some(config) = frontend_tls else {
                return Err(ProxyError::Auth("client requested TLS but none is configured".into()));
            };
            client.upgrade_to_server_tls(config).await?;
            payload = client.read_packet().await?;
        }

        let Some(response) = HandshakeResponse::parse(&payload) else {
            reject_client(client, 1043, "08S01", "Bad handshake").await;
            return Err(ProxyError::Auth("malformed handshake response".into()));
        };
        for (flag, name) in [
            (CLIENT_PROTOCOL_41, "CLIENT_PROTOCOL_41"),
            (CLIENT_PLUGIN_AUTH, "CLIENT_PLUGIN_AUTH"),
        ] {
            if response.capability_flags & flag == 0 {
                reject_client(client, 1043, "08S01", "Bad handshake").await;
                return Err(ProxyError::Auth(format!("client does not support {name}")));
            }
        }

        let capability = response.capability_flags & shared;
        let link_capability =
            start_backend_tls(&mut backend, &backend_greeting, capability, response.character_set, backend_tls)
                .await?;

        let forwarded = HandshakeResponse {
            capability_flags: link_capability,
            max_packet_size: response.max_packet_size,
            character_set: response.character_set,
            username: response.username.clone(),
            auth_response: Vec::new(),
            database: response.database.clone(),
            auth_plugin_name: UNKNOWN_AUTH_PLUGIN.to_string(),
            connect_attrs: response.connect_attrs.clone(),
        };
        backend.write_packet(forwarded.encode()).await?;
        backend.flush().await?;

        match relay_auth_exchange(client, &mut backend, capability).await? {
            AuthOutcome::Accepted(_) => {}
            AuthOutcome::Rejected(err) => {
                warn!(
                    connection_id = session.connection_id,
                    user = %response.username,
                    code = err.error_code,
                    "Backend rejected client"
                );
                return Err(ProxyError::Auth(err.error_message));
            }
        }

        session.capability = capability;
        session.collation = response.character_set;
        session.user = response.username;
        session.database = response.database;
        session.attrs = response.connect_attrs;
        session.establish_token(self.session_token.as_deref());

        info!(
            connection_id = session.connection_id,
            user = %session.user,
            backend = backend.peer_addr(),
            capability = format_args!("{:#x}", session.capability),
            "Client authenticated"
        );
        Ok(backend)
    }

    /// Authenticate the session on `backend` with its token, without the client.
    ///
    /// A challenge the token cannot answer is relayed through `client` when one
    /// is given; the caller positions the client sequence.
    pub async fn handshake_second_time(
        &self,
        session: &Session,
        mut client: Option<&mut PacketIo>,
        backend: &mut PacketIo,
        backend_tls: Option<Arc<ClientConfig>>,
        token: &str,
    ) -> Result<()> {
        let greeting = read_backend_greeting(backend, None).await?;

        let missing = session.capability & !CLIENT_SSL & !greeting.capability_flags;
        if missing != 0 {
            return Err(ProxyError::Auth(format!(
                "backend {} lacks negotiated capabilities {missing:#x}",
                backend.peer_addr()
            )));
        }

        let mut capability = session.capability;
        if session.database.is_some() && greeting.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            capability |= CLIENT_CONNECT_WITH_DB;
        }
        let link_capability =
            start_backend_tls(backend, &greeting, capability, session.collation, backend_tls).await?;

        let response = HandshakeResponse {
            capability_flags: link_capability,
            max_packet_size: MAX_PACKET_SIZE as u32,
            character_set: session.collation,
            username: session.user.clone(),
            auth_response: token.as_bytes().to_vec(),
            database: session.database.clone(),
            auth_plugin_name: SESSION_TOKEN_AUTH_PLUGIN.to_string(),
            connect_attrs: session.attrs.clone(),
        };
        backend.write_packet(response.encode()).await?;
        backend.flush().await?;

        loop {
            let packet = backend.read_packet().await?;
            match packet.first() {
                Some(&OK_HEADER) => {
                    debug!(
                        connection_id = session.connection_id,
                        backend = backend.peer_addr(),
                        "Session token accepted"
                    );
                    return Ok(());
                }
                Some(&ERR_HEADER) => {
                    let message = ErrPacket::parse(&packet, session.capability)
                        .map(|err| err.error_message)
                        .unwrap_or_else(|| "malformed ERR packet".to_string());
                    return Err(ProxyError::Auth(format!(
                        "backend {} rejected session token: {message}",
                        backend.peer_addr()
                    )));
                }
                _ if packet[..] == FAST_AUTH_OK => continue,
                _ => {
                    let Some(client) = client.as_deref_mut() else {
                        return Err(ProxyError::Auth(format!(
                            "backend {} requested an auth challenge during redirect",
                            backend.peer_addr()
                        )));
                    };
                    client.write_packet(packet).await?;
                    client.flush().await?;
                    let reply = client.read_packet().await?;
                    backend.write_packet(reply).await?;
                    backend.flush().await?;
                }
            }
        }
    }
}

/// Relay auth packets between client and backend until the backend decides
pub(crate) async fn relay_auth_exchange(
    client: &mut PacketIo,
    backend: &mut PacketIo,
    capability: u32,
) -> Result<AuthOutcome> {
    loop {
        let packet = backend.read_packet().await?;
        client.write_packet(packet.clone()).await?;
        client.flush().await?;

        match packet.first() {
            Some(&OK_HEADER) => return Ok(AuthOutcome::Accepted(packet)),
            Some(&ERR_HEADER) => {
                let err = ErrPacket::parse(&packet, capability).ok_or_else(|| {
                    ProxyError::Protocol("malformed ERR packet during authentication".into())
                })?;
                return Ok(AuthOutcome::Rejected(err));
            }
            None => {
                return Err(ProxyError::Protocol("empty packet during authentication".into()));
            }
            _ if is_auth_more_data(&packet) && packet[..] == FAST_AUTH_OK => continue,
            _ => {
                let reply = client.read_packet().await?;
                backend.write_packet(reply).await?;
                backend.flush().await?;
            }
        }
    }
}

/// Read the backend greeting; an ERR in its place is relayed to `client` if given
async fn read_backend_greeting(
    backend: &mut PacketIo,
    client: Option<&mut PacketIo>,
) -> Result<InitialHandshake> {
    let payload = backend.read_packet().await?;
    if payload.first() == Some(&ERR_HEADER) {
        let message = ErrPacket::parse(&payload, CLIENT_PROTOCOL_41)
            .map(|err| err.error_message)
            .unwrap_or_default();
        if let Some(client) = client {
            client.write_packet(payload).await?;
            client.flush().await?;
        }
        return Err(ProxyError::Auth(format!(
            "backend {} refused connection: {message}",
            backend.peer_addr()
        )));
    }

    InitialHandshake::parse(&payload).ok_or_else(|| {
        ProxyError::Auth(format!("malformed handshake from backend {}", backend.peer_addr()))
    })
}

/// Upgrade the backend link when TLS is configured; returns the link capability
async fn start_backend_tls(
    backend: &mut PacketIo,
    greeting: &InitialHandshake,
    capability: u32,
    character_set: u8,
    backend_tls: Option<Arc<ClientConfig>>,
) -> Result<u32> {
    let Some(config) = backend_tls else {
        return Ok(capability);
    };
    if greeting.capability_flags & CLIENT_SSL == 0 {
        return Err(ProxyError::Auth(format!(
            "backend {} does not support TLS",
            backend.peer_addr()
        )));
    }

    let link_capability = capability | CLIENT_SSL;
    let request = SslRequest {
        capability_flags: link_capability,
        max_packet_size: MAX_PACKET_SIZE as u32,
        character_set,
    };
    backend.write_packet(request.encode()).await?;
    backend.flush().await?;

    let server_name = server_name_for(backend.peer_addr())?;
    backend.upgrade_to_client_tls(config, server_name).await?;
    Ok(link_capability)
}

fn server_name_for(addr: &str) -> Result<ServerName<'static>> {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::Auth(format!("invalid TLS server name {host}: {e}")))
}

/// Best-effort ERR to a client that failed the proxy's own checks
async fn reject_client(client: &mut PacketIo, code: u16, state: &str, message: &str) {
    let err = ErrPacket::new(code, state, message);
    if client.write_packet(err.encode(CLIENT_PROTOCOL_41)).await.is_ok() {
        let _ = client.flush().await;
    }
}
