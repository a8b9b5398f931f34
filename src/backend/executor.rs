use std::collections::HashSet;

use bytes::Bytes;
use tracing::debug;

use super::authenticator::{relay_auth_exchange, AuthOutcome};
use crate::error::{ProxyError, Result};
use crate::protocol::handshake::{get_lenenc_int, response_status};
use crate::protocol::packet::{ERR_HEADER, LOCAL_INFILE_HEADER, OK_HEADER};
use crate::protocol::{
    capabilities::*, is_err_packet, is_result_set_terminator, status::*, ClientCommand, Command,
    ErrPacket, OkPacket, PacketIo,
};

/// Forwards client commands to the current backend and relays the responses
#[derive(Debug, Default)]
pub struct CmdExecutor {
    capability: u32,
    server_status: u16,
    prepared_stmts: HashSet<u32>,
}

impl CmdExecutor {
    pub fn new(capability: u32) -> Self {
        Self {
            capability,
            server_status: SERVER_STATUS_AUTOCOMMIT,
            prepared_stmts: HashSet::new(),
        }
    }

    /// Refresh the cached capability after a handshake
    pub fn set_capability(&mut self, capability: u32) {
        self.capability = capability;
    }

    pub fn capability(&self) -> u32 {
        self.capability
    }

    /// Server status of the last response
    pub fn server_status(&self) -> u16 {
        self.server_status
    }

    pub fn in_transaction(&self) -> bool {
        self.server_status & SERVER_STATUS_IN_TRANS != 0
    }

    pub fn prepared_statements(&self) -> usize {
        self.prepared_stmts.len()
    }

    /// Why the session cannot move to another backend right now
    pub fn redirect_blocker(&self) -> Option<&'static str> {
        if self.in_transaction() {
            Some("transaction in progress")
        } else if !self.prepared_stmts.is_empty() {
            Some("prepared statements are open")
        } else {
            None
        }
    }

    pub fn can_redirect(&self) -> bool {
        self.redirect_blocker().is_none()
    }

    /// Whether `request` may wait for a pending redirect instead of running now
    pub fn is_deferrable(&self, request: &Bytes) -> bool {
        if self.in_transaction() {
            return false;
        }
        let Some(&first) = request.first() else {
            return false;
        };
        match Command::from(first) {
            Command::Query => !ClientCommand::parse(request, self.capability).starts_transaction(),
            Command::InitDb
            | Command::Ping
            | Command::FieldList
            | Command::Statistics
            | Command::StmtPrepare
            | Command::SetOption
            | Command::ResetConnection
            | Command::ProcessInfo
            | Command::Refresh
            | Command::Debug
            | Command::CreateDb
            | Command::DropDb
            | Command::ProcessKill => true,
            _ => false,
        }
    }

    /// Execute one command; returns `true` when it was held for a pending redirect.
    ///
    /// A backend ERR is relayed to the client and returned as
    /// [`ProxyError::Execution`].
    pub async fn execute_cmd(
        &mut self,
        request: &Bytes,
        client: &mut PacketIo,
        backend: &mut PacketIo,
        wait_for_redirect: bool,
    ) -> Result<bool> {
        let Some(&first) = request.first() else {
            return Err(ProxyError::Protocol("empty command packet".into()));
        };
        let cmd = Command::from(first);

        if wait_for_redirect && self.is_deferrable(request) {
            debug!(command = ?cmd, "Holding command until redirect completes");
            return Ok(true);
        }

        client.set_sequence(1);

        if cmd == Command::Quit {
            return Ok(false);
        }
        if is_unsupported(cmd) {
            let err = ErrPacket::new(1047, "08S01", "Unknown command");
            client.write_packet(err.encode(self.capability)).await?;
            client.flush().await?;
            return Err(ProxyError::Execution(err));
        }

        backend.reset_sequence();
        backend.write_packet(request.clone()).await?;
        backend.flush().await?;

        let result = match cmd {
            Command::Query | Command::StmtExecute => self.forward_query_result(client, backend).await,
            Command::StmtPrepare => self.forward_prepare(client, backend).await,
            Command::StmtFetch | Command::FieldList => self.forward_rows(client, backend).await.map(|_| ()),
            Command::StmtClose => {
                if let Some(id) = statement_id(request) {
                    self.prepared_stmts.remove(&id);
                }
                Ok(())
            }
            Command::StmtSendLongData => Ok(()),
            Command::ChangeUser => self.forward_change_user(client, backend).await,
            Command::ResetConnection => {
                let result = self.forward_single(client, backend).await;
                if result.is_ok() {
                    self.prepared_stmts.clear();
                }
                result
            }
            _ => self.forward_single(client, backend).await,
        };

        let flushed = client.flush().await;
        result?;
        flushed?;
        Ok(false)
    }

    /// Text and binary result sets, including multi-results and LOCAL INFILE
    async fn forward_query_result(&mut self, client: &mut PacketIo, backend: &mut PacketIo) -> Result<()> {
        loop {
            let packet = backend.read_packet().await?;
            let status = match packet.first() {
                None => return Err(ProxyError::Protocol("empty response packet".into())),
                Some(&OK_HEADER) => {
                    let status = self.observe_ok(&packet)?;
                    client.write_packet(packet).await?;
                    status
                }
                Some(&ERR_HEADER) => return self.relay_error(client, packet).await,
                Some(&LOCAL_INFILE_HEADER) => {
                    client.write_packet(packet).await?;
                    client.flush().await?;
                    relay_local_infile(client, backend).await?;
                    continue;
                }
                Some(_) => {
                    let mut buf = &packet[..];
                    let columns = get_lenenc_int(&mut buf)
                        .ok_or_else(|| ProxyError::Protocol("malformed column count".into()))?;
                    client.write_packet(packet).await?;
                    self.forward_result_set(columns, client, backend).await?
                }
            };

            if status & SERVER_MORE_RESULTS_EXISTS == 0 {
                return Ok(());
            }
        }
    }

    async fn forward_result_set(
        &mut self,
        columns: u64,
        client: &mut PacketIo,
        backend: &mut PacketIo,
    ) -> Result<u16> {
        for _ in 0..columns {
            let column = backend.read_packet().await?;
            client.write_packet(column).await?;
        }

        if self.capability & CLIENT_DEPRECATE_EOF == 0 {
            let eof = backend.read_packet().await?;
            if is_err_packet(&eof) {
                return self.relay_error(client, eof).await;
            }
            let status = response_status(&eof, self.capability)
                .ok_or_else(|| ProxyError::Protocol("expected EOF after column definitions".into()))?;
            client.write_packet(eof).await?;
            // cursor open: rows come later through COM_STMT_FETCH
            if status & SERVER_STATUS_CURSOR_EXISTS != 0 {
                self.server_status = status;
                return Ok(status);
            }
        }

        self.forward_rows(client, backend).await
    }

    /// Relay packets up to and including the terminator; returns its status
    async fn forward_rows(&mut self, client: &mut PacketIo, backend: &mut PacketIo) -> Result<u16> {
        loop {
            let packet = backend.read_packet().await?;
            if is_err_packet(&packet) {
                return self.relay_error(client, packet).await;
            }
            if is_result_set_terminator(&packet, self.capability) {
                let status = response_status(&packet, self.capability)
                    .ok_or_else(|| ProxyError::Protocol("malformed result set terminator".into()))?;
                self.server_status = status;
                client.write_packet(packet).await?;
                return Ok(status);
            }
            client.write_packet(packet).await?;
        }
    }

    async fn forward_prepare(&mut self, client: &mut PacketIo, backend: &mut PacketIo) -> Result<()> {
        let packet = backend.read_packet().await?;
        if is_err_packet(&packet) {
            return self.relay_error(client, packet).await;
        }
        if packet.len() < 9 || packet[0] != OK_HEADER {
            return Err(ProxyError::Protocol("malformed COM_STMT_PREPARE response".into()));
        }

        let stmt_id = u32::from_le_bytes([packet[1], packet[2], packet[3], packet[4]]);
        let num_columns = u16::from_le_bytes([packet[5], packet[6]]);
        let num_params = u16::from_le_bytes([packet[7], packet[8]]);
        client.write_packet(packet).await?;

        for count in [num_params, num_columns] {
            if count == 0 {
                continue;
            }
            for _ in 0..count {
                let definition = backend.read_packet().await?;
                client.write_packet(definition).await?;
            }
            if self.capability & CLIENT_DEPRECATE_EOF == 0 {
                let eof = backend.read_packet().await?;
                client.write_packet(eof).await?;
            }
        }

        self.prepared_stmts.insert(stmt_id);
        debug!(stmt_id, num_params, num_columns, "Statement prepared");
        Ok(())
    }

    async fn forward_change_user(&mut self, client: &mut PacketIo, backend: &mut PacketIo) -> Result<()> {
        match relay_auth_exchange(client, backend, self.capability).await? {
            AuthOutcome::Accepted(ok) => {
                self.observe_ok(&ok)?;
                self.prepared_stmts.clear();
                Ok(())
            }
            AuthOutcome::Rejected(err) => Err(ProxyError::Execution(err)),
        }
    }

    async fn forward_single(&mut self, client: &mut PacketIo, backend: &mut PacketIo) -> Result<()> {
        let packet = backend.read_packet().await?;
        match packet.first() {
            Some(&ERR_HEADER) => self.relay_error(client, packet).await,
            Some(&OK_HEADER) => {
                self.observe_ok(&packet)?;
                client.write_packet(packet).await?;
                Ok(())
            }
            // COM_STATISTICS answers with a bare string
            _ => {
                client.write_packet(packet).await?;
                Ok(())
            }
        }
    }

    fn observe_ok(&mut self, packet: &Bytes) -> Result<u16> {
        let ok = OkPacket::parse(packet, self.capability)
            .ok_or_else(|| ProxyError::Protocol("malformed OK packet".into()))?;
        self.server_status = ok.status_flags;
        Ok(ok.status_flags)
    }

    /// Relay a backend ERR and surface it as an execution error
    async fn relay_error<T>(&mut self, client: &mut PacketIo, packet: Bytes) -> Result<T> {
        let err = ErrPacket::parse(&packet, self.capability)
            .ok_or_else(|| ProxyError::Protocol("malformed ERR packet".into()))?;
        client.write_packet(packet).await?;
        client.flush().await?;
        Err(ProxyError::Execution(err))
    }
}

/// Replication and obsolete commands are answered locally
fn is_unsupported(cmd: Command) -> bool {
    matches!(
        cmd,
        Command::Sleep
            | Command::Connect
            | Command::Time
            | Command::DelayedInsert
            | Command::TableDump
            | Command::ConnectOut
            | Command::RegisterSlave
            | Command::BinlogDump
            | Command::BinlogDumpGtid
            | Command::Daemon
            | Command::Unknown
    )
}

fn statement_id(request: &Bytes) -> Option<u32> {
    let id = request.get(1..5)?;
    Some(u32::from_le_bytes([id[0], id[1], id[2], id[3]]))
}

/// Stream the client's file contents until the empty packet that ends them
async fn relay_local_infile(client: &mut PacketIo, backend: &mut PacketIo) -> Result<()> {
    loop {
        let data = client.read_packet().await?;
        let done = data.is_empty();
        backend.write_packet(data).await?;
        if done {
            backend.flush().await?;
            return Ok(());
        }
    }
}
