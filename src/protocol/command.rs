use bytes::Bytes;

use super::packet::{capabilities::CLIENT_SECURE_CONNECTION, Command};

/// Parsed command from client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Query(String),
    InitDb(String),
    Quit,
    Ping,
    ChangeUser {
        user: String,
        database: Option<String>,
        collation: Option<u8>,
    },
    Other(Command),
}

impl ClientCommand {
    /// Parse command from packet payload
    pub fn parse(payload: &Bytes, capabilities: u32) -> Self {
        let Some(&first) = payload.first() else {
            return ClientCommand::Other(Command::Unknown);
        };

        let data = &payload[1..];

        match Command::from(first) {
            Command::Query => ClientCommand::Query(String::from_utf8_lossy(data).to_string()),
            Command::InitDb => ClientCommand::InitDb(String::from_utf8_lossy(data).to_string()),
            Command::Quit => ClientCommand::Quit,
            Command::Ping => ClientCommand::Ping,
            Command::ChangeUser => parse_change_user(data, capabilities)
                .unwrap_or(ClientCommand::Other(Command::ChangeUser)),
            cmd => ClientCommand::Other(cmd),
        }
    }

    /// Check if this starts a transaction
    pub fn starts_transaction(&self) -> bool {
        match self {
            ClientCommand::Query(sql) => {
                let sql_upper = sql.trim_start().to_uppercase();
                sql_upper.starts_with("BEGIN") || sql_upper.starts_with("START TRANSACTION")
            }
            _ => false,
        }
    }

    /// Database selected by `USE <db>` or `COM_INIT_DB`
    pub fn selected_database(&self) -> Option<String> {
        match self {
            ClientCommand::InitDb(db) => Some(db.trim_end_matches('\0').to_string()),
            ClientCommand::Query(sql) => use_database_target(sql),
            _ => None,
        }
    }
}

fn use_database_target(sql: &str) -> Option<String> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let keyword = parts.next()?;
    if !keyword.eq_ignore_ascii_case("USE") {
        return None;
    }
    let db = parts.next()?.trim().trim_matches('`');
    if db.is_empty() || db.contains(char::is_whitespace) {
        return None;
    }
    Some(db.to_string())
}

fn parse_change_user(mut data: &[u8], capabilities: u32) -> Option<ClientCommand> {
    let null_pos = data.iter().position(|&b| b == 0)?;
    let user = String::from_utf8_lossy(&data[..null_pos]).to_string();
    data = &data[null_pos + 1..];

    if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        let (&len, rest) = data.split_first()?;
        data = rest.get(len as usize..)?;
    } else {
        let null_pos = data.iter().position(|&b| b == 0)?;
        data = &data[null_pos + 1..];
    }

    let mut database = None;
    if !data.is_empty() {
        let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        let db = String::from_utf8_lossy(&data[..null_pos]).to_string();
        if !db.is_empty() {
            database = Some(db);
        }
        data = data.get(null_pos + 1..).unwrap_or_default();
    }

    let collation = if data.len() >= 2 { Some(data[0]) } else { None };

    Some(ClientCommand::ChangeUser {
        user,
        database,
        collation,
    })
}
