use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{
    capabilities::*, status, AUTH_MORE_DATA_HEADER, EOF_HEADER, ERR_HEADER, MAX_PACKET_SIZE,
    OK_HEADER,
};

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
pub const CACHING_SHA2_PLUGIN: &str = "caching_sha2_password";

/// Default collation sent by the proxy (utf8mb4_general_ci)
pub const DEFAULT_COLLATION: u8 = 0x2d;

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: [u8; 8],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Build a greeting around an existing 20-byte salt
    pub fn with_salt(
        connection_id: u32,
        salt: &[u8],
        capability_flags: u32,
        server_version: &str,
    ) -> Self {
        let mut auth_plugin_data_part1 = [0u8; 8];
        let split = salt.len().min(8);
        auth_plugin_data_part1[..split].copy_from_slice(&salt[..split]);

        Self {
            protocol_version: 10,
            server_version: server_version.to_string(),
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set: DEFAULT_COLLATION,
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_data_part2: salt[split..].to_vec(),
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        }
    }

    /// Get full auth plugin data (20 bytes)
    pub fn auth_plugin_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(&self.auth_plugin_data_part1);
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }

    /// Encode to a packet payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);

        // Server version (null-terminated)
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);

        buf.put_u32_le(self.connection_id);

        // Auth plugin data part 1 (8 bytes)
        buf.extend_from_slice(&self.auth_plugin_data_part1);

        // Filler
        buf.put_u8(0);

        // Capability flags (lower 2 bytes)
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);

        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);

        // Capability flags (upper 2 bytes)
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        // Auth plugin data length
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8((self.auth_plugin_data_part1.len() + self.auth_plugin_data_part2.len() + 1) as u8);
        } else {
            buf.put_u8(0);
        }

        // Reserved (10 bytes)
        buf.extend_from_slice(&[0u8; 10]);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.auth_plugin_data_part2);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        buf.freeze()
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut buf = payload;

        let protocol_version = take(&mut buf, 1)?[0];
        if protocol_version != 10 {
            return None;
        }

        let server_version = String::from_utf8_lossy(get_null_terminated(&mut buf)?).to_string();
        let connection_id = u32::from_le_bytes(take(&mut buf, 4)?.try_into().ok()?);

        let mut auth_plugin_data_part1 = [0u8; 8];
        auth_plugin_data_part1.copy_from_slice(take(&mut buf, 8)?);

        // Filler
        take(&mut buf, 1)?;

        let capability_flags_lower = u16::from_le_bytes(take(&mut buf, 2)?.try_into().ok()?) as u32;
        let character_set = take(&mut buf, 1)?[0];
        let status_flags = u16::from_le_bytes(take(&mut buf, 2)?.try_into().ok()?);
        let capability_flags_upper = u16::from_le_bytes(take(&mut buf, 2)?.try_into().ok()?) as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = take(&mut buf, 1)?[0] as usize;

        // Reserved
        take(&mut buf, 10)?;

        let mut auth_plugin_data_part2 = Vec::new();
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = auth_plugin_data_len.saturating_sub(8).max(13).min(buf.len());
            let data = take(&mut buf, len)?;
            let data_len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            auth_plugin_data_part2.extend_from_slice(&data[..data_len]);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone, Default)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
    pub connect_attrs: HashMap<String, String>,
}

impl HandshakeResponse {
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let capability_flags = u32::from_le_bytes(take(&mut buf, 4)?.try_into().ok()?);
        let max_packet_size = u32::from_le_bytes(take(&mut buf, 4)?.try_into().ok()?);
        let character_set = take(&mut buf, 1)?[0];

        // Reserved (23 bytes)
        take(&mut buf, 23)?;

        let username = String::from_utf8_lossy(get_null_terminated(&mut buf)?).to_string();

        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            get_lenenc_bytes(&mut buf)?.to_vec()
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = take(&mut buf, 1)?[0] as usize;
            take(&mut buf, len)?.to_vec()
        } else if buf.is_empty() {
            Vec::new()
        } else {
            get_null_terminated(&mut buf)
                .map(<[u8]>::to_vec)
                .unwrap_or_else(|| std::mem::take(&mut buf).to_vec())
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let db = get_null_terminated(&mut buf)
                .unwrap_or_else(|| std::mem::take(&mut buf));
            let db = String::from_utf8_lossy(db).to_string();
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let name = get_null_terminated(&mut buf)
                .unwrap_or_else(|| std::mem::take(&mut buf));
            String::from_utf8_lossy(name).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        let mut connect_attrs = HashMap::new();
        if capability_flags & CLIENT_CONNECT_ATTRS != 0 && !buf.is_empty() {
            let mut attrs = get_lenenc_bytes(&mut buf)?;
            while !attrs.is_empty() {
                let key = get_lenenc_bytes(&mut attrs)?;
                let value = get_lenenc_bytes(&mut attrs)?;
                connect_attrs.insert(
                    String::from_utf8_lossy(key).to_string(),
                    String::from_utf8_lossy(value).to_string(),
                );
            }
        }

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
            connect_attrs,
        })
    }

    /// Encode to a packet payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);

        // Reserved (23 bytes)
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            encode_length_encoded_bytes(&mut buf, &self.auth_response);
        } else if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = self.auth_response.len().min(u8::MAX as usize);
            buf.put_u8(len as u8);
            buf.extend_from_slice(&self.auth_response[..len]);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = BytesMut::new();
            for (key, value) in &self.connect_attrs {
                encode_length_encoded_bytes(&mut attrs, key.as_bytes());
                encode_length_encoded_bytes(&mut attrs, value.as_bytes());
            }
            encode_length_encoded_bytes(&mut buf, &attrs);
        }

        buf.freeze()
    }
}

/// SSL upgrade request: the first 32 bytes of a handshake response
#[derive(Debug, Clone)]
pub struct SslRequest {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
}

impl SslRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32_le(self.capability_flags | CLIENT_SSL);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);
        buf.freeze()
    }
}

/// Check whether a handshake response is a truncated SSL request
pub fn is_ssl_request(payload: &[u8]) -> bool {
    payload.len() == 32
        && u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) & CLIENT_SSL != 0
}

/// Auth switch request (server -> client, header 0xFE during authentication)
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn new(plugin_name: &str, plugin_data: &[u8]) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            plugin_data: plugin_data.to_vec(),
        }
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        let (&header, mut buf) = payload.split_first()?;
        if header != EOF_HEADER {
            return None;
        }
        let plugin_name = String::from_utf8_lossy(get_null_terminated(&mut buf)?).to_string();
        let data = buf.strip_suffix(&[0]).unwrap_or(buf);
        Some(Self {
            plugin_name,
            plugin_data: data.to_vec(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(EOF_HEADER);
        buf.extend_from_slice(self.plugin_name.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(&self.plugin_data);
        buf.put_u8(0);
        buf.freeze()
    }
}

/// Compute mysql_native_password auth response
pub fn compute_auth_response(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let hash1 = hasher.finalize();

    // SHA1(SHA1(password))
    let mut hasher = Sha1::new();
    hasher.update(hash1);
    let hash2 = hasher.finalize();

    // SHA1(auth_data + SHA1(SHA1(password)))
    let mut hasher = Sha1::new();
    hasher.update(auth_data);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    // XOR SHA1(password) with SHA1(auth_data + SHA1(SHA1(password)))
    hash1
        .iter()
        .zip(hash3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// OK packet
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
        }
    }

    pub fn encode(&self, capabilities: u32) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u8(OK_HEADER);
        encode_length_encoded_int(&mut buf, self.affected_rows);
        encode_length_encoded_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        } else if capabilities & CLIENT_TRANSACTIONS != 0 {
            buf.put_u16_le(self.status_flags);
        }

        buf.freeze()
    }

    /// Parse an OK packet; also accepts the 0xFE-headed OK that ends result
    /// sets when `CLIENT_DEPRECATE_EOF` is negotiated.
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        let (&header, mut buf) = payload.split_first()?;
        if header != OK_HEADER && header != EOF_HEADER {
            return None;
        }

        let affected_rows = get_lenenc_int(&mut buf)?;
        let last_insert_id = get_lenenc_int(&mut buf)?;

        let (status_flags, warnings) = if capabilities & CLIENT_PROTOCOL_41 != 0 && buf.len() >= 4 {
            (
                u16::from_le_bytes([buf[0], buf[1]]),
                u16::from_le_bytes([buf[2], buf[3]]),
            )
        } else if buf.len() >= 2 {
            (u16::from_le_bytes([buf[0], buf[1]]), 0)
        } else {
            (0, 0)
        };

        Some(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
        })
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode(&self, capabilities: u32) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        buf.freeze()
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        if payload.len() < 3 || payload[0] != ERR_HEADER {
            return None;
        }

        let error_code = u16::from_le_bytes([payload[1], payload[2]]);
        let buf = &payload[3..];

        let (sql_state, error_message) =
            if capabilities & CLIENT_PROTOCOL_41 != 0 && buf.len() >= 6 && buf[0] == b'#' {
                (
                    String::from_utf8_lossy(&buf[1..6]).to_string(),
                    String::from_utf8_lossy(&buf[6..]).to_string(),
                )
            } else {
                ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
            };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// Encode a length-encoded integer
pub fn encode_length_encoded_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Encode a length-encoded string
pub fn encode_length_encoded_bytes(buf: &mut BytesMut, value: &[u8]) {
    encode_length_encoded_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Read a length-encoded integer, advancing the buffer
pub fn get_lenenc_int(buf: &mut &[u8]) -> Option<u64> {
    let (&first, rest) = buf.split_first()?;
    let (value, used) = match first {
        0x00..=0xFA => (first as u64, 0),
        0xFC if rest.len() >= 2 => (u16::from_le_bytes([rest[0], rest[1]]) as u64, 2),
        0xFD if rest.len() >= 3 => (u32::from_le_bytes([rest[0], rest[1], rest[2], 0]) as u64, 3),
        0xFE if rest.len() >= 8 => (u64::from_le_bytes(rest[..8].try_into().ok()?), 8),
        _ => return None,
    };
    *buf = &rest[used..];
    Some(value)
}

/// Read a length-encoded string, advancing the buffer
pub fn get_lenenc_bytes<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let mut rest = *buf;
    let len = usize::try_from(get_lenenc_int(&mut rest)?).ok()?;
    let value = take(&mut rest, len)?;
    *buf = rest;
    Some(value)
}

fn get_null_terminated<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let null_pos = buf.iter().position(|&b| b == 0)?;
    let value = &buf[..null_pos];
    *buf = &buf[null_pos + 1..];
    Some(value)
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
    if buf.len() < len {
        return None;
    }
    let (value, rest) = buf.split_at(len);
    *buf = rest;
    Some(value)
}

/// Check if packet is OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

/// Check if packet is ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

/// Check if packet is a classic EOF packet
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

/// Check if packet is an auth-more-data packet
pub fn is_auth_more_data(payload: &[u8]) -> bool {
    payload.first() == Some(&AUTH_MORE_DATA_HEADER)
}

/// Check if packet ends a row stream: an EOF packet, or the 0xFE-headed OK
/// packet used instead when `CLIENT_DEPRECATE_EOF` is negotiated.
pub fn is_result_set_terminator(payload: &[u8], capabilities: u32) -> bool {
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        payload.first() == Some(&EOF_HEADER) && payload.len() < MAX_PACKET_SIZE
    } else {
        is_eof_packet(payload)
    }
}

/// Server status carried by an OK, EOF or result set terminator packet
pub fn response_status(payload: &[u8], capabilities: u32) -> Option<u16> {
    if is_eof_packet(payload) && capabilities & CLIENT_DEPRECATE_EOF == 0 {
        if payload.len() >= 5 {
            return Some(u16::from_le_bytes([payload[3], payload[4]]));
        }
        return None;
    }
    OkPacket::parse(payload, capabilities).map(|ok| ok.status_flags)
}
