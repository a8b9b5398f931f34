pub mod codec;
pub mod command;
pub mod handshake;
pub mod io;
pub mod packet;

pub use codec::PacketCodec;
pub use command::ClientCommand;
pub use handshake::{
    compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, is_result_set_terminator,
    is_ssl_request, AuthSwitchRequest, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket,
    SslRequest,
};
pub use io::{AsyncStream, PacketIo};
pub use packet::{capabilities, status, Command, Packet};
