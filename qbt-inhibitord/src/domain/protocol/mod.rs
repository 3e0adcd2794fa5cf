pub mod codec;
pub mod message;

pub use codec::{
    decode_client, encode_message, looks_like_http, FrameCodec, ProtocolError, FORBIDDEN_RESPONSE,
    FRAME_DELIMITER, MAX_FRAME_LEN,
};
pub use message::{ClientMessage, ConnectionId, ServerMessage, SysCommand, VersionNotice};
