//! Wire protocol
//!
//! One command per TCP connection. Archives travel as an 8-byte big-endian
//! length followed by the raw bytes.

mod command;
mod engine;

pub use command::{
    error_line, Command, COM_CHECKIN, COM_CHECKOUT, COM_PING, COM_RELEASE, COM_STATUS,
    RESP_DOWNLOAD, RESP_ERROR, RESP_PING, RESP_SUCCESS, RESP_UPLOAD,
};
pub use engine::{ProtocolEngine, MAX_LINE_LEN};
