#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]

mod connection;
mod level2;
pub mod rad50;
mod request;
mod status;
mod transport;
mod wire;

pub use connection::{Connection, ConnectionState, DEFAULT_REQUEST_TIMEOUT};
pub use level2::TaskInfo;
pub use request::{Reply, ReplyStream};
pub use status::{ACNET_FACILITY, Status};
