pub mod config;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod fec;
pub mod participant;
pub mod session;
pub mod transmit;
pub mod transport;

pub use config::{AddressFamily, SessionConfig};
pub use control::{ControlHandle, ControlMessage};
pub use error::{Result, RxtxError};
pub use fec::FecConfig;
pub use session::Session;
