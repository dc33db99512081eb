//! Minimal IPMI-over-LAN listener
//!
//! This crate implements just enough of IPMI v1.5 over RMCP to emulate a
//! BMC for power and boot-device control:
//!
//! - Session establishment (channel auth capabilities, challenge,
//!   activate, privilege level, close) with straight-password and MD5
//!   authentication
//! - Chassis status, chassis control and system boot options, dispatched to
//!   a [`ChassisHandler`]
//! - Get Device ID and Cold Reset
//!
//! RMCP+ (IPMI v2.0) is not supported; such packets are dropped.
//!
//! # Example
//!
//! ```ignore
//! use ovirtbmc_ipmi::{bind_udp, Credentials, IpmiServer};
//!
//! let socket = bind_udp("[::]:6230".parse()?)?;
//! let server = IpmiServer::new(socket, Credentials::new("admin", "password")?, handler);
//! let exit = server.run(shutdown_rx).await?;
//! ```

pub mod auth;
pub mod error;
pub mod packet;
pub mod server;
pub mod session;

pub use auth::Credentials;
pub use error::{IpmiError, Result};
pub use packet::{AuthType, CompletionCode, IpmiMessage, LanPacket, Privilege, SessionHeader};
pub use server::{
    bind_udp, BootSelector, ChassisControl, ChassisHandler, CommandResult, IpmiServer, ServerExit,
};
