//! IPMI LAN listener
//!
//! One [`IpmiServer`] serves one UDP socket. It handles session
//! establishment itself and hands chassis and boot commands to a
//! [`ChassisHandler`]. Datagrams are processed strictly one at a time: the
//! listener awaits the handler and sends the response before it reads the
//! next datagram.

use crate::auth::{self, Credentials};
use crate::error::{IpmiError, Result};
use crate::packet::{
    cmd, netfn, AuthType, CompletionCode, IpmiMessage, LanPacket, Privilege, SessionHeader,
};
use crate::session::{ActivateError, SessionTable, DEFAULT_IDLE_TIMEOUT};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Result of a chassis callback; the error is sent back as-is
pub type CommandResult<T = ()> = std::result::Result<T, CompletionCode>;

/// Boot device selector of the boot flags parameter (bits 5:2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSelector {
    NoOverride,
    Pxe,
    Disk,
    DiskSafeMode,
    Diagnostic,
    Cdrom,
    BiosSetup,
    RemoteFloppy,
    RemoteCdrom,
    RemoteDisk,
    Floppy,
}

impl BootSelector {
    /// Decode the 4-bit selector
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x0f {
            0x0 => Some(BootSelector::NoOverride),
            0x1 => Some(BootSelector::Pxe),
            0x2 => Some(BootSelector::Disk),
            0x3 => Some(BootSelector::DiskSafeMode),
            0x4 => Some(BootSelector::Diagnostic),
            0x5 => Some(BootSelector::Cdrom),
            0x6 => Some(BootSelector::BiosSetup),
            0x7 => Some(BootSelector::RemoteFloppy),
            0x8 => Some(BootSelector::RemoteCdrom),
            0xb => Some(BootSelector::RemoteDisk),
            0xf => Some(BootSelector::Floppy),
            _ => None,
        }
    }

    /// Encode as the 4-bit selector
    pub fn bits(self) -> u8 {
        match self {
            BootSelector::NoOverride => 0x0,
            BootSelector::Pxe => 0x1,
            BootSelector::Disk => 0x2,
            BootSelector::DiskSafeMode => 0x3,
            BootSelector::Diagnostic => 0x4,
            BootSelector::Cdrom => 0x5,
            BootSelector::BiosSetup => 0x6,
            BootSelector::RemoteFloppy => 0x7,
            BootSelector::RemoteCdrom => 0x8,
            BootSelector::RemoteDisk => 0xb,
            BootSelector::Floppy => 0xf,
        }
    }
}

/// Chassis Control directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChassisControl {
    PowerDown,
    PowerUp,
    PowerCycle,
    HardReset,
    DiagnosticInterrupt,
    SoftShutdown,
}

impl TryFrom<u8> for ChassisControl {
    type Error = CompletionCode;

    fn try_from(value: u8) -> CommandResult<Self> {
        match value & 0x0f {
            0 => Ok(ChassisControl::PowerDown),
            1 => Ok(ChassisControl::PowerUp),
            2 => Ok(ChassisControl::PowerCycle),
            3 => Ok(ChassisControl::HardReset),
            4 => Ok(ChassisControl::DiagnosticInterrupt),
            5 => Ok(ChassisControl::SoftShutdown),
            _ => Err(CompletionCode::INVALID_DATA_FIELD),
        }
    }
}

/// Callbacks invoked for chassis and boot commands
#[async_trait]
pub trait ChassisHandler: Send + Sync {
    /// Whether the chassis is powered on
    async fn get_power_state(&self) -> CommandResult<bool>;

    async fn power_on(&self) -> CommandResult;

    async fn power_off(&self) -> CommandResult;

    async fn power_cycle(&self) -> CommandResult;

    /// Hard reset
    async fn power_reset(&self) -> CommandResult;

    /// Soft (ACPI) shutdown
    async fn power_shutdown(&self) -> CommandResult;

    /// BMC cold reset; on success the listener replies and stops
    async fn cold_reset(&self) -> CommandResult;

    async fn get_boot_device(&self) -> CommandResult<BootSelector>;

    async fn set_boot_device(&self, device: BootSelector) -> CommandResult;
}

/// Why a listener stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// Shutdown was requested
    Shutdown,
    /// A remote caller issued Cold Reset
    ColdReset,
}

/// Boot options parameter selectors
const BOOT_PARAM_SET_IN_PROGRESS: u8 = 0;
const BOOT_PARAM_SERVICE_PARTITION_SCAN: u8 = 3;
const BOOT_PARAM_BOOT_INFO_ACK: u8 = 4;
const BOOT_PARAM_BOOT_FLAGS: u8 = 5;

/// Command-specific completion codes of the session commands
const CC_INVALID_USERNAME: CompletionCode = CompletionCode(0x81);
const CC_NO_SESSION_SLOT: CompletionCode = CompletionCode(0x81);
const CC_PRIVILEGE_EXCEEDS_LIMIT: CompletionCode = CompletionCode(0x81);

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 1024;

/// Create a UDP socket bound to `addr`
///
/// IPv6 sockets are dual-stack so `::ffff:a.b.c.d` and `::` also accept
/// IPv4 traffic.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let bind_failed = |e| IpmiError::BindFailed { addr, source: e };

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(bind_failed)?;

    if addr.is_ipv6() {
        socket.set_only_v6(false).map_err(bind_failed)?;
    }

    // Allow quick restarts
    socket.set_reuse_address(true).ok();

    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket.set_nonblocking(true).map_err(bind_failed)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_failed)
}

/// Outcome of handling one datagram
struct Reply {
    packet: Bytes,
    stop: Option<ServerExit>,
}

/// IPMI-over-LAN listener for one emulated BMC
pub struct IpmiServer {
    socket: UdpSocket,
    credentials: Credentials,
    handler: Arc<dyn ChassisHandler>,
    sessions: SessionTable,
}

impl IpmiServer {
    /// Create a listener on an already bound socket
    pub fn new(socket: UdpSocket, credentials: Credentials, handler: Arc<dyn ChassisHandler>) -> Self {
        Self {
            socket,
            credentials,
            handler,
            sessions: SessionTable::new(DEFAULT_IDLE_TIMEOUT),
        }
    }

    /// Override the session idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.sessions = SessionTable::new(timeout);
        self
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until shutdown is signalled or a cold reset is accepted
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<ServerExit> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            if *shutdown.borrow() {
                return Ok(ServerExit::Shutdown);
            }

            let (len, src) = tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port-unreachable from a previous reply surfaces here on some platforms
                        debug!(error = %e, "Error receiving datagram");
                        continue;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(ServerExit::Shutdown);
                    }
                    continue;
                }
            };

            let reply = match self.handle_datagram(&buf[..len], src).await {
                Some(reply) => reply,
                None => continue,
            };

            if let Err(e) = self.socket.send_to(&reply.packet, src).await {
                warn!(peer = %src, error = %e, "Failed to send IPMI response");
            }

            if let Some(exit) = reply.stop {
                return Ok(exit);
            }
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], src: SocketAddr) -> Option<Reply> {
        let packet = match LanPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(peer = %src, error = %e, "Dropping malformed packet");
                return None;
            }
        };
        let request = match IpmiMessage::parse(&packet.message) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %src, error = %e, "Dropping malformed message");
                return None;
            }
        };
        if request.is_response() {
            debug!(peer = %src, "Dropping unsolicited response");
            return None;
        }

        let now = Instant::now();
        self.sessions.expire(now);

        debug!(
            peer = %src,
            netfn = request.netfn,
            cmd = format_args!("{:#04x}", request.command),
            session_id = packet.session.session_id,
            "Received IPMI request"
        );

        if packet.session.session_id == 0 {
            return self.handle_sessionless(&packet, &request, now);
        }
        if request.netfn == netfn::APP && request.command == cmd::ACTIVATE_SESSION {
            return self.handle_activate(&packet, &request, src, now);
        }
        self.handle_in_session(&packet, &request, src, now).await
    }

    fn handle_sessionless(
        &mut self,
        packet: &LanPacket,
        request: &IpmiMessage,
        now: Instant,
    ) -> Option<Reply> {
        if packet.session.auth_type != AuthType::None || request.netfn != netfn::APP {
            return None;
        }

        let (code, data) = match request.command {
            cmd::GET_CHANNEL_AUTH_CAPABILITIES => self.channel_auth_capabilities(request),
            cmd::GET_SESSION_CHALLENGE => self.session_challenge(request, now),
            _ => {
                debug!(cmd = request.command, "Dropping sessionless command");
                return None;
            }
        };

        let response = request.reply(code, &data).encode();
        Some(Reply {
            packet: LanPacket::new(SessionHeader::sessionless(), response).encode(),
            stop: None,
        })
    }

    fn channel_auth_capabilities(&self, request: &IpmiMessage) -> (CompletionCode, Vec<u8>) {
        if request.data.len() < 2 {
            return (CompletionCode::REQUEST_DATA_LENGTH_INVALID, Vec::new());
        }

        let auth_support = AuthType::Md5.support_bit() | AuthType::Password.support_bit();
        let data = vec![
            0x01,         // channel number
            auth_support, // supported auth types
            0x04,         // non-null usernames, per-message auth on
            0x00,         // no IPMI v2.0 extended capabilities
            0x00, 0x00, 0x00, // OEM id
            0x00,         // OEM auxiliary data
        ];
        (CompletionCode::NORMAL, data)
    }

    fn session_challenge(&mut self, request: &IpmiMessage, now: Instant) -> (CompletionCode, Vec<u8>) {
        if request.data.len() < 17 {
            return (CompletionCode::REQUEST_DATA_LENGTH_INVALID, Vec::new());
        }
        match AuthType::try_from(request.data[0]) {
            Ok(AuthType::Md5) | Ok(AuthType::Password) => {}
            _ => return (CompletionCode::INVALID_DATA_FIELD, Vec::new()),
        }
        if !self.credentials.username_matches(&request.data[1..17]) {
            debug!("Session challenge for unknown user");
            return (CC_INVALID_USERNAME, Vec::new());
        }

        let (temp_id, challenge) = self.sessions.issue_challenge(now);
        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(&temp_id.to_le_bytes());
        data.extend_from_slice(&challenge);
        (CompletionCode::NORMAL, data)
    }

    fn handle_activate(
        &mut self,
        packet: &LanPacket,
        request: &IpmiMessage,
        src: SocketAddr,
        now: Instant,
    ) -> Option<Reply> {
        let header = &packet.session;
        if !self.sessions.has_challenge(header.session_id) {
            debug!(peer = %src, "Activate Session without challenge");
            return None;
        }
        if !self.authenticated(header, &packet.message) {
            debug!(peer = %src, "Activate Session failed authentication");
            return None;
        }

        let mut data = request.data.clone();
        if data.remaining() < 22 {
            return Some(self.sessionless_reply(request, CompletionCode::REQUEST_DATA_LENGTH_INVALID));
        }
        let auth_type = match AuthType::try_from(data.get_u8()) {
            Ok(t @ (AuthType::Md5 | AuthType::Password)) => t,
            _ => return Some(self.sessionless_reply(request, CompletionCode::INVALID_DATA_FIELD)),
        };
        let max_privilege = match Privilege::try_from(data.get_u8()) {
            Ok(p) => p,
            Err(_) => return Some(self.sessionless_reply(request, CompletionCode::INVALID_DATA_FIELD)),
        };
        let challenge = data.split_to(16);
        let initial_outbound = data.get_u32_le();

        let password = *self.credentials.password_field();
        let session = match self.sessions.activate(
            header.session_id,
            &challenge,
            auth_type,
            max_privilege,
            initial_outbound,
            now,
        ) {
            Ok(session) => session,
            Err(ActivateError::NoSessionSlot) => {
                warn!(peer = %src, "Session table full");
                return Some(self.sessionless_reply(request, CC_NO_SESSION_SLOT));
            }
            Err(e) => {
                debug!(peer = %src, error = ?e, "Activate Session rejected");
                return None;
            }
        };

        let inbound: u32 = rand::random::<u32>() | 1;
        let mut body = Vec::with_capacity(10);
        body.push(session.auth_type as u8);
        body.extend_from_slice(&session.id.to_le_bytes());
        body.extend_from_slice(&inbound.to_le_bytes());
        body.push(session.max_privilege as u8);

        info!(peer = %src, auth = ?session.auth_type, "IPMI session activated");

        let response = request.reply(CompletionCode::NORMAL, &body).encode();
        let sequence = session.next_outbound_sequence();
        let header = SessionHeader {
            auth_type: session.auth_type,
            sequence,
            session_id: session.id,
            auth_code: auth::auth_code(session.auth_type, &password, session.id, sequence, &response),
        };
        Some(Reply {
            packet: LanPacket::new(header, response).encode(),
            stop: None,
        })
    }

    async fn handle_in_session(
        &mut self,
        packet: &LanPacket,
        request: &IpmiMessage,
        src: SocketAddr,
        now: Instant,
    ) -> Option<Reply> {
        let header = &packet.session;
        let session_auth = self.sessions.get(header.session_id).map(|s| s.auth_type);
        match session_auth {
            Some(auth_type) if auth_type == header.auth_type => {}
            Some(_) => {
                debug!(peer = %src, "Auth type differs from session, dropping");
                return None;
            }
            None => {
                debug!(peer = %src, session_id = header.session_id, "Unknown session, dropping");
                return None;
            }
        }
        if !self.authenticated(header, &packet.message) {
            debug!(peer = %src, "Bad auth code, dropping");
            return None;
        }

        let privilege = self.sessions.touch(header.session_id, now)?.privilege;

        let (code, data, stop) = if privilege < required_privilege(request) {
            (CompletionCode::INSUFFICIENT_PRIVILEGE, Vec::new(), None)
        } else {
            self.dispatch(request, header.session_id).await
        };

        let reply = self.session_reply(header.session_id, request, code, &data);
        if request.netfn == netfn::APP && request.command == cmd::CLOSE_SESSION && code.is_success() {
            self.sessions.close(header.session_id);
            info!(peer = %src, "IPMI session closed");
        }

        Some(Reply {
            packet: reply?,
            stop,
        })
    }

    async fn dispatch(
        &mut self,
        request: &IpmiMessage,
        session_id: u32,
    ) -> (CompletionCode, Vec<u8>, Option<ServerExit>) {
        let result = match (request.netfn, request.command) {
            (netfn::APP, cmd::GET_DEVICE_ID) => Ok(device_id()),
            (netfn::APP, cmd::COLD_RESET) => {
                return match self.handler.cold_reset().await {
                    Ok(()) => (CompletionCode::NORMAL, Vec::new(), Some(ServerExit::ColdReset)),
                    Err(code) => (code, Vec::new(), None),
                };
            }
            (netfn::APP, cmd::GET_CHANNEL_AUTH_CAPABILITIES) => {
                let (code, data) = self.channel_auth_capabilities(request);
                return (code, data, None);
            }
            (netfn::APP, cmd::SET_SESSION_PRIVILEGE_LEVEL) => {
                self.set_privilege(request, session_id)
            }
            (netfn::APP, cmd::CLOSE_SESSION) => close_session(request, session_id),
            (netfn::CHASSIS, cmd::GET_CHASSIS_STATUS) => self.chassis_status().await,
            (netfn::CHASSIS, cmd::CHASSIS_CONTROL) => self.chassis_control(request).await,
            (netfn::CHASSIS, cmd::SET_SYSTEM_BOOT_OPTIONS) => self.set_boot_options(request).await,
            (netfn::CHASSIS, cmd::GET_SYSTEM_BOOT_OPTIONS) => self.get_boot_options(request).await,
            _ => Err(CompletionCode::INVALID_COMMAND),
        };

        match result {
            Ok(data) => (CompletionCode::NORMAL, data, None),
            Err(code) => (code, Vec::new(), None),
        }
    }

    fn set_privilege(&mut self, request: &IpmiMessage, session_id: u32) -> CommandResult<Vec<u8>> {
        let requested = *request
            .data
            .first()
            .ok_or(CompletionCode::REQUEST_DATA_LENGTH_INVALID)?
            & 0x0f;
        let session = self
            .sessions
            .touch(session_id, Instant::now())
            .ok_or(CompletionCode::UNSPECIFIED_ERROR)?;

        if requested == 0 {
            return Ok(vec![session.privilege as u8]);
        }
        let level =
            Privilege::try_from(requested).map_err(|_| CompletionCode::PARAMETER_NOT_SUPPORTED)?;
        if level > session.max_privilege {
            return Err(CC_PRIVILEGE_EXCEEDS_LIMIT);
        }
        session.privilege = level;
        Ok(vec![level as u8])
    }

    async fn chassis_status(&self) -> CommandResult<Vec<u8>> {
        let on = self.handler.get_power_state().await?;
        Ok(vec![u8::from(on), 0x00, 0x00])
    }

    async fn chassis_control(&self, request: &IpmiMessage) -> CommandResult<Vec<u8>> {
        let directive = request
            .data
            .first()
            .ok_or(CompletionCode::REQUEST_DATA_LENGTH_INVALID)?;
        match ChassisControl::try_from(*directive)? {
            ChassisControl::PowerDown => self.handler.power_off().await?,
            ChassisControl::PowerUp => self.handler.power_on().await?,
            ChassisControl::PowerCycle => self.handler.power_cycle().await?,
            ChassisControl::HardReset => self.handler.power_reset().await?,
            ChassisControl::SoftShutdown => self.handler.power_shutdown().await?,
            ChassisControl::DiagnosticInterrupt => return Err(CompletionCode::INVALID_DATA_FIELD),
        }
        Ok(Vec::new())
    }

    async fn set_boot_options(&self, request: &IpmiMessage) -> CommandResult<Vec<u8>> {
        let param = *request
            .data
            .first()
            .ok_or(CompletionCode::REQUEST_DATA_LENGTH_INVALID)?
            & 0x7f;
        match param {
            BOOT_PARAM_SET_IN_PROGRESS
            | BOOT_PARAM_SERVICE_PARTITION_SCAN
            | BOOT_PARAM_BOOT_INFO_ACK => Ok(Vec::new()),
            BOOT_PARAM_BOOT_FLAGS => {
                let flags = request
                    .data
                    .get(2)
                    .ok_or(CompletionCode::REQUEST_DATA_LENGTH_INVALID)?;
                let device = BootSelector::from_bits(*flags >> 2)
                    .ok_or(CompletionCode::INVALID_DATA_FIELD)?;
                self.handler.set_boot_device(device).await?;
                Ok(Vec::new())
            }
            _ => Err(CompletionCode::PARAMETER_NOT_SUPPORTED),
        }
    }

    async fn get_boot_options(&self, request: &IpmiMessage) -> CommandResult<Vec<u8>> {
        let param = *request
            .data
            .first()
            .ok_or(CompletionCode::REQUEST_DATA_LENGTH_INVALID)?
            & 0x7f;
        if param != BOOT_PARAM_BOOT_FLAGS {
            return Err(CompletionCode::PARAMETER_NOT_SUPPORTED);
        }

        let device = self.handler.get_boot_device().await?;
        Ok(vec![
            0x01,                 // parameter version
            BOOT_PARAM_BOOT_FLAGS,
            0x80,                 // boot flags valid
            device.bits() << 2,
            0x00,
            0x00,
            0x00,
        ])
    }

    fn authenticated(&self, header: &SessionHeader, message: &[u8]) -> bool {
        match &header.auth_code {
            Some(code) => auth::verify(
                header.auth_type,
                self.credentials.password_field(),
                header.session_id,
                header.sequence,
                message,
                code,
            ),
            None => false,
        }
    }

    fn sessionless_reply(&self, request: &IpmiMessage, code: CompletionCode) -> Reply {
        Reply {
            packet: LanPacket::new(SessionHeader::sessionless(), request.reply(code, &[]).encode())
                .encode(),
            stop: None,
        }
    }

    fn session_reply(
        &mut self,
        session_id: u32,
        request: &IpmiMessage,
        code: CompletionCode,
        data: &[u8],
    ) -> Option<Bytes> {
        let password = *self.credentials.password_field();
        let session = self.sessions.touch(session_id, Instant::now())?;
        let response = request.reply(code, data).encode();
        let sequence = session.next_outbound_sequence();
        let header = SessionHeader {
            auth_type: session.auth_type,
            sequence,
            session_id,
            auth_code: auth::auth_code(session.auth_type, &password, session_id, sequence, &response),
        };
        Some(LanPacket::new(header, response).encode())
    }
}

fn required_privilege(request: &IpmiMessage) -> Privilege {
    match (request.netfn, request.command) {
        (netfn::APP, cmd::COLD_RESET)
        | (netfn::CHASSIS, cmd::CHASSIS_CONTROL)
        | (netfn::CHASSIS, cmd::SET_SYSTEM_BOOT_OPTIONS) => Privilege::Operator,
        (netfn::APP, cmd::SET_SESSION_PRIVILEGE_LEVEL)
        | (netfn::APP, cmd::CLOSE_SESSION)
        | (netfn::APP, cmd::GET_CHANNEL_AUTH_CAPABILITIES) => Privilege::Callback,
        _ => Privilege::User,
    }
}

fn close_session(request: &IpmiMessage, session_id: u32) -> CommandResult<Vec<u8>> {
    if request.data.len() < 4 {
        return Err(CompletionCode::REQUEST_DATA_LENGTH_INVALID);
    }
    let target = u32::from_le_bytes([request.data[0], request.data[1], request.data[2], request.data[3]]);
    if target != session_id {
        // Closing other sessions is not supported
        return Err(CompletionCode::INVALID_DATA_FIELD);
    }
    Ok(Vec::new())
}

fn device_id() -> Vec<u8> {
    vec![
        0x00, // device id
        0x00, // device revision
        0x00, // firmware major, device available
        0x00, // firmware minor
        0x51, // IPMI v1.5
        0x80, // chassis device
        0x00, 0x00, 0x00, // manufacturer id
        0x00, 0x00, // product id
    ]
}
