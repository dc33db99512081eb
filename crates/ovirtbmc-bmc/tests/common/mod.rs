//! IPMI v1.5 test client speaking MD5-authenticated sessions over UDP

#![allow(dead_code)]

use ovirtbmc_ipmi::auth;
use ovirtbmc_ipmi::packet::{
    cmd, netfn, AuthType, CompletionCode, IpmiMessage, LanPacket, Privilege, SessionHeader,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const DROP_TIMEOUT: Duration = Duration::from_millis(300);

fn pad(value: &str) -> [u8; 16] {
    let mut field = [0u8; 16];
    field[..value.len()].copy_from_slice(value.as_bytes());
    field
}

/// Address a client should send to for a BMC bound to `addr`
///
/// Listeners bound to `::ffff:a.b.c.d` are reached over plain IPv4.
pub fn client_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(v4.into(), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

pub struct IpmiTestClient {
    socket: UdpSocket,
    target: SocketAddr,
    password: [u8; 16],
    session_id: u32,
    sequence: u32,
    rq_seq: u8,
}

impl IpmiTestClient {
    /// Open an Administrator session, or `None` if the BMC ignores us
    pub async fn open(bmc: SocketAddr, username: &str, password: &str) -> Option<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = Self {
            socket,
            target: client_addr(bmc),
            password: pad(password),
            session_id: 0,
            sequence: 0,
            rq_seq: 0,
        };

        let mut data = vec![AuthType::Md5 as u8];
        data.extend_from_slice(&pad(username));
        let challenge = IpmiMessage::request(netfn::APP, cmd::GET_SESSION_CHALLENGE, client.next_rq_seq(), data);
        let rsp = client
            .send(LanPacket::new(SessionHeader::sessionless(), challenge.encode()), REPLY_TIMEOUT)
            .await?;
        if rsp.completion_code() != Some(CompletionCode::NORMAL) {
            return None;
        }
        let body = rsp.response_data();
        let temp_id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);

        let mut data = vec![AuthType::Md5 as u8, Privilege::Administrator as u8];
        data.extend_from_slice(&body[4..20]);
        data.extend_from_slice(&1u32.to_le_bytes());
        client.session_id = temp_id;
        let rsp = client
            .command_with_timeout(netfn::APP, cmd::ACTIVATE_SESSION, &data, DROP_TIMEOUT)
            .await?;
        let body = rsp.response_data();
        client.session_id = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);

        let rsp = client
            .command(
                netfn::APP,
                cmd::SET_SESSION_PRIVILEGE_LEVEL,
                &[Privilege::Administrator as u8],
            )
            .await;
        assert_eq!(rsp.completion_code(), Some(CompletionCode::NORMAL));
        Some(client)
    }

    fn next_rq_seq(&mut self) -> u8 {
        self.rq_seq = (self.rq_seq + 1) & 0x3f;
        self.rq_seq
    }

    /// Send an authenticated request and wait for the response
    pub async fn command(&mut self, netfn: u8, command: u8, data: &[u8]) -> IpmiMessage {
        self.command_with_timeout(netfn, command, data, REPLY_TIMEOUT)
            .await
            .expect("BMC did not answer")
    }

    /// Send an authenticated request; `None` if nothing comes back in time
    pub async fn command_with_timeout(
        &mut self,
        netfn: u8,
        command: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Option<IpmiMessage> {
        self.sequence = self.sequence.wrapping_add(1);
        let rq_seq = self.next_rq_seq();
        let message = IpmiMessage::request(netfn, command, rq_seq, data.to_vec()).encode();
        let header = SessionHeader {
            auth_type: AuthType::Md5,
            sequence: self.sequence,
            session_id: self.session_id,
            auth_code: auth::auth_code(
                AuthType::Md5,
                &self.password,
                self.session_id,
                self.sequence,
                &message,
            ),
        };
        self.send(LanPacket::new(header, message), timeout).await
    }

    async fn send(&self, packet: LanPacket, timeout: Duration) -> Option<IpmiMessage> {
        self.socket
            .send_to(&packet.encode(), self.target)
            .await
            .unwrap();
        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(timeout, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .unwrap();
        let reply = LanPacket::parse(&buf[..len]).unwrap();
        Some(IpmiMessage::parse(&reply.message).unwrap())
    }

    pub async fn chassis_control(&mut self, directive: u8) -> Option<CompletionCode> {
        self.command(netfn::CHASSIS, cmd::CHASSIS_CONTROL, &[directive])
            .await
            .completion_code()
    }

    /// Power state from Get Chassis Status, or the failing completion code
    pub async fn power_state(&mut self) -> Result<bool, CompletionCode> {
        let rsp = self
            .command(netfn::CHASSIS, cmd::GET_CHASSIS_STATUS, &[])
            .await;
        match rsp.completion_code() {
            Some(CompletionCode::NORMAL) => Ok(rsp.response_data()[0] & 0x01 == 0x01),
            Some(code) => Err(code),
            None => panic!("not a response"),
        }
    }

    /// Set the boot flags device selector
    pub async fn set_boot_device(&mut self, selector: u8) -> Option<CompletionCode> {
        self.command(
            netfn::CHASSIS,
            cmd::SET_SYSTEM_BOOT_OPTIONS,
            &[0x05, 0x80, selector << 2, 0x00, 0x00, 0x00],
        )
        .await
        .completion_code()
    }

    /// Boot flags device selector, or the failing completion code
    pub async fn boot_device(&mut self) -> Result<u8, CompletionCode> {
        let rsp = self
            .command(netfn::CHASSIS, cmd::GET_SYSTEM_BOOT_OPTIONS, &[0x05, 0x00, 0x00])
            .await;
        match rsp.completion_code() {
            Some(CompletionCode::NORMAL) => Ok((rsp.response_data()[3] >> 2) & 0x0f),
            Some(code) => Err(code),
            None => panic!("not a response"),
        }
    }

    pub async fn cold_reset(&mut self) -> Option<CompletionCode> {
        self.command(netfn::APP, cmd::COLD_RESET, &[])
            .await
            .completion_code()
    }
}
