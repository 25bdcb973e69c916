//! STUN binding requests for NAT classification.
//!
//! Messages are built and parsed with `stun-format`. Plain binding requests
//! discover the mapped address; RFC 3489 CHANGE-REQUEST variants test whether
//! the NAT filters on the remote address or port.

use crate::error::{Error, Result};
use crate::nat::{NatClassification, NatProbe, NatType};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;
use stun_format::{Attr, Msg, MsgBuilder, MsgType};
use tokio::net::UdpSocket;

pub const HEAD_LEN: usize = 20;
const DEFAULT_STUN_PORT: u16 = 3478;
const TID_MASK: u128 = (1 << 96) - 1;

/// 96-bit transaction id in the low bits.
pub type TransactionId = u128;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ChangeRequest {
    pub change_ip: bool,
    pub change_port: bool,
}

impl ChangeRequest {
    pub fn ip_and_port() -> Self {
        Self {
            change_ip: true,
            change_port: true,
        }
    }
    pub fn port() -> Self {
        Self {
            change_ip: false,
            change_port: true,
        }
    }
}

pub fn new_transaction_id() -> TransactionId {
    rand::random::<u128>() & TID_MASK
}

pub fn encode_binding_request(tid: TransactionId, change: Option<ChangeRequest>) -> Result<Vec<u8>> {
    let mut buf = [0u8; HEAD_LEN + 8];
    let mut msg = MsgBuilder::from(buf.as_mut_slice());
    msg.typ(MsgType::BindingRequest)
        .ok_or(Error::InvalidStun("message type"))?;
    msg.tid(tid).ok_or(Error::InvalidStun("transaction id"))?;
    if let Some(ChangeRequest {
        change_ip,
        change_port,
    }) = change
    {
        msg.add_attr(Attr::ChangeRequest {
            change_ip,
            change_port,
        })
        .ok_or(Error::InvalidStun("change request"))?;
    }
    Ok(msg.as_bytes().to_vec())
}

/// Binding success response carrying `mapped` as XOR-MAPPED-ADDRESS.
pub fn encode_binding_response(tid: TransactionId, mapped: SocketAddr) -> Result<Vec<u8>> {
    let mut buf = [0u8; 64];
    let mut msg = MsgBuilder::from(buf.as_mut_slice());
    msg.typ(MsgType::BindingResponse)
        .ok_or(Error::InvalidStun("message type"))?;
    msg.tid(tid).ok_or(Error::InvalidStun("transaction id"))?;
    msg.add_attr(Attr::XorMappedAddress(to_stun_addr(mapped)))
        .ok_or(Error::InvalidStun("mapped address"))?;
    Ok(msg.as_bytes().to_vec())
}

/// Transaction id and CHANGE-REQUEST of a binding request.
pub fn decode_binding_request(buf: &[u8]) -> Result<(TransactionId, Option<ChangeRequest>)> {
    if buf.len() < HEAD_LEN {
        return Err(Error::InvalidStun("short header"));
    }
    let msg = Msg::from(buf);
    if !matches!(msg.typ(), Some(MsgType::BindingRequest)) {
        return Err(Error::InvalidStun("not a binding request"));
    }
    let tid = msg.tid().ok_or(Error::InvalidStun("no transaction id"))?;
    let change = msg.attrs_iter().find_map(|attr| match attr {
        Attr::ChangeRequest {
            change_ip,
            change_port,
        } => Some(ChangeRequest {
            change_ip,
            change_port,
        }),
        _ => None,
    });
    Ok((tid, change))
}

/// Extract the mapped address from a binding success response.
pub fn decode_binding_response(buf: &[u8], tid: TransactionId) -> Result<SocketAddr> {
    if buf.len() < HEAD_LEN {
        return Err(Error::InvalidStun("short header"));
    }
    let msg = Msg::from(buf);
    if !matches!(msg.typ(), Some(MsgType::BindingResponse)) {
        return Err(Error::InvalidStun("not a binding success"));
    }
    if msg.tid() != Some(tid) {
        return Err(Error::TransactionMismatch);
    }
    let mut mapped = None;
    for attr in msg.attrs_iter() {
        match attr {
            Attr::XorMappedAddress(addr) => return Ok(from_stun_addr(addr)),
            Attr::MappedAddress(addr) => mapped = Some(from_stun_addr(addr)),
            _ => {}
        }
    }
    mapped.ok_or(Error::InvalidStun("no mapped address"))
}

fn to_stun_addr(addr: SocketAddr) -> stun_format::SocketAddr {
    match addr {
        SocketAddr::V4(addr) => stun_format::SocketAddr::V4(addr.ip().octets(), addr.port()),
        SocketAddr::V6(addr) => stun_format::SocketAddr::V6(addr.ip().octets(), addr.port()),
    }
}

fn from_stun_addr(addr: stun_format::SocketAddr) -> SocketAddr {
    match addr {
        stun_format::SocketAddr::V4(ip, port) => {
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port))
        }
        stun_format::SocketAddr::V6(ip, port) => {
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0))
        }
    }
}

/// Classifies the local NAT by querying STUN servers from a single socket.
pub struct StunNatProbe {
    servers: Vec<String>,
    request_timeout: Duration,
}

impl StunNatProbe {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            request_timeout: Duration::from_secs(5),
        }
    }
    pub fn set_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
    async fn resolve(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        for server in &self.servers {
            let host = if server.contains(':') {
                server.clone()
            } else {
                format!("{server}:{DEFAULT_STUN_PORT}")
            };
            match tokio::net::lookup_host(host.as_str()).await {
                Ok(mut resolved) => {
                    if let Some(addr) = resolved.find(|a| a.is_ipv4()) {
                        addrs.push(addr);
                    }
                }
                Err(e) => log::debug!("resolve stun server {server} {e:?}"),
            }
            if addrs.len() == 2 {
                break;
            }
        }
        addrs
    }
    async fn query(
        &self,
        socket: &UdpSocket,
        server: SocketAddr,
        change: Option<ChangeRequest>,
    ) -> Result<SocketAddr> {
        let tid = new_transaction_id();
        let request = encode_binding_request(tid, change)?;
        socket.send_to(&request, server).await?;
        match tokio::time::timeout(self.request_timeout, recv_response(socket, tid)).await {
            Ok(rs) => rs,
            Err(_) => Err(Error::Timeout),
        }
    }
    async fn classify(&self) -> Result<NatClassification> {
        let servers = self.resolve().await;
        let Some(&primary) = servers.first() else {
            return Err(Error::NoStunServer);
        };
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
        let local_ip = local_ip_towards(primary).await?;
        let local_port = socket.local_addr()?.port();

        let mapped = self.query(&socket, primary, None).await?;
        if mapped.ip() == local_ip && mapped.port() == local_port {
            return Ok(NatClassification::new(NatType::Open, 0.9));
        }
        let mut confirmed = false;
        if let Some(&secondary) = servers.get(1) {
            match self.query(&socket, secondary, None).await {
                Ok(other) if other != mapped => {
                    log::debug!("stun mapping differs {mapped} vs {other}");
                    return Ok(NatClassification::new(NatType::Symmetric, 0.9));
                }
                Ok(_) => confirmed = true,
                Err(e) => log::debug!("secondary stun server {secondary} {e:?}"),
            }
        }
        let (nat_type, confidence): (NatType, f32) = if self
            .query(&socket, primary, Some(ChangeRequest::ip_and_port()))
            .await
            .is_ok()
        {
            (NatType::FullCone, 0.8)
        } else if self
            .query(&socket, primary, Some(ChangeRequest::port()))
            .await
            .is_ok()
        {
            (NatType::RestrictedCone, 0.7)
        } else {
            (NatType::PortRestrictedCone, 0.6)
        };
        let confidence = if confirmed { confidence } else { confidence.min(0.5) };
        Ok(NatClassification::new(nat_type, confidence))
    }
}

#[async_trait]
impl NatProbe for StunNatProbe {
    async fn probe(&self) -> io::Result<NatClassification> {
        Ok(self.classify().await?)
    }
}

async fn recv_response(socket: &UdpSocket, tid: TransactionId) -> Result<SocketAddr> {
    let mut buf = [0u8; 512];
    loop {
        let (len, _from) = socket.recv_from(&mut buf).await?;
        match decode_binding_response(&buf[..len], tid) {
            Ok(addr) => return Ok(addr),
            Err(e) => log::debug!("discard stun packet {e:?}"),
        }
    }
}

/// The local address the OS would use to reach `dest`; nothing is sent.
async fn local_ip_towards(dest: SocketAddr) -> io::Result<IpAddr> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(dest).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_request_layout() {
        let tid = 0x0707_0707_0707_0707_0707_0707;
        let plain = encode_binding_request(tid, None).unwrap();
        assert_eq!(plain.len(), HEAD_LEN);
        assert_eq!(&plain[..2], &[0x00, 0x01]);
        assert_eq!(&plain[4..8], &0x2112_A442u32.to_be_bytes());
        assert_eq!(decode_binding_request(&plain).unwrap(), (tid, None));

        let change = encode_binding_request(tid, Some(ChangeRequest::ip_and_port())).unwrap();
        assert_eq!(change.len(), HEAD_LEN + 8);
        assert_eq!(&change[2..4], &[0x00, 0x08]);
        assert_eq!(&change[HEAD_LEN..HEAD_LEN + 2], &[0x00, 0x03]);
        assert_eq!(change[HEAD_LEN + 7], 0x06);
        assert_eq!(
            decode_binding_request(&change).unwrap(),
            (tid, Some(ChangeRequest::ip_and_port()))
        );
    }

    #[test]
    fn transaction_ids_fit_in_96_bits() {
        for _ in 0..32 {
            assert_eq!(new_transaction_id() >> 96, 0);
        }
    }

    #[test]
    fn decodes_xor_mapped_address() {
        let tid = new_transaction_id();
        let v4: SocketAddr = "203.0.113.7:40123".parse().unwrap();
        let rsp = encode_binding_response(tid, v4).unwrap();
        assert_eq!(decode_binding_response(&rsp, tid).unwrap(), v4);

        let v6: SocketAddr = "[2001:db8::1]:5000".parse().unwrap();
        let rsp = encode_binding_response(tid, v6).unwrap();
        assert_eq!(decode_binding_response(&rsp, tid).unwrap(), v6);
    }

    #[test]
    fn rejects_foreign_transaction() {
        let rsp = encode_binding_response(1, "10.0.0.1:1".parse().unwrap()).unwrap();
        assert!(matches!(
            decode_binding_response(&rsp, 2),
            Err(Error::TransactionMismatch)
        ));
        assert!(decode_binding_response(&rsp[..10], 1).is_err());
        let request = encode_binding_request(1, None).unwrap();
        assert!(decode_binding_response(&request, 1).is_err());
    }

    /// Answers every binding request with the sender address, port shifted by `port_shift`.
    async fn fake_stun_server(port_shift: u16) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let Ok((tid, change)) = decode_binding_request(&buf[..len]) else {
                    continue;
                };
                if change.is_some() {
                    // change requests are ignored, like most public servers
                    continue;
                }
                let mapped = SocketAddr::new(from.ip(), from.port().wrapping_add(port_shift));
                let rsp = encode_binding_response(tid, mapped).unwrap();
                let _ = socket.send_to(&rsp, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn loopback_server_reports_open() {
        let server = fake_stun_server(0).await;
        let probe = StunNatProbe::new(vec![server.to_string()])
            .set_request_timeout(Duration::from_millis(300));
        let nat = probe.probe().await.unwrap();
        assert_eq!(nat.nat_type, NatType::Open);
    }

    #[tokio::test]
    async fn diverging_mappings_report_symmetric() {
        let a = fake_stun_server(1).await;
        let b = fake_stun_server(2).await;
        let probe = StunNatProbe::new(vec![a.to_string(), b.to_string()])
            .set_request_timeout(Duration::from_millis(300));
        let nat = probe.probe().await.unwrap();
        assert_eq!(nat.nat_type, NatType::Symmetric);
    }

    #[tokio::test]
    async fn ignored_change_requests_mean_port_restricted() {
        let a = fake_stun_server(1).await;
        let b = fake_stun_server(1).await;
        let probe = StunNatProbe::new(vec![a.to_string(), b.to_string()])
            .set_request_timeout(Duration::from_millis(200));
        let nat = probe.probe().await.unwrap();
        assert_eq!(nat.nat_type, NatType::PortRestrictedCone);
        assert_eq!(nat.confidence, 0.6);
    }

    #[tokio::test]
    async fn unconfirmed_mapping_caps_confidence() {
        let only = fake_stun_server(1).await;
        let probe = StunNatProbe::new(vec![only.to_string()])
            .set_request_timeout(Duration::from_millis(200));
        let nat = probe.probe().await.unwrap();
        assert_eq!(nat.nat_type, NatType::PortRestrictedCone);
        assert_eq!(nat.confidence, 0.5);
    }

    #[tokio::test]
    async fn no_servers_is_an_error() {
        let probe = StunNatProbe::new(vec![]);
        assert!(probe.probe().await.is_err());
    }
}
