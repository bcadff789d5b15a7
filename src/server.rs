use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::options::{
    IPXE_USER_CLASS, MessageType, OPT_BOOTFILE_NAME, OPT_LEASE_TIME, OPT_SERVER_IDENTIFIER,
};
use crate::packet::{BOOTREQUEST, DhcpPacket, RawOption};
use crate::subnet::{Binding, Subnet};
use crate::tracker::{DataTracker, SharedSubnet};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;

pub struct DhcpServer {
    tracker: Arc<DataTracker>,
    socket: Arc<UdpSocket>,
    server_ip: Ipv4Addr,
    ignore_anonymous: bool,
}

impl DhcpServer {
    pub fn new(
        tracker: Arc<DataTracker>,
        server_ip: Ipv4Addr,
        interface: &str,
        ignore_anonymous: bool,
    ) -> Result<Self> {
        let socket = Arc::new(Self::create_socket(interface)?);

        info!(
            "DHCP server starting on {} ({}:{})",
            interface, server_ip, DHCP_SERVER_PORT
        );

        Ok(Self {
            tracker,
            socket,
            server_ip,
            ignore_anonymous,
        })
    }

    fn create_socket(interface: &str) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        #[cfg(target_os = "linux")]
        socket
            .bind_device(Some(interface.as_bytes()))
            .map_err(|error| {
                Error::Socket(format!("Failed to bind to device {}: {}", interface, error))
            })?;

        #[cfg(not(target_os = "linux"))]
        warn!(
            "Binding to interface {} is only supported on Linux and will be ignored",
            interface
        );

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket
            .bind(&bind_addr.into())
            .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error)))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(tokio_socket)
    }

    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let handler = PacketHandler {
                        tracker: Arc::clone(&self.tracker),
                        socket: Arc::clone(&self.socket),
                        server_ip: self.server_ip,
                        ignore_anonymous: self.ignore_anonymous,
                    };

                    tokio::spawn(async move {
                        if let Err(error) = handler.handle_packet(&data, source).await {
                            warn!("Error handling packet from {}: {}", source, error);
                        }
                    });
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }
}

struct PacketHandler {
    tracker: Arc<DataTracker>,
    socket: Arc<UdpSocket>,
    server_ip: Ipv4Addr,
    ignore_anonymous: bool,
}

impl PacketHandler {
    async fn handle_packet(&self, data: &[u8], source: SocketAddr) -> Result<()> {
        let packet = DhcpPacket::parse(data)?;

        if packet.op != BOOTREQUEST {
            return Err(Error::InvalidPacket("Expected BOOTREQUEST".to_string()));
        }

        let mac = packet.mac_address();
        let message_type = packet
            .message_type()
            .ok_or_else(|| Error::InvalidPacket("Missing message type option".to_string()))?;

        info!("{} from {} ({})", message_type, mac, source);

        // Relayed packets select the subnet by gateway address, local ones
        // by the interface address.
        let subnet_addr = if packet.giaddr != Ipv4Addr::UNSPECIFIED {
            packet.giaddr
        } else {
            self.server_ip
        };
        let Some(subnet) = self.tracker.find_subnet(subnet_addr).await else {
            info!("No subnet serves {}, dropping {}", subnet_addr, message_type);
            return Ok(());
        };

        if self.ignore_anonymous
            && matches!(message_type, MessageType::Discover | MessageType::Request)
            && !subnet.read().await.bindings.contains_key(&mac)
        {
            info!("Ignoring {} from anonymous {}", message_type, mac);
            return Ok(());
        }

        match message_type {
            MessageType::Discover => self.handle_discover(&packet, &subnet, &mac).await,
            MessageType::Request => self.handle_request(&packet, &subnet, &mac).await,
            MessageType::Decline => self.handle_decline(&packet, &subnet, &mac).await,
            MessageType::Release => self.handle_release(&packet, &subnet, &mac).await,
            MessageType::Inform => self.handle_inform(&packet, &subnet, &mac).await,
            _ => {
                warn!("Ignoring {} message", message_type);
                Ok(())
            }
        }
    }

    async fn handle_discover(
        &self,
        packet: &DhcpPacket,
        subnet: &SharedSubnet,
        mac: &str,
    ) -> Result<()> {
        let (lease, binding) = self
            .tracker
            .find_or_allocate(subnet, mac, packet.requested_ip())
            .await;

        let Some(lease) = lease else {
            warn!("Pool exhausted, cannot offer an address to {}", mac);
            return Ok(());
        };

        let (options, _, siaddr) = {
            let guard = subnet.read().await;
            assemble_reply_options(&guard, packet, binding.as_ref(), self.server_ip, true)
        };

        let offer =
            DhcpPacket::create_reply(packet, MessageType::Offer, lease.ip, siaddr, options);
        self.send_reply(&offer, packet).await?;

        info!("OFFER {} to {}", lease.ip, mac);
        Ok(())
    }

    async fn handle_request(
        &self,
        packet: &DhcpPacket,
        subnet: &SharedSubnet,
        mac: &str,
    ) -> Result<()> {
        // A client in SELECTING names its chosen server; requests meant for
        // someone else are not ours to answer or refuse.
        if let Some(server_id) = packet.server_identifier()
            && server_id != self.server_ip
        {
            info!("REQUEST from {} is for server {}", mac, server_id);
            return Ok(());
        }

        let requested = packet.requested_ip().or_else(|| {
            (packet.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(packet.ciaddr)
        });
        let Some(requested) = requested else {
            return self.send_nak(packet, "no address in REQUEST").await;
        };

        let (lease, binding) = {
            let guard = subnet.read().await;
            let (lease, binding) = guard.find(mac);
            (lease.cloned(), binding.cloned())
        };

        match lease {
            Some(lease) if lease.ip == requested => {
                let (options, lease_time, siaddr) = {
                    let guard = subnet.read().await;
                    assemble_reply_options(&guard, packet, binding.as_ref(), self.server_ip, true)
                };
                self.tracker.renew(subnet, mac, lease_time).await;

                let ack = DhcpPacket::create_reply(
                    packet,
                    MessageType::Ack,
                    requested,
                    siaddr,
                    options,
                );
                self.send_reply(&ack, packet).await?;

                info!("ACK {} to {} (lease: {} seconds)", requested, mac, lease_time);
                Ok(())
            }
            Some(lease) => {
                self.send_nak(
                    packet,
                    &format!("{} requested {} but holds {}", mac, requested, lease.ip),
                )
                .await
            }
            None => {
                self.send_nak(packet, &format!("{} has no lease for {}", mac, requested))
                    .await
            }
        }
    }

    async fn handle_decline(
        &self,
        packet: &DhcpPacket,
        subnet: &SharedSubnet,
        mac: &str,
    ) -> Result<()> {
        let Some(declined) = packet.requested_ip() else {
            warn!("DECLINE from {} without an address", mac);
            return Ok(());
        };

        if self.tracker.decline(subnet, mac, declined).await {
            warn!("DECLINE from {} for {} - address held out of the pool", mac, declined);
        } else {
            warn!("DECLINE from {} for {} rejected - not their lease", mac, declined);
        }
        Ok(())
    }

    async fn handle_release(
        &self,
        packet: &DhcpPacket,
        subnet: &SharedSubnet,
        mac: &str,
    ) -> Result<()> {
        let held = subnet.read().await.find(mac).0.map(|lease| lease.ip);
        let Some(held) = held else {
            return Ok(());
        };

        if packet.ciaddr != Ipv4Addr::UNSPECIFIED && packet.ciaddr != held {
            warn!("RELEASE from {} with mismatched ciaddr {}", mac, packet.ciaddr);
            return Ok(());
        }

        self.tracker.release(subnet, mac).await;
        info!("RELEASE from {} for {}", mac, held);
        Ok(())
    }

    async fn handle_inform(
        &self,
        packet: &DhcpPacket,
        subnet: &SharedSubnet,
        mac: &str,
    ) -> Result<()> {
        let (options, _, siaddr) = {
            let guard = subnet.read().await;
            let binding = guard.find(mac).1.cloned();
            assemble_reply_options(&guard, packet, binding.as_ref(), self.server_ip, false)
        };

        let ack = DhcpPacket::create_reply(
            packet,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            siaddr,
            options,
        );
        self.send_reply(&ack, packet).await?;

        info!("INFORM response to {}", mac);
        Ok(())
    }

    async fn send_nak(&self, packet: &DhcpPacket, reason: &str) -> Result<()> {
        let options = vec![RawOption {
            code: OPT_SERVER_IDENTIFIER,
            data: self.server_ip.octets().to_vec(),
        }];

        let nak = DhcpPacket::create_reply(
            packet,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            options,
        );
        self.send_reply(&nak, packet).await?;

        warn!("NAK to {}: {}", packet.mac_address(), reason);
        Ok(())
    }

    async fn send_reply(&self, reply: &DhcpPacket, request: &DhcpPacket) -> Result<()> {
        let encoded = reply.encode();
        let is_nak = reply.message_type() == Some(MessageType::Nak);
        let destination = reply_destination(request, is_nak);

        self.socket.send_to(&encoded, destination).await?;
        Ok(())
    }
}

/// Where a reply goes: back through the relay on UDP/67, broadcast for NAKs
/// and clients that cannot yet receive unicast, else unicast to the client.
fn reply_destination(request: &DhcpPacket, is_nak: bool) -> SocketAddr {
    if request.giaddr != Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
    } else if is_nak || request.is_broadcast() || request.ciaddr == Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
    }
}

/// Boot filename for option 67: clients announcing the iPXE user class get
/// the bootstrap script, everyone else gets the iPXE loader. Empty names
/// suppress the option.
fn boot_file(subnet: &Subnet, packet: &DhcpPacket) -> Option<String> {
    let chainloaded = packet.user_class().is_some_and(|class| class == IPXE_USER_CLASS);
    let name = if chainloaded {
        &subnet.bootstrap
    } else {
        &subnet.ipxe
    };
    (!name.is_empty()).then(|| name.clone())
}

/// Full option set for an OFFER/ACK: the subnet's merged map plus the
/// server identifier, the lease duration (when applicable), and the boot
/// filename. Returns the options, the chosen lease time, and the siaddr
/// (binding next-server beats the subnet's, which beats empty).
fn assemble_reply_options(
    subnet: &Subnet,
    packet: &DhcpPacket,
    binding: Option<&Binding>,
    server_ip: Ipv4Addr,
    include_lease_time: bool,
) -> (Vec<RawOption>, u32, Ipv4Addr) {
    let (mut merged, lease_time) = subnet.build_options(binding);

    merged.insert(OPT_SERVER_IDENTIFIER, server_ip.octets().to_vec());
    if include_lease_time {
        merged.insert(OPT_LEASE_TIME, lease_time.to_be_bytes().to_vec());
    }
    if let Some(file) = boot_file(subnet, packet) {
        merged.insert(OPT_BOOTFILE_NAME, file.into_bytes());
    }

    let siaddr = binding
        .and_then(|binding| binding.next_server)
        .or(subnet.next_server)
        .unwrap_or(Ipv4Addr::UNSPECIFIED);

    let options = merged
        .into_iter()
        .map(|(code, data)| RawOption { code, data })
        .collect();

    (options, lease_time, siaddr)
}
