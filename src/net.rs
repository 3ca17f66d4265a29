use std::io;
use std::net::{IpAddr, UdpSocket};

/// Address whose route is used to pick the outbound interface. Connecting a
/// UDP socket sends nothing.
const ROUTE_TARGET: &str = "8.8.8.8:80";

/// The local IP the host would use for outbound traffic.
pub fn outbound_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(ROUTE_TARGET)?;
    Ok(socket.local_addr()?.ip())
}
