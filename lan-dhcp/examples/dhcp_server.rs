//! NOTE: Run this example with sufficient privileges to bind port 67, and
//! pass the address of the interface to serve (defaults to 192.168.9.1).

use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use edge_nal::UdpBind;

use embassy_time::Duration;

use lan_dhcp::io::{self, server::TimerQueue};
use lan_dhcp::server::{Server, ServerOptions};
use lan_dhcp::SERVER_PORT;

fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let ip = std::env::args()
        .nth(1)
        .map(|arg| arg.parse().expect("not an IPv4 address"))
        .unwrap_or(Ipv4Addr::new(192, 168, 9, 1));

    futures_lite::future::block_on(run(ip)).unwrap();
}

async fn run(ip: Ipv4Addr) -> Result<(), anyhow::Error> {
    let stack = edge_nal_std::Stack::new();

    let mut socket = stack
        .bind(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            SERVER_PORT,
        )))
        .await?;

    let gateways = [ip];
    let dns = [Ipv4Addr::new(8, 8, 8, 8)];

    let mut options = ServerOptions::new(ip, Duration::from_secs(3600))?;
    options.gateways = &gateways;
    options.subnet = Some(Ipv4Addr::new(255, 255, 255, 0));
    options.dns = &dns;
    options.domain = Some("local");
    options.mtu = Some(1500);

    // Hands out the upper half of the /24 the server address sits in
    let octets = ip.octets();
    let mut server = Server::<64>::new(
        Ipv4Addr::new(octets[0], octets[1], octets[2], 100),
        Ipv4Addr::new(octets[0], octets[1], octets[2], 200),
    );

    let mut timers = TimerQueue::<64>::new();
    let mut buf = [0; 1500];

    io::server::run(&mut server, &options, &mut timers, &mut socket, &mut buf).await?;

    Ok(())
}
