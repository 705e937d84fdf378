//! A DHCP server for one network segment.
//!
//! The server is unaware of the IP/UDP transport layer and operates purely in
//! terms of packets represented as Rust slices. It never reads the clock
//! either: lease expiry runs through the [`TimerService`] handed into each
//! entry point, so the host reactor drives everything — decapsulated payloads
//! through [`Server::rx`], elapsed timers through [`Server::timed_out`].

use core::net::{Ipv4Addr, SocketAddrV4};

use embassy_time::Duration;

use heapless::{LinearMap, String, Vec};

use log::{debug, info, trace, warn};

use crate::timer::{TimerHandle, TimerService, Token};
use crate::{
    DhcpOption, Error, Ipv4Addrs, Mac, MessageType, Options, Packet, CLIENT_PORT, SERVER_PORT,
};

const HOST_NAME_LEN: usize = 32;
const CLIENT_ID_LEN: usize = 32;
const PARAM_REQ_LEN: usize = 40;

/// Where a client stands in the lease exchange.
///
/// Release and expiry are teardown actions rather than resident states: the
/// binding is destroyed on the spot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LeaseState {
    /// Nothing offered yet; the next expected message is a DISCOVER.
    Init,
    /// An OFFER went out and the lease timer runs; awaiting the client's
    /// commitment.
    Offered,
    /// The lease is acknowledged.
    Bound,
}

/// The server-side record of one client: its identity, the address reserved
/// for it, and where the exchange currently stands.
#[derive(Clone, Debug)]
pub struct Binding {
    mac: Mac,
    xid: u32,
    ip: Ipv4Addr,
    state: LeaseState,
    timer: Option<TimerHandle>,
    /// Present while the latest reply was an OFFER; the committing REQUEST
    /// must carry this xid.
    offer_xid: Option<u32>,
    host_name: String<HOST_NAME_LEN>,
    client_id: Vec<u8, CLIENT_ID_LEN>,
    param_req: Vec<u8, PARAM_REQ_LEN>,
    exhausted_warned: bool,
}

impl Binding {
    fn new(mac: Mac, xid: u32) -> Self {
        Self {
            mac,
            xid,
            ip: Ipv4Addr::UNSPECIFIED,
            state: LeaseState::Init,
            timer: None,
            offer_xid: None,
            host_name: String::new(),
            client_id: Vec::new(),
            param_req: Vec::new(),
            exhausted_warned: false,
        }
    }

    pub fn mac(&self) -> Mac {
        self.mac
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// The address reserved or leased to this client, once one is.
    pub fn ip(&self) -> Option<Ipv4Addr> {
        (!self.ip.is_unspecified()).then_some(self.ip)
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    pub fn host_name(&self) -> Option<&str> {
        (!self.host_name.is_empty()).then(|| self.host_name.as_str())
    }

    pub fn client_identifier(&self) -> Option<&[u8]> {
        (!self.client_id.is_empty()).then(|| self.client_id.as_slice())
    }

    /// The parameter request list from the client's latest DISCOVER.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        (!self.param_req.is_empty()).then(|| self.param_req.as_slice())
    }

    /// Remembers what the client said about itself; oversized values are
    /// ignored rather than truncated.
    fn record_client_info(&mut self, request: &Packet<'_>) {
        if let Some(name) = request.options.host_name() {
            let mut host_name = String::new();
            if host_name.push_str(name).is_ok() {
                self.host_name = host_name;
            }
        }

        if let Some(id) = request.options.client_identifier() {
            let mut client_id = Vec::new();
            if client_id.extend_from_slice(id).is_ok() {
                self.client_id = client_id;
            }
        }

        if let Some(prl) = request.options.parameter_request_list() {
            let mut param_req = Vec::new();
            if param_req.extend_from_slice(prl).is_ok() {
                self.param_req = param_req;
            }
        }
    }
}

/// The policy side of the server: identity, the configuration handed to
/// clients, and the lease timing. Kept apart from the mutable lease registry
/// so it can be borrowed freely alongside it.
#[derive(Clone, Debug)]
pub struct ServerOptions<'a> {
    /// The server identifier; also used as `siaddr` in replies
    pub ip: Ipv4Addr,
    pub gateways: &'a [Ipv4Addr],
    pub subnet: Option<Ipv4Addr>,
    pub dns: &'a [Ipv4Addr],
    pub domain: Option<&'a str>,
    pub mtu: Option<u16>,
    /// Addresses inside the pool range that must never be handed out
    pub excluded: &'a [Ipv4Addr],
    pub lease_duration: Duration,
    /// How long a declined address is withheld from allocation
    pub decline_cooldown: Duration,
}

impl<'a> ServerOptions<'a> {
    pub fn new(ip: Ipv4Addr, lease_duration: Duration) -> Result<Self, Error> {
        if lease_duration.as_secs() == 0 {
            return Err(Error::InvalidLeaseDuration);
        }

        Ok(Self {
            ip,
            gateways: &[],
            subnet: None,
            dns: &[],
            domain: None,
            mtu: None,
            excluded: &[],
            lease_duration,
            decline_cooldown: Duration::from_secs(300),
        })
    }

    fn lease_secs(&self) -> u32 {
        self.lease_duration.as_secs() as _
    }

    pub fn offer(
        &self,
        request: &Packet<'_>,
        yiaddr: Ipv4Addr,
        buf: &'a mut [DhcpOption<'a>],
    ) -> Packet<'a> {
        self.reply(request, MessageType::Offer, Some(yiaddr), true, buf)
    }

    pub fn ack(
        &self,
        request: &Packet<'_>,
        yiaddr: Ipv4Addr,
        buf: &'a mut [DhcpOption<'a>],
    ) -> Packet<'a> {
        self.reply(request, MessageType::Ack, Some(yiaddr), true, buf)
    }

    /// The ACK answering an INFORM: configuration only, no assigned address
    /// and no lease timing.
    pub fn inform_ack(&self, request: &Packet<'_>, buf: &'a mut [DhcpOption<'a>]) -> Packet<'a> {
        self.reply(request, MessageType::Ack, None, false, buf)
    }

    pub fn nak(&self, request: &Packet<'_>, buf: &'a mut [DhcpOption<'a>]) -> Packet<'a> {
        self.reply(request, MessageType::Nak, None, false, buf)
    }

    fn reply(
        &self,
        request: &Packet<'_>,
        mt: MessageType,
        yiaddr: Option<Ipv4Addr>,
        with_lease: bool,
        buf: &'a mut [DhcpOption<'a>],
    ) -> Packet<'a> {
        buf[0] = DhcpOption::MessageType(mt);
        buf[1] = DhcpOption::ServerIdentifier(self.ip);

        let mut offset = 2;

        if !matches!(mt, MessageType::Nak) {
            if let Some(subnet) = self.subnet {
                buf[offset] = DhcpOption::SubnetMask(subnet);
                offset += 1;
            }

            if !self.gateways.is_empty() {
                buf[offset] = DhcpOption::Router(Ipv4Addrs::new(self.gateways));
                offset += 1;
            }

            if !self.dns.is_empty() {
                buf[offset] = DhcpOption::DomainNameServer(Ipv4Addrs::new(self.dns));
                offset += 1;
            }

            if with_lease {
                let lease = self.lease_secs();

                buf[offset] = DhcpOption::IpAddressLeaseTime(lease);
                buf[offset + 1] = DhcpOption::RenewalTime(lease / 2);
                buf[offset + 2] = DhcpOption::RebindingTime((lease as u64 * 7 / 8) as u32);
                offset += 3;
            }

            if let Some(mtu) = self.mtu {
                buf[offset] = DhcpOption::InterfaceMtu(mtu);
                offset += 1;
            }

            if let Some(domain) = self.domain {
                buf[offset] = DhcpOption::DomainName(domain);
                offset += 1;
            }
        }

        let reply = request.new_reply(yiaddr, self.ip, Options::new(&buf[..offset]));

        trace!("Sending {mt}: {reply:?}");

        reply
    }
}

/// An encoded reply frame and the address it goes to.
#[derive(Debug)]
pub struct Reply<'o> {
    pub data: &'o [u8],
    pub dst: Ipv4Addr,
}

/// The lease registry and per-client state machines, `N` clients at most.
///
/// Two indices cover the same set of bindings: `by_mac` owns them, `by_ip`
/// maps every reserved address back to its owner. Addresses are reserved the
/// moment an OFFER goes out, so concurrent discoveries cannot collide.
#[derive(Clone, Debug)]
pub struct Server<const N: usize = 64> {
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    by_mac: LinearMap<Mac, Binding, N>,
    by_ip: LinearMap<Ipv4Addr, Mac, N>,
    quarantine: LinearMap<Ipv4Addr, TimerHandle, N>,
}

impl<const N: usize> Server<N> {
    pub const fn new(range_start: Ipv4Addr, range_end: Ipv4Addr) -> Self {
        Self {
            range_start,
            range_end,
            by_mac: LinearMap::new(),
            by_ip: LinearMap::new(),
            quarantine: LinearMap::new(),
        }
    }

    pub fn binding(&self, mac: &Mac) -> Option<&Binding> {
        self.by_mac.get(mac)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.by_mac.iter().map(|(_, binding)| binding)
    }

    /// Handles one decapsulated DHCP payload sitting in `buf[..incoming_len]`
    /// and, when the exchange calls for an answer, encodes the reply frame
    /// into `buf` and returns it along with its destination.
    ///
    /// All failures are local to the one message: they are logged, the
    /// message is dropped, and `None` is returned.
    pub fn rx<'o, T: TimerService>(
        &mut self,
        options: &ServerOptions<'_>,
        timers: &mut T,
        buf: &'o mut [u8],
        incoming_len: usize,
    ) -> Option<Reply<'o>> {
        let mut opt_buf = Options::buf();

        let (reply, dst) = self.process(options, timers, &buf[..incoming_len], &mut opt_buf)?;

        match reply.encode(buf) {
            Ok(data) => Some(Reply { data, dst }),
            Err(err) => {
                warn!("Reply did not fit the downstream buffer: {err}");
                None
            }
        }
    }

    /// Like [`Server::rx`], but wraps the reply into a UDP datagram
    /// (ports 67 to 68) with the pseudo-header checksum filled in, for
    /// deployments where the link layer below expects whole datagrams.
    pub fn rx_udp<'o, T: TimerService>(
        &mut self,
        options: &ServerOptions<'_>,
        timers: &mut T,
        buf: &'o mut [u8],
        incoming_len: usize,
    ) -> Option<Reply<'o>> {
        let mut opt_buf = Options::buf();

        let (reply, dst) = self.process(options, timers, &buf[..incoming_len], &mut opt_buf)?;

        let datagram = lan_raw::udp::encode(
            buf,
            SocketAddrV4::new(options.ip, SERVER_PORT),
            SocketAddrV4::new(dst, CLIENT_PORT),
            |buf| Ok::<_, Error>(reply.encode(buf)?.len()),
        );

        match datagram {
            Ok(data) => Some(Reply { data, dst }),
            Err(err) => {
                warn!("Reply did not fit the downstream buffer: {err}");
                None
            }
        }
    }

    /// Delivers an elapsed timer. A token whose binding is already gone is
    /// the trace of a cancellation race and is discarded.
    pub fn timed_out<T: TimerService>(&mut self, timers: &mut T, token: Token) {
        match token {
            Token::Lease(mac) => {
                let entry = match self.by_mac.get(&mac) {
                    Some(entry) => {
                        let mut entry = entry.clone();
                        // Already elapsed; nothing left to cancel
                        entry.timer = None;
                        entry
                    }
                    None => {
                        debug!("Late expiry for {mac:02x?}; discarding");
                        return;
                    }
                };

                self.evict(timers, &entry, "lease expired");
            }
            Token::Quarantine(addr) => {
                if self.quarantine.remove(&addr).is_some() {
                    info!("{addr} returns to the pool");
                }
            }
        }
    }

    /// Cancels every pending timer and drops all bindings.
    pub fn shutdown<T: TimerService>(&mut self, timers: &mut T) {
        for (_, entry) in self.by_mac.iter() {
            if let Some(handle) = entry.timer {
                timers.stop(handle);
            }
        }

        for (_, handle) in self.quarantine.iter() {
            timers.stop(*handle);
        }

        self.by_mac = LinearMap::new();
        self.by_ip = LinearMap::new();
        self.quarantine = LinearMap::new();
    }

    fn process<'b, T: TimerService>(
        &mut self,
        options: &'b ServerOptions<'b>,
        timers: &mut T,
        data: &[u8],
        opt_buf: &'b mut [DhcpOption<'b>],
    ) -> Option<(Packet<'b>, Ipv4Addr)> {
        let request = match Packet::decode(data) {
            Ok(request) => request,
            Err(err) => {
                warn!("Dropping malformed frame: {err}");
                return None;
            }
        };

        if request.reply {
            trace!("Ignoring a reply frame");
            return None;
        }

        self.dispatch(options, timers, &request, opt_buf)
    }

    /// The transition table: one arm per `(state, message type)` pair the
    /// protocol expects; everything else is logged and dropped.
    fn dispatch<'b, T: TimerService>(
        &mut self,
        options: &'b ServerOptions<'b>,
        timers: &mut T,
        request: &Packet<'_>,
        opt_buf: &'b mut [DhcpOption<'b>],
    ) -> Option<(Packet<'b>, Ipv4Addr)> {
        let mt = match request.options.message_type() {
            Some(mt) => mt,
            None => {
                warn!("Request without a message type; dropping");
                return None;
            }
        };

        let mac = request.mac();

        let mut entry = match self.by_mac.get(&mac) {
            Some(entry) => entry.clone(),
            None if mt == MessageType::Discover => {
                if self.by_mac.len() == N {
                    warn!("Binding table full; ignoring {mac:02x?}");
                    return None;
                }

                info!("New client {mac:02x?}");

                Binding::new(mac, request.xid)
            }
            None => {
                warn!("{mt} from unknown client {mac:02x?}; dropping");
                return None;
            }
        };

        let dst = reply_destination(request);

        let reply = match (entry.state, mt) {
            (LeaseState::Init | LeaseState::Offered, MessageType::Discover) => {
                entry.record_client_info(request);
                entry.xid = request.xid;

                if entry.ip.is_unspecified() {
                    match self.allocate(options) {
                        Some(ip) => {
                            entry.ip = ip;
                            entry.exhausted_warned = false;

                            if self.by_ip.insert(ip, mac).is_err() {
                                // Unreachable while the admission check on
                                // by_mac holds
                                warn!("Address index full; no offer for {mac:02x?}");
                                entry.ip = Ipv4Addr::UNSPECIFIED;
                                self.store(entry);
                                return None;
                            }
                        }
                        None => {
                            if !entry.exhausted_warned {
                                warn!("Address pool exhausted; no offer for {mac:02x?}");
                                entry.exhausted_warned = true;
                            }

                            self.store(entry);
                            return None;
                        }
                    }
                }

                match entry.timer {
                    Some(handle) => timers.reset(handle, options.lease_duration),
                    None => {
                        entry.timer =
                            timers.start(options.lease_duration, Token::Lease(mac), false)
                    }
                }

                entry.state = LeaseState::Offered;
                entry.offer_xid = Some(request.xid);

                info!("Offering {} to {mac:02x?}", entry.ip);

                let reply = options.offer(request, entry.ip, opt_buf);
                self.store(entry);

                Some(reply)
            }

            (LeaseState::Bound, MessageType::Discover) => {
                // The client restarted; fall back to awaiting its
                // rediscovery. The lease timer keeps running so a client
                // that never returns still expires.
                info!("{mac:02x?} restarted discovery");

                entry.record_client_info(request);
                entry.xid = request.xid;
                entry.state = LeaseState::Init;
                entry.offer_xid = None;

                self.store(entry);

                None
            }

            (LeaseState::Offered, MessageType::Request) => {
                if let Some(server) = request.options.server_identifier() {
                    if server != options.ip {
                        debug!("{mac:02x?} selected server {server}; dropping");
                        self.store(entry);
                        return None;
                    }
                }

                if let Some(offer_xid) = entry.offer_xid {
                    if request.xid != offer_xid {
                        warn!(
                            "REQUEST xid {:08x} does not match the offered {:08x}; dropping",
                            request.xid, offer_xid
                        );
                        self.store(entry);
                        return None;
                    }
                }

                let requested = request.options.requested_ip().unwrap_or(request.ciaddr);
                if requested != entry.ip {
                    warn!(
                        "{mac:02x?} requested {requested} but was offered {}; nak",
                        entry.ip
                    );

                    let reply = options.nak(request, opt_buf);
                    self.evict(timers, &entry, "requested address mismatch");

                    return Some((reply, dst));
                }

                entry.xid = request.xid;
                entry.offer_xid = None;

                match entry.timer {
                    Some(handle) => timers.reset(handle, options.lease_duration),
                    None => {
                        entry.timer =
                            timers.start(options.lease_duration, Token::Lease(mac), false)
                    }
                }

                entry.state = LeaseState::Bound;

                info!("Leased {} to {mac:02x?}", entry.ip);

                let reply = options.ack(request, entry.ip, opt_buf);
                self.store(entry);

                Some(reply)
            }

            (LeaseState::Bound, MessageType::Request) => {
                // Renewal; the committed address arrives in ciaddr more
                // often than in option 50
                if let Some(server) = request.options.server_identifier() {
                    if server != options.ip {
                        debug!("{mac:02x?} renews with server {server}; dropping");
                        self.store(entry);
                        return None;
                    }
                }

                let requested = request.options.requested_ip().unwrap_or(request.ciaddr);
                if requested != entry.ip {
                    warn!("{mac:02x?} renews {requested} but holds {}; nak", entry.ip);

                    let reply = options.nak(request, opt_buf);
                    self.evict(timers, &entry, "renewed address mismatch");

                    return Some((reply, dst));
                }

                entry.xid = request.xid;

                match entry.timer {
                    Some(handle) => timers.reset(handle, options.lease_duration),
                    None => {
                        entry.timer =
                            timers.start(options.lease_duration, Token::Lease(mac), false)
                    }
                }

                // The renewed lease runs through the commit leg again
                entry.state = LeaseState::Offered;

                debug!("Renewed {} for {mac:02x?}", entry.ip);

                let reply = options.ack(request, entry.ip, opt_buf);
                self.store(entry);

                Some(reply)
            }

            (LeaseState::Offered | LeaseState::Bound, MessageType::Release) => {
                if request.options.server_identifier() != Some(options.ip) {
                    debug!("RELEASE from {mac:02x?} names another server; dropping");
                    self.store(entry);
                    return None;
                }

                if request.ciaddr != entry.ip {
                    warn!(
                        "RELEASE from {} which does not hold {}; dropping",
                        request.ciaddr, entry.ip
                    );
                    self.store(entry);
                    return None;
                }

                // No reply to a RELEASE
                self.evict(timers, &entry, "released");

                None
            }

            (LeaseState::Offered, MessageType::Decline) => {
                // The client probed the offered address and found it in use
                // elsewhere; withhold it for a while
                let addr = entry.ip;

                warn!("{mac:02x?} declined {addr}");

                self.evict(timers, &entry, "declined");
                self.quarantine_address(timers, addr, options.decline_cooldown);

                None
            }

            (LeaseState::Bound, MessageType::Inform) => {
                entry.xid = request.xid;

                debug!("Configuration for {mac:02x?} by INFORM");

                let reply = options.inform_ack(request, opt_buf);
                self.store(entry);

                Some(reply)
            }

            (state, mt) => {
                warn!("{mt} unexpected for {mac:02x?} in {state:?}; dropping");
                self.store(entry);

                None
            }
        };

        reply.map(|reply| (reply, dst))
    }

    /// The lowest pool address that is neither reserved, nor excluded by
    /// policy, nor cooling down after a DECLINE.
    fn allocate(&self, options: &ServerOptions<'_>) -> Option<Ipv4Addr> {
        let start: u32 = self.range_start.into();
        let end: u32 = self.range_end.into();

        for pos in start..=end {
            let addr = pos.into();

            if !self.by_ip.contains_key(&addr)
                && !self.quarantine.contains_key(&addr)
                && !options.excluded.contains(&addr)
            {
                return Some(addr);
            }
        }

        None
    }

    fn store(&mut self, entry: Binding) {
        let mac = entry.mac;

        if self.by_mac.insert(mac, entry).is_err() {
            // Unreachable: admission is checked before a binding is created
            warn!("Binding table full; dropping the state of {mac:02x?}");
        }
    }

    /// Destroys a binding: the pending timer is cancelled first, then both
    /// indices forget the client.
    fn evict<T: TimerService>(&mut self, timers: &mut T, entry: &Binding, reason: &str) {
        if let Some(handle) = entry.timer {
            timers.stop(handle);
        }

        if !entry.ip.is_unspecified() {
            self.by_ip.remove(&entry.ip);
        }

        self.by_mac.remove(&entry.mac);

        info!("{:02x?} unbound ({reason})", entry.mac);
    }

    fn quarantine_address<T: TimerService>(
        &mut self,
        timers: &mut T,
        addr: Ipv4Addr,
        cooldown: Duration,
    ) {
        match timers.start(cooldown, Token::Quarantine(addr), false) {
            Some(handle) => {
                if self.quarantine.insert(addr, handle).is_err() {
                    warn!("Quarantine set full; {addr} returns to the pool immediately");
                    timers.stop(handle);
                }
            }
            None => warn!("No timer for the {addr} cooldown; the address stays available"),
        }
    }
}

/// Replies go to `ciaddr` when the client can already receive unicast there,
/// otherwise to the local broadcast address.
fn reply_destination(request: &Packet<'_>) -> Ipv4Addr {
    if !request.broadcast && !request.ciaddr.is_unspecified() {
        request.ciaddr
    } else {
        Ipv4Addr::BROADCAST
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CHADDR: Mac = [0xf8, 0x75, 0xa4, 0x01, 0x4d, 0x47];
    const OTHER_MAC: Mac = [0x02, 0x00, 0x00, 0x11, 0x22, 0x33];
    const THIRD_MAC: Mac = [0x02, 0x00, 0x00, 0x44, 0x55, 0x66];
    const XID: u32 = 0xde10a7e6;

    const SERVER_ID: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 1);
    const POOL_FIRST: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 100);
    const POOL_SECOND: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 101);
    const POOL_LAST: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 200);

    #[derive(Default)]
    struct MockTimers {
        next: i64,
        armed: heapless::Vec<(TimerHandle, Token, Duration), 8>,
        stops: usize,
        resets: usize,
    }

    impl TimerService for MockTimers {
        fn start(&mut self, delay: Duration, token: Token, _periodic: bool) -> Option<TimerHandle> {
            let handle = TimerHandle(self.next);
            self.next += 1;

            self.armed.push((handle, token, delay)).unwrap();

            Some(handle)
        }

        fn stop(&mut self, handle: TimerHandle) {
            self.stops += 1;

            if let Some(pos) = self.armed.iter().position(|(h, ..)| *h == handle) {
                self.armed.swap_remove(pos);
            }
        }

        fn reset(&mut self, handle: TimerHandle, delay: Duration) {
            self.resets += 1;

            for slot in self.armed.iter_mut() {
                if slot.0 == handle {
                    slot.2 = delay;
                }
            }
        }
    }

    impl MockTimers {
        /// Pops the oldest pending timer as if it elapsed.
        fn fire(&mut self) -> Token {
            self.armed.remove(0).1
        }
    }

    fn config() -> ServerOptions<'static> {
        static GATEWAYS: [Ipv4Addr; 1] = [SERVER_ID];
        static DNS: [Ipv4Addr; 1] = [Ipv4Addr::new(8, 8, 8, 8)];

        let mut options = ServerOptions::new(SERVER_ID, Duration::from_secs(3600)).unwrap();
        options.gateways = &GATEWAYS;
        options.subnet = Some(Ipv4Addr::new(255, 255, 255, 0));
        options.dns = &DNS;
        options.domain = Some("local");
        options.mtu = Some(1500);

        options
    }

    fn server() -> Server<16> {
        Server::new(POOL_FIRST, POOL_LAST)
    }

    /// The DISCOVER capture this server was first exercised against:
    /// xid de10a7e6 from f8:75:a4:01:4d:47, host "mnahmed", asking for the
    /// usual set of parameters.
    fn discover_frame() -> [u8; 300] {
        let mut frame = [0; 300];

        frame[..8].copy_from_slice(&[0x01, 0x01, 0x06, 0x00, 0xde, 0x10, 0xa7, 0xe6]);
        frame[28..34].copy_from_slice(&CHADDR);
        frame[236..240].copy_from_slice(&Packet::COOKIE);
        frame[240..288].copy_from_slice(&[
            0x35, 0x01, 0x01, // DISCOVER
            0x3d, 0x07, 0x01, 0xf8, 0x75, 0xa4, 0x01, 0x4d, 0x47, // client identifier
            0x0c, 0x07, 0x6d, 0x6e, 0x61, 0x68, 0x6d, 0x65, 0x64, // host name "mnahmed"
            0x3c, 0x08, 0x4d, 0x53, 0x46, 0x54, 0x20, 0x35, 0x2e, 0x30, // class "MSFT 5.0"
            0x37, 0x0e, 0x01, 0x03, 0x06, 0x0f, 0x1f, 0x21, 0x2b, 0x2c, 0x2e, 0x2f, 0x77, 0x79,
            0xf9, 0xfc, // parameter request list
            0xff,
        ]);

        frame
    }

    fn client_frame(
        mac: Mac,
        mt: MessageType,
        xid: u32,
        ciaddr: Ipv4Addr,
        extra: &[DhcpOption<'_>],
    ) -> ([u8; 576], usize) {
        let mut opts = Options::buf();
        opts[0] = DhcpOption::MessageType(mt);
        opts[1..1 + extra.len()].copy_from_slice(extra);

        let mut chaddr = [0; 16];
        chaddr[..6].copy_from_slice(&mac);

        let packet = Packet {
            reply: false,
            hops: 0,
            xid,
            secs: 0,
            broadcast: false,
            ciaddr,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: Options::new(&opts[..1 + extra.len()]),
        };

        let mut frame = [0; 576];
        let len = packet.encode(&mut frame).unwrap().len();

        (frame, len)
    }

    fn discover(mac: Mac, xid: u32) -> ([u8; 576], usize) {
        client_frame(mac, MessageType::Discover, xid, Ipv4Addr::UNSPECIFIED, &[])
    }

    fn feed<'o>(
        server: &mut Server<16>,
        options: &ServerOptions<'_>,
        timers: &mut MockTimers,
        frame: &[u8],
        buf: &'o mut [u8],
    ) -> Option<Reply<'o>> {
        buf[..frame.len()].copy_from_slice(frame);

        server.rx(options, timers, buf, frame.len())
    }

    /// Every binding must be reachable through both indices, and no two
    /// bindings may share an address.
    fn check_indices(server: &Server<16>) {
        for (mac, entry) in server.by_mac.iter() {
            assert_eq!(entry.mac, *mac);

            if let Some(ip) = entry.ip() {
                assert_eq!(server.by_ip.get(&ip), Some(mac));
            }
        }

        for (ip, mac) in server.by_ip.iter() {
            assert_eq!(server.by_mac.get(mac).unwrap().ip(), Some(*ip));
        }
    }

    fn bind_first_client(
        server: &mut Server<16>,
        options: &ServerOptions<'_>,
        timers: &mut MockTimers,
    ) {
        let mut buf = [0; 1500];

        feed(server, options, timers, &discover_frame(), &mut buf).unwrap();

        let (frame, len) = client_frame(
            CHADDR,
            MessageType::Request,
            XID,
            Ipv4Addr::UNSPECIFIED,
            &[
                DhcpOption::ServerIdentifier(SERVER_ID),
                DhcpOption::RequestedIpAddress(POOL_FIRST),
            ],
        );
        feed(server, options, timers, &frame[..len], &mut buf).unwrap();

        assert_eq!(
            server.binding(&CHADDR).unwrap().state(),
            LeaseState::Bound
        );
    }

    #[test]
    fn discover_gets_the_first_free_address_offered() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        let reply = feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf).unwrap();

        assert_eq!(reply.dst, Ipv4Addr::BROADCAST);

        // Message type leads the options area
        assert_eq!(&reply.data[240..243], &[53, 1, 2]);

        let offer = Packet::decode(reply.data).unwrap();

        assert!(offer.reply);
        assert_eq!(offer.xid, XID);
        assert_eq!(offer.yiaddr, POOL_FIRST);
        assert_eq!(offer.siaddr, SERVER_ID);
        assert_eq!(offer.mac(), CHADDR);
        assert_eq!(offer.options.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.options.server_identifier(), Some(SERVER_ID));
        assert_eq!(offer.options.get(51), Some(&3600u32.to_be_bytes()[..]));
        assert_eq!(offer.options.get(58), Some(&1800u32.to_be_bytes()[..]));
        assert_eq!(offer.options.get(59), Some(&3150u32.to_be_bytes()[..]));
        assert_eq!(offer.options.get(1), Some(&[255, 255, 255, 0][..]));
        assert_eq!(offer.options.get(3), Some(&SERVER_ID.octets()[..]));
        assert_eq!(offer.options.get(6), Some(&[8, 8, 8, 8][..]));
        assert_eq!(offer.options.get(26), Some(&1500u16.to_be_bytes()[..]));
        assert_eq!(offer.options.get(15), Some(&b"local"[..]));

        let entry = server.binding(&CHADDR).unwrap();
        assert_eq!(entry.state(), LeaseState::Offered);
        assert_eq!(entry.ip(), Some(POOL_FIRST));
        assert_eq!(entry.xid(), XID);
        assert_eq!(entry.host_name(), Some("mnahmed"));
        assert_eq!(
            entry.client_identifier(),
            Some(&[0x01, 0xf8, 0x75, 0xa4, 0x01, 0x4d, 0x47][..])
        );
        assert_eq!(
            entry.parameter_request_list(),
            Some(&[1, 3, 6, 15, 31, 33, 43, 44, 46, 47, 119, 121, 249, 252][..])
        );

        assert_eq!(timers.armed.len(), 1);
        assert_eq!(timers.armed[0].1, Token::Lease(CHADDR));
        assert_eq!(timers.armed[0].2, Duration::from_secs(3600));

        check_indices(&server);
    }

    #[test]
    fn duplicate_discover_repeats_the_same_offer() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf1 = [0; 1500];
        let mut buf2 = [0; 1500];

        let first = feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf1).unwrap();
        let second =
            feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf2).unwrap();

        assert_eq!(first.data, second.data);
        assert_eq!(first.dst, second.dst);

        assert_eq!(server.by_ip.len(), 1);
        assert_eq!(server.by_ip.get(&POOL_FIRST), Some(&CHADDR));

        // The one lease timer was rewound, not duplicated
        assert_eq!(timers.armed.len(), 1);
        assert_eq!(timers.resets, 1);

        check_indices(&server);
    }

    #[test]
    fn request_commits_the_offer() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf).unwrap();

        let (frame, len) = client_frame(
            CHADDR,
            MessageType::Request,
            XID,
            Ipv4Addr::UNSPECIFIED,
            &[
                DhcpOption::ServerIdentifier(SERVER_ID),
                DhcpOption::RequestedIpAddress(POOL_FIRST),
            ],
        );
        let reply = feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).unwrap();

        let ack = Packet::decode(reply.data).unwrap();

        assert_eq!(ack.options.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, POOL_FIRST);
        assert_eq!(ack.xid, XID);
        assert_eq!(ack.options.get(51), Some(&3600u32.to_be_bytes()[..]));

        let entry = server.binding(&CHADDR).unwrap();
        assert_eq!(entry.state(), LeaseState::Bound);

        // The lease timer restarted at the full lease on commit
        assert_eq!(timers.armed.len(), 1);
        assert_eq!(timers.armed[0].2, Duration::from_secs(3600));
        assert!(timers.resets >= 1);

        check_indices(&server);
    }

    #[test]
    fn request_for_the_wrong_address_naks_and_unbinds() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf).unwrap();

        let (frame, len) = client_frame(
            CHADDR,
            MessageType::Request,
            XID,
            Ipv4Addr::UNSPECIFIED,
            &[
                DhcpOption::ServerIdentifier(SERVER_ID),
                DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 9, 150)),
            ],
        );
        let reply = feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).unwrap();

        let nak = Packet::decode(reply.data).unwrap();

        assert_eq!(nak.options.message_type(), Some(MessageType::Nak));
        assert_eq!(nak.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(nak.options.get(51), None);

        assert!(server.binding(&CHADDR).is_none());
        assert!(server.by_ip.is_empty());
        assert!(timers.armed.is_empty());
        drop(nak);

        // The address went back to the pool
        let (frame, len) = discover(OTHER_MAC, 0x1111);
        let reply = feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).unwrap();

        assert_eq!(Packet::decode(reply.data).unwrap().yiaddr, POOL_FIRST);

        check_indices(&server);
    }

    #[test]
    fn lease_expiry_unbinds_and_frees_the_address() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        bind_first_client(&mut server, &options, &mut timers);

        let token = timers.fire();
        assert_eq!(token, Token::Lease(CHADDR));

        server.timed_out(&mut timers, token);

        assert!(server.binding(&CHADDR).is_none());
        assert!(server.by_ip.is_empty());

        let (frame, len) = discover(OTHER_MAC, 0x2222);
        let reply = feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).unwrap();

        assert_eq!(Packet::decode(reply.data).unwrap().yiaddr, POOL_FIRST);

        check_indices(&server);
    }

    #[test]
    fn late_expiry_after_teardown_is_discarded() {
        let mut server = server();
        let mut timers = MockTimers::default();

        // No binding for this token anymore
        server.timed_out(&mut timers, Token::Lease(CHADDR));

        assert!(server.by_mac.is_empty());
        assert_eq!(timers.stops, 0);
    }

    #[test]
    fn release_tears_the_binding_down_silently() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        bind_first_client(&mut server, &options, &mut timers);

        let (frame, len) = client_frame(
            CHADDR,
            MessageType::Release,
            0x3333,
            POOL_FIRST,
            &[DhcpOption::ServerIdentifier(SERVER_ID)],
        );
        let reply = feed(&mut server, &options, &mut timers, &frame[..len], &mut buf);

        assert!(reply.is_none());
        assert!(server.binding(&CHADDR).is_none());
        assert!(server.by_ip.is_empty());
        assert!(timers.armed.is_empty());
        assert!(timers.stops >= 1);

        check_indices(&server);
    }

    #[test]
    fn release_from_the_wrong_address_is_ignored() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        bind_first_client(&mut server, &options, &mut timers);

        let (frame, len) = client_frame(
            CHADDR,
            MessageType::Release,
            0x3333,
            Ipv4Addr::new(192, 168, 9, 77),
            &[DhcpOption::ServerIdentifier(SERVER_ID)],
        );
        assert!(feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).is_none());

        assert_eq!(server.binding(&CHADDR).unwrap().state(), LeaseState::Bound);
        check_indices(&server);
    }

    #[test]
    fn request_from_an_unknown_client_is_dropped() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        let (frame, len) = client_frame(
            CHADDR,
            MessageType::Request,
            XID,
            Ipv4Addr::UNSPECIFIED,
            &[DhcpOption::ServerIdentifier(SERVER_ID)],
        );

        assert!(feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).is_none());
        assert!(server.by_mac.is_empty());
    }

    #[test]
    fn request_naming_another_server_is_dropped_silently() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf).unwrap();

        let (frame, len) = client_frame(
            CHADDR,
            MessageType::Request,
            XID,
            Ipv4Addr::UNSPECIFIED,
            &[
                DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
                DhcpOption::RequestedIpAddress(POOL_FIRST),
            ],
        );
        assert!(feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).is_none());

        // The offer stays on the table until its timer expires
        assert_eq!(
            server.binding(&CHADDR).unwrap().state(),
            LeaseState::Offered
        );
        check_indices(&server);
    }

    #[test]
    fn request_with_a_stale_xid_is_dropped() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf).unwrap();

        let (frame, len) = client_frame(
            CHADDR,
            MessageType::Request,
            0xbadc0de,
            Ipv4Addr::UNSPECIFIED,
            &[
                DhcpOption::ServerIdentifier(SERVER_ID),
                DhcpOption::RequestedIpAddress(POOL_FIRST),
            ],
        );
        assert!(feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).is_none());

        assert_eq!(
            server.binding(&CHADDR).unwrap().state(),
            LeaseState::Offered
        );
    }

    #[test]
    fn exhausted_pool_drops_the_discover() {
        let mut server = Server::<16>::new(POOL_FIRST, POOL_FIRST);
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf).unwrap();

        let (frame, len) = discover(OTHER_MAC, 0x4444);
        assert!(feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).is_none());
        // Retrying does not help while the pool is dry, but does no harm
        assert!(feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).is_none());

        assert_eq!(server.by_ip.len(), 1);
        assert_eq!(server.binding(&OTHER_MAC).unwrap().ip(), None);
        assert_eq!(server.binding(&OTHER_MAC).unwrap().state(), LeaseState::Init);

        check_indices(&server);
    }

    #[test]
    fn excluded_addresses_are_never_offered() {
        let mut server = server();
        let mut options = config();
        static EXCLUDED: [Ipv4Addr; 1] = [POOL_FIRST];
        options.excluded = &EXCLUDED;

        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        let reply =
            feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf).unwrap();

        assert_eq!(Packet::decode(reply.data).unwrap().yiaddr, POOL_SECOND);
    }

    #[test]
    fn declined_address_cools_down_before_reuse() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf).unwrap();

        let (frame, len) = client_frame(
            CHADDR,
            MessageType::Decline,
            XID,
            Ipv4Addr::UNSPECIFIED,
            &[
                DhcpOption::ServerIdentifier(SERVER_ID),
                DhcpOption::RequestedIpAddress(POOL_FIRST),
            ],
        );
        assert!(feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).is_none());

        assert!(server.binding(&CHADDR).is_none());
        assert!(server.quarantine.contains_key(&POOL_FIRST));

        // The lease timer is gone; what remains armed is the cooldown
        assert_eq!(timers.armed.len(), 1);
        assert_eq!(timers.armed[0].1, Token::Quarantine(POOL_FIRST));
        assert_eq!(timers.armed[0].2, Duration::from_secs(300));

        // While cooling down, the next client gets the next address
        let (frame, len) = discover(OTHER_MAC, 0x5555);
        let reply = feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).unwrap();
        assert_eq!(Packet::decode(reply.data).unwrap().yiaddr, POOL_SECOND);

        // Cooldown elapses; the address is allocatable again
        let token = timers.fire();
        server.timed_out(&mut timers, token);

        let (frame, len) = discover(THIRD_MAC, 0x6666);
        let reply = feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).unwrap();
        assert_eq!(Packet::decode(reply.data).unwrap().yiaddr, POOL_FIRST);

        check_indices(&server);
    }

    #[test]
    fn inform_acks_configuration_without_a_lease() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        bind_first_client(&mut server, &options, &mut timers);

        let resets = timers.resets;

        let (frame, len) = client_frame(CHADDR, MessageType::Inform, 0x7777, POOL_FIRST, &[]);
        let reply = feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).unwrap();

        // Unicast back to the address the client already holds
        assert_eq!(reply.dst, POOL_FIRST);

        let ack = Packet::decode(reply.data).unwrap();

        assert_eq!(ack.options.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(ack.options.get(51), None);
        assert_eq!(ack.options.get(58), None);
        assert_eq!(ack.options.get(59), None);
        assert_eq!(ack.options.get(1), Some(&[255, 255, 255, 0][..]));
        assert_eq!(ack.options.get(15), Some(&b"local"[..]));

        // No lease change, no timer change
        assert_eq!(server.binding(&CHADDR).unwrap().state(), LeaseState::Bound);
        assert_eq!(timers.resets, resets);
    }

    #[test]
    fn renewal_request_extends_the_lease() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        bind_first_client(&mut server, &options, &mut timers);

        // A renewing client unicasts a REQUEST with a fresh xid and its
        // address in ciaddr only
        let (frame, len) = client_frame(CHADDR, MessageType::Request, 0x9999, POOL_FIRST, &[]);
        let reply = feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).unwrap();

        let ack = Packet::decode(reply.data).unwrap();
        assert_eq!(ack.options.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.xid, 0x9999);
        assert_eq!(ack.yiaddr, POOL_FIRST);

        let entry = server.binding(&CHADDR).unwrap();
        assert_eq!(entry.xid(), 0x9999);
        assert_eq!(timers.armed.len(), 1);
        assert_eq!(timers.armed[0].2, Duration::from_secs(3600));
        drop(ack);

        // And renewing again later still works
        let (frame, len) = client_frame(CHADDR, MessageType::Request, 0xaaaa, POOL_FIRST, &[]);
        let reply = feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).unwrap();

        assert_eq!(
            Packet::decode(reply.data).unwrap().options.message_type(),
            Some(MessageType::Ack)
        );

        check_indices(&server);
    }

    #[test]
    fn discover_from_a_bound_client_restarts_the_exchange() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        bind_first_client(&mut server, &options, &mut timers);

        // The restart itself is not answered
        assert!(feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf).is_none());

        let entry = server.binding(&CHADDR).unwrap();
        assert_eq!(entry.state(), LeaseState::Init);
        assert_eq!(entry.ip(), Some(POOL_FIRST));

        // The retransmitted DISCOVER is, with the same address
        let reply =
            feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf).unwrap();

        assert_eq!(Packet::decode(reply.data).unwrap().yiaddr, POOL_FIRST);
        assert_eq!(
            server.binding(&CHADDR).unwrap().state(),
            LeaseState::Offered
        );

        check_indices(&server);
    }

    #[test]
    fn rebinding_time_truncates_seven_eighths_of_the_lease() {
        let mut server = server();
        let mut options = config();
        options.lease_duration = Duration::from_secs(100);

        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        let reply =
            feed(&mut server, &options, &mut timers, &discover_frame(), &mut buf).unwrap();
        let offer = Packet::decode(reply.data).unwrap();

        assert_eq!(offer.options.get(51), Some(&100u32.to_be_bytes()[..]));
        assert_eq!(offer.options.get(58), Some(&50u32.to_be_bytes()[..]));
        // 100 * 7 / 8 truncates to 87
        assert_eq!(offer.options.get(59), Some(&87u32.to_be_bytes()[..]));
    }

    #[test]
    fn zero_lease_duration_is_rejected() {
        assert!(matches!(
            ServerOptions::new(SERVER_ID, Duration::from_secs(0)),
            Err(Error::InvalidLeaseDuration)
        ));
    }

    #[test]
    fn rx_udp_emits_a_checksummed_datagram() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        let frame = discover_frame();
        buf[..frame.len()].copy_from_slice(&frame);

        let reply = server
            .rx_udp(&options, &mut timers, &mut buf, frame.len())
            .unwrap();

        assert_eq!(reply.dst, Ipv4Addr::BROADCAST);

        // Decoding verifies the pseudo-header checksum along the way
        let (src, dst, payload) = lan_raw::udp::decode(
            SERVER_ID,
            Ipv4Addr::BROADCAST,
            reply.data,
            Some(SERVER_PORT),
            Some(CLIENT_PORT),
        )
        .unwrap()
        .unwrap();

        assert_eq!(src.port(), SERVER_PORT);
        assert_eq!(dst.port(), CLIENT_PORT);

        let offer = Packet::decode(payload).unwrap();
        assert_eq!(offer.options.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, POOL_FIRST);
    }

    #[test]
    fn shutdown_cancels_timers_and_drops_bindings() {
        let mut server = server();
        let options = config();
        let mut timers = MockTimers::default();
        let mut buf = [0; 1500];

        bind_first_client(&mut server, &options, &mut timers);

        let (frame, len) = discover(OTHER_MAC, 0xbbbb);
        feed(&mut server, &options, &mut timers, &frame[..len], &mut buf).unwrap();

        server.shutdown(&mut timers);

        assert!(server.by_mac.is_empty());
        assert!(server.by_ip.is_empty());
        assert!(timers.armed.is_empty());
    }
}
