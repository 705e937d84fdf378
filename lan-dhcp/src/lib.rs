#![cfg_attr(not(feature = "std"), no_std)]

use core::fmt;
use core::net::Ipv4Addr;
use core::str::Utf8Error;

use heapless::LinearMap;

use num_enum::TryFromPrimitive;

use lan_raw::wire::{Decoder, Encoder};

pub mod server;
pub mod timer;

#[cfg(feature = "io")]
pub mod io;

/// The well-known BOOTP/DHCP server port
pub const SERVER_PORT: u16 = 67;
/// The well-known BOOTP/DHCP client port
pub const CLIENT_PORT: u16 = 68;

#[derive(Debug)]
pub enum Error {
    DataUnderflow,
    BufferOverflow,
    InvalidUtf8Str(Utf8Error),
    InvalidMessageType,
    MissingCookie,
    InvalidOpcode,
    InvalidHtype,
    InvalidHlen,
    InvalidPacket,
    InvalidLeaseDuration,
}

impl From<lan_raw::Error> for Error {
    fn from(value: lan_raw::Error) -> Self {
        match value {
            lan_raw::Error::DataUnderflow => Self::DataUnderflow,
            lan_raw::Error::BufferOverflow => Self::BufferOverflow,
            lan_raw::Error::InvalidChecksum => Self::InvalidPacket,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            Self::DataUnderflow => "Options run past the end of the payload",
            Self::BufferOverflow => "Buffer overflow",
            Self::InvalidUtf8Str(_) => "Invalid UTF-8 string",
            Self::InvalidMessageType => "Invalid message type",
            Self::MissingCookie => "Missing magic cookie",
            Self::InvalidOpcode => "Invalid BOOTP opcode",
            Self::InvalidHtype => "Invalid hardware type",
            Self::InvalidHlen => "Invalid hardware address length",
            Self::InvalidPacket => "Invalid packet",
            Self::InvalidLeaseDuration => "Invalid lease duration",
        };

        write!(f, "{}", str)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// A client hardware address; the leading `hlen` bytes of `chaddr`.
pub type Mac = [u8; 6];

///
/// DHCP Message Type.
///
/// # Standards
///
/// The semantics of the various DHCP message types are described in RFC 2131
/// (see Table 2). Their numeric values are described in Section 9.6 of
/// RFC 2132.
///
#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate available servers.
    Discover = 1,

    /// Server to client in response to DHCPDISCOVER with offer of
    /// configuration parameters.
    Offer = 2,

    /// Client message to servers either (a) requesting offered parameters
    /// from one server and implicitly declining offers from all others,
    /// (b) confirming correctness of a previously allocated address, or
    /// (c) extending the lease on a particular network address.
    Request = 3,

    /// Client to server indicating network address is already in use.
    Decline = 4,

    /// Server to client with configuration parameters, including committed
    /// network address.
    Ack = 5,

    /// Server to client indicating client's notion of network address is
    /// incorrect or the client's lease has expired.
    Nak = 6,

    /// Client to server relinquishing network address and cancelling the
    /// remaining lease.
    Release = 7,

    /// Client to server, asking only for local configuration parameters;
    /// client already has an externally configured network address.
    Inform = 8,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };

        write!(f, "{}", str)
    }
}

/// DHCP Packet Structure
#[derive(Clone, Debug)]
pub struct Packet<'a> {
    pub reply: bool,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub broadcast: bool,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: Options<'a>,
}

impl<'a> Packet<'a> {
    pub const COOKIE: [u8; 4] = [99, 130, 83, 99];

    const BOOT_REQUEST: u8 = 1; // From Client
    const BOOT_REPLY: u8 = 2; // From Server

    const HTYPE_ETHERNET: u8 = 1;
    const HLEN_ETHERNET: u8 = 6;

    const BROADCAST_FLAG: u16 = 0x8000;

    const SERVER_NAME_AND_FILE_NAME: usize = 64 + 128;

    // The BOOTP minimum; shorter frames are padded up to it on encode
    const MIN_WIRE_SIZE: usize = 300;

    const END: u8 = 255;
    const PAD: u8 = 0;

    /// Derives a server reply frame from a client request: same xid, chaddr,
    /// giaddr and broadcast flag; `yiaddr` carries the assigned address where
    /// the reply announces one.
    pub fn new_reply<'b>(
        &self,
        yiaddr: Option<Ipv4Addr>,
        siaddr: Ipv4Addr,
        options: Options<'b>,
    ) -> Packet<'b> {
        Packet {
            reply: true,
            hops: 0,
            xid: self.xid,
            secs: 0,
            broadcast: self.broadcast,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: yiaddr.unwrap_or(Ipv4Addr::UNSPECIFIED),
            siaddr,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            options,
        }
    }

    /// The client hardware address, i.e. the valid prefix of `chaddr`.
    pub fn mac(&self) -> Mac {
        let mut mac = Mac::default();
        mac.copy_from_slice(&self.chaddr[..6]);

        mac
    }

    /// Parses the packet from a byte slice
    pub fn decode(data: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = Decoder::new(data);

        let reply = match bytes.read_u8()? {
            Self::BOOT_REQUEST => false,
            Self::BOOT_REPLY => true,
            _ => Err(Error::InvalidOpcode)?,
        };

        if bytes.read_u8()? != Self::HTYPE_ETHERNET {
            Err(Error::InvalidHtype)?;
        }

        if bytes.read_u8()? != Self::HLEN_ETHERNET {
            Err(Error::InvalidHlen)?;
        }

        Ok(Self {
            reply,
            hops: bytes.read_u8()?,
            xid: bytes.read_u32()?,
            secs: bytes.read_u16()?,
            broadcast: bytes.read_u16()? & Self::BROADCAST_FLAG != 0,
            ciaddr: bytes.read_ip()?,
            yiaddr: bytes.read_ip()?,
            siaddr: bytes.read_ip()?,
            giaddr: bytes.read_ip()?,
            chaddr: bytes.read_arr()?,
            options: {
                bytes.skip(Self::SERVER_NAME_AND_FILE_NAME)?;

                if bytes.read_arr()? != Self::COOKIE {
                    Err(Error::MissingCookie)?;
                }

                Options::parse(bytes.remaining())?
            },
        })
    }

    /// Encodes the packet into the provided buf slice
    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut bytes = Encoder::new(buf);

        bytes.write_u8(if self.reply {
            Self::BOOT_REPLY
        } else {
            Self::BOOT_REQUEST
        })?;
        bytes.write_u8(Self::HTYPE_ETHERNET)?;
        bytes.write_u8(Self::HLEN_ETHERNET)?;
        bytes.write_u8(self.hops)?;
        bytes.write_u32(self.xid)?;
        bytes.write_u16(self.secs)?;
        bytes.write_u16(if self.broadcast {
            Self::BROADCAST_FLAG
        } else {
            0
        })?;
        bytes.write_ip(self.ciaddr)?;
        bytes.write_ip(self.yiaddr)?;
        bytes.write_ip(self.siaddr)?;
        bytes.write_ip(self.giaddr)?;
        bytes.write_slice(&self.chaddr)?;
        bytes.write_fill(Self::SERVER_NAME_AND_FILE_NAME, 0)?;
        bytes.write_slice(&Self::COOKIE)?;

        self.options.encode(&mut bytes)?;

        bytes.write_u8(Self::END)?;

        if bytes.len() < Self::MIN_WIRE_SIZE {
            bytes.write_fill(Self::MIN_WIRE_SIZE - bytes.len(), Self::PAD)?;
        }

        let len = bytes.len();

        Ok(&buf[..len])
    }
}

/// Capacity of the per-message options table; also the upper bound on the
/// number of options in a built reply.
const OPTIONS: usize = 24;

/// The options area of a DHCP message.
///
/// Either a table parsed off the wire (tag to value; a duplicated tag
/// overwrites its predecessor) or a list of typed options assembled for a
/// reply. Both representations iterate and encode; the table additionally
/// supports tag lookup.
#[derive(Clone, Debug)]
pub struct Options<'a>(OptionsInner<'a>);

#[derive(Clone, Debug)]
enum OptionsInner<'a> {
    Table(LinearMap<u8, &'a [u8], OPTIONS>),
    DataSlice(&'a [DhcpOption<'a>]),
}

/// The order in which interpreted options appear in emitted frames; anything
/// else follows in table order, before the end marker.
const CANONICAL_ORDER: &[u8] = &[
    DHCP_MESSAGE_TYPE,
    SERVER_IDENTIFIER,
    SUBNET_MASK,
    ROUTER,
    DOMAIN_NAME_SERVER,
    IP_ADDRESS_LEASE_TIME,
    RENEWAL_TIME,
    REBINDING_TIME,
    INTERFACE_MTU,
    DOMAIN_NAME,
];

impl<'a> Options<'a> {
    pub const fn new(options: &'a [DhcpOption<'a>]) -> Self {
        Self(OptionsInner::DataSlice(options))
    }

    /// A scratch array large enough for any reply this crate builds.
    #[inline(always)]
    pub const fn buf() -> [DhcpOption<'a>; 12] {
        [DhcpOption::Unrecognized(Packet::PAD, &[]); 12]
    }

    /// Parses the options area following the magic cookie into a table.
    ///
    /// Pad bytes are skipped and the end option terminates the walk even if
    /// trailing bytes remain; running out of input without an end option is
    /// an underflow. Interpreted options are validated; unknown tags are
    /// retained verbatim.
    pub fn parse(data: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = Decoder::new(data);
        let mut table = LinearMap::new();

        loop {
            let tag = bytes.read_u8()?;

            if tag == Packet::PAD {
                continue;
            }

            if tag == Packet::END {
                break;
            }

            let len = bytes.read_u8()? as usize;
            let value = bytes.read_slice(len)?;

            DhcpOption::parse(tag, value)?;

            table
                .insert(tag, value)
                .map_err(|_| Error::BufferOverflow)?;
        }

        Ok(Self(OptionsInner::Table(table)))
    }

    /// Looks a raw option value up by tag; parsed tables only.
    pub fn get(&self, tag: u8) -> Option<&'a [u8]> {
        match &self.0 {
            OptionsInner::Table(table) => table.get(&tag).copied(),
            OptionsInner::DataSlice(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = DhcpOption<'a>> + '_ {
        match &self.0 {
            OptionsInner::Table(table) => EitherIterator::First(
                table
                    .iter()
                    .filter_map(|(tag, value)| DhcpOption::parse(*tag, *value).ok()),
            ),
            OptionsInner::DataSlice(data) => EitherIterator::Second(data.iter().cloned()),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.iter().find_map(|option| {
            if let DhcpOption::MessageType(mt) = option {
                Some(mt)
            } else {
                None
            }
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.iter().find_map(|option| {
            if let DhcpOption::ServerIdentifier(ip) = option {
                Some(ip)
            } else {
                None
            }
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.iter().find_map(|option| {
            if let DhcpOption::RequestedIpAddress(ip) = option {
                Some(ip)
            } else {
                None
            }
        })
    }

    pub fn parameter_request_list(&self) -> Option<&'a [u8]> {
        self.iter().find_map(|option| {
            if let DhcpOption::ParameterRequestList(prl) = option {
                Some(prl)
            } else {
                None
            }
        })
    }

    pub fn client_identifier(&self) -> Option<&'a [u8]> {
        self.iter().find_map(|option| {
            if let DhcpOption::ClientIdentifier(id) = option {
                Some(id)
            } else {
                None
            }
        })
    }

    pub fn host_name(&self) -> Option<&'a str> {
        self.iter().find_map(|option| {
            if let DhcpOption::HostName(name) = option {
                Some(name)
            } else {
                None
            }
        })
    }

    fn encode(&self, out: &mut Encoder<'_>) -> Result<(), Error> {
        match &self.0 {
            OptionsInner::Table(table) => {
                for tag in CANONICAL_ORDER {
                    if let Some(value) = table.get(tag) {
                        encode_raw(*tag, value, out)?;
                    }
                }

                for (tag, value) in table.iter() {
                    if !CANONICAL_ORDER.contains(tag) {
                        encode_raw(*tag, value, out)?;
                    }
                }
            }
            OptionsInner::DataSlice(options) => {
                for option in *options {
                    option.encode(out)?;
                }
            }
        }

        Ok(())
    }
}

fn encode_raw(tag: u8, value: &[u8], out: &mut Encoder<'_>) -> Result<(), Error> {
    out.write_u8(tag)?;
    out.write_u8(value.len() as _)?;
    out.write_slice(value)?;

    Ok(())
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DhcpOption<'a> {
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(&'a [u8]),
    RequestedIpAddress(Ipv4Addr),
    HostName(&'a str),
    ClientIdentifier(&'a [u8]),
    Router(Ipv4Addrs<'a>),
    DomainNameServer(Ipv4Addrs<'a>),
    IpAddressLeaseTime(u32),
    RenewalTime(u32),
    RebindingTime(u32),
    SubnetMask(Ipv4Addr),
    InterfaceMtu(u16),
    DomainName(&'a str),
    Unrecognized(u8, &'a [u8]),
}

impl<'a> DhcpOption<'a> {
    fn parse(tag: u8, value: &'a [u8]) -> Result<Self, Error> {
        let option = match tag {
            DHCP_MESSAGE_TYPE => Self::MessageType(
                MessageType::try_from_primitive(byte(value)?)
                    .map_err(|_| Error::InvalidMessageType)?,
            ),
            SERVER_IDENTIFIER => Self::ServerIdentifier(arr::<4>(value)?.into()),
            PARAMETER_REQUEST_LIST => Self::ParameterRequestList(value),
            REQUESTED_IP_ADDRESS => Self::RequestedIpAddress(arr::<4>(value)?.into()),
            HOST_NAME => {
                Self::HostName(core::str::from_utf8(value).map_err(Error::InvalidUtf8Str)?)
            }
            CLIENT_IDENTIFIER => Self::ClientIdentifier(value),
            ROUTER => Self::Router(Ipv4Addrs(Ipv4AddrsInner::ByteSlice(value))),
            DOMAIN_NAME_SERVER => {
                Self::DomainNameServer(Ipv4Addrs(Ipv4AddrsInner::ByteSlice(value)))
            }
            IP_ADDRESS_LEASE_TIME => Self::IpAddressLeaseTime(u32::from_be_bytes(arr(value)?)),
            RENEWAL_TIME => Self::RenewalTime(u32::from_be_bytes(arr(value)?)),
            REBINDING_TIME => Self::RebindingTime(u32::from_be_bytes(arr(value)?)),
            SUBNET_MASK => Self::SubnetMask(arr::<4>(value)?.into()),
            INTERFACE_MTU => Self::InterfaceMtu(u16::from_be_bytes(arr(value)?)),
            DOMAIN_NAME => {
                Self::DomainName(core::str::from_utf8(value).map_err(Error::InvalidUtf8Str)?)
            }
            _ => Self::Unrecognized(tag, value),
        };

        Ok(option)
    }

    fn encode(&self, out: &mut Encoder<'_>) -> Result<(), Error> {
        out.write_u8(self.code())?;

        self.data(|data| {
            out.write_u8(data.len() as _)?;
            out.write_slice(data)?;

            Ok(())
        })
    }

    pub const fn code(&self) -> u8 {
        match self {
            Self::MessageType(_) => DHCP_MESSAGE_TYPE,
            Self::ServerIdentifier(_) => SERVER_IDENTIFIER,
            Self::ParameterRequestList(_) => PARAMETER_REQUEST_LIST,
            Self::RequestedIpAddress(_) => REQUESTED_IP_ADDRESS,
            Self::HostName(_) => HOST_NAME,
            Self::ClientIdentifier(_) => CLIENT_IDENTIFIER,
            Self::Router(_) => ROUTER,
            Self::DomainNameServer(_) => DOMAIN_NAME_SERVER,
            Self::IpAddressLeaseTime(_) => IP_ADDRESS_LEASE_TIME,
            Self::RenewalTime(_) => RENEWAL_TIME,
            Self::RebindingTime(_) => REBINDING_TIME,
            Self::SubnetMask(_) => SUBNET_MASK,
            Self::InterfaceMtu(_) => INTERFACE_MTU,
            Self::DomainName(_) => DOMAIN_NAME,
            Self::Unrecognized(tag, _) => *tag,
        }
    }

    fn data(&self, mut f: impl FnMut(&[u8]) -> Result<(), Error>) -> Result<(), Error> {
        match self {
            Self::MessageType(mtype) => f(&[*mtype as _]),
            Self::ServerIdentifier(addr) => f(&addr.octets()),
            Self::ParameterRequestList(prl) => f(prl),
            Self::RequestedIpAddress(addr) => f(&addr.octets()),
            Self::HostName(name) => f(name.as_bytes()),
            Self::ClientIdentifier(id) => f(id),
            Self::Router(addrs) | Self::DomainNameServer(addrs) => {
                let mut octets = [0; 4 * IPS];
                let mut offset = 0;

                for addr in addrs.iter().take(IPS) {
                    octets[offset..offset + 4].copy_from_slice(&addr.octets());
                    offset += 4;
                }

                f(&octets[..offset])
            }
            Self::IpAddressLeaseTime(secs) | Self::RenewalTime(secs) | Self::RebindingTime(secs) => {
                f(&secs.to_be_bytes())
            }
            Self::SubnetMask(mask) => f(&mask.octets()),
            Self::InterfaceMtu(mtu) => f(&mtu.to_be_bytes()),
            Self::Unrecognized(_, data) => f(data),
            Self::DomainName(name) => f(name.as_bytes()),
        }
    }
}

fn byte(value: &[u8]) -> Result<u8, Error> {
    arr::<1>(value).map(|arr| arr[0])
}

fn arr<const N: usize>(value: &[u8]) -> Result<[u8; N], Error> {
    value.try_into().map_err(|_| Error::DataUnderflow)
}

/// Upper bound on the addresses in a single router/DNS option.
const IPS: usize = 4;

/// A list of IPv4 addresses, either borrowed from the wire (4 bytes each) or
/// from typed data.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Ipv4Addrs<'a>(Ipv4AddrsInner<'a>);

impl<'a> Ipv4Addrs<'a> {
    pub const fn new(addrs: &'a [Ipv4Addr]) -> Self {
        Self(Ipv4AddrsInner::DataSlice(addrs))
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + 'a {
        self.0.iter()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Ipv4AddrsInner<'a> {
    ByteSlice(&'a [u8]),
    DataSlice(&'a [Ipv4Addr]),
}

impl<'a> Ipv4AddrsInner<'a> {
    fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + 'a {
        match *self {
            Self::ByteSlice(data) => {
                EitherIterator::First((0..data.len() / 4).map(move |index| {
                    let octets: [u8; 4] = data[index * 4..index * 4 + 4].try_into().unwrap();

                    octets.into()
                }))
            }
            Self::DataSlice(data) => EitherIterator::Second(data.iter().cloned()),
        }
    }
}

enum EitherIterator<F, S> {
    First(F),
    Second(S),
}

impl<F, S> Iterator for EitherIterator<F, S>
where
    F: Iterator,
    S: Iterator<Item = F::Item>,
{
    type Item = F::Item;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::First(iter) => iter.next(),
            Self::Second(iter) => iter.next(),
        }
    }
}

// DHCP Options
const SUBNET_MASK: u8 = 1;
const ROUTER: u8 = 3;
const DOMAIN_NAME_SERVER: u8 = 6;
const HOST_NAME: u8 = 12;
const DOMAIN_NAME: u8 = 15;
const INTERFACE_MTU: u8 = 26;

// DHCP Extensions
const REQUESTED_IP_ADDRESS: u8 = 50;
const IP_ADDRESS_LEASE_TIME: u8 = 51;
const DHCP_MESSAGE_TYPE: u8 = 53;
const SERVER_IDENTIFIER: u8 = 54;
const PARAMETER_REQUEST_LIST: u8 = 55;
const RENEWAL_TIME: u8 = 58;
const REBINDING_TIME: u8 = 59;
const CLIENT_IDENTIFIER: u8 = 61;
