use core::net::{Ipv4Addr, SocketAddrV4};

use log::trace;

use super::wire::{Decoder, Encoder};

use super::{checksum_accumulate, checksum_finish, Error};

/// Encodes a UDP datagram carrying the payload produced by `payload` into
/// `buf`, with the checksum computed over the IPv4 pseudo-header.
pub fn encode<F, E>(
    buf: &mut [u8],
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: F,
) -> Result<&[u8], E>
where
    F: FnOnce(&mut [u8]) -> Result<usize, E>,
    E: From<Error>,
{
    let mut hdr = UdpPacketHeader::new(src.port(), dst.port());

    hdr.encode_with_payload(buf, *src.ip(), *dst.ip(), payload)
}

/// Decodes a UDP datagram, returning the source and destination socket
/// addresses and the payload, or `None` when a port filter does not match.
#[allow(clippy::type_complexity)]
pub fn decode(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    packet: &[u8],
    filter_src: Option<u16>,
    filter_dst: Option<u16>,
) -> Result<Option<(SocketAddrV4, SocketAddrV4, &[u8])>, Error> {
    let data = UdpPacketHeader::decode_with_payload(packet, src, dst, filter_src, filter_dst)?.map(
        |(hdr, payload)| {
            (
                SocketAddrV4::new(src, hdr.src),
                SocketAddrV4::new(dst, hdr.dst),
                payload,
            )
        },
    );

    Ok(data)
}

/// Represents a parsed UDP header
#[derive(Clone, Debug)]
pub struct UdpPacketHeader {
    /// Source port
    pub src: u16,
    /// Destination port
    pub dst: u16,
    /// UDP length
    pub len: u16,
    /// UDP checksum
    pub sum: u16,
}

impl UdpPacketHeader {
    pub const PROTO: u8 = 17;

    pub const SIZE: usize = 8;
    pub const CHECKSUM_WORD: usize = 3;

    const PSEUDO_SIZE: usize = 12;

    /// Create a new header instance
    pub fn new(src: u16, dst: u16) -> Self {
        Self {
            src,
            dst,
            len: 0,
            sum: 0,
        }
    }

    /// Decodes the header from a byte slice
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut decoder = Decoder::new(data);

        Ok(Self {
            src: decoder.read_u16()?,
            dst: decoder.read_u16()?,
            len: decoder.read_u16()?,
            sum: decoder.read_u16()?,
        })
    }

    /// Encodes the header into the provided buf slice
    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut encoder = Encoder::new(buf);

        encoder.write_u16(self.src)?;
        encoder.write_u16(self.dst)?;
        encoder.write_u16(self.len)?;
        encoder.write_u16(self.sum)?;

        let len = encoder.len();

        Ok(&buf[..len])
    }

    /// Encodes the header and the provided payload into the provided buf
    /// slice, and injects the pseudo-header-aware checksum
    pub fn encode_with_payload<'o, F, E>(
        &mut self,
        buf: &'o mut [u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
        encoder: F,
    ) -> Result<&'o [u8], E>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, E>,
        E: From<Error>,
    {
        if buf.len() < Self::SIZE {
            Err(Error::BufferOverflow)?;
        }

        let (hdr_buf, payload_buf) = buf.split_at_mut(Self::SIZE);

        let payload_len = encoder(payload_buf)?;

        let len = Self::SIZE + payload_len;
        self.len = len as _;

        let hdr_len = self.encode(hdr_buf)?.len();
        assert_eq!(Self::SIZE, hdr_len);

        let packet = &mut buf[..len];

        let checksum = Self::checksum(packet, src, dst);
        self.sum = checksum;

        Self::inject_checksum(packet, checksum);

        Ok(packet)
    }

    /// Decodes the provided packet into a header and a payload slice
    pub fn decode_with_payload(
        packet: &[u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
        filter_src: Option<u16>,
        filter_dst: Option<u16>,
    ) -> Result<Option<(Self, &[u8])>, Error> {
        let hdr = Self::decode(packet)?;

        if let Some(filter_src) = filter_src {
            if filter_src != hdr.src {
                return Ok(None);
            }
        }

        if let Some(filter_dst) = filter_dst {
            if filter_dst != hdr.dst {
                return Ok(None);
            }
        }

        let len = hdr.len as usize;
        if packet.len() < len {
            Err(Error::DataUnderflow)?;
        }

        // A zero checksum on the wire means the sender did not compute one
        if hdr.sum != 0 {
            let checksum = Self::checksum(&packet[..len], src, dst);

            trace!(
                "UDP header decoded, src={}, dst={}, size={}, checksum={}, ours={}",
                hdr.src,
                hdr.dst,
                hdr.len,
                hdr.sum,
                checksum
            );

            if checksum != hdr.sum {
                Err(Error::InvalidChecksum)?;
            }
        }

        let packet = &packet[..len];

        let payload_data = &packet[Self::SIZE..];

        Ok(Some((hdr, payload_data)))
    }

    /// Injects the checksum into the provided packet
    pub fn inject_checksum(packet: &mut [u8], checksum: u16) {
        let checksum = checksum.to_be_bytes();

        let offset = Self::CHECKSUM_WORD << 1;
        packet[offset] = checksum[0];
        packet[offset + 1] = checksum[1];
    }

    /// Computes the checksum for an already encoded packet. A computed value
    /// of zero is emitted as `0xffff`, as plain zero means "not computed".
    pub fn checksum(packet: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
        let mut pseudo = [0; Self::PSEUDO_SIZE];

        pseudo[0..4].copy_from_slice(&src.octets());
        pseudo[4..8].copy_from_slice(&dst.octets());
        pseudo[9] = Self::PROTO;
        pseudo[10..12].copy_from_slice(&u16::to_be_bytes(packet.len() as u16));

        let sum = checksum_accumulate(&pseudo, usize::MAX)
            + checksum_accumulate(packet, Self::CHECKSUM_WORD);

        match checksum_finish(sum) {
            0 => 0xffff,
            sum => sum,
        }
    }
}
