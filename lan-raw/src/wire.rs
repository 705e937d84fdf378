//! Network-byte-order field access over borrowed buffers, shaped after the
//! fields the protocol headers above are made of.

use core::net::Ipv4Addr;

use super::Error;

/// Pulls wire fields off the front of a borrowed buffer. Every read is
/// bounds checked and shrinks what remains; multi-byte integers are
/// big-endian.
pub struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Splits `len` bytes off the front.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.data.len() {
            return Err(Error::DataUnderflow);
        }

        let (head, rest) = self.data.split_at(len);
        self.data = rest;

        Ok(head)
    }

    pub fn read_arr<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut arr = [0; N];
        arr.copy_from_slice(self.read_slice(N)?);

        Ok(arr)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_arr::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        self.read_arr().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        self.read_arr().map(u32::from_be_bytes)
    }

    pub fn read_ip(&mut self) -> Result<Ipv4Addr, Error> {
        self.read_arr::<4>().map(Ipv4Addr::from)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), Error> {
        self.read_slice(len).map(|_| ())
    }

    /// Hands out whatever is left and leaves the decoder empty.
    pub fn remaining(&mut self) -> &'a [u8] {
        core::mem::take(&mut self.data)
    }
}

/// The writing counterpart: appends wire fields to a borrowed buffer,
/// refusing to grow past its end.
pub struct Encoder<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    /// How much has been written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn reserve(&mut self, len: usize) -> Result<&mut [u8], Error> {
        if len > self.buf.len() - self.len {
            return Err(Error::BufferOverflow);
        }

        let slot = &mut self.buf[self.len..self.len + len];
        self.len += len;

        Ok(slot)
    }

    pub fn write_slice(&mut self, data: &[u8]) -> Result<(), Error> {
        self.reserve(data.len())?.copy_from_slice(data);

        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), Error> {
        self.write_slice(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), Error> {
        self.write_slice(&value.to_be_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), Error> {
        self.write_slice(&value.to_be_bytes())
    }

    pub fn write_ip(&mut self, addr: Ipv4Addr) -> Result<(), Error> {
        self.write_slice(&addr.octets())
    }

    /// Appends `len` copies of `value`; zeroed header regions and padding.
    pub fn write_fill(&mut self, len: usize, value: u8) -> Result<(), Error> {
        self.reserve(len)?.fill(value);

        Ok(())
    }
}
