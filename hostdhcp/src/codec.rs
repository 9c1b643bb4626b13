use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut};

/// Returned when a buffer runs out before a value is complete.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unexpected end of buffer")]
pub struct Eof;

pub trait Decode: Sized {
    fn decode<B>(buf: B) -> Result<Self, Eof>
    where
        B: Buf;
}

pub trait Encode {
    fn encode<B>(&self, buf: B)
    where
        B: BufMut;
}

impl Encode for u8 {
    fn encode<B>(&self, mut buf: B)
    where
        B: BufMut,
    {
        buf.put_u8(*self);
    }
}

impl Decode for u8 {
    fn decode<B>(mut buf: B) -> Result<Self, Eof>
    where
        B: Buf,
    {
        if buf.remaining() < 1 {
            Err(Eof)
        } else {
            Ok(buf.get_u8())
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode<B>(&self, mut buf: B)
    where
        B: BufMut,
    {
        buf.put_slice(self);
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode<B>(mut buf: B) -> Result<Self, Eof>
    where
        B: Buf,
    {
        if buf.remaining() < N {
            return Err(Eof);
        }

        let mut array = [0; N];
        buf.copy_to_slice(&mut array);
        Ok(array)
    }
}

macro_rules! impl_int {
    ($($t:ty),*) => {
        $(
            impl Encode for $t {
                fn encode<B: BufMut>(&self, buf: B) {
                    self.to_be_bytes().encode(buf);
                }
            }

            impl Decode for $t {
                fn decode<B: Buf>(buf: B) -> Result<Self, Eof> {
                    <[u8; core::mem::size_of::<Self>()]>::decode(buf).map(Self::from_be_bytes)
                }
            }

        )*
    };
}

impl_int! { u16, u32, u64 }

impl Encode for Ipv4Addr {
    fn encode<B>(&self, buf: B)
    where
        B: BufMut,
    {
        self.octets().encode(buf);
    }
}

impl Decode for Ipv4Addr {
    fn decode<B>(buf: B) -> Result<Self, Eof>
    where
        B: Buf,
    {
        <[u8; 4]>::decode(buf).map(Self::from)
    }
}

impl Encode for Ipv6Addr {
    fn encode<B>(&self, buf: B)
    where
        B: BufMut,
    {
        self.octets().encode(buf);
    }
}

impl Decode for Ipv6Addr {
    fn decode<B>(buf: B) -> Result<Self, Eof>
    where
        B: Buf,
    {
        <[u8; 16]>::decode(buf).map(Self::from)
    }
}

/// Splits `len` bytes off the front of `buf`.
pub fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], Eof> {
    if buf.len() < len {
        return Err(Eof);
    }

    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::{take, Decode, Encode, Eof};

    #[test]
    fn int_big_endian() {
        let mut buf = Vec::new();
        0x0102_0304u32.encode(&mut buf);
        0x0506u16.encode(&mut buf);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);

        let mut rd = &buf[..];
        assert_eq!(u32::decode(&mut rd), Ok(0x0102_0304));
        assert_eq!(u16::decode(&mut rd), Ok(0x0506));
        assert_eq!(u8::decode(&mut rd), Err(Eof));
    }

    #[test]
    fn short_address_is_eof() {
        let mut rd = &[10u8, 0, 0][..];
        assert_eq!(Ipv4Addr::decode(&mut rd), Err(Eof));
    }

    #[test]
    fn take_splits() {
        let mut rd = &[1u8, 2, 3][..];
        assert_eq!(take(&mut rd, 2), Ok(&[1u8, 2][..]));
        assert_eq!(rd, &[3]);
        assert_eq!(take(&mut rd, 2), Err(Eof));
    }
}
