//! Primitive values which can be moved through the memory bus.

use zerocopy::{FromBytes, Immutable, IntoBytes};

/// A primitive value which can be read from and written to memory. Memory is big endian.
pub trait Primitive:
    std::fmt::Debug + Default + Clone + Copy + Send + Sync + IntoBytes + FromBytes + Immutable + 'static
{
    /// Size of this primitive, in bytes.
    const SIZE: u32 = size_of::<Self>() as u32;

    /// Reads this primitive from big endian bytes. `bytes` must be exactly `SIZE` long.
    fn read_be_bytes(bytes: &[u8]) -> Self;
    /// Writes this primitive as big endian bytes. `bytes` must be exactly `SIZE` long.
    fn write_be_bytes(self, bytes: &mut [u8]);
    /// Zero extends this primitive.
    fn to_u64(self) -> u64;
    /// Truncates `value` into this primitive.
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_primitive {
    ($($ty:ty),*) => {
        $(
            impl Primitive for $ty {
                #[inline(always)]
                fn read_be_bytes(bytes: &[u8]) -> Self {
                    let mut buf = [0; size_of::<Self>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_be_bytes(buf)
                }

                #[inline(always)]
                fn write_be_bytes(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_be_bytes());
                }

                #[inline(always)]
                fn to_u64(self) -> u64 {
                    self as u64
                }

                #[inline(always)]
                fn from_u64(value: u64) -> Self {
                    value as $ty
                }
            }
        )*
    };
}

impl_primitive!(u8, u16, u32, u64);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn big_endian() {
        let mut buf = [0; 4];
        0x1234_5678u32.write_be_bytes(&mut buf);
        assert_eq!(buf, [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(u16::read_be_bytes(&buf[1..3]), 0x3456);
        assert_eq!(u8::from_u64(0x1FF), 0xFF);
        assert_eq!(<u64 as Primitive>::SIZE, 8);
    }
}
