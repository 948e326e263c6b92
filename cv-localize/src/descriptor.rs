use crate::Error;
use bitarray::{BitArray, Hamming};
use core::fmt;
use core::str::FromStr;
use space::Metric;

/// The number of bytes in an AKAZE binary descriptor.
pub const DESCRIPTOR_BYTES: usize = 64;

/// A 486-bit AKAZE descriptor padded to 64 bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub BitArray<DESCRIPTOR_BYTES>);

impl Descriptor {
    pub fn new(bytes: [u8; DESCRIPTOR_BYTES]) -> Self {
        Self(BitArray::new(bytes))
    }

    pub fn zero() -> Self {
        Self(BitArray::zeros())
    }

    pub fn bytes(&self) -> &[u8; DESCRIPTOR_BYTES] {
        &self.0
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; DESCRIPTOR_BYTES] {
        self.0.bytes_mut()
    }

    /// The Hamming distance between two descriptors.
    pub fn distance(&self, other: &Self) -> u32 {
        Hamming.distance(&self.0, &other.0)
    }

    /// The bitwise majority of several descriptors. Ties resolve to `0`.
    ///
    /// This is the binary equivalent of the centroid of a cluster.
    pub fn majority<'a>(descriptors: impl IntoIterator<Item = &'a Descriptor>) -> Self {
        let mut counts = [0usize; DESCRIPTOR_BYTES * 8];
        let mut total = 0;
        for descriptor in descriptors {
            total += 1;
            for (bit, count) in counts.iter_mut().enumerate() {
                if descriptor.bytes()[bit / 8] & (1 << (bit % 8)) != 0 {
                    *count += 1;
                }
            }
        }
        let mut majority = [0u8; DESCRIPTOR_BYTES];
        for (bit, &count) in counts.iter().enumerate() {
            if count * 2 > total {
                majority[bit / 8] |= 1 << (bit % 8);
            }
        }
        Self::new(majority)
    }

    /// Parses the whitespace separated decimal bytes used by vocabulary files.
    pub fn from_decimal_bytes<'a>(bytes: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut descriptor = [0u8; DESCRIPTOR_BYTES];
        let mut bytes = bytes.into_iter();
        for byte in descriptor.iter_mut() {
            *byte = bytes.next()?.parse().ok()?;
        }
        Some(Self::new(descriptor))
    }
}

impl From<BitArray<DESCRIPTOR_BYTES>> for Descriptor {
    fn from(bits: BitArray<DESCRIPTOR_BYTES>) -> Self {
        Self(bits)
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor({})", self)
    }
}

/// Lowercase hexadecimal, two characters per byte.
impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.bytes() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Descriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidValue {
            what: "descriptor",
            value: s.to_owned(),
        };
        let s = s.trim();
        if s.len() != DESCRIPTOR_BYTES * 2 || !s.is_ascii() {
            return Err(invalid());
        }
        let mut descriptor = [0u8; DESCRIPTOR_BYTES];
        for (byte, pair) in descriptor.iter_mut().zip(s.as_bytes().chunks(2)) {
            let pair = core::str::from_utf8(pair).map_err(|_| invalid())?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
        }
        Ok(Self::new(descriptor))
    }
}
