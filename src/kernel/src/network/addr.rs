//! 128-bit endpoint addresses and prefix masks

use core::fmt;
use core::str::FromStr;
use serde::Deserialize;
use std::net::Ipv6Addr;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::error::KernelError;

/// Endpoint identifier; the all-zero address belongs to the kernel
#[repr(transparent)]
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, AsBytes, FromBytes, FromZeroes,
    Unaligned, Deserialize,
)]
#[serde(try_from = "String")]
pub struct Address(pub [u8; 16]);

impl Address {
    pub const ZERO: Address = Address([0; 16]);
    pub const KERNEL: Address = Address::ZERO;

    pub const fn new(bytes: [u8; 16]) -> Self {
        Address(bytes)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }

    pub fn as_u128(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }

    pub fn from_u128(v: u128) -> Self {
        Address(v.to_be_bytes())
    }
}

impl From<Ipv6Addr> for Address {
    fn from(addr: Ipv6Addr) -> Self {
        Address(addr.octets())
    }
}

impl From<Address> for Ipv6Addr {
    fn from(addr: Address) -> Self {
        Ipv6Addr::from(addr.0)
    }
}

impl FromStr for Address {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv6Addr>()
            .map(Address::from)
            .map_err(|_| KernelError::InvalidArg)
    }
}

impl TryFrom<String> for Address {
    type Error = KernelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", Ipv6Addr::from(*self))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Address prefix: `len` leading bits of `addr`
#[derive(Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct AddressMask {
    addr: Address,
    len: u8,
}

impl AddressMask {
    /// Prefix all context addresses are generated in
    pub const SYSTEM: AddressMask = AddressMask {
        addr: Address([0x7e, 0x8e, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
        len: 24,
    };

    /// Matches every address
    pub const ANY: AddressMask = AddressMask { addr: Address::ZERO, len: 0 };

    pub fn new(addr: Address, len: u8) -> Self {
        AddressMask { addr, len: len.min(128) }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    fn bits(&self) -> u128 {
        match self.len {
            0 => 0,
            n => u128::MAX << (128 - n as u32),
        }
    }

    pub fn matches(&self, addr: &Address) -> bool {
        let bits = self.bits();
        (addr.as_u128() & bits) == (self.addr.as_u128() & bits)
    }
}

impl FromStr for AddressMask {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s.split_once('/').ok_or(KernelError::InvalidArg)?;
        let len: u8 = len.trim().parse().map_err(|_| KernelError::InvalidArg)?;
        if len > 128 {
            return Err(KernelError::InvalidArg);
        }
        Ok(AddressMask::new(addr.trim().parse()?, len))
    }
}

impl TryFrom<String> for AddressMask {
    type Error = KernelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for AddressMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl fmt::Debug for AddressMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
