//! Kernel error taxonomy
//!
//! Every fallible operation returns [`Result`]. Errors travel inside
//! protocol replies as numeric codes, so each variant owns a stable code.

use crate::network::packet::Packet;
use thiserror::Error;

/// Error type for kernel operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Argument outside the operation's domain
    #[error("invalid argument")]
    InvalidArg,
    /// No memory range, packet slot or record left
    #[error("out of memory")]
    OutOfMemory,
    #[error("queue full")]
    QueueFull,
    #[error("queue empty")]
    QueueEmpty,
    /// Unknown public interrupt alias
    #[error("no such interrupt alias")]
    NoSuchInterruptAlias,
    /// Mapping exceeds or overlaps its physical range
    #[error("memory range out of bounds")]
    OutOfBounds,
    #[error("protocol version mismatch")]
    ProtocolVersionMismatch,
    #[error("bad protocol command")]
    BadProtocolCommand,
    #[error("no route to host")]
    NoRouteToHost,
    /// No context owns the routing destination
    #[error("address unreachable")]
    AddressUnreachable,
    #[error("address in use")]
    AddressInUse,
    /// Failure reported by the host substrate, with its errno
    #[error("i/o error (errno {0})")]
    Io(i32),
    /// A filter consumed the packet
    #[error("packet filtered out")]
    PacketFilteredOut,
    /// A receive with stop-on-other gave up after handling another packet
    #[error("stopped for other socket")]
    StoppedForOtherSocket,
    /// Nothing queued for the caller; the caller should block
    #[error("no packet available")]
    NoPacketAvailable,
    #[error("yielded to a blocked context")]
    YieldedToBlocked,
    #[error("context yielded back without a packet")]
    ContextYieldedBack,
    #[error("context finished")]
    ContextFinished,
    #[error("does not exist")]
    DoesNotExist,
    #[error("wrong protocol")]
    WrongProtocol,
    #[error("no destination port")]
    NoDestPort,
    #[error("socket not bound")]
    SocketNotBound,
    #[error("port already bound")]
    PortAlreadyBound,
    #[error("all anonymous ports bound")]
    AllAnonPortsBound,
    #[error("hop limit exceeded")]
    HopLimitExceeded,
    #[error("resource in use")]
    ResourceInUse,
    #[error("resource not in use")]
    ResourceNotInUse,
    /// Header option whose type asks for rejection
    #[error("option not supported")]
    OptionNotSupported,
    #[error("fragments not supported")]
    FragmentsNotSupported,
    #[error("not implemented")]
    NotImplemented,
    /// Every scheduled context is waiting for a packet
    #[error("all contexts blocked")]
    AllContextsBlocked,
}

/// Result type for kernel operations
pub type Result<T> = core::result::Result<T, KernelError>;

const ERROR_CODES: [KernelError; 31] = [
    KernelError::InvalidArg,
    KernelError::OutOfMemory,
    KernelError::QueueFull,
    KernelError::QueueEmpty,
    KernelError::NoSuchInterruptAlias,
    KernelError::OutOfBounds,
    KernelError::ProtocolVersionMismatch,
    KernelError::BadProtocolCommand,
    KernelError::NoRouteToHost,
    KernelError::AddressUnreachable,
    KernelError::AddressInUse,
    KernelError::Io(0),
    KernelError::PacketFilteredOut,
    KernelError::StoppedForOtherSocket,
    KernelError::NoPacketAvailable,
    KernelError::YieldedToBlocked,
    KernelError::ContextYieldedBack,
    KernelError::ContextFinished,
    KernelError::DoesNotExist,
    KernelError::WrongProtocol,
    KernelError::NoDestPort,
    KernelError::SocketNotBound,
    KernelError::PortAlreadyBound,
    KernelError::AllAnonPortsBound,
    KernelError::HopLimitExceeded,
    KernelError::ResourceInUse,
    KernelError::ResourceNotInUse,
    KernelError::OptionNotSupported,
    KernelError::FragmentsNotSupported,
    KernelError::NotImplemented,
    KernelError::AllContextsBlocked,
];

impl KernelError {
    /// Converts the error to its wire code; zero is reserved for success
    pub fn to_error_code(&self) -> u32 {
        let kind = core::mem::discriminant(self);
        ERROR_CODES
            .iter()
            .position(|e| core::mem::discriminant(e) == kind)
            .map_or(0, |i| i as u32 + 1)
    }

    /// Inverse of [`to_error_code`](Self::to_error_code); `Ok(())` for zero
    pub fn from_error_code(code: u32) -> core::result::Result<(), KernelError> {
        match code {
            0 => Ok(()),
            n => Err(ERROR_CODES
                .get(n as usize - 1)
                .copied()
                .unwrap_or(KernelError::InvalidArg)),
        }
    }

    pub fn last_os_error() -> Self {
        KernelError::Io(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

/// A failed hand-off that returns the packet to the caller
///
/// Sending or enqueuing moves a packet; when the move fails the packet comes
/// back here so the caller may quote it in an ICMP error or retry. A
/// packet consumed on the way (by an outbound filter, say) is not returned.
#[derive(Debug)]
pub struct Bounced {
    pub error: KernelError,
    pub packet: Option<Packet>,
}

impl Bounced {
    pub fn new(error: KernelError, packet: Packet) -> Self {
        Bounced { error, packet: Some(packet) }
    }

    pub fn lost(error: KernelError) -> Self {
        Bounced { error, packet: None }
    }
}

impl From<Bounced> for KernelError {
    fn from(bounced: Bounced) -> Self {
        bounced.error
    }
}

impl core::fmt::Display for Bounced {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable_and_reversible() {
        assert_eq!(KernelError::InvalidArg.to_error_code(), 1);
        assert_eq!(KernelError::BadProtocolCommand.to_error_code(), 8);
        for err in ERROR_CODES {
            let code = err.to_error_code();
            assert_ne!(code, 0);
            assert_eq!(KernelError::from_error_code(code), Err(err));
        }
        assert_eq!(KernelError::from_error_code(0), Ok(()));
        assert_eq!(KernelError::Io(5).to_error_code(), KernelError::Io(0).to_error_code());
    }
}
