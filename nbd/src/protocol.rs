//! Oldstyle NBD protocol constants and frame types.
//!
//! This is the pre-negotiation dialect: the server greets a client with a
//! single fixed 152-byte hello announcing the device size and capability
//! flags, then moves straight into transmission. There is no option
//! haggling and exactly one export per server.
//!
//! The dialect also carries one extension: an ENTRUST request, used by a
//! migrating sender to formally hand authority over the device to the
//! receiver once every byte has been copied.

use std::io;

use thiserror::Error;

// Magic values
pub const INIT_PASSWD: &[u8; 8] = b"NBDMAGIC";
pub const INIT_MAGIC: u64 = 0x0000_4202_8186_1253;
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const REPLY_MAGIC: u32 = 0x6744_6698;

// Request types
pub const REQUEST_READ: u16 = 0;
pub const REQUEST_WRITE: u16 = 1;
pub const REQUEST_DISCONNECT: u16 = 2;
pub const REQUEST_FLUSH: u16 = 3;

/// The entrust request as a whole 32-bit flags+type word.
///
/// Entrust predates the split of that word into separate 16-bit flags and
/// type fields, so its type number (65536) does not fit in the type field:
/// on the wire it occupies bit 0 of what is now the flags half. It is
/// matched against the whole word, before the split, and read requests
/// never carry flags, so the two interpretations cannot collide.
pub const REQUEST_ENTRUST_WORD: u32 = 0x0001_0000;

// Hello flags
pub const FLAG_HAS_FLAGS: u32 = 1 << 0;
pub const FLAG_SEND_FLUSH: u32 = 1 << 2;
pub const FLAG_SEND_FUA: u32 = 1 << 3;

// Per-command flags
pub const CMD_FLAG_FUA: u16 = 1 << 0;

// Reply error codes
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;

/// Device sizes are advertised rounded down to this granularity.
pub const SECTOR_SIZE: u64 = 512;

/// 32 MiB is the largest transfer qemu will send; it bounds our buffers.
pub const NBD_MAX_SIZE: u32 = 32 * 1024 * 1024;

/// Round a raw file size down to a whole number of sectors.
#[inline]
pub fn round_to_sectors(size: u64) -> u64 {
    size - (size % SECTOR_SIZE)
}

/// How a request's 64-bit offset is packed on the wire.
///
/// Two incompatible encodings shipped over the protocol's lifetime: the
/// straightforward network-byte-order pack and a fully byte-reversed one.
/// Peers cannot detect which is in use; it is fixed per deployment and
/// both ends of a link must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetFormat {
    #[default]
    BigEndian,
    Reversed,
}

impl OffsetFormat {
    #[inline]
    fn encode(self, offset: u64) -> [u8; 8] {
        match self {
            OffsetFormat::BigEndian => offset.to_be_bytes(),
            OffsetFormat::Reversed => offset.to_le_bytes(),
        }
    }

    #[inline]
    fn decode(self, buf: [u8; 8]) -> u64 {
        match self {
            OffsetFormat::BigEndian => u64::from_be_bytes(buf),
            OffsetFormat::Reversed => u64::from_le_bytes(buf),
        }
    }
}

/// Wire protocol errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:08x}, got 0x{actual:08x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("invalid hello: {reason}")]
    BadHello { reason: &'static str },

    #[error("truncated frame: wanted {wanted} bytes, got {got}")]
    Truncated { wanted: usize, got: usize },

    #[error("request too large: {length_bytes} bytes (max: {max_bytes})")]
    RequestTooLarge { length_bytes: u32, max_bytes: u32 },

    #[error("handle mismatch: expected 0x{expected:016x}, got 0x{actual:016x}")]
    HandleMismatch { expected: u64, actual: u64 },

    #[error("peer replied with error {code}")]
    PeerError { code: u32 },

    #[error("transmission error: {0}")]
    Io(#[from] io::Error),
}

/// Commands a request can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
    Flush,
    Entrust,
}

impl NbdCommand {
    /// Resolve the combined 32-bit flags+type word to a command.
    ///
    /// Entrust is matched on the whole word; everything else on the low
    /// (type) half, leaving the flags half to carry per-command flags.
    pub fn from_word(word: u32) -> Option<Self> {
        if word == REQUEST_ENTRUST_WORD {
            return Some(Self::Entrust);
        }
        match (word & 0xffff) as u16 {
            REQUEST_READ => Some(Self::Read),
            REQUEST_WRITE => Some(Self::Write),
            REQUEST_DISCONNECT => Some(Self::Disconnect),
            REQUEST_FLUSH => Some(Self::Flush),
            _ => None,
        }
    }
}

/// The 152-byte hello frame a server sends on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub size: u64,
    pub flags: u32,
}

impl Hello {
    pub const SIZE_BYTES: usize = 152;

    /// A hello advertising everything this implementation can do.
    pub fn for_device(size: u64) -> Self {
        Self {
            size,
            flags: FLAG_HAS_FLAGS | FLAG_SEND_FLUSH | FLAG_SEND_FUA,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(INIT_PASSWD);
        buf[8..16].copy_from_slice(&INIT_MAGIC.to_be_bytes());
        buf[16..24].copy_from_slice(&self.size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.flags.to_be_bytes());
        // remaining 124 bytes are reserved zeroes
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        if &buf[0..8] != INIT_PASSWD {
            return Err(NbdError::BadHello {
                reason: "wrong passwd",
            });
        }
        let magic = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        if magic != INIT_MAGIC {
            return Err(NbdError::BadHello {
                reason: "wrong magic",
            });
        }
        let size = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        let flags = u32::from_be_bytes(buf[24..28].try_into().unwrap());
        Ok(Self { size, flags })
    }
}

/// A request frame (28 bytes on the wire, plus payload for writes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdRequest {
    pub flags: u16,
    pub kind: u16,
    pub handle: u64,
    pub offset: u64,
    pub len: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    pub fn read(handle: u64, offset: u64, len: u32) -> Self {
        Self {
            flags: 0,
            kind: REQUEST_READ,
            handle,
            offset,
            len,
        }
    }

    pub fn write(handle: u64, offset: u64, len: u32, fua: bool) -> Self {
        Self {
            flags: if fua { CMD_FLAG_FUA } else { 0 },
            kind: REQUEST_WRITE,
            handle,
            offset,
            len,
        }
    }

    pub fn flush(handle: u64) -> Self {
        Self {
            flags: 0,
            kind: REQUEST_FLUSH,
            handle,
            offset: 0,
            len: 0,
        }
    }

    pub fn disconnect() -> Self {
        Self {
            flags: 0,
            kind: REQUEST_DISCONNECT,
            handle: 0,
            offset: 0,
            len: 0,
        }
    }

    pub fn entrust(handle: u64) -> Self {
        Self {
            flags: (REQUEST_ENTRUST_WORD >> 16) as u16,
            kind: (REQUEST_ENTRUST_WORD & 0xffff) as u16,
            handle,
            offset: 0,
            len: 0,
        }
    }

    /// The combined 32-bit flags+type word, as older peers read it.
    #[inline]
    pub fn word(&self) -> u32 {
        ((self.flags as u32) << 16) | self.kind as u32
    }

    /// Resolve to a command, or `None` for types we do not know.
    ///
    /// Unknown types are not a decode error: the server must answer them
    /// with an in-band error and keep the connection alive.
    pub fn command(&self) -> Option<NbdCommand> {
        NbdCommand::from_word(self.word())
    }

    #[inline]
    pub fn has_fua(&self) -> bool {
        self.flags & CMD_FLAG_FUA != 0
    }

    pub fn to_bytes(&self, format: OffsetFormat) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.kind.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..24].copy_from_slice(&format.encode(self.offset));
        buf[24..28].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    /// Parse a request frame. Only the magic is validated here; bounds and
    /// type checks are the caller's policy.
    pub fn from_bytes(
        buf: &[u8; Self::SIZE_BYTES],
        format: OffsetFormat,
    ) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != REQUEST_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: REQUEST_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            flags: u16::from_be_bytes(buf[4..6].try_into().unwrap()),
            kind: u16::from_be_bytes(buf[6..8].try_into().unwrap()),
            handle: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            offset: format.decode(buf[16..24].try_into().unwrap()),
            len: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
        })
    }

    /// The handle of a frame too mangled to parse, for error replies.
    pub fn handle_of(buf: &[u8; Self::SIZE_BYTES]) -> u64 {
        u64::from_be_bytes(buf[8..16].try_into().unwrap())
    }
}

/// A reply frame (16 bytes on the wire, plus payload for successful reads).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdReply {
    pub error: u32,
    pub handle: u64,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: u64) -> Self {
        Self {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error == NBD_OK
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: REPLY_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            error: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            handle: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

const _: () = {
    assert!(Hello::SIZE_BYTES == 152);
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
};
