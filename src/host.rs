//! Capabilities the protocol core consumes: the bus transport and the
//! DMA-aware allocator. Implementations live outside this crate.

use core::{ops::Range, ptr::NonNull, slice, time::Duration};

use sdio_host::common_cmd::ResponseLen;

use crate::err::{AllocError, BusError};

/// Expected response class of a command, in SD/MMC specification terms.
///
/// Constructed once per command together with the opcode; the shape
/// predicates below replace the flag tables hosts usually keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
    /// No response.
    #[default]
    None,
    R1,
    /// R1 followed by a busy signal on DAT0.
    R1b,
    /// 136-bit response (CID or CSD register image).
    R2,
    /// OCR register, no CRC protection.
    R3,
    /// SDIO operation conditions, no CRC protection.
    R4,
    /// SDIO register access response.
    R5,
    /// Published RCA response.
    R6,
    /// Card interface condition echo.
    R7,
}

impl ResponseKind {
    pub fn length(self) -> ResponseLen {
        match self {
            ResponseKind::None => ResponseLen::Zero,
            ResponseKind::R2 => ResponseLen::R136,
            _ => ResponseLen::R48,
        }
    }

    /// The card holds DAT0 low until it leaves the busy state.
    pub fn has_busy(self) -> bool {
        matches!(self, ResponseKind::R1b)
    }

    pub fn check_crc(self) -> bool {
        !matches!(self, ResponseKind::None | ResponseKind::R3 | ResponseKind::R4)
    }

    pub fn check_index(self) -> bool {
        !matches!(
            self,
            ResponseKind::None | ResponseKind::R2 | ResponseKind::R3 | ResponseKind::R4
        )
    }
}

/// Direction and bytes of a data phase.
#[derive(Debug)]
pub enum Transfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// Data phase descriptor attached to a command.
#[derive(Debug)]
pub struct Data<'a> {
    pub transfer: Transfer<'a>,
    /// Block length on the wire; the buffer length must be a multiple of it.
    pub block_len: usize,
}

impl Data<'_> {
    pub fn len(&self) -> usize {
        match &self.transfer {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn block_count(&self) -> usize {
        self.len() / self.block_len
    }

    pub fn is_read(&self) -> bool {
        matches!(self.transfer, Transfer::Read(_))
    }
}

/// One bus transaction. Created fresh per exchange, never reused.
///
/// The transport writes the raw response words into `response`; for 48-bit
/// responses only `response[0]` is meaningful. 136-bit responses use the
/// register bit numbering: `response[3]` holds register bits 127:96 and the
/// CRC byte position (bits 7:0) may be zeroed by hosts that strip it.
///
/// SPI-mode hosts place the R1 token in bits 7:0 of `response[0]` and, for
/// the 16-bit SPI R2 format, the second status byte in bits 15:8.
#[derive(Debug, Default)]
pub struct Command<'a> {
    pub opcode: u8,
    pub arg: u32,
    pub resp: ResponseKind,
    pub data: Option<Data<'a>>,
    /// Per-command timeout; resolved against the host default before the
    /// transaction is submitted.
    pub timeout: Option<Duration>,
    /// Raw response words, filled by the transport.
    pub response: [u32; 4],
    /// Set by the transport when it closed a multi-block transfer with an
    /// automatic STOP_TRANSMISSION of its own.
    pub auto_stop: bool,
}

impl<'a> Command<'a> {
    pub fn new(opcode: u8, arg: u32, resp: ResponseKind) -> Self {
        Command {
            opcode,
            arg,
            resp,
            ..Default::default()
        }
    }

    pub fn with_data(opcode: u8, arg: u32, resp: ResponseKind, data: Data<'a>) -> Self {
        Command {
            opcode,
            arg,
            resp,
            data: Some(data),
            ..Default::default()
        }
    }
}

/// Placement rules a DMA-capable transport imposes on data buffers.
#[derive(Debug, Clone, Default)]
pub struct BufferConstraints {
    /// Required start alignment in bytes; zero or one means unconstrained.
    pub align: usize,
    /// Address window the buffer must fall into (internal RAM on hosts whose
    /// DMA engine cannot reach external memory).
    pub region: Option<Range<usize>>,
    /// Whether slower external memory is acceptable when allocating.
    pub allow_external: bool,
}

impl BufferConstraints {
    /// Whether `buf` may be handed to the transport as a DMA target.
    pub fn satisfied_by(&self, buf: &[u8]) -> bool {
        let addr = buf.as_ptr() as usize;
        if self.align > 1 && addr & (self.align - 1) != 0 {
            return false;
        }
        match &self.region {
            Some(region) if !buf.is_empty() => {
                region.contains(&addr) && region.contains(&(addr + buf.len() - 1))
            }
            _ => true,
        }
    }
}

/// The bus transport. One implementation per host controller (or per SPI
/// adaptation); the core stays polymorphic over this set.
///
/// `do_transaction` blocks until the exchange completes or times out. The
/// core tolerates arbitrarily long blocking there, bounded only by the
/// resolved command timeout.
pub trait BusHost {
    fn do_transaction(&mut self, cmd: &mut Command<'_>) -> Result<(), BusError>;

    /// Host-wide timeout override; takes precedence over per-command values.
    fn command_timeout(&self) -> Option<Duration> {
        None
    }

    /// Widest data bus the slot supports (1, 4 or 8).
    fn bus_width(&self) -> u8;

    fn set_bus_width(&mut self, width: u8) -> Result<(), BusError>;

    fn set_clock_khz(&mut self, khz: u32) -> Result<(), BusError>;

    /// The frequency actually achieved after divider rounding.
    fn real_clock_khz(&self) -> u32;

    fn is_spi_mode(&self) -> bool;

    /// Fails with [`BusError::NotSupported`] when the hardware lacks DDR.
    fn set_ddr_mode(&mut self, enabled: bool) -> Result<(), BusError>;

    /// Placement rules for buffers handed to `do_transaction`.
    fn dma_constraints(&self) -> BufferConstraints;

    /// Monotonic time since an arbitrary epoch.
    fn now(&self) -> Duration;

    /// Block the calling thread for at least `dur`.
    fn delay(&mut self, dur: Duration);
}

/// Allocator able to satisfy [`BufferConstraints`]. Returned memory must be
/// initialized.
pub trait AlignedAllocator {
    /// Allocate at least `len` bytes satisfying `constraints`, returning the
    /// pointer and the actual usable length.
    fn alloc(
        &self,
        len: usize,
        constraints: &BufferConstraints,
    ) -> Result<(NonNull<u8>, usize), AllocError>;

    /// # Safety
    ///
    /// `ptr` and `len` must come from a prior [`AlignedAllocator::alloc`] on
    /// the same allocator, and the memory must not be referenced afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, len: usize);
}

/// Scoped DMA scratch memory, released on drop along every exit path.
pub struct ScratchBuf<'a, A: AlignedAllocator + ?Sized> {
    alloc: &'a A,
    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
}

impl<'a, A: AlignedAllocator + ?Sized> ScratchBuf<'a, A> {
    pub fn new(
        alloc: &'a A,
        len: usize,
        constraints: &BufferConstraints,
    ) -> Result<Self, AllocError> {
        let (ptr, cap) = alloc.alloc(len, constraints)?;
        Ok(ScratchBuf {
            alloc,
            ptr,
            len,
            cap,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<A: AlignedAllocator + ?Sized> Drop for ScratchBuf<'_, A> {
    fn drop(&mut self) {
        unsafe { self.alloc.free(self.ptr, self.cap) }
    }
}
