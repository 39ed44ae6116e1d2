//! Scripted bus host and counting allocator for the inline tests.

use std::{
    alloc::Layout,
    cell::{Cell, RefCell},
    collections::VecDeque,
    ptr::NonNull,
    time::Duration,
};

use crate::{
    err::{AllocError, BusError},
    host::{AlignedAllocator, BufferConstraints, BusHost, Command, Data, Transfer},
    resp::set_bits,
};

/// One expected exchange: the opcode the driver must send and the reply it
/// gets, optionally with bytes served into a read data phase.
pub struct Exchange {
    pub opcode: u8,
    pub reply: Result<[u32; 4], BusError>,
    pub data: Option<Vec<u8>>,
}

/// Bus host fed from a fixed script. Every transaction is logged; a command
/// that deviates from the script fails the test.
pub struct MockHost {
    pub spi: bool,
    pub width: u8,
    pub clock_khz: u32,
    pub ddr_ok: bool,
    pub constraints: BufferConstraints,
    pub timeout: Option<Duration>,
    pub script: VecDeque<Exchange>,
    /// `(opcode, argument)` of every transaction, in order.
    pub log: Vec<(u8, u32)>,
    /// Resolved timeout of every transaction.
    pub timeouts: Vec<(u8, Duration)>,
    /// Write-phase payloads, in order.
    pub written: Vec<Vec<u8>>,
    pub now: Duration,
}

impl MockHost {
    pub fn new() -> Self {
        MockHost {
            spi: false,
            width: 4,
            clock_khz: 0,
            ddr_ok: false,
            constraints: BufferConstraints::default(),
            timeout: None,
            script: VecDeque::new(),
            log: Vec::new(),
            timeouts: Vec::new(),
            written: Vec::new(),
            now: Duration::ZERO,
        }
    }

    pub fn spi() -> Self {
        MockHost {
            spi: true,
            width: 1,
            ..Self::new()
        }
    }

    pub fn push(&mut self, opcode: u8, reply: Result<[u32; 4], BusError>) {
        self.script.push_back(Exchange {
            opcode,
            reply,
            data: None,
        });
    }

    pub fn push_data(&mut self, opcode: u8, reply: Result<[u32; 4], BusError>, bytes: &[u8]) {
        self.script.push_back(Exchange {
            opcode,
            reply,
            data: Some(bytes.to_vec()),
        });
    }

    pub fn expect(mut self, opcode: u8, reply: Result<[u32; 4], BusError>) -> Self {
        self.push(opcode, reply);
        self
    }

    pub fn expect_data(
        mut self,
        opcode: u8,
        reply: Result<[u32; 4], BusError>,
        bytes: &[u8],
    ) -> Self {
        self.push_data(opcode, reply, bytes);
        self
    }

    pub fn transactions(&self) -> usize {
        self.log.len()
    }
}

impl BusHost for MockHost {
    fn do_transaction(&mut self, cmd: &mut Command<'_>) -> Result<(), BusError> {
        self.log.push((cmd.opcode, cmd.arg));
        if let Some(timeout) = cmd.timeout {
            self.timeouts.push((cmd.opcode, timeout));
        }
        let exchange = self
            .script
            .pop_front()
            .unwrap_or_else(|| panic!("unscripted CMD{}", cmd.opcode));
        assert_eq!(
            exchange.opcode, cmd.opcode,
            "script expected CMD{}, driver sent CMD{}",
            exchange.opcode, cmd.opcode
        );
        if let Some(Data {
            transfer: Transfer::Write(buf),
            ..
        }) = &cmd.data
        {
            self.written.push(buf.to_vec());
        }
        cmd.response = exchange.reply?;
        if let Some(bytes) = exchange.data {
            if let Some(Data {
                transfer: Transfer::Read(buf),
                ..
            }) = &mut cmd.data
            {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
            }
        }
        Ok(())
    }

    fn command_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn bus_width(&self) -> u8 {
        self.width
    }

    fn set_bus_width(&mut self, width: u8) -> Result<(), BusError> {
        if width > self.width {
            return Err(BusError::NotSupported);
        }
        Ok(())
    }

    fn set_clock_khz(&mut self, khz: u32) -> Result<(), BusError> {
        self.clock_khz = khz;
        Ok(())
    }

    fn real_clock_khz(&self) -> u32 {
        self.clock_khz
    }

    fn is_spi_mode(&self) -> bool {
        self.spi
    }

    fn set_ddr_mode(&mut self, _enabled: bool) -> Result<(), BusError> {
        if self.ddr_ok {
            Ok(())
        } else {
            Err(BusError::NotSupported)
        }
    }

    fn dma_constraints(&self) -> BufferConstraints {
        self.constraints.clone()
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn delay(&mut self, dur: Duration) {
        self.now += dur;
    }
}

/// Counting allocator over the system heap.
pub struct MockAlloc {
    pub allocs: Cell<usize>,
    pub frees: Cell<usize>,
    layouts: RefCell<Vec<(usize, Layout)>>,
}

impl MockAlloc {
    pub fn new() -> Self {
        MockAlloc {
            allocs: Cell::new(0),
            frees: Cell::new(0),
            layouts: RefCell::new(Vec::new()),
        }
    }
}

impl AlignedAllocator for MockAlloc {
    fn alloc(
        &self,
        len: usize,
        constraints: &BufferConstraints,
    ) -> Result<(NonNull<u8>, usize), AllocError> {
        let align = constraints.align.max(8);
        let layout = Layout::from_size_align(len.max(1), align).map_err(|_| AllocError)?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).ok_or(AllocError)?;
        self.allocs.set(self.allocs.get() + 1);
        self.layouts.borrow_mut().push((ptr.as_ptr() as usize, layout));
        Ok((ptr, len))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _len: usize) {
        let mut layouts = self.layouts.borrow_mut();
        let pos = layouts
            .iter()
            .position(|&(addr, _)| addr == ptr.as_ptr() as usize)
            .expect("freeing a pointer this allocator never produced");
        let (_, layout) = layouts.swap_remove(pos);
        std::alloc::dealloc(ptr.as_ptr(), layout);
        self.frees.set(self.frees.get() + 1);
    }
}

/// CSD v1.0 register image from its structural fields.
pub fn sd_csd_v1(c_size: u32, c_size_mult: u8, read_bl_len: u8, tran: u8) -> [u32; 4] {
    let mut raw = [0u32; 4];
    set_bits(&mut raw, 126, 2, 0);
    set_bits(&mut raw, 96, 8, tran as u32);
    set_bits(&mut raw, 84, 12, 0x5b5);
    set_bits(&mut raw, 80, 4, read_bl_len as u32);
    set_bits(&mut raw, 62, 12, c_size);
    set_bits(&mut raw, 47, 3, c_size_mult as u32);
    raw
}

/// CSD v2.0 register image; capacity is `(c_size + 1) * 1024` sectors.
pub fn sd_csd_v2(c_size: u32) -> [u32; 4] {
    let mut raw = [0u32; 4];
    set_bits(&mut raw, 126, 2, 1);
    set_bits(&mut raw, 96, 8, 0x32);
    set_bits(&mut raw, 84, 12, 0x5b5);
    set_bits(&mut raw, 80, 4, 9);
    set_bits(&mut raw, 48, 22, c_size);
    raw
}

/// MMC CSD register image carrying SPEC_VERS.
pub fn mmc_csd(spec_vers: u8, c_size: u32, c_size_mult: u8, read_bl_len: u8, tran: u8) -> [u32; 4] {
    let mut raw = [0u32; 4];
    set_bits(&mut raw, 126, 2, 3);
    set_bits(&mut raw, 122, 4, spec_vers as u32);
    set_bits(&mut raw, 96, 8, tran as u32);
    set_bits(&mut raw, 84, 12, 0x5b5);
    set_bits(&mut raw, 80, 4, read_bl_len as u32);
    set_bits(&mut raw, 62, 12, c_size);
    set_bits(&mut raw, 47, 3, c_size_mult as u32);
    raw
}

/// A 136-bit register image as it appears on the wire, MSB first.
pub fn wire_image(raw: [u32; 4]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, chunk) in out.chunks_exact_mut(4).enumerate() {
        chunk.copy_from_slice(&raw[3 - i].to_be_bytes());
    }
    out
}

/// CMD6 switch-function status block: function group 1 support and result.
pub fn sd_switch_status(hs_supported: bool, switched: bool) -> [u8; 64] {
    let mut status = [0u8; 64];
    if hs_supported {
        status[13] = 0x03;
    } else {
        status[13] = 0x01;
    }
    if switched {
        status[16] = 0x01;
    }
    status
}
