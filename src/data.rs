//! Block-addressed read, write and erase against a ready card.

use core::time::Duration;

use sdio_host::{
    common_cmd,
    emmc_cmd::{self, AccessMode},
};

use crate::{
    card::CardSession,
    cmd,
    err::{Error, ProtocolError},
    host::{AlignedAllocator, BusHost, Command, Data, ResponseKind, ScratchBuf, Transfer},
    init::CardFamily,
    resp::{ext_csd, CardState, R1Status},
};

/// Ceiling on the post-transfer busy wait.
pub const READY_FOR_DATA_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL_START: Duration = Duration::from_millis(100);
/// Per-block erase cost heuristic used to size the erase timeout.
const ERASE_TIMEOUT_PER_BLOCK_MS: u64 = 250;

const SD_ERASE_ARG: u32 = 0x0000_0000;
const SD_DISCARD_ARG: u32 = 0x0000_0001;
const MMC_ERASE_ARG: u32 = 0x0000_0000;
const MMC_TRIM_ARG: u32 = 0x0000_0001;
const MMC_DISCARD_ARG: u32 = 0x0000_0003;

/// Erase semantics requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    /// Plain erase to the card's erased state.
    Erase,
    /// MMC TRIM: per-block erase without group rounding.
    Trim,
    /// Deallocate; on MMC always chased with a sanitize pass.
    Discard,
}

/// Poll SEND_STATUS until the card reports ready-for-data outside the
/// programming state, backing off exponentially so slow media is not
/// saturated with status traffic. Returns the final status word.
pub(crate) fn wait_for_ready<H: BusHost + ?Sized>(
    host: &mut H,
    rca: u16,
    timeout: Duration,
) -> Result<R1Status, Error> {
    let deadline = host.now() + timeout;
    let mut interval = READY_POLL_START;
    loop {
        let mut cmd = Command::from(common_cmd::card_status(rca, false));
        cmd::send(host, &mut cmd)?;
        let status = R1Status::from_bits_retain(cmd.response[0]);
        if status.contains(R1Status::READY_FOR_DATA)
            && status.current_state() != CardState::Programming
        {
            return Ok(status);
        }
        let now = host.now();
        if now >= deadline {
            log::error!("card busy past {timeout:?}");
            return Err(Error::Timeout);
        }
        host.delay(interval.min(deadline - now));
        interval = interval.saturating_mul(2);
    }
}

/// One SEND_STATUS in SPI mode. The SPI busy token does not surface every
/// error condition (a locked card among them), so writes re-check here.
fn spi_status_check<H: BusHost + ?Sized>(host: &mut H) -> Result<(), Error> {
    let mut cmd = Command::from(common_cmd::card_status(0, false));
    cmd::send(host, &mut cmd)?;
    let word = (cmd.response[0] & 0xffff) as u16;
    if word != 0 {
        return Err(ProtocolError::SpiStatus(word).into());
    }
    Ok(())
}

impl<H: BusHost + ?Sized, A: AlignedAllocator + ?Sized> CardSession<'_, H, A> {
    /// High-capacity cards address by block number, standard-capacity cards
    /// by byte offset. Mixing these up silently corrupts unrelated data.
    fn block_arg(&self, block: u64) -> u32 {
        if self.is_high_capacity() {
            block as u32
        } else {
            (block * u64::from(self.csd.sector_size)) as u32
        }
    }

    fn check_range(&self, buf_len: usize, start_block: u64, count: u64) -> Result<(), Error> {
        let end = start_block.checked_add(count).ok_or(Error::OutOfRange)?;
        if end > self.csd.capacity {
            return Err(Error::OutOfRange);
        }
        let bytes = count
            .checked_mul(u64::from(self.csd.sector_size))
            .ok_or(Error::OutOfRange)?;
        if (buf_len as u64) < bytes {
            return Err(Error::OutOfRange);
        }
        Ok(())
    }

    pub fn read_blocks(
        &mut self,
        buf: &mut [u8],
        start_block: u64,
        count: u64,
    ) -> Result<(), Error> {
        self.check_range(buf.len(), start_block, count)?;
        if count == 0 {
            return Ok(());
        }
        let sector = self.csd.sector_size as usize;
        let bytes = count as usize * sector;
        let constraints = self.host.dma_constraints();
        if constraints.satisfied_by(buf) {
            self.data_transfer(Transfer::Read(&mut buf[..bytes]), start_block, count)
        } else {
            log::debug!("read buffer unsuitable for DMA, bouncing through scratch");
            let mut scratch = ScratchBuf::new(self.alloc, sector, &constraints)?;
            for (i, chunk) in buf.chunks_exact_mut(sector).take(count as usize).enumerate() {
                self.data_transfer(
                    Transfer::Read(scratch.as_mut_slice()),
                    start_block + i as u64,
                    1,
                )?;
                chunk.copy_from_slice(scratch.as_slice());
            }
            Ok(())
        }
    }

    pub fn write_blocks(&mut self, buf: &[u8], start_block: u64, count: u64) -> Result<(), Error> {
        self.check_range(buf.len(), start_block, count)?;
        if count == 0 {
            return Ok(());
        }
        let sector = self.csd.sector_size as usize;
        let bytes = count as usize * sector;
        let constraints = self.host.dma_constraints();
        if constraints.satisfied_by(buf) {
            self.data_transfer(Transfer::Write(&buf[..bytes]), start_block, count)
        } else {
            log::debug!("write buffer unsuitable for DMA, bouncing through scratch");
            let mut scratch = ScratchBuf::new(self.alloc, sector, &constraints)?;
            for (i, chunk) in buf.chunks_exact(sector).take(count as usize).enumerate() {
                scratch.as_mut_slice().copy_from_slice(chunk);
                self.data_transfer(
                    Transfer::Write(scratch.as_slice()),
                    start_block + i as u64,
                    1,
                )?;
            }
            Ok(())
        }
    }

    /// One read or write command covering `count` blocks, including the
    /// stop for multi-block transfers and the post-transfer busy wait. A
    /// failure aborts the whole request; callers must assume an unspecified
    /// prefix of the range was touched.
    fn data_transfer(
        &mut self,
        transfer: Transfer<'_>,
        start_block: u64,
        count: u64,
    ) -> Result<(), Error> {
        let is_read = matches!(transfer, Transfer::Read(_));
        let addr = self.block_arg(start_block);
        let head = match (is_read, count > 1) {
            (true, true) => common_cmd::read_multiple_blocks(addr),
            (true, false) => common_cmd::read_single_block(addr),
            (false, true) => common_cmd::write_multiple_blocks(addr),
            (false, false) => common_cmd::write_single_block(addr),
        };
        let mut command = Command::with_data(
            head.cmd,
            head.arg,
            ResponseKind::R1,
            Data {
                transfer,
                block_len: self.csd.sector_size as usize,
            },
        );
        cmd::send(self.host, &mut command)?;
        let status = R1Status::from_bits_retain(command.response[0]);
        let auto_stop = command.auto_stop;

        if !self.is_spi && !is_read && status.any_error() {
            return Err(ProtocolError::CardStatus(status).into());
        }
        if count > 1 && !auto_stop {
            let stop = common_cmd::stop_transmission();
            let mut cmd = Command::new(stop.cmd, stop.arg, ResponseKind::R1b);
            cmd::send(self.host, &mut cmd)?;
        }
        if self.is_spi {
            if !is_read {
                spi_status_check(self.host)?;
            }
        } else {
            wait_for_ready(self.host, self.rca, READY_FOR_DATA_TIMEOUT)?;
        }
        Ok(())
    }

    /// Argument and follow-up for an erase request, validated against the
    /// card's advertised feature bits. `None` means unsupported; nothing
    /// touches the bus in that case.
    fn erase_arg(&self, mode: EraseMode) -> Option<(u32, bool)> {
        match (self.family, mode) {
            (CardFamily::Sd, EraseMode::Erase) => Some((SD_ERASE_ARG, false)),
            (CardFamily::Sd, EraseMode::Discard) => self
                .ssr
                .map_or(false, |ssr| ssr.discard_support)
                .then_some((SD_DISCARD_ARG, false)),
            (CardFamily::Sd, EraseMode::Trim) => None,
            (CardFamily::Mmc, EraseMode::Erase) => Some((MMC_ERASE_ARG, false)),
            (CardFamily::Mmc, EraseMode::Trim) => self
                .ext_csd
                .map_or(false, |ext| ext.can_trim())
                .then_some((MMC_TRIM_ARG, false)),
            // Discard alone does not guarantee the erased-state contract
            // MMC promises, so it is always chased with a sanitize pass.
            (CardFamily::Mmc, EraseMode::Discard) => self
                .ext_csd
                .map_or(false, |ext| ext.can_discard() && ext.can_sanitize())
                .then_some((MMC_DISCARD_ARG, true)),
            (CardFamily::Sdio, _) => None,
        }
    }

    fn erase_timeout(count: u64) -> Duration {
        Duration::from_millis(ERASE_TIMEOUT_PER_BLOCK_MS.saturating_mul(count))
            .max(cmd::DEFAULT_CMD_TIMEOUT)
    }

    /// Erase `count` blocks starting at `start_block` with the requested
    /// semantics: set-erase-start, set-erase-end, then the erase itself
    /// with a timeout sized to the range.
    pub fn erase_blocks(
        &mut self,
        start_block: u64,
        count: u64,
        mode: EraseMode,
    ) -> Result<(), Error> {
        let (arg, sanitize_after) = self.erase_arg(mode).ok_or(Error::NotSupported)?;
        if count == 0 {
            return Ok(());
        }
        let end = start_block.checked_add(count).ok_or(Error::OutOfRange)?;
        if end > self.csd.capacity {
            return Err(Error::OutOfRange);
        }

        let first = self.block_arg(start_block);
        let last = self.block_arg(end - 1);
        let (mut start_cmd, mut end_cmd) = match self.family {
            CardFamily::Mmc => (
                Command::from(emmc_cmd::erase_group_start(first)),
                Command::from(emmc_cmd::erase_group_end(last)),
            ),
            _ => (
                // sdio-host 0.9 encodes CMD32/33 with the wrong index;
                // build them directly.
                Command::new(32, first, ResponseKind::R1),
                Command::new(33, last, ResponseKind::R1),
            ),
        };
        cmd::send(self.host, &mut start_cmd)?;
        cmd::send(self.host, &mut end_cmd)?;

        let timeout = Self::erase_timeout(count);
        let mut erase = Command::new(38, arg, ResponseKind::R1b);
        erase.timeout = Some(timeout);
        cmd::send(self.host, &mut erase)?;
        if self.is_spi {
            spi_status_check(self.host)?;
        } else {
            wait_for_ready(self.host, self.rca, timeout)?;
        }

        if sanitize_after {
            log::info!("sanitizing {count} discarded blocks");
            self.mmc_sanitize(timeout)?;
        }
        Ok(())
    }

    /// SWITCH write of SANITIZE_START, sized like the erase that preceded
    /// it.
    fn mmc_sanitize(&mut self, timeout: Duration) -> Result<(), Error> {
        let switch =
            emmc_cmd::modify_ext_csd(AccessMode::WriteByte, ext_csd::SANITIZE_START as u8, 1);
        let mut cmd = Command::new(switch.cmd, switch.arg, ResponseKind::R1b);
        cmd.timeout = Some(timeout);
        cmd::send(self.host, &mut cmd)?;
        let status = wait_for_ready(self.host, self.rca, timeout)?;
        if status.contains(R1Status::SWITCH_ERROR) {
            return Err(ProtocolError::SwitchRejected.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        err::BusError,
        host::BufferConstraints,
        mock::{MockAlloc, MockHost},
        resp::{Csd, ExtCsd, SecFeatures, Ssr},
    };

    const TRAN_READY: [u32; 4] = [0x0000_0900, 0, 0, 0];
    const PRG_BUSY: [u32; 4] = [0x0000_0e00, 0, 0, 0];

    fn csd_8192_blocks() -> Csd {
        Csd {
            csd_ver: 1,
            mmc_ver: 0,
            capacity: 8192,
            sector_size: 512,
            read_block_len: 9,
            card_command_class: 0x5b5,
            tran_speed_khz: 25_000,
        }
    }

    fn session<'h>(
        host: &'h mut MockHost,
        alloc: &'h MockAlloc,
        high_capacity: bool,
    ) -> CardSession<'h, MockHost, MockAlloc> {
        CardSession {
            host,
            alloc,
            family: CardFamily::Sd,
            is_spi: false,
            is_ddr: false,
            io_funcs: 0,
            io_ocr: 0,
            ocr: if high_capacity { 0xc0ff_8000 } else { 0x80ff_8000 },
            rca: 1,
            cid: Default::default(),
            csd: csd_8192_blocks(),
            scr: None,
            ssr: None,
            ext_csd: None,
            high_speed: false,
            bus_width: 4,
            freq_khz: 25_000,
        }
    }

    fn mmc_session<'h>(
        host: &'h mut MockHost,
        alloc: &'h MockAlloc,
    ) -> CardSession<'h, MockHost, MockAlloc> {
        let mut card = session(host, alloc, true);
        card.family = CardFamily::Mmc;
        card.csd.mmc_ver = 4;
        card.ext_csd = Some(ExtCsd {
            rev: 7,
            sec_count: 8192,
            sec_features: SecFeatures::TRIM | SecFeatures::SANITIZE,
            ..Default::default()
        });
        card
    }

    #[test]
    fn addressing_follows_capacity_class() {
        for start in [0u64, 1, 8191] {
            let mut host = MockHost::new()
                .expect(24, Ok(TRAN_READY))
                .expect(13, Ok(TRAN_READY));
            let alloc = MockAlloc::new();
            let buf = [0u8; 512];
            session(&mut host, &alloc, true)
                .write_blocks(&buf, start, 1)
                .unwrap();
            assert_eq!(host.log[0], (24, start as u32));

            let mut host = MockHost::new()
                .expect(24, Ok(TRAN_READY))
                .expect(13, Ok(TRAN_READY));
            session(&mut host, &alloc, false)
                .write_blocks(&buf, start, 1)
                .unwrap();
            assert_eq!(host.log[0], (24, start as u32 * 512));
        }
    }

    #[test]
    fn range_checks_precede_traffic() {
        let mut host = MockHost::new();
        let alloc = MockAlloc::new();
        let buf = [0u8; 512];
        let mut card = session(&mut host, &alloc, true);
        assert_eq!(card.write_blocks(&buf, 8192, 1), Err(Error::OutOfRange));
        assert_eq!(card.write_blocks(&buf, 8191, 2), Err(Error::OutOfRange));
        // Buffer shorter than the requested range.
        assert_eq!(card.write_blocks(&buf, 0, 2), Err(Error::OutOfRange));
        assert_eq!(card.read_blocks(&mut [0u8; 16], 0, 1), Err(Error::OutOfRange));
        drop(card);
        assert_eq!(host.transactions(), 0);
    }

    #[test]
    fn multi_block_write_stops_and_waits() {
        let mut host = MockHost::new()
            .expect(25, Ok(TRAN_READY))
            .expect(12, Ok(TRAN_READY))
            .expect(13, Ok(TRAN_READY));
        let alloc = MockAlloc::new();
        let buf = [0x5au8; 4 * 512];
        session(&mut host, &alloc, true)
            .write_blocks(&buf, 16, 4)
            .unwrap();
        assert_eq!(host.transactions(), 3);
        assert_eq!(host.written[0].len(), 4 * 512);
    }

    #[test]
    fn unaligned_write_bounces_through_one_scratch_block() {
        let mut host = MockHost::new();
        host.constraints = BufferConstraints {
            align: 64,
            ..Default::default()
        };
        for _ in 0..3 {
            host.push(24, Ok(TRAN_READY));
            host.push(13, Ok(TRAN_READY));
        }
        let alloc = MockAlloc::new();

        let mut storage = vec![0u8; 3 * 512 + 2];
        for (i, byte) in storage.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        // Pick an offset guaranteed to miss the 64-byte alignment.
        let off = if storage.as_ptr() as usize % 64 == 63 { 2 } else { 1 };
        let buf = &storage[off..off + 3 * 512];

        session(&mut host, &alloc, true)
            .write_blocks(buf, 100, 3)
            .unwrap();

        // One scratch allocation serves all three single-block transfers.
        assert_eq!(alloc.allocs.get(), 1);
        assert_eq!(alloc.frees.get(), 1);
        let writes: Vec<_> = host.log.iter().filter(|(op, _)| *op == 24).collect();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[1].1, 101);
        for (i, written) in host.written.iter().enumerate() {
            assert_eq!(written[..], buf[i * 512..(i + 1) * 512]);
        }
    }

    #[test]
    fn unaligned_read_bounces_and_copies_back() {
        let mut host = MockHost::new();
        host.constraints = BufferConstraints {
            align: 64,
            ..Default::default()
        };
        for block in [7u8, 8] {
            host.push_data(17, Ok(TRAN_READY), &[block; 512]);
            host.push(13, Ok(TRAN_READY));
        }
        let alloc = MockAlloc::new();

        let mut storage = vec![0u8; 2 * 512 + 2];
        let off = if storage.as_ptr() as usize % 64 == 63 { 2 } else { 1 };
        let range = off..off + 2 * 512;
        session(&mut host, &alloc, true)
            .read_blocks(&mut storage[range.clone()], 7, 2)
            .unwrap();

        assert_eq!(alloc.allocs.get(), 1);
        let buf = &storage[range];
        assert!(buf[..512].iter().all(|&b| b == 7));
        assert!(buf[512..].iter().all(|&b| b == 8));
    }

    #[test]
    fn write_rejection_surfaces_card_status() {
        let mut host = MockHost::new().expect(
            24,
            Ok([R1Status::WP_VIOLATION.bits() | 0x0000_0900, 0, 0, 0]),
        );
        let alloc = MockAlloc::new();
        let buf = [0u8; 512];
        let err = session(&mut host, &alloc, true)
            .write_blocks(&buf, 0, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::CardStatus(status))
                if status.contains(R1Status::WP_VIOLATION)
        ));
        // The failed command is the last thing on the bus.
        assert_eq!(host.transactions(), 1);
    }

    #[test]
    fn busy_poll_backs_off_exponentially() {
        let mut host = MockHost::new()
            .expect(24, Ok(TRAN_READY))
            .expect(13, Ok(PRG_BUSY))
            .expect(13, Ok(PRG_BUSY))
            .expect(13, Ok(TRAN_READY));
        let alloc = MockAlloc::new();
        let buf = [0u8; 512];
        session(&mut host, &alloc, true)
            .write_blocks(&buf, 0, 1)
            .unwrap();
        // 100 ms then 200 ms between the three polls.
        assert_eq!(host.now, Duration::from_millis(300));
    }

    #[test]
    fn busy_poll_observes_deadline() {
        let mut host = MockHost::new().expect(24, Ok(TRAN_READY));
        // Poll times: 0, 100, 300, 700, 1500, 3100, then clamped to the
        // 5 s deadline.
        for _ in 0..7 {
            host.push(13, Ok(PRG_BUSY));
        }
        let alloc = MockAlloc::new();
        let buf = [0u8; 512];
        let err = session(&mut host, &alloc, true)
            .write_blocks(&buf, 0, 1)
            .unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert_eq!(host.now, READY_FOR_DATA_TIMEOUT);
        assert_eq!(host.transactions(), 8);
    }

    #[test]
    fn bus_error_aborts_multi_block_request() {
        let mut host = MockHost::new().expect(25, Err(BusError::Crc));
        let alloc = MockAlloc::new();
        let buf = [0u8; 2 * 512];
        let err = session(&mut host, &alloc, true)
            .write_blocks(&buf, 0, 2)
            .unwrap_err();
        assert_eq!(err, Error::Bus(BusError::Crc));
        assert_eq!(host.transactions(), 1);
    }

    #[test]
    fn unsupported_erase_mode_stays_off_the_bus() {
        let mut host = MockHost::new();
        let alloc = MockAlloc::new();
        let mut card = session(&mut host, &alloc, true);
        assert_eq!(
            card.erase_blocks(0, 16, EraseMode::Trim),
            Err(Error::NotSupported)
        );
        // No SSR discard bit recorded, so SD discard is refused too.
        assert_eq!(
            card.erase_blocks(0, 16, EraseMode::Discard),
            Err(Error::NotSupported)
        );
        drop(card);
        assert_eq!(host.transactions(), 0);
    }

    #[test]
    fn sd_erase_sequence() {
        let mut host = MockHost::new()
            .expect(32, Ok(TRAN_READY))
            .expect(33, Ok(TRAN_READY))
            .expect(38, Ok(TRAN_READY))
            .expect(13, Ok(TRAN_READY));
        let alloc = MockAlloc::new();
        let mut card = session(&mut host, &alloc, true);
        card.ssr = Some(Ssr {
            bus_width: 4,
            discard_support: true,
            fule_support: false,
        });
        card.erase_blocks(64, 32, EraseMode::Discard).unwrap();
        drop(card);
        assert_eq!(host.log[0], (32, 64));
        assert_eq!(host.log[1], (33, 95));
        assert_eq!(host.log[2], (38, SD_DISCARD_ARG));
    }

    #[test]
    fn erase_timeout_scales_with_range() {
        let mut host = MockHost::new()
            .expect(32, Ok(TRAN_READY))
            .expect(33, Ok(TRAN_READY))
            .expect(38, Ok(TRAN_READY))
            .expect(13, Ok(TRAN_READY));
        let alloc = MockAlloc::new();
        session(&mut host, &alloc, true)
            .erase_blocks(0, 100, EraseMode::Erase)
            .unwrap();
        let erase_timeout = host
            .timeouts
            .iter()
            .find(|(op, _)| *op == 38)
            .map(|(_, t)| *t)
            .unwrap();
        assert_eq!(erase_timeout, Duration::from_millis(25_000));

        // A single block still gets the command default.
        assert_eq!(
            CardSession::<MockHost, MockAlloc>::erase_timeout(1),
            cmd::DEFAULT_CMD_TIMEOUT
        );
    }

    #[test]
    fn mmc_discard_sanitizes_the_range() {
        let mut host = MockHost::new()
            .expect(35, Ok(TRAN_READY))
            .expect(36, Ok(TRAN_READY))
            .expect(38, Ok(TRAN_READY))
            .expect(13, Ok(TRAN_READY))
            .expect(6, Ok(TRAN_READY))
            .expect(13, Ok(TRAN_READY));
        let alloc = MockAlloc::new();
        mmc_session(&mut host, &alloc)
            .erase_blocks(0, 8, EraseMode::Discard)
            .unwrap();
        assert_eq!(host.log[2], (38, MMC_DISCARD_ARG));
        // SWITCH write of SANITIZE_START.
        let sanitize_arg = (AccessMode::WriteByte as u32) << 24
            | (ext_csd::SANITIZE_START as u32) << 16
            | 1 << 8;
        assert_eq!(host.log[4], (6, sanitize_arg));
    }

    #[test]
    fn mmc_trim_uses_trim_argument() {
        let mut host = MockHost::new()
            .expect(35, Ok(TRAN_READY))
            .expect(36, Ok(TRAN_READY))
            .expect(38, Ok(TRAN_READY))
            .expect(13, Ok(TRAN_READY));
        let alloc = MockAlloc::new();
        mmc_session(&mut host, &alloc)
            .erase_blocks(4, 4, EraseMode::Trim)
            .unwrap();
        assert_eq!(host.log[2], (38, MMC_TRIM_ARG));
    }
}
