//! Card bring-up: the ordered, family-branching sequence that takes a
//! freshly reset card to the transfer state.
//!
//! Each stage either advances the partially built session or aborts the
//! whole sequence; a failed bring-up never leaks a partial card object. The
//! only controlled backtrack is the SD to MMC fallback when ACMD41 stays
//! silent.

use core::{fmt, time::Duration};

use array_macro::array;
use sdio_host::{
    common_cmd::{self, R1},
    emmc_cmd::{self, AccessMode},
    sd_cmd, Cmd,
};

use crate::{
    card::CardSession,
    cmd::{self, io_send_op_cond, spi_crc_on_off, spi_read_ocr, RespExt},
    data,
    err::{BusError, Error, ProtocolError},
    host::{AlignedAllocator, BusHost, Command, ResponseKind, ScratchBuf},
    resp::{
        self, ext_csd, Cid, Csd, ExtCsd, IoOcr, MmcDeviceType, Ocr, R1Status, Scr, SpiR1, Ssr,
    },
};

pub const SEND_OP_COND_MAX_RETRIES: u32 = 100;
pub const SEND_OP_COND_MAX_ERRORS: u32 = 3;
const SEND_OP_COND_DELAY: Duration = Duration::from_millis(10);
/// Absolute ceiling on OCR negotiation, on top of the retry budget.
const SEND_OP_COND_DEADLINE: Duration = Duration::from_secs(5);

const GO_IDLE_DELAY: Duration = Duration::from_millis(20);
const IF_COND_PATTERN: u8 = 0xaa;
const SD_SWITCH_STATUS_LEN: usize = 64;

const SD_DEFAULT_KHZ: u32 = 25_000;
const SD_HS_KHZ: u32 = 50_000;
const MMC_LEGACY_KHZ: u32 = 26_000;
const MMC_HS_KHZ: u32 = 52_000;

/// Card family, fixed at detection and consulted once per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardFamily {
    Sd,
    Mmc,
    /// IO-only card, no memory portion. Combo cards keep [`CardFamily::Sd`]
    /// with a non-zero function count.
    Sdio,
}

/// Named initialization stages, used to tag errors for diagnosability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    GoIdle,
    ProbeVoltage,
    ProbeIo,
    NegotiateOcr,
    ReadOcr,
    ReadCid,
    AssignAddress,
    ReadCsd,
    DecodeCid,
    SelectCard,
    ReadExtCsd,
    NegotiateBusWidth,
    NegotiateHighSpeed,
    NegotiateFrequency,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::GoIdle => "go-idle",
            Stage::ProbeVoltage => "probe-voltage",
            Stage::ProbeIo => "probe-io",
            Stage::NegotiateOcr => "negotiate-ocr",
            Stage::ReadOcr => "read-ocr",
            Stage::ReadCid => "read-cid",
            Stage::AssignAddress => "assign-address",
            Stage::ReadCsd => "read-csd",
            Stage::DecodeCid => "decode-cid",
            Stage::SelectCard => "select-card",
            Stage::ReadExtCsd => "read-ext-csd",
            Stage::NegotiateBusWidth => "negotiate-bus-width",
            Stage::NegotiateHighSpeed => "negotiate-high-speed",
            Stage::NegotiateFrequency => "negotiate-frequency",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bring-up failure, tagged with the stage it happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitError {
    pub stage: Stage,
    pub source: Error,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "initialization failed at {}: {}", self.stage, self.source)
    }
}

impl<'h, H: BusHost + ?Sized, A: AlignedAllocator + ?Sized> CardSession<'h, H, A> {
    /// Run the full bring-up sequence against an electrically reset card.
    pub fn initialize(host: &'h mut H, alloc: &'h A) -> Result<Self, InitError> {
        let is_spi = host.is_spi_mode();
        Bringup {
            host,
            alloc,
            family: CardFamily::Sd,
            is_spi,
            if_cond_ok: false,
            io_funcs: 0,
            mem_present: true,
            io_ocr: 0,
            ocr: 0,
            rca: 0,
            raw_cid: [0; 4],
            cid: Cid::default(),
            csd: Csd::default(),
            scr: None,
            ssr: None,
            ext_csd: None,
            high_speed: false,
            is_ddr: false,
            bus_width: 1,
            freq_khz: 0,
        }
        .run()
    }
}

struct Bringup<'h, H: BusHost + ?Sized, A: AlignedAllocator + ?Sized> {
    host: &'h mut H,
    alloc: &'h A,
    family: CardFamily,
    is_spi: bool,
    if_cond_ok: bool,
    io_funcs: u8,
    mem_present: bool,
    io_ocr: u32,
    ocr: u32,
    rca: u16,
    raw_cid: [u32; 4],
    cid: Cid,
    csd: Csd,
    scr: Option<Scr>,
    ssr: Option<Ssr>,
    ext_csd: Option<ExtCsd>,
    high_speed: bool,
    is_ddr: bool,
    bus_width: u8,
    freq_khz: u32,
}

impl<'h, H: BusHost + ?Sized, A: AlignedAllocator + ?Sized> Bringup<'h, H, A> {
    fn run(mut self) -> Result<CardSession<'h, H, A>, InitError> {
        log::trace!("starting card initialization");

        self.stage(Stage::GoIdle, Self::go_idle)?;
        self.stage(Stage::ProbeVoltage, Self::probe_voltage)?;
        self.stage(Stage::ProbeIo, Self::probe_io)?;

        if self.mem_present {
            match self.negotiate_ocr() {
                Ok(()) => {}
                Err(Error::Timeout) if self.family == CardFamily::Sd && self.io_funcs == 0 => {
                    // The one controlled backtrack: a card silent on ACMD41
                    // may be MMC.
                    log::warn!("no reply to ACMD41, retrying as MMC");
                    self.family = CardFamily::Mmc;
                    self.stage(Stage::NegotiateOcr, Self::negotiate_ocr)?;
                }
                Err(source) => {
                    log::error!("initialization failed at {}: {source}", Stage::NegotiateOcr);
                    return Err(InitError {
                        stage: Stage::NegotiateOcr,
                        source,
                    });
                }
            }
            if self.is_spi {
                self.stage(Stage::ReadOcr, Self::read_ocr)?;
            }
            self.stage(Stage::ReadCid, Self::read_cid)?;
        }

        if !self.is_spi {
            self.stage(Stage::AssignAddress, Self::assign_address)?;
        }

        if self.mem_present {
            self.stage(Stage::ReadCsd, Self::read_csd)?;
            if self.family == CardFamily::Mmc {
                self.stage(Stage::DecodeCid, Self::decode_deferred_cid)?;
            }
        }

        if !self.is_spi {
            self.stage(Stage::SelectCard, Self::select_card)?;
        }

        if self.mem_present && self.family == CardFamily::Mmc && self.csd.mmc_ver >= 4 {
            self.stage(Stage::ReadExtCsd, Self::read_ext_csd)?;
        }

        self.stage(Stage::NegotiateBusWidth, Self::negotiate_bus_width)?;
        self.stage(Stage::NegotiateHighSpeed, Self::negotiate_high_speed)?;
        self.stage(Stage::NegotiateFrequency, Self::negotiate_frequency)?;

        let session = CardSession {
            host: self.host,
            alloc: self.alloc,
            family: self.family,
            is_spi: self.is_spi,
            is_ddr: self.is_ddr,
            io_funcs: self.io_funcs,
            io_ocr: self.io_ocr,
            ocr: self.ocr,
            rca: self.rca,
            cid: self.cid,
            csd: self.csd,
            scr: self.scr,
            ssr: self.ssr,
            ext_csd: self.ext_csd,
            high_speed: self.high_speed,
            bus_width: self.bus_width,
            freq_khz: self.freq_khz,
        };
        log::info!("{session}");
        Ok(session)
    }

    fn stage(
        &mut self,
        stage: Stage,
        f: impl FnOnce(&mut Self) -> Result<(), Error>,
    ) -> Result<(), InitError> {
        f(self).map_err(|source| {
            log::error!("initialization failed at {stage}: {source}");
            InitError { stage, source }
        })
    }

    fn dma_scratch(&self, len: usize) -> Result<ScratchBuf<'h, A>, Error> {
        Ok(ScratchBuf::new(
            self.alloc,
            len,
            &self.host.dma_constraints(),
        )?)
    }

    /// CMD0. SPI hosts get it twice: many cards miss the first one while
    /// still settling into SPI mode, so its outcome is ignored.
    fn go_idle(&mut self) -> Result<(), Error> {
        let mut cmd = Command::from(common_cmd::idle());
        let first = cmd::send(self.host, &mut cmd);
        if self.is_spi {
            if let Err(err) = first {
                log::debug!("first GO_IDLE_STATE ignored: {err}");
            }
            self.host.delay(GO_IDLE_DELAY);
            let mut again = Command::from(common_cmd::idle());
            cmd::send(self.host, &mut again)?;
            self.host.delay(GO_IDLE_DELAY);
            let mut crc = Command::from(spi_crc_on_off(true));
            cmd::send(self.host, &mut crc)?;
        } else {
            first?;
            self.host.delay(GO_IDLE_DELAY);
        }
        Ok(())
    }

    /// CMD8 with a fixed echo pattern. Legacy SD 1.x and MMC cards stay
    /// silent, which is tolerated; an answer with the wrong echo is not.
    fn probe_voltage(&mut self) -> Result<(), Error> {
        let mut cmd = Command::from(sd_cmd::send_if_cond(1, IF_COND_PATTERN));
        match cmd::send(self.host, &mut cmd) {
            Ok(()) => {
                let actual = (cmd.response[0] & 0xff) as u8;
                if actual != IF_COND_PATTERN {
                    return Err(ProtocolError::EchoMismatch {
                        expected: IF_COND_PATTERN,
                        actual,
                    }
                    .into());
                }
                self.if_cond_ok = true;
            }
            Err(BusError::Timeout) => {
                log::debug!("no SEND_IF_COND reply, assuming legacy card");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// CMD5 probe. A transport timeout means the card has no IO portion and
    /// is not an error; an R4 answer fixes the IO function count and, for
    /// IO-only cards, skips the memory stages entirely.
    fn probe_io(&mut self) -> Result<(), Error> {
        let mut probe = Command::from(io_send_op_cond(0));
        match cmd::send(self.host, &mut probe) {
            Ok(()) => {}
            Err(BusError::Timeout) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let r4 = IoOcr(probe.response[0]);
        if r4.num_functions() == 0 {
            return Ok(());
        }
        self.io_funcs = r4.num_functions();
        self.mem_present = r4.memory_present();
        if !self.mem_present {
            self.family = CardFamily::Sdio;
        }
        log::info!(
            "SDIO: {} function(s), memory portion {}",
            self.io_funcs,
            if self.mem_present { "present" } else { "absent" }
        );

        let window = r4.io_ocr() & Ocr::VOLTAGE_3V3_WINDOW;
        let word = self.retry_op_cond(|this| {
            let mut cmd = Command::from(io_send_op_cond(window));
            cmd::send(this.host, &mut cmd)?;
            let r4 = IoOcr(cmd.response[0]);
            Ok(r4.is_ready().then_some(cmd.response[0]))
        })?;
        self.io_ocr = IoOcr(word).io_ocr();
        Ok(())
    }

    /// Bounded retry harness shared by the ACMD41/CMD1/CMD5 negotiation
    /// loops. "Not ready yet" answers burn a retry but are not errors;
    /// communication errors have their own small budget. The wall clock is
    /// capped as well, in case individual transactions are slow.
    fn retry_op_cond(
        &mut self,
        mut attempt: impl FnMut(&mut Self) -> Result<Option<u32>, BusError>,
    ) -> Result<u32, Error> {
        let deadline = self.host.now() + SEND_OP_COND_DEADLINE;
        let mut errors = 0;
        for _ in 0..SEND_OP_COND_MAX_RETRIES {
            match attempt(self) {
                Ok(Some(word)) => return Ok(word),
                Ok(None) => {}
                Err(err) => {
                    errors += 1;
                    if errors > SEND_OP_COND_MAX_ERRORS {
                        log::warn!("giving up on op-cond after {errors} errors, last: {err}");
                        return Err(Error::Timeout);
                    }
                }
            }
            if self.host.now() >= deadline {
                break;
            }
            self.host.delay(SEND_OP_COND_DELAY);
        }
        Err(Error::Timeout)
    }

    /// ACMD41 (SD) or CMD1 (MMC) until the card reports power-up done.
    fn negotiate_ocr(&mut self) -> Result<(), Error> {
        let is_mmc = self.family == CardFamily::Mmc;
        let spi = self.is_spi;
        let hcs = self.if_cond_ok || is_mmc;
        let word = self.retry_op_cond(|this| {
            let mut cmd = if is_mmc {
                let mut arg = if hcs { Ocr::HIGH_CAPACITY } else { 0 };
                if !spi {
                    arg |= Ocr::VOLTAGE_3V3_WINDOW;
                }
                Command::from(emmc_cmd::send_op_cond(arg))
            } else {
                // SPI cards ignore the voltage window in ACMD41.
                let window = if spi { 0 } else { 0x1ff };
                Command::from(sd_cmd::sd_send_op_cond(hcs, false, false, window))
            };
            let arg = cmd.arg;
            if is_mmc {
                cmd::send(this.host, &mut cmd)?;
            } else {
                cmd::send_app_cmd(this.host, 0, &mut cmd)?;
            }
            let done = if spi {
                !SpiR1::from_bits_truncate(cmd.response[0]).contains(SpiR1::IN_IDLE_STATE)
            } else {
                // An all-zero argument is an inquiry and completes at once.
                Ocr(cmd.response[0]).is_ready() || arg == 0
            };
            Ok(done.then_some(cmd.response[0]))
        })?;
        if !spi {
            self.ocr = word;
        }
        Ok(())
    }

    /// CMD58, SPI only: the R3 path that native mode gets from ACMD41.
    fn read_ocr(&mut self) -> Result<(), Error> {
        let mut cmd = Command::from(spi_read_ocr());
        cmd::send(self.host, &mut cmd)?;
        self.ocr = cmd.response[0];
        Ok(())
    }

    /// Data-phase read of a 16-byte register image (SPI mode CID/CSD).
    fn read_register_image(&mut self, cmd: Cmd<impl RespExt>) -> Result<[u32; 4], Error> {
        let mut scratch = self.dma_scratch(16)?;
        cmd::read_transfer(self.host, cmd, scratch.as_mut_slice())?;
        Ok(spi_register_words(scratch.as_slice()))
    }

    /// CMD2 broadcast on the native bus, CMD10 data-phase read over SPI.
    /// MMC decoding is deferred until the CSD names the spec version.
    fn read_cid(&mut self) -> Result<(), Error> {
        self.raw_cid = if self.is_spi {
            self.read_register_image(common_cmd::cmd::<R1>(10, 0))?
        } else {
            let mut cmd = Command::from(common_cmd::all_send_cid());
            cmd::send(self.host, &mut cmd)?;
            cmd.response
        };
        if self.family != CardFamily::Mmc {
            self.cid = resp::decode_cid(self.raw_cid, false, None)?;
            log::info!("card CID: {:?}", self.cid);
        }
        Ok(())
    }

    /// CMD3. SD cards publish an address of their choosing; MMC cards are
    /// assigned one by the host (no multi-card arbitration, always 1).
    fn assign_address(&mut self) -> Result<(), Error> {
        match self.family {
            CardFamily::Mmc => {
                let mut cmd = Command::from(emmc_cmd::assign_relative_address(1));
                cmd::send(self.host, &mut cmd)?;
                self.rca = 1;
            }
            _ => {
                let mut cmd = Command::from(sd_cmd::send_relative_address());
                cmd::send(self.host, &mut cmd)?;
                self.rca = (cmd.response[0] >> 16) as u16;
            }
        }
        log::info!("card RCA: {}", self.rca);
        Ok(())
    }

    fn read_csd(&mut self) -> Result<(), Error> {
        let raw = if self.is_spi {
            self.read_register_image(common_cmd::cmd::<R1>(9, 0))?
        } else {
            let mut cmd = Command::from(common_cmd::send_csd(self.rca));
            cmd::send(self.host, &mut cmd)?;
            cmd.response
        };
        let mut csd = resp::decode_csd(raw, self.family == CardFamily::Mmc)?;
        if self.family != CardFamily::Mmc && !Ocr(self.ocr).high_capacity() {
            // Standard-capacity commands address by byte offset; clamp to
            // what a 32-bit byte address can reach.
            let max = u64::from(u32::MAX) / u64::from(csd.sector_size) + 1;
            if csd.capacity > max {
                log::warn!("clamping capacity from {} to {max} blocks", csd.capacity);
                csd.capacity = max;
            }
        }
        self.csd = csd;
        log::info!("card CSD: {:?}", self.csd);
        if !self.is_spi && !Ocr(self.ocr).high_capacity() {
            let mut cmd = Command::from(common_cmd::set_block_length(512));
            cmd::send(self.host, &mut cmd)?;
        }
        Ok(())
    }

    fn decode_deferred_cid(&mut self) -> Result<(), Error> {
        self.cid = resp::decode_cid(self.raw_cid, true, Some(self.csd.mmc_ver))?;
        log::info!("card CID: {:?}", self.cid);
        Ok(())
    }

    fn select_card(&mut self) -> Result<(), Error> {
        let select = common_cmd::select_card(self.rca);
        let mut cmd = Command::new(select.cmd, select.arg, ResponseKind::R1b);
        cmd::send(self.host, &mut cmd)?;
        Ok(())
    }

    /// CMD8 data-phase read of the 512-byte EXT_CSD, MMC 4.0+ only.
    fn read_ext_csd(&mut self) -> Result<(), Error> {
        let mut scratch = self.dma_scratch(ext_csd::LEN)?;
        cmd::read_transfer(self.host, emmc_cmd::send_ext_csd(), scratch.as_mut_slice())?;
        let ext = resp::decode_ext_csd(scratch.as_slice())?;
        drop(scratch);

        // SEC_COUNT is authoritative above the 2 GB the CSD can express.
        let bytes = u64::from(ext.sec_count) * 512;
        if bytes > 2 * 1024 * 1024 * 1024 {
            self.csd.capacity = bytes / u64::from(self.csd.sector_size);
        }
        log::info!(
            "EXT_CSD rev {}, {} sectors, device type {:?}",
            ext.rev,
            ext.sec_count,
            ext.device_type
        );
        self.ext_csd = Some(ext);
        Ok(())
    }

    fn negotiate_bus_width(&mut self) -> Result<(), Error> {
        if self.is_spi || self.family == CardFamily::Sdio {
            return Ok(());
        }
        match self.family {
            CardFamily::Mmc => self.mmc_bus_width(),
            _ => self.sd_bus_width(),
        }
    }

    fn sd_bus_width(&mut self) -> Result<(), Error> {
        // SCR and SD Status first; they gate the width switch and carry the
        // erase feature bits consulted later.
        let mut scratch = self.dma_scratch(8)?;
        cmd::app_prefix(self.host, self.rca)?;
        cmd::read_transfer(self.host, sd_cmd::send_scr(), scratch.as_mut_slice())?;
        let scr = resp::decode_scr(scratch.as_slice())?;
        drop(scratch);
        self.scr = Some(scr);
        log::info!("card SCR: spec {}", scr.spec());

        let mut scratch = self.dma_scratch(64)?;
        cmd::app_prefix(self.host, self.rca)?;
        cmd::read_transfer(self.host, sd_cmd::sd_status(), scratch.as_mut_slice())?;
        let ssr = resp::decode_ssr(scratch.as_slice())?;
        drop(scratch);
        self.ssr = Some(ssr);

        if self.host.bus_width() >= 4 && scr.bus_width_four() {
            let mut cmd = Command::from(sd_cmd::set_bus_width(true));
            cmd::send_app_cmd(self.host, self.rca, &mut cmd)?;
            self.host.set_bus_width(4)?;
            self.bus_width = 4;
            log::info!("4-bit bus enabled");
        }
        Ok(())
    }

    fn mmc_bus_width(&mut self) -> Result<(), Error> {
        // Cards without an EXT_CSD predate wide buses; stay at 1 bit.
        let Some(ext) = self.ext_csd else {
            return Ok(());
        };
        let host_width = self.host.bus_width();
        let (width, pwr_cl) = match host_width {
            w if w >= 8 => (8, ext.pwr_cl_52_360 >> 4),
            w if w >= 4 => (4, ext.pwr_cl_52_360 & 0xf),
            _ => return Ok(()),
        };

        // Power class pre-check: raise it before going wide when the card
        // asks for more than the current class.
        if pwr_cl != 0 && pwr_cl != ext.power_class {
            self.mmc_switch(ext_csd::POWER_CLASS, pwr_cl)?;
        }

        let ddr = ext.device_type.intersects(MmcDeviceType::DDR_52_HIGHV)
            && self.host.set_ddr_mode(true).is_ok();
        let value = match (width, ddr) {
            (8, true) => ext_csd::BUS_WIDTH_8_DDR,
            (8, false) => ext_csd::BUS_WIDTH_8,
            (4, true) => ext_csd::BUS_WIDTH_4_DDR,
            _ => ext_csd::BUS_WIDTH_4,
        };
        self.mmc_switch(ext_csd::BUS_WIDTH, value)?;
        self.host.set_bus_width(width)?;
        self.bus_width = width;
        self.is_ddr = ddr;
        log::info!("{width}-bit bus enabled{}", if ddr { " (DDR)" } else { "" });
        Ok(())
    }

    /// SWITCH write of one EXT_CSD byte, with the busy wait and the
    /// SWITCH_ERROR status check the command demands.
    fn mmc_switch(&mut self, index: usize, value: u8) -> Result<(), Error> {
        let switch = emmc_cmd::modify_ext_csd(AccessMode::WriteByte, index as u8, value);
        let mut cmd = Command::new(switch.cmd, switch.arg, ResponseKind::R1b);
        cmd::send(self.host, &mut cmd)?;
        let status = data::wait_for_ready(self.host, self.rca, cmd::DEFAULT_CMD_TIMEOUT)?;
        if status.contains(R1Status::SWITCH_ERROR) {
            return Err(ProtocolError::SwitchRejected.into());
        }
        Ok(())
    }

    fn negotiate_high_speed(&mut self) -> Result<(), Error> {
        if self.is_spi {
            return Ok(());
        }
        match self.family {
            CardFamily::Mmc => self.mmc_high_speed(),
            CardFamily::Sd => self.sd_high_speed(),
            CardFamily::Sdio => Ok(()),
        }
    }

    /// CMD6 switch-function: inquire about function 1 of group 1, then
    /// switch to it. Cards may lack or refuse it; neither is fatal.
    fn sd_high_speed(&mut self) -> Result<(), Error> {
        if self.scr.map_or(true, |scr| scr.spec() < 1) {
            return Ok(());
        }
        let mut scratch = self.dma_scratch(SD_SWITCH_STATUS_LEN)?;
        cmd::read_transfer(self.host, sd_cmd::cmd6(0x00ff_ff01), scratch.as_mut_slice())?;
        if scratch.as_slice()[13] & 0x02 == 0 {
            log::debug!("card has no high-speed function");
            return Ok(());
        }
        cmd::read_transfer(self.host, sd_cmd::cmd6(0x80ff_ff01), scratch.as_mut_slice())?;
        if scratch.as_slice()[16] & 0x0f != 1 {
            log::warn!("card refused the high-speed switch");
            return Ok(());
        }
        self.high_speed = true;
        log::info!("high speed enabled");
        Ok(())
    }

    fn mmc_high_speed(&mut self) -> Result<(), Error> {
        let Some(ext) = self.ext_csd else {
            return Ok(());
        };
        if !ext
            .device_type
            .intersects(MmcDeviceType::HS_52 | MmcDeviceType::HS_26)
        {
            return Ok(());
        }
        self.mmc_switch(ext_csd::HS_TIMING, ext_csd::HS_TIMING_HIGH_SPEED)?;
        self.high_speed = true;
        log::info!("high speed enabled");
        Ok(())
    }

    fn negotiate_frequency(&mut self) -> Result<(), Error> {
        let ceiling = match (self.family, self.high_speed) {
            (CardFamily::Mmc, true) => {
                if self
                    .ext_csd
                    .map_or(false, |e| e.device_type.contains(MmcDeviceType::HS_52))
                {
                    MMC_HS_KHZ
                } else {
                    MMC_LEGACY_KHZ
                }
            }
            (CardFamily::Mmc, false) => MMC_LEGACY_KHZ,
            (_, true) => SD_HS_KHZ,
            (_, false) => SD_DEFAULT_KHZ,
        };
        let card_khz = match self.csd.tran_speed_khz {
            0 => ceiling,
            khz => khz,
        };
        let target = if self.high_speed {
            ceiling
        } else {
            card_khz.min(ceiling)
        };
        self.host.set_clock_khz(target)?;
        self.freq_khz = self.host.real_clock_khz();
        log::info!("bus clock {} kHz", self.freq_khz);
        Ok(())
    }
}

/// Reassemble a register image read over a data phase (MSB first on the
/// wire) into the register word order the decoders expect.
fn spi_register_words(image: &[u8]) -> [u32; 4] {
    let mut words =
        array![i => u32::from_le_bytes(image[i * 4..i * 4 + 4].try_into().unwrap()); 4];
    resp::flip_byte_order(&mut words);
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{self, MockAlloc, MockHost},
        resp::{encode_cid, CidLayout},
    };

    const APP_READY: [u32; 4] = [0x0000_0920, 0, 0, 0];
    const TRAN_READY: [u32; 4] = [0x0000_0900, 0, 0, 0];

    fn sd_cid_raw() -> [u32; 4] {
        let cid = Cid {
            mfg_id: 3,
            oem_id: u16::from_be_bytes(*b"SD"),
            name: *b"SD02G\0\0",
            revision: 0x13,
            serial: 0x1234_5678,
            month: 5,
            year: 2018,
            crc: 0,
        };
        encode_cid(&cid, CidLayout::Sd)
    }

    fn mmc_cid_raw() -> [u32; 4] {
        let cid = Cid {
            mfg_id: 0x15,
            oem_id: 0x45,
            name: *b"MMC08G\0",
            revision: 0x21,
            serial: 0xdead_beef,
            month: 7,
            year: 2009,
            crc: 0,
        };
        encode_cid(&cid, CidLayout::MmcV4)
    }

    fn mmc_ext_csd_image() -> Vec<u8> {
        let mut image = vec![0u8; ext_csd::LEN];
        image[ext_csd::REV] = 7;
        image[ext_csd::SEC_CNT..ext_csd::SEC_CNT + 4]
            .copy_from_slice(&15_269_888u32.to_le_bytes());
        image[ext_csd::CARD_TYPE] = (MmcDeviceType::HS_26 | MmcDeviceType::HS_52).bits();
        image[ext_csd::SEC_FEATURE_SUPPORT] = 0x50;
        image
    }

    /// The common native-mode preamble: reset, voltage probe, no IO.
    fn sd_preamble(host: MockHost) -> MockHost {
        host.expect(0, Ok([0; 4]))
            .expect(8, Ok([0x1aa, 0, 0, 0]))
            .expect(5, Err(BusError::Timeout))
    }

    #[test]
    fn cold_sd_card_init() {
        let mut host = sd_preamble(MockHost::new());
        // Two "still powering up" polls, then ready without CCS (a 2 GB
        // standard-capacity card).
        for _ in 0..2 {
            host.push(55, Ok(APP_READY));
            host.push(41, Ok([0x00ff_8000, 0, 0, 0]));
        }
        host.push(55, Ok(APP_READY));
        host.push(41, Ok([0x80ff_8000, 0, 0, 0]));
        let mut host = host
            .expect(2, Ok(sd_cid_raw()))
            .expect(3, Ok([0xb368_0000, 0, 0, 0]))
            .expect(9, Ok(mock::sd_csd_v1(4095, 7, 10, 0x32)))
            .expect(16, Ok(TRAN_READY))
            .expect(7, Ok(TRAN_READY))
            // SCR advertises 4-bit and spec 3, then a zero SD Status.
            .expect(55, Ok(APP_READY))
            .expect_data(51, Ok(TRAN_READY), &0x0235_8001_0000_0000u64.to_be_bytes())
            .expect(55, Ok(APP_READY))
            .expect_data(13, Ok(TRAN_READY), &[0u8; 64])
            .expect(55, Ok(APP_READY))
            .expect(6, Ok(TRAN_READY))
            // High-speed inquiry and switch.
            .expect_data(6, Ok(TRAN_READY), &mock::sd_switch_status(true, false))
            .expect_data(6, Ok(TRAN_READY), &mock::sd_switch_status(true, true));
        let alloc = MockAlloc::new();

        let card = CardSession::initialize(&mut host, &alloc).unwrap();
        assert_eq!(card.family(), CardFamily::Sd);
        assert!(!card.is_mmc());
        assert!(!card.is_high_capacity());
        assert_eq!(card.rca(), 0xb368);
        assert_eq!(card.capacity_blocks(), 4194304);
        assert_eq!(card.sector_size(), 512);
        assert_eq!(card.bus_width(), 4);
        assert!(card.high_speed());
        assert_eq!(card.freq_khz(), 50_000);
        assert_eq!(card.cid().product_name(), "SD02G");
    }

    #[test]
    fn spi_go_idle_quirk_is_tolerated() {
        // The first CMD0 fails outright; the doubled attempt recovers.
        let mut host = MockHost::spi()
            .expect(0, Err(BusError::Timeout))
            .expect(0, Ok([0x1, 0, 0, 0]))
            .expect(59, Ok([0x1, 0, 0, 0]))
            .expect(8, Ok([0x1aa, 0, 0, 0]))
            .expect(5, Err(BusError::Timeout))
            .expect(55, Ok([0x1, 0, 0, 0]))
            .expect(41, Ok([0x1, 0, 0, 0]))
            .expect(55, Ok([0x1, 0, 0, 0]))
            .expect(41, Ok([0x0, 0, 0, 0]))
            .expect(58, Ok([0xc0ff_8000, 0, 0, 0]))
            .expect_data(10, Ok([0; 4]), &mock::wire_image(sd_cid_raw()))
            .expect_data(9, Ok([0; 4]), &mock::wire_image(mock::sd_csd_v2(60872)));
        let alloc = MockAlloc::new();

        let card = CardSession::initialize(&mut host, &alloc).unwrap();
        assert!(card.is_spi_mode());
        assert_eq!(card.rca(), 0);
        assert!(card.is_high_capacity());
        assert_eq!(card.capacity_blocks(), 62333952);
        assert_eq!(card.bus_width(), 1);
    }

    #[test]
    fn if_cond_echo_mismatch_fails() {
        let mut host = MockHost::new()
            .expect(0, Ok([0; 4]))
            .expect(8, Ok([0x155, 0, 0, 0]));
        let alloc = MockAlloc::new();

        let err = CardSession::initialize(&mut host, &alloc).unwrap_err();
        assert_eq!(err.stage, Stage::ProbeVoltage);
        assert_eq!(
            err.source,
            Error::Protocol(ProtocolError::EchoMismatch {
                expected: 0xaa,
                actual: 0x55
            })
        );
    }

    #[test]
    fn sd_timeout_falls_back_to_mmc() {
        let mut host = sd_preamble(MockHost::new());
        // ACMD41 never reports ready: the full retry budget burns down.
        for _ in 0..SEND_OP_COND_MAX_RETRIES {
            host.push(55, Ok(APP_READY));
            host.push(41, Ok([0x00ff_8000, 0, 0, 0]));
        }
        // First CMD1 on the MMC path succeeds, sector-mode capable.
        let mut host = host
            .expect(1, Ok([0xc0ff_8000, 0, 0, 0]))
            .expect(2, Ok(mmc_cid_raw()))
            .expect(3, Ok(TRAN_READY))
            .expect(9, Ok(mock::mmc_csd(4, 4095, 7, 9, 0x5a)))
            .expect(7, Ok(TRAN_READY))
            .expect_data(8, Ok(TRAN_READY), &mmc_ext_csd_image())
            // Bus width switch, then high-speed switch, each with one
            // status poll.
            .expect(6, Ok(TRAN_READY))
            .expect(13, Ok(TRAN_READY))
            .expect(6, Ok(TRAN_READY))
            .expect(13, Ok(TRAN_READY));
        let alloc = MockAlloc::new();

        let card = CardSession::initialize(&mut host, &alloc).unwrap();
        assert!(card.is_mmc());
        assert_eq!(card.rca(), 1);
        assert_eq!(card.bus_width(), 4);
        // EXT_CSD sector count overrides the CSD placeholder capacity.
        assert_eq!(card.capacity_blocks(), 15_269_888);
        assert_eq!(card.freq_khz(), 52_000);
        assert_eq!(card.cid().product_name(), "MMC08G");
        drop(card);

        // Exactly the retry budget of ACMD41 attempts hit the bus.
        let acmd41s = host.log.iter().filter(|(op, _)| *op == 41).count();
        assert_eq!(acmd41s as u32, SEND_OP_COND_MAX_RETRIES);
    }

    #[test]
    fn op_cond_error_budget_is_bounded() {
        let mut host = sd_preamble(MockHost::new());
        // Four communication errors exhaust the budget of three on the SD
        // path; the MMC fallback then burns its own budget the same way.
        for _ in 0..4 {
            host.push(55, Err(BusError::Crc));
        }
        for _ in 0..4 {
            host.push(1, Err(BusError::Crc));
        }
        let alloc = MockAlloc::new();

        let err = CardSession::initialize(&mut host, &alloc).unwrap_err();
        assert_eq!(err.stage, Stage::NegotiateOcr);
        assert_eq!(err.source, Error::Timeout);
        assert_eq!(host.transactions(), 3 + 4 + 4);
    }

    #[test]
    fn pure_io_card_skips_memory_stages() {
        // R4: ready, one function, no memory portion.
        let mut host = MockHost::new()
            .expect(0, Ok([0; 4]))
            .expect(8, Err(BusError::Timeout))
            .expect(5, Ok([0x1000_0000 | 0x00ff_0000, 0, 0, 0]))
            .expect(5, Ok([0x9000_0000 | 0x00ff_0000, 0, 0, 0]))
            .expect(3, Ok([0x0001_0000, 0, 0, 0]))
            .expect(7, Ok(TRAN_READY));
        let alloc = MockAlloc::new();

        let card = CardSession::initialize(&mut host, &alloc).unwrap();
        assert_eq!(card.family(), CardFamily::Sdio);
        assert!(card.is_sdio());
        assert_eq!(card.capacity_blocks(), 0);
        assert_eq!(card.rca(), 1);
        drop(card);
        // No CSD, CID or block-length traffic for an IO-only card.
        assert!(host.log.iter().all(|(op, _)| ![2, 9, 16].contains(op)));
    }
}
