//! Long-lived per-card state.

use core::fmt;

use crate::{
    host::{AlignedAllocator, BusHost},
    init::CardFamily,
    resp::{Cid, Csd, ExtCsd, Ocr, Scr, Ssr},
};

/// One initialized card on one slot.
///
/// A session is only ever observed fully built: construction goes through
/// [`CardSession::initialize`], and a failed bring-up returns an error
/// instead of a partial session. The bus host is borrowed for the whole
/// session lifetime; the host object outlives the card.
///
/// One logical caller drives one session at a time; the session performs no
/// internal locking.
pub struct CardSession<'h, H: BusHost + ?Sized, A: AlignedAllocator + ?Sized> {
    pub(crate) host: &'h mut H,
    pub(crate) alloc: &'h A,
    pub(crate) family: CardFamily,
    pub(crate) is_spi: bool,
    pub(crate) is_ddr: bool,
    /// Number of SDIO functions; zero on memory-only cards.
    pub(crate) io_funcs: u8,
    /// Negotiated IO OCR; zero on memory-only cards.
    pub(crate) io_ocr: u32,
    pub(crate) ocr: u32,
    pub(crate) rca: u16,
    pub(crate) cid: Cid,
    pub(crate) csd: Csd,
    pub(crate) scr: Option<Scr>,
    pub(crate) ssr: Option<Ssr>,
    pub(crate) ext_csd: Option<ExtCsd>,
    pub(crate) high_speed: bool,
    pub(crate) bus_width: u8,
    pub(crate) freq_khz: u32,
}

impl<H: BusHost + ?Sized, A: AlignedAllocator + ?Sized> CardSession<'_, H, A> {
    pub fn family(&self) -> CardFamily {
        self.family
    }

    pub fn is_mmc(&self) -> bool {
        self.family == CardFamily::Mmc
    }

    pub fn is_sdio(&self) -> bool {
        self.io_funcs > 0
    }

    pub fn is_spi_mode(&self) -> bool {
        self.is_spi
    }

    pub fn is_ddr(&self) -> bool {
        self.is_ddr
    }

    /// Whether commands address by block number rather than byte offset.
    pub fn is_high_capacity(&self) -> bool {
        Ocr(self.ocr).high_capacity()
    }

    pub fn ocr(&self) -> Ocr {
        Ocr(self.ocr)
    }

    /// Negotiated IO operation conditions, meaningful when [`Self::is_sdio`].
    pub fn io_ocr(&self) -> u32 {
        self.io_ocr
    }

    pub fn rca(&self) -> u16 {
        self.rca
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn csd(&self) -> &Csd {
        &self.csd
    }

    pub fn scr(&self) -> Option<&Scr> {
        self.scr.as_ref()
    }

    pub fn ssr(&self) -> Option<&Ssr> {
        self.ssr.as_ref()
    }

    pub fn ext_csd(&self) -> Option<&ExtCsd> {
        self.ext_csd.as_ref()
    }

    pub fn capacity_blocks(&self) -> u64 {
        self.csd.capacity
    }

    pub fn sector_size(&self) -> u32 {
        self.csd.sector_size
    }

    pub fn high_speed(&self) -> bool {
        self.high_speed
    }

    pub fn bus_width(&self) -> u8 {
        self.bus_width
    }

    /// Bus frequency actually achieved after negotiation.
    pub fn freq_khz(&self) -> u32 {
        self.freq_khz
    }
}

impl<H: BusHost + ?Sized, A: AlignedAllocator + ?Sized> fmt::Debug for CardSession<'_, H, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardSession")
            .field("family", &self.family)
            .field("is_spi", &self.is_spi)
            .field("is_ddr", &self.is_ddr)
            .field("io_funcs", &self.io_funcs)
            .field("io_ocr", &self.io_ocr)
            .field("ocr", &self.ocr)
            .field("rca", &self.rca)
            .field("high_speed", &self.high_speed)
            .field("bus_width", &self.bus_width)
            .field("freq_khz", &self.freq_khz)
            .finish_non_exhaustive()
    }
}

impl<H: BusHost + ?Sized, A: AlignedAllocator + ?Sized> fmt::Display for CardSession<'_, H, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.family {
            CardFamily::Sd if self.is_sdio() => "SD combo",
            CardFamily::Sd => "SD",
            CardFamily::Mmc => "MMC",
            CardFamily::Sdio => "SDIO",
        };
        write!(
            f,
            "{kind} card '{}': {} sectors of {} B, {}-bit bus at {} kHz{}",
            self.cid.product_name(),
            self.csd.capacity,
            self.csd.sector_size,
            self.bus_width,
            self.freq_khz,
            if self.is_ddr { " (DDR)" } else { "" },
        )
    }
}
