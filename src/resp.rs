//! Bit-exact translation between raw response words and typed register
//! structures. Pure functions, no I/O.
//!
//! 136-bit registers use the specification bit numbering over `[u32; 4]`:
//! `raw[3]` holds register bits 127:96 and the CRC byte sits in bits 7:0
//! (hosts that strip it leave zeroes there). The decoders never read bits
//! the layout does not name.

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::err::DecodeError;

/// Extract `len` bits starting at register bit `start`.
pub(crate) fn bits(raw: &[u32; 4], start: u32, len: u32) -> u32 {
    debug_assert!(len >= 1 && len <= 32 && start + len <= 128);
    let word = (start / 32) as usize;
    let shift = start % 32;
    let mut out = raw[word] >> shift;
    if shift + len > 32 {
        out |= raw[word + 1] << (32 - shift);
    }
    (out as u64 & ((1u64 << len) - 1)) as u32
}

/// Insert `len` bits of `value` at register bit `start`. Inverse of [`bits`].
pub(crate) fn set_bits(raw: &mut [u32; 4], start: u32, len: u32, value: u32) {
    debug_assert!(len >= 1 && len <= 32 && start + len <= 128);
    let value = (value as u64 & ((1u64 << len) - 1)) as u32;
    let word = (start / 32) as usize;
    let shift = start % 32;
    let lo_mask = (((1u64 << len) - 1) << shift) as u32;
    raw[word] = (raw[word] & !lo_mask) | (value << shift);
    if shift + len > 32 {
        let hi_len = shift + len - 32;
        let hi_mask = ((1u64 << hi_len) - 1) as u32;
        raw[word + 1] = (raw[word + 1] & !hi_mask) | (value >> (32 - shift));
    }
}

/// Reverse the 32-bit word order and byte-swap each word, in place.
///
/// CID/CSD register images arrive MSB-first over SPI data phases while the
/// decoders expect the register word order above; this converts between the
/// two. The buffer length must be a multiple of 8 bytes (an even word
/// count); that is a precondition, not a runtime error.
pub fn flip_byte_order(words: &mut [u32]) {
    debug_assert!(words.len() % 2 == 0, "length must be a multiple of 8 bytes");
    let n = words.len();
    for i in 0..n / 2 {
        let hi = words[n - 1 - i].swap_bytes();
        words[n - 1 - i] = words[i].swap_bytes();
        words[i] = hi;
    }
}

/// Operation Conditions Register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ocr(pub u32);

impl Ocr {
    /// Power-up done (negated busy).
    pub const READY: u32 = 1 << 31;
    /// SD CCS bit; also the MMC sector-mode access bit.
    pub const HIGH_CAPACITY: u32 = 1 << 30;
    /// MMC byte-mode access bit.
    pub const MMC_BYTE_MODE: u32 = 1 << 29;
    /// Switching to 1.8 V accepted.
    pub const S18A: u32 = 1 << 24;
    /// 2.7-3.6 V voltage window.
    pub const VOLTAGE_3V3_WINDOW: u32 = 0x00ff_8000;
    /// 1.65-1.95 V low-voltage bit.
    pub const LOW_VOLTAGE: u32 = 1 << 7;

    pub fn is_ready(self) -> bool {
        self.0 & Self::READY != 0
    }

    /// Block addressing instead of byte addressing.
    pub fn high_capacity(self) -> bool {
        self.0 & Self::HIGH_CAPACITY != 0
    }

    pub fn voltage_window(self) -> u32 {
        self.0 & Self::VOLTAGE_3V3_WINDOW
    }
}

/// Trivial field extraction, infallible.
pub fn decode_ocr(raw: u32) -> Ocr {
    Ocr(raw)
}

/// SDIO R4 response (IO_SEND_OP_COND).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoOcr(pub u32);

impl IoOcr {
    pub fn is_ready(self) -> bool {
        self.0 & (1 << 31) != 0
    }

    /// Number of IO functions, 0..=7.
    pub fn num_functions(self) -> u8 {
        ((self.0 >> 28) & 0x7) as u8
    }

    pub fn memory_present(self) -> bool {
        self.0 & (1 << 27) != 0
    }

    pub fn io_ocr(self) -> u32 {
        self.0 & 0x00ff_ffff
    }
}

bitflags! {
    /// R1 card status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct R1Status: u32 {
        const OUT_OF_RANGE       = 1 << 31;
        const ADDRESS_ERROR      = 1 << 30;
        const BLOCK_LEN_ERROR    = 1 << 29;
        const ERASE_SEQ_ERROR    = 1 << 28;
        const ERASE_PARAM        = 1 << 27;
        const WP_VIOLATION       = 1 << 26;
        const CARD_IS_LOCKED     = 1 << 25;
        const LOCK_UNLOCK_FAILED = 1 << 24;
        const COM_CRC_ERROR      = 1 << 23;
        const ILLEGAL_COMMAND    = 1 << 22;
        const CARD_ECC_FAILED    = 1 << 21;
        const CC_ERROR           = 1 << 20;
        const ERROR              = 1 << 19;
        const CSD_OVERWRITE      = 1 << 16;
        const WP_ERASE_SKIP      = 1 << 15;
        const ERASE_RESET        = 1 << 13;
        const READY_FOR_DATA     = 1 << 8;
        const SWITCH_ERROR       = 1 << 7;
        const APP_CMD            = 1 << 5;

        const ERROR_MASK =
              Self::OUT_OF_RANGE.bits()
            | Self::ADDRESS_ERROR.bits()
            | Self::BLOCK_LEN_ERROR.bits()
            | Self::ERASE_SEQ_ERROR.bits()
            | Self::ERASE_PARAM.bits()
            | Self::WP_VIOLATION.bits()
            | Self::LOCK_UNLOCK_FAILED.bits()
            | Self::COM_CRC_ERROR.bits()
            | Self::ILLEGAL_COMMAND.bits()
            | Self::CARD_ECC_FAILED.bits()
            | Self::CC_ERROR.bits()
            | Self::ERROR.bits()
            | Self::CSD_OVERWRITE.bits()
            | Self::WP_ERASE_SKIP.bits()
            | Self::SWITCH_ERROR.bits();
    }
}

/// CURRENT_STATE nibble of the R1 status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Idle,
    Ready,
    Identification,
    Standby,
    Transfer,
    SendingData,
    ReceiveData,
    Programming,
    Disconnect,
    Unknown,
}

impl From<u8> for CardState {
    fn from(nibble: u8) -> Self {
        match nibble {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Identification,
            3 => CardState::Standby,
            4 => CardState::Transfer,
            5 => CardState::SendingData,
            6 => CardState::ReceiveData,
            7 => CardState::Programming,
            8 => CardState::Disconnect,
            _ => CardState::Unknown,
        }
    }
}

impl R1Status {
    pub fn current_state(self) -> CardState {
        CardState::from(((self.bits() >> 9) & 0xf) as u8)
    }

    pub fn any_error(self) -> bool {
        self.intersects(Self::ERROR_MASK)
    }
}

bitflags! {
    /// SPI-mode R1 token (low byte of every SPI response).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SpiR1: u32 {
        const IN_IDLE_STATE  = 1 << 0;
        const ERASE_RESET    = 1 << 1;
        const ILLEGAL_CMD    = 1 << 2;
        const CMD_CRC_ERROR  = 1 << 3;
        const ERASE_SEQ_ERR  = 1 << 4;
        const ADDRESS_ERROR  = 1 << 5;
        const PARAMETER_ERROR = 1 << 6;
    }
}

/// Card Identification register, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cid {
    /// Manufacturer ID; 24 bits wide on MMC v1.x cards, 8 bits elsewhere.
    pub mfg_id: u32,
    pub oem_id: u16,
    /// Product name, NUL-padded. 5 chars on SD, 6 on MMC v2+, 7 on MMC v1.
    pub name: [u8; 7],
    pub revision: u8,
    pub serial: u32,
    pub month: u8,
    pub year: u16,
    /// Raw CRC byte (CRC7 plus end bit) as received; zero when the host
    /// strips it.
    pub crc: u8,
}

impl Cid {
    pub fn product_name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("<?>")
    }
}

/// Which historical CID field layout a card uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidLayout {
    Sd,
    /// MMC system spec 1.0-1.4.
    MmcV1,
    /// MMC system spec 2.0-3.x.
    MmcV2,
    /// MMC system spec 4.0 and later (8-bit OID, CBX field).
    MmcV4,
}

fn cid_layout(is_mmc: bool, mmc_version: Option<u8>) -> Result<CidLayout, DecodeError> {
    if !is_mmc {
        return Ok(CidLayout::Sd);
    }
    match mmc_version {
        None => Err(DecodeError::UnsupportedVersion),
        Some(0) | Some(1) => Ok(CidLayout::MmcV1),
        Some(2) | Some(3) => Ok(CidLayout::MmcV2),
        Some(_) => Ok(CidLayout::MmcV4),
    }
}

/// Decode a CID register image.
///
/// The MMC layout depends on the SPEC_VERS field of the CSD, so MMC callers
/// must have decoded the CSD first; `mmc_version` missing when required
/// fails with [`DecodeError::UnsupportedVersion`].
pub fn decode_cid(
    raw: [u32; 4],
    is_mmc: bool,
    mmc_version: Option<u8>,
) -> Result<Cid, DecodeError> {
    let layout = cid_layout(is_mmc, mmc_version)?;
    let mut cid = Cid {
        crc: bits(&raw, 0, 8) as u8,
        ..Default::default()
    };
    match layout {
        CidLayout::Sd => {
            cid.mfg_id = bits(&raw, 120, 8);
            cid.oem_id = bits(&raw, 104, 16) as u16;
            for (i, byte) in cid.name[..5].iter_mut().enumerate() {
                *byte = bits(&raw, 96 - 8 * i as u32, 8) as u8;
            }
            cid.revision = bits(&raw, 56, 8) as u8;
            cid.serial = bits(&raw, 24, 32);
            let mdt = bits(&raw, 8, 12);
            cid.month = (mdt & 0xf) as u8;
            cid.year = 2000 + (mdt >> 4) as u16;
        }
        CidLayout::MmcV1 => {
            cid.mfg_id = bits(&raw, 104, 24);
            for (i, byte) in cid.name.iter_mut().enumerate() {
                *byte = bits(&raw, 96 - 8 * i as u32, 8) as u8;
            }
            cid.revision = bits(&raw, 40, 8) as u8;
            cid.serial = bits(&raw, 16, 24);
            let mdt = bits(&raw, 8, 8);
            cid.month = (mdt >> 4) as u8;
            cid.year = 1997 + (mdt & 0xf) as u16;
        }
        CidLayout::MmcV2 | CidLayout::MmcV4 => {
            cid.mfg_id = bits(&raw, 120, 8);
            cid.oem_id = if layout == CidLayout::MmcV2 {
                bits(&raw, 104, 16) as u16
            } else {
                bits(&raw, 104, 8) as u16
            };
            for (i, byte) in cid.name[..6].iter_mut().enumerate() {
                *byte = bits(&raw, 96 - 8 * i as u32, 8) as u8;
            }
            cid.revision = bits(&raw, 48, 8) as u8;
            cid.serial = bits(&raw, 16, 32);
            let mdt = bits(&raw, 8, 8);
            cid.month = (mdt >> 4) as u8;
            cid.year = 1997 + (mdt & 0xf) as u16;
        }
    }
    Ok(cid)
}

/// Rebuild the register image a [`Cid`] was decoded from. Reserved bits come
/// out zero, so this is the exact inverse of [`decode_cid`] for compliant
/// cards.
pub fn encode_cid(cid: &Cid, layout: CidLayout) -> [u32; 4] {
    let mut raw = [0u32; 4];
    set_bits(&mut raw, 0, 8, cid.crc as u32);
    match layout {
        CidLayout::Sd => {
            set_bits(&mut raw, 120, 8, cid.mfg_id);
            set_bits(&mut raw, 104, 16, cid.oem_id as u32);
            for (i, &byte) in cid.name[..5].iter().enumerate() {
                set_bits(&mut raw, 96 - 8 * i as u32, 8, byte as u32);
            }
            set_bits(&mut raw, 56, 8, cid.revision as u32);
            set_bits(&mut raw, 24, 32, cid.serial);
            let mdt = ((cid.year - 2000) as u32) << 4 | cid.month as u32;
            set_bits(&mut raw, 8, 12, mdt);
        }
        CidLayout::MmcV1 => {
            set_bits(&mut raw, 104, 24, cid.mfg_id);
            for (i, &byte) in cid.name.iter().enumerate() {
                set_bits(&mut raw, 96 - 8 * i as u32, 8, byte as u32);
            }
            set_bits(&mut raw, 40, 8, cid.revision as u32);
            set_bits(&mut raw, 16, 24, cid.serial);
            let mdt = (cid.month as u32) << 4 | ((cid.year - 1997) as u32 & 0xf);
            set_bits(&mut raw, 8, 8, mdt);
        }
        CidLayout::MmcV2 | CidLayout::MmcV4 => {
            set_bits(&mut raw, 120, 8, cid.mfg_id);
            if layout == CidLayout::MmcV2 {
                set_bits(&mut raw, 104, 16, cid.oem_id as u32);
            } else {
                set_bits(&mut raw, 104, 8, cid.oem_id as u32);
            }
            for (i, &byte) in cid.name[..6].iter().enumerate() {
                set_bits(&mut raw, 96 - 8 * i as u32, 8, byte as u32);
            }
            set_bits(&mut raw, 48, 8, cid.revision as u32);
            set_bits(&mut raw, 16, 32, cid.serial);
            let mdt = (cid.month as u32) << 4 | ((cid.year - 1997) as u32 & 0xf);
            set_bits(&mut raw, 8, 8, mdt);
        }
    }
    raw
}

/// Card Specific Data register, decoded and normalized to 512-byte logical
/// sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Csd {
    /// Raw CSD_STRUCTURE field (0 = v1.0, 1 = v2.0).
    pub csd_ver: u8,
    /// MMC SPEC_VERS field; zero for SD cards.
    pub mmc_ver: u8,
    /// Capacity in `sector_size` units.
    pub capacity: u64,
    /// Logical sector size, `min(1 << read_block_len, 512)`.
    pub sector_size: u32,
    /// Raw READ_BL_LEN field.
    pub read_block_len: u8,
    pub card_command_class: u16,
    /// Maximum transfer rate from TRAN_SPEED; zero when the field uses a
    /// reserved rate unit.
    pub tran_speed_khz: u32,
}

const TRAN_UNIT_KHZ: [u32; 4] = [100, 1_000, 10_000, 100_000];
const TRAN_MULT10: [u32; 16] = [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];

fn tran_speed_khz(byte: u8) -> u32 {
    match TRAN_UNIT_KHZ.get((byte & 0x7) as usize) {
        Some(&unit) => unit * TRAN_MULT10[((byte >> 3) & 0xf) as usize] / 10,
        None => 0,
    }
}

/// Decode a CSD register image.
///
/// When the physical read block exceeds 512 bytes the capacity is rescaled
/// losslessly so that `capacity * sector_size` stays the true byte capacity;
/// a rescale that would not divide evenly fails with
/// [`DecodeError::Inconsistent`].
pub fn decode_csd(raw: [u32; 4], is_mmc: bool) -> Result<Csd, DecodeError> {
    let mut csd = Csd {
        csd_ver: bits(&raw, 126, 2) as u8,
        ..Default::default()
    };
    if is_mmc {
        // All MMC CSD structure revisions keep these fields in place; from
        // revision 3 on, the authoritative version lives in the EXT_CSD.
        csd.mmc_ver = bits(&raw, 122, 4) as u8;
        csd.capacity = u64::from(bits(&raw, 62, 12) + 1) << (bits(&raw, 47, 3) + 2);
        csd.read_block_len = bits(&raw, 80, 4) as u8;
    } else {
        match csd.csd_ver {
            0 => {
                csd.capacity = u64::from(bits(&raw, 62, 12) + 1) << (bits(&raw, 47, 3) + 2);
                csd.read_block_len = bits(&raw, 80, 4) as u8;
            }
            1 => {
                csd.capacity = u64::from(bits(&raw, 48, 22) + 1) * 1024;
                csd.read_block_len = 9;
            }
            _ => return Err(DecodeError::UnsupportedVersion),
        }
    }
    csd.card_command_class = bits(&raw, 84, 12) as u16;
    csd.tran_speed_khz = tran_speed_khz(bits(&raw, 96, 8) as u8);

    let block_len = 1u32 << csd.read_block_len;
    csd.sector_size = block_len.min(512);
    if block_len > csd.sector_size {
        if block_len % csd.sector_size != 0 {
            return Err(DecodeError::Inconsistent);
        }
        csd.capacity = csd
            .capacity
            .checked_mul(u64::from(block_len / csd.sector_size))
            .ok_or(DecodeError::Inconsistent)?;
    }
    Ok(csd)
}

/// SD Configuration register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scr(pub u64);

impl Scr {
    /// Combined physical-layer spec version: 0, 1, 2 or 3 (3 when SD_SPEC3
    /// is set on a 2.00 card).
    pub fn spec(self) -> u8 {
        let spec = ((self.0 >> 56) & 0xf) as u8;
        let spec3 = (self.0 >> 47) & 1;
        if spec == 2 && spec3 == 1 {
            3
        } else {
            spec
        }
    }

    pub fn bus_width_one(self) -> bool {
        (self.0 >> 48) & 1 != 0
    }

    pub fn bus_width_four(self) -> bool {
        (self.0 >> 50) & 1 != 0
    }
}

/// Decode the 8-byte SCR image as it arrives on the wire (MSB first).
pub fn decode_scr(bytes: &[u8]) -> Result<Scr, DecodeError> {
    let image: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or(DecodeError::Truncated)?;
    let scr = Scr(u64::from_be_bytes(image));
    // SCR_STRUCTURE values other than zero are not assigned.
    if (scr.0 >> 60) & 0xf != 0 {
        return Err(DecodeError::UnsupportedVersion);
    }
    Ok(scr)
}

/// The slice of the 512-bit SD Status the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ssr {
    /// Currently negotiated data bus width; zero when the field is reserved.
    pub bus_width: u8,
    pub discard_support: bool,
    pub fule_support: bool,
}

fn ssr_bit(image: &[u8], bit: u32) -> bool {
    let byte = image[((511 - bit) / 8) as usize];
    byte & (1 << (bit % 8)) != 0
}

/// Decode the 64-byte SD Status image (ACMD13 data phase, MSB first).
pub fn decode_ssr(bytes: &[u8]) -> Result<Ssr, DecodeError> {
    let image = bytes.get(..64).ok_or(DecodeError::Truncated)?;
    let bus_width = match image[0] >> 6 {
        0 => 1,
        2 => 4,
        _ => 0,
    };
    Ok(Ssr {
        bus_width,
        discard_support: ssr_bit(image, 313),
        fule_support: ssr_bit(image, 312),
    })
}

/// Byte offsets into the 512-byte EXT_CSD register.
pub mod ext_csd {
    pub const LEN: usize = 512;

    pub const SANITIZE_START: usize = 165;
    pub const BUS_WIDTH: usize = 183;
    pub const HS_TIMING: usize = 185;
    pub const POWER_CLASS: usize = 187;
    pub const REV: usize = 192;
    pub const CARD_TYPE: usize = 196;
    pub const PWR_CL_52_360: usize = 202;
    pub const PWR_CL_26_360: usize = 203;
    pub const SEC_CNT: usize = 212;
    pub const SEC_FEATURE_SUPPORT: usize = 231;
    pub const PWR_CL_DDR_52_360: usize = 239;

    /// BUS_WIDTH register values.
    pub const BUS_WIDTH_1: u8 = 0;
    pub const BUS_WIDTH_4: u8 = 1;
    pub const BUS_WIDTH_8: u8 = 2;
    pub const BUS_WIDTH_4_DDR: u8 = 5;
    pub const BUS_WIDTH_8_DDR: u8 = 6;

    pub const HS_TIMING_HIGH_SPEED: u8 = 1;
}

const_assert!(ext_csd::SEC_CNT + 4 <= ext_csd::LEN);
const_assert!(ext_csd::PWR_CL_DDR_52_360 < ext_csd::LEN);

bitflags! {
    /// EXT_CSD DEVICE_TYPE bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MmcDeviceType: u8 {
        const HS_26        = 1 << 0;
        const HS_52        = 1 << 1;
        const DDR_52_HIGHV = 1 << 2;
        const DDR_52_1V2   = 1 << 3;
    }
}

bitflags! {
    /// EXT_CSD SEC_FEATURE_SUPPORT bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SecFeatures: u8 {
        const SECURE_ERASE = 1 << 0;
        const SECURE_BAD_BLOCK = 1 << 2;
        const TRIM         = 1 << 4;
        const SANITIZE     = 1 << 6;
    }
}

/// The EXT_CSD fields the core consumes, for MMC version 4.0 and later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtCsd {
    pub rev: u8,
    /// Sector count; overrides the CSD capacity when it names more than
    /// 2 GB.
    pub sec_count: u32,
    pub device_type: MmcDeviceType,
    pub power_class: u8,
    pub pwr_cl_52_360: u8,
    pub pwr_cl_26_360: u8,
    pub pwr_cl_ddr_52_360: u8,
    pub sec_features: SecFeatures,
}

impl ExtCsd {
    pub fn can_trim(&self) -> bool {
        self.sec_features.contains(SecFeatures::TRIM)
    }

    /// DISCARD exists from EXT_CSD revision 6 (eMMC 4.5) on.
    pub fn can_discard(&self) -> bool {
        self.rev >= 6
    }

    pub fn can_sanitize(&self) -> bool {
        self.sec_features.contains(SecFeatures::SANITIZE)
    }
}

/// Decode the EXT_CSD register image read via the MMC SEND_EXT_CSD data
/// phase.
pub fn decode_ext_csd(bytes: &[u8]) -> Result<ExtCsd, DecodeError> {
    if bytes.len() < ext_csd::LEN {
        return Err(DecodeError::Truncated);
    }
    let sec_count = u32::from_le_bytes([
        bytes[ext_csd::SEC_CNT],
        bytes[ext_csd::SEC_CNT + 1],
        bytes[ext_csd::SEC_CNT + 2],
        bytes[ext_csd::SEC_CNT + 3],
    ]);
    Ok(ExtCsd {
        rev: bytes[ext_csd::REV],
        sec_count,
        device_type: MmcDeviceType::from_bits_truncate(bytes[ext_csd::CARD_TYPE]),
        power_class: bytes[ext_csd::POWER_CLASS] & 0xf,
        pwr_cl_52_360: bytes[ext_csd::PWR_CL_52_360],
        pwr_cl_26_360: bytes[ext_csd::PWR_CL_26_360],
        pwr_cl_ddr_52_360: bytes[ext_csd::PWR_CL_DDR_52_360],
        sec_features: SecFeatures::from_bits_truncate(bytes[ext_csd::SEC_FEATURE_SUPPORT]),
    })
}
