//! One request/response exchange against the bus host.

use core::time::Duration;

use sdio_host::{
    common_cmd::{self, Resp, R1, R3},
    sd_cmd, Cmd,
};

use crate::{
    err::BusError,
    host::{BusHost, Command, Data, ResponseKind, Transfer},
    resp::R1Status,
};

/// Applied when neither the host nor the command names a timeout.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_millis(1000);

/// R1 followed by busy on DAT0.
pub struct R1b;
/// SDIO operation conditions response.
pub struct R4;
/// SDIO register access response.
pub struct R5;

impl Resp for R1b {}
impl Resp for R4 {}
impl Resp for R5 {}

/// Maps a typed command response marker onto the wire-level response class.
pub trait RespExt: Resp {
    const KIND: ResponseKind;
}

impl RespExt for common_cmd::Rz {
    const KIND: ResponseKind = ResponseKind::None;
}
impl RespExt for common_cmd::R1 {
    const KIND: ResponseKind = ResponseKind::R1;
}
impl RespExt for common_cmd::R2 {
    const KIND: ResponseKind = ResponseKind::R2;
}
impl RespExt for common_cmd::R3 {
    const KIND: ResponseKind = ResponseKind::R3;
}
impl RespExt for sd_cmd::R6 {
    const KIND: ResponseKind = ResponseKind::R6;
}
impl RespExt for sd_cmd::R7 {
    const KIND: ResponseKind = ResponseKind::R7;
}
impl RespExt for R1b {
    const KIND: ResponseKind = ResponseKind::R1b;
}
impl RespExt for R4 {
    const KIND: ResponseKind = ResponseKind::R4;
}
impl RespExt for R5 {
    const KIND: ResponseKind = ResponseKind::R5;
}

impl<'a, R: RespExt> From<Cmd<R>> for Command<'a> {
    fn from(cmd: Cmd<R>) -> Self {
        Command::new(cmd.cmd, cmd.arg, R::KIND)
    }
}

/// CMD5: SDIO operation conditions probe and negotiation.
pub fn io_send_op_cond(io_ocr: u32) -> Cmd<R4> {
    common_cmd::cmd(5, io_ocr)
}

/// CMD58: read the OCR over SPI.
pub fn spi_read_ocr() -> Cmd<R3> {
    common_cmd::cmd(58, 0)
}

/// CMD59: toggle CRC protection of SPI exchanges.
pub fn spi_crc_on_off(enable: bool) -> Cmd<R1> {
    common_cmd::cmd(59, enable as u32)
}

/// Execute exactly one exchange, resolving the effective timeout as
/// host override, then per-command value, then [`DEFAULT_CMD_TIMEOUT`].
///
/// Card-state bits embedded in the response are left to the caller.
pub fn send<H: BusHost + ?Sized>(host: &mut H, cmd: &mut Command<'_>) -> Result<(), BusError> {
    let timeout = host
        .command_timeout()
        .or(cmd.timeout)
        .unwrap_or(DEFAULT_CMD_TIMEOUT);
    cmd.timeout = Some(timeout);

    log::trace!("CMD{} arg {:#010x} {:?}", cmd.opcode, cmd.arg, cmd.resp);
    match host.do_transaction(cmd) {
        Ok(()) => {
            log::trace!("CMD{} resp {:#010x}", cmd.opcode, cmd.response[0]);
            Ok(())
        }
        Err(err) => {
            log::trace!("CMD{} failed: {err}", cmd.opcode);
            Err(err)
        }
    }
}

/// Announce that the next command is an application command (CMD55).
///
/// In native bus mode the response must acknowledge application commands; a
/// card that does not fails with [`BusError::NotSupported`].
pub fn app_prefix<H: BusHost + ?Sized>(host: &mut H, rca: u16) -> Result<(), BusError> {
    let mut prefix = Command::from(common_cmd::app_cmd(rca));
    send(host, &mut prefix)?;
    if !host.is_spi_mode() {
        let status = R1Status::from_bits_retain(prefix.response[0]);
        if !status.contains(R1Status::APP_CMD) {
            log::error!("card does not accept application commands");
            return Err(BusError::NotSupported);
        }
    }
    Ok(())
}

/// Issue the APP_CMD prefix, then the application command itself. An error
/// in the prefix exchange aborts without touching the main command.
pub fn send_app_cmd<H: BusHost + ?Sized>(
    host: &mut H,
    rca: u16,
    cmd: &mut Command<'_>,
) -> Result<(), BusError> {
    app_prefix(host, rca)?;
    send(host, cmd)
}

/// Single-block data-phase read used for register images (SCR, SD Status,
/// switch status, EXT_CSD). Returns the raw response words of the command.
pub fn read_transfer<H: BusHost + ?Sized, R: RespExt>(
    host: &mut H,
    cmd: Cmd<R>,
    buf: &mut [u8],
) -> Result<[u32; 4], BusError> {
    let block_len = buf.len();
    let mut command = Command::with_data(
        cmd.cmd,
        cmd.arg,
        R::KIND,
        Data {
            transfer: Transfer::Read(buf),
            block_len,
        },
    );
    send(host, &mut command)?;
    Ok(command.response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHost;

    #[test]
    fn timeout_resolution_prefers_host() {
        let mut host = MockHost::new().expect(13, Ok([0x900, 0, 0, 0]));
        host.timeout = Some(Duration::from_millis(250));
        let mut cmd = Command::from(common_cmd::card_status(1, false));
        cmd.timeout = Some(Duration::from_millis(75));
        send(&mut host, &mut cmd).unwrap();
        assert_eq!(cmd.timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn timeout_defaults_when_unset() {
        let mut host = MockHost::new().expect(13, Ok([0x900, 0, 0, 0]));
        let mut cmd = Command::from(common_cmd::card_status(1, false));
        send(&mut host, &mut cmd).unwrap();
        assert_eq!(cmd.timeout, Some(DEFAULT_CMD_TIMEOUT));
    }

    #[test]
    fn app_cmd_checks_ack_bit() {
        // APP_CMD bit clear: the payload command must never reach the bus.
        let mut host = MockHost::new().expect(55, Ok([0x900, 0, 0, 0]));
        let mut cmd = Command::from(sd_cmd::sd_send_op_cond(true, false, false, 0x1ff));
        assert_eq!(
            send_app_cmd(&mut host, 0, &mut cmd),
            Err(BusError::NotSupported)
        );
        assert_eq!(host.transactions(), 1);
    }

    #[test]
    fn app_cmd_prefix_failure_is_fatal() {
        let mut host = MockHost::new().expect(55, Err(BusError::Timeout));
        let mut cmd = Command::from(sd_cmd::sd_send_op_cond(true, false, false, 0x1ff));
        assert_eq!(send_app_cmd(&mut host, 0, &mut cmd), Err(BusError::Timeout));
        assert_eq!(host.transactions(), 1);
    }

    #[test]
    fn app_cmd_skips_ack_check_in_spi() {
        let mut host = MockHost::spi()
            .expect(55, Ok([0, 0, 0, 0]))
            .expect(41, Ok([0, 0, 0, 0]));
        let mut cmd = Command::from(sd_cmd::sd_send_op_cond(true, false, false, 0x1ff));
        send_app_cmd(&mut host, 0, &mut cmd).unwrap();
        assert_eq!(host.transactions(), 2);
    }

    #[test]
    fn response_shape_table() {
        assert!(ResponseKind::R1b.has_busy());
        assert!(!ResponseKind::R1.has_busy());
        assert!(!ResponseKind::R3.check_crc());
        assert!(!ResponseKind::R4.check_crc());
        assert!(ResponseKind::R2.check_crc());
        assert!(!ResponseKind::R2.check_index());
        assert!(ResponseKind::R7.check_index());
    }
}
