//! PN532 Controller: stateful owner of the UART and reset line, exposing typed async operations
//! built on top of the [`Exchange`](crate::pn532::Exchange) command/response engine.

use embassy_time::{Duration, Timer};
use embedded_hal::digital::OutputPin;
use embedded_io_async::{Read, Write};
use log::{debug, warn};

use crate::error::Error;
use crate::pn532::{self, Exchange};
use crate::tag::TagInfo;

const DIAGNOSE: u8 = 0x00;
const GET_FIRMWARE_VERSION: u8 = 0x02;
const SAM_CONFIGURATION: u8 = 0x14;
const RF_CONFIGURATION: u8 = 0x32;
const IN_DATA_EXCHANGE: u8 = 0x40;
const IN_LIST_PASSIVE_TARGET: u8 = 0x4A;
const IN_RELEASE: u8 = 0x52;

/// Attention Request diagnose test used to check whether a selected target still answers.
const DIAGNOSE_ATTENTION_REQUEST: u8 = 0x06;

/// Length of the HSU wakeup preamble, in bytes of `0x55`. The PN532 user manual calls for a 5th
/// rising edge on the line; a generous preamble absorbs host scheduling jitter.
const WAKEUP_PREAMBLE_LEN: usize = 24;

const RESET_LOW_DELAY: Duration = Duration::from_millis(20);
const RESET_HIGH_DELAY: Duration = Duration::from_millis(10);
const INIT_RETRY_DELAY: Duration = Duration::from_millis(100);
const INIT_MAX_ATTEMPTS: u32 = 5;
const INIT_COMMAND_TIMEOUT: Duration = Duration::from_millis(100);

/// Application-facing success/failure of an `InDataExchange` exchange.
const IDE_STATUS_SUCCESS: u8 = 0x00;
const IDE_STATUS_TIMEOUT: u8 = 0x01;

/// Diagnose Attention Request response values.
const DIAGNOSE_PRESENT: u8 = 0x00;
const DIAGNOSE_ABSENT: u8 = 0x01;

/// Owns the UART and reset line, driving the PN532 through its command set.
///
/// At most one operation is ever outstanding: every method takes `&mut self`, so the borrow
/// checker enforces the single-in-flight invariant for free. `current_target_number` tracks the
/// PN532-local index of the currently selected tag, `0` meaning none.
pub struct Controller<UART, RESET, const N: usize = { pn532::BUFFER_SIZE }> {
    exchange: Exchange<UART, N>,
    reset: RESET,
    current_target_number: u8,
    started: bool,
}

impl<UART, RESET, const N: usize> Controller<UART, RESET, N>
where
    UART: Read + Write,
    RESET: OutputPin,
{
    /// Create a controller over `uart` and its `reset` pin. Call [`Controller::init`] before
    /// using any other operation.
    pub fn new(uart: UART, reset: RESET) -> Self {
        Self {
            exchange: Exchange::new(uart),
            reset,
            current_target_number: 0,
            started: false,
        }
    }

    /// Whether a tag is currently selected (between a successful [`detect_tag`](Self::detect_tag)
    /// and the matching [`release_tag`](Self::release_tag) or departure).
    pub fn has_selected_target(&self) -> bool {
        self.current_target_number != 0
    }

    /// Boot sequence: reset the chip, send the HSU wakeup preamble, configure it as an initiator
    /// and query its firmware version. Retries up to 5 times on any failure.
    pub async fn init(&mut self) -> Result<(), Error<UART::Error>> {
        debug_assert!(!self.started, "Controller::init called twice");

        for attempt in 1..=INIT_MAX_ATTEMPTS {
            match self.try_init().await {
                Ok(()) => {
                    self.started = true;
                    return Ok(());
                }
                Err(err) => {
                    warn!("PN532: init attempt {attempt}/{INIT_MAX_ATTEMPTS} failed: {err}");
                    Timer::after(INIT_RETRY_DELAY).await;
                }
            }
        }

        Err(Error::Unavailable)
    }

    async fn try_init(&mut self) -> Result<(), Error<UART::Error>> {
        self.reset.set_low().map_err(|_| Error::Unavailable)?;
        Timer::after(RESET_LOW_DELAY).await;
        self.reset.set_high().map_err(|_| Error::Unavailable)?;
        Timer::after(RESET_HIGH_DELAY).await;

        self.exchange.drain().await;

        // Wakeup preamble and SAMConfiguration go out as a single write burst: building both
        // into one buffer (rather than two separate awaited writes) rules out a cooperative
        // yield landing between them.
        const SAM_CONFIGURATION_PARAMS: [u8; 3] = [0x01, 0x14, 0x01];
        let mut burst = [0u8; WAKEUP_PREAMBLE_LEN + 9 + SAM_CONFIGURATION_PARAMS.len()];
        burst[..WAKEUP_PREAMBLE_LEN].fill(0x55);
        let n = crate::frame::build(
            SAM_CONFIGURATION,
            &SAM_CONFIGURATION_PARAMS,
            &mut burst[WAKEUP_PREAMBLE_LEN..],
        )?;
        self.exchange
            .send_prebuilt(
                &burst[..WAKEUP_PREAMBLE_LEN + n],
                SAM_CONFIGURATION,
                INIT_COMMAND_TIMEOUT,
            )
            .await?;

        self.exchange
            .send_command(GET_FIRMWARE_VERSION, &[], INIT_COMMAND_TIMEOUT)
            .await?;
        let version = self.exchange.payload();
        if version.len() == 4 {
            debug!(
                "PN532: IC 0x{:02x}, firmware {}.{}, support 0x{:02x}",
                version[0], version[1], version[2], version[3]
            );
        }

        // RFConfiguration (max retries) is a tuning step; failure doesn't abort boot.
        if let Err(err) = self
            .exchange
            .send_command(RF_CONFIGURATION, &[0x05, 0xFF, 0x01, 0x02], INIT_COMMAND_TIMEOUT)
            .await
        {
            warn!("PN532: RFConfiguration failed (non-fatal): {err}");
        }

        Ok(())
    }

    /// Poll once for an ISO/IEC 14443-A tag. A response timeout (device still listening, no tag
    /// answered) is reported as [`Error::NotFound`] rather than [`Error::Timeout`].
    pub async fn detect_tag(&mut self, timeout: Duration) -> Result<TagInfo, Error<UART::Error>> {
        match self
            .exchange
            .send_command(IN_LIST_PASSIVE_TARGET, &[0x01, 0x00], timeout)
            .await
        {
            Ok(()) => {}
            Err(Error::Timeout) => return Err(Error::NotFound),
            Err(err) => return Err(err),
        }

        let payload = self.exchange.payload();
        let nb_tg = *payload.first().ok_or(Error::DataLoss)?;
        if nb_tg == 0 {
            return Err(Error::NotFound);
        }
        if payload.len() < 6 {
            return Err(Error::DataLoss);
        }

        let target_number = payload[1];
        let sak = payload[4];
        let uid_len = payload[5] as usize;
        if payload.len() < 6 + uid_len {
            return Err(Error::DataLoss);
        }
        let uid = &payload[6..6 + uid_len];

        let tag = TagInfo::new(target_number, sak, uid).ok_or(Error::DataLoss)?;
        self.current_target_number = target_number;
        Ok(tag)
    }

    /// Exchange an APDU with the currently selected tag, writing the response into
    /// `response_buffer`. Returns the number of bytes written.
    pub async fn transceive(
        &mut self,
        command: &[u8],
        response_buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error<UART::Error>> {
        debug_assert_ne!(
            self.current_target_number, 0,
            "transceive called without a selected target"
        );

        let mut params = [0u8; 1 + crate::frame::MAX_PARAMS_LEN];
        if command.len() + 1 > params.len() {
            return Err(Error::TooLarge);
        }
        params[0] = self.current_target_number;
        params[1..1 + command.len()].copy_from_slice(command);

        self.exchange
            .send_command(IN_DATA_EXCHANGE, &params[..1 + command.len()], timeout)
            .await?;

        let payload = self.exchange.payload();
        let status = *payload.first().ok_or(Error::DataLoss)?;
        match status {
            IDE_STATUS_SUCCESS => {}
            IDE_STATUS_TIMEOUT => return Err(Error::Timeout),
            _ => return Err(Error::DeviceError),
        }

        let data = &payload[1..];
        if data.len() > response_buffer.len() {
            return Err(Error::BufferTooSmall);
        }
        response_buffer[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    /// Check whether the selected tag still answers an Attention Request.
    pub async fn check_present(&mut self, timeout: Duration) -> Result<bool, Error<UART::Error>> {
        self.exchange
            .send_command(DIAGNOSE, &[DIAGNOSE_ATTENTION_REQUEST], timeout)
            .await?;

        match self.exchange.payload().first() {
            Some(&DIAGNOSE_PRESENT) => Ok(true),
            Some(&DIAGNOSE_ABSENT) => Ok(false),
            _ => Err(Error::DeviceError),
        }
    }

    /// Release `target`. Best-effort: the local target is forgotten regardless of whether the
    /// device acknowledges the release.
    pub async fn release_tag(
        &mut self,
        target: u8,
        timeout: Duration,
    ) -> Result<(), Error<UART::Error>> {
        debug_assert_eq!(
            target, self.current_target_number,
            "release_tag called with a target other than the one currently selected"
        );
        self.current_target_number = 0;
        if target == 0 {
            return Ok(());
        }
        self.exchange
            .send_command(IN_RELEASE, &[target], timeout)
            .await?;
        Ok(())
    }

    /// Abort whatever the device is doing and resynchronize the line.
    pub async fn recover(&mut self) {
        self.exchange.recover().await;
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::collections::VecDeque;
    use std::vec::Vec;

    struct FakeUart {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl FakeUart {
        fn with_rx(bytes: &[u8]) -> Self {
            Self {
                rx: bytes.iter().copied().collect(),
                tx: Vec::new(),
            }
        }
    }

    impl embedded_io_async::ErrorType for FakeUart {
        type Error = core::convert::Infallible;
    }

    impl Read for FakeUart {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let n = buf.len().min(self.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for FakeUart {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[derive(Debug)]
    struct AlwaysOkPin;

    impl embedded_hal::digital::ErrorType for AlwaysOkPin {
        type Error = core::convert::Infallible;
    }

    impl OutputPin for AlwaysOkPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    fn ack_then(bytes: &[u8]) -> std::vec::Vec<u8> {
        let mut rx = crate::frame::ACK.to_vec();
        rx.extend_from_slice(bytes);
        rx
    }

    // S3: InListPassiveTarget with one Type-A tag present.
    #[tokio::test]
    async fn detect_tag_parses_single_target() {
        let response_payload = [0x01, 0x01, 0x00, 0x04, 0x20, 0x04, 0x01, 0x02, 0x03, 0x04];
        let mut response = std::vec![0x00, 0x00, 0xFF, (2 + response_payload.len()) as u8];
        response.push((!response[3]).wrapping_add(1));
        response.push(0xD5);
        response.push(0x4A + 1);
        response.extend_from_slice(&response_payload);
        let sum = response[5..]
            .iter()
            .fold(0u8, |s, &b| s.wrapping_add(b));
        response.push((!sum).wrapping_add(1));
        response.push(0x00);

        let uart = FakeUart::with_rx(&ack_then(&response));
        let mut controller = Controller::new(uart, AlwaysOkPin);

        let tag = controller
            .detect_tag(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(tag.uid(), [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(tag.sak(), 0x20);
        assert!(tag.supports_iso14443_4());
        assert!(controller.has_selected_target());
    }

    // S4: InListPassiveTarget, no tag.
    #[tokio::test]
    async fn detect_tag_not_found_when_nbtg_zero() {
        let response = [
            0x00, 0x00, 0xFF, 0x03, 0xFD, 0xD5, 0x4B, 0x00, 0xE0, 0x00,
        ];
        let uart = FakeUart::with_rx(&ack_then(&response));
        let mut controller = Controller::new(uart, AlwaysOkPin);

        let err = controller
            .detect_tag(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    // S5: timeout waiting for the response is remapped to NotFound.
    #[tokio::test]
    async fn detect_tag_timeout_is_not_found() {
        let uart = FakeUart::with_rx(&crate::frame::ACK);
        let mut controller = Controller::new(uart, AlwaysOkPin);

        let err = controller
            .detect_tag(Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    // S6: Diagnose Attention Request reports the tag as gone.
    #[tokio::test]
    async fn check_present_false_when_tag_gone() {
        let response = [0x00, 0x00, 0xFF, 0x03, 0xFD, 0xD5, 0x01, 0x01, 0x29, 0x00];
        let uart = FakeUart::with_rx(&ack_then(&response));
        let mut controller = Controller::new(uart, AlwaysOkPin);

        let present = controller
            .check_present(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!present);
    }

    // S7: InDataExchange returns 2 bytes of APDU response.
    #[tokio::test]
    async fn transceive_copies_payload_into_response_buffer() {
        let response = [
            0x00, 0x00, 0xFF, 0x05, 0xFB, 0xD5, 0x41, 0x00, 0x90, 0x00, 0x5A, 0x00,
        ];
        let uart = FakeUart::with_rx(&ack_then(&response));
        let mut controller = Controller::new(uart, AlwaysOkPin);
        controller.current_target_number = 1;

        let mut buf = [0u8; 16];
        let n = controller
            .transceive(&[0x00, 0xA4], &mut buf, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(&buf[..n], [0x90, 0x00]);
    }
}
