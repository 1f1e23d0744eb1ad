//! Command Exchange: one request/response cycle on the UART.
//!
//! Drives a single PN532 command to completion: build the frame, write it, wait for the 6-byte
//! ACK, then wait for the response frame. A deadline spans the whole exchange; on expiry the
//! host sends the ACK constant (which doubles as the device's cancel command) and drains the
//! line before reporting [`Error::Timeout`]. [`Exchange::send_prebuilt`] covers the one case
//! where the frame write must be preceded, in the same burst, by raw bytes that aren't part of
//! the framed protocol (the HSU wakeup preamble ahead of `SAMConfiguration` at boot).

use embassy_time::{with_timeout, Duration, Timer};
use embedded_io_async::{Read, Write};

use crate::error::Error;
use crate::frame::{self, MAX_PARAMS_LEN};

/// Size of the response staging buffer. Must hold the largest response this driver expects
/// (`InListPassiveTarget` with a 10-byte UID is the largest), with ample headroom.
pub const BUFFER_SIZE: usize = 265;

/// Delay between empty UART reads while waiting for more bytes.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Worst-case time for the device to finish transmitting a maximum-size frame at 115200 baud,
/// used as the settle delay after sending an abort during desync recovery.
const RECOVER_DRAIN_DELAY: Duration = Duration::from_millis(25);

/// Drives PN532 command/response exchanges over a byte-oriented UART.
pub struct Exchange<UART, const N: usize = BUFFER_SIZE> {
    uart: UART,
    rx: [u8; N],
    payload: [u8; MAX_PARAMS_LEN],
    payload_len: usize,
}

impl<UART, const N: usize> Exchange<UART, N>
where
    UART: Read + Write,
{
    /// Wrap a UART in a command exchange engine.
    pub fn new(uart: UART) -> Self {
        Self {
            uart,
            rx: [0; N],
            payload: [0; MAX_PARAMS_LEN],
            payload_len: 0,
        }
    }

    /// Payload bytes of the most recently completed exchange (excludes TFI and the echoed
    /// command byte).
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len]
    }

    /// Send `cmd` with `params` and wait up to `timeout` for the ACK and response.
    pub async fn send_command(
        &mut self,
        cmd: u8,
        params: &[u8],
        timeout: Duration,
    ) -> Result<(), Error<UART::Error>> {
        match with_timeout(timeout, self.run(cmd, params)).await {
            Ok(result) => result,
            Err(_) => {
                self.recover().await;
                Err(Error::Timeout)
            }
        }
    }

    async fn run(&mut self, cmd: u8, params: &[u8]) -> Result<(), Error<UART::Error>> {
        let mut tx = [0u8; 9 + MAX_PARAMS_LEN];
        let n = frame::build(cmd, params, &mut tx)?;
        write_all(&mut self.uart, &tx[..n])
            .await
            .map_err(Error::IoError)?;
        self.await_response(cmd).await
    }

    /// Send bytes that already encode a command frame (possibly preceded by raw bytes such as
    /// the HSU wakeup preamble) in a single write burst, then wait up to `timeout` for the ACK
    /// and the response to `cmd`.
    pub async fn send_prebuilt(
        &mut self,
        bytes: &[u8],
        cmd: u8,
        timeout: Duration,
    ) -> Result<(), Error<UART::Error>> {
        match with_timeout(timeout, self.run_prebuilt(bytes, cmd)).await {
            Ok(result) => result,
            Err(_) => {
                self.recover().await;
                Err(Error::Timeout)
            }
        }
    }

    async fn run_prebuilt(&mut self, bytes: &[u8], cmd: u8) -> Result<(), Error<UART::Error>> {
        write_all(&mut self.uart, bytes).await.map_err(Error::IoError)?;
        self.await_response(cmd).await
    }

    /// Wait for the 6-byte ACK and the response frame to `cmd`, after the request frame has
    /// already been written.
    async fn await_response(&mut self, cmd: u8) -> Result<(), Error<UART::Error>> {
        let mut ack = [0u8; 6];
        fill(&mut self.uart, &mut ack, 0, 6)
            .await
            .map_err(Error::IoError)?;
        if ack != frame::ACK {
            return Err(Error::DataLoss);
        }

        self.rx.fill(0);
        let mut filled = fill(&mut self.uart, &mut self.rx, 0, 5)
            .await
            .map_err(Error::IoError)?;
        let frame_len = self.rx[3] as usize;
        let total = (5 + frame_len + 2).min(N);
        filled = fill(&mut self.uart, &mut self.rx, filled, total)
            .await
            .map_err(Error::IoError)?;

        let payload = frame::parse::<UART::Error>(&self.rx[..filled], cmd)?;
        self.payload_len = payload.len();
        self.payload[..payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Abort whatever the device is doing and drain the line. Best-effort: I/O errors here are
    /// swallowed since the caller is already unwinding from a failure.
    pub async fn recover(&mut self) {
        let _ = write_all(&mut self.uart, &frame::ACK).await;
        Timer::after(RECOVER_DRAIN_DELAY).await;
        self.drain().await;
    }

    /// Discard any bytes currently sitting on the line, without sending anything.
    pub async fn drain(&mut self) {
        let uart = &mut self.uart;
        let _ = with_timeout(RECOVER_DRAIN_DELAY, async {
            let mut sink = [0u8; 64];
            loop {
                match uart.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
    }
}

/// Write the whole buffer, looping over short writes.
async fn write_all<W: Write>(uart: &mut W, mut buf: &[u8]) -> Result<(), W::Error> {
    while !buf.is_empty() {
        let n = uart.write(buf).await?;
        buf = &buf[n..];
    }
    Ok(())
}

/// Fill `buf[..target]`, given `filled` bytes already present, polling with a short sleep on
/// empty reads (the UART may report `Ok(0)` rather than blocking).
async fn fill<R: Read>(
    uart: &mut R,
    buf: &mut [u8],
    mut filled: usize,
    target: usize,
) -> Result<usize, R::Error> {
    while filled < target {
        let n = uart.read(&mut buf[filled..target]).await?;
        if n == 0 {
            Timer::after(POLL_INTERVAL).await;
            continue;
        }
        filled += n;
    }
    Ok(filled)
}
