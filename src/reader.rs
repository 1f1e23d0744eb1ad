//! Reader Loop: the tag lifecycle state machine and the host-facing handle/runner split.
//!
//! Following the same shape embassy-net itself uses for `Stack`/`Runner` (and the way this
//! driver's own teacher spawns its network runner in `wifi.rs`), [`new`] splits a
//! [`Controller`] into a cheap, cloneable [`Reader`] handle that applications hold on to, and a
//! [`Runner`] whose `run` future the application spawns as its own task (`#[embassy_executor::task]`
//! doesn't support generic functions, so the concrete spawn point has to live in the consumer's
//! crate, not here).

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::CriticalSectionMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use embedded_hal::digital::OutputPin;
use embedded_io_async::{Read, Write};
use log::warn;

use crate::config::ReaderConfig;
use crate::controller::Controller;
use crate::error::Error;
use crate::frame::MAX_PARAMS_LEN;
use crate::tag::TagInfo;

/// Longest APDU command or response this driver relays through [`Reader::request_transceive`].
/// `InDataExchange` reserves one params byte for the target number, so this is one less than a
/// frame's maximum params length.
pub const MAX_TRANSCEIVE_LEN: usize = MAX_PARAMS_LEN - 1;

/// Cooperative yield between idle iterations of the presence-polling loop.
const IDLE_TICK: Duration = Duration::from_millis(10);

/// Tag lifecycle event delivered to [`Reader::subscribe_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A tag was detected and is now selected.
    TagArrived(TagInfo),
    /// The previously selected tag stopped answering and was released.
    TagDeparted(TagInfo),
}

struct PendingRequest {
    command: [u8; MAX_TRANSCEIVE_LEN],
    command_len: usize,
    timeout: Duration,
}

impl PendingRequest {
    fn command(&self) -> &[u8] {
        &self.command[..self.command_len]
    }
}

struct PendingResponse<E> {
    data: [u8; MAX_TRANSCEIVE_LEN],
    len: usize,
    result: Result<(), Error<E>>,
}

/// State shared between a [`Reader`] handle and its [`Runner`]. Applications never construct
/// this directly other than to place one in a `static` (see [`new`]).
pub struct Shared<E> {
    current_tag: CriticalSectionMutex<RefCell<Option<TagInfo>>>,
    config: CriticalSectionMutex<RefCell<ReaderConfig>>,
    started: Signal<CriticalSectionRawMutex, Result<(), Error<E>>>,
    event: Signal<CriticalSectionRawMutex, Event>,
    request: Signal<CriticalSectionRawMutex, PendingRequest>,
    response: Signal<CriticalSectionRawMutex, PendingResponse<E>>,
    busy: AtomicBool,
}

impl<E> Shared<E> {
    /// Build an unstarted, empty shared state. Intended to be placed in a `static`:
    ///
    /// ```ignore
    /// static SHARED: pn532_hsu_reader::reader::Shared<MyUartError> =
    ///     pn532_hsu_reader::reader::Shared::new();
    /// ```
    pub const fn new() -> Self {
        Self {
            current_tag: CriticalSectionMutex::new(RefCell::new(None)),
            config: CriticalSectionMutex::new(RefCell::new(ReaderConfig::const_default())),
            started: Signal::new(),
            event: Signal::new(),
            request: Signal::new(),
            response: Signal::new(),
            busy: AtomicBool::new(false),
        }
    }

    fn set_current_tag(&self, tag: Option<TagInfo>) {
        self.current_tag.lock(|cell| *cell.borrow_mut() = tag);
    }

    fn set_config(&self, config: ReaderConfig) {
        self.config.lock(|cell| *cell.borrow_mut() = config);
    }

    fn default_transceive_timeout(&self) -> Duration {
        self.config.lock(|cell| cell.borrow().default_transceive_timeout)
    }
}

impl<E> Default for Shared<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a controller into a host-facing [`Reader`] handle and the [`Runner`] that drives it.
///
/// `shared` must outlive both halves; in practice that means a `'static` reference to a `static
/// Shared<E>` (see [`Shared::new`]).
pub fn new<'a, UART, RESET, E, const N: usize>(
    shared: &'a Shared<E>,
    controller: Controller<UART, RESET, N>,
    config: ReaderConfig,
) -> (Reader<'a, E>, Runner<'a, UART, RESET, E, N>)
where
    UART: Read<Error = E> + Write<Error = E>,
    RESET: OutputPin,
{
    shared.set_config(config);
    (
        Reader { shared },
        Runner {
            shared,
            controller,
            config,
        },
    )
}

/// Cheap, `Copy`-able handle to a running reader. Applications pass this around freely; all
/// methods take `&self`.
#[derive(Clone, Copy)]
pub struct Reader<'a, E> {
    shared: &'a Shared<E>,
}

impl<E> Reader<'_, E> {
    /// Whether a tag is currently selected.
    pub fn has_tag(&self) -> bool {
        self.shared.current_tag.lock(|cell| cell.borrow().is_some())
    }

    /// The currently selected tag, if any.
    pub fn current_tag(&self) -> Option<TagInfo> {
        self.shared.current_tag.lock(|cell| *cell.borrow())
    }

    /// Wait for initialization to finish, resolving once with `Ok(())` on a successful boot
    /// sequence or `Err(Error::Unavailable)` once the retry budget is exhausted. This is the
    /// observable half of `start()`'s init-future: spawn [`Runner::run`], then await this to learn
    /// whether the reader actually came up, the way `embassy_net::Stack::wait_config_up()` lets a
    /// caller await its runner reaching a ready state. Single-shot like [`subscribe_once`](Self::subscribe_once);
    /// call it once, from the task that started the runner.
    pub async fn wait_started(&self) -> Result<(), Error<E>> {
        self.shared.started.wait().await
    }

    /// Wait for the next tag arrival or departure. Single-shot: if no subscriber is waiting when
    /// an event occurs, that event is dropped (callers who need the current state should pair
    /// this with [`has_tag`](Self::has_tag) / [`current_tag`](Self::current_tag)).
    pub async fn subscribe_once(&self) -> Event {
        self.shared.event.wait().await
    }

    /// Exchange an APDU with the currently selected tag. Fails with [`Error::Busy`] if another
    /// request is already outstanding, without touching the UART. `timeout` of `None` falls back
    /// to the reader's configured `default_transceive_timeout`.
    pub async fn request_transceive(
        &self,
        command: &[u8],
        response: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, Error<E>> {
        if command.len() > MAX_TRANSCEIVE_LEN {
            return Err(Error::TooLarge);
        }
        if self.shared.busy.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }

        let timeout = timeout.unwrap_or_else(|| self.shared.default_transceive_timeout());
        let mut buf = [0u8; MAX_TRANSCEIVE_LEN];
        buf[..command.len()].copy_from_slice(command);
        self.shared.request.signal(PendingRequest {
            command: buf,
            command_len: command.len(),
            timeout,
        });

        let resp = self.shared.response.wait().await;
        self.shared.busy.store(false, Ordering::Release);

        resp.result?;
        if resp.len > response.len() {
            return Err(Error::BufferTooSmall);
        }
        response[..resp.len].copy_from_slice(&resp.data[..resp.len]);
        Ok(resp.len)
    }
}

/// Owns the [`Controller`] and drives the detect/present/release state machine. Spawn
/// [`Runner::run`] as a task in the consuming application; it runs for the process lifetime.
pub struct Runner<'a, UART, RESET, E, const N: usize> {
    shared: &'a Shared<E>,
    controller: Controller<UART, RESET, N>,
    config: ReaderConfig,
}

enum State {
    Detecting,
    TagPresent {
        tag: TagInfo,
        next_check: Instant,
    },
}

impl<'a, UART, RESET, E, const N: usize> Runner<'a, UART, RESET, E, N>
where
    UART: Read<Error = E> + Write<Error = E>,
    RESET: OutputPin,
{
    /// Initialize the PN532 and run the detect/present/release loop forever. Returns only if
    /// initialization exhausts its retries. Signals [`Reader::wait_started`] with the outcome of
    /// initialization exactly once, before entering the detect/present/release loop.
    pub async fn run(mut self) -> Error<E> {
        if let Err(err) = self.controller.init().await {
            self.shared.started.signal(Err(Error::Unavailable));
            return err;
        }
        self.shared.started.signal(Ok(()));

        let mut state = State::Detecting;
        loop {
            state = match state {
                State::Detecting => self.run_detecting().await,
                State::TagPresent { tag, next_check } => self.run_present(tag, next_check).await,
            };
        }
    }

    async fn run_detecting(&mut self) -> State {
        match self.controller.detect_tag(self.config.detection_timeout).await {
            Ok(tag) => {
                self.shared.set_current_tag(Some(tag));
                self.shared.event.signal(Event::TagArrived(tag));
                State::TagPresent {
                    tag,
                    next_check: Instant::now() + self.config.presence_check_interval,
                }
            }
            Err(Error::NotFound) => State::Detecting,
            Err(err) => {
                warn!("Reader: detect error: {err}");
                State::Detecting
            }
        }
    }

    async fn run_present(&mut self, tag: TagInfo, mut next_check: Instant) -> State {
        loop {
            if let Some(req) = self.shared.request.try_take() {
                let mut buf = [0u8; MAX_TRANSCEIVE_LEN];
                let result = self
                    .controller
                    .transceive(req.command(), &mut buf, req.timeout)
                    .await;
                let (len, result) = match result {
                    Ok(len) => (len, Ok(())),
                    Err(err) => (0, Err(err)),
                };
                self.shared.response.signal(PendingResponse {
                    data: buf,
                    len,
                    result,
                });
                next_check = Instant::now() + self.config.presence_check_interval;
                continue;
            }

            if Instant::now() >= next_check {
                let present = self
                    .controller
                    .check_present(self.config.presence_check_timeout)
                    .await;
                match present {
                    Ok(true) => {
                        next_check = Instant::now() + self.config.presence_check_interval;
                    }
                    Ok(false) | Err(_) => {
                        self.controller.recover().await;
                        let _ = self
                            .controller
                            .release_tag(tag.target_number(), self.config.presence_check_timeout)
                            .await;
                        self.shared.set_current_tag(None);
                        self.shared.event.signal(Event::TagDeparted(tag));
                        return State::Detecting;
                    }
                }
            }

            Timer::after(IDLE_TICK).await;
        }
    }
}
