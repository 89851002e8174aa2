//! The single-threaded event loop.
//!
//! One `poll` multiplexes the TUN descriptor and a self-pipe that signal
//! handlers write into, so the translate path never runs in async-signal
//! context. The loop wakes at least once per pool-scan interval to drive
//! maintenance even when the link is quiet.

use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use family_tun::Tun;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::xlat::{Outcome, Translator};

/// Seconds between dynamic-pool scans.
pub const POOL_CHECK_INTERVAL: u64 = 3600;
/// Seconds between address-cache sweeps.
pub const CACHE_CHECK_INTERVAL: u64 = 5;

/// Datagrams drained per wakeup, so maintenance latency stays bounded
/// under sustained load.
const DRAIN_BATCH: usize = 256;

/// Consecutive failed TUN reads before the loop gives up on the device.
const TUN_ERROR_LIMIT: u32 = 8;

static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signum: libc::c_int) {
    let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let buf = signum.to_ne_bytes();
        unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TUN device error: {0}")]
    Tun(#[from] family_tun::Error),
    #[error("{0}")]
    Sys(#[from] nix::Error),
}

pub struct EventLoop {
    tun: Tun,
    translator: Translator,
    /// Path of the binding table, when persistence is configured
    dynamic_map: Option<PathBuf>,
    recv_buf: Vec<u8>,
    signal_rx: RawFd,
    last_cache_maint: u64,
    last_pool_maint: u64,
    read_errors: u32,
}

impl EventLoop {
    pub fn new(
        tun: Tun,
        translator: Translator,
        dynamic_map: Option<PathBuf>,
        mtu: u32,
    ) -> Result<Self, RunError> {
        tun.set_nonblocking()?;

        let (signal_rx, signal_wr) = nix::unistd::pipe()?;
        set_nonblock(signal_rx)?;
        set_nonblock(signal_wr)?;
        SIGNAL_PIPE_WR.store(signal_wr, Ordering::Relaxed);
        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGHUP] {
            unsafe { sigaction(signal, &action) }?;
        }

        Ok(Self {
            tun,
            translator,
            dynamic_map,
            // Room for the family prefix on top of the biggest datagram
            recv_buf: vec![0u8; mtu.max(1500) as usize + 4],
            signal_rx,
            last_cache_maint: 0,
            last_pool_maint: 0,
            read_errors: 0,
        })
    }

    /// Run until a termination signal arrives. A clean exit flushes the
    /// binding table.
    pub fn run(&mut self) -> Result<(), RunError> {
        let now = epoch_now();
        self.last_cache_maint = now;
        self.last_pool_maint = now;

        loop {
            let mut fds = [
                PollFd::new(self.signal_rx, PollFlags::POLLIN),
                PollFd::new(self.tun.as_raw_fd(), PollFlags::POLLIN),
            ];
            #[allow(clippy::cast_possible_truncation)]
            match poll(&mut fds, (POOL_CHECK_INTERVAL * 1000) as libc::c_int) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
            let signal_ready = ready(&fds[0]);
            let tun_ready = ready(&fds[1]);

            let now = epoch_now();
            if signal_ready {
                if let Some(signal) = self.drain_signals() {
                    self.save_pool(true);
                    let stats = self.translator.stats();
                    log::info!(
                        "Exiting on signal {signal} ({} + {} translated, {} replies, {} dropped)",
                        stats.translated_4to6,
                        stats.translated_6to4,
                        stats.icmp_replies,
                        stats.dropped
                    );
                    return Ok(());
                }
            }
            if tun_ready {
                self.drain_tun(now)?;
            }
            self.maintenance(now);
        }
    }

    /// Drain all queued datagrams, up to the per-wakeup bound.
    fn drain_tun(&mut self, now: u64) -> Result<(), RunError> {
        for _ in 0..DRAIN_BATCH {
            let (family, packet) = match self.tun.recv(&mut self.recv_buf) {
                Ok(Some(datagram)) => datagram,
                Ok(None) => break,
                Err(family_tun::Error::Io(err)) => {
                    self.read_errors += 1;
                    if self.read_errors >= TUN_ERROR_LIMIT {
                        log::error!("TUN device keeps failing: {err}");
                        return Err(err.into());
                    }
                    log::warn!("Error reading from TUN device: {err}");
                    continue;
                }
                Err(err) => {
                    log::warn!("{err}");
                    continue;
                }
            };
            self.read_errors = 0;

            match self.translator.handle(family, packet, now) {
                Outcome::Forward(family, datagrams) => {
                    for datagram in &datagrams {
                        self.send(family, datagram);
                    }
                }
                Outcome::Reply(family, datagram) => self.send(family, &datagram),
                Outcome::Drop(_) => {}
            }
        }
        Ok(())
    }

    fn send(&self, family: family_tun::Family, datagram: &[u8]) {
        if let Err(err) = self.tun.send(family, datagram) {
            log::debug!("Dropping egress {family} datagram: {err}");
        }
    }

    /// Empty the signal pipe; returns the last signal seen, if any.
    fn drain_signals(&mut self) -> Option<i32> {
        let mut latest = None;
        let mut buf = [0u8; 4];
        while let Ok(len) = nix::unistd::read(self.signal_rx, &mut buf) {
            if len == 0 {
                break;
            }
            if len == buf.len() {
                latest = Some(i32::from_ne_bytes(buf));
            }
        }
        latest
    }

    fn maintenance(&mut self, now: u64) {
        // `last > now` guards against the wall clock stepping backwards
        if self.last_cache_maint + CACHE_CHECK_INTERVAL < now || self.last_cache_maint > now {
            self.translator.map_mut().maintain_cache(now);
            self.last_cache_maint = now;
        }
        if self.last_pool_maint + POOL_CHECK_INTERVAL < now || self.last_pool_maint > now {
            let reaped = self.translator.map_mut().scan_pool(now);
            if reaped > 0 {
                log::debug!("Reclaimed {reaped} idle dynamic bindings");
            }
            self.save_pool(false);
            self.last_pool_maint = now;
        }
    }

    fn save_pool(&mut self, forced: bool) {
        let Some(path) = self.dynamic_map.clone() else {
            return;
        };
        match self.translator.map_mut().save_pool(&path, forced) {
            Ok(true) => log::info!("Saved dynamic bindings to {}", path.display()),
            Ok(false) => {}
            Err(err) => log::warn!(
                "Unable to save dynamic bindings to {}: {err} (will retry)",
                path.display()
            ),
        }
    }
}

fn ready(fd: &PollFd) -> bool {
    fd.revents().is_some_and(|revents| !revents.is_empty())
}

fn set_nonblock(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Wall-clock seconds, cached once per wakeup by the loop.
pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
