//! Direct-mapped, write-back cache fed through per-port request queues.
//!
//! Producers hold a [`Requester`] and push store requests to one of
//! `n_ports` bounded queues. The engine ([`WriteBackCache::run`]) visits
//! the ports in strict round-robin order, installs the addressed line on a
//! miss (spilling its dirty occupant first), stores the value and marks the
//! line dirty.
//!
//! The sentinel closes the port it arrives on, and the rotation skips
//! closed ports from then on. [`Requester::close_port`] queues it behind the
//! port's pending stores. [`Requester::request_shutdown`] puts it on every
//! port that has room and wakes the engine. Once every port is closed or the
//! engine is woken, it drains whatever is still queued (same rotation,
//! sentinels discarded), writes every dirty line back to main memory and
//! stops.
//!
//! Queue policy: [`Requester::submit`] blocks while the port's queue is full
//! (back-pressure); [`Requester::try_submit`] reports
//! [`RequestError::QueueOverflow`] instead. [`Requester::set`] picks the
//! port itself, rotating over all ports on every call.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use crossbeam_channel::{
    bounded, unbounded, Receiver, Select, Sender, TryRecvError, TrySendError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    address::{AddressLayout, DecodedAddr},
    config::{ConfigurationError, WriteBackConfig},
    memory::{self, MemoryAccessError},
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

/// a request sitting in a port queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<T> {
    Store { addr: u64, value: T },
    /// end of requests on this port
    Sentinel,
}

impl<T> Request<T> {
    /// negative addresses are the sentinel.
    pub fn from_raw(addr: i64, value: T) -> Self {
        if addr < 0 {
            Request::Sentinel
        } else {
            Request::Store {
                addr: addr as u64,
                value,
            }
        }
    }
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Request::Sentinel)
    }
}

/// what the engine does when the scheduled port has nothing queued.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulePolicy {
    /// wait on the scheduled port
    #[default]
    Blocking,
    /// yield the turn to the next port; sleep only once every port is empty
    Skip,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LineState {
    pub valid: bool,
    pub dirty: bool,
    pub tag: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    #[default]
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::ShuttingDown => write!(f, "shutting down"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("queue of port {port} is full")]
    QueueOverflow { port: usize },
    #[error("port {port} does not exist (engine has {n_ports} ports)")]
    InvalidPort { port: usize, n_ports: usize },
    #[error("port {port} is closed")]
    PortClosed { port: usize },
    #[error("address {addr} is not representable in {addr_size} bits")]
    AddressOutOfRange { addr: i64, addr_size: u32 },
    #[error(transparent)]
    Memory(#[from] MemoryAccessError),
    #[error("shutdown already requested")]
    ShutDown,
    #[error("engine is gone")]
    Disconnected,
}

/// producer side of the port queues. cheap to clone and `Send`, so each
/// producer thread can own one.
pub struct Requester<T> {
    ports: Vec<Sender<Request<T>>>,
    wake: Sender<()>,
    layout: AddressLayout,
    mem_len: usize,
    closed: Arc<[AtomicBool]>,
    shutdown: Arc<AtomicBool>,
    /// stores past their first check whose send has not returned yet
    in_flight: Arc<AtomicUsize>,
    next_port: Arc<AtomicUsize>,
}

/// counts one store as in flight for as long as it lives.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> Clone for Requester<T> {
    fn clone(&self) -> Self {
        Self {
            ports: self.ports.clone(),
            wake: self.wake.clone(),
            layout: self.layout,
            mem_len: self.mem_len,
            closed: Arc::clone(&self.closed),
            shutdown: Arc::clone(&self.shutdown),
            in_flight: Arc::clone(&self.in_flight),
            next_port: Arc::clone(&self.next_port),
        }
    }
}

impl<T> Requester<T> {
    pub fn n_ports(&self) -> usize {
        self.ports.len()
    }

    /// enqueues a store on `port`, waiting while its queue is full.
    pub fn submit(&self, port: usize, addr: i64, value: T) -> Result<(), RequestError> {
        self.check_open(port)?;
        let _in_flight = InFlight::enter(&self.in_flight);
        let request = self.check(port, addr, value)?;
        self.ports[port]
            .send(request)
            .map_err(|_| RequestError::Disconnected)
    }

    /// [`Self::submit`] on the next port in round-robin order, shared by
    /// every clone of this requester. returns the port used.
    pub fn set(&self, addr: i64, value: T) -> Result<usize, RequestError> {
        let n_ports = self.n_ports();
        let port = self
            .next_port
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| Some((p + 1) % n_ports))
            .unwrap_or_default();
        self.submit(port, addr, value).map(|()| port)
    }

    /// like [`Self::submit`] but fails with [`RequestError::QueueOverflow`]
    /// instead of waiting.
    pub fn try_submit(&self, port: usize, addr: i64, value: T) -> Result<(), RequestError> {
        self.check_open(port)?;
        let _in_flight = InFlight::enter(&self.in_flight);
        let request = self.check(port, addr, value)?;
        self.ports[port].try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => RequestError::QueueOverflow { port },
            TrySendError::Disconnected(_) => RequestError::Disconnected,
        })
    }

    /// queues the sentinel on `port` behind its pending stores, waiting while
    /// the queue is full. later stores on `port` are refused.
    pub fn close_port(&self, port: usize) -> Result<(), RequestError> {
        self.check_port(port)?;
        if self.closed[port].swap(true, Ordering::SeqCst) {
            return Err(RequestError::PortClosed { port });
        }
        log::debug!("closing port {port}");
        self.ports[port]
            .send(Request::Sentinel)
            .map_err(|_| RequestError::Disconnected)
    }

    /// puts the sentinel on every port, so the engine sees it whichever port
    /// it visits next, and wakes the engine. never blocks: a full port gets
    /// no sentinel, its requests are drained anyway. only the first call has
    /// any effect.
    pub fn request_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("shutdown requested on {} ports", self.ports.len());
        for (port, tx) in self.ports.iter().enumerate() {
            match tx.try_send(Request::Sentinel) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => log::debug!("port {port}: full, no sentinel"),
                Err(TrySendError::Disconnected(_)) => {
                    log::warn!("port {port}: engine gone before shutdown")
                }
            }
        }
        if self.wake.send(()).is_err() {
            log::warn!("engine gone before shutdown");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn check_port(&self, port: usize) -> Result<(), RequestError> {
        if port >= self.ports.len() {
            return Err(RequestError::InvalidPort {
                port,
                n_ports: self.ports.len(),
            });
        }
        if self.is_shutdown_requested() {
            return Err(RequestError::ShutDown);
        }
        Ok(())
    }

    fn check_open(&self, port: usize) -> Result<(), RequestError> {
        self.check_port(port)?;
        if self.closed[port].load(Ordering::SeqCst) {
            return Err(RequestError::PortClosed { port });
        }
        Ok(())
    }

    /// must run after the store is counted in flight.
    fn check(&self, port: usize, addr: i64, value: T) -> Result<Request<T>, RequestError> {
        self.check_open(port)?;
        let out_of_range = RequestError::AddressOutOfRange {
            addr,
            addr_size: self.layout.addr_size(),
        };
        match Request::from_raw(addr, value) {
            Request::Store { addr, value } if addr <= self.layout.max_addr() => {
                let decoded = self.layout.decompose(addr);
                memory::line_span(
                    decoded.main_base,
                    self.layout.entries_per_line(),
                    self.mem_len,
                )?;
                Ok(Request::Store { addr, value })
            }
            _ => Err(out_of_range),
        }
    }
}

/// what the engine pulled from its inputs.
enum Pulled<T> {
    Request(Request<T>),
    Wake,
}

pub struct WriteBackCache<'m, T> {
    config: WriteBackConfig,
    layout: AddressLayout,
    main_mem: &'m mut [T],
    lines: Vec<LineState>,
    storage: Vec<T>,
    ports: Vec<Receiver<Request<T>>>,
    closed: Vec<bool>,
    wake: Receiver<()>,
    requester: Requester<T>,
    curr_port: usize,
    state: EngineState,
    #[cfg(feature = "stat")]
    stat: stat::WriteBackStat,
}

impl<'m, T: Copy + Default + Send> WriteBackCache<'m, T> {
    /// binds the engine to `main_mem`, which it borrows until dropped.
    pub fn new(config: WriteBackConfig, main_mem: &'m mut [T]) -> Result<Self, ConfigurationError> {
        let layout = config.validate()?;
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..config.n_ports)
            .map(|_| bounded(config.queue_capacity()))
            .unzip();
        let (wake_tx, wake_rx) = unbounded();
        let requester = Requester {
            ports: senders,
            wake: wake_tx,
            layout,
            mem_len: main_mem.len(),
            closed: (0..config.n_ports).map(|_| AtomicBool::new(false)).collect(),
            shutdown: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            next_port: Arc::new(AtomicUsize::new(0)),
        };
        log::debug!(
            "write-back cache: {} lines x {} words, tag {} bits, {} ports",
            layout.n_lines(),
            layout.entries_per_line(),
            layout.tag_size(),
            config.n_ports
        );
        Ok(Self {
            config,
            layout,
            main_mem,
            lines: vec![LineState::default(); layout.n_lines()],
            storage: vec![T::default(); layout.n_lines() * layout.entries_per_line()],
            ports: receivers,
            closed: vec![false; config.n_ports],
            wake: wake_rx,
            requester,
            curr_port: 0,
            state: EngineState::Idle,
            #[cfg(feature = "stat")]
            stat: stat::WriteBackStat::new(config.n_ports),
        })
    }

    /// services requests until every port is closed or shutdown is
    /// requested, then drains the queues and flushes.
    ///
    /// an engine runs once: shutdown and closed ports are final for its
    /// requesters. calling `run` on a stopped engine does nothing.
    pub fn run(&mut self) {
        if self.state == EngineState::Stopped {
            log::warn!("engine already stopped; run ignored");
            return;
        }
        self.state = EngineState::Running;
        log::info!(
            "engine started ({} ports, {:?} scheduling)",
            self.ports.len(),
            self.config.schedule
        );

        while self.state == EngineState::Running {
            match self.pull() {
                Pulled::Request(Request::Store { addr, value }) => {
                    self.service(addr, value);
                    self.rotate();
                }
                Pulled::Request(Request::Sentinel) => {
                    log::debug!("sentinel on port {}", self.curr_port);
                    self.closed[self.curr_port] = true;
                    if self.closed.iter().all(|&c| c) {
                        self.state = EngineState::ShuttingDown;
                    } else {
                        self.rotate();
                    }
                }
                Pulled::Wake => {
                    log::debug!("woken for shutdown");
                    self.state = EngineState::ShuttingDown;
                }
            }
        }

        self.drain();
        let spilled = self.flush();
        self.state = EngineState::Stopped;
        log::info!("engine stopped; flushed {spilled} dirty lines");
    }

    pub fn requester(&self) -> Requester<T> {
        self.requester.clone()
    }

    pub fn config(&self) -> &WriteBackConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn line_state(&self, line: usize) -> Option<LineState> {
        self.lines.get(line).copied()
    }

    /// cached value at `addr`, if its line is resident.
    pub fn peek(&self, addr: u64) -> Option<T> {
        let decoded = self.layout.decompose(addr);
        self.hit(&decoded)
            .then(|| self.storage[decoded.cache_index])
    }

    /// `dirty ⟹ valid` for every line.
    pub fn is_consistent(&self) -> bool {
        self.lines.iter().all(|l| !l.dirty || l.valid)
    }

    #[cfg(feature = "stat")]
    pub fn stat(&self) -> &stat::WriteBackStat {
        &self.stat
    }

    /// moves to the next port. while running, closed ports are passed over.
    fn rotate(&mut self) {
        let n_ports = self.ports.len();
        for _ in 0..n_ports {
            self.curr_port = (self.curr_port + 1) % n_ports;
            if self.state != EngineState::Running || !self.closed[self.curr_port] {
                break;
            }
        }
        log::trace!("scheduled port {}", self.curr_port);
    }

    /// the sender halves live in `self.requester`, so disconnection cannot
    /// happen while the engine exists; it is treated as the sentinel.
    fn pull(&mut self) -> Pulled<T> {
        match self.config.schedule {
            SchedulePolicy::Blocking => {
                let port = &self.ports[self.curr_port];
                let mut sel = Select::new();
                let port_index = sel.recv(port);
                sel.recv(&self.wake);
                let op = sel.select();
                if op.index() == port_index {
                    Pulled::Request(op.recv(port).unwrap_or(Request::Sentinel))
                } else {
                    let _ = op.recv(&self.wake);
                    Pulled::Wake
                }
            }
            SchedulePolicy::Skip => loop {
                for _ in 0..self.ports.len() {
                    match self.ports[self.curr_port].try_recv() {
                        Ok(request) => return Pulled::Request(request),
                        Err(TryRecvError::Disconnected) => {
                            return Pulled::Request(Request::Sentinel)
                        }
                        Err(TryRecvError::Empty) => self.rotate(),
                    }
                }
                let mut sel = Select::new();
                for (rx, _) in self.ports.iter().zip(&self.closed).filter(|(_, closed)| !**closed) {
                    sel.recv(rx);
                }
                let wake_index = sel.recv(&self.wake);
                if sel.ready() == wake_index && self.wake.try_recv().is_ok() {
                    return Pulled::Wake;
                }
            },
        }
    }

    /// services what is left in the queues, in rotation, until a full
    /// rotation finds every port empty with no store in flight. stale
    /// sentinels are discarded.
    ///
    /// new stores are refused by now, so a store still in flight passed its
    /// check earlier and is waiting in, or about to enter, its `send`. the
    /// count is read before the rotation: zero means every such send landed
    /// before the rotation looked at its port.
    fn drain(&mut self) {
        loop {
            let in_flight = self.requester.in_flight();
            let mut idle = true;
            for _ in 0..self.ports.len() {
                match self.ports[self.curr_port].try_recv() {
                    Ok(Request::Store { addr, value }) => {
                        self.service(addr, value);
                        idle = false;
                    }
                    Ok(Request::Sentinel) => idle = false,
                    Err(_) => {}
                }
                self.rotate();
            }
            if idle {
                if in_flight == 0 {
                    break;
                }
                thread::yield_now();
            }
        }
    }

    fn service(&mut self, addr: u64, value: T) {
        self.store(addr, value);
        #[cfg(feature = "stat")]
        self.stat.serviced(self.curr_port);
    }

    fn hit(&self, addr: &DecodedAddr) -> bool {
        let line = &self.lines[addr.line];
        line.valid && line.tag == addr.tag
    }

    fn store(&mut self, addr: u64, value: T) {
        let decoded = self.layout.decompose(addr);
        if self.hit(&decoded) {
            log::debug!("hit {decoded}");
            #[cfg(feature = "stat")]
            self.stat.hit();
        } else {
            log::debug!("miss {decoded}");
            #[cfg(feature = "stat")]
            self.stat.miss();
            if let Err(e) = self.fill(&decoded) {
                log::error!("dropping store to {decoded}: {e}");
                #[cfg(feature = "stat")]
                self.stat.dropped();
                return;
            }
        }
        self.storage[decoded.cache_index] = value;
        self.lines[decoded.line].dirty = true;
    }

    /// loads the line of `addr` from main memory, spilling its current
    /// occupant first if dirty.
    fn fill(&mut self, addr: &DecodedAddr) -> memory::Result<()> {
        let state = self.lines[addr.line];
        if state.valid && state.dirty {
            self.spill(addr.line)?;
            #[cfg(feature = "stat")]
            self.stat.eviction_spill();
        }

        let first = self.layout.first_of_line(addr.line);
        let span = first..first + self.layout.entries_per_line();
        memory::read_line_into(&*self.main_mem, addr.main_base, &mut self.storage[span])?;
        #[cfg(feature = "stat")]
        self.stat.fill();

        self.lines[addr.line] = LineState {
            valid: true,
            dirty: false,
            tag: addr.tag,
        };
        Ok(())
    }

    /// writes resident `line` back to the main memory it was filled from.
    fn spill(&mut self, line: usize) -> memory::Result<()> {
        let base = self.layout.compose(self.lines[line].tag, line, 0);
        let first = self.layout.first_of_line(line);
        let span = first..first + self.layout.entries_per_line();
        log::debug!("spill line {line} to {base:#010x}");
        memory::write_line_from(&mut *self.main_mem, base, &self.storage[span])?;
        self.lines[line].dirty = false;
        Ok(())
    }

    /// spills every valid dirty line. returns how many were written back.
    fn flush(&mut self) -> usize {
        let mut spilled = 0;
        for line in 0..self.lines.len() {
            let state = self.lines[line];
            if !(state.valid && state.dirty) {
                continue;
            }
            match self.spill(line) {
                Ok(()) => {
                    spilled += 1;
                    #[cfg(feature = "stat")]
                    self.stat.flush_spill();
                }
                Err(e) => log::error!("line {line} lost on flush: {e}"),
            }
        }
        spilled
    }
}

#[cfg(feature = "stat")]
impl<T> AddStats for WriteBackCache<'_, T> {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat.clone()));
    }
}

#[cfg(feature = "stat")]
pub mod stat {
    use std::fmt;

    use crate::stat::*;

    #[derive(Clone, Default, Debug)]
    pub struct WriteBackStat {
        pub serviced: Vec<usize>,
        pub hits: usize,
        pub misses: usize,
        pub fills: usize,
        pub eviction_spills: usize,
        pub flush_spills: usize,
        pub dropped: usize,
    }

    impl WriteBackStat {
        pub fn new(n_ports: usize) -> Self {
            Self {
                serviced: vec![0; n_ports],
                ..Default::default()
            }
        }
        pub fn serviced(&mut self, port: usize) {
            self.serviced[port] += 1;
        }
        pub fn hit(&mut self) {
            self.hits += 1;
        }
        pub fn miss(&mut self) {
            self.misses += 1;
        }
        pub fn fill(&mut self) {
            self.fills += 1;
        }
        pub fn eviction_spill(&mut self) {
            self.eviction_spills += 1;
        }
        pub fn flush_spill(&mut self) {
            self.flush_spills += 1;
        }
        pub fn dropped(&mut self) {
            self.dropped += 1;
        }
    }

    impl Stat for WriteBackStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ WriteBackStat {
        fn header(&self) -> &'static str {
            "write-back cache"
        }
        fn width(&self) -> usize {
            32
        }
    }

    impl fmt::Display for &'_ WriteBackStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for (port, n) in self.serviced.iter().enumerate() {
                writeln!(f, "  port {port:>3}: {n:>17}")?;
            }
            writeln!(f, "  hits: {:>22}", self.hits)?;
            writeln!(f, "  misses: {:>20}", self.misses)?;
            let rate = format!("{:.2} %", hit_rate(self.hits, self.misses));
            writeln!(f, "  hit rate: {rate:>18}")?;
            writeln!(f, "  fills: {:>21}", self.fills)?;
            writeln!(f, "  eviction spills: {:>11}", self.eviction_spills)?;
            write!(f, "  flush spills: {:>14}", self.flush_spills)?;
            if self.dropped != 0 {
                write!(f, "\n  dropped: {:>19}", self.dropped)?;
            }
            Ok(())
        }
    }
}
