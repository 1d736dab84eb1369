// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime context: registry of threads, pools, modules and connections.
//!
//! The context is a cheap clonable handle. Every module holds one, so the
//! registry lives until [`RuntimeContext::shutdown`] is called; dropping the
//! last user handle alone does not stop the threads.
//!
//! Lifecycle operations (`start_module`, `stop_module`, ...) are commands
//! executed on the module thread and waited for, except when called from
//! that very thread, where they are only submitted.

use super::event::{Control, Envelope, EventSink, WorkerId};
use super::thread::ThreadHandle;
use super::{CommandHandler, CommandWorker};
use crate::command::{Command, CommandHandle, CommandReply, CommandResult, Replier};
use crate::config::{PoolConfig, RuntimeConfig, MANAGER_THREAD};
use crate::error::{Error, FatalError, Result};
use crate::memory::MemoryPool;
use crate::module::{
    Body, ModuleCallbacks, ModuleCore, ModuleRunner, ModuleShared, ModuleSpec, ModuleState, PortId, SyncModule,
};
use crate::transport::{LinkEnd, LocalLink, NullTransport};
use crossbeam::channel::{self, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Registry entry of a worker.
#[derive(Clone)]
struct WorkerEntry {
    id: WorkerId,
    thread: String,
    tx: Sender<Envelope>,
    thread_id: ThreadId,
    module: Option<Arc<ModuleShared>>,
}

impl WorkerEntry {
    fn on_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

/// Established module-to-module connection, kept for reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Connection {
    a: (String, String),
    b: (String, String),
}

impl Connection {
    fn involves(&self, module: &str, port: &str) -> bool {
        (self.a.0 == module && self.a.1 == port) || (self.b.0 == module && self.b.1 == port)
    }
}

/// Snapshot of a module's registry data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub thread: String,
    pub state: ModuleState,
    pub is_sync: bool,
    /// Port names with their connection flag.
    pub ports: Vec<(String, bool)>,
}

struct ContextInner {
    config: RuntimeConfig,
    threads: Mutex<HashMap<String, ThreadHandle>>,
    pools: DashMap<String, MemoryPool>,
    workers: DashMap<String, WorkerEntry>,
    next_worker: AtomicU32,
    next_command: AtomicU64,
    connections: Mutex<Vec<Connection>>,
    fatal: Mutex<Option<FatalError>>,
    exit_requested: Mutex<bool>,
    exit_cv: Condvar,
    shutting_down: AtomicBool,
}

/// Shared handle on the runtime.
#[derive(Clone)]
pub struct RuntimeContext {
    inner: Arc<ContextInner>,
}

impl RuntimeContext {
    /// Create a context and its manager thread.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let ctx = Self {
            inner: Arc::new(ContextInner {
                config,
                threads: Mutex::new(HashMap::new()),
                pools: DashMap::new(),
                workers: DashMap::new(),
                next_worker: AtomicU32::new(1),
                next_command: AtomicU64::new(1),
                connections: Mutex::new(Vec::new()),
                fatal: Mutex::new(None),
                exit_requested: Mutex::new(false),
                exit_cv: Condvar::new(),
                shutting_down: AtomicBool::new(false),
            }),
        };
        ctx.create_thread(MANAGER_THREAD)?;
        log::info!("[RuntimeContext::new] runtime context created");
        Ok(ctx)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Spawn a named worker thread.
    pub fn create_thread(&self, name: &str) -> Result<()> {
        self.check_alive()?;
        let mut threads = self.inner.threads.lock();
        if threads.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        let handle = ThreadHandle::spawn(name)?;
        threads.insert(name.to_string(), handle);
        Ok(())
    }

    pub fn has_thread(&self, name: &str) -> bool {
        self.inner.threads.lock().contains_key(name)
    }

    /// Mailbox of a thread, spawning it on first use.
    fn thread_mailbox(&self, name: &str) -> Result<(Sender<Envelope>, ThreadId)> {
        self.check_alive()?;
        let mut threads = self.inner.threads.lock();
        if let Some(h) = threads.get(name) {
            return Ok((h.tx.clone(), h.thread_id));
        }
        let handle = ThreadHandle::spawn(name)?;
        let out = (handle.tx.clone(), handle.thread_id);
        threads.insert(name.to_string(), handle);
        Ok(out)
    }

    // ========================================================================
    // Pools
    // ========================================================================

    /// Register a pool under its own name.
    pub fn add_pool(&self, pool: MemoryPool) -> Result<()> {
        match self.inner.pools.entry(pool.name().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => Err(Error::AlreadyExists(e.key().clone())),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                log::debug!("[RuntimeContext::add_pool] pool {} registered", pool.name());
                v.insert(pool);
                Ok(())
            }
        }
    }

    /// Create and register a pool with `(block_size, count)` classes.
    pub fn create_pool(&self, name: &str, classes: &[(usize, usize)]) -> Result<MemoryPool> {
        let pool = MemoryPool::with_classes(name, classes)?;
        self.add_pool(pool.clone())?;
        Ok(pool)
    }

    /// Create and register a pool from class configurations.
    pub fn create_pool_with(&self, name: &str, classes: &[PoolConfig]) -> Result<MemoryPool> {
        let pool = MemoryPool::new(name);
        for class in classes {
            pool.allocate_class(class.block_size, class.count, class.prealloc)?;
        }
        self.add_pool(pool.clone())?;
        Ok(pool)
    }

    pub fn pool(&self, name: &str) -> Result<MemoryPool> {
        self.inner
            .pools
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    // ========================================================================
    // Workers
    // ========================================================================

    /// Create an Async module on `thread` (spawned when missing).
    pub fn create_module(&self, spec: ModuleSpec, module: impl ModuleCallbacks, thread: &str) -> Result<()> {
        self.attach_module(spec, Body::Async(Box::new(module)), thread)
    }

    /// Create a Sync module on `thread` (spawned when missing).
    pub fn create_sync_module(&self, spec: ModuleSpec, module: impl SyncModule, thread: &str) -> Result<()> {
        self.attach_module(spec, Body::Sync(Box::new(module)), thread)
    }

    fn attach_module(&self, spec: ModuleSpec, body: Body, thread: &str) -> Result<()> {
        let is_sync = matches!(body, Body::Sync(_));
        let (tx, thread_id) = self.thread_mailbox(thread)?;
        let id = WorkerId(self.inner.next_worker.fetch_add(1, Ordering::Relaxed));

        let dashmap::mapref::entry::Entry::Vacant(slot) = self.inner.workers.entry(spec.name.clone()) else {
            return Err(Error::AlreadyExists(spec.name.clone()));
        };
        let shared = Arc::new(ModuleShared::new(&spec, is_sync));
        let sink = EventSink::new(tx.clone(), id);
        let core = ModuleCore::new(Arc::clone(&shared), self.clone(), sink, &spec)?;
        let runner = ModuleRunner::new(core, body);
        tx.send(Envelope::Attach(id, Box::new(runner)))
            .map_err(|_| Error::ShutDown)?;
        slot.insert(WorkerEntry {
            id,
            thread: thread.to_string(),
            tx,
            thread_id,
            module: Some(shared),
        });
        log::info!(
            "[RuntimeContext::attach_module] {} module {} on thread {}",
            if is_sync { "sync" } else { "async" },
            spec.name,
            thread
        );
        Ok(())
    }

    /// Register a command-only worker executing `handler` on `thread`.
    pub fn register_command_handler<F>(&self, name: &str, thread: &str, handler: F) -> Result<()>
    where
        F: FnMut(&mut Command) -> CommandResult + Send + 'static,
    {
        let (tx, thread_id) = self.thread_mailbox(thread)?;
        let id = WorkerId(self.inner.next_worker.fetch_add(1, Ordering::Relaxed));
        let dashmap::mapref::entry::Entry::Vacant(slot) = self.inner.workers.entry(name.to_string()) else {
            return Err(Error::AlreadyExists(name.to_string()));
        };
        let handler: CommandHandler = Box::new(handler);
        let worker = CommandWorker::new(name.to_string(), handler);
        tx.send(Envelope::Attach(id, Box::new(worker)))
            .map_err(|_| Error::ShutDown)?;
        slot.insert(WorkerEntry {
            id,
            thread: thread.to_string(),
            tx,
            thread_id,
            module: None,
        });
        Ok(())
    }

    fn entry(&self, name: &str) -> Result<WorkerEntry> {
        self.inner
            .workers
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))
    }

    fn module_entry(&self, name: &str) -> Result<(WorkerEntry, Arc<ModuleShared>)> {
        let entry = self.entry(name)?;
        match entry.module.clone() {
            Some(shared) => Ok((entry, shared)),
            None => Err(Error::ModuleNotFound(name.to_string())),
        }
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.inner.workers.get(name).is_some_and(|e| e.module.is_some())
    }

    /// Module names, sorted.
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .workers
            .iter()
            .filter(|e| e.module.is_some())
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn module_state(&self, name: &str) -> Result<ModuleState> {
        Ok(self.module_entry(name)?.1.state())
    }

    pub fn is_module_running(&self, name: &str) -> bool {
        self.module_entry(name).is_ok_and(|(_, m)| m.is_running())
    }

    /// True while a Sync module is parked waiting for a `Restart`.
    pub fn is_waiting_restart(&self, name: &str) -> Result<bool> {
        Ok(self.module_entry(name)?.1.is_waiting_restart())
    }

    pub fn module_info(&self, name: &str) -> Result<ModuleInfo> {
        let (entry, shared) = self.module_entry(name)?;
        Ok(ModuleInfo {
            name: shared.name.clone(),
            thread: entry.thread,
            state: shared.state(),
            is_sync: shared.is_sync,
            ports: shared
                .ports
                .iter()
                .enumerate()
                .map(|(i, p)| (p.name.clone(), shared.is_port_reserved(PortId(i as u16))))
                .collect(),
        })
    }

    // ========================================================================
    // Connections
    // ========================================================================

    fn split_path(path: &str) -> Result<(&str, &str)> {
        path.split_once('/')
            .filter(|(m, p)| !m.is_empty() && !p.is_empty())
            .ok_or_else(|| Error::Config(format!("port path '{}' is not module/port", path)))
    }

    fn resolve_port(&self, module: &str, port: &str) -> Result<(WorkerEntry, Arc<ModuleShared>, PortId)> {
        let (entry, shared) = self.module_entry(module)?;
        let id = shared.port_index(port).ok_or_else(|| Error::PortNotFound {
            module: module.to_string(),
            port: port.to_string(),
        })?;
        Ok((entry, shared, id))
    }

    /// Connect two ports given as `module/port` with a local transport.
    pub fn connect(&self, a: &str, b: &str) -> Result<()> {
        let (ma, pa) = Self::split_path(a)?;
        let (mb, pb) = Self::split_path(b)?;
        self.connect_ports((ma, pa), (mb, pb))?;
        let conn = Connection {
            a: (ma.to_string(), pa.to_string()),
            b: (mb.to_string(), pb.to_string()),
        };
        let mut conns = self.inner.connections.lock();
        if !conns.contains(&conn) {
            conns.push(conn);
        }
        Ok(())
    }

    fn connect_ports(&self, a: (&str, &str), b: (&str, &str)) -> Result<()> {
        self.check_alive()?;
        let (ea, sa, pa) = self.resolve_port(a.0, a.1)?;
        let (eb, sb, pb) = self.resolve_port(b.0, b.1)?;
        if ea.id == eb.id && pa == pb {
            return Err(Error::Config(format!("port {}/{} connected to itself", a.0, a.1)));
        }

        if !sa.reserve_port(pa) {
            return Err(Error::AlreadyConnected(format!("{}/{}", a.0, a.1)));
        }
        if !sb.reserve_port(pb) {
            sa.release_port(pa);
            return Err(Error::AlreadyConnected(format!("{}/{}", b.0, b.1)));
        }

        let (ca, cb) = match (sa.port_spec(pa), sb.port_spec(pb)) {
            (Some(x), Some(y)) => (x.config.clone(), y.config.clone()),
            _ => {
                sa.release_port(pa);
                sb.release_port(pb);
                return Err(Error::PortNotFound {
                    module: a.0.to_string(),
                    port: a.1.to_string(),
                });
            }
        };

        let header_size = ca.inline_data_size.max(cb.inline_data_size);
        let (copy_a, copy_b) = match (&ca.pool, &cb.pool) {
            (Some(x), Some(y)) if x != y => (self.pool(x).ok(), self.pool(y).ok()),
            _ => (None, None),
        };
        let end_a = LinkEnd {
            sink: EventSink::new(ea.tx.clone(), ea.id),
            port: pa,
            capacity: ca.input_capacity.max(cb.output_capacity),
            copy_pool: copy_a,
            thread: ea.thread.clone(),
        };
        let end_b = LinkEnd {
            sink: EventSink::new(eb.tx.clone(), eb.id),
            port: pb,
            capacity: cb.input_capacity.max(ca.output_capacity),
            copy_pool: copy_b,
            thread: eb.thread.clone(),
        };
        let (ta, tb) = LocalLink::pair(end_a, end_b, header_size);

        let sent_a = ea
            .tx
            .send(Envelope::Control(ea.id, Control::AssignTransport(pa, Box::new(ta))))
            .is_ok();
        let sent_b = eb
            .tx
            .send(Envelope::Control(eb.id, Control::AssignTransport(pb, Box::new(tb))))
            .is_ok();
        if !(sent_a && sent_b) {
            sa.release_port(pa);
            sb.release_port(pb);
            return Err(Error::ShutDown);
        }
        log::info!(
            "[RuntimeContext::connect] {}/{} <-> {}/{}",
            a.0,
            a.1,
            b.0,
            b.1
        );
        Ok(())
    }

    /// Bind a port to a [`NullTransport`] that swallows every buffer.
    pub fn connect_null(&self, path: &str) -> Result<()> {
        let (m, p) = Self::split_path(path)?;
        let (entry, shared, port) = self.resolve_port(m, p)?;
        if !shared.reserve_port(port) {
            return Err(Error::AlreadyConnected(path.to_string()));
        }
        entry
            .tx
            .send(Envelope::Control(
                entry.id,
                Control::AssignTransport(port, Box::new(NullTransport::new())),
            ))
            .map_err(|_| Error::ShutDown)
    }

    /// Voluntary disconnect of a port; the peer sees a disconnect without
    /// error.
    pub fn disconnect(&self, path: &str) -> Result<()> {
        let (m, p) = Self::split_path(path)?;
        let (entry, _, port) = self.resolve_port(m, p)?;
        self.inner.connections.lock().retain(|c| !c.involves(m, p));
        entry
            .tx
            .send(Envelope::Control(entry.id, Control::Detach(port)))
            .map_err(|_| Error::ShutDown)
    }

    /// Redo the recorded connection of a port.
    pub fn reconnect(&self, module: &str, port: &str) -> Result<()> {
        let conn = self
            .inner
            .connections
            .lock()
            .iter()
            .find(|c| c.involves(module, port))
            .cloned()
            .ok_or_else(|| Error::NotConnected(format!("{}/{}", module, port)))?;
        self.connect_ports(
            (conn.a.0.as_str(), conn.a.1.as_str()),
            (conn.b.0.as_str(), conn.b.1.as_str()),
        )
    }

    pub(crate) fn schedule_reconnect(
        &self,
        module: String,
        port: String,
        period: Duration,
        limit: u32,
        attempt: u32,
    ) {
        let ctx = self.clone();
        self.schedule_after(period, move || {
            if ctx.is_shutting_down() {
                return;
            }
            match ctx.reconnect(&module, &port) {
                Ok(()) => log::info!(
                    "[RuntimeContext::schedule_reconnect] {}/{} reconnected after {} attempt(s)",
                    module,
                    port,
                    attempt + 1
                ),
                Err(e) if attempt + 1 < limit => {
                    log::debug!(
                        "[RuntimeContext::schedule_reconnect] {}/{} attempt {} failed: {}",
                        module,
                        port,
                        attempt + 1,
                        e
                    );
                    ctx.schedule_reconnect(module, port, period, limit, attempt + 1);
                }
                Err(e) => {
                    log::warn!(
                        "[RuntimeContext::schedule_reconnect] {}/{} gave up after {} attempts: {}",
                        module,
                        port,
                        limit,
                        e
                    );
                    drop(ctx.submit(Command::new("Stop").with_receiver(module)));
                }
            }
        });
    }

    // ========================================================================
    // Module lifecycle
    // ========================================================================

    fn lifecycle(&self, name: &str, command: &str) -> Result<()> {
        let (entry, _) = self.module_entry(name)?;
        let cmd = Command::new(command).with_receiver(name);
        if entry.on_current_thread() {
            drop(self.submit(cmd));
            return Ok(());
        }
        let reply = self.execute(cmd, self.inner.config.control_timeout);
        match reply.result {
            CommandResult::True => Ok(()),
            CommandResult::Timeout => Err(Error::Timeout(format!("{} of {}", command, name))),
            other => Err(Error::InvalidState(format!("{} of {} answered {}", command, name, other))),
        }
    }

    pub fn start_module(&self, name: &str) -> Result<()> {
        self.lifecycle(name, "Start")
    }

    pub fn stop_module(&self, name: &str) -> Result<()> {
        self.lifecycle(name, "Stop")
    }

    /// Stop and start again; a Sync module parked in `wait_restart`
    /// resumes its main loop instead.
    pub fn restart_module(&self, name: &str) -> Result<()> {
        self.lifecycle(name, "Restart")
    }

    pub fn start_all(&self) -> Result<()> {
        for name in self.module_names() {
            self.start_module(&name)?;
        }
        Ok(())
    }

    /// Stop every module, continuing after failures; the first one is
    /// returned.
    pub fn stop_all(&self) -> Result<()> {
        let mut first = None;
        for name in self.module_names() {
            if let Err(e) = self.stop_module(&name) {
                log::warn!("[RuntimeContext::stop_all] {}: {}", name, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Remove a worker. Its transports close with error, so peers apply
    /// their on-error policy.
    pub fn destroy_module(&self, name: &str) -> Result<()> {
        let (_, entry) = self
            .inner
            .workers
            .remove(name)
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))?;
        if entry.on_current_thread() {
            let _ = entry.tx.send(Envelope::Control(entry.id, Control::Destroy(None)));
            return Ok(());
        }
        let (ack_tx, ack_rx) = channel::bounded(1);
        if entry
            .tx
            .send(Envelope::Control(entry.id, Control::Destroy(Some(ack_tx))))
            .is_err()
        {
            return Ok(());
        }
        ack_rx
            .recv_timeout(self.inner.config.control_timeout)
            .map_err(|_| Error::Timeout(format!("destroy of {}", name)))?;
        log::info!("[RuntimeContext::destroy_module] {} destroyed", name);
        Ok(())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn post(&self, mut cmd: Command, replier: Replier) {
        cmd.set_id(self.inner.next_command.fetch_add(1, Ordering::Relaxed));
        cmd.set_replier(replier);
        let Some(receiver) = cmd.receiver().map(str::to_string) else {
            log::debug!("[RuntimeContext::post] {} has no receiver", cmd.name());
            cmd.reply(CommandResult::Unknown);
            return;
        };
        match self.inner.workers.get(&receiver).map(|e| (e.tx.clone(), e.id)) {
            Some((tx, id)) => {
                // A closed mailbox drops the command, which replies False.
                let _ = tx.send(Envelope::Command(id, cmd));
            }
            None => {
                log::debug!("[RuntimeContext::post] no worker {} for {}", receiver, cmd.name());
                cmd.reply(CommandResult::Unknown);
            }
        }
    }

    /// Submit a command to its receiver; the handle yields the reply.
    pub fn submit(&self, cmd: Command) -> CommandHandle {
        let (tx, rx) = channel::bounded(1);
        self.post(cmd, Replier::Channel(tx));
        CommandHandle::new(rx)
    }

    /// Submit a command; `on_reply` runs on the replying thread.
    pub fn submit_with<F>(&self, cmd: Command, on_reply: F)
    where
        F: FnOnce(CommandReply) + Send + 'static,
    {
        self.post(cmd, Replier::Callback(Box::new(on_reply)));
    }

    /// Submit and wait for the reply.
    ///
    /// Denied when the receiver runs on the calling thread, which could not
    /// serve it while blocked here. Sync modules use
    /// [`crate::SyncContext::execute`] instead.
    pub fn execute(&self, cmd: Command, timeout: Duration) -> CommandReply {
        let same_thread = cmd
            .receiver()
            .and_then(|r| self.inner.workers.get(r).map(|e| e.on_current_thread()))
            .unwrap_or(false);
        if same_thread {
            log::warn!(
                "[RuntimeContext::execute] {} would block its own receiver thread",
                cmd.name()
            );
            return CommandReply::synthesized(CommandResult::Denied);
        }
        let timeout = cmd.timeout().map_or(timeout, |t| t.min(timeout));
        self.submit(cmd).wait(timeout)
    }

    /// Run `f` on the manager thread after `delay`.
    pub fn schedule_after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self
            .inner
            .threads
            .lock()
            .get(MANAGER_THREAD)
            .map(|h| h.tx.clone());
        match tx {
            Some(tx) => {
                if tx.send(Envelope::Deferred(delay, Box::new(f))).is_err() {
                    log::debug!("[RuntimeContext::schedule_after] manager thread gone");
                }
            }
            None => log::debug!("[RuntimeContext::schedule_after] no manager thread"),
        }
    }

    // ========================================================================
    // Fatal errors and exit
    // ========================================================================

    /// Record a fatal error, stop every module and request exit. Only the
    /// first error is kept.
    pub fn raise_fatal(&self, err: FatalError) {
        log::error!("[RuntimeContext::raise_fatal] {}", err);
        {
            let mut fatal = self.inner.fatal.lock();
            if fatal.is_some() {
                return;
            }
            *fatal = Some(err);
        }
        for name in self.module_names() {
            drop(self.submit(Command::new("Stop").with_receiver(name)));
        }
        self.request_exit();
    }

    pub fn fatal_error(&self) -> Option<FatalError> {
        self.inner.fatal.lock().clone()
    }

    pub fn request_exit(&self) {
        let mut exit = self.inner.exit_requested.lock();
        *exit = true;
        self.inner.exit_cv.notify_all();
    }

    pub fn is_exit_requested(&self) -> bool {
        *self.inner.exit_requested.lock()
    }

    /// Block until exit is requested. False on timeout.
    pub fn wait_exit(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut exit = self.inner.exit_requested.lock();
        while !*exit {
            match deadline {
                Some(d) => {
                    if self.inner.exit_cv.wait_until(&mut exit, d).timed_out() {
                        return *exit;
                    }
                }
                None => self.inner.exit_cv.wait(&mut exit),
            }
        }
        true
    }

    /// Stop and destroy every worker, then join the threads. Idempotent;
    /// must not be called from a runtime thread.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[RuntimeContext::shutdown] shutting down");

        let mut names: Vec<String> = self.inner.workers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        for name in &names {
            if let Ok((entry, _)) = self.module_entry(name) {
                if !entry.on_current_thread() {
                    let reply = self.submit(Command::new("Stop").with_receiver(name.as_str()));
                    let _ = reply.wait(self.inner.config.control_timeout);
                }
            }
        }
        for name in &names {
            if let Err(e) = self.destroy_module(name) {
                log::warn!("[RuntimeContext::shutdown] {}: {}", name, e);
            }
        }
        self.inner.connections.lock().clear();

        let threads: Vec<ThreadHandle> = self.inner.threads.lock().drain().map(|(_, h)| h).collect();
        for mut handle in threads {
            handle.stop();
        }
        self.request_exit();
        log::info!("[RuntimeContext::shutdown] done");
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("workers", &self.inner.workers.len())
            .field("pools", &self.inner.pools.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
