//! The listening parent and its worker pool.
//!
//! The parent binds every backend, preforks workers where configured,
//! and then sits in a select loop over the non-prefork listening
//! sockets and the PPC channels of its children. Workers are blocking
//! and synchronous; everything shared (logs, memory sessions, spawn
//! requests) flows through PPC.

use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, BorrowedFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::select::{FdSet, select};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal, kill};
use nix::sys::stat::Mode;
use nix::sys::time::TimeVal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Pid, Uid, fork};
use tracing::{debug, info, warn};

use ember_core::config::Config;
use ember_core::klog::{Klog, Level};
use ember_core::ppc::{PpcChannel, PpcMessage, encode_frame};
use ember_core::timer::{self, TimerAction};
use ember_http::dynpage::DynRoutes;
use ember_http::embfs::EmbFs;
use ember_http::http::WorkerCtx;
use ember_http::session::SessionKind;

use crate::backend::{Backend, ServerModel};
use crate::child::Children;
use crate::error::ServerError;

const DEFAULT_SERVER_MAX_CHILD: usize = 256;

static STOP: AtomicBool = AtomicBool::new(false);
static REAP: AtomicBool = AtomicBool::new(false);
static IS_CHILD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: i32) {
    STOP.store(true, Ordering::Relaxed);
}

extern "C" fn on_sigterm(_: i32) {
    // workers die on the spot; the parent winds down in its loop
    if IS_CHILD.load(Ordering::Relaxed) {
        unsafe { nix::libc::_exit(0) }
    }
    STOP.store(true, Ordering::Relaxed);
}

extern "C" fn on_sigchld(_: i32) {
    REAP.store(true, Ordering::Relaxed);
}

/// What a fork-capable call did to the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Still the parent, keep looping.
    Parent,
    /// We are a worker that finished its service; exit.
    ChildDone,
}

struct ParentLink {
    channel: PpcChannel,
    backend_id: i32,
}

pub struct Server {
    backends: Vec<Backend>,
    children: Children,
    links: Vec<ParentLink>,
    klog: Option<Rc<RefCell<Klog>>>,
    max_child: usize,
    allow_root: bool,
    chroot_dir: Option<String>,
    blind_chroot: bool,
    uid: Option<u32>,
    gid: Option<u32>,
}

impl Server {
    pub fn create(
        config: &Config,
        embfs: Rc<EmbFs>,
        routes: Rc<DynRoutes>,
        foreground: bool,
    ) -> Result<Server, ServerError> {
        let klog = match config.child("log") {
            Some(lc) => Some(Rc::new(RefCell::new(Klog::open_from_config(lc)?))),
            None => None,
        };

        let list = config
            .subkey_value("server_list")
            .ok_or_else(|| ServerError::BadConfig("bad or missing 'server_list' value".into()))?
            .to_owned();

        let mut backends = Vec::new();
        for name in list.split_ascii_whitespace() {
            let sub = config.child(name).ok_or_else(|| {
                ServerError::BadConfig(format!("missing [{name}] backend configuration"))
            })?;
            debug!(backend = name, "configuring backend");
            backends.push(Backend::from_config(
                name,
                sub,
                backends.len() as i32,
                Rc::clone(&embfs),
                Rc::clone(&routes),
                None,
                foreground,
            )?);
        }
        if backends.is_empty() {
            return Err(ServerError::BadConfig("no backend configured".into()));
        }

        let server = Server {
            backends,
            children: Children::new(),
            links: Vec::new(),
            klog,
            max_child: config.subkey_value_i("max_child", DEFAULT_SERVER_MAX_CHILD as i64)?
                as usize,
            allow_root: config.subkey_value_b("allow_root", false)?,
            chroot_dir: config.subkey_value("chroot").map(str::to_owned),
            blind_chroot: config.subkey_value_b("blind_chroot", false)?,
            uid: config.subkey_value("uid").and_then(|v| v.parse().ok()),
            gid: config.subkey_value("gid").and_then(|v| v.parse().ok()),
        };

        server.install_signal_handlers()?;
        Ok(server)
    }

    fn install_signal_handlers(&self) -> Result<(), ServerError> {
        let mk = |h: extern "C" fn(i32)| {
            SigAction::new(SigHandler::Handler(h), SaFlags::empty(), SigSet::empty())
        };
        unsafe {
            signal::sigaction(Signal::SIGINT, &mk(on_sigint))?;
            signal::sigaction(Signal::SIGTERM, &mk(on_sigterm))?;
            signal::sigaction(Signal::SIGCHLD, &mk(on_sigchld))?;
            signal::sigaction(
                Signal::SIGPIPE,
                &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
            )?;
        }
        Ok(())
    }

    pub fn stop() {
        STOP.store(true, Ordering::Relaxed);
    }

    /// One-shot CGI mode: serve stdin/stdout through the first plain
    /// http backend and return.
    pub fn serve_cgi(&mut self) -> Result<(), ServerError> {
        let be = self
            .backends
            .iter()
            .find(|b| b.proto == "http")
            .ok_or_else(|| ServerError::BadConfig("no http backend for CGI mode".into()))?;
        be.engine.serve(0)?;
        Ok(())
    }

    /// Bind, drop privileges and run the parent loop until stopped.
    pub fn run(&mut self) -> Result<Flow, ServerError> {
        for be in &mut self.backends {
            be.listen()?;
            info!(backend = %be.name, addr = %be.addr, model = ?be.model, "listening");
        }

        if self.chroot_dir.is_some() {
            self.chroot()?;
        }
        self.drop_privileges()?;
        if !self.allow_root && (Uid::current().is_root() || Uid::effective().is_root()) {
            return Err(ServerError::BadConfig(
                "you must set the allow_root config option to run ember as root".into(),
            ));
        }

        loop {
            if STOP.load(Ordering::Relaxed) {
                break;
            }

            if self.spawn_children()? == Flow::ChildDone {
                return Ok(Flow::ChildDone);
            }

            let ready = self.wait_for_events()?;

            if REAP.swap(false, Ordering::Relaxed) {
                self.reap_children();
            }

            if let Some(kl) = &self.klog {
                let _ = kl.borrow_mut().flush();
            }

            for fd in ready {
                if self.dispatch_fd(fd)? == Flow::ChildDone {
                    return Ok(Flow::ChildDone);
                }
            }
        }

        self.shutdown();
        Ok(Flow::Parent)
    }

    /// Select over the watched descriptors with a one second tick;
    /// returns the readable ones.
    fn wait_for_events(&mut self) -> Result<Vec<RawFd>, ServerError> {
        let mut watched: Vec<RawFd> = Vec::new();
        for be in &self.backends {
            if be.model != ServerModel::Prefork {
                if let Some(l) = &be.listener {
                    watched.push(l.as_raw_fd());
                }
            }
        }
        for link in &self.links {
            watched.push(link.channel.raw_fd());
        }

        let borrowed: Vec<BorrowedFd> = watched
            .iter()
            .map(|&fd| unsafe { BorrowedFd::borrow_raw(fd) })
            .collect();
        let mut readfds = FdSet::new();
        for bfd in &borrowed {
            readfds.insert(bfd);
        }
        let nfds = watched.iter().copied().max().unwrap_or(0) + 1;
        let mut tv = TimeVal::new(1, 0);

        match select(nfds, Some(&mut readfds), None, None, Some(&mut tv)) {
            Ok(0) => Ok(Vec::new()),
            Ok(_) => Ok(watched
                .into_iter()
                .filter(|&fd| {
                    let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
                    readfds.contains(&bfd)
                })
                .collect()),
            Err(nix::Error::EINTR) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch_fd(&mut self, fd: RawFd) -> Result<Flow, ServerError> {
        if let Some(idx) = self
            .backends
            .iter()
            .position(|b| b.listener.as_ref().is_some_and(|l| l.as_raw_fd() == fd))
        {
            return self.accept_and_serve(idx);
        }
        if let Some(idx) = self.links.iter().position(|l| l.channel.raw_fd() == fd) {
            return self.process_ppc(idx);
        }
        Ok(Flow::Parent)
    }

    fn accept_and_serve(&mut self, idx: usize) -> Result<Flow, ServerError> {
        let stream = loop {
            match self.backends[idx].listener.as_ref().unwrap().accept() {
                Ok((s, _)) => break s,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    return Ok(Flow::Parent);
                }
            }
        };
        let _ = stream.set_nodelay(true);

        match self.backends[idx].model {
            ServerModel::Iterative => {
                if let Err(e) = self.backends[idx].engine.serve(stream.into_raw_fd()) {
                    debug!("serve failed: {e}");
                }
                Ok(Flow::Parent)
            }
            ServerModel::Fork => match self.fork_worker(idx)? {
                None => {
                    // over the process caps: serve inline rather than
                    // dropping the connection
                    if let Err(e) = self.backends[idx].engine.serve(stream.into_raw_fd()) {
                        debug!("serve failed: {e}");
                    }
                    Ok(Flow::Parent)
                }
                Some(ForkOutcome::Parent) => Ok(Flow::Parent),
                Some(ForkOutcome::Child { .. }) => {
                    if let Err(e) = self.backends[idx].engine.serve(stream.into_raw_fd()) {
                        debug!("serve failed: {e}");
                    }
                    Ok(Flow::ChildDone)
                }
            },
            ServerModel::Prefork => Ok(Flow::Parent), // children accept themselves
        }
    }

    /// Prefork backfill: spawn whatever each backend is owed.
    fn spawn_children(&mut self) -> Result<Flow, ServerError> {
        for idx in 0..self.backends.len() {
            if self.backends[idx].model != ServerModel::Prefork {
                continue;
            }
            while self.backends[idx].fork_child > 0 {
                match self.fork_worker(idx)? {
                    None => break, // at the cap, retry on a later tick
                    Some(ForkOutcome::Parent) => {
                        self.backends[idx].fork_child -= 1;
                    }
                    Some(ForkOutcome::Child { link }) => {
                        self.prefork_child_loop(idx, link);
                        return Ok(Flow::ChildDone);
                    }
                }
            }
        }
        Ok(Flow::Parent)
    }

    /// Fork one worker for backend `idx`. `None` when the child caps
    /// forbid it right now. In the child, the returned link is our side
    /// of the PPC channel.
    fn fork_worker(&mut self, idx: usize) -> Result<Option<ForkOutcome>, ServerError> {
        if self.children.count() >= self.max_child
            || self.backends[idx].nchild >= self.backends[idx].max_child
        {
            return Ok(None);
        }

        let (parent_end, child_end) = UnixStream::pair()?;
        let bid = self.backends[idx].id;

        match unsafe { fork() }? {
            ForkResult::Child => {
                IS_CHILD.store(true, Ordering::Relaxed);
                drop(parent_end);

                // this worker serves exactly one backend
                for (i, be) in self.backends.iter_mut().enumerate() {
                    if i != idx {
                        be.listener = None;
                    }
                }
                self.children.clear();
                self.links.clear();

                let link = Rc::new(RefCell::new(PpcChannel::new(child_end)));
                self.backends[idx].engine.set_worker_ctx(WorkerCtx {
                    link: Some(Rc::clone(&link)),
                    backend_id: bid,
                    prefork: self.backends[idx].model == ServerModel::Prefork,
                });
                Ok(Some(ForkOutcome::Child { link }))
            }
            ForkResult::Parent { child } => {
                drop(child_end);
                self.children.add(child, bid);
                self.backends[idx].nchild += 1;
                self.links.push(ParentLink {
                    channel: PpcChannel::new(parent_end),
                    backend_id: bid,
                });
                Ok(Some(ForkOutcome::Parent))
            }
        }
    }

    /// A prefork worker's whole life: accept, serve, repeat — bounded
    /// by `max_requests_per_child`, the stop flag, and the
    /// spawn-on-demand self-retirement.
    fn prefork_child_loop(&mut self, idx: usize, link: Rc<RefCell<PpcChannel>>) {
        let bid = self.backends[idx].id;
        let fork_frame: Arc<[u8]> = match encode_frame(&PpcMessage::ForkChild { bid }) {
            Ok(f) => f.into(),
            Err(e) => {
                warn!("cannot encode spawn request: {e}");
                return;
            }
        };
        let link_fd = link.borrow().raw_fd();

        for _ in 0..self.backends[idx].max_rq_per_child {
            if STOP.load(Ordering::Relaxed) {
                break;
            }
            let stream = {
                let listener = self.backends[idx].listener.as_ref().unwrap();
                match listener.accept() {
                    Ok((s, _)) => s,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("worker accept failed: {e}");
                        break;
                    }
                }
            };
            let _ = stream.set_nodelay(true);

            // a request still running after a second asks the parent
            // for another worker
            let alarm = timer::add(
                1,
                TimerAction::NotifyFd {
                    fd: link_fd,
                    frame: Arc::clone(&fork_frame),
                },
            )
            .ok();

            if let Err(e) = self.backends[idx].engine.serve(stream.into_raw_fd()) {
                debug!("serve failed: {e}");
            }

            if let Some(al) = alarm {
                timer::del(al);
            }
            if timer::take_notified() {
                // the pool got a replacement; retire to keep its shape
                break;
            }
        }
    }

    /// Handle one message from a worker; a closed channel just drops
    /// the link (the reaper respawns the worker if needed).
    fn process_ppc(&mut self, idx: usize) -> Result<Flow, ServerError> {
        let msg = self.links[idx].channel.recv();
        let bid = self.links[idx].backend_id;

        let (_, msg) = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!("ppc channel down: {e}");
                self.links.remove(idx);
                return Ok(Flow::Parent);
            }
        };

        match msg {
            PpcMessage::Nop => {}
            PpcMessage::LogAdd { bid, level, line } => {
                if let Some(kl) = self.klog_of(bid) {
                    let _ = kl.borrow_mut().log(Level::from_u8(level), &line);
                }
            }
            PpcMessage::LogGet { bid, index } => {
                let reply = match self.klog_of(bid) {
                    Some(kl) => {
                        let kl = kl.borrow();
                        match index
                            .try_into()
                            .ok()
                            .and_then(|i: usize| kl.get_line(i).ok().flatten())
                        {
                            Some(line) => PpcMessage::LogGetReply { index, line },
                            None => PpcMessage::LogGetReply { index: -1, line: String::new() },
                        }
                    }
                    None => PpcMessage::LogGetReply { index: -1, line: String::new() },
                };
                self.links[idx].channel.send(&reply)?;
            }
            PpcMessage::AccessLog { bid, vhost, line } => {
                if let Some(be) = self.backend_by_id(bid) {
                    if let Some(vh) = be.engine.vhosts().get_n(vhost) {
                        if let Some(kl) = &vh.klog {
                            let _ = kl.borrow_mut().log(Level::Info, &line);
                        }
                    }
                }
            }
            PpcMessage::ForkChild { bid } => {
                debug!(bid, "worker asked for reinforcements");
                if let Some(idx) = self.backends.iter().position(|b| b.id == bid) {
                    match self.fork_worker(idx)? {
                        Some(ForkOutcome::Child { link }) => {
                            self.prefork_child_loop(idx, link);
                            return Ok(Flow::ChildDone);
                        }
                        Some(ForkOutcome::Parent) => {}
                        None => self.backends[idx].fork_child += 1, // later
                    }
                }
            }
            PpcMessage::MsesSave { id, mtime, data } => {
                if let Some(opts) = self.mses_opts(bid) {
                    let (mc, ml) = (opts.max_count, opts.mem_limit);
                    if let Err(e) = opts.atoms().borrow_mut().save(&id, mtime, data, mc, ml) {
                        warn!("memory session save failed: {e}");
                    }
                }
            }
            PpcMessage::MsesGet { id } => {
                let reply = match self.mses_opts(bid).and_then(|o| o.atoms().borrow().get(&id)) {
                    Some((mtime, data)) => PpcMessage::MsesReply { found: true, mtime, data },
                    None => PpcMessage::MsesReply { found: false, mtime: 0, data: Vec::new() },
                };
                self.links[idx].channel.send(&reply)?;
            }
            PpcMessage::MsesDelOld => {
                if let Some(opts) = self.mses_opts(bid) {
                    opts.atoms().borrow_mut().del_oldest();
                }
            }
            PpcMessage::MsesRemove { id } => {
                if let Some(opts) = self.mses_opts(bid) {
                    opts.atoms().borrow_mut().remove(&id);
                }
            }
            other => debug!(?other, "unexpected ppc message"),
        }
        Ok(Flow::Parent)
    }

    fn backend_by_id(&self, bid: i32) -> Option<&Backend> {
        self.backends.iter().find(|b| b.id == bid)
    }

    fn klog_of(&self, bid: i32) -> Option<Rc<RefCell<Klog>>> {
        self.backend_by_id(bid)
            .and_then(|b| b.klog.clone())
            .or_else(|| self.klog.clone())
    }

    /// The memory-session store serving this backend (its own when the
    /// backend uses memory sessions).
    fn mses_opts(&self, bid: i32) -> Option<Rc<ember_http::session::SessionOpts>> {
        let be = self.backend_by_id(bid)?;
        let opts = be.engine.session_opts();
        if opts.kind == SessionKind::Memory {
            return Some(Rc::clone(opts));
        }
        None
    }

    fn reap_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    if code != 0 {
                        warn!(%pid, code, "worker exited abnormally");
                    }
                    self.forget_child(pid);
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    warn!(%pid, ?sig, "worker killed by signal");
                    self.forget_child(pid);
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    fn forget_child(&mut self, pid: Pid) {
        let Some(bid) = self.children.remove(pid) else { return };
        if let Some(idx) = self.backends.iter().position(|b| b.id == bid) {
            let be = &mut self.backends[idx];
            be.nchild = be.nchild.saturating_sub(1);
            // keep the pool at its configured floor
            if be.model == ServerModel::Prefork && be.nchild < be.start_child {
                be.fork_child = be.start_child - be.nchild;
            }
        }
    }

    fn shutdown(&mut self) {
        for pid in self.children.pids() {
            let _ = kill(pid, Signal::SIGTERM);
        }
        std::thread::sleep(std::time::Duration::from_secs(1));
        self.reap_children();
        for pid in self.children.pids() {
            let _ = kill(pid, Signal::SIGKILL);
        }
    }

    fn drop_privileges(&self) -> Result<(), ServerError> {
        if let Some(gid) = self.gid {
            let gid = Gid::from_raw(gid);
            nix::unistd::setgroups(&[gid])?;
            nix::unistd::setgid(gid)?;
            nix::unistd::setegid(gid)?;
            if Gid::current() != gid || Gid::effective() != gid {
                return Err(ServerError::BadConfig("could not drop group privileges".into()));
            }
        }
        if let Some(uid) = self.uid {
            let uid = Uid::from_raw(uid);
            nix::unistd::setuid(uid)?;
            nix::unistd::seteuid(uid)?;
            if Uid::current() != uid || Uid::effective() != uid {
                return Err(ServerError::BadConfig("could not drop user privileges".into()));
            }
        }
        Ok(())
    }

    fn chroot(&self) -> Result<(), ServerError> {
        let dir = self.chroot_dir.as_deref().expect("checked by caller");
        if self.blind_chroot {
            self.chroot_blind(dir)
        } else {
            nix::unistd::chroot(dir)?;
            nix::unistd::chdir("/")?;
            info!("chroot'd: {dir}");
            Ok(())
        }
    }

    /// Chroot into a freshly made, empty, mode-0100 directory that a
    /// helper child unlinks as soon as we are inside. The helper waits
    /// on a pipe byte written after chroot(2), so there is no window
    /// where the directory is both reachable and deleted.
    fn chroot_blind(&self, base: &str) -> Result<(), ServerError> {
        let dir = format!("{base}/ember_blind_chroot_{}.dir", std::process::id());

        nix::unistd::mkdir(dir.as_str(), Mode::from_bits_truncate(0o100))?;
        let dirfd = nix::fcntl::open(
            dir.as_str(),
            nix::fcntl::OFlag::O_RDONLY,
            Mode::empty(),
        )?;

        let (sync_rd, sync_wr) = nix::unistd::pipe()?;
        let (sync_rd, sync_wr) = (sync_rd.into_raw_fd(), sync_wr.into_raw_fd());

        match unsafe { fork() }? {
            ForkResult::Child => {
                let _ = nix::unistd::close(sync_wr);
                // wait for the parent to actually be inside
                let mut byte = [0u8; 1];
                let _ = nix::unistd::read(sync_rd, &mut byte);
                let _ = std::fs::remove_dir(&dir);
                unsafe { nix::libc::_exit(0) }
            }
            ForkResult::Parent { .. } => {
                let _ = nix::unistd::close(sync_rd);

                nix::unistd::chroot(dir.as_str())?;
                nix::unistd::chdir("/")?;

                // handshake: the empty dir may now disappear
                let _ = nix::unistd::write(sync_wr, &[1u8]);
                let _ = nix::unistd::close(sync_wr);

                // paranoia: verify what we chroot'd into
                let st = nix::sys::stat::fstat(dirfd)?;
                let _ = nix::unistd::close(dirfd);
                if st.st_uid != 0 || st.st_gid != 0 {
                    return Err(ServerError::BadConfig("blind chroot dir not owned by root".into()));
                }
                if st.st_mode & 0o7777 != 0o100 {
                    return Err(ServerError::BadConfig("blind chroot dir mode is not 0100".into()));
                }
                if std::fs::read_dir("/")?.next().is_some() {
                    return Err(ServerError::BadConfig("blind chroot dir is not empty".into()));
                }
                info!("blind chroot'd: {dir}");
                Ok(())
            }
        }
    }
}

enum ForkOutcome {
    Parent,
    Child { link: Rc<RefCell<PpcChannel>> },
}
