//! UDP peers: one socket each, with an explicit lifecycle
//! `Idle → {Bound | Connected} → Closing → Closed`.
//!
//! Sockets are created, mutated and dropped on the loop thread only; the registry
//! is the sole authority on which ids exist.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::event_loop::LoopContext;
use crate::protocol::{
    CoreError, ERR_ALREADY_BOUND, ERR_ALREADY_READING, ERR_IS_CONNECTED, ERR_NOT_BOUND,
    ERR_NOT_CONNECTED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Idle,
    Bound,
    Connected,
    Closing,
    Closed,
}

impl PeerState {
    pub fn is_open(self) -> bool {
        matches!(self, PeerState::Bound | PeerState::Connected)
    }

    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, PeerState::Closing | PeerState::Closed)
    }
}

/// Which OS buffer `bufferSize` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDirection {
    Send,
    Receive,
}

impl BufferDirection {
    /// Clamp a wire value: `<= 0` is send, `>= 1` is receive.
    pub fn from_raw(raw: i64) -> Self {
        if raw >= 1 {
            BufferDirection::Receive
        } else {
            BufferDirection::Send
        }
    }
}

struct PeerInner {
    state: PeerState,
    socket: Option<Arc<UdpSocket>>,
    remote: Option<SocketAddr>,
    reader: Option<AbortHandle>,
}

impl PeerInner {
    /// Handle of a reader that is still running. A reader that exited on its own is forgotten.
    fn live_reader(&mut self) -> Option<&AbortHandle> {
        if self.reader.as_ref().is_some_and(AbortHandle::is_finished) {
            self.reader = None;
        }
        self.reader.as_ref()
    }
}

/// One UDP socket and its lifecycle state.
pub struct Peer {
    id: u64,
    inner: Mutex<PeerInner>,
}

impl Peer {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            inner: Mutex::new(PeerInner {
                state: PeerState::Idle,
                socket: None,
                remote: None,
                reader: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> PeerState {
        self.lock().state
    }

    pub fn is_reading(&self) -> bool {
        self.lock().live_reader().is_some()
    }

    /// Bind an idle peer to `addr`. On failure the peer stays idle.
    pub fn bind(&self, addr: SocketAddr, reuse_addr: bool) -> Result<SocketAddr, CoreError> {
        let mut inner = self.lock();
        match inner.state {
            PeerState::Idle => {}
            s if s.is_closing_or_closed() => return Err(CoreError::AlreadyClosed),
            _ => {
                return Err(CoreError::internal(
                    ERR_ALREADY_BOUND,
                    "Socket is already bound",
                ))
            }
        }
        let socket = bind_socket(addr, reuse_addr)?;
        let local = socket.local_addr()?;
        inner.socket = Some(Arc::new(socket));
        inner.state = PeerState::Bound;
        debug!(peer_id = self.id, %local, "peer bound");
        Ok(local)
    }

    /// Connect to `remote`. An idle peer is first bound to an ephemeral local port; if the
    /// connect then fails the peer stays idle.
    pub async fn connect(&self, remote: SocketAddr) -> Result<SocketAddr, CoreError> {
        let (from, socket) = {
            let inner = self.lock();
            let socket = match inner.state {
                PeerState::Idle => Arc::new(bind_socket(unspecified_for(remote), false)?),
                PeerState::Bound => inner
                    .socket
                    .clone()
                    .ok_or_else(|| CoreError::internal(ERR_NOT_BOUND, "Socket is not bound"))?,
                PeerState::Connected => {
                    return Err(CoreError::internal(
                        ERR_IS_CONNECTED,
                        "Already connected",
                    ))
                }
                PeerState::Closing | PeerState::Closed => return Err(CoreError::AlreadyClosed),
            };
            (inner.state, socket)
        };
        socket.connect(remote).await?;
        self.commit_connect(from, socket, remote)
    }

    /// Install a connected socket, unless the state moved away from `from` while connecting.
    fn commit_connect(
        &self,
        from: PeerState,
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
    ) -> Result<SocketAddr, CoreError> {
        let mut inner = self.lock();
        match inner.state {
            s if s.is_closing_or_closed() => return Err(CoreError::AlreadyClosed),
            PeerState::Connected => {
                return Err(CoreError::internal(ERR_IS_CONNECTED, "Already connected"))
            }
            s if s != from => {
                return Err(CoreError::internal(
                    ERR_ALREADY_BOUND,
                    "Socket is already bound",
                ))
            }
            _ => {}
        }
        inner.socket = Some(socket);
        inner.remote = Some(remote);
        inner.state = PeerState::Connected;
        debug!(peer_id = self.id, %remote, "peer connected");
        Ok(remote)
    }

    /// Send one datagram. Connected peers send to their remote; bound peers need `target`.
    pub async fn send(&self, bytes: &[u8], target: Option<SocketAddr>) -> Result<usize, CoreError> {
        let (socket, state) = {
            let inner = self.lock();
            if inner.state.is_closing_or_closed() {
                return Err(CoreError::AlreadyClosed);
            }
            let socket = inner
                .socket
                .clone()
                .ok_or_else(|| CoreError::internal(ERR_NOT_BOUND, "Socket is not bound"))?;
            (socket, inner.state)
        };
        let sent = match (state, target) {
            (PeerState::Connected, None) => socket.send(bytes).await?,
            (PeerState::Connected, Some(_)) => {
                return Err(CoreError::internal(
                    ERR_IS_CONNECTED,
                    "Already connected; send without an address",
                ))
            }
            (_, Some(target)) => socket.send_to(bytes, target).await?,
            (_, None) => {
                return Err(CoreError::internal(
                    ERR_NOT_CONNECTED,
                    "Not connected; an address and port are required",
                ))
            }
        };
        Ok(sent)
    }

    /// Start delivering received datagrams to `on_datagram` from a loop task.
    pub fn start_reading<F>(
        &self,
        cx: &mut LoopContext,
        max_datagram_size: usize,
        on_datagram: F,
    ) -> Result<(), CoreError>
    where
        F: Fn(Result<(Vec<u8>, SocketAddr), CoreError>) + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.state.is_closing_or_closed() {
            return Err(CoreError::AlreadyClosed);
        }
        if inner.live_reader().is_some() {
            return Err(CoreError::internal(
                ERR_ALREADY_READING,
                "Socket is already reading",
            ));
        }
        let socket = inner
            .socket
            .clone()
            .ok_or_else(|| CoreError::internal(ERR_NOT_BOUND, "Socket is not bound"))?;
        let peer_id = self.id;
        let handle = cx.spawn_daemon(async move {
            let mut buf = vec![0u8; max_datagram_size.max(1)];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => on_datagram(Ok((buf[..n].to_vec(), from))),
                    // ICMP errors from an earlier send; the socket is still usable.
                    Err(e) if is_transient(&e) => {
                        debug!(peer_id, error = %e, "receive error; still reading");
                        on_datagram(Err(CoreError::os(&e)));
                    }
                    Err(e) => {
                        warn!(peer_id, error = %e, "receive failed; reader stopped");
                        on_datagram(Err(CoreError::os(&e)));
                        break;
                    }
                }
            }
        });
        inner.reader = Some(handle);
        Ok(())
    }

    /// Stop the reader task. Returns false if the peer was not reading.
    pub fn stop_reading(&self) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        if inner.state.is_closing_or_closed() {
            return Err(CoreError::AlreadyClosed);
        }
        inner.live_reader();
        Ok(match inner.reader.take() {
            Some(reader) => {
                reader.abort();
                true
            }
            None => false,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CoreError> {
        let inner = self.lock();
        if inner.state.is_closing_or_closed() {
            return Err(CoreError::AlreadyClosed);
        }
        let socket = inner
            .socket
            .as_ref()
            .ok_or_else(|| CoreError::internal(ERR_NOT_BOUND, "Socket is not bound"))?;
        Ok(socket.local_addr()?)
    }

    pub fn remote_addr(&self) -> Result<SocketAddr, CoreError> {
        let inner = self.lock();
        if inner.state.is_closing_or_closed() {
            return Err(CoreError::AlreadyClosed);
        }
        inner
            .remote
            .ok_or_else(|| CoreError::internal(ERR_NOT_CONNECTED, "Not connected"))
    }

    /// Read (`size == 0`) or set the OS buffer size and return the size now in effect.
    pub fn buffer_size(&self, size: i32, direction: BufferDirection) -> Result<i32, CoreError> {
        let inner = self.lock();
        if inner.state.is_closing_or_closed() {
            return Err(CoreError::AlreadyClosed);
        }
        let socket = inner
            .socket
            .as_ref()
            .ok_or_else(|| CoreError::internal(ERR_NOT_BOUND, "Socket is not bound"))?;
        Ok(socket_buffer_size(&**socket, direction, size)?)
    }

    pub fn join_multicast(&self, group: IpAddr, iface: Option<IpAddr>) -> Result<(), CoreError> {
        self.multicast(group, iface, true)
    }

    pub fn leave_multicast(&self, group: IpAddr, iface: Option<IpAddr>) -> Result<(), CoreError> {
        self.multicast(group, iface, false)
    }

    fn multicast(&self, group: IpAddr, iface: Option<IpAddr>, join: bool) -> Result<(), CoreError> {
        let inner = self.lock();
        if inner.state.is_closing_or_closed() {
            return Err(CoreError::AlreadyClosed);
        }
        let socket = inner
            .socket
            .as_ref()
            .ok_or_else(|| CoreError::internal(ERR_NOT_BOUND, "Socket is not bound"))?;
        match group {
            IpAddr::V4(group) => {
                let iface = match iface {
                    Some(IpAddr::V4(ip)) => ip,
                    Some(IpAddr::V6(_)) => {
                        return Err(CoreError::invalid_arg(
                            "IPv4 multicast group needs an IPv4 interface address",
                        ))
                    }
                    None => Ipv4Addr::UNSPECIFIED,
                };
                if join {
                    socket.join_multicast_v4(group, iface)?;
                } else {
                    socket.leave_multicast_v4(group, iface)?;
                }
            }
            // Interface index 0 lets the OS pick.
            IpAddr::V6(group) => {
                if join {
                    socket.join_multicast_v6(&group, 0)?;
                } else {
                    socket.leave_multicast_v6(&group, 0)?;
                }
            }
        }
        Ok(())
    }

    /// Enter `Closing`: stop reading and hand back the socket for the caller to release.
    pub fn begin_close(&self) -> Result<Option<Arc<UdpSocket>>, CoreError> {
        let mut inner = self.lock();
        if inner.state.is_closing_or_closed() {
            return Err(CoreError::AlreadyClosed);
        }
        inner.state = PeerState::Closing;
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        inner.remote = None;
        Ok(inner.socket.take())
    }

    pub fn finish_close(&self) {
        self.lock().state = PeerState::Closed;
        debug!(peer_id = self.id, "peer closed");
    }

    /// Close immediately, whatever the state. Used when the loop shuts down.
    pub fn force_close(&self) {
        let mut inner = self.lock();
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        inner.socket = None;
        inner.remote = None;
        inner.state = PeerState::Closed;
    }

    fn lock(&self) -> MutexGuard<'_, PeerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Most closed ids remembered. Past this the oldest tombstone is dropped and its id
/// reports `NotFound` again.
pub const MAX_TOMBSTONES: usize = 4096;

#[derive(Default)]
struct RegistryInner {
    peers: HashMap<u64, Arc<Peer>>,
    /// Ids whose peer closed; a later request on them reports `AlreadyClosed`.
    closed: HashSet<u64>,
    /// `closed` in burial order, oldest first.
    closed_order: VecDeque<u64>,
}

impl RegistryInner {
    fn bury(&mut self, id: u64) {
        if !self.closed.insert(id) {
            return;
        }
        self.closed_order.push_back(id);
        while self.closed_order.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }

    fn revive(&mut self, id: u64) {
        if self.closed.remove(&id) {
            self.closed_order.retain(|&closed| closed != id);
        }
    }
}

/// id → peer. Held only for map reads and mutations, never across an operation.
#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live peer for `id`: `NotFound` if unknown, `AlreadyClosed` if it was closed.
    pub fn get(&self, id: u64) -> Result<Arc<Peer>, CoreError> {
        let inner = self.lock();
        if let Some(peer) = inner.peers.get(&id) {
            return Ok(peer.clone());
        }
        if inner.closed.contains(&id) {
            return Err(CoreError::AlreadyClosed);
        }
        Err(CoreError::not_found("No peer with specified id"))
    }

    /// Existing peer, or a new idle one registered under `id`.
    pub fn get_or_create(&self, id: u64) -> Arc<Peer> {
        let mut inner = self.lock();
        inner.revive(id);
        inner
            .peers
            .entry(id)
            .or_insert_with(|| Arc::new(Peer::new(id)))
            .clone()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().peers.contains_key(&id)
    }

    /// Erase a closed peer, leaving a tombstone.
    pub fn remove(&self, id: u64) -> Option<Arc<Peer>> {
        let mut inner = self.lock();
        let peer = inner.peers.remove(&id);
        if peer.is_some() {
            inner.bury(id);
        }
        peer
    }

    /// Take every live peer out of the registry.
    pub fn drain(&self) -> Vec<Arc<Peer>> {
        let mut inner = self.lock();
        let drained: Vec<(u64, Arc<Peer>)> = inner.peers.drain().collect();
        drained
            .into_iter()
            .map(|(id, peer)| {
                inner.bury(id);
                peer
            })
            .collect()
    }

    /// Live peers; tombstones are not counted.
    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().peers.is_empty()
    }

    pub fn tombstones(&self) -> usize {
        self.lock().closed.len()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.lock().peers.keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn bind_socket(addr: SocketAddr, reuse_addr: bool) -> io::Result<UdpSocket> {
    let socket = if reuse_addr {
        bind_reuse_addr(addr)?
    } else {
        std::net::UdpSocket::bind(addr)?
    };
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

/// Bind with SO_REUSEADDR set first, which std's bind cannot do.
#[cfg(unix)]
fn bind_reuse_addr(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    use std::mem::{size_of, zeroed};
    use std::os::unix::io::{AsRawFd, FromRawFd};

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Owns the fd from here on; closed on any early return.
    let socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };

    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = match addr {
        SocketAddr::V4(v4) => {
            let mut sin: libc::sockaddr_in = unsafe { zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            unsafe {
                libc::bind(
                    socket.as_raw_fd(),
                    &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                    size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            unsafe {
                libc::bind(
                    socket.as_raw_fd(),
                    &sin6 as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(socket)
}

#[cfg(not(unix))]
fn bind_reuse_addr(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    std::net::UdpSocket::bind(addr)
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// SO_RCVBUF / SO_SNDBUF. A non-zero `size` is set first; the value read back is returned
/// (the kernel may round or double it).
#[cfg(unix)]
fn socket_buffer_size<S: std::os::unix::io::AsRawFd>(
    socket: &S,
    direction: BufferDirection,
    size: i32,
) -> io::Result<i32> {
    use std::mem::size_of;

    let fd = socket.as_raw_fd();
    let opt = match direction {
        BufferDirection::Receive => libc::SO_RCVBUF,
        BufferDirection::Send => libc::SO_SNDBUF,
    };
    if size != 0 {
        let value: libc::c_int = size;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &value as *const libc::c_int as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

#[cfg(not(unix))]
fn socket_buffer_size<S>(_socket: &S, _direction: BufferDirection, _size: i32) -> io::Result<i32> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "socket buffer sizes are not supported on this platform",
    ))
}
