//! Core: composes the loop, post cache, peer registry and descriptor table, and exposes
//! every UI-facing operation as `(seq, params…, callback)`.
//!
//! Operations never block the caller. Anything touching a socket or the resolver is
//! dispatched onto the loop thread and answered through the callback exactly once.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::descriptors::DescriptorTable;
use crate::dns::{self, Family};
use crate::event_loop::{Dispatcher, EventLoop, LoopContext, LoopError, LoopThread};
use crate::interfaces;
use crate::peer::{BufferDirection, Peer, PeerRegistry};
use crate::post::{Post, PostCache};
use crate::protocol::{Callback, CoreError, Envelope, PendingRequest, Response, UNSOLICITED_SEQ};

/// Header attached to datagrams surfaced through the post cache.
const DATAGRAM_HEADERS: &str = "content-type: application/octet-stream";

pub struct Core {
    config: CoreConfig,
    dispatcher: Dispatcher,
    posts: Arc<PostCache>,
    peers: Arc<PeerRegistry>,
    descriptors: Arc<DescriptorTable>,
    /// `None` for an embedded core, whose loop the host owns.
    thread: Mutex<Option<LoopThread>>,
}

impl Core {
    /// Start a core with its loop on a dedicated thread. Fails only if the loop
    /// cannot be initialized.
    pub fn new(config: CoreConfig) -> Result<Self, LoopError> {
        let thread = LoopThread::spawn(&config.loop_thread_name, config.shutdown_grace())?;
        let dispatcher = thread.dispatcher().clone();
        let core = Self::assemble(config, dispatcher, Some(thread))?;
        info!(thread = %core.config.loop_thread_name, "core started");
        Ok(core)
    }

    /// Build a core whose loop the host pumps from its own thread with
    /// [`EventLoop::run_once`]. The host drains it with [`EventLoop::shutdown`].
    pub fn embedded(config: CoreConfig) -> Result<(Self, EventLoop), LoopError> {
        let (event_loop, dispatcher) = EventLoop::new(config.shutdown_grace())?;
        let core = Self::assemble(config, dispatcher, None)?;
        Ok((core, event_loop))
    }

    fn assemble(
        config: CoreConfig,
        dispatcher: Dispatcher,
        thread: Option<LoopThread>,
    ) -> Result<Self, LoopError> {
        let posts = Arc::new(PostCache::new());
        let interval = config.post_expiry_interval();
        let sweep = posts.clone();
        dispatcher.dispatch(move |cx| {
            cx.spawn_daemon(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    sweep.expire();
                }
            });
        })?;
        Ok(Self {
            config,
            dispatcher,
            posts,
            peers: Arc::new(PeerRegistry::new()),
            descriptors: Arc::new(DescriptorTable::new()),
            thread: Mutex::new(thread),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn posts(&self) -> &PostCache {
        &self.posts
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    /// Close every peer, then drain and join the loop thread. Idempotent.
    ///
    /// For an embedded core the peer close is queued on the host's loop; the host
    /// finishes with [`EventLoop::shutdown`].
    pub fn shutdown(&self) -> Result<(), LoopError> {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let peers = self.peers.drain();
        if !peers.is_empty() {
            let count = peers.len();
            // Dropped with the work item if the loop is already gone.
            if self
                .dispatcher
                .dispatch(move |_| peers.iter().for_each(|p| p.force_close()))
                .is_err()
            {
                debug!(count, "loop gone; peers released on caller thread");
            } else {
                debug!(count, "closing peers at shutdown");
            }
        }
        match thread {
            Some(thread) => {
                thread.shutdown()?;
                info!("core stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Resolve `hostname`; `family` is 4, 6 or anything else for unspecified.
    pub fn dns_lookup(&self, seq: &str, hostname: &str, family: i64, cb: Callback) {
        let hostname = hostname.to_string();
        let family = Family::from_hint(family);
        self.on_loop(PendingRequest::new(seq, dns::SOURCE, cb), move |cx, pending| {
            dns::lookup(cx, hostname, family, pending);
        });
    }

    /// Create peer `id` if needed and bind it to `addr`.
    pub fn udp_bind(&self, seq: &str, id: u64, addr: SocketAddr, reuse_addr: bool, cb: Callback) {
        let peers = self.peers.clone();
        self.on_loop(PendingRequest::new(seq, "udp.bind", cb), move |_, pending| {
            let peer = peers.get_or_create(id);
            let result = peer.bind(addr, reuse_addr).map(|local| endpoint_json(id, local));
            pending.resolve(Some(id), result);
        });
    }

    /// Create peer `id` if needed and connect it to `remote`.
    pub fn udp_connect(&self, seq: &str, id: u64, remote: SocketAddr, cb: Callback) {
        let peers = self.peers.clone();
        self.on_loop(PendingRequest::new(seq, "udp.connect", cb), move |cx, pending| {
            let peer = peers.get_or_create(id);
            cx.spawn(async move {
                let result = peer.connect(remote).await.map(|r| endpoint_json(id, r));
                pending.resolve(Some(id), result);
            });
        });
    }

    /// Send one datagram; `target` is required unless the peer is connected.
    pub fn udp_send(&self, seq: &str, id: u64, bytes: Vec<u8>, target: Option<SocketAddr>, cb: Callback) {
        let peers = self.peers.clone();
        self.on_loop(PendingRequest::new(seq, "udp.send", cb), move |cx, pending| {
            let peer = match peers.get(id) {
                Ok(peer) => peer,
                Err(e) => return pending.resolve(Some(id), Err(e)),
            };
            cx.spawn(async move {
                let result = peer
                    .send(&bytes, target)
                    .await
                    .map(|n| json!({ "id": id.to_string(), "bytes": n }));
                pending.resolve(Some(id), result);
            });
        });
    }

    /// Start receiving on peer `id`. Each datagram is cached as a post and surfaced
    /// to `cb` as a fetch script under the unsolicited sequence.
    pub fn udp_read_start(&self, seq: &str, id: u64, cb: Callback) {
        let peers = self.peers.clone();
        let posts = self.posts.clone();
        let max = self.config.max_datagram_size;
        let deliver = cb.clone();
        self.on_loop(PendingRequest::new(seq, "udp.readStart", cb), move |cx, pending| {
            let result = peers.get(id).and_then(|peer| {
                peer.start_reading(cx, max, move |received| {
                    deliver(datagram_response(&posts, id, received));
                })
            });
            pending.resolve(Some(id), result.map(|()| json!({ "id": id.to_string() })));
        });
    }

    pub fn udp_read_stop(&self, seq: &str, id: u64, cb: Callback) {
        self.peer_op(seq, "udp.readStop", id, cb, move |peer| {
            let was_reading = peer.stop_reading()?;
            Ok(json!({ "id": id.to_string(), "reading": was_reading }))
        });
    }

    pub fn udp_get_sock_name(&self, seq: &str, id: u64, cb: Callback) {
        self.peer_op(seq, "udp.getSockName", id, cb, move |peer| {
            Ok(endpoint_json(id, peer.local_addr()?))
        });
    }

    pub fn udp_get_peer_name(&self, seq: &str, id: u64, cb: Callback) {
        self.peer_op(seq, "udp.getPeerName", id, cb, move |peer| {
            Ok(endpoint_json(id, peer.remote_addr()?))
        });
    }

    pub fn udp_join_multicast(&self, seq: &str, id: u64, group: IpAddr, iface: Option<IpAddr>, cb: Callback) {
        self.peer_op(seq, "udp.joinMulticast", id, cb, move |peer| {
            peer.join_multicast(group, iface)?;
            Ok(json!({ "id": id.to_string(), "group": group.to_string() }))
        });
    }

    pub fn udp_leave_multicast(&self, seq: &str, id: u64, group: IpAddr, iface: Option<IpAddr>, cb: Callback) {
        self.peer_op(seq, "udp.leaveMulticast", id, cb, move |peer| {
            peer.leave_multicast(group, iface)?;
            Ok(json!({ "id": id.to_string(), "group": group.to_string() }))
        });
    }

    /// Read (`size == 0`) or set a peer's OS buffer size. `buffer` is clamped to
    /// send (`<= 0`) or receive (`>= 1`).
    pub fn buffer_size(&self, seq: &str, id: u64, size: i32, buffer: i64, cb: Callback) {
        let direction = BufferDirection::from_raw(buffer);
        self.peer_op(seq, "bufferSize", id, cb, move |peer| {
            let size = peer.buffer_size(size, direction)?;
            Ok(json!({ "id": id.to_string(), "size": size }))
        });
    }

    /// Close peer `id`. The callback fires after the socket is released and the
    /// registry has erased the id.
    pub fn close(&self, seq: &str, id: u64, cb: Callback) {
        let peers = self.peers.clone();
        self.on_loop(PendingRequest::new(seq, "close", cb), move |cx, pending| {
            let peer = match peers.get(id) {
                Ok(peer) => peer,
                Err(e) => return pending.resolve(Some(id), Err(e)),
            };
            let socket = match peer.begin_close() {
                Ok(socket) => socket,
                Err(e) => return pending.resolve(Some(id), Err(e)),
            };
            cx.spawn(async move {
                // The aborted reader must be unwound before its socket is released.
                tokio::task::yield_now().await;
                drop(socket);
                peer.finish_close();
                peers.remove(id);
                pending.resolve(Some(id), Ok(json!({ "id": id.to_string() })));
            });
        });
    }

    /// Page lifecycle event. `domcontentloaded` marks every tracked descriptor stale.
    /// Always replies `{}`.
    pub fn handle_event(&self, seq: &str, event: &str, data: &str, cb: Callback) {
        if event == "domcontentloaded" {
            let stale = self.descriptors.mark_all_stale();
            debug!(stale, "page loaded");
        } else {
            debug!(event, data_len = data.len(), "page event");
        }
        PendingRequest::new(seq, "event", cb).resolve(None, Ok(json!({})));
    }

    pub fn network_interfaces(&self) -> Envelope {
        interfaces::network_interfaces()
    }

    /// Cache `post` and return the script that makes the UI fetch it.
    pub fn create_post(&self, seq: &str, params: &str, post: Post) -> String {
        self.posts.create(seq, params, post)
    }

    pub fn get_post(&self, id: u64) -> Option<Post> {
        self.posts.get(id)
    }

    pub fn has_post(&self, id: u64) -> bool {
        self.posts.has(id)
    }

    pub fn put_post(&self, id: u64, post: Post) {
        self.posts.put(id, post)
    }

    pub fn remove_post(&self, id: u64) -> bool {
        self.posts.remove(id)
    }

    pub fn remove_all_posts(&self) -> usize {
        self.posts.remove_all()
    }

    pub fn expire_posts(&self) -> usize {
        self.posts.expire()
    }

    /// Run `work` on the loop. If the loop is gone the work, and the request it
    /// owns, is dropped; the request then answers with `ERR_LOOP_SHUTDOWN`.
    fn on_loop<F>(&self, pending: PendingRequest, work: F)
    where
        F: FnOnce(&mut LoopContext, PendingRequest) + Send + 'static,
    {
        let seq = pending.seq().to_string();
        if let Err(e) = self.dispatcher.dispatch(move |cx| work(cx, pending)) {
            warn!(%seq, error = %e, "dispatch failed");
        }
    }

    /// Synchronous operation on an existing peer, run on the loop.
    fn peer_op<F>(&self, seq: &str, source: &'static str, id: u64, cb: Callback, op: F)
    where
        F: FnOnce(&Peer) -> Result<Value, CoreError> + Send + 'static,
    {
        let peers = self.peers.clone();
        self.on_loop(PendingRequest::new(seq, source, cb), move |_, pending| {
            let result = peers.get(id).and_then(|peer| op(&peer));
            pending.resolve(Some(id), result);
        });
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "core did not shut down cleanly");
        }
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("peers", &self.peers.len())
            .field("posts", &self.posts.len())
            .field("descriptors", &self.descriptors.len())
            .finish()
    }
}

fn endpoint_json(id: u64, addr: SocketAddr) -> Value {
    json!({
        "id": id.to_string(),
        "address": addr.ip().to_string(),
        "port": addr.port(),
        "family": if addr.is_ipv4() { "IPv4" } else { "IPv6" },
    })
}

fn datagram_response(
    posts: &PostCache,
    id: u64,
    received: Result<(Vec<u8>, SocketAddr), CoreError>,
) -> Response {
    match received {
        Ok((bytes, from)) => {
            let params = json!({
                "source": "udp.readStart",
                "id": id.to_string(),
                "address": from.ip().to_string(),
                "port": from.port(),
                "bytes": bytes.len(),
            });
            let script = posts.create(UNSOLICITED_SEQ, &params.to_string(), Post::new(bytes, DATAGRAM_HEADERS));
            Response::Script {
                seq: UNSOLICITED_SEQ.to_string(),
                script,
            }
        }
        Err(e) => Response::Envelope {
            seq: UNSOLICITED_SEQ.to_string(),
            envelope: Envelope::error("udp.readStart", Some(id), &e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        ERR_ALREADY_READING, ERR_INVALID_ARG, ERR_LOOP_SHUTDOWN, ERR_NOT_FOUND, ERR_NOT_RUNNING,
    };
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn collector() -> (Callback, mpsc::Receiver<Response>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let cb: Callback = Arc::new(move |r: Response| {
            let _ = tx.lock().unwrap().send(r);
        });
        (cb, rx)
    }

    fn envelope(rx: &mpsc::Receiver<Response>) -> Envelope {
        rx.recv_timeout(WAIT)
            .unwrap()
            .envelope()
            .cloned()
            .expect("expected an envelope")
    }

    fn core() -> Core {
        Core::new(CoreConfig {
            shutdown_grace_ms: 500,
            ..CoreConfig::default()
        })
        .unwrap()
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn bound_port(env: &Envelope) -> u16 {
        env.data.as_ref().unwrap()["port"].as_u64().unwrap() as u16
    }

    #[test]
    fn bind_buffer_size_then_close_twice() {
        let core = core();
        let (cb, rx) = collector();

        core.udp_bind("1", 10, loopback(), false, cb.clone());
        let env = envelope(&rx);
        assert!(env.is_ok(), "{env:?}");
        assert_eq!(env.data.as_ref().unwrap()["id"], "10");
        assert_ne!(bound_port(&env), 0);

        core.buffer_size("2", 10, 0, 1, cb.clone());
        let env = envelope(&rx);
        if cfg!(unix) {
            assert!(env.data.unwrap()["size"].as_i64().unwrap() > 0);
        }

        core.close("3", 10, cb.clone());
        let resp = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(resp.seq(), "3");
        assert!(resp.envelope().unwrap().is_ok());
        assert!(!core.peers().contains(10));

        core.close("4", 10, cb);
        let err = envelope(&rx).err.unwrap();
        assert_eq!(err.code.as_deref(), Some(ERR_NOT_RUNNING));
        assert_eq!(err.id.as_deref(), Some("10"));
    }

    #[test]
    fn buffer_size_on_unknown_peer_is_not_found() {
        let core = core();
        let (cb, rx) = collector();
        core.buffer_size("5", 999, 4096, 0, cb);
        let env = envelope(&rx);
        assert_eq!(env.source, "bufferSize");
        let err = env.err.unwrap();
        assert_eq!(err.code.as_deref(), Some(ERR_NOT_FOUND));
        assert_eq!(err.kind, "NotFoundError");
        assert_eq!(err.id.as_deref(), Some("999"));
        assert!(core.peers().is_empty());
    }

    #[test]
    fn dns_lookup_localhost_and_unresolvable() {
        let core = core();
        let (cb, rx) = collector();

        core.dns_lookup("6", "localhost", 4, cb.clone());
        let env = envelope(&rx);
        assert_eq!(env.source, "dns.lookup");
        let data = env.data.unwrap();
        assert_eq!(data["family"], 4);
        let ip: IpAddr = data["address"].as_str().unwrap().parse().unwrap();
        assert!(ip.is_ipv4());

        core.dns_lookup("7", "no-such-host.invalid", 0, cb);
        let resp = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(resp.seq(), "7");
        let err = resp.envelope().unwrap().err.clone().unwrap();
        assert!(!err.message.is_empty());

        // Each lookup answered exactly once.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn concurrent_create_and_close_leaves_registry_empty() {
        let core = Arc::new(core());
        let before = core.peers().len();
        let workers: Vec<_> = (0..8u64)
            .map(|t| {
                let core = core.clone();
                std::thread::spawn(move || {
                    let (cb, rx) = collector();
                    for i in 0..10u64 {
                        let id = 1000 + t * 100 + i;
                        core.udp_bind(&format!("b{id}"), id, loopback(), false, cb.clone());
                        assert!(envelope(&rx).is_ok());
                        core.close(&format!("c{id}"), id, cb.clone());
                        assert!(envelope(&rx).is_ok());
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(core.peers().len(), before);
    }

    #[test]
    fn received_datagram_is_posted() {
        let core = core();
        let (cb, rx) = collector();

        core.udp_bind("1", 1, loopback(), false, cb.clone());
        let port = bound_port(&envelope(&rx));
        core.udp_read_start("2", 1, cb.clone());
        assert!(envelope(&rx).is_ok());

        core.udp_read_start("3", 1, cb.clone());
        let err = envelope(&rx).err.unwrap();
        assert_eq!(err.code.as_deref(), Some(ERR_ALREADY_READING));

        let sender = std::net::UdpSocket::bind(loopback()).unwrap();
        sender
            .send_to(b"ping", SocketAddr::from(([127, 0, 0, 1], port)))
            .unwrap();

        let script = match rx.recv_timeout(WAIT).unwrap() {
            Response::Script { seq, script } => {
                assert_eq!(seq, UNSOLICITED_SEQ);
                script
            }
            other => panic!("expected a script, got {other:?}"),
        };
        let marker = "ipc://post?id=";
        let start = script.find(marker).unwrap() + marker.len();
        let id: u64 = script[start..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .unwrap();
        let post = core.get_post(id).unwrap();
        assert_eq!(post.body.as_deref(), Some(&b"ping"[..]));
        assert!(script.contains("udp.readStart"));

        core.udp_read_stop("4", 1, cb);
        assert_eq!(envelope(&rx).data.unwrap()["reading"], true);
    }

    #[test]
    fn connect_send_and_names() {
        let core = core();
        let (cb, rx) = collector();
        let target = std::net::UdpSocket::bind(loopback()).unwrap();
        let remote = target.local_addr().unwrap();

        core.udp_connect("1", 2, remote, cb.clone());
        assert!(envelope(&rx).is_ok());

        core.udp_send("2", 2, b"hi".to_vec(), None, cb.clone());
        assert_eq!(envelope(&rx).data.unwrap()["bytes"], 2);
        let mut buf = [0u8; 8];
        target
            .set_read_timeout(Some(WAIT))
            .unwrap();
        let (n, _) = target.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");

        core.udp_get_peer_name("3", 2, cb.clone());
        assert_eq!(
            envelope(&rx).data.unwrap()["port"].as_u64().unwrap() as u16,
            remote.port()
        );
        core.udp_get_sock_name("4", 2, cb);
        assert_eq!(envelope(&rx).data.unwrap()["family"], "IPv4");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn refused_datagram_is_reported_and_reading_continues() {
        let core = core();
        let (cb, rx) = collector();
        let gone = std::net::UdpSocket::bind(loopback()).unwrap();
        let remote = gone.local_addr().unwrap();
        drop(gone);

        core.udp_connect("1", 3, remote, cb.clone());
        assert!(envelope(&rx).is_ok());
        core.udp_read_start("2", 3, cb.clone());
        assert!(envelope(&rx).is_ok());
        core.udp_send("3", 3, b"x".to_vec(), None, cb.clone());

        // The send reply and the refusal race each other.
        let mut sent = false;
        let mut refused = None;
        while !sent || refused.is_none() {
            match rx.recv_timeout(WAIT).unwrap() {
                Response::Envelope { seq, envelope } if seq == "3" => {
                    assert!(envelope.is_ok(), "{envelope:?}");
                    sent = true;
                }
                Response::Envelope { seq, envelope } if seq == UNSOLICITED_SEQ => {
                    refused = envelope.err;
                }
                other => panic!("unexpected response {other:?}"),
            }
        }
        let refused = refused.unwrap();
        assert_eq!(refused.id.as_deref(), Some("3"));
        assert!(refused.code.is_some());

        core.udp_read_start("4", 3, cb.clone());
        let err = envelope(&rx).err.unwrap();
        assert_eq!(err.code.as_deref(), Some(ERR_ALREADY_READING));

        // Once the remote is back, its datagrams still arrive.
        core.udp_get_sock_name("5", 3, cb.clone());
        let local_port = bound_port(&envelope(&rx));
        let back = std::net::UdpSocket::bind(remote).unwrap();
        back.send_to(b"back", SocketAddr::from(([127, 0, 0, 1], local_port))).unwrap();
        match rx.recv_timeout(WAIT).unwrap() {
            Response::Script { seq, script } => {
                assert_eq!(seq, UNSOLICITED_SEQ);
                assert!(script.contains("udp.readStart"));
            }
            other => panic!("expected a script, got {other:?}"),
        }

        core.udp_read_stop("6", 3, cb);
        assert_eq!(envelope(&rx).data.unwrap()["reading"], true);
    }

    #[cfg(unix)]
    #[test]
    fn join_and_leave_multicast_on_loopback() {
        let core = core();
        let (cb, rx) = collector();
        let group: IpAddr = "239.1.2.3".parse().unwrap();
        let lo: IpAddr = "127.0.0.1".parse().unwrap();

        core.udp_bind("1", 4, "0.0.0.0:0".parse().unwrap(), false, cb.clone());
        assert!(envelope(&rx).is_ok());

        core.udp_join_multicast("2", 4, group, Some(lo), cb.clone());
        let env = envelope(&rx);
        assert!(env.is_ok(), "{env:?}");
        let data = env.data.unwrap();
        assert_eq!(data["group"], "239.1.2.3");
        assert_eq!(data["id"], "4");

        core.udp_leave_multicast("3", 4, group, Some(lo), cb.clone());
        let env = envelope(&rx);
        assert!(env.is_ok(), "{env:?}");
        assert_eq!(env.source, "udp.leaveMulticast");

        // An IPv4 group needs an IPv4 interface.
        core.udp_join_multicast("4", 4, group, Some("::1".parse().unwrap()), cb.clone());
        let env = envelope(&rx);
        assert_eq!(env.source, "udp.joinMulticast");
        assert_eq!(env.err.unwrap().code.as_deref(), Some(ERR_INVALID_ARG));
    }

    #[test]
    fn multicast_on_unknown_or_closed_peer() {
        let core = core();
        let (cb, rx) = collector();
        let group: IpAddr = "239.1.2.3".parse().unwrap();

        core.udp_join_multicast("1", 99, group, None, cb.clone());
        assert_eq!(envelope(&rx).err.unwrap().code.as_deref(), Some(ERR_NOT_FOUND));

        core.udp_bind("2", 5, loopback(), false, cb.clone());
        assert!(envelope(&rx).is_ok());
        core.close("3", 5, cb.clone());
        assert!(envelope(&rx).is_ok());

        core.udp_join_multicast("4", 5, group, None, cb.clone());
        let err = envelope(&rx).err.unwrap();
        assert_eq!(err.code.as_deref(), Some(ERR_NOT_RUNNING));
        assert_eq!(err.id.as_deref(), Some("5"));

        core.udp_leave_multicast("5", 5, group, None, cb);
        assert_eq!(envelope(&rx).err.unwrap().code.as_deref(), Some(ERR_NOT_RUNNING));
    }

    #[test]
    fn close_connected_peer() {
        let core = core();
        let (cb, rx) = collector();
        let target = std::net::UdpSocket::bind(loopback()).unwrap();

        core.udp_connect("1", 6, target.local_addr().unwrap(), cb.clone());
        assert!(envelope(&rx).is_ok());
        assert_eq!(
            core.peers().get(6).unwrap().state(),
            crate::peer::PeerState::Connected
        );
        core.udp_read_start("2", 6, cb.clone());
        assert!(envelope(&rx).is_ok());

        core.close("3", 6, cb.clone());
        let resp = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(resp.seq(), "3");
        assert!(resp.envelope().unwrap().is_ok());
        assert!(!core.peers().contains(6));

        core.udp_get_peer_name("4", 6, cb.clone());
        assert_eq!(envelope(&rx).err.unwrap().code.as_deref(), Some(ERR_NOT_RUNNING));
        core.udp_send("5", 6, b"x".to_vec(), None, cb);
        assert_eq!(envelope(&rx).err.unwrap().code.as_deref(), Some(ERR_NOT_RUNNING));
    }

    #[test]
    fn send_to_unknown_peer_is_not_found() {
        let core = core();
        let (cb, rx) = collector();
        core.udp_send("1", 77, b"x".to_vec(), Some(loopback()), cb);
        let env = envelope(&rx);
        assert_eq!(env.source, "udp.send");
        assert_eq!(env.err.unwrap().code.as_deref(), Some(ERR_NOT_FOUND));
    }

    #[test]
    fn network_interfaces_have_local_entries() {
        let core = core();
        let env = core.network_interfaces();
        if let Some(data) = env.data {
            assert_eq!(data["ipv4"]["local"], "0.0.0.0");
            assert_eq!(data["ipv6"]["local"], "::1");
        } else {
            assert_eq!(env.err.unwrap().message, "unable to get interfaces");
        }
    }

    #[test]
    fn domcontentloaded_marks_descriptors_stale() {
        let core = core();
        let (cb, rx) = collector();
        core.descriptors().insert(3, "/tmp/file");
        core.handle_event("8", "domcontentloaded", "", cb);
        let env = envelope(&rx);
        assert_eq!(env.data, Some(json!({})));
        assert_eq!(
            core.descriptors().get(3).unwrap_err(),
            CoreError::StaleDescriptor(3)
        );
    }

    #[test]
    fn post_wrappers_round_trip() {
        let core = core();
        core.put_post(7, Post::new(b"AB".to_vec(), "X: 1"));
        assert_eq!(core.get_post(7).unwrap().body.as_deref(), Some(&b"AB"[..]));
        assert!(core.remove_post(7));
        assert!(!core.has_post(7));
        assert_eq!(core.expire_posts(), 0);
    }

    #[test]
    fn embedded_loop_runs_when_pumped() {
        let (core, mut event_loop) = Core::embedded(CoreConfig::default()).unwrap();
        let (cb, rx) = collector();
        core.udp_bind("1", 5, loopback(), false, cb);
        assert!(rx.try_recv().is_err());
        event_loop.run_once();
        assert!(rx.try_recv().unwrap().envelope().unwrap().is_ok());
        core.shutdown().unwrap();
        event_loop.shutdown();
    }

    #[test]
    fn requests_on_a_dropped_loop_answer_with_shutdown_error() {
        let (core, event_loop) = Core::embedded(CoreConfig::default()).unwrap();
        let (cb, rx) = collector();

        // Queued, then the loop is torn down without running it.
        core.buffer_size("1", 1, 0, 0, cb.clone());
        drop(event_loop);
        let err = envelope(&rx).err.unwrap();
        assert_eq!(err.code.as_deref(), Some(ERR_LOOP_SHUTDOWN));

        // Dispatched after the loop is gone.
        core.close("2", 1, cb);
        let resp = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(resp.seq(), "2");
        assert_eq!(
            resp.envelope().unwrap().err.as_ref().unwrap().code.as_deref(),
            Some(ERR_LOOP_SHUTDOWN)
        );
    }

    #[test]
    fn shutdown_closes_peers_and_is_idempotent() {
        let core = core();
        let (cb, rx) = collector();
        core.udp_bind("1", 1, loopback(), false, cb);
        assert!(envelope(&rx).is_ok());
        core.shutdown().unwrap();
        assert!(core.peers().is_empty());
        core.shutdown().unwrap();
    }
}
