//! IPC request surface: `ipc://<method>?seq=<seq>&<key>=<value>…` plus an optional body,
//! routed onto [`Core`] operations.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use url::Url;

use crate::core::Core;
use crate::protocol::{Callback, CoreError, Envelope, Response};

const SCHEME: &str = "ipc";

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid request uri: {0}")]
    Uri(#[from] url::ParseError),
    #[error("expected an ipc:// uri, got scheme {0:?}")]
    Scheme(String),
    #[error("request has no method")]
    MissingMethod,
    #[error("missing required parameter {0:?}")]
    Missing(String),
    #[error("invalid value {value:?} for parameter {key:?}")]
    Invalid { key: String, value: String },
}

impl From<RequestError> for CoreError {
    fn from(err: RequestError) -> Self {
        CoreError::invalid_arg(err.to_string())
    }
}

/// One parsed IPC call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Empty when the caller sent none.
    pub seq: String,
    params: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn parse(uri: &str) -> Result<Self, RequestError> {
        let url = Url::parse(uri)?;
        if url.scheme() != SCHEME {
            return Err(RequestError::Scheme(url.scheme().to_string()));
        }
        let method = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => url.path().trim_matches('/').to_string(),
        };
        if method.is_empty() {
            return Err(RequestError::MissingMethod);
        }
        let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let seq = params.remove("seq").unwrap_or_default();
        // Hosts hand the sequence back as a C string.
        if seq.contains('\0') {
            return Err(RequestError::Invalid {
                key: "seq".into(),
                value: seq,
            });
        }
        Ok(Self {
            method,
            seq,
            params,
            body: None,
        })
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn required(&self, key: &str) -> Result<&str, RequestError> {
        self.get(key)
            .ok_or_else(|| RequestError::Missing(key.to_string()))
    }

    pub fn parse_param<T: FromStr>(&self, key: &str) -> Result<T, RequestError> {
        let value = self.required(key)?;
        parse_value(key, value)
    }

    pub fn optional<T: FromStr>(&self, key: &str) -> Result<Option<T>, RequestError> {
        self.get(key).map(|v| parse_value(key, v)).transpose()
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, RequestError> {
    value.trim().parse().map_err(|_| RequestError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn socket_addr(r: &Request, default_address: Option<&str>) -> Result<SocketAddr, RequestError> {
    let address = match (r.get("address"), default_address) {
        (Some(a), _) => a,
        (None, Some(d)) => d,
        (None, None) => return Err(RequestError::Missing("address".into())),
    };
    let ip: IpAddr = parse_value("address", address)?;
    let port: u16 = match default_address {
        Some(_) => r.optional("port")?.unwrap_or(0),
        None => r.parse_param("port")?,
    };
    Ok(SocketAddr::new(ip, port))
}

impl Core {
    /// Parse `uri` and route it. A malformed uri is answered under an empty sequence.
    pub fn invoke_uri(&self, uri: &str, body: Option<Vec<u8>>, cb: Callback) {
        match Request::parse(uri) {
            Ok(request) => {
                let request = match body {
                    Some(body) => request.with_body(body),
                    None => request,
                };
                self.invoke(&request, cb);
            }
            Err(e) => {
                tracing::debug!(%uri, error = %e, "rejected ipc uri");
                cb(Response::Envelope {
                    seq: String::new(),
                    envelope: Envelope::error(SCHEME, None, &CoreError::from(e)),
                });
            }
        }
    }

    /// Route one request. Every request is answered through `cb` exactly once.
    pub fn invoke(&self, request: &Request, cb: Callback) {
        if let Err(e) = self.route(request, cb.clone()) {
            let id = request.optional::<u64>("id").ok().flatten();
            cb(Response::Envelope {
                seq: request.seq.clone(),
                envelope: Envelope::error(request.method.clone(), id, &e),
            });
        }
    }

    fn route(&self, r: &Request, cb: Callback) -> Result<(), CoreError> {
        let seq = r.seq.as_str();
        match r.method.to_ascii_lowercase().as_str() {
            "dns.lookup" => {
                let hostname = r.required("hostname")?;
                let family = r.optional::<i64>("family")?.unwrap_or(0);
                self.dns_lookup(seq, hostname, family, cb);
            }
            "udp.bind" => {
                let id = r.parse_param("id")?;
                let reuse_addr = r.optional("reuseAddr")?.unwrap_or(false);
                self.udp_bind(seq, id, socket_addr(r, Some("0.0.0.0"))?, reuse_addr, cb);
            }
            "udp.connect" => {
                let id = r.parse_param("id")?;
                self.udp_connect(seq, id, socket_addr(r, None)?, cb);
            }
            "udp.send" => {
                let id = r.parse_param("id")?;
                let bytes = match (&r.body, r.get("data")) {
                    (Some(body), _) => body.clone(),
                    (None, Some(data)) => data.as_bytes().to_vec(),
                    (None, None) => return Err(RequestError::Missing("data".into()).into()),
                };
                let target = if r.get("port").is_some() {
                    Some(socket_addr(r, None)?)
                } else {
                    None
                };
                self.udp_send(seq, id, bytes, target, cb);
            }
            "udp.readstart" => self.udp_read_start(seq, r.parse_param("id")?, cb),
            "udp.readstop" => self.udp_read_stop(seq, r.parse_param("id")?, cb),
            "udp.getsockname" => self.udp_get_sock_name(seq, r.parse_param("id")?, cb),
            "udp.getpeername" => self.udp_get_peer_name(seq, r.parse_param("id")?, cb),
            "udp.joinmulticast" => {
                let id = r.parse_param("id")?;
                let group = r.parse_param("group")?;
                let iface = r.optional("interface")?;
                self.udp_join_multicast(seq, id, group, iface, cb);
            }
            "udp.leavemulticast" => {
                let id = r.parse_param("id")?;
                let group = r.parse_param("group")?;
                let iface = r.optional("interface")?;
                self.udp_leave_multicast(seq, id, group, iface, cb);
            }
            "buffersize" => {
                let id = r.parse_param("id")?;
                let size = r.optional("size")?.unwrap_or(0);
                let buffer = r.optional("buffer")?.unwrap_or(0);
                self.buffer_size(seq, id, size, buffer, cb);
            }
            "close" => self.close(seq, r.parse_param("id")?, cb),
            "event" => {
                let value = r.required("value")?;
                self.handle_event(seq, value, r.get("data").unwrap_or_default(), cb);
            }
            "os.networkinterfaces" => cb(Response::Envelope {
                seq: seq.to_string(),
                envelope: self.network_interfaces(),
            }),
            "post" => {
                let id: u64 = r.parse_param("id")?;
                let post = self
                    .posts()
                    .take(id)
                    .ok_or_else(|| CoreError::not_found("No post with specified id"))?;
                cb(Response::Post {
                    seq: seq.to_string(),
                    post,
                });
            }
            _ => {
                return Err(CoreError::not_found(format!(
                    "Unknown method {:?}",
                    r.method
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::post::Post;
    use crate::protocol::{ERR_INVALID_ARG, ERR_NOT_FOUND};
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;

    fn collector() -> (Callback, mpsc::Receiver<Response>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let cb: Callback = Arc::new(move |r: Response| {
            let _ = tx.lock().unwrap().send(r);
        });
        (cb, rx)
    }

    fn next(rx: &mpsc::Receiver<Response>) -> Response {
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn parses_method_seq_and_params() {
        let r = Request::parse("ipc://udp.bind?seq=12&id=3&address=127.0.0.1&port=0").unwrap();
        assert_eq!(r.method, "udp.bind");
        assert_eq!(r.seq, "12");
        assert_eq!(r.parse_param::<u64>("id").unwrap(), 3);
        assert_eq!(r.get("address"), Some("127.0.0.1"));
        assert!(r.get("seq").is_none());
    }

    #[test]
    fn decodes_percent_escapes() {
        let r = Request::parse("ipc://event?seq=1&value=load&data=a%20b%26c").unwrap();
        assert_eq!(r.get("data"), Some("a b&c"));
    }

    #[test]
    fn rejects_other_schemes_and_bad_values() {
        assert!(matches!(
            Request::parse("https://example.com/?seq=1"),
            Err(RequestError::Scheme(_))
        ));
        let r = Request::parse("ipc://close?seq=1&id=abc").unwrap();
        assert!(matches!(
            r.parse_param::<u64>("id"),
            Err(RequestError::Invalid { .. })
        ));
        assert!(matches!(
            r.parse_param::<u64>("size"),
            Err(RequestError::Missing(_))
        ));
        assert_eq!(r.optional::<i32>("size").unwrap(), None);
    }

    #[test]
    fn nul_in_seq_is_answered_as_invalid_arg() {
        assert!(matches!(
            Request::parse("ipc://bufferSize?seq=a%00b&id=5"),
            Err(RequestError::Invalid { ref key, .. }) if key == "seq"
        ));

        let core = Core::new(CoreConfig::default()).unwrap();
        let (cb, rx) = collector();
        core.invoke_uri("ipc://bufferSize?seq=a%00b&id=5", None, cb);
        let resp = next(&rx);
        assert_eq!(resp.seq(), "");
        let err = resp.envelope().unwrap().err.clone().unwrap();
        assert_eq!(err.code.as_deref(), Some(ERR_INVALID_ARG));
    }

    #[test]
    fn unknown_method_is_not_found() {
        let core = Core::new(CoreConfig::default()).unwrap();
        let (cb, rx) = collector();
        core.invoke_uri("ipc://fs.open?seq=4", None, cb);
        let resp = next(&rx);
        assert_eq!(resp.seq(), "4");
        let env = resp.envelope().unwrap();
        assert_eq!(env.source, "fs.open");
        assert_eq!(env.err.as_ref().unwrap().code.as_deref(), Some(ERR_NOT_FOUND));
    }

    #[test]
    fn malformed_params_are_invalid_arg() {
        let core = Core::new(CoreConfig::default()).unwrap();
        let (cb, rx) = collector();
        core.invoke_uri("ipc://bufferSize?seq=2&id=-1", None, cb.clone());
        let err = next(&rx).envelope().unwrap().err.clone().unwrap();
        assert_eq!(err.code.as_deref(), Some(ERR_INVALID_ARG));
        assert_eq!(err.kind, "InternalError");

        core.invoke_uri("not a uri", None, cb);
        let resp = next(&rx);
        assert_eq!(resp.seq(), "");
        assert_eq!(
            resp.envelope().unwrap().err.as_ref().unwrap().code.as_deref(),
            Some(ERR_INVALID_ARG)
        );
    }

    #[test]
    fn bind_send_and_close_through_uris() {
        let core = Core::new(CoreConfig::default()).unwrap();
        let (cb, rx) = collector();
        let target = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = target.local_addr().unwrap().port();

        core.invoke_uri(
            "ipc://udp.bind?seq=1&id=9&address=127.0.0.1&reuseAddr=true",
            None,
            cb.clone(),
        );
        assert!(next(&rx).envelope().unwrap().is_ok());

        let uri = format!("ipc://udp.send?seq=2&id=9&address=127.0.0.1&port={port}");
        core.invoke_uri(&uri, Some(b"body".to_vec()), cb.clone());
        let env = next(&rx).envelope().cloned().unwrap();
        assert_eq!(env.data.unwrap()["bytes"], 4);

        core.invoke_uri("ipc://close?seq=3&id=9", None, cb.clone());
        assert!(next(&rx).envelope().unwrap().is_ok());
        core.invoke_uri("ipc://close?seq=4&id=9", None, cb);
        assert!(!next(&rx).envelope().unwrap().is_ok());
    }

    #[test]
    fn post_returns_body_once() {
        let core = Core::new(CoreConfig::default()).unwrap();
        let (cb, rx) = collector();
        core.put_post(7, Post::new(b"AB".to_vec(), "X: 1"));

        core.invoke_uri("ipc://post?seq=5&id=7", None, cb.clone());
        match next(&rx) {
            Response::Post { seq, post } => {
                assert_eq!(seq, "5");
                assert_eq!(post.body.as_deref(), Some(&b"AB"[..]));
                assert_eq!(post.headers, "X: 1");
            }
            other => panic!("expected a post, got {other:?}"),
        }
        assert!(!core.has_post(7));

        core.invoke_uri("ipc://post?seq=6&id=7", None, cb);
        let err = next(&rx).envelope().unwrap().err.clone().unwrap();
        assert_eq!(err.kind, "NotFoundError");
        assert_eq!(err.id.as_deref(), Some("7"));
    }

    #[test]
    fn event_and_interfaces() {
        let core = Core::new(CoreConfig::default()).unwrap();
        let (cb, rx) = collector();
        core.invoke_uri("ipc://event?seq=1&value=domcontentloaded", None, cb.clone());
        assert_eq!(
            next(&rx).envelope().unwrap().data,
            Some(serde_json::json!({}))
        );
        core.invoke_uri("ipc://os.networkInterfaces?seq=2", None, cb);
        let env = next(&rx).envelope().cloned().unwrap();
        assert_eq!(env.source, "os.networkInterfaces");
    }
}
