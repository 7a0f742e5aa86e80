//! DNS lookup bridge: one hostname in, one envelope out.
//!
//! The OS resolver runs on the loop's blocking pool; its answer is delivered from a
//! task on the loop thread. Resolution failures carry the resolver's status code and
//! message, submission failures carry `ERR_DNS_SUBMIT`, and a result that cannot be
//! formatted is a `FormatError`.

use std::net::IpAddr;

use serde_json::{json, Value};
use tracing::debug;

use crate::event_loop::LoopContext;
use crate::protocol::{CoreError, PendingRequest, ERR_DNS_SUBMIT};

pub const SOURCE: &str = "dns.lookup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
    Any,
}

impl Family {
    /// `4` and `6` select a family; anything else means unspecified.
    pub fn from_hint(hint: i64) -> Self {
        match hint {
            4 => Family::V4,
            6 => Family::V6,
            _ => Family::Any,
        }
    }

    fn matches(self, ip: &IpAddr) -> bool {
        match self {
            Family::V4 => ip.is_ipv4(),
            Family::V6 => ip.is_ipv6(),
            Family::Any => true,
        }
    }
}

/// Schedule a lookup on the loop; `pending` is answered exactly once.
pub(crate) fn lookup(cx: &mut LoopContext, hostname: String, family: Family, pending: PendingRequest) {
    cx.spawn(async move {
        let result = resolve(hostname.clone(), family).await.map(address_json);
        if let Err(e) = &result {
            debug!(%hostname, error = %e, "dns lookup failed");
        }
        pending.resolve(None, result);
    });
}

/// First address for `hostname` in `family`.
pub async fn resolve(hostname: String, family: Family) -> Result<IpAddr, CoreError> {
    let entries = tokio::task::spawn_blocking(move || getaddrinfo(&hostname, family))
        .await
        .map_err(|e| CoreError::internal(ERR_DNS_SUBMIT, e.to_string()))??;
    first_address(&entries, family)
}

fn address_json(ip: IpAddr) -> Value {
    json!({
        "address": ip.to_string(),
        "family": if ip.is_ipv4() { 4 } else { 6 },
    })
}

/// `None` entries are results in a family we cannot format.
fn first_address(entries: &[Option<IpAddr>], family: Family) -> Result<IpAddr, CoreError> {
    match entries.first() {
        None => Err(CoreError::Format("resolver returned no addresses".into())),
        Some(None) => Err(CoreError::Format("unsupported address family".into())),
        Some(Some(ip)) if family.matches(ip) => Ok(*ip),
        Some(Some(ip)) => Err(CoreError::Format(format!(
            "resolver returned {ip}, outside the requested family"
        ))),
    }
}

#[cfg(unix)]
fn getaddrinfo(hostname: &str, family: Family) -> Result<Vec<Option<IpAddr>>, CoreError> {
    use std::ffi::{CStr, CString};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::ptr;

    let host = CString::new(hostname)
        .map_err(|_| CoreError::internal(ERR_DNS_SUBMIT, "hostname contains a NUL byte"))?;
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = match family {
        Family::V4 => libc::AF_INET,
        Family::V6 => libc::AF_INET6,
        Family::Any => libc::AF_UNSPEC,
    };
    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let status = unsafe { libc::getaddrinfo(host.as_ptr(), ptr::null(), &hints, &mut res) };
    if status != 0 {
        let message = if status == libc::EAI_SYSTEM {
            std::io::Error::last_os_error().to_string()
        } else {
            unsafe { CStr::from_ptr(libc::gai_strerror(status)) }
                .to_string_lossy()
                .into_owned()
        };
        return Err(CoreError::Internal {
            code: Some(status.to_string()),
            message,
        });
    }

    let mut out = Vec::new();
    let mut cursor = res;
    while !cursor.is_null() {
        let ai = unsafe { &*cursor };
        cursor = ai.ai_next;
        if ai.ai_addr.is_null() {
            out.push(None);
            continue;
        }
        let ip = match ai.ai_family {
            libc::AF_INET => {
                let sin = unsafe { &*(ai.ai_addr as *const libc::sockaddr_in) };
                Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(ai.ai_addr as *const libc::sockaddr_in6) };
                Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
            }
            _ => None,
        };
        out.push(ip);
    }
    unsafe { libc::freeaddrinfo(res) };
    Ok(out)
}

#[cfg(not(unix))]
fn getaddrinfo(hostname: &str, family: Family) -> Result<Vec<Option<IpAddr>>, CoreError> {
    use std::net::ToSocketAddrs;

    let addrs = (hostname, 0u16).to_socket_addrs().map_err(|e| CoreError::Internal {
        code: e.raw_os_error().map(|c| c.to_string()),
        message: e.to_string(),
    })?;
    Ok(addrs
        .map(|a| a.ip())
        .filter(|ip| family.matches(ip))
        .map(Some)
        .collect())
}
