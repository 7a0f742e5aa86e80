//! Network interface enumeration, grouped by address family.

use std::net::IpAddr;

use serde_json::{json, Map, Value};

use crate::protocol::{CoreError, Envelope};

pub const SOURCE: &str = "os.networkInterfaces";

/// One address assigned to one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub name: String,
    pub address: IpAddr,
    /// Hardware address as `aa:bb:cc:dd:ee:ff`; all zeros when unknown.
    pub mac: String,
    pub internal: bool,
}

const NO_MAC: &str = "00:00:00:00:00:00";

/// Enumerate interfaces and build the `os.networkInterfaces` envelope.
pub fn network_interfaces() -> Envelope {
    match list() {
        Ok(addrs) => Envelope::data(SOURCE, interfaces_json(&addrs)),
        Err(e) => {
            tracing::warn!(error = %e, "interface enumeration failed");
            Envelope::error(
                SOURCE,
                None,
                &CoreError::Internal {
                    code: e.code().map(str::to_string),
                    message: "unable to get interfaces".to_string(),
                },
            )
        }
    }
}

/// `{ ipv4: { name: {address, mac, internal}, local }, ipv6: { ..., local } }`.
/// A later address on the same interface and family replaces an earlier one.
pub fn interfaces_json(addrs: &[InterfaceAddress]) -> Value {
    let mut v4 = Map::new();
    let mut v6 = Map::new();
    for a in addrs {
        let entry = json!({
            "address": a.address.to_string(),
            "mac": a.mac,
            "internal": a.internal,
        });
        match a.address {
            IpAddr::V4(_) => v4.insert(a.name.clone(), entry),
            IpAddr::V6(_) => v6.insert(a.name.clone(), entry),
        };
    }
    v4.insert("local".into(), Value::from("0.0.0.0"));
    v6.insert("local".into(), Value::from("::1"));
    json!({ "ipv4": v4, "ipv6": v6 })
}

fn format_mac(bytes: &[u8]) -> String {
    if bytes.len() < 6 {
        return NO_MAC.to_string();
    }
    bytes[..6]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(unix)]
pub fn list() -> Result<Vec<InterfaceAddress>, CoreError> {
    use std::collections::HashMap;
    use std::ffi::CStr;
    use std::net::{Ipv4Addr, Ipv6Addr};

    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(CoreError::os(&std::io::Error::last_os_error()));
    }

    let mut macs: HashMap<String, String> = HashMap::new();
    let mut addrs = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        let ifa = unsafe { &*cursor };
        cursor = ifa.ifa_next;
        if ifa.ifa_addr.is_null() || ifa.ifa_name.is_null() {
            continue;
        }
        let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
            .to_string_lossy()
            .into_owned();
        let internal = ifa.ifa_flags & (libc::IFF_LOOPBACK as libc::c_uint) != 0;
        let family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;
        let address = match family {
            libc::AF_INET => {
                let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
                IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in6) };
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr))
            }
            _ => {
                if let Some(mac) = unsafe { link_mac(ifa.ifa_addr) } {
                    macs.insert(name, mac);
                }
                continue;
            }
        };
        addrs.push(InterfaceAddress {
            name,
            address,
            mac: NO_MAC.to_string(),
            internal,
        });
    }
    unsafe { libc::freeifaddrs(head) };

    for a in &mut addrs {
        if let Some(mac) = macs.get(&a.name) {
            a.mac = mac.clone();
        }
    }
    Ok(addrs)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn link_mac(addr: *const libc::sockaddr) -> Option<String> {
    if (*addr).sa_family as libc::c_int != libc::AF_PACKET {
        return None;
    }
    let ll = &*(addr as *const libc::sockaddr_ll);
    let len = (ll.sll_halen as usize).min(ll.sll_addr.len());
    Some(format_mac(&ll.sll_addr[..len]))
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
unsafe fn link_mac(addr: *const libc::sockaddr) -> Option<String> {
    if (*addr).sa_family as libc::c_int != libc::AF_LINK {
        return None;
    }
    let dl = &*(addr as *const libc::sockaddr_dl);
    let start = dl.sdl_nlen as usize;
    let len = dl.sdl_alen as usize;
    let data = std::slice::from_raw_parts(dl.sdl_data.as_ptr() as *const u8, start + len);
    Some(format_mac(&data[start..]))
}

#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    ))
))]
unsafe fn link_mac(_addr: *const libc::sockaddr) -> Option<String> {
    None
}

#[cfg(not(unix))]
pub fn list() -> Result<Vec<InterfaceAddress>, CoreError> {
    Err(CoreError::Internal {
        code: None,
        message: "interface enumeration is not supported on this platform".into(),
    })
}
