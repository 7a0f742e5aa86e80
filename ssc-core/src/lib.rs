//! Native runtime core for a webview application shell.
//! One loop thread owns every socket and resolver; the UI talks to it through
//! sequence-numbered requests answered with JSON envelopes or post fetch scripts.

pub mod config;
pub mod core;
pub mod descriptors;
pub mod dns;
pub mod event_loop;
pub mod ffi;
pub mod interfaces;
pub mod ipc;
pub mod peer;
pub mod post;
pub mod protocol;

pub use crate::config::CoreConfig;
pub use crate::core::Core;
pub use crate::event_loop::{Dispatcher, EventLoop, LoopContext, LoopError, LoopThread};
pub use crate::ipc::{Request, RequestError};
pub use crate::peer::{BufferDirection, Peer, PeerRegistry, PeerState};
pub use crate::post::{Post, PostCache, POST_TTL};
pub use crate::protocol::{Callback, CoreError, Envelope, ErrorBody, PendingRequest, Response};
