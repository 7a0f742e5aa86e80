//! Post cache: binary bodies the UI fetches through `ipc://post?id=<id>`, because
//! large or binary payloads cannot be injected as script text.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// How long a stored post stays fetchable.
pub const POST_TTL: Duration = Duration::from_millis(32 * 1024);

/// A cached payload awaiting retrieval by the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Post {
    /// 0 means "assign one on create".
    pub id: u64,
    pub body: Option<Vec<u8>>,
    /// Raw `Name: value` lines.
    pub headers: String,
    /// Expiry, milliseconds since the Unix epoch. Stamped by [`PostCache::put`].
    pub ttl: u64,
}

impl Post {
    pub fn new(body: impl Into<Vec<u8>>, headers: impl Into<String>) -> Self {
        Self {
            id: 0,
            body: Some(body.into()),
            headers: headers.into(),
            ttl: 0,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn body_len(&self) -> usize {
        self.body.as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.ttl < now_ms
    }
}

/// id → post, guarded by one map-wide lock. Removing an entry drops its body under the
/// same lock, so no reader can see an entry whose body is gone.
#[derive(Debug, Default)]
pub struct PostCache {
    posts: Mutex<HashMap<u64, Post>>,
}

impl PostCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `post` and return the script that fetches it and emits a `data` event
    /// with `params` (a JSON object) merged with `seq`.
    pub fn create(&self, seq: &str, params: &str, mut post: Post) -> String {
        if post.id == 0 {
            post.id = random_id();
        }
        let script = post_script(seq, params, post.id, &post.headers);
        self.put(post.id, post);
        script
    }

    pub fn get(&self, id: u64) -> Option<Post> {
        self.lock().get(&id).cloned()
    }

    pub fn has(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    /// Insert or overwrite; the entry expires [`POST_TTL`] from now.
    pub fn put(&self, id: u64, post: Post) {
        self.put_at(id, post, now_ms());
    }

    pub(crate) fn put_at(&self, id: u64, mut post: Post, now_ms: u64) {
        post.id = id;
        post.ttl = now_ms.saturating_add(POST_TTL.as_millis() as u64);
        self.lock().insert(id, post);
    }

    /// Erase the entry and release its body. Returns false if there was none.
    pub fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Erase the entry and hand its body to the caller.
    pub fn take(&self, id: u64) -> Option<Post> {
        self.lock().remove(&id)
    }

    pub fn remove_all(&self) -> usize {
        let mut posts = self.lock();
        let n = posts.len();
        posts.clear();
        n
    }

    /// Drop every entry whose TTL has passed. Reads never expire entries.
    pub fn expire(&self) -> usize {
        self.expire_at(now_ms())
    }

    pub(crate) fn expire_at(&self, now_ms: u64) -> usize {
        let mut posts = self.lock();
        let before = posts.len();
        posts.retain(|_, post| !post.is_expired_at(now_ms));
        let expired = before - posts.len();
        if expired > 0 {
            debug!(expired, remaining = posts.len(), "expired posts");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Post>> {
        self.posts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn random_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// JS string literal for `s`.
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| String::from("\"\""))
}

fn post_script(seq: &str, params: &str, id: u64, headers: &str) -> String {
    let sid = id.to_string();
    format!(
        r#";(() => {{
  const xhr = new XMLHttpRequest();
  xhr.responseType = 'arraybuffer';
  xhr.onload = e => {{
    const raw = {params};
    let o = {{}};
    try {{ o = JSON.parse(raw) }} catch (err) {{
      console.error(err.stack || err, raw)
    }};
    o.seq = {seq};
    const headers = {headers}
      .trim().split(/[\r\n]+/).filter(Boolean);
    const detail = {{
      data: xhr.response,
      sid: '{sid}',
      headers: Object.fromEntries(
        headers.map(l => l.split(/\s*:\s*/))
      ),
      params: o
    }};
    queueMicrotask(() => window._ipc.emit('data', detail));
  }};
  xhr.open('GET', 'ipc://post?id={sid}');
  xhr.send();
}})();
//# sourceURL=post.js"#,
        params = js_string(params),
        seq = js_string(seq),
        headers = js_string(headers.trim()),
        sid = sid,
    )
}
