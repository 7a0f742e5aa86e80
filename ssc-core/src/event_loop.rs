//! Event loop: one thread owns every socket, resolver and timer. Other threads hand it
//! work through a [`Dispatcher`]; work items run one at a time, in submission order per
//! caller thread.

use std::future::Future;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{debug, info, warn};

/// A unit of work executed on the loop thread.
pub type Work = Box<dyn FnOnce(&mut LoopContext) + Send + 'static>;

enum Command {
    Work(Work),
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("failed to initialize event loop: {0}")]
    Init(#[source] std::io::Error),
    #[error("failed to spawn loop thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("event loop is shut down")]
    Closed,
    #[error("event loop thread panicked")]
    Panicked,
}

/// Cloneable, thread-safe handle for scheduling work onto the loop. Never blocks.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Command>,
}

impl Dispatcher {
    /// Queue `work` for the loop thread. If the loop is gone the work is dropped
    /// unexecuted and `LoopError::Closed` is returned.
    pub fn dispatch<F>(&self, work: F) -> Result<(), LoopError>
    where
        F: FnOnce(&mut LoopContext) + Send + 'static,
    {
        self.tx
            .send(Command::Work(Box::new(work)))
            .map_err(|_| LoopError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn request_shutdown(&self) -> bool {
        self.tx.send(Command::Shutdown).is_ok()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Loop-thread state handed to every work item.
pub struct LoopContext {
    /// Request-bound tasks; awaited (up to the grace period) at shutdown.
    tasks: JoinSet<()>,
    /// Open-ended tasks (socket readers, timers); aborted at shutdown.
    daemons: JoinSet<()>,
}

impl LoopContext {
    pub(crate) fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            daemons: JoinSet::new(),
        }
    }

    /// Spawn a task that completes a request. Shutdown waits for it.
    pub fn spawn<F>(&mut self, fut: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(fut)
    }

    /// Spawn a task that runs until aborted. Shutdown aborts it without waiting.
    pub fn spawn_daemon<F>(&mut self, fut: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.daemons.spawn(fut)
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    fn reap(&mut self) {
        while let Some(res) = self.tasks.try_join_next() {
            log_task_result(res);
        }
        while let Some(res) = self.daemons.try_join_next() {
            log_task_result(res);
        }
    }

    async fn finish(&mut self, grace: Duration) {
        self.daemons.shutdown().await;
        if self.tasks.is_empty() {
            return;
        }
        debug!(in_flight = self.tasks.len(), "waiting for in-flight tasks");
        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(grace, async {
            while let Some(res) = tasks.join_next().await {
                log_task_result(res);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "aborting in-flight tasks after grace period"
            );
            // Aborted tasks drop their pending requests, which answer with ERR_LOOP_SHUTDOWN.
            self.tasks.shutdown().await;
        }
    }
}

fn log_task_result(res: Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            warn!(error = %e, "loop task panicked");
        }
    }
}

/// The loop itself. Owned by exactly one thread, which pumps it with [`EventLoop::run_once`]
/// (host-driven) or hands it to [`EventLoop::run`] (headless).
pub struct EventLoop {
    runtime: Runtime,
    rx: mpsc::UnboundedReceiver<Command>,
    cx: LoopContext,
    grace: Duration,
    stopping: bool,
}

impl EventLoop {
    /// Build the loop and its dispatcher. Work dispatched before the loop first runs is
    /// queued and executed on startup.
    pub fn new(grace: Duration) -> Result<(Self, Dispatcher), LoopError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(LoopError::Init)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let event_loop = Self {
            runtime,
            rx,
            cx: LoopContext::new(),
            grace,
            stopping: false,
        };
        Ok((event_loop, Dispatcher { tx }))
    }

    /// Run every queued work item, let ready tasks make progress once, and return the
    /// number of work items executed.
    pub fn run_once(&mut self) -> usize {
        let Self {
            runtime,
            rx,
            cx,
            stopping,
            ..
        } = self;
        runtime.block_on(async {
            let mut ran = 0;
            while let Ok(cmd) = rx.try_recv() {
                match cmd {
                    Command::Work(work) => {
                        work(cx);
                        ran += 1;
                    }
                    Command::Shutdown => *stopping = true,
                }
            }
            tokio::task::yield_now().await;
            cx.reap();
            ran
        })
    }

    /// True once a shutdown has been requested through [`LoopThread`] or the channel closed.
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Run until shutdown is requested or every dispatcher is dropped, then drain.
    pub fn run(self) {
        let Self {
            runtime,
            mut rx,
            mut cx,
            grace,
            ..
        } = self;
        info!("event loop started");
        runtime.block_on(async move {
            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(Command::Work(work)) => work(&mut cx),
                        Some(Command::Shutdown) | None => break,
                    },
                    Some(res) = cx.tasks.join_next() => log_task_result(res),
                    Some(res) = cx.daemons.join_next() => log_task_result(res),
                }
            }
            drain(&mut rx, &mut cx, grace).await;
        });
        info!("event loop stopped");
    }

    /// Drain queued work and in-flight tasks, then release the loop.
    pub fn shutdown(self) {
        let Self {
            runtime,
            mut rx,
            mut cx,
            grace,
            ..
        } = self;
        runtime.block_on(drain(&mut rx, &mut cx, grace));
        info!("event loop stopped");
    }
}

/// Close the queue, run everything already in it, then finish in-flight tasks.
async fn drain(rx: &mut mpsc::UnboundedReceiver<Command>, cx: &mut LoopContext, grace: Duration) {
    rx.close();
    let mut ran = 0usize;
    while let Ok(cmd) = rx.try_recv() {
        if let Command::Work(work) = cmd {
            work(cx);
            ran += 1;
        }
    }
    if ran > 0 {
        debug!(ran, "drained queued work at shutdown");
    }
    cx.finish(grace).await;
}

/// A loop running on its own dedicated thread for the process lifetime.
pub struct LoopThread {
    dispatcher: Dispatcher,
    handle: Option<JoinHandle<()>>,
}

impl LoopThread {
    /// Start the loop thread. Fails if the loop cannot be initialized; there is no
    /// degraded mode.
    pub fn spawn(name: &str, grace: Duration) -> Result<Self, LoopError> {
        let (event_loop, dispatcher) = EventLoop::new(grace)?;
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || event_loop.run())
            .map_err(LoopError::Spawn)?;
        Ok(Self {
            dispatcher,
            handle: Some(handle),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Request shutdown and wait for the loop to drain and exit.
    pub fn shutdown(mut self) -> Result<(), LoopError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), LoopError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.dispatcher.request_shutdown();
        handle.join().map_err(|_| LoopError::Panicked)
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "loop thread did not stop cleanly");
        }
    }
}
