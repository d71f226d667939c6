use std::fmt;

/// Lifecycle state of a request context.
///
/// ```text
/// Sync ──handler returns──▶ Idle ◀──step done──┐
///   │                        │                 │
///   └────run_async──────────▶ Async ───────────┘
///                              │ upgrade
///                              ▼
///                          WebSocket
/// ```
///
/// `Zombie` is entered from `Async` or `WebSocket` when the connection goes
/// away while a step is still running; the context is freed by that step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    /// The handler runs inline on the dispatcher thread.
    Sync,
    /// No step is running, the dispatcher owns the connection.
    Idle,
    /// A step runs on the worker pool, the connection is suspended.
    Async,
    /// Upgraded connection, bytes move unframed.
    WebSocket,
    /// The connection is gone, waiting for the running step to return.
    Zombie,
}

impl IoState {
    /// True while a step owns the context.
    #[inline]
    pub fn is_async(self) -> bool {
        matches!(self, Self::Async | Self::WebSocket)
    }
}

impl fmt::Display for IoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sync => "sync",
            Self::Idle => "idle",
            Self::Async => "async",
            Self::WebSocket => "websocket",
            Self::Zombie => "zombie",
        };
        f.write_str(name)
    }
}
