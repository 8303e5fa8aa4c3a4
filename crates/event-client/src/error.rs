/// Result type for the event client.
pub type Result<T> = std::result::Result<T, EventClientError>;

/// Errors returned by the [`Dispatcher`] and [`Client`].
///
/// [`Dispatcher`]: crate::dispatcher::Dispatcher
/// [`Client`]: crate::client::Client
#[derive(thiserror::Error, Debug)]
pub enum EventClientError {
    /// The dispatcher was submitted an event before [`Dispatcher::start`]
    /// was called, or after it stopped.
    ///
    /// [`Dispatcher::start`]: crate::dispatcher::Dispatcher::start
    #[error("dispatcher is not in the started state")]
    DispatcherNotStarted,

    /// [`Dispatcher::start`] was called more than once.
    ///
    /// [`Dispatcher::start`]: crate::dispatcher::Dispatcher::start
    #[error("dispatcher is not in the initial state")]
    DispatcherNotInitial,

    /// The event client was closed.
    #[error("event client is closed")]
    ClientClosed,

    /// `connect` was called from a connection state other than
    /// `Disconnected`.
    #[error("unable to connect from state [{0}]")]
    InvalidConnectState(&'static str),

    /// The client was constructed with `permit_block_events = false`.
    #[error("block events are not permitted")]
    BlockEventsNotPermitted,

    /// A transaction-status or chaincode registration was attempted for a
    /// key that is already registered.
    #[error("registration already exists")]
    DuplicateRegistration,

    /// A chaincode registration's event-name filter failed to compile as a
    /// regular expression.
    #[error("invalid chaincode event filter: {0}")]
    InvalidFilter(#[from] regex::Error),

    /// `unregister` was called with a handle the dispatcher does not
    /// recognize, most likely because it was already unregistered.
    #[error("unknown registration handle")]
    UnknownRegistration,

    /// The transport adapter failed to connect or disconnect.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// `connect_with_retry` exhausted its configured attempt budget.
    #[error("maximum connect attempts exceeded")]
    RetryBudgetExhausted,

    /// The dispatcher's inbox (or a reply channel) was dropped out from
    /// under an in-flight request, which only happens if the dispatcher
    /// task panicked or was stopped concurrently.
    #[error("dispatcher task is gone")]
    DispatcherGone,
}

impl EventClientError {
    /// Wrap a transport adapter's error.
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(err))
    }
}
