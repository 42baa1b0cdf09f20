use crate::proxy::ProxyError;
use crate::vm::service::RpcError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    // --------------------------------- client protocol errors ------------------------------------
    #[error("initialize request must be sent before `{0}`")]
    NotInitialized(String),
    #[error("Unsupported DAP command: {0}")]
    UnsupportedCommand(String),
    #[error("invalid arguments for `{0}`: {1}")]
    InvalidArguments(String, serde_json::Error),
    #[error("a debug session is already started")]
    AlreadyStarted,
    #[error("unable to find thread {0}")]
    ThreadNotFound(i64),
    #[error("thread {0} is not paused")]
    ThreadNotPaused(i64),
    #[error("Global evaluation not currently supported")]
    NoFrame,
    #[error("no exception available")]
    NoException,
    #[error("debugger is not connected")]
    NotConnected,

    // --------------------------------- reference errors ------------------------------------------
    #[error("reference {0} is no longer valid, the thread may have resumed")]
    StaleReference(i64),
    #[error("reference {0} does not point to a {1}")]
    UnexpectedReference(i64, &'static str),

    // --------------------------------- runtime errors --------------------------------------------
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("{0}")]
    Evaluation(String),
    #[error("source not available")]
    SourceNotAvailable,
    #[error("unable to map `{0}` to a script uri")]
    InvalidSourcePath(String),

    // --------------------------------- connection errors -----------------------------------------
    #[error("connect to vm service at {0}: {1}")]
    Connect(String, RpcError),
    #[error("invalid vm service uri `{0}`")]
    InvalidUri(String),
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    // --------------------------------- launch errors ---------------------------------------------
    #[error("launch: {0}")]
    Launch(String),
}

impl Error {
    /// Return a hint to the session - continue serving requests after error or stop whole session.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::Json(_) => false,
            Error::NotInitialized(_) => false,
            Error::UnsupportedCommand(_) => false,
            Error::InvalidArguments(_, _) => false,
            Error::AlreadyStarted => false,
            Error::ThreadNotFound(_) => false,
            Error::ThreadNotPaused(_) => false,
            Error::NoFrame => false,
            Error::NoException => false,
            Error::NotConnected => false,
            Error::StaleReference(_) => false,
            Error::UnexpectedReference(_, _) => false,
            Error::Rpc(_) => false,
            Error::Evaluation(_) => false,
            Error::SourceNotAvailable => false,
            Error::InvalidSourcePath(_) => false,

            // session can't continue without a runtime connection
            Error::Connect(_, _) => true,
            Error::InvalidUri(_) => true,
            Error::Proxy(_) => true,
            Error::Launch(_) => true,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "dap", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "dap", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
