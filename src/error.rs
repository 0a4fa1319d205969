use crate::bridge::lifecycle::BackendFamily;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("label contains an interior NUL byte: {0:?}")]
    InteriorNul(String),

    #[error("separator at {path:?} has children")]
    SeparatorWithChildren { path: Vec<usize> },

    #[error("checkable item {label:?} has children")]
    CheckableWithChildren { label: String },

    #[error("menu nesting exceeds {max} levels")]
    TooDeep { max: usize },

    #[error("failed to materialize icon: {0}")]
    Icon(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{family} tray failed to initialize: {reason}")]
    Init { family: BackendFamily, reason: String },

    #[error("{family} lifecycle permit not acquired within {waited:?}")]
    LifecycleBusy { family: BackendFamily, waited: Duration },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("{family} loop thread did not exit within {waited:?}")]
    DisposeTimeout { family: BackendFamily, waited: Duration },

    #[error("{family} tray has been disposed")]
    Disposed { family: BackendFamily },

    #[error("no native tray library for {family} (tried {tried})")]
    LibraryNotFound { family: BackendFamily, tried: String },

    #[error("{path:?} does not export {symbol}")]
    MissingSymbol { path: PathBuf, symbol: String },
}

impl BridgeError {
    pub(crate) fn init(family: BackendFamily, reason: impl Into<String>) -> Self {
        BridgeError::Init { family, reason: reason.into() }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
