// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Crate-wide error codes. Every fallible operation returns `Result<T>` with
// one of these codes; the C ABI maps them to the negative i32 values below,
// and the rendezvous wire protocol carries them as an i16 in the link header.

use std::cell::RefCell;

/// Error taxonomy shared by the store, the transports and the transfer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrCode {
    #[error("error")]
    Error,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("allocation failed")]
    MallocFailed,
    #[error("cannot construct object")]
    NewObjectFailed,
    #[error("provider call failed")]
    DlFunctionFailed,
    #[error("not initialized")]
    NotInitialized,
    #[error("address already in use")]
    ResourceInUse,
    #[error("object not exists")]
    ObjectNotExists,
    #[error("not supported")]
    NotSupported,
    #[error("repeated call")]
    RepeatCall,
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid key")]
    InvalidKey,
    #[error("key not exists")]
    NotExist,
    #[error("timeout")]
    Timeout,
    #[error("socket error")]
    IoError,
    #[error("restore")]
    Restore,
}

pub type Result<T> = std::result::Result<T, ErrCode>;

impl ErrCode {
    /// Stable numeric code, as returned through the C ABI and placed in the
    /// `result` field of reply frames.
    pub fn code(self) -> i32 {
        match self {
            ErrCode::Error => -1,
            ErrCode::InvalidParam => -2,
            ErrCode::MallocFailed => -3,
            ErrCode::NewObjectFailed => -4,
            ErrCode::DlFunctionFailed => -5,
            ErrCode::NotInitialized => -6,
            ErrCode::ResourceInUse => -7,
            ErrCode::ObjectNotExists => -8,
            ErrCode::NotSupported => -9,
            ErrCode::RepeatCall => -10,
            ErrCode::InvalidMessage => -400,
            ErrCode::InvalidKey => -401,
            ErrCode::NotExist => -404,
            ErrCode::Timeout => -601,
            ErrCode::IoError => -602,
            ErrCode::Restore => -603,
        }
    }

    /// Inverse of [`code`](Self::code) for values received off the wire.
    /// Unknown nonzero values collapse to `Error`.
    pub fn from_code(code: i32) -> Option<ErrCode> {
        match code {
            0 => None,
            -2 => Some(ErrCode::InvalidParam),
            -3 => Some(ErrCode::MallocFailed),
            -4 => Some(ErrCode::NewObjectFailed),
            -5 => Some(ErrCode::DlFunctionFailed),
            -6 => Some(ErrCode::NotInitialized),
            -7 => Some(ErrCode::ResourceInUse),
            -8 => Some(ErrCode::ObjectNotExists),
            -9 => Some(ErrCode::NotSupported),
            -10 => Some(ErrCode::RepeatCall),
            -400 => Some(ErrCode::InvalidMessage),
            -401 => Some(ErrCode::InvalidKey),
            -404 => Some(ErrCode::NotExist),
            -601 => Some(ErrCode::Timeout),
            -602 => Some(ErrCode::IoError),
            -603 => Some(ErrCode::Restore),
            _ => Some(ErrCode::Error),
        }
    }

    /// Convert a result-or-unit into the C convention (0 on success).
    pub fn to_c<T>(result: Result<T>) -> i32 {
        match result {
            Ok(_) => 0,
            Err(e) => e.code(),
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Record the last error text for the calling thread (read back by C callers
/// through `smem_trans_last_error`).
pub fn set_last_error(text: impl Into<String>) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = text.into());
}

/// Fetch the last error text recorded on the calling thread.
pub fn last_error() -> String {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Human-readable description for a numeric code.
pub fn error_string(code: i32) -> &'static str {
    match ErrCode::from_code(code) {
        None => "success",
        Some(ErrCode::InvalidParam) => "invalid parameter",
        Some(ErrCode::MallocFailed) => "allocation failed",
        Some(ErrCode::NewObjectFailed) => "cannot construct object",
        Some(ErrCode::DlFunctionFailed) => "provider call failed",
        Some(ErrCode::NotInitialized) => "not initialized",
        Some(ErrCode::ResourceInUse) => "address already in use",
        Some(ErrCode::ObjectNotExists) => "object not exists",
        Some(ErrCode::NotSupported) => "not supported",
        Some(ErrCode::RepeatCall) => "repeated call",
        Some(ErrCode::InvalidMessage) => "invalid message",
        Some(ErrCode::InvalidKey) => "invalid key",
        Some(ErrCode::NotExist) => "key not exists",
        Some(ErrCode::Timeout) => "timeout",
        Some(ErrCode::IoError) => "socket error",
        Some(ErrCode::Restore) => "restore",
        Some(ErrCode::Error) => "error",
    }
}
