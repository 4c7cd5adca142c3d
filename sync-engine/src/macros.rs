//! Macros for creating and returning [`crate::error::SyncError`]s.

/// Creates a [`crate::error::SyncError`] from a kind, a static description and optional
/// detail and source.
#[macro_export]
macro_rules! sync_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::SyncError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::SyncError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        $crate::error::SyncError::from(($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::SyncError::from(($kind, $desc, $detail.to_string()))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        $crate::error::SyncError::from(($kind, $desc, $detail.to_string())).with_source($source)
    };
}

/// Returns early with a [`crate::error::SyncError`], accepting the same arguments as
/// [`sync_error!`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return ::core::result::Result::Err($crate::sync_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::sync_error!($kind, $desc, source: $source))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        return ::core::result::Result::Err($crate::sync_error!($kind, $desc, detail = $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return ::core::result::Result::Err($crate::sync_error!($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::sync_error!($kind, $desc, $detail, source: $source))
    };
}
