//! Low-level building blocks for the change archive.

/// Positioned file I/O.
///
/// Read-only handles for sync responders and write handles for the flusher.
pub mod io;
