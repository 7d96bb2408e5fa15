//! Sandboxed code execution.
//!
//! ## Module Map
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `snapshot`    | Materialize a project's files into an ephemeral dir     |
//! | `sandbox`     | `SandboxRunner` trait + Docker implementation           |
//! | `manager`     | Drives the record lifecycle and broadcasts transitions  |
//!
//! An execution request creates a record in `pending`, moves it to `running`
//! (broadcast), runs the command in a disposable container working on a
//! snapshot of the project's files under a hard wall-clock timeout, then
//! lands the record in exactly one terminal state (broadcast again). Every
//! sandbox failure — launch error, timeout, vanished container — becomes a
//! `failed` record rather than an error to the caller, and the snapshot
//! directory is removed on every exit path.

pub mod manager;
pub mod sandbox;
pub mod snapshot;
