//! Execution core of a heterogeneous compute runtime.
//!
//! Tasks declare the memory addresses they read and write. The runtime turns
//! those declarations into a directed acyclic graph, dispatches ready nodes
//! across a work-stealing thread pool, and folds asynchronous accelerator
//! completions back into the graph. It:
//! - Derives read-after-write, write-after-read and write-after-write edges
//!   from a sharded hazard tracker, so producers never wire dependencies by
//!   hand (explicit edges are still accepted).
//! - Dispatches a node the moment its last predecessor completes, from
//!   whichever worker observed that completion; idle workers steal.
//! - Splits large data-parallel range nodes on demand when a worker would
//!   otherwise go idle.
//! - Polls backend completion handles with an adaptive backoff instead of
//!   parking worker threads.
//! - Provides a lock-free fixed-slot pool allocator over any [`memory::Allocator`].
//!
//! Key modules:
//! - `config`: binds a concrete backend via the `Config` trait and holds the
//!   runtime tunables.
//! - `backend`: the contract accelerator backends implement.
//! - `graph`: the per-generation graph builder and its completion signal.
//! - `hazard`: address-to-edge resolution.
//! - `scheduler`: the worker pool.
//! - `memory`: allocator contract, a host allocator and the bitmask pool.
//! - `runtime`: ties the scheduler and the tracker together.
//!
//! Quick start:
//! 1. Implement `Config` with your `Backend` type (or use
//!    [`backend::InlineBackend`]).
//! 2. Create a [`runtime::Runtime`] and obtain a graph builder with
//!    `Runtime::graph`.
//! 3. Add nodes with their read/write sets, call `TaskGraph::execute` and
//!    wait on the returned `GraphCompletion`.
//!
//! Within one runtime, a node only starts after every conflicting access
//! registered before it, including accesses of earlier generations that are
//! still in flight, has completed.

/// Accelerator backend contract.
///
/// Defines `Backend` (kernel submission), `CompletionEvent` (non-blocking
/// completion queries), and the in-process `InlineBackend` plus the
/// manually triggered `Signal` event.
pub mod backend;
/// Public interface to configure the runtime.
///
/// Exposes the `Config` trait binding the backend for a concrete
/// instantiation, and `RuntimeConfig` with the value-level tunables.
pub mod config;
/// Task graph construction.
///
/// `TaskGraph` wires nodes as they are added and submits a whole generation
/// at once; `GraphCompletion` fires when that generation has drained.
pub mod graph;
/// Sharded registry converting read/write declarations into graph edges.
pub mod hazard;
/// Allocator contract, host allocator and the lock-free bitmask pool.
pub mod memory;
/// Graph nodes and the lock-free successor lists linking them.
pub mod node;
/// Scheduler and hazard tracker bundled behind one handle.
pub mod runtime;
/// The work-stealing worker pool and its completion reconciler.
pub mod scheduler;
/// Intrusive reference counting.
///
/// `Shared` is a nullable handle over any `RefCounted` type; `Counted` adds
/// an embedded count to an arbitrary value.
pub mod shared;
mod sync;
/// Units of work and per-task profiling metadata.
pub mod task;
/// Common aliases, device identities, and the `SyncUnsafeCell` primitive
/// used internally.
pub mod types;
mod utils;
