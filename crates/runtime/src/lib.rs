//! The toolmesh edge runtime.
//!
//! Bridges tool providers (MCP servers, smart skills) and tool consumers
//! (MCP clients over stdio / SSE / streamable HTTP) across the central bus:
//!
//! - the [`reconcile::Reconciler`] materializes bus-delivered desired state
//!   into running provider and skill instances,
//! - the [`dispatch::Dispatcher`] owns the per-tool subscription table and
//!   answers incoming call-tool requests,
//! - the [`sessions::SessionManager`] hosts consumer sessions with per-
//!   transport lifecycles and per-session toolset views.

pub mod dispatch;
pub mod heartbeat;
pub mod http;
pub mod identity;
pub mod reconcile;
pub mod sessions;
pub mod state;
pub mod view;
