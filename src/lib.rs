//! Redundant multipath IP-over-UDP tunnel.
//!
//! One TUN device is bridged to a set of UDP paths: every IP packet read
//! from the TUN is duplicated to all known remote peers, and the receive
//! side suppresses the redundant copies arriving over parallel paths.
//! Traffic survives as long as any single path does. The wire is cleartext
//! IP-in-UDP with no framing.

/// Content-addressed suppression of redundant packet copies.
pub mod dedup;
/// Remote peers and the grow-only table that tracks them.
pub mod endpoint;
/// Role setup and the forwarding loop.
pub mod engine;
/// TUN device contract and Linux implementation.
pub mod tun;
