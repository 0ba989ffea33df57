//! Connection pooling for control-plane calls.
//!
//! A [`PooledChannel`] is lent to one call at a time and goes back to its
//! [`ChannelPool`] when dropped, whatever the call's outcome.

mod channel;

pub use channel::{ChannelPool, PooledChannel};
