//! # onemux-proxy
//!
//! The proxy engine: one inbound OneBot client socket multiplexed onto N
//! downstream target sockets.
//!
//! - Events fan out to every enabled target (Sakoya targets skip lifecycle
//!   chatter).
//! - Echoed frames route to the single target that issued the echo,
//!   correlated through [`echo::EchoCache`].
//! - Sakoya targets get bidirectional dialect translation plus quoted-reply
//!   enrichment backed by [`reply::ReplyCache`].
//! - Every target slot reconnects independently; the client socket is the
//!   session's lifeline.

pub mod connection;
pub mod echo;
pub mod reply;
pub mod router;
pub mod target;

pub use connection::ProxyConnection;
pub use echo::{EchoCache, EchoEntry};
pub use reply::ReplyCache;
pub use router::ProxyRouter;
pub use target::{PROPAGATED_HEADERS, RecvOutcome, TargetReader, TargetWriter, dial};
