//! A connection-oriented, multi-channel messaging protocol on top of plain UDP sockets.
//!
//! UDP gives us datagrams and nothing else. This crate layers on top of it the things
//!  peer-to-peer applications usually end up reinventing:
//! * *connections* with an explicit handshake, keep-alive probing and timeout-based teardown
//! * multiple logical *channels* per connection, each with its own ordering / reliability
//!   guarantees selected at configuration time:
//!   * unreliable / unsequenced: plain datagrams (channel 0 is always this, and is reserved
//!     for handshake and control traffic)
//!   * unreliable / sequenced: stale or duplicate packets are dropped, gaps are never waited on
//!   * reliable (optionally sequenced): retransmission until acknowledged, duplicate
//!     suppression, and - for sequenced channels - gap-free in-order delivery
//! * a hierarchical *dispatch tree*: every application message is tagged with the signature
//!   (the root-to-leaf path of one-byte ids) of a registered handler, and inbound messages
//!   are routed to that handler's callback
//! * round-trip latency tracking piggy-backed on the keep-alive traffic
//!
//! Explicitly *not* provided: congestion control, encryption, NAT traversal, and
//!  fragmentation of messages exceeding a single datagram.
//!
//! ## Wire format
//!
//! Each UDP datagram carries exactly one message - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0: channel id (u8)
//! 1: sequence index (u32) - present only if the channel requires it, i.e. for all
//!     reliable channels and for sequenced unreliable channels. Channel 0 never
//!     carries a sequence index.
//! *: handler signature (depth bytes) - the path of child ids from the dispatch
//!     tree's root to the target leaf
//! *: payload
//! ```
//!
//! ## Control messages
//!
//! Control traffic travels on channel 0, addressed at handler leaves that the stack
//!  registers before any application handlers:
//!
//! ```ascii
//! connect request:  [no payload]
//! keep-alive:       id (u32), is_response (u8)
//! disconnect:       reason (u8)
//! acknowledgement:  channel id (u8), sequence index (u32)
//! ```
//!
//! A connect request is resent periodically until the peer answers with a connect
//!  request of its own (receiving one for an existing connection is the handshake
//!  acknowledgement). Keep-alives are echoed back with `is_response` set, and the
//!  originator uses the echo to measure round-trip time. Acknowledgements confirm
//!  receipt of one reliable message; the sender retransmits unacknowledged copies
//!  until the acknowledgement arrives or the connection's disconnect timeout expires.
//!
//! ## Threading model
//!
//! Two tasks pump the socket (send and receive), and the connection pool is sharded
//!  across a small set of worker tasks that drive handshakes, keep-alives,
//!  retransmission and channel draining. All application callbacks - message handlers
//!  and connect / disconnect events - are invoked solely from [`host::Host::update`],
//!  so application code never needs to be thread-safe against the workers.

pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod control;
pub mod dispatch;
pub mod encoder;
pub mod host;
pub mod message;
pub mod pump;
pub mod ring_buffer;

mod channel;
mod clock;
mod reliable;
