use std::time::Duration;

use anyhow::bail;

/// Settings shared by all transports. A server or client takes an `Arc<SocketConfig>` and hands it
///  to every socket or session it creates.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Size of the pooled buffers that stream reads go into. A framed message may be bigger
    ///  than this, the read side accumulates until the framing callback can consume it.
    pub read_buffer_size: usize,

    /// This is the number of buffers that are kept for reuse at a given time - buffers in excess of
    ///  this number are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// Deadline for each individual read. A connection that is silent for this long is considered
    ///  dead and its read loop terminates.
    pub read_timeout: Duration,
    /// Deadline for each individual write attempt
    pub write_timeout: Duration,

    /// Capacity of a stream socket's outbound queue. `send_msg` fails with `Overflow` when it is
    ///  full rather than blocking the caller.
    pub write_queue_limit: usize,

    /// Capacity of the outbound datagram queue of a physical UDP socket. This queue is shared by
    ///  all sessions on the socket, so it is typically a multiple of `write_queue_limit`.
    pub udp_write_queue_limit: usize,

    /// Receive buffer size for a single datagram; longer datagrams are truncated by the OS. With
    ///  full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472` for IPV4.
    pub max_datagram_size: usize,

    /// Capacity of a UDP session's inbound queue
    pub udp_session_queue_limit: usize,

    /// Period of the sweep that reclaims idle UDP sessions
    pub udp_check_interval: Duration,

    /// A UDP session that did not receive a datagram for this many (wall clock) seconds is
    ///  closed by the next sweep. This is the only way a UDP session ends on its own.
    pub udp_session_timeout_secs: u64,

    /// Run the handshake / teardown protocol on reliable UDP connections. If this is switched off,
    ///  frames go over the wire without a control prefix and connections are usable immediately.
    pub kcp_inline: bool,
    pub kcp_handshake_timeout: Duration,
    pub kcp_teardown_timeout: Duration,
    pub kcp_tuning: KcpTuning,

    /// Only WebSocket upgrade requests for this path are accepted
    pub websocket_path: String,
    pub websocket_max_message_size: usize,
}

/// Low-latency profile for the ARQ engine: no delayed ACKs, fast retransmit after `resend`
///  duplicate ACKs, and congestion control switched off (`no_congestion_control`).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KcpTuning {
    pub nodelay: bool,
    /// internal update interval in milliseconds
    pub interval: i32,
    pub resend: i32,
    pub no_congestion_control: bool,
}

impl Default for KcpTuning {
    fn default() -> Self {
        KcpTuning {
            nodelay: true,
            interval: 20,
            resend: 2,
            no_congestion_control: true,
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            read_buffer_size: 1024,
            buffer_pool_size: 4096,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            write_queue_limit: 200,
            udp_write_queue_limit: 2000,
            max_datagram_size: 1472,
            udp_session_queue_limit: 1024,
            udp_check_interval: Duration::from_secs(3),
            udp_session_timeout_secs: 10,
            kcp_inline: true,
            kcp_handshake_timeout: Duration::from_millis(300),
            kcp_teardown_timeout: Duration::from_millis(300),
            kcp_tuning: KcpTuning::default(),
            websocket_path: "/".to_string(),
            websocket_max_message_size: 2048,
        }
    }
}

impl SocketConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_buffer_size == 0 {
            bail!("read buffer size must not be 0");
        }
        if self.max_datagram_size == 0 {
            bail!("max datagram size must not be 0");
        }
        if self.write_queue_limit == 0 || self.udp_write_queue_limit == 0 || self.udp_session_queue_limit == 0 {
            bail!("queue limits must not be 0");
        }
        if self.udp_check_interval.is_zero() {
            bail!("UDP check interval must not be 0");
        }
        if self.udp_session_timeout_secs == 0 {
            bail!("UDP session timeout must not be 0");
        }
        if self.kcp_tuning.interval <= 0 {
            bail!("KCP update interval must be positive");
        }
        if !self.websocket_path.starts_with('/') {
            bail!("WebSocket path must start with '/': {:?}", self.websocket_path);
        }
        if self.websocket_max_message_size == 0 {
            bail!("WebSocket max message size must not be 0");
        }
        Ok(())
    }
}
