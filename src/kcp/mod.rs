//! Reliable UDP: KCP connections with the [mux::Mux] lifecycle protocol on top.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio_kcp::{KcpConfig, KcpNoDelayConfig};

use crate::config::KcpTuning;

pub mod kcp_client;
pub mod kcp_server;
pub mod mux;
pub mod reliable_socket;

/// Stream mode, every write flushed immediately and ACKs sent as soon as input arrives, with
///  retransmit and congestion settings from `tuning`
pub fn kcp_config(tuning: &KcpTuning) -> KcpConfig {
    KcpConfig {
        nodelay: KcpNoDelayConfig {
            nodelay: tuning.nodelay,
            interval: tuning.interval,
            resend: tuning.resend,
            nc: tuning.no_congestion_control,
        },
        flush_write: true,
        flush_acks_input: true,
        stream: true,
        ..KcpConfig::default()
    }
}

/// KCP streams do not expose their local port, so dialed connections report the wildcard address
fn unspecified_local_addr(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kcp_config() {
        let config = kcp_config(&KcpTuning::default());
        assert!(config.stream);
        assert!(config.flush_write);
        assert!(config.flush_acks_input);
        assert!(config.nodelay.nodelay);
        assert_eq!(config.nodelay.interval, 20);
        assert_eq!(config.nodelay.resend, 2);
        assert!(config.nodelay.nc);
    }

    #[test]
    fn test_unspecified_local_addr() {
        assert_eq!(unspecified_local_addr(&"10.0.0.1:5000".parse().unwrap()), "0.0.0.0:0".parse().unwrap());
        assert_eq!(unspecified_local_addr(&"[::1]:5000".parse().unwrap()), "[::]:0".parse().unwrap());
    }
}
