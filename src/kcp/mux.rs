//! Connection lifecycle on top of a reliable, ordered byte stream that has no notion of
//!  "connected" or "closed" of its own.
//!
//! Every frame starts with a one byte flag:
//!
//! ```ascii
//! 0: flag (u8) - 0 for data, 1 for control
//! data:    1: application bytes, passed through unchanged
//! control: 1: state of the sender (i32 LE)
//! ```
//!
//! Control frames drive a TCP style handshake (SynSent / SynRcvd / Established) and teardown
//!  (FinWait1 / CloseWait / LastAck / FinWait2 / TimeWait, plus Closing for simultaneous close).
//!  The state is an atomic integer, and every transition is a compare-and-swap, so an inbound
//!  control frame racing with a local `close()` always ends up in exactly one consistent state.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::SocketError;
use crate::handler::{MessageHandler, Socket};
use crate::signal::Signal;
use crate::stream_socket::{Framing, StreamEndpoint};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum MuxState {
    SynSent = -2,
    Listen = -1,
    SynRcvd = 0,
    Established = 1,
    FinWait1 = 2,
    CloseWait = 3,
    FinWait2 = 4,
    TimeWait = 5,
    LastAck = 6,
    Closing = 7,
}

impl MuxState {
    fn is_tearing_down(self) -> bool {
        matches!(self,
            MuxState::FinWait1 | MuxState::FinWait2 | MuxState::CloseWait | MuxState::LastAck
            | MuxState::Closing | MuxState::TimeWait)
    }
}

const FLAG_DATA: u8 = 0;
const FLAG_CONTROL: u8 = 1;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Completion {
    Handshake,
    /// teardown is done, the read loop ends
    Teardown,
}

/// Reaction to a control frame: each step moves to a new state and optionally replies with a
///  control frame carrying that state
#[derive(Debug, Eq, PartialEq)]
struct Transition {
    steps: &'static [(MuxState, bool)],
    completion: Option<Completion>,
}

fn transition(current: MuxState, received: MuxState) -> Option<Transition> {
    use MuxState::*;

    let (steps, completion): (&'static [(MuxState, bool)], _) = match (current, received) {
        (Listen, SynSent) => (&[(SynRcvd, true)], None),
        (SynSent, SynRcvd) => (&[(Established, true)], Some(Completion::Handshake)),
        (SynRcvd, Established) => (&[(Established, false)], Some(Completion::Handshake)),

        // the passive side passes through CloseWait without waiting for its own application
        (Established, FinWait1) => (&[(CloseWait, true), (LastAck, true)], None),
        (FinWait1, CloseWait) => (&[(FinWait2, false)], None),
        (FinWait2, LastAck) => (&[(TimeWait, true)], Some(Completion::Teardown)),
        (LastAck, TimeWait) => (&[(TimeWait, false)], Some(Completion::Teardown)),

        (FinWait1, FinWait1) => (&[(Closing, true)], None),
        (Closing, Closing) => (&[(TimeWait, true)], None),
        (TimeWait, TimeWait) => (&[], Some(Completion::Teardown)),

        _ => return None,
    };
    Some(Transition { steps, completion })
}

pub struct Mux {
    inline: bool,
    state: AtomicI32,
    syn_sent: AtomicBool,
    handshake_done: Signal,
    teardown_done: Signal,
    handshake_timeout: Duration,
    teardown_timeout: Duration,
}

impl Mux {
    pub const CONTROL_FRAME_LEN: usize = 5;

    /// `inline == false` turns the mux into a pass-through: no flag byte, no handshake, no teardown
    pub fn new(inline: bool, is_listener: bool, handshake_timeout: Duration, teardown_timeout: Duration) -> Mux {
        let initial = if !inline {
            MuxState::Established
        }
        else if is_listener {
            MuxState::Listen
        }
        else {
            MuxState::SynSent
        };

        Mux {
            inline,
            state: AtomicI32::new(initial.into()),
            syn_sent: AtomicBool::new(false),
            handshake_done: Signal::new(),
            teardown_done: Signal::new(),
            handshake_timeout,
            teardown_timeout,
        }
    }

    pub fn is_inline(&self) -> bool {
        self.inline
    }

    pub fn state(&self) -> MuxState {
        // only valid discriminants are ever stored
        MuxState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(MuxState::TimeWait)
    }

    fn compare_and_swap(&self, from: MuxState, to: MuxState) -> bool {
        self.state.compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn pack_msg(&self, control: bool, payload: &[u8]) -> Bytes {
        if !self.inline {
            return Bytes::copy_from_slice(payload);
        }

        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(if control { FLAG_CONTROL } else { FLAG_DATA });
        buf.put_slice(payload);
        buf.freeze()
    }

    fn send_control(&self, out: &dyn Socket, state: MuxState) {
        let value: i32 = state.into();
        trace!("sending control frame {:?}", state);
        if let Err(e) = out.send_msg(self.pack_msg(true, &value.to_le_bytes())) {
            warn!("failed to send control frame {:?}: {}", state, e);
        }
    }

    /// Consumes one frame from the front of `buf`, handing data frames to the application.
    ///
    /// Returns `SocketError::TeardownComplete` once the connection is fully closed.
    pub fn on_msg<H: MessageHandler>(&self, out: &dyn Socket, handler: &H, state: &mut H::State, buf: &[u8]) -> Result<usize, SocketError> {
        if !self.inline {
            return handler.on_message(state, buf)
                .map_err(SocketError::Handler);
        }

        let Some(&flag) = buf.first() else {
            return Ok(0);
        };

        match flag {
            FLAG_DATA => {
                let current = self.state();
                if current != MuxState::Established {
                    return Err(SocketError::protocol(format!("data frame received in state {:?}", current)));
                }
                let consumed = handler.on_message(state, &buf[1..])
                    .map_err(SocketError::Handler)?;
                Ok(if consumed == 0 { 0 } else { consumed + 1 })
            }
            FLAG_CONTROL => {
                if buf.len() < Self::CONTROL_FRAME_LEN {
                    return Ok(0);
                }
                let raw = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
                let received = MuxState::try_from(raw)
                    .map_err(|_| SocketError::protocol(format!("unknown state {} in control frame", raw)))?;
                self.on_control(out, received)?;
                Ok(Self::CONTROL_FRAME_LEN)
            }
            other => Err(SocketError::protocol(format!("invalid frame flag {}", other))),
        }
    }

    fn on_control(&self, out: &dyn Socket, received: MuxState) -> Result<(), SocketError> {
        let (mut current, t) = loop {
            let current = self.state();
            let Some(t) = transition(current, received) else {
                return Err(SocketError::protocol(format!("unexpected control frame {:?} in state {:?}", received, current)));
            };

            // the first step may race with a local close(), in which case the frame is
            //  re-evaluated against the new state
            match t.steps.first() {
                Some(&(to, _)) if !self.compare_and_swap(current, to) => {
                    debug!("state changed concurrently while handling {:?} in {:?}", received, current);
                    continue;
                }
                _ => break (current, t),
            }
        };

        debug!("{:?} received in {:?}", received, current);

        for (i, &(to, reply)) in t.steps.iter().enumerate() {
            if i > 0 && !self.compare_and_swap(current, to) {
                return Err(SocketError::protocol(format!("concurrent state change from {:?} to {:?}", current, to)));
            }
            current = to;
            if reply {
                self.send_control(out, to);
            }
        }

        match t.completion {
            Some(Completion::Handshake) => {
                info!("handshake complete");
                self.handshake_done.fire();
                Ok(())
            }
            Some(Completion::Teardown) => {
                debug!("teardown complete");
                self.teardown_done.fire();
                Err(SocketError::TeardownComplete)
            }
            None => Ok(()),
        }
    }

    /// Waits until the handshake is complete. The initiating side sends its SynSent on the
    ///  first call. Calling this repeatedly is harmless.
    pub async fn init(&self, out: &dyn Socket) -> Result<(), SocketError> {
        if !self.inline {
            return Ok(());
        }

        if self.state() == MuxState::SynSent && !self.syn_sent.swap(true, Ordering::AcqRel) {
            self.send_control(out, MuxState::SynSent);
        }

        match timeout(self.handshake_timeout, self.handshake_done.fired()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(SocketError::HandshakeTimeout(self.state())),
        }
    }

    /// Starts the teardown if the connection is established, and waits (bounded) for any
    ///  teardown in progress to complete. Never fails: a teardown that does not complete in time
    ///  is logged, and the caller closes the transport anyway.
    pub async fn close(&self, out: &dyn Socket) {
        if !self.inline {
            return;
        }

        if self.compare_and_swap(MuxState::Established, MuxState::FinWait1) {
            debug!("starting teardown");
            self.send_control(out, MuxState::FinWait1);
        }

        let state = self.state();
        if !state.is_tearing_down() {
            debug!("mux close in state {:?}: no teardown", state);
            return;
        }

        if timeout(self.teardown_timeout, self.teardown_done.fired()).await.is_err() {
            info!("mux close timed out in state {:?}", self.state());
        }
    }
}

/// Reads frames through a [Mux], answering control frames via the raw endpoint
pub struct MuxFraming {
    pub mux: Arc<Mux>,
    pub raw: Arc<StreamEndpoint>,
}

impl<H: MessageHandler> Framing<H> for MuxFraming {
    fn frame(&self, handler: &H, state: &mut H::State, buf: &[u8]) -> Result<usize, SocketError> {
        self.mux.on_msg(self.raw.as_ref(), handler, state, buf)
    }
}

/// The socket the application sends through: payloads are wrapped in data frames, and refused
///  until the handshake is complete so that no data can overtake it.
pub struct MuxSocket {
    mux: Arc<Mux>,
    raw: Arc<StreamEndpoint>,
}

impl MuxSocket {
    pub fn new(mux: Arc<Mux>, raw: Arc<StreamEndpoint>) -> MuxSocket {
        MuxSocket { mux, raw }
    }
}

impl Socket for MuxSocket {
    fn send_msg(&self, msg: Bytes) -> Result<(), SocketError> {
        if self.raw.close_signal().is_fired() {
            return Err(SocketError::AlreadyClosed);
        }
        if self.mux.is_inline() {
            let state = self.mux.state();
            if state != MuxState::Established {
                return Err(SocketError::NotEstablished(state));
            }
        }
        self.raw.send_msg(self.mux.pack_msg(false, &msg))
    }

    fn local_addr(&self) -> std::net::SocketAddr {
        self.raw.local_addr()
    }

    fn remote_addr(&self) -> std::net::SocketAddr {
        self.raw.remote_addr()
    }
}
