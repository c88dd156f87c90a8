//! Getting B524 payloads onto the bus and replies back.
//!
//! The discovery engine only ever talks to a [`Transport`]. [`ebusd::EbusdTransport`] speaks to
//! an ebusd daemon over TCP; [`fixture::FixtureTransport`] answers from a JSON fixture.

pub mod ebusd;
pub mod fixture;

use std::future::Future;

use crate::b524::{self, EchoHeader, RegisterOpcode};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no reply before the deadline")]
    Timeout,
    #[error("the daemon rejected the request: {0}")]
    Rejected(String),
    #[error("ebusd does not accept raw hex commands ({0}), is it running with --enablehex?")]
    CommandNotEnabled(String),
    #[error("the exchange violated the protocol: {0}")]
    Protocol(String),
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
}

impl Error {
    /// Failures scoped to a single request. Anything else means the transport itself is unusable.
    pub fn is_request_scoped(&self) -> bool {
        matches!(self, Self::Timeout | Self::Rejected(_))
    }
}

pub trait Transport: Send {
    /// Send an arbitrary eBUS command with the primary/secondary command bytes given.
    fn send_proto(
        &mut self,
        destination: u8,
        primary: u8,
        secondary: u8,
        payload: &[u8],
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Send a B524 payload and return the reply bytes.
    fn send(
        &mut self,
        destination: u8,
        payload: &[u8],
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send {
        self.send_proto(destination, b524::PRIMARY_COMMAND, b524::SECONDARY_COMMAND, payload)
    }

    /// The layout of the echo that precedes register values in replies to `opcode` requests.
    fn echo_header(&self, opcode: RegisterOpcode) -> EchoHeader;
}
