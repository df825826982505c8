//! Minimal Telnet client stream.
//!
//! Option negotiation is answered conservatively: the server may echo and
//! suppress go-ahead, everything else is refused. Subnegotiations are
//! skipped. What remains is the plain NVT byte stream the CLI layer needs.

use memchr::memchr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::cli::CliIo;
use crate::error::TransportError;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Telnet framing over any async byte stream.
pub struct TelnetIo<S> {
    stream: S,
    state: State,
    read_buf: Vec<u8>,
}

impl<S> TelnetIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: State::Data,
            read_buf: vec![0; 4096],
        }
    }

    /// Split raw bytes into application data and negotiation replies.
    fn process(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        let mut rest = input;
        while !rest.is_empty() {
            if self.state == State::Data {
                // Fast path: copy everything up to the next IAC
                match memchr(IAC, rest) {
                    Some(pos) => {
                        data.extend_from_slice(&rest[..pos]);
                        self.state = State::Iac;
                        rest = &rest[pos + 1..];
                    }
                    None => {
                        data.extend_from_slice(rest);
                        rest = &[];
                    }
                }
                continue;
            }

            let byte = rest[0];
            rest = &rest[1..];
            self.state = match (self.state, byte) {
                (State::Iac, IAC) => {
                    data.push(IAC);
                    State::Data
                }
                (State::Iac, DO | DONT | WILL | WONT) => State::Negotiate(byte),
                (State::Iac, SB) => State::Sub,
                (State::Iac, _) => State::Data,
                (State::Negotiate(verb), option) => {
                    if let Some(answer) = answer(verb, option) {
                        replies.extend_from_slice(&[IAC, answer, option]);
                    }
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => State::Sub,
                (State::SubIac, SE) => State::Data,
                (State::SubIac, _) => State::Sub,
                (State::Data, _) => State::Data,
            };
        }
    }
}

fn answer(verb: u8, option: u8) -> Option<u8> {
    match verb {
        DO => Some(WONT),
        WILL if option == OPT_ECHO || option == OPT_SGA => Some(DO),
        WILL => Some(DONT),
        // Acknowledging DONT/WONT would start a negotiation loop.
        _ => None,
    }
}

impl<S> CliIo for TelnetIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }

            let input = self.read_buf[..n].to_vec();
            let mut data = Vec::with_capacity(n);
            let mut replies = Vec::new();
            self.process(&input, &mut data, &mut replies);

            if !replies.is_empty() {
                self.stream.write_all(&replies).await?;
            }
            if !data.is_empty() {
                return Ok(Some(data));
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut framed = Vec::with_capacity(data.len() + 2);
        for &byte in data {
            match byte {
                b'\n' => framed.extend_from_slice(b"\r\n"),
                IAC => framed.extend_from_slice(&[IAC, IAC]),
                byte => framed.push(byte),
            }
        }
        self.stream.write_all(&framed).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
