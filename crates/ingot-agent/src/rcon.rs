use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    time::{Duration, Instant},
};

use crate::error::RconError;

const TYPE_LOGIN: i32 = 3;
const TYPE_COMMAND: i32 = 2;
const TYPE_AUTH_RESPONSE: i32 = 2;
const TYPE_RESPONSE: i32 = 0;

const LOGIN_ID: i32 = 1;
const COMMAND_ID: i32 = 2;

/// Largest command body the game server accepts from a client.
pub const MAX_COMMAND_BYTES: usize = 1446;
const MAX_PACKET_BYTES: i32 = 64 * 1024;
const MIN_PACKET_BYTES: i32 = 10;

/// One budget for the whole exchange; each socket call gets what is left.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    total: Duration,
}

impl Deadline {
    fn after(total: Duration) -> Self {
        Self {
            at: Instant::now() + total,
            total,
        }
    }

    fn remaining(&self) -> Result<Duration, RconError> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(RconError::Timeout(self.total));
        }
        Ok(left)
    }

    fn map_io(&self, e: io::Error) -> RconError {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => RconError::Timeout(self.total),
            _ => RconError::Transport(e),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Packet {
    id: i32,
    kind: i32,
    body: String,
}

fn encode(id: i32, kind: i32, body: &str) -> Vec<u8> {
    let len = (4 + 4 + body.len() + 2) as i32;
    let mut out = Vec::with_capacity(len as usize + 4);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(&[0, 0]);
    out
}

fn decode(payload: &[u8]) -> Result<Packet, RconError> {
    if payload.len() < (MIN_PACKET_BYTES as usize) {
        return Err(RconError::Malformed(format!(
            "packet too short ({} bytes)",
            payload.len()
        )));
    }
    let id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let kind = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let mut body = &payload[8..];
    while let Some(rest) = body.strip_suffix(&[0]) {
        body = rest;
    }
    Ok(Packet {
        id,
        kind,
        body: String::from_utf8_lossy(body).into_owned(),
    })
}

/// A single authenticated connection. Not reused across commands.
pub struct RconClient {
    stream: TcpStream,
    deadline: Deadline,
}

impl RconClient {
    pub fn connect(addr: SocketAddr, password: &str, timeout: Duration) -> Result<Self, RconError> {
        let deadline = Deadline::after(timeout);
        let stream =
            TcpStream::connect_timeout(&addr, deadline.remaining()?).map_err(|e| deadline.map_io(e))?;
        stream.set_nodelay(true).ok();

        let mut client = Self { stream, deadline };
        client.send(LOGIN_ID, TYPE_LOGIN, password)?;

        loop {
            let p = client.recv()?;
            // Some servers send an empty response value ahead of the auth result.
            if p.kind == TYPE_RESPONSE && p.id == LOGIN_ID {
                continue;
            }
            if p.kind != TYPE_AUTH_RESPONSE {
                return Err(RconError::Malformed(format!(
                    "unexpected packet type {} during login",
                    p.kind
                )));
            }
            if p.id == -1 {
                return Err(RconError::AuthRejected);
            }
            if p.id != LOGIN_ID {
                return Err(RconError::Malformed(format!(
                    "login response id {} does not match request",
                    p.id
                )));
            }
            return Ok(client);
        }
    }

    pub fn command(&mut self, command: &str) -> Result<String, RconError> {
        if command.len() > MAX_COMMAND_BYTES {
            return Err(RconError::CommandTooLong(command.len()));
        }
        self.send(COMMAND_ID, TYPE_COMMAND, command)?;
        let p = self.recv()?;
        if p.id == -1 {
            return Err(RconError::AuthRejected);
        }
        if p.kind != TYPE_RESPONSE || p.id != COMMAND_ID {
            return Err(RconError::Malformed(format!(
                "unexpected response (id {}, type {})",
                p.id, p.kind
            )));
        }
        Ok(p.body)
    }

    fn send(&mut self, id: i32, kind: i32, body: &str) -> Result<(), RconError> {
        let bytes = encode(id, kind, body);
        self.stream
            .set_write_timeout(Some(self.deadline.remaining()?))
            .map_err(RconError::Transport)?;
        self.stream
            .write_all(&bytes)
            .map_err(|e| self.deadline.map_io(e))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), RconError> {
        let mut filled = 0;
        while filled < buf.len() {
            self.stream
                .set_read_timeout(Some(self.deadline.remaining()?))
                .map_err(RconError::Transport)?;
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(RconError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by server",
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.deadline.map_io(e)),
            }
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Packet, RconError> {
        let mut len = [0u8; 4];
        self.read_exact(&mut len)?;
        let len = i32::from_le_bytes(len);
        if !(MIN_PACKET_BYTES..=MAX_PACKET_BYTES).contains(&len) {
            return Err(RconError::Malformed(format!("invalid packet length {len}")));
        }
        let mut payload = vec![0u8; len as usize];
        self.read_exact(&mut payload)?;
        decode(&payload)
    }
}

/// Connect, authenticate, run one command, disconnect. Blocking.
pub fn exchange(
    port: u16,
    password: &str,
    command: &str,
    timeout: Duration,
) -> Result<String, RconError> {
    if command.len() > MAX_COMMAND_BYTES {
        return Err(RconError::CommandTooLong(command.len()));
    }
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mut client = RconClient::connect(addr, password, timeout)?;
    client.command(command)
}

/// `exchange` on the blocking pool so the runtime never waits on the socket.
pub async fn exchange_async(
    port: u16,
    password: String,
    command: String,
    timeout: Duration,
) -> Result<String, RconError> {
    tokio::task::spawn_blocking(move || exchange(port, &password, &command, timeout))
        .await
        .map_err(|e| RconError::Transport(io::Error::other(format!("rcon task failed: {e}"))))?
}
