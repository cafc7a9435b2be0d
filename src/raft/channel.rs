//! Channel (§4.D): one TCP connection framed into length-prefixed commands,
//! with an exclusive per-channel write mutex (§4.E "Writes are exclusive per
//! channel").

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::raft::message::{CommandHeader, COMMAND_HEADER_LEN};
use crate::raft::peer::MemberId;

/// A single framed command read off (or about to be written to) a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// One TCP connection, already past the connect-header handshake, framed
/// into commands. Output is serialized by `write_mutex`; the input side has
/// no mutex because only the channel's own input loop reads from it.
pub struct Channel {
    pub peer_id: MemberId,
    stream: Mutex<TcpStream>,
    /// Set for the duration of an in-progress `write_command` call, so the
    /// write-timeout supervisor (§4.E) can tell a stalled outstanding write
    /// from a channel that's simply idle.
    write_in_flight: AtomicBool,
}

/// Application-level cap on a single command's payload, well under the
/// wire format's 24-bit `commandLength` ceiling (±16.7 MiB, §4.D).
const MAX_COMMAND_LEN: u32 = 8 * 1024 * 1024;

impl Channel {
    pub fn new(peer_id: MemberId, stream: TcpStream) -> Self {
        Self { peer_id, stream: Mutex::new(stream), write_in_flight: AtomicBool::new(false) }
    }

    /// Writes one command, holding the channel's exclusive write lock for the
    /// duration. On any I/O failure the caller should close the channel and
    /// trigger a reconnect; this method does not retry. Marks the write
    /// in-flight for the supervisor (§4.E) until it returns, success or not.
    pub fn write_command(&self, opcode: u8, payload: &[u8]) -> Result<()> {
        assert!(payload.len() < MAX_COMMAND_LEN as usize, "command payload too large");
        let header = CommandHeader { length: payload.len() as u32, opcode };
        self.write_in_flight.store(true, Ordering::Release);
        let result = (|| {
            let mut stream = self.stream.lock().unwrap();
            stream.write_all(&header.encode())?;
            stream.write_all(payload)?;
            Ok(())
        })();
        self.write_in_flight.store(false, Ordering::Release);
        result
    }

    /// Whether a `write_command` call is currently blocked writing to the
    /// socket. Used by the write-timeout supervisor to decide which channels
    /// to tick.
    pub fn is_write_in_flight(&self) -> bool {
        self.write_in_flight.load(Ordering::Acquire)
    }

    /// Reads one command from the input side. Only the owning input loop
    /// should call this; it does not take `write_mutex`.
    pub fn read_command(&self, reader: &mut impl Read) -> Result<Command> {
        let mut header_buf = [0u8; COMMAND_HEADER_LEN];
        reader.read_exact(&mut header_buf)?;
        let header = CommandHeader::decode(&header_buf);
        if header.length > MAX_COMMAND_LEN {
            return Err(Error::Protocol(format!("command length {} exceeds limit", header.length)));
        }
        let mut payload = vec![0u8; header.length as usize];
        reader.read_exact(&mut payload)?;
        Ok(Command { opcode: header.opcode, payload })
    }

    pub fn try_clone_stream(&self) -> Result<TcpStream> {
        Ok(self.stream.lock().unwrap().try_clone()?)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.lock().unwrap().set_write_timeout(timeout)?;
        Ok(())
    }

    /// Closes the underlying socket. Safe to call from any thread; subsequent
    /// writes observe a broken-pipe `Error::Io`.
    pub fn close(&self) {
        if let Ok(stream) = self.stream.lock() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn write_then_read_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let chan = Channel::new(1, client);
        chan.write_command(8, b"hello").unwrap();

        let mut server = server;
        let reader_chan = Channel::new(2, server.try_clone().unwrap());
        let cmd = reader_chan.read_command(&mut server).unwrap();
        assert_eq!(cmd.opcode, 8);
        assert_eq!(cmd.payload, b"hello");
    }

    #[test]
    fn rejects_oversized_command_length() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let header = CommandHeader { length: MAX_COMMAND_LEN + 1, opcode: 0 };
        server.write_all(&header.encode()).unwrap();

        let chan = Channel::new(1, client.try_clone().unwrap());
        let mut client = client;
        assert!(chan.read_command(&mut client).is_err());
    }
}
