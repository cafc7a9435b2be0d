//! Channel manager (§4.E): accept loop, outbound reconnect with exponential
//! backoff, and the write-timeout supervisor. Threading follows §5's
//! "one thread per server socket, one per live channel" model: no async
//! runtime, plain `std::thread` plus `crossbeam` channels for coordination.

use std::collections::HashMap;
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::raft::channel::{Channel, Command};
use crate::raft::message::{ConnectHeader, ConnectionType, CONNECT_HEADER_LEN, SENTINEL_HEADER};
use crate::raft::peer::MemberId;

const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Write-timeout tick cadence (§4.E).
pub const WRITE_CHECK_DELAY: Duration = Duration::from_millis(125);
/// Client-side channels are force-closed after this many ticks without a
/// completed write (≈ 250-375 ms effective, since a stalled write can start
/// up to one tick after the last check).
pub const CLIENT_WRITE_TIMEOUT_TICKS: u32 = 2;
/// Server-side (accepted) channels get a much longer allowance, since a slow
/// follower shouldn't be dropped as eagerly as a slow outbound connect.
pub const SERVER_WRITE_TIMEOUT_TICKS: u32 = 50;

/// Dispatches an inbound command to whatever owns the control-channel state
/// machine (typically the controller). Implemented as a plain callback
/// rather than a trait object hierarchy, matching the "pass handles
/// explicitly, no process-wide singletons" guidance in §9.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, from: MemberId, command: Command);
    /// Called for an opcode the handler doesn't recognize; the reader still
    /// consumes the declared command length (§4.D).
    fn unknown(&self, from: MemberId, opcode: u8);
}

struct TrackedChannel {
    channel: Arc<Channel>,
    /// Ticks elapsed while a write has been continuously outstanding on this
    /// channel. Reset to 0 whenever the channel isn't mid-write.
    ticks_since_write: AtomicU32,
    is_server_side: bool,
}

/// Connection lifecycle owner: accepts inbound connections, maintains
/// outbound connections to known peers with reconnect-with-backoff, and
/// periodically force-closes channels that have stalled past their
/// write-timeout threshold.
pub struct ChannelManager {
    local_member_id: MemberId,
    group_token: u64,
    group_token2: Option<u64>,
    group_id: u64,
    listen_address: SocketAddr,
    partitioned: AtomicBool,
    outbound: RwLock<HashMap<MemberId, Arc<TrackedChannel>>>,
    inbound: Mutex<Vec<Arc<TrackedChannel>>>,
    handler: Arc<dyn CommandHandler>,
}

impl ChannelManager {
    pub fn new(
        local_member_id: MemberId,
        group_token: u64,
        group_token2: Option<u64>,
        group_id: u64,
        listen_address: SocketAddr,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            local_member_id,
            group_token,
            group_token2,
            group_id,
            listen_address,
            partitioned: AtomicBool::new(false),
            outbound: RwLock::new(HashMap::new()),
            inbound: Mutex::new(Vec::new()),
            handler,
        }
    }

    /// §4.E "Partition simulation": reject new connections and close active
    /// ones while set.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
        if partitioned {
            for tracked in self.outbound.read().unwrap().values() {
                tracked.channel.close();
            }
            for tracked in self.inbound.lock().unwrap().iter() {
                tracked.channel.close();
            }
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }

    fn token_matches(&self, token: u64) -> bool {
        token == self.group_token || self.group_token2 == Some(token)
    }

    /// Binds the listen socket and spawns the accept loop on a dedicated
    /// thread. Returns immediately; the loop runs until the listener errors.
    pub fn spawn_accept_loop(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.listen_address)?;
        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name("channel-manager-accept".into())
            .spawn(move || manager.accept_loop(listener))
            .map_err(Error::Io)?;
        Ok(())
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let manager = Arc::clone(&self);
                    let spawned = std::thread::Builder::new()
                        .name("channel-manager-inbound".into())
                        .spawn(move || manager.handle_inbound(stream));
                    if let Err(e) = spawned {
                        log::error!("failed to spawn inbound handler thread: {e}");
                    }
                }
                Err(e) => {
                    log::error!("accept loop terminating: {e}");
                    return;
                }
            }
        }
    }

    fn handle_inbound(self: Arc<Self>, mut stream: TcpStream) {
        if self.is_partitioned() {
            return;
        }
        let mut header_buf = [0u8; CONNECT_HEADER_LEN];
        if stream.read_exact(&mut header_buf).is_err() {
            return;
        }
        let header = match ConnectHeader::decode(&header_buf) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("rejecting connect: {e}");
                return;
            }
        };
        if !self.token_matches(header.group_token) || header.group_id != self.group_id {
            let _ = stream.write_sentinel();
            return;
        }

        // Rewrite sender field with our own id and a fresh CRC, echoing it
        // back so the connecting peer learns how we see them addressed.
        let reply = ConnectHeader {
            group_token: header.group_token,
            group_id: header.group_id,
            sender_id: self.local_member_id,
            connection_type: header.connection_type,
        };
        if stream.write_header(&reply).is_err() {
            return;
        }

        match header.connection_type {
            ConnectionType::Control => {
                let channel = Arc::new(Channel::new(header.sender_id, stream.try_clone().expect("stream clone")));
                let tracked = Arc::new(TrackedChannel {
                    channel: Arc::clone(&channel),
                    ticks_since_write: AtomicU32::new(0),
                    is_server_side: true,
                });
                self.inbound.lock().unwrap().push(Arc::clone(&tracked));
                self.input_loop(header.sender_id, channel, stream);
            }
            ConnectionType::Plain | ConnectionType::Join | ConnectionType::Snapshot => {
                // Handed off raw: the adapter for the respective connection
                // type owns framing beyond the connect header (§1 "Deliberately
                // out of scope"). We only perform the handshake here.
            }
        }
    }

    fn input_loop(&self, peer_id: MemberId, channel: Arc<Channel>, mut reader: TcpStream) {
        loop {
            match channel.read_command(&mut reader) {
                Ok(command) => {
                    if crate::raft::message::Opcode::from_u8(command.opcode).is_some() {
                        self.handler.handle(peer_id, command);
                    } else {
                        self.handler.unknown(peer_id, command.opcode);
                    }
                }
                Err(_) => {
                    channel.close();
                    return;
                }
            }
        }
    }

    /// Establishes (or re-establishes) an outbound connection to `peer_addr`
    /// as member `peer_id`, reconnecting with exponential backoff in the
    /// background for as long as the manager lives.
    pub fn spawn_outbound(self: &Arc<Self>, peer_id: MemberId, peer_addr: SocketAddr) {
        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("channel-manager-outbound-{peer_id}"))
            .spawn(move || manager.outbound_loop(peer_id, peer_addr))
            .expect("spawn outbound reconnect thread");
    }

    fn outbound_loop(self: Arc<Self>, peer_id: MemberId, peer_addr: SocketAddr) {
        let mut backoff = RECONNECT_INITIAL_BACKOFF;
        let mut reported_mismatch = false;
        loop {
            if self.is_partitioned() {
                std::thread::sleep(backoff);
                continue;
            }
            match self.connect_once(peer_id, peer_addr) {
                Ok((channel, stream)) => {
                    backoff = RECONNECT_INITIAL_BACKOFF;
                    reported_mismatch = false;
                    let tracked = Arc::new(TrackedChannel {
                        channel: Arc::clone(&channel),
                        ticks_since_write: AtomicU32::new(0),
                        is_server_side: false,
                    });
                    self.outbound.write().unwrap().insert(peer_id, Arc::clone(&tracked));
                    self.input_loop(peer_id, channel, stream);
                    self.outbound.write().unwrap().remove(&peer_id);
                }
                Err(ConnectFailure::Mismatch) => {
                    if !reported_mismatch {
                        log::warn!("peer {peer_id} rejected connect: group token/id mismatch");
                        reported_mismatch = true;
                    }
                }
                Err(ConnectFailure::Io(e)) => {
                    log::debug!("connect to peer {peer_id} at {peer_addr} failed: {e}");
                }
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
        }
    }

    fn connect_once(&self, peer_id: MemberId, peer_addr: SocketAddr) -> std::result::Result<(Arc<Channel>, TcpStream), ConnectFailure> {
        let mut stream = TcpStream::connect(peer_addr).map_err(ConnectFailure::Io)?;
        let header = ConnectHeader {
            group_token: self.group_token,
            group_id: self.group_id,
            sender_id: self.local_member_id,
            connection_type: ConnectionType::Control,
        };
        stream.write_header(&header).map_err(ConnectFailure::Io)?;

        let mut reply_buf = [0u8; CONNECT_HEADER_LEN];
        stream.read_exact(&mut reply_buf).map_err(ConnectFailure::Io)?;
        if ConnectHeader::is_sentinel(&reply_buf) {
            return Err(ConnectFailure::Mismatch);
        }
        ConnectHeader::decode(&reply_buf).map_err(|_| ConnectFailure::Mismatch)?;

        let channel = Arc::new(Channel::new(peer_id, stream.try_clone().map_err(ConnectFailure::Io)?));
        Ok((channel, stream))
    }

    /// Looks up the live outbound channel to `peer_id`, if connected.
    pub fn channel_to(&self, peer_id: MemberId) -> Option<Arc<Channel>> {
        self.outbound.read().unwrap().get(&peer_id).map(|t| Arc::clone(&t.channel))
    }

    /// Spawns the write-timeout supervisor on a dedicated worker (§5 "N
    /// shared workers for delayed tasks"), ticking on a `crossbeam` channel
    /// rather than a bare `sleep` loop so it stops cleanly: send or drop the
    /// returned sender to shut the worker down.
    pub fn spawn_write_timeout_supervisor(self: &Arc<Self>) -> crossbeam::channel::Sender<()> {
        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(0);
        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name("channel-manager-write-timeout".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(WRITE_CHECK_DELAY) {
                    Ok(()) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => manager.supervise_write_timeouts(),
                }
            })
            .expect("spawn write-timeout supervisor thread");
        stop_tx
    }

    /// Runs the write-timeout supervisor tick once; exposed directly for
    /// tests and for callers that drive their own scheduling instead of
    /// `spawn_write_timeout_supervisor`.
    pub fn supervise_write_timeouts(&self) {
        for tracked in self.outbound.read().unwrap().values() {
            self.tick_and_maybe_close(tracked, CLIENT_WRITE_TIMEOUT_TICKS);
        }
        for tracked in self.inbound.lock().unwrap().iter() {
            self.tick_and_maybe_close(tracked, SERVER_WRITE_TIMEOUT_TICKS);
        }
    }

    /// Ticks `tracked` only if it has a write outstanding right now (§4.E
    /// "increments while a write is in progress"); an idle channel has its
    /// counter reset instead, so a write that completes between ticks never
    /// accumulates stall credit toward the next one.
    fn tick_and_maybe_close(&self, tracked: &Arc<TrackedChannel>, threshold: u32) {
        if !tracked.channel.is_write_in_flight() {
            tracked.ticks_since_write.store(0, Ordering::Release);
            return;
        }
        let ticks = tracked.ticks_since_write.fetch_add(1, Ordering::AcqRel) + 1;
        if ticks > threshold {
            log::warn!(
                "channel to peer {} exceeded write-timeout threshold ({threshold} ticks, {} side), closing",
                tracked.channel.peer_id,
                if tracked.is_server_side { "server" } else { "client" }
            );
            tracked.channel.close();
        }
    }
}

enum ConnectFailure {
    Mismatch,
    Io(std::io::Error),
}

/// Small extension trait bundling the connect-header write, kept local since
/// it's only meaningful while holding a raw stream mid-handshake.
trait ConnectHeaderIo {
    fn write_header(&mut self, header: &ConnectHeader) -> std::io::Result<()>;
    fn write_sentinel(&mut self) -> std::io::Result<()>;
}

impl ConnectHeaderIo for TcpStream {
    fn write_header(&mut self, header: &ConnectHeader) -> std::io::Result<()> {
        use std::io::Write;
        self.write_all(&header.encode())
    }

    fn write_sentinel(&mut self) -> std::io::Result<()> {
        use std::io::Write;
        self.write_all(&SENTINEL_HEADER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingHandler {
        count: AtomicUsize,
    }

    impl CommandHandler for RecordingHandler {
        fn handle(&self, _from: MemberId, _command: Command) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        fn unknown(&self, _from: MemberId, _opcode: u8) {}
    }

    #[test]
    fn inbound_connect_with_wrong_token_gets_sentinel() {
        let handler = Arc::new(RecordingHandler { count: AtomicUsize::new(0) });
        let manager = Arc::new(ChannelManager::new(
            1,
            111,
            None,
            1,
            "127.0.0.1:0".parse().unwrap(),
            handler,
        ));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let manager2 = Arc::clone(&manager);
        let accept_thread = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            manager2.handle_inbound(stream);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let header =
            ConnectHeader { group_token: 999, group_id: 1, sender_id: 2, connection_type: ConnectionType::Control };
        client.write_header(&header).unwrap();
        let mut reply = [0u8; CONNECT_HEADER_LEN];
        client.read_exact(&mut reply).unwrap();
        assert!(ConnectHeader::is_sentinel(&reply));
        accept_thread.join().unwrap();
    }

    #[test]
    fn write_timeout_supervisor_closes_stalled_client_channel() {
        let handler = Arc::new(RecordingHandler { count: AtomicUsize::new(0) });
        let manager = Arc::new(ChannelManager::new(1, 1, None, 1, "127.0.0.1:0".parse().unwrap(), handler));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (_server, _) = listener.accept().unwrap(); // never read, so the client's writes back up
        let channel = Arc::new(Channel::new(2, client));
        manager.outbound.write().unwrap().insert(
            2,
            Arc::new(TrackedChannel { channel: Arc::clone(&channel), ticks_since_write: AtomicU32::new(0), is_server_side: false }),
        );

        // A write genuinely stalled mid-flight, not merely an idle channel.
        let writer = {
            let channel = Arc::clone(&channel);
            std::thread::spawn(move || channel.write_command(0, &vec![0u8; 8 * 1024 * 1024 - 1]))
        };
        while !channel.is_write_in_flight() {
            std::thread::sleep(Duration::from_millis(1));
        }

        for _ in 0..(CLIENT_WRITE_TIMEOUT_TICKS + 1) {
            manager.supervise_write_timeouts();
        }
        // The channel's socket should now be shut down, unblocking the write
        // with an error.
        assert!(writer.join().unwrap().is_err());
    }

    #[test]
    fn write_timeout_supervisor_never_closes_idle_channel() {
        let handler = Arc::new(RecordingHandler { count: AtomicUsize::new(0) });
        let manager = ChannelManager::new(1, 1, None, 1, "127.0.0.1:0".parse().unwrap(), handler);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (_server, _) = listener.accept().unwrap();
        let channel = Arc::new(Channel::new(2, client));
        manager.outbound.write().unwrap().insert(
            2,
            Arc::new(TrackedChannel { channel: Arc::clone(&channel), ticks_since_write: AtomicU32::new(0), is_server_side: false }),
        );

        // No write ever starts; idle channels must never accrue stall ticks.
        for _ in 0..(CLIENT_WRITE_TIMEOUT_TICKS + 10) {
            manager.supervise_write_timeouts();
        }
        assert!(channel.write_command(0, b"hi").is_ok());
    }

    #[test]
    fn write_timeout_supervisor_worker_stops_on_signal() {
        let handler = Arc::new(RecordingHandler { count: AtomicUsize::new(0) });
        let manager = Arc::new(ChannelManager::new(1, 1, None, 1, "127.0.0.1:0".parse().unwrap(), handler));
        let stop = manager.spawn_write_timeout_supervisor();
        std::thread::sleep(WRITE_CHECK_DELAY * 2);
        stop.send(()).unwrap();
        // Dropping the sender after stopping is a no-op; the worker has
        // already exited its recv_timeout loop.
        drop(stop);
    }
}
