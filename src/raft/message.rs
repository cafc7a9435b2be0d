//! Wire protocol (§4.D): the 40-byte connect header, the 8-byte command
//! header, and the opcode table. All integers are little-endian.

use crate::encoding::{crc32c, read_u32_le, read_u64_le, write_u32_le, write_u64_le};
use crate::error::{Error, Result};

pub const CONNECT_MAGIC: u64 = 0x48D7_B2F1_F3CA_4B6A;
pub const CONNECT_HEADER_LEN: usize = 40;

/// The connection a channel was opened for, carried in the connect header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Control,
    Plain,
    Join,
    Snapshot,
}

impl ConnectionType {
    pub fn code(self) -> u32 {
        match self {
            ConnectionType::Control => 0,
            ConnectionType::Plain => 1,
            ConnectionType::Join => 2,
            ConnectionType::Snapshot => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ConnectionType::Control),
            1 => Some(ConnectionType::Plain),
            2 => Some(ConnectionType::Join),
            3 => Some(ConnectionType::Snapshot),
            _ => None,
        }
    }
}

/// The 40-byte header exchanged at the start of every TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectHeader {
    pub group_token: u64,
    pub group_id: u64,
    pub sender_id: u64,
    pub connection_type: ConnectionType,
}

/// The all-zero header an accepting side sends back on a rejected connect
/// (group token or group id mismatch), per §4.E.
pub const SENTINEL_HEADER: [u8; CONNECT_HEADER_LEN] = [0u8; CONNECT_HEADER_LEN];

impl ConnectHeader {
    pub fn encode(&self) -> [u8; CONNECT_HEADER_LEN] {
        let mut buf = [0u8; CONNECT_HEADER_LEN];
        write_u64_le(&mut buf, 0, CONNECT_MAGIC);
        write_u64_le(&mut buf, 8, self.group_token);
        write_u64_le(&mut buf, 16, self.group_id);
        write_u64_le(&mut buf, 24, self.sender_id);
        write_u32_le(&mut buf, 32, self.connection_type.code());
        let crc = crc32c(&buf[..36]);
        write_u32_le(&mut buf, 36, crc);
        buf
    }

    /// Decodes and validates the CRC and magic. Returns
    /// `Error::ChecksumMismatch` on a bad CRC, `Error::Protocol` on bad magic
    /// or an unrecognized connection type.
    pub fn decode(buf: &[u8; CONNECT_HEADER_LEN]) -> Result<Self> {
        let magic = read_u64_le(buf, 0);
        if magic != CONNECT_MAGIC {
            return Err(Error::Protocol(format!("bad connect magic {magic:#x}")));
        }
        let crc = read_u32_le(buf, 36);
        if crc32c(&buf[..36]) != crc {
            return Err(Error::ChecksumMismatch("connect header CRC mismatch".into()));
        }
        let connection_type = ConnectionType::from_code(read_u32_le(buf, 32))
            .ok_or_else(|| Error::Protocol("unrecognized connection type".into()))?;
        Ok(Self {
            group_token: read_u64_le(buf, 8),
            group_id: read_u64_le(buf, 16),
            sender_id: read_u64_le(buf, 24),
            connection_type,
        })
    }

    /// Returns whether `buf` is the all-zero sentinel sent back on a
    /// rejected connect.
    pub fn is_sentinel(buf: &[u8; CONNECT_HEADER_LEN]) -> bool {
        buf == &SENTINEL_HEADER
    }
}

pub const COMMAND_HEADER_LEN: usize = 8;

/// The 8-byte header preceding every command on a control channel:
/// `commandLength` (3-byte LE, low 24 bits of byte 0..3), `opcode` (byte 3),
/// and 4 reserved bytes currently left at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub length: u32,
    pub opcode: u8,
}

impl CommandHeader {
    pub fn encode(&self) -> [u8; COMMAND_HEADER_LEN] {
        assert!(self.length < (1 << 24), "command length {} exceeds 24 bits", self.length);
        let mut buf = [0u8; COMMAND_HEADER_LEN];
        buf[0] = (self.length & 0xff) as u8;
        buf[1] = ((self.length >> 8) & 0xff) as u8;
        buf[2] = ((self.length >> 16) & 0xff) as u8;
        buf[3] = self.opcode;
        buf
    }

    pub fn decode(buf: &[u8; COMMAND_HEADER_LEN]) -> Self {
        let length = buf[0] as u32 | (buf[1] as u32) << 8 | (buf[2] as u32) << 16;
        Self { length, opcode: buf[3] }
    }
}

/// Opcodes from §4.D. Requests are even, replies odd, except the
/// proxy-forwarding and control opcodes which have no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    RequestVote = 2,
    RequestVoteReply = 3,
    QueryTerms = 4,
    QueryTermsReply = 5,
    QueryData = 6,
    QueryDataReply = 7,
    WriteData = 8,
    WriteDataReply = 9,
    SyncCommit = 10,
    SyncCommitReply = 11,
    Compact = 12,
    SnapshotScore = 14,
    SnapshotScoreReply = 15,
    UpdateRole = 16,
    UpdateRoleReply = 17,
    GroupVersion = 18,
    GroupVersionReply = 19,
    GroupFile = 20,
    GroupFileReply = 21,
    LeaderCheck = 22,
    LeaderCheckReply = 23,
    WriteAndProxy = 24,
    WriteViaProxy = 26,
    QueryDataReplyMissing = 29,
    ForceElection = 34,
}

impl Opcode {
    pub fn from_u8(code: u8) -> Option<Self> {
        use Opcode::*;
        Some(match code {
            0 => Nop,
            2 => RequestVote,
            3 => RequestVoteReply,
            4 => QueryTerms,
            5 => QueryTermsReply,
            6 => QueryData,
            7 => QueryDataReply,
            8 => WriteData,
            9 => WriteDataReply,
            10 => SyncCommit,
            11 => SyncCommitReply,
            12 => Compact,
            14 => SnapshotScore,
            15 => SnapshotScoreReply,
            16 => UpdateRole,
            17 => UpdateRoleReply,
            18 => GroupVersion,
            19 => GroupVersionReply,
            20 => GroupFile,
            21 => GroupFileReply,
            22 => LeaderCheck,
            23 => LeaderCheckReply,
            24 => WriteAndProxy,
            26 => WriteViaProxy,
            29 => QueryDataReplyMissing,
            34 => ForceElection,
            _ => return None,
        })
    }
}

/// `REQUEST_VOTE` payload: `(term, candidateId, highestTerm, highestPos)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: u64,
    pub highest_term: u64,
    pub highest_position: u64,
}

impl RequestVote {
    pub const LEN: usize = 32;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        write_u64_le(&mut buf, 0, self.term);
        write_u64_le(&mut buf, 8, self.candidate_id);
        write_u64_le(&mut buf, 16, self.highest_term);
        write_u64_le(&mut buf, 24, self.highest_position);
        buf
    }

    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self {
            term: read_u64_le(buf, 0),
            candidate_id: read_u64_le(buf, 8),
            highest_term: read_u64_le(buf, 16),
            highest_position: read_u64_le(buf, 24),
        }
    }
}

/// `REQUEST_VOTE_REPLY` payload: a term with the sign bit used as the grant
/// flag (bit 63 set means granted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteReply {
    pub term: u64,
    pub granted: bool,
}

impl RequestVoteReply {
    pub const LEN: usize = 8;
    const GRANT_BIT: u64 = 1 << 63;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        let mut word = self.term & !Self::GRANT_BIT;
        if self.granted {
            word |= Self::GRANT_BIT;
        }
        write_u64_le(&mut buf, 0, word);
        buf
    }

    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        let word = read_u64_le(buf, 0);
        Self { term: word & !Self::GRANT_BIT, granted: word & Self::GRANT_BIT != 0 }
    }
}

/// `WRITE_DATA` / `WRITE_AND_PROXY` / `WRITE_VIA_PROXY` payload header; the
/// variable-length `bytes` tail follows immediately in the command body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteDataHeader {
    pub prev_term: u64,
    pub term: u64,
    pub position: u64,
    pub highest_position: u64,
    pub commit_position: u64,
}

impl WriteDataHeader {
    pub const LEN: usize = 40;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        write_u64_le(&mut buf, 0, self.prev_term);
        write_u64_le(&mut buf, 8, self.term);
        write_u64_le(&mut buf, 16, self.position);
        write_u64_le(&mut buf, 24, self.highest_position);
        write_u64_le(&mut buf, 32, self.commit_position);
        buf
    }

    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self {
            prev_term: read_u64_le(buf, 0),
            term: read_u64_le(buf, 8),
            position: read_u64_le(buf, 16),
            highest_position: read_u64_le(buf, 24),
            commit_position: read_u64_le(buf, 32),
        }
    }
}

/// `WRITE_DATA_REPLY` payload: `(term, highestPosition)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteDataReply {
    pub term: u64,
    pub highest_position: u64,
}

impl WriteDataReply {
    pub const LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        write_u64_le(&mut buf, 0, self.term);
        write_u64_le(&mut buf, 8, self.highest_position);
        buf
    }

    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self { term: read_u64_le(buf, 0), highest_position: read_u64_le(buf, 8) }
    }
}

/// `SYNC_COMMIT` payload: `(prevTerm, term, position)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCommit {
    pub prev_term: u64,
    pub term: u64,
    pub position: u64,
}

impl SyncCommit {
    pub const LEN: usize = 24;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        write_u64_le(&mut buf, 0, self.prev_term);
        write_u64_le(&mut buf, 8, self.term);
        write_u64_le(&mut buf, 16, self.position);
        buf
    }

    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self { prev_term: read_u64_le(buf, 0), term: read_u64_le(buf, 8), position: read_u64_le(buf, 16) }
    }
}

/// `SYNC_COMMIT_REPLY` payload: `(groupVersion, term, position)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCommitReply {
    pub group_version: u64,
    pub term: u64,
    pub position: u64,
}

impl SyncCommitReply {
    pub const LEN: usize = 24;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        write_u64_le(&mut buf, 0, self.group_version);
        write_u64_le(&mut buf, 8, self.term);
        write_u64_le(&mut buf, 16, self.position);
        buf
    }

    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self { group_version: read_u64_le(buf, 0), term: read_u64_le(buf, 8), position: read_u64_le(buf, 16) }
    }
}

/// `QUERY_DATA_REPLY_MISSING` payload: `(currentTerm, prevTerm, term,
/// startPos, endPos)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryDataReplyMissing {
    pub current_term: u64,
    pub prev_term: u64,
    pub term: u64,
    pub start_position: u64,
    pub end_position: u64,
}

impl QueryDataReplyMissing {
    pub const LEN: usize = 40;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        write_u64_le(&mut buf, 0, self.current_term);
        write_u64_le(&mut buf, 8, self.prev_term);
        write_u64_le(&mut buf, 16, self.term);
        write_u64_le(&mut buf, 24, self.start_position);
        write_u64_le(&mut buf, 32, self.end_position);
        buf
    }

    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self {
            current_term: read_u64_le(buf, 0),
            prev_term: read_u64_le(buf, 8),
            term: read_u64_le(buf, 16),
            start_position: read_u64_le(buf, 24),
            end_position: read_u64_le(buf, 32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_header_round_trips() {
        let header = ConnectHeader {
            group_token: 0xdead_beef,
            group_id: 42,
            sender_id: 7,
            connection_type: ConnectionType::Control,
        };
        let buf = header.encode();
        assert_eq!(ConnectHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn connect_header_rejects_bad_crc() {
        let header = ConnectHeader { group_token: 1, group_id: 1, sender_id: 1, connection_type: ConnectionType::Plain };
        let mut buf = header.encode();
        buf[10] ^= 0xff; // part of group_token, covered by the CRC but not the magic
        assert!(matches!(ConnectHeader::decode(&buf), Err(Error::ChecksumMismatch(_))));
    }

    #[test]
    fn connect_header_rejects_bad_magic() {
        let buf = [0xffu8; CONNECT_HEADER_LEN];
        assert!(matches!(ConnectHeader::decode(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn sentinel_header_is_recognized() {
        assert!(ConnectHeader::is_sentinel(&SENTINEL_HEADER));
    }

    #[test]
    fn command_header_round_trips() {
        let header = CommandHeader { length: 0x00_abcd_ef & 0xff_ffff, opcode: Opcode::WriteData as u8 };
        let buf = header.encode();
        assert_eq!(CommandHeader::decode(&buf), header);
    }

    #[test]
    fn request_vote_reply_grant_bit_round_trips() {
        let reply = RequestVoteReply { term: 9, granted: true };
        assert_eq!(RequestVoteReply::decode(&reply.encode()), reply);
        let reply = RequestVoteReply { term: 9, granted: false };
        assert_eq!(RequestVoteReply::decode(&reply.encode()), reply);
    }

    #[test]
    fn opcode_from_u8_rejects_unknown() {
        assert!(Opcode::from_u8(200).is_none());
        assert_eq!(Opcode::from_u8(8), Some(Opcode::WriteData));
    }
}
