//! NetBIOS name service parsing utility.
//!
//! [NbName] is the 16-byte NetBIOS name (15 characters plus a suffix byte).
//! [NsIncoming] is the logic representation of an incoming name service packet.
//! [NsOutgoing] is the logic representation of an outgoing name service packet.
//!
//! Reference: [RFC 1002 section 4.2](https://datatracker.ietf.org/doc/html/rfc1002#section-4.2)

#[cfg(feature = "logging")]
use crate::log::trace;
use crate::{Error, Result};
use std::{fmt, net::Ipv4Addr, str::FromStr};

/// The UDP port of the NetBIOS name service.
pub const NBNS_PORT: u16 = 137;

/// Max size of a name service datagram we accept or produce.
///
/// RFC 1002 limits name service packets to 576 bytes, but NBSTAT responses
/// from hosts with long name tables can be bigger in practice.
pub const MAX_MSG_ABSOLUTE: usize = 1500;

const MSG_HEADER_LEN: usize = 12;

/// Length of a NetBIOS name, including the suffix byte.
pub const NB_NAME_LEN: usize = 16;

/// Length of a first-level encoded NetBIOS name, without scope.
const NB_ENCODED_LEN: usize = 32;

// Definitions for name service header "flags" field
//
// The "flags" field is 16-bit long, in this format:
// (RFC 1002 section 4.2.1.1)
//
//   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
// | R|   OPCODE  |AA|TC|RD|RA| 0| 0| B|   RCODE   |
//
/// Flag bit to indicate a response
pub const FLAGS_RESPONSE: u16 = 0x8000;

const OPCODE_MASK: u16 = 0x7800;
const OPCODE_SHIFT: u16 = 11;

/// Flag bit for Authoritative Answer
pub const FLAGS_AA: u16 = 0x0400;

/// Flag bit for Recursion Desired
pub const FLAGS_RD: u16 = 0x0100;

/// Flag bit for Recursion Available.
///
/// A positive registration response from a name server with this bit clear
/// is an end-node challenge: the name server asks the registrant to verify
/// the current owner itself.
pub const FLAGS_RA: u16 = 0x0080;

/// Flag bit for Broadcast
pub const FLAGS_B: u16 = 0x0010;

const RCODE_MASK: u16 = 0x000F;

/// The class value for the Internet.
pub const CLASS_IN: u16 = 1;

/// NB_FLAGS: group name bit.
pub const NB_FLAGS_GROUP: u16 = 0x8000;

/// NB_FLAGS: owner node type, B-node.
pub const NB_FLAGS_ONT_B: u16 = 0x0000;

/// NB_FLAGS: owner node type, H-node (Microsoft extension).
pub const NB_FLAGS_ONT_H: u16 = 0x6000;

/// NAME_FLAGS in a node status response: name is active.
pub const NAME_FLAGS_ACT: u16 = 0x0400;

/// Length of the statistics block after the name table of a NBSTAT record.
const NBSTAT_STATISTICS_LEN: usize = 46;

/// Name service operation codes.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[non_exhaustive]
#[repr(u16)]
pub enum Opcode {
    /// Name query (and node status query).
    Query = 0,

    /// Name registration.
    Registration = 5,

    /// Name release.
    Release = 6,

    /// Wait for Acknowledgement. Only seen in responses.
    Wack = 7,

    /// Name refresh.
    Refresh = 8,

    /// Multi-homed name registration.
    MultiHomedRegistration = 15,
}

impl Opcode {
    /// Converts the opcode bits into `Opcode` if possible.
    pub const fn from_u16(value: u16) -> Option<Opcode> {
        match value {
            0 => Some(Opcode::Query),
            5 => Some(Opcode::Registration),
            6 => Some(Opcode::Release),
            7 => Some(Opcode::Wack),
            // RFC 1002 has a typo for refresh: both 8 and 9 are used in the wild.
            8 | 9 => Some(Opcode::Refresh),
            15 => Some(Opcode::MultiHomedRegistration),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Query => write!(f, "QUERY"),
            Opcode::Registration => write!(f, "REGISTRATION"),
            Opcode::Release => write!(f, "RELEASE"),
            Opcode::Wack => write!(f, "WACK"),
            Opcode::Refresh => write!(f, "REFRESH"),
            Opcode::MultiHomedRegistration => write!(f, "MULTI-HOMED REGISTRATION"),
        }
    }
}

/// Response codes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
#[repr(u16)]
pub enum Rcode {
    NoError = 0,
    /// FMT_ERR: the request was invalidly formatted.
    FormatError = 1,
    /// SRV_ERR: the name server cannot process the request.
    ServerFailure = 2,
    /// NAM_ERR: the name does not exist.
    NameError = 3,
    /// IMP_ERR: unsupported request.
    NotImplemented = 4,
    /// RFS_ERR: refused by policy.
    Refused = 5,
    /// ACT_ERR: the name is active and owned by another node.
    Active = 6,
    /// CFT_ERR: the name is in conflict.
    Conflict = 7,
}

impl Rcode {
    pub const fn from_u16(value: u16) -> Option<Rcode> {
        match value {
            0 => Some(Rcode::NoError),
            1 => Some(Rcode::FormatError),
            2 => Some(Rcode::ServerFailure),
            3 => Some(Rcode::NameError),
            4 => Some(Rcode::NotImplemented),
            5 => Some(Rcode::Refused),
            6 => Some(Rcode::Active),
            7 => Some(Rcode::Conflict),
            _ => None,
        }
    }
}

/// Resource record and question types used by the name service.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
#[repr(u16)]
pub enum RRType {
    /// IP address record. Only appears in redirect responses.
    A = 0x0001,

    /// Name server record. Only appears in redirect responses.
    NS = 0x0002,

    /// NULL record, used in WACK and some negative responses.
    NULL = 0x000A,

    /// NetBIOS general name record.
    NB = 0x0020,

    /// NetBIOS node status record.
    NBSTAT = 0x0021,
}

impl RRType {
    pub const fn from_u16(value: u16) -> Option<RRType> {
        match value {
            0x0001 => Some(RRType::A),
            0x0002 => Some(RRType::NS),
            0x000A => Some(RRType::NULL),
            0x0020 => Some(RRType::NB),
            0x0021 => Some(RRType::NBSTAT),
            _ => None,
        }
    }
}

impl fmt::Display for RRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRType::A => write!(f, "TYPE_A"),
            RRType::NS => write!(f, "TYPE_NS"),
            RRType::NULL => write!(f, "TYPE_NULL"),
            RRType::NB => write!(f, "TYPE_NB"),
            RRType::NBSTAT => write!(f, "TYPE_NBSTAT"),
        }
    }
}

/// A NetBIOS name: up to 15 characters padded with spaces, followed by a
/// suffix byte identifying the service (e.g. `0x20` for file server).
///
/// Names are case insensitive on the wire, so they are stored upper case.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NbName([u8; NB_NAME_LEN]);

impl NbName {
    /// Creates a name from `name` and the service `suffix`.
    ///
    /// `name` must be 1 to 15 bytes of printable ASCII and must not contain
    /// a `.` (that would start a scope).
    pub fn new(name: &str, suffix: u8) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidName("empty name".to_string()));
        }

        if name.len() > NB_NAME_LEN - 1 {
            return Err(Error::InvalidName(format!(
                "'{}' is longer than {} bytes",
                name,
                NB_NAME_LEN - 1
            )));
        }

        if let Some(c) = name.chars().find(|c| !c.is_ascii_graphic() && *c != ' ') {
            return Err(Error::InvalidName(format!(
                "'{}' contains invalid character {:?}",
                name, c
            )));
        }

        if name.contains('.') {
            return Err(Error::InvalidName(format!("'{}' contains '.'", name)));
        }

        let mut bytes = [b' '; NB_NAME_LEN];
        for (i, b) in name.bytes().enumerate() {
            bytes[i] = b.to_ascii_uppercase();
        }
        bytes[NB_NAME_LEN - 1] = suffix;
        Ok(Self(bytes))
    }

    /// Creates a name from its raw 16 bytes, as found on the wire.
    pub const fn from_bytes(bytes: [u8; NB_NAME_LEN]) -> Self {
        Self(bytes)
    }

    /// The wildcard name `*` used for node status queries and "all names" queries.
    pub const fn wildcard() -> Self {
        let mut bytes = [0u8; NB_NAME_LEN];
        bytes[0] = b'*';
        Self(bytes)
    }

    pub fn is_wildcard(&self) -> bool {
        self.0[0] == b'*' && self.0[1..].iter().all(|b| *b == 0 || *b == b' ')
    }

    /// Returns the service suffix byte.
    #[inline]
    pub const fn suffix(&self) -> u8 {
        self.0[NB_NAME_LEN - 1]
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; NB_NAME_LEN] {
        &self.0
    }

    /// Returns the name part without the padding and the suffix.
    pub fn name(&self) -> String {
        let end = self.0[..NB_NAME_LEN - 1]
            .iter()
            .rposition(|b| *b != b' ' && *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        String::from_utf8_lossy(&self.0[..end]).to_string()
    }

    /// First-level encoding: every nibble becomes a letter between 'A' and 'P'.
    fn encode(&self) -> [u8; NB_ENCODED_LEN] {
        let mut encoded = [0u8; NB_ENCODED_LEN];
        for (i, byte) in self.0.iter().enumerate() {
            encoded[i * 2] = b'A' + (byte >> 4);
            encoded[i * 2 + 1] = b'A' + (byte & 0x0F);
        }
        encoded
    }

    fn decode(encoded: &[u8]) -> Result<Self> {
        if encoded.len() != NB_ENCODED_LEN {
            return Err(Error::MalformedFrame(format!(
                "encoded name length {} != {}",
                encoded.len(),
                NB_ENCODED_LEN
            )));
        }

        let mut bytes = [0u8; NB_NAME_LEN];
        for (i, pair) in encoded.chunks(2).enumerate() {
            let (hi, lo) = (pair[0], pair[1]);
            if !(b'A'..=b'P').contains(&hi) || !(b'A'..=b'P').contains(&lo) {
                return Err(Error::MalformedFrame(format!(
                    "invalid encoded name characters at position {}",
                    i
                )));
            }
            bytes[i] = ((hi - b'A') << 4) | (lo - b'A');
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for NbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            return write!(f, "*");
        }
        write!(f, "{}<{:02x}>", self.name(), self.suffix())
    }
}

impl fmt::Debug for NbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NbName({})", self)
    }
}

/// Parses `NAME<xx>` where `xx` is the suffix in hex. A plain `NAME` gets
/// suffix `0x00` (workstation).
impl FromStr for NbName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "*" {
            return Ok(Self::wildcard());
        }

        match s.rsplit_once('<') {
            Some((name, rest)) => {
                let hex = rest
                    .strip_suffix('>')
                    .ok_or_else(|| Error::InvalidName(format!("missing '>' in {}", s)))?;
                let suffix = u8::from_str_radix(hex, 16)
                    .map_err(|e| Error::InvalidName(format!("bad suffix in {}: {}", s, e)))?;
                Self::new(name, suffix)
            }
            None => Self::new(s, 0x00),
        }
    }
}

/// One address entry of a NB resource record: NB_FLAGS and the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbAddrEntry {
    pub flags: u16,
    pub addr: Ipv4Addr,
}

impl NbAddrEntry {
    pub const fn new(flags: u16, addr: Ipv4Addr) -> Self {
        Self { flags, addr }
    }

    #[inline]
    pub const fn is_group(&self) -> bool {
        self.flags & NB_FLAGS_GROUP != 0
    }
}

/// One name in the name table of a node status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatusEntry {
    pub name: NbName,
    pub flags: u16,
}

impl NodeStatusEntry {
    #[inline]
    pub const fn is_group(&self) -> bool {
        self.flags & NB_FLAGS_GROUP != 0
    }

    #[inline]
    pub const fn is_active(&self) -> bool {
        self.flags & NAME_FLAGS_ACT != 0
    }
}

/// A question entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsQuestion {
    pub name: NbName,
    pub qtype: RRType,
}

/// The decoded RDATA of a resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    /// Address entries of a NB record.
    Nb(Vec<NbAddrEntry>),

    /// Name table and unit id (MAC address) of a NBSTAT record.
    NbStat {
        names: Vec<NodeStatusEntry>,
        mac: [u8; 6],
    },

    /// Any other record type, kept as raw bytes.
    Other(u16, Vec<u8>),
}

/// A resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsRecord {
    pub name: NbName,
    pub ttl: u32,
    pub rdata: RData,
}

impl NsRecord {
    /// Creates a NB record with a single address entry.
    pub fn nb(name: NbName, ttl: u32, entry: NbAddrEntry) -> Self {
        Self {
            name,
            ttl,
            rdata: RData::Nb(vec![entry]),
        }
    }

    pub fn rr_type(&self) -> u16 {
        match &self.rdata {
            RData::Nb(_) => RRType::NB as u16,
            RData::NbStat { .. } => RRType::NBSTAT as u16,
            RData::Other(ty, _) => *ty,
        }
    }

    /// Returns the address entries if this is a NB record, otherwise empty.
    pub fn addr_entries(&self) -> &[NbAddrEntry] {
        match &self.rdata {
            RData::Nb(entries) => entries,
            _ => &[],
        }
    }
}

/// Reads a big-endian `u16` from the first two bytes of `bytes`.
fn u16_from_be_slice(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn u32_from_be_slice(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// An outgoing name service packet.
///
/// Names are always written in full, without compression pointers, which
/// every implementation accepts.
#[derive(Debug, Clone)]
pub struct NsOutgoing {
    id: u16,
    flags: u16,
    questions: Vec<NsQuestion>,
    answers: Vec<NsRecord>,
    additionals: Vec<NsRecord>,
}

impl NsOutgoing {
    /// A request with `opcode`. Recursion desired is set as all requests in
    /// RFC 1002 set it, except node status.
    pub fn request(id: u16, opcode: Opcode, broadcast: bool) -> Self {
        let mut flags = (opcode as u16) << OPCODE_SHIFT;
        flags |= FLAGS_RD;
        if broadcast {
            flags |= FLAGS_B;
        }
        Self::with_flags(id, flags)
    }

    /// A response to `opcode` with `rcode`. Authoritative answer is set, as
    /// required for every response a node sends about its own names.
    pub fn response(id: u16, opcode: Opcode, rcode: Rcode) -> Self {
        let flags = FLAGS_RESPONSE
            | ((opcode as u16) << OPCODE_SHIFT)
            | FLAGS_AA
            | FLAGS_RD
            | (rcode as u16 & RCODE_MASK);
        Self::with_flags(id, flags)
    }

    pub fn with_flags(id: u16, flags: u16) -> Self {
        Self {
            id,
            flags,
            questions: Vec::new(),
            answers: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = flags;
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u16((self.flags & OPCODE_MASK) >> OPCODE_SHIFT)
    }

    pub const fn is_response(&self) -> bool {
        self.flags & FLAGS_RESPONSE != 0
    }

    pub fn questions(&self) -> &[NsQuestion] {
        &self.questions
    }

    pub fn answers(&self) -> &[NsRecord] {
        &self.answers
    }

    pub fn additionals(&self) -> &[NsRecord] {
        &self.additionals
    }

    pub fn add_question(&mut self, name: NbName, qtype: RRType) {
        self.questions.push(NsQuestion { name, qtype });
    }

    pub fn add_answer(&mut self, record: NsRecord) {
        trace!("add_answer: {:?}", &record);
        self.answers.push(record);
    }

    pub fn add_additional(&mut self, record: NsRecord) {
        self.additionals.push(record);
    }

    /// Encodes the packet into bytes to send on the wire.
    pub fn to_data_on_wire(&self) -> Vec<u8> {
        let mut packet = NsOutPacket::new();
        packet.write_short(self.id);
        packet.write_short(self.flags);
        packet.write_short(self.questions.len() as u16);
        packet.write_short(self.answers.len() as u16);
        packet.write_short(0); // authorities are never sent by a node.
        packet.write_short(self.additionals.len() as u16);

        for question in self.questions.iter() {
            packet.write_name(&question.name);
            packet.write_short(question.qtype as u16);
            packet.write_short(CLASS_IN);
        }

        for record in self.answers.iter().chain(self.additionals.iter()) {
            packet.write_record(record);
        }

        packet.data
    }
}

/// The bytes of one outgoing packet under construction.
struct NsOutPacket {
    data: Vec<u8>,
}

impl NsOutPacket {
    fn new() -> Self {
        Self {
            data: Vec::with_capacity(128),
        }
    }

    fn write_name(&mut self, name: &NbName) {
        self.write_byte(NB_ENCODED_LEN as u8);
        self.data.extend_from_slice(&name.encode());
        self.write_byte(0); // empty scope.
    }

    fn write_record(&mut self, record: &NsRecord) {
        self.write_name(&record.name);
        self.write_short(record.rr_type());
        self.write_short(CLASS_IN);
        self.write_u32(record.ttl);

        match &record.rdata {
            RData::Nb(entries) => {
                self.write_short((entries.len() * 6) as u16);
                for entry in entries {
                    self.write_short(entry.flags);
                    self.data.extend_from_slice(&entry.addr.octets());
                }
            }
            RData::NbStat { names, mac } => {
                let names = &names[..names.len().min(u8::MAX as usize)];
                let len = 1 + names.len() * (NB_NAME_LEN + 2) + NBSTAT_STATISTICS_LEN;
                self.write_short(len as u16);
                self.write_byte(names.len() as u8);
                for entry in names {
                    self.data.extend_from_slice(entry.name.as_bytes());
                    self.write_short(entry.flags);
                }
                self.data.extend_from_slice(mac);
                self.data
                    .extend_from_slice(&[0u8; NBSTAT_STATISTICS_LEN - 6]);
            }
            RData::Other(_, bytes) => {
                self.write_short(bytes.len() as u16);
                self.data.extend_from_slice(bytes);
            }
        }
    }

    fn write_u32(&mut self, int: u32) {
        self.data.extend_from_slice(&int.to_be_bytes());
    }

    fn write_short(&mut self, short: u16) {
        self.data.extend_from_slice(&short.to_be_bytes());
    }

    fn write_byte(&mut self, byte: u8) {
        self.data.push(byte);
    }
}

/// A decoded incoming name service packet.
#[derive(Debug)]
pub struct NsIncoming {
    offset: usize,
    data: Vec<u8>,
    id: u16,
    flags: u16,
    num_questions: u16,
    num_answers: u16,
    num_authorities: u16,
    num_additionals: u16,
    questions: Vec<NsQuestion>,
    answers: Vec<NsRecord>,
    authorities: Vec<NsRecord>,
    additionals: Vec<NsRecord>,
}

impl NsIncoming {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let mut incoming = Self {
            offset: 0,
            data,
            id: 0,
            flags: 0,
            num_questions: 0,
            num_answers: 0,
            num_authorities: 0,
            num_additionals: 0,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        };

        /*
        RFC 1002 section 4.2.1: https://datatracker.ietf.org/doc/html/rfc1002#section-4.2.1
        ...
                                1 1 1 1 1 1 1 1 1 1 2 2 2 2 2 2 2 2 2 2 3 3
            0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
           +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
           |                                                               |
           + ------                                                ------- +
           |                            HEADER                             |
           + ------                                                ------- +
           |                                                               |
           +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
           /                       QUESTION ENTRIES                        /
           +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
           /                    ANSWER RESOURCE RECORDS                    /
           +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
           /                  AUTHORITY RESOURCE RECORDS                   /
           +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
           /                  ADDITIONAL RESOURCE RECORDS                  /
           +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        incoming.read_header()?;
        incoming.read_questions()?;
        incoming.answers = incoming.read_rr_records(incoming.num_answers)?;
        incoming.authorities = incoming.read_rr_records(incoming.num_authorities)?;
        incoming.additionals = incoming.read_rr_records(incoming.num_additionals)?;

        Ok(incoming)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u16((self.flags & OPCODE_MASK) >> OPCODE_SHIFT)
    }

    /// Returns the raw RCODE value.
    pub const fn rcode(&self) -> u16 {
        self.flags & RCODE_MASK
    }

    pub const fn is_response(&self) -> bool {
        self.flags & FLAGS_RESPONSE != 0
    }

    pub const fn is_broadcast(&self) -> bool {
        self.flags & FLAGS_B != 0
    }

    pub const fn is_recursion_available(&self) -> bool {
        self.flags & FLAGS_RA != 0
    }

    pub fn questions(&self) -> &[NsQuestion] {
        &self.questions
    }

    pub fn answers(&self) -> &[NsRecord] {
        &self.answers
    }

    pub fn authorities(&self) -> &[NsRecord] {
        &self.authorities
    }

    pub fn additionals(&self) -> &[NsRecord] {
        &self.additionals
    }

    /// The name this packet is about: the first question for requests, the
    /// first answer (or additional) record for responses.
    pub fn subject(&self) -> Option<NbName> {
        self.questions
            .first()
            .map(|q| q.name)
            .or_else(|| self.answers.first().map(|r| r.name))
            .or_else(|| self.additionals.first().map(|r| r.name))
    }

    /// The record carrying data for this packet: the first answer, otherwise
    /// the first additional record (as used by registration requests).
    pub fn first_record(&self) -> Option<&NsRecord> {
        self.answers.first().or_else(|| self.additionals.first())
    }

    fn read_header(&mut self) -> Result<()> {
        if self.data.len() < MSG_HEADER_LEN {
            return Err(Error::MalformedFrame(format!(
                "header is too short: {} bytes",
                self.data.len()
            )));
        }

        let data = &self.data[0..];
        self.id = u16_from_be_slice(&data[..2]);
        self.flags = u16_from_be_slice(&data[2..4]);
        self.num_questions = u16_from_be_slice(&data[4..6]);
        self.num_answers = u16_from_be_slice(&data[6..8]);
        self.num_authorities = u16_from_be_slice(&data[8..10]);
        self.num_additionals = u16_from_be_slice(&data[10..12]);

        self.offset = MSG_HEADER_LEN;

        trace!(
            "read_header: id {}, flags {:#06x} {} questions {} answers {} authorities {} additionals",
            self.id,
            self.flags,
            self.num_questions,
            self.num_answers,
            self.num_authorities,
            self.num_additionals
        );
        Ok(())
    }

    fn read_questions(&mut self) -> Result<()> {
        for i in 0..self.num_questions {
            let name = self.read_name()?;

            let data = &self.data[self.offset..];
            if data.len() < 4 {
                return Err(Error::MalformedFrame(format!(
                    "question idx {} too short: {}",
                    i,
                    data.len()
                )));
            }
            let ty = u16_from_be_slice(&data[..2]);
            self.offset += 4;

            let Some(qtype) = RRType::from_u16(ty) else {
                return Err(Error::MalformedFrame(format!(
                    "question idx {} qtype unknown: {}",
                    i, ty
                )));
            };

            self.questions.push(NsQuestion { name, qtype });
        }
        Ok(())
    }

    fn read_rr_records(&mut self, count: u16) -> Result<Vec<NsRecord>> {
        const RR_HEADER_REMAIN: usize = 10; // type, class, ttl, rdlength

        let mut records = Vec::new();
        for _ in 0..count {
            let name = self.read_name()?;

            if self.data.len() < self.offset + RR_HEADER_REMAIN {
                return Err(Error::MalformedFrame(format!(
                    "record header too short at offset {}",
                    self.offset
                )));
            }
            let data = &self.data[self.offset..];
            let ty = u16_from_be_slice(&data[..2]);
            let ttl = u32_from_be_slice(&data[4..8]);
            let rdata_len = u16_from_be_slice(&data[8..10]) as usize;
            self.offset += RR_HEADER_REMAIN;

            let end = self.offset + rdata_len;
            if end > self.data.len() {
                return Err(Error::MalformedFrame(format!(
                    "rdata length {} exceeds packet at offset {}",
                    rdata_len, self.offset
                )));
            }
            let rdata = &self.data[self.offset..end];

            let rdata = match RRType::from_u16(ty) {
                Some(RRType::NB) => RData::Nb(Self::read_nb_entries(rdata)?),
                Some(RRType::NBSTAT) => Self::read_nbstat(rdata)?,
                _ => RData::Other(ty, rdata.to_vec()),
            };
            self.offset = end;

            records.push(NsRecord { name, ttl, rdata });
        }
        Ok(records)
    }

    fn read_nb_entries(rdata: &[u8]) -> Result<Vec<NbAddrEntry>> {
        if rdata.len() % 6 != 0 {
            return Err(Error::MalformedFrame(format!(
                "NB rdata length {} is not a multiple of 6",
                rdata.len()
            )));
        }

        Ok(rdata
            .chunks(6)
            .map(|chunk| NbAddrEntry {
                flags: u16_from_be_slice(chunk),
                addr: Ipv4Addr::new(chunk[2], chunk[3], chunk[4], chunk[5]),
            })
            .collect())
    }

    fn read_nbstat(rdata: &[u8]) -> Result<RData> {
        let Some((&num_names, rest)) = rdata.split_first() else {
            return Err(Error::MalformedFrame("empty NBSTAT rdata".to_string()));
        };

        let table_len = num_names as usize * (NB_NAME_LEN + 2);
        if rest.len() < table_len {
            return Err(Error::MalformedFrame(format!(
                "NBSTAT name table too short: {} < {}",
                rest.len(),
                table_len
            )));
        }

        let names = rest[..table_len]
            .chunks(NB_NAME_LEN + 2)
            .map(|chunk| {
                let mut bytes = [0u8; NB_NAME_LEN];
                bytes.copy_from_slice(&chunk[..NB_NAME_LEN]);
                NodeStatusEntry {
                    name: NbName::from_bytes(bytes),
                    flags: u16_from_be_slice(&chunk[NB_NAME_LEN..]),
                }
            })
            .collect();

        // Statistics are optional in practice; only the unit id is of interest.
        let mut mac = [0u8; 6];
        let stats = &rest[table_len..];
        if stats.len() >= 6 {
            mac.copy_from_slice(&stats[..6]);
        }

        Ok(RData::NbStat { names, mac })
    }

    /// Reads a (possibly compressed) NetBIOS name and skips its scope.
    fn read_name(&mut self) -> Result<NbName> {
        const MAX_JUMPS: usize = 8;

        let data = &self.data[..];
        let mut offset = self.offset;
        let mut jumps = 0;
        let mut first_label: Option<NbName> = None;
        let mut end_offset: Option<usize> = None;

        loop {
            let Some(&len) = data.get(offset) else {
                return Err(Error::MalformedFrame(format!(
                    "read_name: offset {} beyond data len {}",
                    offset,
                    data.len()
                )));
            };

            match len & 0xC0 {
                0x00 => {
                    if len == 0 {
                        if end_offset.is_none() {
                            end_offset = Some(offset + 1);
                        }
                        break;
                    }
                    let start = offset + 1;
                    let end = start + len as usize;
                    if end > data.len() {
                        return Err(Error::MalformedFrame(format!(
                            "read_name: label at {} exceeds data len {}",
                            offset,
                            data.len()
                        )));
                    }
                    if first_label.is_none() {
                        first_label = Some(NbName::decode(&data[start..end])?);
                    }
                    // Remaining labels are the scope, which we do not use.
                    offset = end;
                }
                0xC0 => {
                    if offset + 1 >= data.len() {
                        return Err(Error::MalformedFrame(
                            "read_name: truncated pointer".to_string(),
                        ));
                    }
                    if end_offset.is_none() {
                        end_offset = Some(offset + 2);
                    }
                    jumps += 1;
                    if jumps > MAX_JUMPS {
                        return Err(Error::MalformedFrame(
                            "read_name: too many pointers".to_string(),
                        ));
                    }
                    offset = (u16_from_be_slice(&data[offset..]) & 0x3FFF) as usize;
                }
                _ => {
                    return Err(Error::MalformedFrame(format!(
                        "read_name: bad label length {:#04x} at offset {}",
                        len, offset
                    )));
                }
            }
        }

        let name = first_label
            .ok_or_else(|| Error::MalformedFrame("read_name: empty name".to_string()))?;
        self.offset = end_offset.unwrap_or(offset + 1);
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        NbAddrEntry, NbName, NodeStatusEntry, NsIncoming, NsOutgoing, NsRecord, Opcode, RData,
        RRType, Rcode, FLAGS_B, FLAGS_RA, FLAGS_RD, NAME_FLAGS_ACT, NB_FLAGS_GROUP,
    };
    use crate::Error;
    use std::net::Ipv4Addr;

    #[test]
    fn test_name_new() {
        let name = NbName::new("server", 0x20).unwrap();
        assert_eq!(name.name(), "SERVER");
        assert_eq!(name.suffix(), 0x20);
        assert_eq!(&name.as_bytes()[..8], b"SERVER  ");
        assert_eq!(name.to_string(), "SERVER<20>");

        assert!(NbName::new("", 0x20).is_err());
        assert!(NbName::new("SIXTEEN_CHARS_XX", 0x20).is_err());
        assert!(NbName::new("host.domain", 0x20).is_err());
        assert!(NbName::new("tab\tname", 0x20).is_err());
    }

    #[test]
    fn test_name_from_str() {
        let name: NbName = "WORKGROUP<1d>".parse().unwrap();
        assert_eq!(name.name(), "WORKGROUP");
        assert_eq!(name.suffix(), 0x1d);

        let name: NbName = "laptop".parse().unwrap();
        assert_eq!(name.suffix(), 0x00);

        assert!("*".parse::<NbName>().unwrap().is_wildcard());
        assert!(matches!(
            "BAD<zz>".parse::<NbName>(),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn test_first_level_encoding() {
        // 'F' is 0x46: 'E' 'G'. Space is 0x20: 'C' 'A'.
        let name = NbName::new("FRED", 0x00).unwrap();
        let encoded = name.encode();
        assert_eq!(&encoded[..8], b"EGFCEFEE");
        assert_eq!(&encoded[8..10], b"CA");
        assert_eq!(&encoded[30..], b"AA");
        assert_eq!(NbName::decode(&encoded).unwrap(), name);

        let mut bad = encoded;
        bad[3] = b'Z';
        assert!(NbName::decode(&bad).is_err());
    }

    #[test]
    fn test_registration_request_layout() {
        let name = NbName::new("HOST1", 0x20).unwrap();
        let ip = Ipv4Addr::new(192, 168, 1, 10);
        let mut out = NsOutgoing::request(0x1234, Opcode::Registration, true);
        out.add_question(name, RRType::NB);
        out.add_additional(NsRecord::nb(name, 300, NbAddrEntry::new(0, ip)));

        let data = out.to_data_on_wire();
        assert_eq!(&data[..2], &[0x12, 0x34]);
        // opcode 5, RD and B set.
        assert_eq!(&data[2..4], &[0x29, 0x10]);
        // one question, no answers, no authorities, one additional
        assert_eq!(&data[4..12], &[0, 1, 0, 0, 0, 0, 0, 1]);
        assert_eq!(data[12], 0x20);
        // 12 header + 34 name + 4 qtype/qclass + 34 name + 10 rr header + 6 rdata
        assert_eq!(data.len(), 100);
        assert_eq!(&data[data.len() - 4..], &[192, 168, 1, 10]);

        let incoming = NsIncoming::new(data).unwrap();
        assert_eq!(incoming.id(), 0x1234);
        assert_eq!(incoming.opcode(), Some(Opcode::Registration));
        assert!(incoming.is_broadcast());
        assert!(!incoming.is_response());
        assert_eq!(incoming.flags() & FLAGS_RD, FLAGS_RD);
        assert_eq!(incoming.subject(), Some(name));
        let record = incoming.first_record().unwrap();
        assert_eq!(record.ttl, 300);
        assert_eq!(record.addr_entries(), &[NbAddrEntry::new(0, ip)]);
    }

    #[test]
    fn test_response_flags() {
        let name = NbName::new("HOST1", 0x20).unwrap();
        let mut out = NsOutgoing::response(7, Opcode::Registration, Rcode::Conflict);
        out.add_answer(NsRecord::nb(
            name,
            0,
            NbAddrEntry::new(NB_FLAGS_GROUP, Ipv4Addr::new(10, 0, 0, 1)),
        ));
        let incoming = NsIncoming::new(out.to_data_on_wire()).unwrap();
        assert!(incoming.is_response());
        assert_eq!(incoming.rcode(), Rcode::Conflict as u16);
        assert!(!incoming.is_recursion_available());
        assert_eq!(incoming.flags() & FLAGS_B, 0);
        assert!(incoming.answers()[0].addr_entries()[0].is_group());

        let mut out = NsOutgoing::response(8, Opcode::Registration, Rcode::NoError);
        out.set_flags(out.flags() | FLAGS_RA);
        let incoming = NsIncoming::new(out.to_data_on_wire()).unwrap();
        assert!(incoming.is_recursion_available());
    }

    #[test]
    fn test_compressed_name_in_additional() {
        // A registration request as sent by Windows: the additional record
        // name is a pointer to the question name at offset 12.
        let name = NbName::new("WIN10", 0x00).unwrap();
        let mut out = NsOutgoing::request(99, Opcode::Registration, true);
        out.add_question(name, RRType::NB);
        let mut data = out.to_data_on_wire();
        data[11] = 1; // one additional record
        data.extend_from_slice(&[0xC0, 0x0C]);
        data.extend_from_slice(&[0x00, 0x20, 0x00, 0x01]);
        data.extend_from_slice(&300_000u32.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x06, 0x60, 0x00, 10, 1, 2, 3]);

        let incoming = NsIncoming::new(data).unwrap();
        let record = &incoming.additionals()[0];
        assert_eq!(record.name, name);
        assert_eq!(record.ttl, 300_000);
        assert_eq!(record.addr_entries()[0].addr, Ipv4Addr::new(10, 1, 2, 3));
    }

    #[test]
    fn test_node_status_record() {
        let name = NbName::new("FILESRV", 0x20).unwrap();
        let mut out = NsOutgoing::response(3, Opcode::Query, Rcode::NoError);
        out.add_answer(NsRecord {
            name: NbName::wildcard(),
            ttl: 0,
            rdata: RData::NbStat {
                names: vec![NodeStatusEntry {
                    name,
                    flags: NAME_FLAGS_ACT,
                }],
                mac: [1, 2, 3, 4, 5, 6],
            },
        });

        let incoming = NsIncoming::new(out.to_data_on_wire()).unwrap();
        let record = &incoming.answers()[0];
        assert!(record.name.is_wildcard());
        match &record.rdata {
            RData::NbStat { names, mac } => {
                assert_eq!(names.len(), 1);
                assert_eq!(names[0].name, name);
                assert!(names[0].is_active());
                assert!(!names[0].is_group());
                assert_eq!(mac, &[1, 2, 3, 4, 5, 6]);
            }
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            NsIncoming::new(vec![0; 5]),
            Err(Error::MalformedFrame(_))
        ));

        let name = NbName::new("X", 0x20).unwrap();
        let mut out = NsOutgoing::request(1, Opcode::Query, false);
        out.add_question(name, RRType::NB);
        let mut data = out.to_data_on_wire();
        data.truncate(20);
        assert!(NsIncoming::new(data).is_err());

        // pointer loop
        let mut data = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&[0xC0, 0x0C, 0, 0x20, 0, 1]);
        assert!(NsIncoming::new(data).is_err());
    }
}
