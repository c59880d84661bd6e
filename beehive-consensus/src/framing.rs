// Persisted state layout. The core defines this framing even
// though the storage engine that writes it to disk is an external
// collaborator: whatever log/snapshot store a deployment plugs in must
// agree with the engine on these bytes.
//
// Log entry: `len:u32 | crc32c:u32 | term:u64 | index:u64 | kind:u8 | payload:bytes`
// Snapshot:  `magic:4 | version:u16 | index:u64 | term:u64 | crc32c:u32 | state_len:u32 | state:bytes`

use crc::{Crc, CRC_32_ISCSI};

use beehive_base::{err, Result};

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const SNAPSHOT_MAGIC: [u8; 4] = *b"BHV1";
const SNAPSHOT_VERSION: u16 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FramedEntry {
    pub term: u64,
    pub index: u64,
    pub kind: u8,
    pub payload: Vec<u8>,
}

pub fn encode_entry(e: &FramedEntry) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + 8 + 1 + e.payload.len());
    body.extend_from_slice(&e.term.to_le_bytes());
    body.extend_from_slice(&e.index.to_le_bytes());
    body.push(e.kind);
    body.extend_from_slice(&e.payload);

    let crc = CRC32C.checksum(&body);
    let len = body.len() as u32;

    let mut framed = Vec::with_capacity(8 + body.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&crc.to_le_bytes());
    framed.extend_from_slice(&body);
    framed
}

pub fn decode_entry(buf: &[u8]) -> Result<FramedEntry> {
    if buf.len() < 8 {
        return Err(err("entry frame shorter than its header"));
    }
    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let stored_crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let body = buf
        .get(8..8 + len)
        .ok_or_else(|| err("entry frame length does not match buffer"))?;
    if CRC32C.checksum(body) != stored_crc {
        return Err(err("entry frame failed crc32c check"));
    }
    if body.len() < 17 {
        return Err(err("entry body shorter than term+index+kind"));
    }
    let term = u64::from_le_bytes(body[0..8].try_into().unwrap());
    let index = u64::from_le_bytes(body[8..16].try_into().unwrap());
    let kind = body[16];
    let payload = body[17..].to_vec();
    Ok(FramedEntry {
        term,
        index,
        kind,
        payload,
    })
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    pub index: u64,
    pub term: u64,
    pub state: Vec<u8>,
}

pub fn encode_snapshot(s: &Snapshot) -> Vec<u8> {
    let crc = CRC32C.checksum(&s.state);
    let mut out = Vec::with_capacity(4 + 2 + 8 + 8 + 4 + 4 + s.state.len());
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    out.extend_from_slice(&s.index.to_le_bytes());
    out.extend_from_slice(&s.term.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(s.state.len() as u32).to_le_bytes());
    out.extend_from_slice(&s.state);
    out
}

pub fn decode_snapshot(buf: &[u8]) -> Result<Snapshot> {
    if buf.len() < 30 {
        return Err(err("snapshot frame shorter than its header"));
    }
    if buf[0..4] != SNAPSHOT_MAGIC {
        return Err(err("snapshot magic mismatch: not a beehive snapshot"));
    }
    let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    if version != SNAPSHOT_VERSION {
        return Err(err("snapshot version mismatch: no framing negotiation"));
    }
    let index = u64::from_le_bytes(buf[6..14].try_into().unwrap());
    let term = u64::from_le_bytes(buf[14..22].try_into().unwrap());
    let stored_crc = u32::from_le_bytes(buf[22..26].try_into().unwrap());
    let state_len = u32::from_le_bytes(buf[26..30].try_into().unwrap()) as usize;
    let state = buf
        .get(30..30 + state_len)
        .ok_or_else(|| err("snapshot state length does not match buffer"))?
        .to_vec();
    if CRC32C.checksum(&state) != stored_crc {
        return Err(err("snapshot state failed crc32c check"));
    }
    Ok(Snapshot { index, term, state })
}
