//! Wire form of agreement messages, carried as a single datagram payload.
//! Layout: [Kind:1][AgreementNr:4 LE][ProposalNr:4 LE][Value:4 LE]*

/// Kind + agreement_nr + proposal_nr.
pub const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Carries the proposer's current proposed set.
    Proposal = 0,
    /// Carries no values.
    Ack = 1,
    /// Carries the values the acker has that the proposer lacked.
    Nack = 2,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Proposal),
            1 => Some(Self::Ack),
            2 => Some(Self::Nack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatticeMessage {
    pub kind: MessageKind,
    pub agreement_nr: u32,
    pub proposal_nr: u32,
    pub values: Vec<u32>,
}

pub fn encode<I>(kind: MessageKind, agreement_nr: u32, proposal_nr: u32, values: I) -> Vec<u8>
where
    I: IntoIterator<Item = u32>,
    I::IntoIter: ExactSizeIterator,
{
    let values = values.into_iter();
    let mut buf = Vec::with_capacity(HEADER_LEN + 4 * values.len());
    buf.push(kind as u8);
    buf.extend_from_slice(&agreement_nr.to_le_bytes());
    buf.extend_from_slice(&proposal_nr.to_le_bytes());
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf
}

/// `None` for unknown kinds, short payloads, or a ragged value section; the
/// caller drops such messages.
pub fn decode(payload: &[u8]) -> Option<LatticeMessage> {
    if payload.len() < HEADER_LEN || (payload.len() - HEADER_LEN) % 4 != 0 {
        return None;
    }
    let kind = MessageKind::from_u8(payload[0])?;
    let agreement_nr = u32::from_le_bytes(payload[1..5].try_into().ok()?);
    let proposal_nr = u32::from_le_bytes(payload[5..9].try_into().ok()?);
    let values = payload[HEADER_LEN..]
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    Some(LatticeMessage {
        kind,
        agreement_nr,
        proposal_nr,
        values,
    })
}
