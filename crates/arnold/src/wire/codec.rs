use bytes::{Buf, BufMut, Bytes, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

use crate::{credit::CreditValue, error::Error, piece_set::PieceSet};

use super::{Chunk, Message, MessageId};

/// Frames larger than this are refused by both sides of the codec.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Size of a speedy encoded [`CreditValue`].
const CREDIT_LEN: usize = 16;

/// Size of an encoded [`Chunk`].
const CHUNK_LEN: usize = 12;

/// Every frame is a `u32` length of what follows, an `u8` message id and a
/// message dependent payload. All integers are big endian.
///
/// len,msg_id,payload
///  u32    u8       x      (in bits)
///
/// Piece sets travel as their piece count followed by the MSB0 bytes of the
/// bitfield, credit snapshots as a speedy encoded `(f64, i64)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

fn put_chunk(buf: &mut BytesMut, chunk: &Chunk) -> Result<(), Error> {
    for v in [chunk.piece, chunk.offset, chunk.len] {
        let v: u32 =
            v.try_into().map_err(|_| Error::MalformedMessage("chunk field"))?;
        buf.put_u32(v);
    }
    Ok(())
}

fn get_chunk(buf: &mut BytesMut) -> Chunk {
    let piece = buf.get_u32() as usize;
    let offset = buf.get_u32() as usize;
    let len = buf.get_u32() as usize;
    Chunk { piece, offset, len }
}

fn get_set(buf: &mut BytesMut, payload_len: usize) -> Result<PieceSet, Error> {
    if payload_len < 4 {
        return Err(Error::MalformedMessage("piece set without length"));
    }
    let nbits = buf.get_u32() as usize;
    let nbytes = payload_len - 4;
    if nbytes != nbits.div_ceil(8) {
        return Err(Error::MalformedMessage("piece set length"));
    }
    let bytes = buf.split_to(nbytes);
    Ok(PieceSet::from_bytes(&bytes, nbits))
}

fn set_len(set: &PieceSet) -> usize {
    4 + set.len().div_ceil(8)
}

fn put_set(buf: &mut BytesMut, set: &PieceSet) {
    buf.put_u32(set.len() as u32);
    buf.extend_from_slice(&set.to_bytes());
}

fn get_credit(buf: &mut BytesMut) -> Result<CreditValue, Error> {
    let bytes = buf.split_to(CREDIT_LEN);
    Ok(CreditValue::read_from_buffer_with_ctx(BigEndian {}, &bytes)?)
}

fn put_header(buf: &mut BytesMut, id: MessageId, payload_len: usize) -> Result<(), Error> {
    let msg_len = 1 + payload_len;
    if msg_len > MAX_FRAME_LEN {
        return Err(Error::MessageTooLarge(msg_len));
    }
    buf.reserve(4 + msg_len);
    buf.put_u32(msg_len as u32);
    buf.put_u8(id as u8);
    Ok(())
}

// From message to bytes
impl Encoder<&Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: &Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let id = item.id();
        match item {
            Message::Catalog(set) | Message::RequestPieces(set) => {
                put_header(buf, id, set_len(set))?;
                put_set(buf, set);
            }
            Message::Have(piece) => {
                put_header(buf, id, 4)?;
                buf.put_u32(*piece as u32);
            }
            Message::Interested(flag) => {
                put_header(buf, id, 1)?;
                buf.put_u8(*flag as u8);
            }
            Message::Choke { choked, reason } => {
                put_header(buf, id, 1 + reason.len())?;
                buf.put_u8(*choked as u8);
                buf.extend_from_slice(reason.as_bytes());
            }
            Message::Request { chunk, credit } => {
                let credit = credit.write_to_vec_with_ctx(BigEndian {})?;
                put_header(buf, id, CHUNK_LEN + credit.len())?;
                put_chunk(buf, chunk)?;
                buf.extend_from_slice(&credit);
            }
            Message::Cancel(chunk) => {
                put_header(buf, id, CHUNK_LEN)?;
                put_chunk(buf, chunk)?;
            }
            Message::Piece { chunk, data, credit } => {
                if data.len() != chunk.len {
                    return Err(Error::MalformedMessage("piece data length"));
                }
                let credit = credit.write_to_vec_with_ctx(BigEndian {})?;
                put_header(buf, id, CHUNK_LEN + credit.len() + data.len())?;
                put_chunk(buf, chunk)?;
                buf.extend_from_slice(&credit);
                buf.extend_from_slice(data);
            }
            Message::AskForHelp
            | Message::JoinHelpers
            | Message::ResignAsHelper
            | Message::StopHelping
            | Message::CloseConnection => {
                put_header(buf, id, 0)?;
            }
        }
        Ok(())
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&Message>>::encode(self, &item, buf)
    }
}

// From bytes to message
impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.remaining() < 4 {
            return Ok(None);
        }

        // peek at the length without consuming it, the frame might not be
        // complete yet.
        let mut tmp_buf = Cursor::new(&buf);
        let msg_len = tmp_buf.get_u32() as usize;

        if msg_len == 0 {
            return Err(Error::MalformedMessage("frame without id"));
        }
        if msg_len > MAX_FRAME_LEN {
            return Err(Error::MessageTooLarge(msg_len));
        }

        if buf.remaining() < 4 + msg_len {
            tracing::trace!(
                "Read buffer is {} bytes long but message is {} bytes long",
                buf.remaining(),
                msg_len
            );
            buf.reserve(4 + msg_len - buf.remaining());
            return Ok(None);
        }

        buf.advance(4);
        let raw_id = buf.get_u8();
        let msg_id =
            MessageId::try_from(raw_id).map_err(|_| Error::UnknownMessageId(raw_id))?;
        let payload_len = msg_len - 1;

        let expect = |len: usize| -> Result<(), Error> {
            if payload_len == len {
                Ok(())
            } else {
                Err(Error::MalformedMessage("unexpected payload length"))
            }
        };

        let msg = match msg_id {
            MessageId::Catalog => Message::Catalog(get_set(buf, payload_len)?),
            MessageId::RequestPieces => {
                Message::RequestPieces(get_set(buf, payload_len)?)
            }
            MessageId::Have => {
                expect(4)?;
                Message::Have(buf.get_u32() as usize)
            }
            MessageId::Interested => {
                expect(1)?;
                Message::Interested(buf.get_u8() != 0)
            }
            MessageId::Choke => {
                if payload_len < 1 {
                    return Err(Error::MalformedMessage("choke without flag"));
                }
                let choked = buf.get_u8() != 0;
                let reason = buf.split_to(payload_len - 1);
                let reason = String::from_utf8(reason.to_vec())
                    .map_err(|_| Error::MalformedMessage("choke reason"))?;
                Message::Choke { choked, reason }
            }
            MessageId::Request => {
                expect(CHUNK_LEN + CREDIT_LEN)?;
                let chunk = get_chunk(buf);
                let credit = get_credit(buf)?;
                Message::Request { chunk, credit }
            }
            MessageId::Cancel => {
                expect(CHUNK_LEN)?;
                Message::Cancel(get_chunk(buf))
            }
            MessageId::Piece => {
                if payload_len < CHUNK_LEN + CREDIT_LEN {
                    return Err(Error::MalformedMessage("piece header"));
                }
                let chunk = get_chunk(buf);
                let credit = get_credit(buf)?;
                let data_len = payload_len - CHUNK_LEN - CREDIT_LEN;
                if data_len != chunk.len {
                    buf.advance(data_len);
                    return Err(Error::MalformedMessage("piece data length"));
                }
                let data: Bytes = buf.split_to(data_len).freeze();
                Message::Piece { chunk, data, credit }
            }
            MessageId::AskForHelp => {
                expect(0)?;
                Message::AskForHelp
            }
            MessageId::JoinHelpers => {
                expect(0)?;
                Message::JoinHelpers
            }
            MessageId::ResignAsHelper => {
                expect(0)?;
                Message::ResignAsHelper
            }
            MessageId::StopHelping => {
                expect(0)?;
                Message::StopHelping
            }
            MessageId::CloseConnection => {
                expect(0)?;
                Message::CloseConnection
            }
        };

        Ok(Some(msg))
    }
}
