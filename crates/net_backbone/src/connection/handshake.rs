//! Diffie-Hellman handshake over plaintext transmission units.
//!
//! | code     | sender    | body                                         |
//! |----------|-----------|----------------------------------------------|
//! | `0x7F01` | acceptor  | prime hex, generator, acceptor public hex    |
//! | `0x7F02` | initiator | initiator public hex                         |
//! | `0x7F03` | acceptor  | check block of `SRVCHECK` under session key  |
//! | `0x7F04` | initiator | check block of `CLTCHECK` under session key  |
//!
//! Strings are `u16` length prefixed ASCII. Both check blocks must match what
//! the receiver computes with its own key, otherwise the two sides did not
//! agree on a secret and the connection is dropped.

use super::framing::{encode_unit, FrameDecoder};
use super::io::CloseReason;
use crate::crypto::{DhParameters, SessionCipher, BLOCK_SIZE};
use crate::error::ProtocolError;
use crate::packet::{Encoding, Packet, PacketRead, ReadOnlyPacket};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const CHALLENGE: u16 = 0x7F01;
pub(crate) const RESPONSE: u16 = 0x7F02;
pub(crate) const SERVER_CONFIRM: u16 = 0x7F03;
pub(crate) const CLIENT_CONFIRM: u16 = 0x7F04;

const SERVER_CHECK: &[u8; BLOCK_SIZE] = b"SRVCHECK";
const CLIENT_CHECK: &[u8; BLOCK_SIZE] = b"CLTCHECK";

const READ_CHUNK: usize = 1024;

/// Runs the accepting side: challenge, then verify the initiator's key.
pub(crate) async fn accept<R, W>(
    params: &DhParameters,
    reader: &mut R,
    writer: &mut W,
    decoder: &mut FrameDecoder,
) -> Result<SessionCipher, CloseReason>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let keypair = params.generate_keypair();

    let mut challenge = control(CHALLENGE)?;
    challenge.write_string16(Encoding::Utf8, &params.prime_hex(), false)?;
    challenge.write_string16(Encoding::Utf8, &params.generator().to_string(), false)?;
    challenge.write_string16(Encoding::Utf8, &keypair.public_hex(), false)?;
    send(writer, &challenge).await?;

    let mut response = expect(reader, decoder, RESPONSE).await?;
    let peer_public = response.read_string16(Encoding::Utf8)?;
    let cipher = keypair.shared_secret(&peer_public)?.session_cipher()?;

    let mut confirm = control(SERVER_CONFIRM)?;
    confirm.write_array(&cipher.check_block(SERVER_CHECK))?;
    send(writer, &confirm).await?;

    let mut reply = expect(reader, decoder, CLIENT_CONFIRM).await?;
    verify(&cipher, CLIENT_CHECK, &mut reply)?;

    Ok(cipher)
}

/// Runs the dialing side: answer the challenge and confirm both keys.
pub(crate) async fn initiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    decoder: &mut FrameDecoder,
) -> Result<SessionCipher, CloseReason>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut challenge = expect(reader, decoder, CHALLENGE).await?;
    let prime = challenge.read_string16(Encoding::Utf8)?;
    let generator = challenge
        .read_string16(Encoding::Utf8)?
        .parse::<u32>()
        .map_err(|_| ProtocolError::Handshake("generator is not a number".to_string()))?;
    let peer_public = challenge.read_string16(Encoding::Utf8)?;

    let params = DhParameters::with_generator(&prime, generator)?;
    let keypair = params.generate_keypair();
    let cipher = keypair.shared_secret(&peer_public)?.session_cipher()?;

    let mut response = control(RESPONSE)?;
    response.write_string16(Encoding::Utf8, &keypair.public_hex(), false)?;
    send(writer, &response).await?;

    let mut confirm = expect(reader, decoder, SERVER_CONFIRM).await?;
    verify(&cipher, SERVER_CHECK, &mut confirm)?;

    let mut reply = control(CLIENT_CONFIRM)?;
    reply.write_array(&cipher.check_block(CLIENT_CHECK))?;
    send(writer, &reply).await?;

    Ok(cipher)
}

fn control(code: u16) -> Result<Packet, ProtocolError> {
    let mut packet = Packet::new();
    packet.write_u16_le(code)?;
    Ok(packet)
}

fn verify(
    cipher: &SessionCipher,
    label: &[u8; BLOCK_SIZE],
    packet: &mut ReadOnlyPacket,
) -> Result<(), ProtocolError> {
    let received = packet.read_array(BLOCK_SIZE)?;
    if received != cipher.check_block(label) {
        return Err(ProtocolError::CipherMismatch);
    }
    Ok(())
}

async fn send<W>(writer: &mut W, packet: &Packet) -> Result<(), CloseReason>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_unit(packet.bytes())).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next unit and checks its control code, returning the rest.
async fn expect<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    code: u16,
) -> Result<ReadOnlyPacket, CloseReason>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    let unit = loop {
        if let Some(unit) = decoder.next_unit()? {
            break unit;
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            decoder.finish()?;
            return Err(ProtocolError::Handshake("peer closed during handshake".to_string()).into());
        }
        decoder.extend(&buf[..n]);
    };

    let mut packet = ReadOnlyPacket::new(unit);
    let actual = packet.read_u16_le()?;
    if actual != code {
        return Err(ProtocolError::UnexpectedControl {
            expected: code,
            actual,
        }
        .into());
    }
    Ok(packet)
}
