//! The peer handshake state machine (spec §4.4): two entry points, Dial
//! and Accept, that produce either a plaintext or MSE/PE-wrapped stream.

pub mod mse;
pub mod stream;

use std::convert::TryInto;
use std::fmt;
use std::net::SocketAddr;

use rand::Rng;
use rc4::StreamCipher;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub use stream::{Cipher, CipherStream};

use crate::conf::HandshakeConf;
use crate::contracts::InfoHashRegistry;
use crate::{ExtensionBits, InfoHash, PeerId};
use mse::{Direction, KeyPair};

/// The fixed protocol identifier (spec §4.4.1).
const PSTR: &[u8] = b"BitTorrent protocol";

/// `crypto_provide`/`crypto_select` bitmask values (spec §4.4.4).
const CRYPTO_PLAINTEXT: u32 = 0x01;
const CRYPTO_RC4: u32 = 0x02;

/// Errors raised by the handshake (spec §7, categories 2-3).
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Timeout,
    UnexpectedProtocol,
    InfoHashMismatch,
    InfoHashRejected,
    SelfConnect,
    NoMatchingSKey,
    CipherNotOffered,
    PaddingNotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::Timeout => write!(f, "handshake timed out"),
            Self::UnexpectedProtocol => write!(f, "unexpected protocol prefix"),
            Self::InfoHashMismatch => write!(f, "info hash mismatch"),
            Self::InfoHashRejected => write!(f, "info hash not accepted"),
            Self::SelfConnect => write!(f, "self-connect detected"),
            Self::NoMatchingSKey => write!(f, "no torrent matches the offered sKey"),
            Self::CipherNotOffered => write!(f, "peer did not offer a usable cipher"),
            Self::PaddingNotFound => write!(f, "could not locate end of padding field"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The outcome of a successful handshake (spec §4.4.5).
pub struct HandshakeResult {
    pub stream: CipherStream,
    pub cipher: Cipher,
    pub ext_bits: ExtensionBits,
    pub peer_id: PeerId,
    pub info_hash: InfoHash,
}

/// The 68-byte plaintext frame (spec §4.4.1).
fn encode_handshake(ext_bits: &ExtensionBits, info_hash: &InfoHash, peer_id: &PeerId) -> [u8; 68] {
    let mut buf = [0u8; 68];
    buf[0] = 19;
    buf[1..20].copy_from_slice(PSTR);
    buf[20..28].copy_from_slice(ext_bits);
    buf[28..48].copy_from_slice(info_hash);
    buf[48..68].copy_from_slice(peer_id);
    buf
}

async fn write_handshake<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    ext_bits: &ExtensionBits,
    info_hash: &InfoHash,
    peer_id: &PeerId,
) -> Result<(), Error> {
    let frame = encode_handshake(ext_bits, info_hash, peer_id);
    stream.write_all(&frame).await?;
    Ok(())
}

/// Reads and parses the 68-byte plaintext frame (spec §4.4.1).
async fn read_handshake<S: AsyncReadExt + Unpin>(
    stream: &mut S,
) -> Result<(ExtensionBits, InfoHash, PeerId), Error> {
    let mut buf = [0u8; 68];
    stream.read_exact(&mut buf).await?;
    if buf[0] != 19 || &buf[1..20] != PSTR {
        return Err(Error::UnexpectedProtocol);
    }
    let mut ext_bits = [0u8; 8];
    ext_bits.copy_from_slice(&buf[20..28]);
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&buf[28..48]);
    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&buf[48..68]);
    Ok((ext_bits, info_hash, peer_id))
}

/// **Dial** (spec §4.4.2): outgoing connection to a known peer at a known
/// info hash.
pub async fn dial(
    addr: SocketAddr,
    conf: &HandshakeConf,
    info_hash: InfoHash,
    ext_bits: ExtensionBits,
    local_peer_id: PeerId,
) -> Result<HandshakeResult, Error> {
    timeout(
        conf.timeout,
        dial_inner(addr, conf, info_hash, ext_bits, local_peer_id),
    )
    .await
    .map_err(|_| Error::Timeout)?
}

async fn dial_inner(
    addr: SocketAddr,
    conf: &HandshakeConf,
    info_hash: InfoHash,
    ext_bits: ExtensionBits,
    local_peer_id: PeerId,
) -> Result<HandshakeResult, Error> {
    if !conf.encryption_enabled {
        let stream = TcpStream::connect(addr).await?;
        return dial_plaintext(stream, info_hash, ext_bits, local_peer_id).await;
    }

    if !conf.encryption_forced {
        let stream = TcpStream::connect(addr).await?;
        match dial_plaintext(stream, info_hash, ext_bits, local_peer_id).await {
            Ok(result) => return Ok(result),
            Err(_) => {
                log::debug!("Plaintext dial to {} failed, retrying encrypted", addr);
            }
        }
    }

    let stream = TcpStream::connect(addr).await?;
    dial_encrypted(stream, info_hash, ext_bits, local_peer_id).await
}

async fn dial_plaintext(
    mut stream: TcpStream,
    info_hash: InfoHash,
    ext_bits: ExtensionBits,
    local_peer_id: PeerId,
) -> Result<HandshakeResult, Error> {
    write_handshake(&mut stream, &ext_bits, &info_hash, &local_peer_id).await?;
    let (remote_ext_bits, remote_info_hash, remote_peer_id) = read_handshake(&mut stream).await?;
    if remote_info_hash != info_hash {
        return Err(Error::InfoHashMismatch);
    }
    if remote_peer_id == local_peer_id {
        return Err(Error::SelfConnect);
    }
    Ok(HandshakeResult {
        stream: CipherStream::plain(stream),
        cipher: Cipher::PlainText,
        ext_bits: remote_ext_bits,
        peer_id: remote_peer_id,
        info_hash: remote_info_hash,
    })
}

async fn dial_encrypted(
    mut stream: TcpStream,
    info_hash: InfoHash,
    ext_bits: ExtensionBits,
    local_peer_id: PeerId,
) -> Result<HandshakeResult, Error> {
    let keypair = KeyPair::generate();

    // Ya + PadA: PadA's length is arbitrary and never revealed, so the
    // responder will have to search for what comes after it.
    let pad_a_len = rand::thread_rng().gen_range(0..mse::MAX_PAD_LEN);
    let mut out = keypair.public_bytes();
    out.extend(random_bytes(pad_a_len));
    stream.write_all(&out).await?;

    let mut yb_buf = [0u8; mse::PUBLIC_KEY_LEN];
    stream.read_exact(&mut yb_buf).await?;
    let peer_public = mse::public_key_from_bytes(&yb_buf);
    let secret = keypair.shared_secret(&peer_public);

    let mut send_cipher = mse::derive_rc4(Direction::InitiatorToResponder, &secret, &info_hash);
    let mut recv_cipher = mse::derive_rc4(Direction::ResponderToInitiator, &secret, &info_hash);

    // req1(S) || HASH('req2', SKEY) XOR HASH('req3', S): identifies our
    // torrent to the responder without the info hash ever appearing in
    // the clear (spec §4.4.4).
    let mut req = mse::req1(&secret).to_vec();
    req.extend_from_slice(&mse::req2_xor_req3(&info_hash, &secret));
    stream.write_all(&req).await?;

    // The encrypted negotiation block: VC, crypto_provide, len(PadC),
    // PadC, len(IA); IA is empty here (the plaintext handshake follows
    // separately once encryption is established, rather than being piggy
    // backed as initial payload).
    let vc = [0u8; 8];
    let crypto_provide = (CRYPTO_PLAINTEXT | CRYPTO_RC4).to_be_bytes();
    let pad_c_len = rand::thread_rng().gen_range(0..mse::MAX_PAD_LEN);
    let pad_c = random_bytes(pad_c_len);
    let mut negotiation = Vec::new();
    negotiation.extend_from_slice(&vc);
    negotiation.extend_from_slice(&crypto_provide);
    negotiation.extend_from_slice(&(pad_c_len as u16).to_be_bytes());
    negotiation.extend_from_slice(&pad_c);
    negotiation.extend_from_slice(&0u16.to_be_bytes()); // len(IA) = 0
    send_cipher.apply_keystream(&mut negotiation);
    stream.write_all(&negotiation).await?;

    // The responder replies with ENCRYPT(VC, crypto_select, len(padD),
    // padD) keyed with the same keyB stream. Locate VC by searching for
    // where decrypting yields 8 zero bytes: since ciphertext XOR
    // keystream == plaintext and plaintext is all zero here, the
    // ciphertext at the true offset equals the keystream itself.
    let mut probe = mse::derive_rc4(Direction::ResponderToInitiator, &secret, &info_hash);
    let mut vc_keystream = [0u8; 8];
    probe.apply_keystream(&mut vc_keystream);

    let mut window = Vec::new();
    let mut chunk = [0u8; 64];
    let mut vc_offset = None;
    while window.len() < mse::MAX_PAD_LEN + 8 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::PaddingNotFound);
        }
        window.extend_from_slice(&chunk[..n]);
        if let Some(pos) = mse::find_pattern(&window, &vc_keystream) {
            vc_offset = Some(pos);
            break;
        }
    }
    let vc_offset = vc_offset.ok_or(Error::PaddingNotFound)?;

    // Catch the real decrypt cipher's keystream position up to vc_offset,
    // discarding whatever padding preceded VC.
    let mut discard = vec![0u8; vc_offset];
    recv_cipher.apply_keystream(&mut discard);

    // Decrypt VC, crypto_select, and len(padD); read more if needed.
    while window.len() < vc_offset + 8 + 4 + 2 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::PaddingNotFound);
        }
        window.extend_from_slice(&chunk[..n]);
    }
    let mut tail = window[vc_offset..vc_offset + 8 + 4 + 2].to_vec();
    recv_cipher.apply_keystream(&mut tail);
    let crypto_select = u32::from_be_bytes(tail[8..12].try_into().unwrap());
    let pad_d_len = u16::from_be_bytes(tail[12..14].try_into().unwrap()) as usize;

    while window.len() < vc_offset + 14 + pad_d_len {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        window.extend_from_slice(&chunk[..n]);
    }
    let consumed = (vc_offset + 14 + pad_d_len).min(window.len());
    let mut pad_d = window[vc_offset + 14..consumed].to_vec();
    recv_cipher.apply_keystream(&mut pad_d);

    let cipher = if crypto_select & CRYPTO_RC4 != 0 {
        Cipher::Rc4
    } else if crypto_select & CRYPTO_PLAINTEXT != 0 {
        Cipher::PlainText
    } else {
        return Err(Error::CipherNotOffered);
    };

    let mut cipher_stream = match cipher {
        Cipher::Rc4 => CipherStream::encrypted(stream, recv_cipher, send_cipher),
        Cipher::PlainText => CipherStream::plain(stream),
    };

    write_handshake(&mut cipher_stream, &ext_bits, &info_hash, &local_peer_id).await?;
    let (remote_ext_bits, remote_info_hash, remote_peer_id) =
        read_handshake(&mut cipher_stream).await?;
    if remote_info_hash != info_hash {
        return Err(Error::InfoHashMismatch);
    }
    if remote_peer_id == local_peer_id {
        return Err(Error::SelfConnect);
    }

    Ok(HandshakeResult {
        stream: cipher_stream,
        cipher,
        ext_bits: remote_ext_bits,
        peer_id: remote_peer_id,
        info_hash: remote_info_hash,
    })
}

/// **Accept** (spec §4.4.3): incoming connection whose torrent is not yet
/// known.
pub async fn accept(
    stream: TcpStream,
    conf: &HandshakeConf,
    registry: &dyn InfoHashRegistry,
    local_ext_bits: ExtensionBits,
    local_peer_id: PeerId,
) -> Result<HandshakeResult, Error> {
    timeout(
        conf.timeout,
        accept_inner(stream, conf, registry, local_ext_bits, local_peer_id),
    )
    .await
    .map_err(|_| Error::Timeout)?
}

async fn accept_inner(
    mut stream: TcpStream,
    conf: &HandshakeConf,
    registry: &dyn InfoHashRegistry,
    local_ext_bits: ExtensionBits,
    local_peer_id: PeerId,
) -> Result<HandshakeResult, Error> {
    let mut prefix = [0u8; 20];
    stream.peek(&mut prefix).await?;

    if prefix[0] == 19 && &prefix[1..20] == PSTR {
        if conf.require_encryption_inbound {
            return Err(Error::UnexpectedProtocol);
        }
        return accept_plaintext(stream, registry, local_ext_bits, local_peer_id).await;
    }

    accept_encrypted(stream, registry, local_ext_bits, local_peer_id).await
}

async fn accept_plaintext(
    mut stream: TcpStream,
    registry: &dyn InfoHashRegistry,
    local_ext_bits: ExtensionBits,
    local_peer_id: PeerId,
) -> Result<HandshakeResult, Error> {
    let (remote_ext_bits, remote_info_hash, remote_peer_id) = read_handshake(&mut stream).await?;
    if !registry.is_known(&remote_info_hash) {
        return Err(Error::InfoHashRejected);
    }
    if remote_peer_id == local_peer_id {
        return Err(Error::SelfConnect);
    }
    write_handshake(&mut stream, &local_ext_bits, &remote_info_hash, &local_peer_id).await?;
    Ok(HandshakeResult {
        stream: CipherStream::plain(stream),
        cipher: Cipher::PlainText,
        ext_bits: remote_ext_bits,
        peer_id: remote_peer_id,
        info_hash: remote_info_hash,
    })
}

async fn accept_encrypted(
    mut stream: TcpStream,
    registry: &dyn InfoHashRegistry,
    local_ext_bits: ExtensionBits,
    local_peer_id: PeerId,
) -> Result<HandshakeResult, Error> {
    let mut ya_buf = [0u8; mse::PUBLIC_KEY_LEN];
    stream.read_exact(&mut ya_buf).await?;
    let peer_public = mse::public_key_from_bytes(&ya_buf);

    let keypair = KeyPair::generate();
    let secret = keypair.shared_secret(&peer_public);

    // Yb: the dialer blocks reading this (with no PadB) right after sending
    // Ya/PadA, so it must go out before we start hunting for req1(S) in
    // whatever the dialer sends next.
    stream.write_all(&keypair.public_bytes()).await?;

    // Search the incoming stream for req1(S), the end of PadA.
    let expected_req1 = mse::req1(&secret);
    let mut window = Vec::new();
    let mut chunk = [0u8; 64];
    let mut req1_offset = None;
    while window.len() < mse::MAX_PAD_LEN + 20 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::PaddingNotFound);
        }
        window.extend_from_slice(&chunk[..n]);
        if let Some(pos) = mse::find_pattern(&window, &expected_req1) {
            req1_offset = Some(pos);
            break;
        }
    }
    let req1_offset = req1_offset.ok_or(Error::PaddingNotFound)?;

    while window.len() < req1_offset + 20 + 20 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::PaddingNotFound);
        }
        window.extend_from_slice(&chunk[..n]);
    }
    let mut wire_req2 = [0u8; 20];
    wire_req2.copy_from_slice(&window[req1_offset + 20..req1_offset + 40]);
    let candidate_req2 = mse::recover_req2(&wire_req2, &secret);

    // The registry doesn't expose a reverse SKEY->info_hash map directly
    // here, so ask it to try matching.
    let info_hash = registry
        .skey(&candidate_req2)
        .ok_or(Error::NoMatchingSKey)?;
    debug_assert_eq!(mse::req2(&info_hash), candidate_req2);

    let mut recv_cipher = mse::derive_rc4(Direction::InitiatorToResponder, &secret, &info_hash);
    let mut send_cipher = mse::derive_rc4(Direction::ResponderToInitiator, &secret, &info_hash);

    // Decrypt the initiator's negotiation block: VC, crypto_provide,
    // len(PadC), PadC, len(IA), IA.
    let negotiation_start = req1_offset + 40;
    while window.len() < negotiation_start + 8 + 4 + 2 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::PaddingNotFound);
        }
        window.extend_from_slice(&chunk[..n]);
    }
    let mut head = window[negotiation_start..negotiation_start + 14].to_vec();
    recv_cipher.apply_keystream(&mut head);
    let crypto_provide = u32::from_be_bytes(head[8..12].try_into().unwrap());
    let pad_c_len = u16::from_be_bytes(head[12..14].try_into().unwrap()) as usize;

    let ia_len_pos = negotiation_start + 14 + pad_c_len;
    while window.len() < ia_len_pos + 2 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::PaddingNotFound);
        }
        window.extend_from_slice(&chunk[..n]);
    }
    let mut pad_c_and_len = window[negotiation_start + 14..ia_len_pos + 2].to_vec();
    recv_cipher.apply_keystream(&mut pad_c_and_len);
    let ia_len = u16::from_be_bytes(
        pad_c_and_len[pad_c_len..pad_c_len + 2]
            .try_into()
            .unwrap(),
    ) as usize;

    while window.len() < ia_len_pos + 2 + ia_len {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        window.extend_from_slice(&chunk[..n]);
    }
    let ia_end = (ia_len_pos + 2 + ia_len).min(window.len());
    let mut ia = window[ia_len_pos + 2..ia_end].to_vec();
    recv_cipher.apply_keystream(&mut ia);

    let cipher = if crypto_provide & CRYPTO_RC4 != 0 {
        Cipher::Rc4
    } else if crypto_provide & CRYPTO_PLAINTEXT != 0 {
        Cipher::PlainText
    } else {
        return Err(Error::CipherNotOffered);
    };

    // Reply: ENCRYPT(VC, crypto_select, len(padD)=0, padD=empty) keyed
    // with our keyB stream.
    let vc = [0u8; 8];
    let crypto_select = cipher.id() as u32;
    let mut reply = Vec::new();
    reply.extend_from_slice(&vc);
    reply.extend_from_slice(&crypto_select.to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes());
    send_cipher.apply_keystream(&mut reply);
    stream.write_all(&reply).await?;

    let mut cipher_stream = match cipher {
        Cipher::Rc4 => CipherStream::encrypted(stream, recv_cipher, send_cipher),
        Cipher::PlainText => CipherStream::plain(stream),
    };

    let (remote_ext_bits, remote_info_hash, remote_peer_id) =
        read_handshake(&mut cipher_stream).await?;
    if remote_info_hash != info_hash {
        return Err(Error::InfoHashMismatch);
    }
    if remote_peer_id == local_peer_id {
        return Err(Error::SelfConnect);
    }
    write_handshake(&mut cipher_stream, &local_ext_bits, &info_hash, &local_peer_id).await?;

    Ok(HandshakeResult {
        stream: cipher_stream,
        cipher,
        ext_bits: remote_ext_bits,
        peer_id: remote_peer_id,
        info_hash: remote_info_hash,
    })
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_encode_decode_round_trip() {
        let ext_bits = [0x0Au8, 0, 0, 0, 0, 0, 0, 0];
        let info_hash = [0x0Eu8; 20];
        let peer_id = [0x0Cu8; 20];
        let frame = encode_handshake(&ext_bits, &info_hash, &peer_id);
        assert_eq!(frame.len(), 68);
        assert_eq!(frame[0], 19);
        assert_eq!(&frame[1..20], PSTR);
        assert_eq!(&frame[20..28], &ext_bits);
        assert_eq!(&frame[28..48], &info_hash);
        assert_eq!(&frame[48..68], &peer_id);
    }

    #[test]
    fn test_cipher_id_round_trip() {
        assert_eq!(Cipher::from_id(Cipher::PlainText.id()), Some(Cipher::PlainText));
        assert_eq!(Cipher::from_id(Cipher::Rc4.id()), Some(Cipher::Rc4));
        assert_eq!(Cipher::from_id(0xFF), None);
    }

    struct FakeRegistry {
        info_hash: InfoHash,
    }

    impl crate::contracts::InfoHashRegistry for FakeRegistry {
        fn is_known(&self, info_hash: &InfoHash) -> bool {
            *info_hash == self.info_hash
        }

        fn skey(&self, hash20: &[u8; 20]) -> Option<InfoHash> {
            if mse::req2(&self.info_hash) == *hash20 {
                Some(self.info_hash)
            } else {
                None
            }
        }
    }

    async fn run_loopback(conf: HandshakeConf) -> (HandshakeResult, HandshakeResult) {
        let mut listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let info_hash = [0x42u8; 20];
        let dialer_ext_bits = [1u8, 0, 0, 0, 0, 0, 0, 0];
        let dialer_peer_id = [0xAAu8; 20];
        let accepter_ext_bits = [2u8, 0, 0, 0, 0, 0, 0, 0];
        let accepter_peer_id = [0xBBu8; 20];
        let registry = FakeRegistry { info_hash };

        let dial_fut = dial(addr, &conf, info_hash, dialer_ext_bits, dialer_peer_id);
        let accept_fut = async {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream, &conf, &registry, accepter_ext_bits, accepter_peer_id).await
        };

        let (dial_result, accept_result) = tokio::join!(dial_fut, accept_fut);
        (dial_result.unwrap(), accept_result.unwrap())
    }

    #[tokio::test]
    async fn test_dial_accept_plaintext_round_trip() {
        let conf = HandshakeConf {
            encryption_enabled: false,
            ..HandshakeConf::default()
        };
        let (dialer_view, accepter_view) = run_loopback(conf).await;

        assert_eq!(dialer_view.cipher, Cipher::PlainText);
        assert_eq!(accepter_view.cipher, Cipher::PlainText);
        assert_eq!(dialer_view.peer_id, [0xBBu8; 20]);
        assert_eq!(accepter_view.peer_id, [0xAAu8; 20]);
        assert_eq!(dialer_view.ext_bits, [2u8, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(accepter_view.ext_bits, [1u8, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(dialer_view.info_hash, [0x42u8; 20]);
        assert_eq!(accepter_view.info_hash, [0x42u8; 20]);
    }

    #[tokio::test]
    async fn test_dial_accept_encrypted_round_trip() {
        let conf = HandshakeConf {
            encryption_enabled: true,
            encryption_forced: true,
            require_encryption_inbound: true,
            ..HandshakeConf::default()
        };
        let (dialer_view, accepter_view) = run_loopback(conf).await;

        assert_eq!(dialer_view.cipher, Cipher::Rc4);
        assert_eq!(accepter_view.cipher, Cipher::Rc4);
        assert_eq!(dialer_view.peer_id, [0xBBu8; 20]);
        assert_eq!(accepter_view.peer_id, [0xAAu8; 20]);
        assert_eq!(dialer_view.info_hash, [0x42u8; 20]);
        assert_eq!(accepter_view.info_hash, [0x42u8; 20]);
    }
}
