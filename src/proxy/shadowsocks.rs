//! Shadowsocks client protocol
//!
//! Wraps the transport connection in an AEAD stream and sends the
//! target address, SOCKS5-encoded, as the leading payload. The stream
//! format is the standard Shadowsocks AEAD framing: a random salt,
//! then chunks of `[encrypted 2-byte length][encrypted payload]`, each
//! sealed with an incrementing little-endian nonce. Session subkeys
//! are derived from the master key and salt with HKDF-SHA1.

use crate::addr::Address;
use crate::error::{Result, SockchainError};
use crate::proxy::Kwargs;
use crate::stream::BoxedStream;
use bytes::{Buf, BytesMut};
use md5::{Digest, Md5};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM, CHACHA20_POLY1305};
use ring::rand::{SecureRandom, SystemRandom};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

/// AEAD authentication tag length, common to all supported ciphers
const TAG_LEN: usize = 16;
/// Maximum payload bytes per AEAD chunk
const MAX_PAYLOAD: usize = 0x3FFF;
/// Ciphertext buffered beyond this makes writers drain before sealing
const WRITE_BUF_LIMIT: usize = 4 * (MAX_PAYLOAD + TAG_LEN + 2 + TAG_LEN);

/// Supported AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// chacha20-ietf-poly1305, the default
    Chacha20IetfPoly1305,
    /// aes-256-gcm
    Aes256Gcm,
    /// aes-128-gcm
    Aes128Gcm,
}

impl CipherKind {
    /// Look up a cipher by its configuration name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "chacha20-ietf-poly1305" => Ok(CipherKind::Chacha20IetfPoly1305),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            other => Err(SockchainError::Config(format!(
                "unknown cipher `{other}`"
            ))),
        }
    }

    fn algorithm(&self) -> &'static ring::aead::Algorithm {
        match self {
            CipherKind::Chacha20IetfPoly1305 => &CHACHA20_POLY1305,
            CipherKind::Aes256Gcm => &AES_256_GCM,
            CipherKind::Aes128Gcm => &AES_128_GCM,
        }
    }

    /// Master key length; the salt has the same length.
    pub fn key_len(&self) -> usize {
        self.algorithm().key_len()
    }
}

/// Shadowsocks client hop dialer
#[derive(Debug)]
pub struct ShadowsocksDialer {
    network: &'static str,
    address: String,
    kwargs: Kwargs,
    cipher: CipherKind,
    key: Vec<u8>,
}

impl ShadowsocksDialer {
    /// Create a dialer for the server at `address` with the given
    /// cipher name and password.
    pub fn new(
        network: &'static str,
        address: &str,
        kwargs: Kwargs,
        method: &str,
        password: &str,
    ) -> Result<Self> {
        let cipher = CipherKind::from_name(method)?;
        let key = derive_key(password, cipher.key_len());
        Ok(ShadowsocksDialer {
            network,
            address: address.to_string(),
            kwargs,
            cipher,
            key,
        })
    }

    /// The protocol tag.
    pub fn protocol(&self) -> &str {
        "ss"
    }

    /// The transport network used to reach the server.
    pub fn network(&self) -> &str {
        self.network
    }

    /// The server's address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The hop's options.
    pub fn kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    /// Wrap `conn` in the cipher stream and send the target address
    /// as the leading payload.
    pub async fn dial_over(
        &self,
        conn: BoxedStream,
        _network: &str,
        address: &str,
    ) -> Result<BoxedStream> {
        let target = Address::parse(address)?;
        let mut stream = ShadowsocksStream::new(conn, self.cipher, self.key.clone());
        stream.write_all(&target.to_socks5_bytes()?).await?;
        stream.flush().await?;
        debug!("ss {} tunneling to {}", self.address, target);
        Ok(Box::new(stream))
    }
}

/// EVP_BytesToKey-style MD5 key derivation from a password.
fn derive_key(password: &str, len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(len + 16);
    let mut last: Option<[u8; 16]> = None;
    while key.len() < len {
        let mut hasher = Md5::new();
        if let Some(digest) = last {
            hasher.update(digest);
        }
        hasher.update(password.as_bytes());
        let digest: [u8; 16] = hasher.finalize().into();
        key.extend_from_slice(&digest);
        last = Some(digest);
    }
    key.truncate(len);
    key
}

const SS_SUBKEY_INFO: &[&[u8]] = &[b"ss-subkey"];

struct KeyLen(usize);

impl ring::hkdf::KeyType for KeyLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive the per-session subkey from the master key and salt.
fn session_key(key: &[u8], salt: &[u8]) -> io::Result<Vec<u8>> {
    let mut subkey = vec![0u8; key.len()];
    ring::hkdf::Salt::new(ring::hkdf::HKDF_SHA1_FOR_LEGACY_USE_ONLY, salt)
        .extract(key)
        .expand(SS_SUBKEY_INFO, KeyLen(key.len()))
        .and_then(|okm| okm.fill(&mut subkey))
        .map_err(|_| cipher_error())?;
    Ok(subkey)
}

fn cipher_error() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "shadowsocks cipher failure")
}

/// Incrementing little-endian AEAD nonce
#[derive(Default)]
struct NonceCounter([u8; 12]);

impl NonceCounter {
    fn next(&mut self) -> Nonce {
        let nonce = Nonce::assume_unique_for_key(self.0);
        for byte in self.0.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
        nonce
    }
}

struct Direction {
    key: LessSafeKey,
    nonce: NonceCounter,
}

impl Direction {
    fn new(algorithm: &'static ring::aead::Algorithm, subkey: &[u8]) -> io::Result<Self> {
        let key = UnboundKey::new(algorithm, subkey).map_err(|_| cipher_error())?;
        Ok(Direction {
            key: LessSafeKey::new(key),
            nonce: NonceCounter::default(),
        })
    }

    fn seal(&mut self, plaintext: &[u8], out: &mut BytesMut) -> io::Result<()> {
        let mut block = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(self.nonce.next(), Aad::empty(), &mut block)
            .map_err(|_| cipher_error())?;
        out.extend_from_slice(&block);
        Ok(())
    }

    fn open(&mut self, ciphertext: &mut [u8]) -> io::Result<usize> {
        let plaintext = self
            .key
            .open_in_place(self.nonce.next(), Aad::empty(), ciphertext)
            .map_err(|_| cipher_error())?;
        Ok(plaintext.len())
    }
}

enum ReadState {
    /// Waiting for the peer's salt
    Salt,
    /// Waiting for an encrypted length chunk
    Length,
    /// Waiting for an encrypted payload of the given length
    Payload(usize),
}

/// AEAD-framed stream over a plain transport connection
pub struct ShadowsocksStream {
    inner: BoxedStream,
    cipher: CipherKind,
    key: Vec<u8>,

    seal: Option<Direction>,
    write_buf: BytesMut,

    open: Option<Direction>,
    read_state: ReadState,
    read_raw: BytesMut,
    read_plain: BytesMut,
}

impl ShadowsocksStream {
    /// Wrap a connection. The salt goes out lazily with the first
    /// write; the peer's salt is consumed by the first read.
    pub fn new(inner: BoxedStream, cipher: CipherKind, key: Vec<u8>) -> Self {
        ShadowsocksStream {
            inner,
            cipher,
            key,
            seal: None,
            write_buf: BytesMut::new(),
            open: None,
            read_state: ReadState::Salt,
            read_raw: BytesMut::new(),
            read_plain: BytesMut::new(),
        }
    }

    /// Generate our salt and set up the sealing direction.
    fn init_seal(&mut self) -> io::Result<()> {
        let mut salt = vec![0u8; self.cipher.key_len()];
        SystemRandom::new()
            .fill(&mut salt)
            .map_err(|_| cipher_error())?;
        let subkey = session_key(&self.key, &salt)?;
        self.seal = Some(Direction::new(self.cipher.algorithm(), &subkey)?);
        self.write_buf.extend_from_slice(&salt);
        Ok(())
    }

    /// Push buffered ciphertext into the transport until empty or the
    /// transport is not ready.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "transport closed mid-write",
                )));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    /// Decrypt as much of the raw buffer as the framing allows.
    fn advance_read_state(&mut self) -> io::Result<()> {
        loop {
            match self.read_state {
                ReadState::Salt => {
                    let salt_len = self.cipher.key_len();
                    if self.read_raw.len() < salt_len {
                        return Ok(());
                    }
                    let salt = self.read_raw.split_to(salt_len);
                    let subkey = session_key(&self.key, &salt)?;
                    self.open = Some(Direction::new(self.cipher.algorithm(), &subkey)?);
                    self.read_state = ReadState::Length;
                }
                ReadState::Length => {
                    if self.read_raw.len() < 2 + TAG_LEN {
                        return Ok(());
                    }
                    let mut block = self.read_raw.split_to(2 + TAG_LEN);
                    let open = self.open.as_mut().expect("open key set after salt");
                    open.open(&mut block)?;
                    let len = u16::from_be_bytes([block[0], block[1]]) as usize & MAX_PAYLOAD;
                    self.read_state = ReadState::Payload(len);
                }
                ReadState::Payload(len) => {
                    if self.read_raw.len() < len + TAG_LEN {
                        return Ok(());
                    }
                    let mut block = self.read_raw.split_to(len + TAG_LEN);
                    let open = self.open.as_mut().expect("open key set after salt");
                    let n = open.open(&mut block)?;
                    self.read_plain.extend_from_slice(&block[..n]);
                    self.read_state = ReadState::Length;
                }
            }
        }
    }

    /// Whether an EOF at the current position is a clean end of
    /// stream rather than a truncated chunk.
    fn at_chunk_boundary(&self) -> bool {
        self.read_raw.is_empty()
            && matches!(self.read_state, ReadState::Salt | ReadState::Length)
    }
}

impl AsyncRead for ShadowsocksStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_plain.is_empty() {
                let n = this.read_plain.len().min(buf.remaining());
                buf.put_slice(&this.read_plain.split_to(n));
                return Poll::Ready(Ok(()));
            }

            this.advance_read_state()?;
            if !this.read_plain.is_empty() {
                continue;
            }

            let mut chunk = [0u8; 8192];
            let mut read_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                if this.at_chunk_boundary() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated shadowsocks stream",
                )));
            }
            this.read_raw.extend_from_slice(filled);
        }
    }
}

impl AsyncWrite for ShadowsocksStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // keep buffered ciphertext bounded before sealing more
        if this.write_buf.len() >= WRITE_BUF_LIMIT {
            ready!(this.poll_drain(cx))?;
        }

        if this.seal.is_none() {
            this.init_seal()?;
        }

        let n = buf.len().min(MAX_PAYLOAD);
        let seal = this.seal.as_mut().expect("seal key initialized above");
        let length = (n as u16).to_be_bytes();
        let mut sealed = BytesMut::with_capacity(2 + TAG_LEN + n + TAG_LEN);
        seal.seal(&length, &mut sealed)?;
        seal.seal(&buf[..n], &mut sealed)?;
        this.write_buf.extend_from_slice(&sealed);

        // opportunistic drain; leftover ciphertext goes out on flush
        let _ = this.poll_drain(cx)?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
