//! Content digests and hashing readers.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll, ready};

use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::RegistryError;

const SHA256: &str = "sha256";

/// A `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Digest of an in-memory buffer.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self {
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// The digest algorithm.
    pub fn algorithm(&self) -> &'static str {
        SHA256
    }

    /// The lowercase hex encoded hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SHA256}:{}", self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidDigest(s.to_string());
        let (algorithm, hex) = s.split_once(':').ok_or_else(invalid)?;
        if algorithm != SHA256
            || hex.len() != 64
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(invalid());
        }
        Ok(Self { hex: hex.into() })
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// A reader which hashes everything read through it.
#[pin_project]
#[derive(Debug)]
pub struct DigestReader<R> {
    #[pin]
    inner: R,
    hasher: Sha256,
    failure: Option<(io::ErrorKind, String)>,
}

impl<R> DigestReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            failure: None,
        }
    }

    /// The error reported by the wrapped reader, if reading it failed.
    pub fn failure(&self) -> Option<(io::ErrorKind, &str)> {
        self.failure
            .as_ref()
            .map(|(kind, reason)| (*kind, reason.as_str()))
    }

    /// Digest of the bytes read so far.
    pub fn digest(&self) -> Digest {
        Digest::from_hasher(self.hasher.clone())
    }
}

impl<R: AsyncRead> AsyncRead for DigestReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        if let Err(error) = ready!(this.inner.poll_read(cx, buf)) {
            *this.failure = Some((error.kind(), error.to_string()));
            return Poll::Ready(Err(error));
        }
        this.hasher.update(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}
