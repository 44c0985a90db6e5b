//! Incremental parser for items arriving on an `ra_svn` stream.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::SvnError;

use super::SvnItem;

pub(crate) type DynRead = Box<dyn AsyncRead + Unpin + Send>;

const READ_CHUNK: usize = 16 * 1024;
const MAX_GARBAGE: usize = 64 * 1024;
const PREVIEW_MAX: usize = 1024;

/// Buffers the read half of a connection and parses one item at a time.
///
/// Lists are parsed with an explicit stack so deeply nested input cannot
/// exhaust the call stack. End of list is a structural token, never an error.
pub(crate) struct ItemReader {
    read: DynRead,
    buf: Vec<u8>,
    pos: usize,
    timeout: Duration,
}

impl ItemReader {
    pub(crate) fn new(read: DynRead, timeout: Duration) -> Self {
        Self {
            read,
            buf: Vec::new(),
            pos: 0,
            timeout,
        }
    }

    /// Reads one complete item, failing if it does not arrive within the
    /// read timeout.
    pub(crate) async fn read_item(&mut self) -> Result<SvnItem, SvnError> {
        tokio::time::timeout(self.timeout, self.read_item_inner())
            .await
            .map_err(|_| SvnError::timed_out("read"))?
    }

    /// Discards anything a tunnel prints before the greeting, such as a
    /// login banner, up to the first `(` followed by whitespace.
    pub(crate) async fn skip_leading_garbage(&mut self) -> Result<(), SvnError> {
        let mut discarded = 0usize;
        let mut preview = Vec::new();
        loop {
            if let Some(start) = self.buf[self.pos..]
                .windows(2)
                .position(|w| w[0] == b'(' && w[1].is_ascii_whitespace())
            {
                discarded += start;
                if discarded > 0 {
                    debug!(bytes = discarded, "skipped tunnel output before greeting");
                }
                self.pos += start;
                return Ok(());
            }

            // The last byte may be a `(` whose whitespace has not arrived yet.
            let keep_from = self.buf.len().saturating_sub(1).max(self.pos);
            let dropped = &self.buf[self.pos..keep_from];
            discarded += dropped.len();
            let take = dropped.len().min(PREVIEW_MAX - preview.len());
            preview.extend_from_slice(&dropped[..take]);
            if discarded > MAX_GARBAGE {
                return Err(SvnError::Protocol(format!(
                    "tunnel produced non-svn output before greeting; discarded >{MAX_GARBAGE} bytes; start of output: {:?}",
                    String::from_utf8_lossy(&preview)
                )));
            }
            self.pos = keep_from;

            tokio::time::timeout(self.timeout, self.fill())
                .await
                .map_err(|_| SvnError::timed_out("read"))??;
        }
    }

    /// Returns `true` if an item has started arriving, without waiting.
    ///
    /// An orderly close by the peer is reported as an EOF error.
    pub(crate) async fn data_available(&mut self) -> Result<bool, SvnError> {
        self.skip_buffered_ws();
        if self.pos < self.buf.len() {
            return Ok(true);
        }
        self.compact();

        let mut temp = [0u8; READ_CHUNK];
        match tokio::time::timeout(Duration::from_millis(0), self.read.read(&mut temp)).await {
            Ok(Ok(0)) => Err(SvnError::Protocol("unexpected EOF".into())),
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&temp[..n]);
                self.skip_buffered_ws();
                Ok(self.pos < self.buf.len())
            }
            Ok(Err(err)) => Err(SvnError::Io(err)),
            Err(_) => Ok(false),
        }
    }

    fn skip_buffered_ws(&mut self) {
        while self.pos < self.buf.len() && self.buf[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    async fn read_item_inner(&mut self) -> Result<SvnItem, SvnError> {
        self.skip_ws().await?;
        if self.peek_byte().await? == b'(' {
            return self.read_list().await;
        }
        self.read_atom().await
    }

    async fn read_list(&mut self) -> Result<SvnItem, SvnError> {
        self.consume_byte().await?;
        self.require_ws().await?;

        let mut stack: Vec<Vec<SvnItem>> = vec![Vec::new()];
        loop {
            self.skip_ws().await?;
            match self.peek_byte().await? {
                b')' => {
                    self.consume_byte().await?;
                    self.require_ws().await?;
                    let completed = stack
                        .pop()
                        .ok_or_else(|| SvnError::Protocol("list stack underflow".into()))?;
                    let item = SvnItem::List(completed);
                    match stack.last_mut() {
                        Some(parent) => parent.push(item),
                        None => return Ok(item),
                    }
                }
                b'(' => {
                    self.consume_byte().await?;
                    self.require_ws().await?;
                    stack.push(Vec::new());
                }
                _ => {
                    let atom = self.read_atom().await?;
                    stack
                        .last_mut()
                        .ok_or_else(|| SvnError::Protocol("list stack underflow".into()))?
                        .push(atom);
                }
            }
        }
    }

    async fn read_atom(&mut self) -> Result<SvnItem, SvnError> {
        if self.peek_byte().await?.is_ascii_digit() {
            let n = self.parse_digits().await?;
            if self.peek_byte().await? == b':' {
                self.consume_byte().await?;
                let len = usize::try_from(n)
                    .map_err(|_| SvnError::Protocol("string length overflow".into()))?;
                let bytes = self.read_exact_vec(len).await?;
                self.require_ws().await?;
                return Ok(SvnItem::String(bytes));
            }
            self.require_ws().await?;
            return Ok(SvnItem::Number(n));
        }

        let word = self.parse_word().await?;
        self.require_ws().await?;
        Ok(match word.as_str() {
            "true" => SvnItem::Bool(true),
            "false" => SvnItem::Bool(false),
            _ => SvnItem::Word(word),
        })
    }

    async fn read_exact_vec(&mut self, n: usize) -> Result<Vec<u8>, SvnError> {
        let mut out = Vec::with_capacity(n.min(READ_CHUNK));
        while out.len() < n {
            if self.pos < self.buf.len() {
                let take = (n - out.len()).min(self.buf.len() - self.pos);
                out.extend_from_slice(&self.buf[self.pos..self.pos + take]);
                self.pos += take;
            } else {
                self.fill().await?;
            }
        }
        Ok(out)
    }

    async fn fill(&mut self) -> Result<(), SvnError> {
        self.compact();
        let mut temp = [0u8; READ_CHUNK];
        let n = self.read.read(&mut temp).await?;
        if n == 0 {
            return Err(SvnError::Protocol("unexpected EOF".into()));
        }
        self.buf.extend_from_slice(&temp[..n]);
        Ok(())
    }

    async fn peek_byte(&mut self) -> Result<u8, SvnError> {
        while self.pos >= self.buf.len() {
            self.fill().await?;
        }
        Ok(self.buf[self.pos])
    }

    async fn consume_byte(&mut self) -> Result<u8, SvnError> {
        let b = self.peek_byte().await?;
        self.pos += 1;
        Ok(b)
    }

    async fn skip_ws(&mut self) -> Result<(), SvnError> {
        while self.peek_byte().await?.is_ascii_whitespace() {
            self.pos += 1;
        }
        Ok(())
    }

    async fn require_ws(&mut self) -> Result<(), SvnError> {
        if self.consume_byte().await?.is_ascii_whitespace() {
            Ok(())
        } else {
            Err(SvnError::Protocol("expected whitespace".into()))
        }
    }

    async fn parse_digits(&mut self) -> Result<u64, SvnError> {
        let mut n = 0u64;
        loop {
            let b = self.peek_byte().await?;
            if !b.is_ascii_digit() {
                return Ok(n);
            }
            self.pos += 1;
            n = n
                .checked_mul(10)
                .and_then(|v| v.checked_add(u64::from(b - b'0')))
                .ok_or_else(|| SvnError::Protocol("number overflow".into()))?;
        }
    }

    async fn parse_word(&mut self) -> Result<String, SvnError> {
        let mut bytes = Vec::new();
        loop {
            let b = self.peek_byte().await?;
            if b.is_ascii_whitespace() {
                break;
            }
            if matches!(b, b'(' | b')' | b':') {
                return Err(SvnError::Protocol("invalid word token".into()));
            }
            self.pos += 1;
            bytes.push(b);
        }
        String::from_utf8(bytes).map_err(|_| SvnError::Protocol("non-utf8 word".into()))
    }
}
