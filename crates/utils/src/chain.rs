/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The chain buffer: an ordered sequence of fixed-size blocks forming a
//! byte stream. It is the carrier for message bodies, protocol responses
//! and header parsing (spec §4.1). Iterators are scoped to a single
//! handler call and are never shared across threads.

use std::fmt;

const BLOCK_SIZE: usize = 4096;

#[derive(Default)]
pub struct Chain {
    blocks: Vec<Vec<u8>>,
    len: usize,
}

impl Chain {
    pub fn new() -> Self {
        Chain {
            blocks: Vec::new(),
            len: 0,
        }
    }

    pub fn with_capacity(bytes: usize) -> Self {
        let mut chain = Chain::new();
        chain.blocks.reserve(bytes / BLOCK_SIZE + 1);
        chain
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }

    /// Appends bytes at the end of the chain, splitting across blocks as
    /// needed. Concurrent append during iteration is a logic error the
    /// caller must avoid (chains are never shared between threads).
    pub fn append(&mut self, mut bytes: &[u8]) {
        self.len += bytes.len();
        loop {
            let last_has_room = self
                .blocks
                .last()
                .map(|b| b.len() < BLOCK_SIZE)
                .unwrap_or(false);
            if !last_has_room {
                self.blocks.push(Vec::with_capacity(BLOCK_SIZE));
            }
            let block = self.blocks.last_mut().unwrap();
            let room = BLOCK_SIZE - block.len();
            if bytes.len() <= room {
                block.extend_from_slice(bytes);
                break;
            } else {
                let (head, tail) = bytes.split_at(room);
                block.extend_from_slice(head);
                bytes = tail;
            }
        }
    }

    /// Copies the whole chain out into one contiguous buffer.
    pub fn copy_out(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
        out
    }

    /// Returns the trailing `n` bytes of the chain without allocating the
    /// whole buffer — used by the DATA terminator detector, which only
    /// needs to look at the last 5 bytes after each recv.
    pub fn tail(&self, n: usize) -> Vec<u8> {
        let full = self.copy_out();
        let start = full.len().saturating_sub(n);
        full[start..].to_vec()
    }

    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            block: 0,
            offset: 0,
        }
    }

    /// Case-insensitive comparison of the chain's leading bytes against a
    /// literal, e.g. `chain.starts_with_ignore_case(b"MAIL FROM")`.
    pub fn starts_with_ignore_case(&self, literal: &[u8]) -> bool {
        if self.len < literal.len() {
            return false;
        }
        self.iter()
            .take(literal.len())
            .zip(literal.iter())
            .all(|(a, b)| a.to_ascii_uppercase() == b.to_ascii_uppercase())
    }

    /// Splits the chain into lines on CRLF, returning each line's bytes
    /// (without the terminator). Used by line-oriented protocol parsing.
    pub fn lines(&self) -> Vec<Vec<u8>> {
        let data = self.copy_out();
        data.split(|&b| b == b'\n')
            .map(|line| {
                if line.last() == Some(&b'\r') {
                    line[..line.len() - 1].to_vec()
                } else {
                    line.to_vec()
                }
            })
            .collect()
    }
}

pub struct ChainIter<'a> {
    chain: &'a Chain,
    block: usize,
    offset: usize,
}

impl Iterator for ChainIter<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        loop {
            let block = self.chain.blocks.get(self.block)?;
            if self.offset < block.len() {
                let byte = block[self.offset];
                self.offset += 1;
                return Some(byte);
            }
            self.block += 1;
            self.offset = 0;
        }
    }
}

/// A bounded printf-like formatter over a chain: writes up to `max_len`
/// bytes and silently truncates past that (protocol responses are always
/// small and bounded; a truncated response is still a valid line).
pub struct BoundedWriter<'a> {
    chain: &'a mut Chain,
    remaining: usize,
}

impl<'a> BoundedWriter<'a> {
    pub fn new(chain: &'a mut Chain, max_len: usize) -> Self {
        BoundedWriter {
            chain,
            remaining: max_len,
        }
    }
}

impl fmt::Write for BoundedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let take = bytes.len().min(self.remaining);
        self.chain.append(&bytes[..take]);
        self.remaining -= take;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn append_spans_blocks() {
        let mut chain = Chain::new();
        let payload = vec![b'x'; BLOCK_SIZE + 100];
        chain.append(&payload);
        assert_eq!(chain.len(), payload.len());
        assert_eq!(chain.copy_out(), payload);
    }

    #[test]
    fn case_insensitive_prefix() {
        let mut chain = Chain::new();
        chain.append(b"mail from:<a@b.test>");
        assert!(chain.starts_with_ignore_case(b"MAIL FROM"));
        assert!(!chain.starts_with_ignore_case(b"RCPT TO"));
    }

    #[test]
    fn tail_detects_terminator() {
        let mut chain = Chain::new();
        chain.append(b"hello\r\n.\r\n");
        assert_eq!(chain.tail(5), b"\r\n.\r\n".to_vec());
    }

    #[test]
    fn bounded_writer_truncates() {
        let mut chain = Chain::new();
        {
            let mut w = BoundedWriter::new(&mut chain, 5);
            let _ = write!(w, "hello world");
        }
        assert_eq!(chain.len(), 5);
        assert_eq!(chain.copy_out(), b"hello");
    }
}
