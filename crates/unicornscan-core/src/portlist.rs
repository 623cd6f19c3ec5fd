//! Port-list parsing and iteration
//!
//! Grammar: comma-separated terms, each a single port or an inclusive range,
//! optionally suffixed with `:N` to request N payload variants per port:
//!
//! ```text
//! 80,443,1000-2000:3
//! ```
//!
//! Entries are packed the same way the wire-facing workunits carry them: the
//! payload count lives in the high 16 bits of an `i32`, the port in the low
//! 16 (`(count << 16) | port`). Iteration is ordered by default; a Blackrock
//! permutation gives a shuffled order with full coverage.

use crate::crypto::BlackRock;
use crate::error::{Error, Result};
use std::fmt;

/// One port entry with its payload variant count packed in the high bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortEntry(i32);

impl PortEntry {
    /// Pack a port and payload count.
    pub fn new(port: u16, payload_count: u16) -> Self {
        PortEntry(((payload_count as i32) << 16) | port as i32)
    }

    /// The destination port.
    pub fn port(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Number of payload variants to emit for this port (at least 1 in
    /// practice; 0 is preserved if explicitly requested).
    pub fn payload_count(&self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }

    /// The raw packed value as it travels in workunits.
    pub fn packed(&self) -> i32 {
        self.0
    }

    /// Rebuild from a packed value.
    pub fn from_packed(raw: i32) -> Self {
        PortEntry(raw)
    }
}

/// A parsed port list expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortList {
    entries: Vec<PortEntry>,
    source: String,
}

impl PortList {
    /// Parse a port list expression.
    ///
    /// # Examples
    ///
    /// ```
    /// use unicornscan_core::portlist::PortList;
    ///
    /// let list = PortList::parse("80,443:2,8000-8002").unwrap();
    /// assert_eq!(list.len(), 5);
    /// assert_eq!(list.entries()[1].port(), 443);
    /// assert_eq!(list.entries()[1].payload_count(), 2);
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidPortList("empty port expression".to_string()));
        }

        let mut entries = Vec::new();
        for term in trimmed.split(',') {
            let term = term.trim();
            if term.is_empty() {
                return Err(Error::InvalidPortList(format!(
                    "empty term in `{}`",
                    input
                )));
            }

            // Optional payload-count suffix.
            let (range_part, count) = match term.split_once(':') {
                Some((r, c)) => {
                    let count: u16 = c.parse().map_err(|_| {
                        Error::InvalidPortList(format!("bad payload count `{}`", c))
                    })?;
                    if count > 16 {
                        return Err(Error::InvalidPortList(format!(
                            "payload count {} exceeds 16 (4-bit source-port encoding)",
                            count
                        )));
                    }
                    (r, count)
                }
                None => (term, 1),
            };

            match range_part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u16 = lo.trim().parse().map_err(|_| {
                        Error::InvalidPortList(format!("bad port `{}`", lo))
                    })?;
                    let hi: u16 = hi.trim().parse().map_err(|_| {
                        Error::InvalidPortList(format!("bad port `{}`", hi))
                    })?;
                    if hi < lo {
                        return Err(Error::InvalidPortList(format!(
                            "range end {} below start {}",
                            hi, lo
                        )));
                    }
                    for p in lo..=hi {
                        entries.push(PortEntry::new(p, count));
                    }
                }
                None => {
                    let p: u16 = range_part.trim().parse().map_err(|_| {
                        Error::InvalidPortList(format!("bad port `{}`", range_part))
                    })?;
                    entries.push(PortEntry::new(p, count));
                }
            }
        }

        Ok(Self {
            entries,
            source: trimmed.to_string(),
        })
    }

    /// The default quick list used when the user gives no `-p`.
    pub fn default_quick() -> Self {
        // Common service ports, one payload each.
        PortList::parse("7,11,13,21,22,23,25,53,79,80,110,111,135,139,143,443,445,993,995,1433,3306,3389,5432,8080")
            .unwrap_or_else(|_| PortList {
                entries: vec![PortEntry::new(80, 1)],
                source: "80".to_string(),
            })
    }

    /// Entries in parse order.
    pub fn entries(&self) -> &[PortEntry] {
        &self.entries
    }

    /// Total number of (port, payload-chain) entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total probe count including payload variants.
    pub fn probe_count(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.payload_count().max(1) as u64)
            .sum()
    }

    /// The original expression, for workunit serialization.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Iterate entries in parse order.
    pub fn iter(&self) -> impl Iterator<Item = PortEntry> + '_ {
        self.entries.iter().copied()
    }

    /// Iterate entries in a shuffled order determined by `seed`.
    ///
    /// Uses a Feistel permutation, so every entry is visited exactly once.
    pub fn iter_shuffled(&self, seed: u64) -> impl Iterator<Item = PortEntry> + '_ {
        let rock = BlackRock::new(self.entries.len().max(1) as u64, seed, 3);
        (0..self.entries.len() as u64).map(move |i| self.entries[rock.shuffle(i) as usize])
    }
}

impl fmt::Display for PortList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}
