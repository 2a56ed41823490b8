//! Per-method exception clause tables.
//!
//! The table is a count followed by that many clauses, all in the variable-length unsigned
//! encoding of [`crate::image::NativeParser::decode_unsigned`]:
//!
//! ```text
//! count
//! repeat count times:
//!     try_start
//!     try_length << 2 | kind
//!     TYPED:  handler_offset, type_symbol (u32 LE), handler_function (u32 LE)
//!     FAULT:  handler_offset
//!     FILTER: handler_offset, filter_offset
//!     UNUSED: -
//! ```
//!
//! Clauses are stored innermost first. The dispatcher relies on that order and never sorts.

use strum::{Display, EnumIter, FromRepr};

use crate::{
    image::{encode_unsigned, NativeParser},
    Result,
};

const CLAUSE_KIND_MASK: u32 = 0x3;
const CLAUSE_KIND_BITS: u32 = 2;

/// Kind of an exception clause, stored in the low two bits of the length word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[repr(u8)]
pub enum ClauseKind {
    /// `catch (T)`: matches when the exception is an instance of the clause type
    Typed = 0,
    /// `finally` or `fault`: runs while unwinding
    Fault = 1,
    /// `catch when (...)`: matches when the filter funclet returns true
    Filter = 2,
    /// Placeholder separating runs of try regions with identical offsets
    Unused = 3,
}

/// One decoded exception clause.
///
/// Offsets are relative to the start of the method's code. Fields that the clause kind does
/// not carry are zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EHClause {
    /// Clause kind
    pub kind: ClauseKind,
    /// First offset covered by the try region
    pub try_start_offset: u32,
    /// First offset past the try region
    pub try_end_offset: u32,
    /// Handler funclet offset
    pub handler_offset: u32,
    /// Filter funclet offset, FILTER only
    pub filter_offset: u32,
    /// Symbol of the caught type, TYPED only
    pub type_symbol: u32,
    /// Absolute handler function, TYPED only; 0 means `handler_offset` applies
    pub handler_function: u32,
}

impl EHClause {
    fn new(kind: ClauseKind, try_start_offset: u32, try_end_offset: u32) -> Self {
        debug_assert!(try_start_offset <= try_end_offset);
        EHClause {
            kind,
            try_start_offset,
            try_end_offset,
            handler_offset: 0,
            filter_offset: 0,
            type_symbol: 0,
            handler_function: 0,
        }
    }

    /// A typed catch over `[try_start, try_end)`
    #[must_use]
    pub fn typed(
        try_start: u32,
        try_end: u32,
        handler_offset: u32,
        type_symbol: u32,
        handler_function: u32,
    ) -> Self {
        EHClause {
            handler_offset,
            type_symbol,
            handler_function,
            ..Self::new(ClauseKind::Typed, try_start, try_end)
        }
    }

    /// A finally or fault over `[try_start, try_end)`
    #[must_use]
    pub fn fault(try_start: u32, try_end: u32, handler_offset: u32) -> Self {
        EHClause {
            handler_offset,
            ..Self::new(ClauseKind::Fault, try_start, try_end)
        }
    }

    /// A filtered catch over `[try_start, try_end)`
    #[must_use]
    pub fn filter(try_start: u32, try_end: u32, handler_offset: u32, filter_offset: u32) -> Self {
        EHClause {
            handler_offset,
            filter_offset,
            ..Self::new(ClauseKind::Filter, try_start, try_end)
        }
    }

    /// An unused separator entry
    #[must_use]
    pub fn unused(try_start: u32, try_end: u32) -> Self {
        Self::new(ClauseKind::Unused, try_start, try_end)
    }

    /// Returns true if `offset` lies in `[try_start, try_end)`
    #[must_use]
    pub fn contains_code_offset(&self, offset: u32) -> bool {
        offset >= self.try_start_offset && offset < self.try_end_offset
    }

    /// Returns true if the try region starts exactly at `offset`
    #[must_use]
    pub fn try_starts_at(&self, offset: u32) -> bool {
        self.try_start_offset == offset
    }

    /// Returns true if both clauses protect the same try region
    #[must_use]
    pub fn same_try_region(&self, other: &EHClause) -> bool {
        self.try_start_offset == other.try_start_offset
            && self.try_end_offset == other.try_end_offset
    }

    /// Entry point of the handler for a method whose code starts at `code_start`
    #[must_use]
    pub fn handler_address(&self, code_start: u64) -> u64 {
        if self.kind == ClauseKind::Typed && self.handler_function != 0 {
            u64::from(self.handler_function)
        } else {
            code_start + u64::from(self.handler_offset)
        }
    }

    /// Entry point of the filter funclet for a method whose code starts at `code_start`
    #[must_use]
    pub fn filter_address(&self, code_start: u64) -> u64 {
        debug_assert_eq!(self.kind, ClauseKind::Filter);
        code_start + u64::from(self.filter_offset)
    }
}

/// Cursor over a clause table.
///
/// Yields `Ok(clause)` once per clause and stops after the count read from the table header. A
/// decoding failure is yielded once as `Err` and ends the iteration. Each dispatch pass builds
/// its own iterator.
///
/// # Examples
///
/// ```rust
/// use eeruntime::runtime::exceptions::{ClauseKind, ClauseTableBuilder, EHClause, EHClauseIterator};
///
/// let table = ClauseTableBuilder::new()
///     .clause(EHClause::fault(0x10, 0x40, 0x80))
///     .clause(EHClause::typed(0x00, 0x60, 0xA0, 0x3000, 0))
///     .encode();
///
/// let kinds = EHClauseIterator::new(&table)?
///     .map(|clause| clause.map(|c| c.kind))
///     .collect::<eeruntime::Result<Vec<_>>>()?;
/// assert_eq!(kinds, vec![ClauseKind::Fault, ClauseKind::Typed]);
/// # Ok::<(), eeruntime::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct EHClauseIterator<'a> {
    parser: NativeParser<'a>,
    total_clauses: u32,
    current_clause: u32,
}

impl<'a> EHClauseIterator<'a> {
    /// Start reading the clause table at the beginning of `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the clause count cannot be decoded.
    pub fn new(table: &'a [u8]) -> Result<Self> {
        let mut parser = NativeParser::new(table);
        let total_clauses = parser.decode_unsigned()?;
        Ok(EHClauseIterator {
            parser,
            total_clauses,
            current_clause: 0,
        })
    }

    /// Number of clauses in the table
    #[must_use]
    pub fn total_clauses(&self) -> u32 {
        self.total_clauses
    }

    fn read_clause(&mut self) -> Result<EHClause> {
        let try_start = self.parser.decode_unsigned()?;
        let length_and_kind = self.parser.decode_unsigned()?;
        let try_end = (length_and_kind >> CLAUSE_KIND_BITS)
            .checked_add(try_start)
            .ok_or_else(|| malformed_error!("Try region at 0x{:X} overflows", try_start))?;

        // Two bits always name a kind.
        let kind = ClauseKind::from_repr((length_and_kind & CLAUSE_KIND_MASK) as u8)
            .unwrap_or(ClauseKind::Unused);

        let mut clause = EHClause::new(kind, try_start, try_end);
        match kind {
            ClauseKind::Typed => {
                clause.handler_offset = self.parser.decode_unsigned()?;
                clause.type_symbol = self.parser.read_le::<u32>()?;
                clause.handler_function = self.parser.read_le::<u32>()?;
            }
            ClauseKind::Fault => {
                clause.handler_offset = self.parser.decode_unsigned()?;
            }
            ClauseKind::Filter => {
                clause.handler_offset = self.parser.decode_unsigned()?;
                clause.filter_offset = self.parser.decode_unsigned()?;
            }
            ClauseKind::Unused => {}
        }
        Ok(clause)
    }
}

impl Iterator for EHClauseIterator<'_> {
    type Item = Result<EHClause>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_clause >= self.total_clauses {
            return None;
        }
        self.current_clause += 1;

        let clause = self.read_clause();
        if clause.is_err() {
            self.current_clause = self.total_clauses;
        }
        Some(clause)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total_clauses - self.current_clause) as usize;
        (0, Some(remaining))
    }
}

/// Encoder for clause tables.
///
/// Clauses are written in insertion order, so callers add them innermost first.
#[derive(Clone, Debug, Default)]
pub struct ClauseTableBuilder {
    clauses: Vec<EHClause>,
}

impl ClauseTableBuilder {
    /// An empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a clause
    #[must_use]
    pub fn clause(mut self, clause: EHClause) -> Self {
        self.push(clause);
        self
    }

    /// Append a clause in place
    pub fn push(&mut self, clause: EHClause) {
        debug_assert!(
            clause.try_end_offset - clause.try_start_offset <= u32::MAX >> CLAUSE_KIND_BITS,
            "try region too long to encode"
        );
        self.clauses.push(clause);
    }

    /// Clauses added so far
    #[must_use]
    pub fn clauses(&self) -> &[EHClause] {
        &self.clauses
    }

    /// Encode the table
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_unsigned(self.clauses.len() as u32, &mut out);

        for clause in &self.clauses {
            let length = clause.try_end_offset - clause.try_start_offset;
            encode_unsigned(clause.try_start_offset, &mut out);
            encode_unsigned(
                (length << CLAUSE_KIND_BITS) | clause.kind as u32,
                &mut out,
            );
            match clause.kind {
                ClauseKind::Typed => {
                    encode_unsigned(clause.handler_offset, &mut out);
                    out.extend_from_slice(&clause.type_symbol.to_le_bytes());
                    out.extend_from_slice(&clause.handler_function.to_le_bytes());
                }
                ClauseKind::Fault => encode_unsigned(clause.handler_offset, &mut out),
                ClauseKind::Filter => {
                    encode_unsigned(clause.handler_offset, &mut out);
                    encode_unsigned(clause.filter_offset, &mut out);
                }
                ClauseKind::Unused => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_decode_hand_written_table() {
        // count 2; FAULT [4, 12) handler 0x20; FILTER [0, 16) handler 0x30 filter 0x28
        let table = [
            0x04, // count 2
            0x08, 0x42, 0x40, // start 4, (8 << 2) | 1, handler 0x20
            0x00, 0x84, 0x60, 0x50, // start 0, (16 << 2) | 2, handler 0x30, filter 0x28
        ];
        let clauses = EHClauseIterator::new(&table)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[0], EHClause::fault(4, 12, 0x20));
        assert_eq!(clauses[1], EHClause::filter(0, 16, 0x30, 0x28));
    }

    #[test]
    fn test_builder_matches_decoder() {
        let builder = ClauseTableBuilder::new()
            .clause(EHClause::typed(0x100, 0x180, 0x400, 0x0012_3450, 0))
            .clause(EHClause::unused(0x100, 0x180))
            .clause(EHClause::typed(0x80, 0x9000, 0x20, 0x0012_3460, 0x7700_0000))
            .clause(EHClause::fault(0, 0x4_0000, 0x1_0000));
        let table = builder.encode();

        let mut iterator = EHClauseIterator::new(&table).unwrap();
        assert_eq!(iterator.total_clauses(), 4);
        for expected in builder.clauses() {
            assert_eq!(&iterator.next().unwrap().unwrap(), expected);
        }
        assert!(iterator.next().is_none());
    }

    #[test]
    fn test_empty_table() {
        let table = ClauseTableBuilder::new().encode();
        assert_eq!(table, vec![0x00]);
        assert!(EHClauseIterator::new(&table).unwrap().next().is_none());
    }

    #[test]
    fn test_truncated_table() {
        let mut table = ClauseTableBuilder::new()
            .clause(EHClause::typed(0, 8, 0x10, 0xAABB_CCDD, 0))
            .encode();
        table.truncate(table.len() - 2);

        let mut iterator = EHClauseIterator::new(&table).unwrap();
        assert!(matches!(iterator.next(), Some(Err(Error::OutOfBounds { .. }))));
        assert!(iterator.next().is_none());
    }

    #[test]
    fn test_containment_and_handler_addresses() {
        let typed = EHClause::typed(0x10, 0x20, 0x40, 0x1234, 0);
        assert!(typed.contains_code_offset(0x10));
        assert!(typed.contains_code_offset(0x1F));
        assert!(!typed.contains_code_offset(0x20));
        assert!(typed.try_starts_at(0x10));
        assert_eq!(typed.handler_address(0x5000), 0x5040);

        let absolute = EHClause::typed(0x10, 0x20, 0x40, 0x1234, 0x9000);
        assert_eq!(absolute.handler_address(0x5000), 0x9000);
        assert!(typed.same_try_region(&absolute));

        let filter = EHClause::filter(0, 4, 8, 12);
        assert_eq!(filter.filter_address(0x100), 0x10C);
        assert_eq!(filter.handler_address(0x100), 0x108);
    }
}
