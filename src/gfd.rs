//! Generational connection identifiers.
//!
//! A [`Gfd`] names a connection owned by some event loop without sharing any
//! pointer to it. It is a plain 16-byte value laid out as:
//!
//! ```text
//!  0        1        2        4             8                     16
//!  ┌────────┬────────┬────────┬─────────────┬─────────────────────┐
//!  │ loop   │ row    │ column │ sequence    │ fd                  │
//!  │ u8     │ u8     │ u16 BE │ u32 BE      │ u64 BE              │
//!  └────────┴────────┴────────┴─────────────┴─────────────────────┘
//! ```
//!
//! The sequence is stamped from a process-wide counter when the value is
//! minted and is never reused. Matrix slots and fds are recycled, sequences
//! are not, so an identifier that outlived its connection no longer matches
//! the sequence stored at its slot.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

/// Number of distinct event-loop indexes.
pub const EVENT_LOOP_INDEX_MAX: usize = u8::MAX as usize + 1;
/// Number of rows in a loop's connection matrix.
pub const CONN_MATRIX_ROW_MAX: usize = u8::MAX as usize + 1;
/// Number of columns in one connection-matrix row.
pub const CONN_MATRIX_COLUMN_MAX: usize = u16::MAX as usize + 1;

const CONN_MATRIX_COLUMN_OFFSET: usize = 2;
const SEQUENCE_OFFSET: usize = 4;
const FD_OFFSET: usize = 8;

static MONO_SEQ: AtomicU32 = AtomicU32::new(0);

fn next_sequence() -> u32 {
    // Wraps after 2^32 mints.
    MONO_SEQ.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Connection identifier: fd, event-loop index and matrix coordinates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gfd([u8; 0x10]);

impl Gfd {
    /// Mints a new identifier, stamping the next sequence value.
    pub fn new(fd: RawFd, el_index: usize, row: usize, column: usize) -> Gfd {
        debug_assert!(el_index < EVENT_LOOP_INDEX_MAX);
        let mut gfd = Gfd([0; 0x10]);
        gfd.0[0] = el_index as u8;
        gfd.update_indexes(row, column);
        gfd.0[SEQUENCE_OFFSET..FD_OFFSET].copy_from_slice(&next_sequence().to_be_bytes());
        gfd.0[FD_OFFSET..].copy_from_slice(&(fd as i64 as u64).to_be_bytes());
        gfd
    }

    /// Rebuilds an identifier from its raw bytes.
    pub fn from_bytes(bytes: [u8; 0x10]) -> Gfd {
        Gfd(bytes)
    }

    /// The raw 16-byte representation.
    pub fn as_bytes(&self) -> &[u8; 0x10] {
        &self.0
    }

    /// The underlying OS file descriptor.
    pub fn fd(&self) -> RawFd {
        self.raw_fd() as RawFd
    }

    fn raw_fd(&self) -> u64 {
        let mut b = [0; 8];
        b.copy_from_slice(&self.0[FD_OFFSET..]);
        u64::from_be_bytes(b)
    }

    /// Index of the event loop owning the connection.
    pub fn event_loop_index(&self) -> usize {
        self.0[0] as usize
    }

    /// Row of the connection in its loop's matrix.
    pub fn conn_matrix_row(&self) -> usize {
        self.0[1] as usize
    }

    /// Column of the connection in its loop's matrix.
    pub fn conn_matrix_column(&self) -> usize {
        let mut b = [0; 2];
        b.copy_from_slice(&self.0[CONN_MATRIX_COLUMN_OFFSET..SEQUENCE_OFFSET]);
        u16::from_be_bytes(b) as usize
    }

    /// The monotonic sequence stamped at mint time.
    pub fn sequence(&self) -> u32 {
        let mut b = [0; 4];
        b.copy_from_slice(&self.0[SEQUENCE_OFFSET..FD_OFFSET]);
        u32::from_be_bytes(b)
    }

    pub(crate) fn update_indexes(&mut self, row: usize, column: usize) {
        debug_assert!(row < CONN_MATRIX_ROW_MAX && column < CONN_MATRIX_COLUMN_MAX);
        self.0[1] = row as u8;
        self.0[CONN_MATRIX_COLUMN_OFFSET..SEQUENCE_OFFSET]
            .copy_from_slice(&(column as u16).to_be_bytes());
    }

    /// Reports whether the identifier can name a live connection.
    ///
    /// The fd must not be a standard stream, every index must be inside its
    /// declared range and the sequence must have been stamped.
    pub fn validate(&self) -> bool {
        let fd = self.raw_fd();
        fd > 2
            && fd <= RawFd::max_value() as u64
            && self.event_loop_index() < EVENT_LOOP_INDEX_MAX
            && self.conn_matrix_row() < CONN_MATRIX_ROW_MAX
            && self.conn_matrix_column() < CONN_MATRIX_COLUMN_MAX
            && self.sequence() > 0
    }
}

impl fmt::Debug for Gfd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gfd")
            .field("fd", &self.fd())
            .field("event_loop", &self.event_loop_index())
            .field("row", &self.conn_matrix_row())
            .field("column", &self.conn_matrix_column())
            .field("sequence", &self.sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fields_read_back() {
        let cases = [
            (3, 0, 0, 0),
            (1024, 7, 12, 4096),
            (RawFd::max_value(), 255, 255, 65535),
        ];
        for &(fd, el, row, col) in cases.iter() {
            let gfd = Gfd::new(fd, el, row, col);
            assert_eq!(gfd.fd(), fd);
            assert_eq!(gfd.event_loop_index(), el);
            assert_eq!(gfd.conn_matrix_row(), row);
            assert_eq!(gfd.conn_matrix_column(), col);
            assert!(gfd.sequence() > 0);
            assert!(gfd.validate(), "{:?}", gfd);
        }
    }

    #[test]
    fn update_indexes_keeps_sequence() {
        let mut gfd = Gfd::new(10, 1, 0, 0);
        let seq = gfd.sequence();
        gfd.update_indexes(3, 300);
        assert_eq!(gfd.conn_matrix_row(), 3);
        assert_eq!(gfd.conn_matrix_column(), 300);
        assert_eq!(gfd.sequence(), seq);
        assert_eq!(gfd.fd(), 10);
    }

    #[test]
    fn rejects_standard_streams_and_negative_fds() {
        for fd in -1..=2 {
            assert!(!Gfd::new(fd, 0, 0, 0).validate(), "fd {}", fd);
        }
    }

    #[test]
    fn rejects_unstamped_sequence() {
        let mut bytes = *Gfd::new(5, 0, 0, 0).as_bytes();
        for b in &mut bytes[SEQUENCE_OFFSET..FD_OFFSET] {
            *b = 0;
        }
        let gfd = Gfd::from_bytes(bytes);
        assert_eq!(gfd.sequence(), 0);
        assert!(!gfd.validate());
        assert!(!Gfd::default().validate());
    }

    #[test]
    fn equality_covers_every_field() {
        let a = Gfd::new(9, 1, 2, 3);
        assert_eq!(a, Gfd::from_bytes(*a.as_bytes()));
        // same coordinates, new sequence
        let b = Gfd::new(9, 1, 2, 3);
        assert_ne!(a, b);
    }

    #[test]
    fn concurrent_mints_are_distinct() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 2_000;

        let barrier = Arc::new(std::sync::Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    (0..PER_THREAD)
                        .map(|_| Gfd::new(100, i, 0, 0).sequence())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for seq in h.join().unwrap() {
                assert!(seen.insert(seq), "duplicate sequence {}", seq);
            }
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
    }
}
