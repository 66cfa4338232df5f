use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use slab::Slab;

use crate::conn::Conn;
use crate::gfd::{Gfd, CONN_MATRIX_COLUMN_MAX, CONN_MATRIX_ROW_MAX};

/// Connections of one loop, addressed by `(row, column)`.
///
/// Slots are recycled; the identifier stored with each connection tells a
/// live handle from one whose slot was reused.
#[derive(Debug, Default)]
pub(crate) struct ConnMatrix {
    rows: Vec<Slab<Conn>>,
    fds: HashMap<RawFd, (usize, usize)>,
}

impl ConnMatrix {
    pub(crate) fn len(&self) -> usize {
        self.fds.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Stores `conn` and stamps it with a fresh identifier.
    pub(crate) fn insert(&mut self, mut conn: Conn, el_index: usize, fd: RawFd) -> io::Result<Gfd> {
        let row = match self
            .rows
            .iter()
            .position(|r| r.len() < CONN_MATRIX_COLUMN_MAX)
        {
            Some(row) => row,
            None if self.rows.len() < CONN_MATRIX_ROW_MAX => {
                self.rows.push(Slab::new());
                self.rows.len() - 1
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "connection matrix is full",
                ))
            }
        };
        let entry = self.rows[row].vacant_entry();
        let gfd = Gfd::new(fd, el_index, row, entry.key());
        conn.set_gfd(gfd);
        entry.insert(conn);
        self.fds.insert(fd, (row, gfd.conn_matrix_column()));
        Ok(gfd)
    }

    /// The live connection named by `gfd`, `None` for a stale identifier.
    pub(crate) fn get_mut(&mut self, gfd: Gfd) -> Option<&mut Conn> {
        self.rows
            .get_mut(gfd.conn_matrix_row())?
            .get_mut(gfd.conn_matrix_column())
            .filter(|c| c.gfd() == gfd)
    }

    pub(crate) fn gfd_of(&self, fd: RawFd) -> Option<Gfd> {
        let &(row, col) = self.fds.get(&fd)?;
        self.rows.get(row)?.get(col).map(|c| c.gfd())
    }

    pub(crate) fn remove(&mut self, gfd: Gfd) -> Option<Conn> {
        self.get_mut(gfd)?;
        self.fds.remove(&gfd.fd());
        let row = &mut self.rows[gfd.conn_matrix_row()];
        Some(row.remove(gfd.conn_matrix_column()))
    }

    pub(crate) fn gfds(&self) -> Vec<Gfd> {
        self.rows
            .iter()
            .flat_map(|r| r.iter().map(|(_, c)| c.gfd()))
            .collect()
    }
}
