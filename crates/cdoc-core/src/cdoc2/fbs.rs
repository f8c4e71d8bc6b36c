//! FlatBuffers wire support for the CDoc2 header.
//!
//! Only the subset the header schema needs: tables with scalar, reference
//! and union fields, byte vectors, strings and vectors of tables. The
//! builder grows back-to-front the way the reference implementation does,
//! so references are always forward offsets; the accessor side bounds-checks
//! every vtable, offset and length before use and thereby doubles as the
//! verifier — a header slice that fails any check is rejected outright.

use crate::error::{Error, Result};

fn verr() -> Error {
    Error::format("header buffer failed verification")
}

#[derive(Debug, Clone, Copy)]
pub enum Field {
    /// Forward reference to an already-serialized object (rev offset).
    Ref(usize),
    U8(u8),
    I32(i32),
}

/// Back-to-front buffer builder. Offsets handed out are distances from the
/// end of the finished buffer ("rev" offsets), the equivalent of the
/// reference builder's `WIPOffset`.
pub struct Builder {
    buf: Vec<u8>,
    head: usize,
}

impl Builder {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(64);
        Builder { buf: vec![0u8; cap], head: cap }
    }

    /// Bytes written so far; the rev offset of the most recent object.
    fn cur(&self) -> usize {
        self.buf.len() - self.head
    }

    fn ensure(&mut self, n: usize) {
        if self.head < n {
            let grow = self.buf.len().max(n);
            let mut newbuf = vec![0u8; self.buf.len() + grow];
            newbuf[self.head + grow..].copy_from_slice(&self.buf[self.head..]);
            self.head += grow;
            self.buf = newbuf;
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.head -= bytes.len();
        self.buf[self.head..self.head + bytes.len()].copy_from_slice(bytes);
    }

    fn push_u32(&mut self, v: u32) {
        self.push(&v.to_le_bytes());
    }

    /// Zero-pad so that after `after` more bytes the write cursor sits on a
    /// 4-byte boundary of the finished buffer.
    fn align(&mut self, after: usize) {
        let misfit = (self.cur() + after) % 4;
        if misfit != 0 {
            let pad = 4 - misfit;
            self.ensure(pad);
            for _ in 0..pad {
                self.head -= 1;
                self.buf[self.head] = 0;
            }
        }
    }

    fn push_ref(&mut self, target: usize) {
        debug_assert!(target <= self.cur());
        let v = (self.cur() + 4 - target) as u32;
        self.push_u32(v);
    }

    /// `[ubyte]` vector.
    pub fn create_bytes(&mut self, data: &[u8]) -> usize {
        self.align(data.len() + 4);
        self.push(data);
        self.push_u32(data.len() as u32);
        self.cur()
    }

    /// NUL-terminated string.
    pub fn create_string(&mut self, s: &str) -> usize {
        self.align(s.len() + 1 + 4);
        self.push(&[0u8]);
        self.push(s.as_bytes());
        self.push_u32(s.len() as u32);
        self.cur()
    }

    /// Vector of references to already-created tables.
    pub fn create_ref_vector(&mut self, targets: &[usize]) -> usize {
        self.align((targets.len() + 1) * 4);
        for t in targets.iter().rev() {
            self.push_ref(*t);
        }
        self.push_u32(targets.len() as u32);
        self.cur()
    }

    /// Table from `(field_id, value)` pairs; absent fields are simply not
    /// listed. Every present slot is stored 4 bytes wide, which keeps the
    /// layout aligned without per-type bookkeeping.
    pub fn create_table(&mut self, fields: &[(u16, Field)]) -> usize {
        self.align(0);
        for (_, f) in fields.iter().rev() {
            match *f {
                Field::Ref(t) => self.push_ref(t),
                Field::U8(v) => self.push_u32(v as u32),
                Field::I32(v) => self.push_u32(v as u32),
            }
        }
        self.push_u32(0); // vtable offset, patched below
        let table = self.cur();

        let slots = fields.iter().map(|(id, _)| *id as usize + 1).max().unwrap_or(0);
        let vt_len = 4 + 2 * slots;
        let table_size = 4 + 4 * fields.len();
        let mut vt = vec![0u8; vt_len];
        vt[0..2].copy_from_slice(&(vt_len as u16).to_le_bytes());
        vt[2..4].copy_from_slice(&(table_size as u16).to_le_bytes());
        for (i, (id, _)) in fields.iter().enumerate() {
            let field_off = 4 + 4 * i;
            let entry = 4 + 2 * (*id as usize);
            vt[entry..entry + 2].copy_from_slice(&(field_off as u16).to_le_bytes());
        }
        self.push(&vt);
        let vtable = self.cur();

        let soffset = (vtable - table) as i32;
        let idx = self.buf.len() - table;
        self.buf[idx..idx + 4].copy_from_slice(&soffset.to_le_bytes());
        table
    }

    /// Writes the root reference and returns the finished buffer.
    pub fn finish(mut self, root: usize) -> Vec<u8> {
        self.align(4);
        self.push_ref(root);
        self.buf.split_off(self.head)
    }
}

fn get<const N: usize>(buf: &[u8], pos: usize) -> Result<[u8; N]> {
    let end = pos.checked_add(N).ok_or_else(verr)?;
    if end > buf.len() {
        return Err(verr());
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[pos..end]);
    Ok(out)
}

fn u16_at(buf: &[u8], pos: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(get::<2>(buf, pos)?))
}

fn u32_at(buf: &[u8], pos: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(get::<4>(buf, pos)?))
}

/// Verified view over a table inside `buf`.
#[derive(Clone, Copy)]
pub struct Table<'a> {
    buf: &'a [u8],
    pos: usize,
    vtable: usize,
    vt_len: usize,
    table_size: usize,
}

impl<'a> Table<'a> {
    pub fn root(buf: &'a [u8]) -> Result<Table<'a>> {
        let off = u32_at(buf, 0)? as usize;
        Table::at(buf, off)
    }

    pub fn at(buf: &'a [u8], pos: usize) -> Result<Table<'a>> {
        let soffset = i32::from_le_bytes(get::<4>(buf, pos)?) as i64;
        let vtable = pos as i64 - soffset;
        if vtable < 0 || vtable as usize + 4 > buf.len() {
            return Err(verr());
        }
        let vtable = vtable as usize;
        let vt_len = u16_at(buf, vtable)? as usize;
        let table_size = u16_at(buf, vtable + 2)? as usize;
        if vt_len < 4 || vt_len % 2 != 0 || vtable + vt_len > buf.len() || table_size < 4 {
            return Err(verr());
        }
        if pos.checked_add(table_size).ok_or_else(verr)? > buf.len() {
            return Err(verr());
        }
        Ok(Table { buf, pos, vtable, vt_len, table_size })
    }

    fn field_pos(&self, id: u16) -> Result<Option<usize>> {
        let entry = 4 + 2 * id as usize;
        if entry + 2 > self.vt_len {
            return Ok(None);
        }
        let off = u16_at(self.buf, self.vtable + entry)? as usize;
        if off == 0 {
            return Ok(None);
        }
        if off >= self.table_size {
            return Err(verr());
        }
        Ok(Some(self.pos + off))
    }

    pub fn u8_field(&self, id: u16, default: u8) -> Result<u8> {
        match self.field_pos(id)? {
            None => Ok(default),
            Some(p) => Ok(get::<1>(self.buf, p)?[0]),
        }
    }

    pub fn i32_field(&self, id: u16, default: i32) -> Result<i32> {
        match self.field_pos(id)? {
            None => Ok(default),
            Some(p) => Ok(i32::from_le_bytes(get::<4>(self.buf, p)?)),
        }
    }

    fn ref_target(&self, id: u16) -> Result<Option<usize>> {
        match self.field_pos(id)? {
            None => Ok(None),
            Some(p) => {
                let off = u32_at(self.buf, p)? as usize;
                let target = p.checked_add(off).ok_or_else(verr)?;
                if target + 4 > self.buf.len() {
                    return Err(verr());
                }
                Ok(Some(target))
            }
        }
    }

    pub fn bytes_field(&self, id: u16) -> Result<Option<&'a [u8]>> {
        match self.ref_target(id)? {
            None => Ok(None),
            Some(t) => {
                let len = u32_at(self.buf, t)? as usize;
                let start = t + 4;
                let end = start.checked_add(len).ok_or_else(verr)?;
                if end > self.buf.len() {
                    return Err(verr());
                }
                Ok(Some(&self.buf[start..end]))
            }
        }
    }

    pub fn str_field(&self, id: u16) -> Result<Option<&'a str>> {
        match self.bytes_field(id)? {
            None => Ok(None),
            Some(b) => std::str::from_utf8(b).map(Some).map_err(|_| verr()),
        }
    }

    pub fn table_field(&self, id: u16) -> Result<Option<Table<'a>>> {
        match self.ref_target(id)? {
            None => Ok(None),
            Some(t) => Table::at(self.buf, t).map(Some),
        }
    }

    /// Length of a vector-of-tables field; `None` when absent.
    pub fn vector_field(&self, id: u16) -> Result<Option<TableVector<'a>>> {
        match self.ref_target(id)? {
            None => Ok(None),
            Some(t) => {
                let len = u32_at(self.buf, t)? as usize;
                let start = t + 4;
                // Each element is a 4-byte forward reference.
                let end = start
                    .checked_add(len.checked_mul(4).ok_or_else(verr)?)
                    .ok_or_else(verr)?;
                if end > self.buf.len() {
                    return Err(verr());
                }
                Ok(Some(TableVector { buf: self.buf, start, len }))
            }
        }
    }
}

#[derive(Clone, Copy)]
pub struct TableVector<'a> {
    buf: &'a [u8],
    start: usize,
    len: usize,
}

impl<'a> TableVector<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> Result<Table<'a>> {
        if i >= self.len {
            return Err(verr());
        }
        let p = self.start + 4 * i;
        let off = u32_at(self.buf, p)? as usize;
        Table::at(self.buf, p.checked_add(off).ok_or_else(verr)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_round_trip() {
        let mut b = Builder::with_capacity(64);
        let name = b.create_string("alice");
        let blob = b.create_bytes(&[1, 2, 3, 4, 5]);
        let inner = b.create_table(&[(0, Field::U8(7)), (1, Field::Ref(blob))]);
        let root = b.create_table(&[
            (0, Field::Ref(name)),
            (1, Field::Ref(inner)),
            (3, Field::I32(-42)),
        ]);
        let buf = b.finish(root);

        let t = Table::root(&buf).unwrap();
        assert_eq!(t.str_field(0).unwrap(), Some("alice"));
        let it = t.table_field(1).unwrap().unwrap();
        assert_eq!(it.u8_field(0, 0).unwrap(), 7);
        assert_eq!(it.bytes_field(1).unwrap(), Some(&[1u8, 2, 3, 4, 5][..]));
        assert_eq!(t.i32_field(3, 0).unwrap(), -42);
        // Absent fields fall back to defaults.
        assert_eq!(t.u8_field(2, 9).unwrap(), 9);
        assert!(t.str_field(7).unwrap().is_none());
    }

    #[test]
    fn vector_of_tables() {
        let mut b = Builder::with_capacity(64);
        let mut items = Vec::new();
        for i in 0..5u8 {
            items.push(b.create_table(&[(0, Field::U8(i))]));
        }
        let vec = b.create_ref_vector(&items);
        let root = b.create_table(&[(0, Field::Ref(vec))]);
        let buf = b.finish(root);

        let t = Table::root(&buf).unwrap();
        let v = t.vector_field(0).unwrap().unwrap();
        assert_eq!(v.len(), 5);
        for i in 0..5 {
            assert_eq!(v.get(i).unwrap().u8_field(0, 0xff).unwrap(), i as u8);
        }
        assert!(v.get(5).is_err());
    }

    #[test]
    fn truncation_is_detected() {
        let mut b = Builder::with_capacity(64);
        let blob = b.create_bytes(&[9u8; 40]);
        let root = b.create_table(&[(0, Field::Ref(blob))]);
        let buf = b.finish(root);

        // The byte vector sits at the tail of the buffer; any truncation
        // must surface when the field is resolved, not read out of bounds.
        for cut in 1..12 {
            let trunc = &buf[..buf.len() - cut];
            let bad = Table::root(trunc).and_then(|t| t.bytes_field(0));
            assert!(bad.is_err(), "cut {cut} went unnoticed");
        }
        assert!(Table::root(&[]).is_err());
        assert!(Table::root(&[1, 0, 0, 0]).is_err());
    }

    #[test]
    fn builder_output_is_aligned() {
        let mut b = Builder::with_capacity(16);
        let s = b.create_string("x");
        let root = b.create_table(&[(0, Field::Ref(s))]);
        let buf = b.finish(root);
        assert_eq!(buf.len() % 4, 0);
        assert!(Table::root(&buf).is_ok());
    }
}
