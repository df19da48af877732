//! Group member list assembly.
//!
//! A group's members are laid out as a pointer table followed by the packed
//! names:
//!
//! ```text
//! | @m0 | @m1 | ... | 0 | m0\0 | m1\0 | ...
//!   ^ table: (count + 1) slots          ^ strings, in input order
//! ```
//!
//! Each slot is a native-endian address of `POINTER_WIDTH` bytes; the last
//! slot is the `0` sentinel. The member count has to be known before the
//! table size can be checked against the buffer, so callers drain the member
//! query into a `Vec` first.

use std::ffi::CStr;

use crate::pack::{
    align_up, cstr_at, ensure_capacity, InsufficientSpace, Pack, StringLayout, POINTER_ALIGN,
    POINTER_WIDTH,
};
use crate::types::Group;

/// Bytes needed to assemble `members` at the start of a buffer.
#[must_use]
pub fn members_required_len<S: AsRef<str>>(members: &[S]) -> usize {
    let table = (members.len() + 1) * POINTER_WIDTH;
    table + members.iter().map(|m| m.as_ref().len() + 1).sum::<usize>()
}

/// Lays out `members` at the start of `buf` and returns a view of the table.
///
/// # Errors
///
/// Returns [`InsufficientSpace`] without writing when `buf` is shorter than
/// [`members_required_len`].
pub fn assemble_members<'a, S: AsRef<str>>(
    members: &[S],
    buf: &'a mut [u8],
) -> Result<MemberTable<'a>, InsufficientSpace> {
    ensure_capacity(members_required_len(members), buf.len())?;

    let base = buf.as_ptr() as usize;
    let mut next = (members.len() + 1) * POINTER_WIDTH;
    for (slot, member) in members.iter().enumerate() {
        let bytes = member.as_ref().as_bytes();
        buf[next..next + bytes.len()].copy_from_slice(bytes);
        buf[next + bytes.len()] = 0;
        write_slot(buf, slot, base + next);
        next += bytes.len() + 1;
    }
    write_slot(buf, members.len(), 0);

    Ok(MemberTable {
        region: buf,
        count: members.len(),
    })
}

fn write_slot(buf: &mut [u8], slot: usize, addr: usize) {
    let at = slot * POINTER_WIDTH;
    buf[at..at + POINTER_WIDTH].copy_from_slice(&addr.to_ne_bytes());
}

fn read_slot(buf: &[u8], slot: usize) -> Option<usize> {
    let at = slot * POINTER_WIDTH;
    let bytes = buf.get(at..at + POINTER_WIDTH)?;
    let mut raw = [0u8; POINTER_WIDTH];
    raw.copy_from_slice(bytes);
    Some(usize::from_ne_bytes(raw))
}

// ---------------------------------------------------------------------------
// MemberTable
// ---------------------------------------------------------------------------

/// Read-only view of an assembled member region.
#[derive(Debug, Clone, Copy)]
pub struct MemberTable<'a> {
    region: &'a [u8],
    count: usize,
}

impl<'a> MemberTable<'a> {
    /// Number of members, not counting the sentinel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Address of the first table slot; what a C caller stores as `gr_mem`.
    #[must_use]
    pub fn table_addr(&self) -> usize {
        self.region.as_ptr() as usize
    }

    /// Raw slot values, sentinel included.
    pub fn slots(&self) -> impl Iterator<Item = usize> + 'a {
        let region = self.region;
        (0..=self.count).filter_map(move |slot| read_slot(region, slot))
    }

    /// Member `index`, resolved through its table slot.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&'a CStr> {
        if index >= self.count {
            return None;
        }
        let addr = read_slot(self.region, index)?;
        let offset = addr.checked_sub(self.table_addr())?;
        Some(cstr_at(self.region, offset))
    }

    /// Members in table order.
    pub fn iter(&self) -> impl Iterator<Item = &'a CStr> + 'a {
        let table = *self;
        (0..table.count).filter_map(move |i| table.get(i))
    }
}

// ---------------------------------------------------------------------------
// Group packing
// ---------------------------------------------------------------------------

/// Packed [`Group`].
#[derive(Debug, Clone, Copy)]
pub struct GroupView<'a> {
    pub name: &'a CStr,
    pub passwd: &'a CStr,
    pub gid: u32,
    pub members: MemberTable<'a>,
    /// Offsets of name and passwd.
    pub offsets: [usize; 2],
    /// Offset of the pointer table.
    pub members_offset: usize,
}

impl From<GroupView<'_>> for Group {
    fn from(view: GroupView<'_>) -> Self {
        Self {
            name: view.name.to_string_lossy().into_owned(),
            passwd: view.passwd.to_string_lossy().into_owned(),
            gid: view.gid,
            members: view
                .members
                .iter()
                .map(|m| m.to_string_lossy().into_owned())
                .collect(),
        }
    }
}

/// Name and passwd layout plus the aligned start of the member region.
fn group_layout(group: &Group, base_addr: usize) -> (StringLayout<2>, usize, usize) {
    let strings = StringLayout::plan([group.name.as_str(), group.passwd.as_str()], 0);
    let table_offset = align_up(base_addr + strings.end, POINTER_ALIGN) - base_addr;
    let required = table_offset + members_required_len(&group.members);
    (strings, table_offset, required)
}

impl Pack for Group {
    type View<'a> = GroupView<'a>;

    fn required_len(&self, base_addr: usize) -> usize {
        group_layout(self, base_addr).2
    }

    fn pack<'a>(&self, buf: &'a mut [u8]) -> Result<GroupView<'a>, InsufficientSpace> {
        let (strings, table_offset, required) = group_layout(self, buf.as_ptr() as usize);
        ensure_capacity(required, buf.len())?;

        let (head, tail) = buf.split_at_mut(table_offset);
        strings.write([self.name.as_str(), self.passwd.as_str()], head)?;
        let members = assemble_members(&self.members, tail)?;
        let head: &'a [u8] = head;

        Ok(GroupView {
            name: cstr_at(head, strings.offsets[0]),
            passwd: cstr_at(head, strings.offsets[1]),
            gid: self.gid,
            members,
            offsets: strings.offsets,
            members_offset: table_offset,
        })
    }
}
