//! Fixed-buffer record packing.
//!
//! A record is written into a caller-owned byte region as a run of
//! NUL-terminated strings. The layout is planned first ([`StringLayout`]),
//! checked once against the capacity, and only then written. Nothing is
//! written when the check fails.
//!
//! Packing returns a typed view ([`AccountView`], [`ShadowView`], and
//! [`GroupView`](crate::members::GroupView)) borrowing the buffer, so the
//! caller reads back exactly the bytes that were written.

use std::ffi::CStr;

use crate::types::{Account, ShadowCredential};

/// Width in bytes of one pointer-table slot.
pub const POINTER_WIDTH: usize = std::mem::size_of::<usize>();

/// Alignment of the pointer table inside a group record.
pub const POINTER_ALIGN: usize = std::mem::align_of::<usize>();

/// The caller buffer cannot hold the record.
///
/// Retryable: the caller supplies a buffer of at least `required` bytes and
/// asks again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("buffer too small: {required} bytes required, {capacity} available")]
pub struct InsufficientSpace {
    pub required: usize,
    pub capacity: usize,
}

/// Single validation gate used by every packer.
///
/// # Errors
///
/// Returns [`InsufficientSpace`] when `capacity < required`.
pub fn ensure_capacity(required: usize, capacity: usize) -> Result<(), InsufficientSpace> {
    if capacity < required {
        Err(InsufficientSpace { required, capacity })
    } else {
        Ok(())
    }
}

/// Rounds `addr` up to the next multiple of `align` (a power of two).
#[must_use]
pub fn align_up(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// StringLayout
// ---------------------------------------------------------------------------

/// Planned offsets of `N` NUL-terminated strings written back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringLayout<const N: usize> {
    /// Offset of each string's first byte, in field order.
    pub offsets: [usize; N],
    /// Offset one past the last terminator; the bytes required from offset 0.
    pub end: usize,
}

impl<const N: usize> StringLayout<N> {
    /// Plans `fields` starting at `start`. Each field occupies `len + 1` bytes.
    #[must_use]
    pub fn plan(fields: [&str; N], start: usize) -> Self {
        let mut offsets = [0usize; N];
        let mut cursor = start;
        for (slot, field) in offsets.iter_mut().zip(fields) {
            *slot = cursor;
            cursor += field.len() + 1;
        }
        Self {
            offsets,
            end: cursor,
        }
    }

    /// Bytes needed from the start of the buffer.
    #[must_use]
    pub fn required(&self) -> usize {
        self.end
    }

    /// Writes `fields` at the planned offsets after checking capacity.
    ///
    /// `fields` must be the same strings the layout was planned from.
    ///
    /// # Errors
    ///
    /// Returns [`InsufficientSpace`] without writing when `buf` is too short.
    pub fn write(&self, fields: [&str; N], buf: &mut [u8]) -> Result<(), InsufficientSpace> {
        ensure_capacity(self.end, buf.len())?;
        for (offset, field) in self.offsets.into_iter().zip(fields) {
            let bytes = field.as_bytes();
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
            buf[offset + bytes.len()] = 0;
        }
        Ok(())
    }
}

/// Packs `fields` from offset 0 of `buf` and returns each field's offset.
///
/// # Errors
///
/// Returns [`InsufficientSpace`] when `buf.len() < Σ(len + 1)`.
pub fn pack_strings<const N: usize>(
    fields: [&str; N],
    buf: &mut [u8],
) -> Result<[usize; N], InsufficientSpace> {
    let layout = StringLayout::plan(fields, 0);
    layout.write(fields, buf)?;
    Ok(layout.offsets)
}

/// Reads the NUL-terminated string starting at `offset`.
///
/// Out-of-range offsets and missing terminators read as the empty string.
#[must_use]
pub fn cstr_at(buf: &[u8], offset: usize) -> &CStr {
    buf.get(offset..)
        .and_then(|tail| CStr::from_bytes_until_nul(tail).ok())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Pack trait
// ---------------------------------------------------------------------------

/// A record that can be laid out in a caller buffer.
pub trait Pack {
    /// Typed view over a packed buffer.
    type View<'a>;

    /// Bytes required to pack this record into a buffer starting at `base_addr`.
    ///
    /// The base address only matters for records with an aligned pointer table.
    fn required_len(&self, base_addr: usize) -> usize;

    /// Packs the record into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`InsufficientSpace`] without touching `buf` when it is too short.
    fn pack<'a>(&self, buf: &'a mut [u8]) -> Result<Self::View<'a>, InsufficientSpace>;
}

/// Packed [`Account`].
#[derive(Debug, Clone, Copy)]
pub struct AccountView<'a> {
    pub name: &'a CStr,
    pub passwd: &'a CStr,
    pub uid: u32,
    pub gid: u32,
    pub gecos: &'a CStr,
    pub dir: &'a CStr,
    pub shell: &'a CStr,
    /// Offsets of name, passwd, gecos, dir and shell.
    pub offsets: [usize; 5],
}

fn owned(s: &CStr) -> String {
    s.to_string_lossy().into_owned()
}

impl From<AccountView<'_>> for Account {
    fn from(view: AccountView<'_>) -> Self {
        Self {
            name: owned(view.name),
            passwd: owned(view.passwd),
            uid: view.uid,
            gid: view.gid,
            gecos: owned(view.gecos),
            dir: owned(view.dir),
            shell: owned(view.shell),
        }
    }
}

impl Account {
    fn fields(&self) -> [&str; 5] {
        [
            self.name.as_str(),
            self.passwd.as_str(),
            self.gecos.as_str(),
            self.dir.as_str(),
            self.shell.as_str(),
        ]
    }
}

impl Pack for Account {
    type View<'a> = AccountView<'a>;

    fn required_len(&self, _base_addr: usize) -> usize {
        StringLayout::plan(self.fields(), 0).required()
    }

    fn pack<'a>(&self, buf: &'a mut [u8]) -> Result<AccountView<'a>, InsufficientSpace> {
        let offsets = pack_strings(self.fields(), buf)?;
        let buf: &'a [u8] = buf;
        Ok(AccountView {
            name: cstr_at(buf, offsets[0]),
            passwd: cstr_at(buf, offsets[1]),
            uid: self.uid,
            gid: self.gid,
            gecos: cstr_at(buf, offsets[2]),
            dir: cstr_at(buf, offsets[3]),
            shell: cstr_at(buf, offsets[4]),
            offsets,
        })
    }
}

/// Packed [`ShadowCredential`].
#[derive(Debug, Clone, Copy)]
pub struct ShadowView<'a> {
    pub name: &'a CStr,
    pub passwd: &'a CStr,
    pub last_change: i64,
    pub min_age: i64,
    pub max_age: i64,
    pub warn_period: i64,
    pub inactivity: i64,
    pub expire: i64,
    /// Offsets of name and passwd.
    pub offsets: [usize; 2],
}

impl From<ShadowView<'_>> for ShadowCredential {
    fn from(view: ShadowView<'_>) -> Self {
        Self {
            name: owned(view.name),
            passwd: owned(view.passwd),
            last_change: view.last_change,
            min_age: view.min_age,
            max_age: view.max_age,
            warn_period: view.warn_period,
            inactivity: view.inactivity,
            expire: view.expire,
        }
    }
}

impl Pack for ShadowCredential {
    type View<'a> = ShadowView<'a>;

    fn required_len(&self, _base_addr: usize) -> usize {
        StringLayout::plan([self.name.as_str(), self.passwd.as_str()], 0).required()
    }

    fn pack<'a>(&self, buf: &'a mut [u8]) -> Result<ShadowView<'a>, InsufficientSpace> {
        let offsets = pack_strings([self.name.as_str(), self.passwd.as_str()], buf)?;
        let buf: &'a [u8] = buf;
        Ok(ShadowView {
            name: cstr_at(buf, offsets[0]),
            passwd: cstr_at(buf, offsets[1]),
            last_change: self.last_change,
            min_age: self.min_age,
            max_age: self.max_age,
            warn_period: self.warn_period,
            inactivity: self.inactivity,
            expire: self.expire,
            offsets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SHADOWED_PASSWD, UNSET};
    use proptest::prelude::*;

    fn eve() -> Account {
        Account {
            name: "eve".to_string(),
            passwd: SHADOWED_PASSWD.to_string(),
            uid: 1002,
            gid: 100,
            gecos: String::new(),
            dir: "/home/eve".to_string(),
            shell: "/bin/sh".to_string(),
        }
    }

    #[test]
    fn eve_packs_into_exact_buffer() {
        let required = "eve".len() + 1 + "x".len() + 1 + 1 + "/home/eve".len() + 1 + "/bin/sh".len() + 1;
        let account = eve();
        assert_eq!(account.required_len(0), required);

        let mut buf = vec![0xAAu8; required];
        let view = account.pack(&mut buf).unwrap();
        assert_eq!(view.name.to_str().unwrap(), "eve");
        assert_eq!(view.passwd.to_str().unwrap(), "x");
        assert_eq!(view.gecos.to_str().unwrap(), "");
        assert_eq!(view.dir.to_str().unwrap(), "/home/eve");
        assert_eq!(view.shell.to_str().unwrap(), "/bin/sh");
        assert_eq!(view.uid, 1002);
        assert_eq!(view.gid, 100);
        assert_eq!(view.offsets, [0, 4, 6, 7, 17]);
    }

    #[test]
    fn one_byte_short_fails_and_leaves_buffer_untouched() {
        let account = eve();
        let required = account.required_len(0);
        let mut buf = vec![0xAAu8; required - 1];

        let err = account.pack(&mut buf).unwrap_err();
        assert_eq!(
            err,
            InsufficientSpace {
                required,
                capacity: required - 1
            }
        );
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn empty_buffer_reports_full_requirement() {
        let err = eve().pack(&mut []).unwrap_err();
        assert_eq!(err.capacity, 0);
        assert_eq!(err.required, eve().required_len(0));
    }

    #[test]
    fn larger_buffer_only_uses_prefix() {
        let account = eve();
        let required = account.required_len(0);
        let mut buf = vec![0xAAu8; required + 16];
        account.pack(&mut buf).unwrap();
        assert!(buf[required..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn shadow_packs_name_and_passwd_only() {
        let mut sp = ShadowCredential::new("eve", "$6$abc$def");
        sp.max_age = 90;
        let required = sp.required_len(0);
        assert_eq!(required, 4 + 11);

        let mut buf = vec![0u8; required];
        let view = sp.pack(&mut buf).unwrap();
        assert_eq!(view.name.to_bytes(), b"eve");
        assert_eq!(view.passwd.to_bytes(), b"$6$abc$def");
        assert_eq!(view.max_age, 90);
        assert_eq!(view.expire, UNSET);
    }

    #[test]
    fn views_convert_back_to_owned_records() {
        let mut buf = vec![0u8; 64];
        let view = eve().pack(&mut buf).unwrap();
        assert_eq!(Account::from(view), eve());

        let sp = ShadowCredential::new("eve", "!");
        let view = sp.pack(&mut buf).unwrap();
        assert_eq!(ShadowCredential::from(view), sp);
    }

    #[test]
    fn cstr_at_out_of_range_is_empty() {
        let buf = b"abc\0";
        assert_eq!(cstr_at(buf, 0).to_bytes(), b"abc");
        assert_eq!(cstr_at(buf, 3).to_bytes(), b"");
        assert_eq!(cstr_at(buf, 10).to_bytes(), b"");
        assert_eq!(cstr_at(b"no-nul", 0).to_bytes(), b"");
    }

    #[test]
    fn align_up_rounds_to_pointer_alignment() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 4), 12);
    }

    fn field() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9/._$-]{0,24}"
    }

    proptest! {
        #[test]
        fn exact_fit_recovers_every_field(
            name in field(), passwd in field(), gecos in field(), dir in field(), shell in field(),
            uid in any::<u32>(), gid in any::<u32>(),
        ) {
            let account = Account { name, passwd, uid, gid, gecos, dir, shell };
            let required = account.required_len(0);
            let mut buf = vec![0xFFu8; required];
            let view = account.pack(&mut buf).unwrap();
            prop_assert_eq!(view.name.to_bytes(), account.name.as_bytes());
            prop_assert_eq!(view.passwd.to_bytes(), account.passwd.as_bytes());
            prop_assert_eq!(view.gecos.to_bytes(), account.gecos.as_bytes());
            prop_assert_eq!(view.dir.to_bytes(), account.dir.as_bytes());
            prop_assert_eq!(view.shell.to_bytes(), account.shell.as_bytes());
            prop_assert_eq!(view.uid, uid);
            prop_assert_eq!(view.gid, gid);
        }

        #[test]
        fn boundary_is_exactly_required(
            fields in proptest::array::uniform5(field()),
        ) {
            let refs: [&str; 5] = [&fields[0], &fields[1], &fields[2], &fields[3], &fields[4]];
            let required: usize = refs.iter().map(|f| f.len() + 1).sum();

            let mut short = vec![0u8; required - 1];
            prop_assert!(pack_strings(refs, &mut short).is_err());

            let mut exact = vec![0u8; required];
            let offsets = pack_strings(refs, &mut exact).unwrap();
            for (offset, field) in offsets.into_iter().zip(refs) {
                prop_assert_eq!(cstr_at(&exact, offset).to_bytes(), field.as_bytes());
            }
        }
    }
}
