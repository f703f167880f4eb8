// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Platform-specific filesystem operations.
//!
//! The storage core never branches on the target platform. Everything that
//! differs between Unix and Windows (deletion of open files, permission
//! bits, free space) goes through [`OsFileOps`]; [`NativeFileOps`] is the
//! build-time selected implementation and tests inject their own.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

/// Whether a permission call targets a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

pub trait OsFileOps: Send + Sync + fmt::Debug {
    /// Plain removal.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Arrange for the file to disappear once the last handle closes.
    fn mark_delete_on_close(&self, path: &Path) -> io::Result<()>;

    /// Restrict to owner-only access.
    fn set_owner_only(&self, path: &Path, kind: EntryKind) -> io::Result<()>;

    /// Read back the applied permissions.
    fn has_owner_only(&self, path: &Path, kind: EntryKind) -> io::Result<bool>;

    /// Bytes available to unprivileged callers on the volume holding `path`.
    fn available_space(&self, path: &Path) -> io::Result<u64>;

    /// Replace the contents of an existing file with `data` and sync it.
    ///
    /// A short write is an error; whatever reached the file stays there for
    /// the caller to clean up.
    fn write_synced(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
        file.write_all(data)?;
        file.flush()?;
        file.sync_all()
    }
}

/// Operations for the platform this crate was built for.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeFileOps;

pub fn native_ops() -> Arc<dyn OsFileOps> {
    Arc::new(NativeFileOps)
}

impl OsFileOps for NativeFileOps {
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn mark_delete_on_close(&self, path: &Path) -> io::Result<()> {
        platform::mark_delete_on_close(path)
    }

    fn set_owner_only(&self, path: &Path, kind: EntryKind) -> io::Result<()> {
        platform::set_owner_only(path, kind)
    }

    fn has_owner_only(&self, path: &Path, kind: EntryKind) -> io::Result<bool> {
        platform::has_owner_only(path, kind)
    }

    fn available_space(&self, path: &Path) -> io::Result<u64> {
        platform::available_space(path)
    }
}

#[cfg(unix)]
mod platform {
    use std::ffi::CString;
    use std::fs;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::EntryKind;
    use crate::config::{DIR_MODE, FILE_MODE};

    fn mode_for(kind: EntryKind) -> u32 {
        match kind {
            EntryKind::File => FILE_MODE,
            EntryKind::Directory => DIR_MODE,
        }
    }

    /// Unlinking an open file already succeeds on Unix; a remove that failed
    /// will not succeed through a different door.
    pub fn mark_delete_on_close(_path: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "delete-on-close is not available on this platform",
        ))
    }

    pub fn set_owner_only(path: &Path, kind: EntryKind) -> io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode_for(kind)))
    }

    pub fn has_owner_only(path: &Path, kind: EntryKind) -> io::Result<bool> {
        let mode = fs::metadata(path)?.permissions().mode() & 0o777;
        Ok(mode == mode_for(kind))
    }

    pub fn available_space(path: &Path) -> io::Result<u64> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;
    use std::fs::{self, OpenOptions};
    use std::io;
    use std::os::windows::ffi::OsStrExt;
    use std::os::windows::fs::OpenOptionsExt;
    use std::path::Path;
    use std::ptr;

    use windows_sys::Win32::Foundation::{LocalFree, PSID};
    use windows_sys::Win32::Security::Authorization::{
        GetNamedSecurityInfoW, SetEntriesInAclW, SetNamedSecurityInfoW, EXPLICIT_ACCESS_W,
        NO_MULTIPLE_TRUSTEE, SET_ACCESS, SE_FILE_OBJECT, TRUSTEE_IS_SID, TRUSTEE_IS_UNKNOWN,
        TRUSTEE_W,
    };
    use windows_sys::Win32::Security::{
        EqualSid, GetAce, ACCESS_ALLOWED_ACE, ACE_HEADER, ACL, DACL_SECURITY_INFORMATION,
        NO_INHERITANCE, OWNER_SECURITY_INFORMATION, PROTECTED_DACL_SECURITY_INFORMATION,
        PSECURITY_DESCRIPTOR, SUB_CONTAINERS_AND_OBJECTS_INHERIT,
    };
    use windows_sys::Win32::Storage::FileSystem::GetDiskFreeSpaceExW;

    use super::EntryKind;

    const DELETE: u32 = 0x0001_0000;
    const FILE_SHARE_ALL: u32 = 0x0000_0007;
    const FILE_FLAG_DELETE_ON_CLOSE: u32 = 0x0400_0000;
    const GENERIC_ALL: u32 = 0x1000_0000;
    const ACCESS_ALLOWED_ACE_TYPE: u8 = 0;
    const ACCESS_DENIED_ACE_TYPE: u8 = 1;

    fn wide(path: &Path) -> Vec<u16> {
        path.as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }

    fn win32(code: u32) -> io::Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(code as i32))
        }
    }

    /// Owner and DACL of a file, backed by a system-allocated descriptor.
    struct Descriptor {
        raw: PSECURITY_DESCRIPTOR,
        owner: PSID,
        dacl: *mut ACL,
    }

    impl Descriptor {
        fn read(path: &Path) -> io::Result<Self> {
            let mut name = wide(path);
            let mut owner: PSID = ptr::null_mut();
            let mut dacl: *mut ACL = ptr::null_mut();
            let mut raw: PSECURITY_DESCRIPTOR = ptr::null_mut();
            // SAFETY: name is NUL-terminated; owner and dacl point into raw,
            // which is released only when Self drops.
            let code = unsafe {
                GetNamedSecurityInfoW(
                    name.as_mut_ptr(),
                    SE_FILE_OBJECT,
                    OWNER_SECURITY_INFORMATION | DACL_SECURITY_INFORMATION,
                    &mut owner,
                    ptr::null_mut(),
                    &mut dacl,
                    ptr::null_mut(),
                    &mut raw,
                )
            };
            win32(code)?;
            Ok(Self { raw, owner, dacl })
        }
    }

    impl Drop for Descriptor {
        fn drop(&mut self) {
            if !self.raw.is_null() {
                // SAFETY: allocated by GetNamedSecurityInfoW.
                unsafe { LocalFree(self.raw as _) };
            }
        }
    }

    /// Opening with DELETE_ON_CLOSE and full sharing queues the delete
    /// until the other process closes its handle.
    pub fn mark_delete_on_close(path: &Path) -> io::Result<()> {
        let handle = OpenOptions::new()
            .access_mode(DELETE)
            .share_mode(FILE_SHARE_ALL)
            .custom_flags(FILE_FLAG_DELETE_ON_CLOSE)
            .open(path)?;
        drop(handle);
        Ok(())
    }

    /// Replace the DACL with a single full-control entry for the owner and
    /// stop inheritance from the parent. Directories pass the entry down.
    pub fn set_owner_only(path: &Path, kind: EntryKind) -> io::Result<()> {
        let mut perms = fs::metadata(path)?.permissions();
        if perms.readonly() {
            perms.set_readonly(false);
            fs::set_permissions(path, perms)?;
        }

        let current = Descriptor::read(path)?;
        if current.owner.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("no owner recorded for {}", path.display()),
            ));
        }
        let inheritance = match kind {
            EntryKind::File => NO_INHERITANCE,
            EntryKind::Directory => SUB_CONTAINERS_AND_OBJECTS_INHERIT,
        };
        let entry = EXPLICIT_ACCESS_W {
            grfAccessPermissions: GENERIC_ALL,
            grfAccessMode: SET_ACCESS,
            grfInheritance: inheritance,
            Trustee: TRUSTEE_W {
                pMultipleTrustee: ptr::null_mut(),
                MultipleTrusteeOperation: NO_MULTIPLE_TRUSTEE,
                TrusteeForm: TRUSTEE_IS_SID,
                TrusteeType: TRUSTEE_IS_UNKNOWN,
                ptstrName: current.owner as *mut u16,
            },
        };

        let mut acl: *mut ACL = ptr::null_mut();
        // SAFETY: one entry whose SID outlives the call; no ACL to merge.
        win32(unsafe { SetEntriesInAclW(1, &entry, ptr::null(), &mut acl) })?;

        let mut name = wide(path);
        // SAFETY: name is NUL-terminated and acl was built above.
        let code = unsafe {
            SetNamedSecurityInfoW(
                name.as_mut_ptr(),
                SE_FILE_OBJECT,
                DACL_SECURITY_INFORMATION | PROTECTED_DACL_SECURITY_INFORMATION,
                ptr::null_mut(),
                ptr::null_mut(),
                acl,
                ptr::null(),
            )
        };
        // SAFETY: allocated by SetEntriesInAclW.
        unsafe { LocalFree(acl as _) };
        win32(code)
    }

    /// True only when every allow entry in the DACL names the owner.
    /// A missing DACL grants everyone access; unknown entry kinds fail.
    pub fn has_owner_only(path: &Path, _kind: EntryKind) -> io::Result<bool> {
        if fs::metadata(path)?.permissions().readonly() {
            return Ok(false);
        }
        let desc = Descriptor::read(path)?;
        if desc.dacl.is_null() || desc.owner.is_null() {
            return Ok(false);
        }

        // SAFETY: dacl points into desc.raw.
        let count = unsafe { (*desc.dacl).AceCount };
        for index in 0..u32::from(count) {
            let mut ace: *mut c_void = ptr::null_mut();
            // SAFETY: index is below AceCount.
            if unsafe { GetAce(desc.dacl, index, &mut ace) } == 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: every ACE starts with an ACE_HEADER.
            let kind = unsafe { (*(ace as *const ACE_HEADER)).AceType };
            match kind {
                ACCESS_DENIED_ACE_TYPE => {}
                ACCESS_ALLOWED_ACE_TYPE => {
                    let allowed = ace as *const ACCESS_ALLOWED_ACE;
                    // SAFETY: the SID of an allow entry starts at SidStart.
                    let sid = unsafe { ptr::addr_of!((*allowed).SidStart) } as PSID;
                    // SAFETY: both SIDs live inside their descriptors.
                    if unsafe { EqualSid(sid, desc.owner) } == 0 {
                        return Ok(false);
                    }
                }
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    pub fn available_space(path: &Path) -> io::Result<u64> {
        let name = wide(path);
        let mut available = 0u64;
        // SAFETY: name is NUL-terminated; the two totals are optional.
        let ok = unsafe {
            GetDiskFreeSpaceExW(
                name.as_ptr(),
                &mut available,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(available)
    }
}
