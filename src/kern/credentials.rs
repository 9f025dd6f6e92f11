//! Process credentials
//!
//! Real, effective and saved user and group ids with the POSIX rules for
//! changing them. Ids arrive from syscalls as signed values so that `-1` can
//! mean "leave unchanged" where POSIX allows it.

use crate::config::MAX_ID;
use crate::error::{KernResult, KernelError};

pub type Uid = u32;
pub type Gid = u32;

/// Credentials of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    ruid: Uid,
    euid: Uid,
    suid: Uid,
    rgid: Gid,
    egid: Gid,
    sgid: Gid,
}

fn validate(id: i64) -> KernResult<u32> {
    if (0..MAX_ID).contains(&id) {
        Ok(id as u32)
    } else {
        Err(KernelError::InvalidArgument)
    }
}

/// -1 means "unchanged"
fn validate_optional(id: i64) -> KernResult<Option<u32>> {
    if id == -1 {
        Ok(None)
    } else {
        validate(id).map(Some)
    }
}

impl Credentials {
    pub const fn new(uid: Uid, gid: Gid) -> Self {
        Self {
            ruid: uid,
            euid: uid,
            suid: uid,
            rgid: gid,
            egid: gid,
            sgid: gid,
        }
    }

    /// Credentials of kernel processes
    pub const fn root() -> Self {
        Self::new(0, 0)
    }

    pub const fn ruid(&self) -> Uid {
        self.ruid
    }

    pub const fn euid(&self) -> Uid {
        self.euid
    }

    pub const fn suid(&self) -> Uid {
        self.suid
    }

    pub const fn rgid(&self) -> Gid {
        self.rgid
    }

    pub const fn egid(&self) -> Gid {
        self.egid
    }

    pub const fn sgid(&self) -> Gid {
        self.sgid
    }

    pub const fn is_superuser(&self) -> bool {
        self.euid == 0
    }

    /// setuid(2)
    pub fn set_uid(&mut self, uid: i64) -> KernResult<()> {
        let uid = validate(uid)?;
        if self.is_superuser() {
            self.ruid = uid;
            self.euid = uid;
            self.suid = uid;
            return Ok(());
        }
        if uid == self.ruid || uid == self.suid {
            self.euid = uid;
            return Ok(());
        }
        Err(KernelError::PermissionDenied)
    }

    /// setgid(2)
    pub fn set_gid(&mut self, gid: i64) -> KernResult<()> {
        let gid = validate(gid)?;
        if self.is_superuser() {
            self.rgid = gid;
            self.egid = gid;
            self.sgid = gid;
            return Ok(());
        }
        if gid == self.rgid || gid == self.sgid {
            self.egid = gid;
            return Ok(());
        }
        Err(KernelError::PermissionDenied)
    }

    /// seteuid(2)
    pub fn set_euid(&mut self, uid: i64) -> KernResult<()> {
        let uid = validate(uid)?;
        if uid == self.ruid || uid == self.suid || self.is_superuser() {
            self.euid = uid;
            return Ok(());
        }
        Err(KernelError::PermissionDenied)
    }

    /// setegid(2)
    pub fn set_egid(&mut self, gid: i64) -> KernResult<()> {
        let gid = validate(gid)?;
        if gid == self.rgid || gid == self.sgid || self.is_superuser() {
            self.egid = gid;
            return Ok(());
        }
        Err(KernelError::PermissionDenied)
    }

    /// setreuid(2)
    ///
    /// An unprivileged caller may move either id to any of its current real,
    /// effective or saved uid.
    pub fn set_reuid(&mut self, ruid: i64, euid: i64) -> KernResult<()> {
        let ruid = validate_optional(ruid)?;
        let euid = validate_optional(euid)?;
        if ruid.is_none() && euid.is_none() {
            return Ok(());
        }

        if !self.is_superuser() {
            let allowed = |id: Uid| id == self.ruid || id == self.euid || id == self.suid;
            if euid.is_some_and(|id| !allowed(id)) || ruid.is_some_and(|id| !allowed(id)) {
                return Err(KernelError::PermissionDenied);
            }
        }

        let new_euid = euid.unwrap_or(self.euid);
        if ruid.is_some() || euid.is_some_and(|id| id != self.ruid) {
            self.suid = new_euid;
        }
        if let Some(ruid) = ruid {
            self.ruid = ruid;
        }
        self.euid = new_euid;
        Ok(())
    }

    /// setregid(2)
    ///
    /// An unprivileged caller may set the real gid to the saved gid and the
    /// effective gid to the real or saved gid.
    pub fn set_regid(&mut self, rgid: i64, egid: i64) -> KernResult<()> {
        let rgid = validate_optional(rgid)?;
        let egid = validate_optional(egid)?;
        if rgid.is_none() && egid.is_none() {
            return Ok(());
        }

        if !self.is_superuser() {
            if rgid.is_some_and(|id| id != self.rgid && id != self.sgid) {
                return Err(KernelError::PermissionDenied);
            }
            if egid.is_some_and(|id| id != self.rgid && id != self.sgid) {
                return Err(KernelError::PermissionDenied);
            }
        }

        let new_egid = egid.unwrap_or(self.egid);
        if rgid.is_some() || egid.is_some_and(|id| id != self.rgid) {
            self.sgid = new_egid;
        }
        if let Some(rgid) = rgid {
            self.rgid = rgid;
        }
        self.egid = new_egid;
        Ok(())
    }
}
