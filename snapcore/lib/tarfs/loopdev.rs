//! Loop devices exposing layer files as read-only block devices.

use std::{
    fs::{File, OpenOptions},
    os::{fd::AsRawFd, unix::ffi::OsStrExt},
    path::{Path, PathBuf},
};

use nix::errno::Errno;

use crate::{SnapshotterError, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const LOOP_CONTROL_PATH: &str = "/dev/loop-control";

const LOOP_SET_FD: u64 = 0x4C00;
const LOOP_CLR_FD: u64 = 0x4C01;
const LOOP_SET_STATUS64: u64 = 0x4C04;
const LOOP_CTL_GET_FREE: u64 = 0x4C82;

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// How many free devices are tried when others grab them first.
const ATTACH_ATTEMPTS: usize = 10;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An attached loop device.
///
/// The handle keeps the device open. Devices are attached with autoclear, so the kernel
/// releases one whose handle was dropped without [`LoopDevice::detach`] once it is no longer
/// mounted.
#[derive(Debug)]
pub struct LoopDevice {
    path: PathBuf,
    device: File,
}

/// Mirror of the kernel's `struct loop_info64`.
#[repr(C)]
#[allow(dead_code)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LoopDevice {
    /// Attaches `backing` to a free loop device, read-only and with autoclear.
    ///
    /// Callers serialize attachment, the kernel interface races when two callers pick the
    /// same free device.
    pub fn attach(backing: impl AsRef<Path>) -> SnapshotterResult<Self> {
        let backing = backing.as_ref();
        let backing_file = File::open(backing)?;
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(LOOP_CONTROL_PATH)?;

        for _ in 0..ATTACH_ATTEMPTS {
            // SAFETY: LOOP_CTL_GET_FREE takes no argument.
            let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
            if index < 0 {
                return Err(Errno::last().into());
            }

            let path = PathBuf::from(format!("/dev/loop{index}"));
            let device = File::open(&path)?;

            // SAFETY: LOOP_SET_FD takes the backing file descriptor by value.
            let ret = unsafe {
                libc::ioctl(
                    device.as_raw_fd(),
                    LOOP_SET_FD as _,
                    backing_file.as_raw_fd() as libc::c_int,
                )
            };
            if ret < 0 {
                match Errno::last() {
                    Errno::EBUSY => continue,
                    errno => return Err(errno.into()),
                }
            }

            let info = LoopInfo64::for_backing(backing);
            // SAFETY: `info` is a valid `loop_info64` that outlives the call.
            let ret = unsafe {
                libc::ioctl(
                    device.as_raw_fd(),
                    LOOP_SET_STATUS64 as _,
                    &info as *const LoopInfo64,
                )
            };
            if ret < 0 {
                let errno = Errno::last();
                // SAFETY: LOOP_CLR_FD takes no meaningful argument.
                unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD as _, 0 as libc::c_int) };
                return Err(errno.into());
            }

            tracing::info!(device = %path.display(), backing = %backing.display(), "attached loop device");
            return Ok(Self { path, device });
        }

        Err(SnapshotterError::Timeout(format!(
            "no free loop device for {}",
            backing.display()
        )))
    }

    /// The device node, such as `/dev/loop3`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detaches the backing file. A device that was already cleared is not an error.
    pub fn detach(self) -> SnapshotterResult<()> {
        // SAFETY: LOOP_CLR_FD takes no meaningful argument.
        let ret = unsafe { libc::ioctl(self.device.as_raw_fd(), LOOP_CLR_FD as _, 0 as libc::c_int) };
        if ret < 0 {
            match Errno::last() {
                Errno::ENXIO => {}
                errno => return Err(errno.into()),
            }
        }

        tracing::info!(device = %self.path.display(), "detached loop device");
        Ok(())
    }
}

impl LoopInfo64 {
    fn for_backing(backing: &Path) -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: LO_FLAGS_READ_ONLY | LO_FLAGS_AUTOCLEAR,
            lo_file_name: file_name_field(backing),
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The NUL-terminated, possibly truncated, backing path recorded in the device status.
fn file_name_field(backing: &Path) -> [u8; LO_NAME_SIZE] {
    let mut field = [0u8; LO_NAME_SIZE];
    let bytes = backing.as_os_str().as_bytes();
    let len = bytes.len().min(LO_NAME_SIZE - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_info_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }

    #[test]
    fn test_file_name_is_truncated_and_terminated() {
        let field = file_name_field(Path::new("/var/cache/blob"));
        assert_eq!(&field[..15], b"/var/cache/blob");
        assert_eq!(field[15], 0);

        let long = PathBuf::from(format!("/{}", "x".repeat(100)));
        let field = file_name_field(&long);
        assert_eq!(field[LO_NAME_SIZE - 1], 0);
        assert_eq!(field[LO_NAME_SIZE - 2], b'x');
    }
}
