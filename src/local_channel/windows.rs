use std::{
    ffi::OsStr,
    fs::File,
    io, iter,
    os::windows::{
        ffi::OsStrExt,
        io::{AsRawHandle, FromRawHandle, OwnedHandle},
    },
    ptr,
    sync::Mutex,
};

use windows_sys::Win32::{
    Foundation::{
        DuplicateHandle, LocalFree, DUPLICATE_SAME_ACCESS, ERROR_ACCESS_DENIED,
        ERROR_OPERATION_ABORTED, ERROR_PIPE_BUSY, ERROR_PIPE_CONNECTED, ERROR_PIPE_NOT_CONNECTED,
        GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
    },
    Security::{
        Authorization::{
            ConvertSidToStringSidW, ConvertStringSecurityDescriptorToSecurityDescriptorW,
            SDDL_REVISION_1,
        },
        GetTokenInformation, TokenUser, PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES, TOKEN_QUERY,
        TOKEN_USER,
    },
    Storage::FileSystem::{
        CreateFileW, FILE_FLAG_FIRST_PIPE_INSTANCE, OPEN_EXISTING, PIPE_ACCESS_DUPLEX,
    },
    System::{
        Pipes::{
            ConnectNamedPipe, CreateNamedPipeW, WaitNamedPipeW, PIPE_READMODE_BYTE,
            PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_BYTE, PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
        },
        Threading::{GetCurrentProcess, GetCurrentThread, OpenProcessToken},
        IO::CancelSynchronousIo,
    },
};

use super::{ChannelEndpoint, ChannelError, LocalStream};

const PIPE_BUFFER_BYTES: u32 = 64 * 1024;
const PIPE_BUSY_WAIT_MS: u32 = 2_000;
const LOCAL_SYSTEM_SID: &str = "S-1-5-18";

pub(super) type StreamInner = File;

fn to_wide(value: &OsStr) -> Vec<u16> {
    value.encode_wide().chain(iter::once(0)).collect()
}

fn raw_os_error_is(error: &io::Error, code: u32) -> bool {
    error.raw_os_error() == Some(code as i32)
}

pub(super) fn is_aborted(error: &io::Error) -> bool {
    raw_os_error_is(error, ERROR_OPERATION_ABORTED)
}

pub(super) fn connect(endpoint: &ChannelEndpoint) -> Result<StreamInner, ChannelError> {
    let name = to_wide(endpoint.address().as_os_str());
    loop {
        let handle = unsafe {
            // Safety:
            // - `name` is a NUL-terminated UTF-16 buffer that outlives the call.
            CreateFileW(
                name.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                ptr::null(),
                OPEN_EXISTING,
                0,
                ptr::null_mut(),
            )
        };
        if handle != INVALID_HANDLE_VALUE {
            // Safety:
            // - `handle` is a freshly opened pipe client handle owned by nobody else.
            return Ok(unsafe { File::from_raw_handle(handle) });
        }

        let error = io::Error::last_os_error();
        if !raw_os_error_is(&error, ERROR_PIPE_BUSY) {
            return Err(ChannelError::from_io(error));
        }
        let waited = unsafe {
            // Safety:
            // - `name` is a NUL-terminated UTF-16 buffer that outlives the call.
            WaitNamedPipeW(name.as_ptr(), PIPE_BUSY_WAIT_MS)
        };
        if waited == 0 {
            return Err(ChannelError::EndpointUnavailable);
        }
    }
}

/// Duplicated handle of the thread that owns the in-flight synchronous pipe call.
pub(super) struct IoInterrupt {
    thread: OwnedHandle,
}

impl IoInterrupt {
    pub(super) fn for_current_io(_stream: &StreamInner) -> io::Result<Self> {
        let mut thread: HANDLE = ptr::null_mut();
        let duplicated = unsafe {
            // Safety:
            // - Pseudo handles of the current process/thread are always valid.
            // - `thread` receives a real handle that we take ownership of below.
            DuplicateHandle(
                GetCurrentProcess(),
                GetCurrentThread(),
                GetCurrentProcess(),
                &mut thread,
                0,
                0,
                DUPLICATE_SAME_ACCESS,
            )
        };
        if duplicated == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            // Safety:
            // - `DuplicateHandle` succeeded, so `thread` is an owned, valid handle.
            thread: unsafe { OwnedHandle::from_raw_handle(thread) },
        })
    }

    pub(super) fn interrupt(&self) {
        unsafe {
            // Safety:
            // - The thread handle stays open while `self` is alive.
            CancelSynchronousIo(self.thread.as_raw_handle());
        }
    }
}

struct SecurityDescriptor(PSECURITY_DESCRIPTOR);

impl SecurityDescriptor {
    fn from_sddl(sddl: &str) -> io::Result<Self> {
        let wide = to_wide(OsStr::new(sddl));
        let mut descriptor: PSECURITY_DESCRIPTOR = ptr::null_mut();
        let converted = unsafe {
            // Safety:
            // - `wide` is NUL-terminated and `descriptor` receives a LocalAlloc'd buffer.
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                wide.as_ptr(),
                SDDL_REVISION_1,
                &mut descriptor,
                ptr::null_mut(),
            )
        };
        if converted == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(descriptor))
    }
}

impl Drop for SecurityDescriptor {
    fn drop(&mut self) {
        unsafe {
            // Safety:
            // - The buffer was allocated by the SDDL conversion and is freed once.
            LocalFree(self.0);
        }
    }
}

fn current_user_sid() -> io::Result<String> {
    let mut token: HANDLE = ptr::null_mut();
    let opened = unsafe {
        // Safety:
        // - `token` receives a handle owned by this function.
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token)
    };
    if opened == 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety:
    // - `OpenProcessToken` succeeded, so `token` is owned and valid.
    let token = unsafe { OwnedHandle::from_raw_handle(token) };

    let mut needed = 0u32;
    unsafe {
        // Safety:
        // - Size query with a null buffer; only `needed` is written.
        GetTokenInformation(
            token.as_raw_handle(),
            TokenUser,
            ptr::null_mut(),
            0,
            &mut needed,
        );
    }
    if needed == 0 {
        return Err(io::Error::last_os_error());
    }
    // u64 storage keeps the TOKEN_USER header aligned.
    let mut buffer = vec![0u64; (needed as usize).div_ceil(8)];
    let queried = unsafe {
        // Safety:
        // - `buffer` has at least `needed` bytes.
        GetTokenInformation(
            token.as_raw_handle(),
            TokenUser,
            buffer.as_mut_ptr().cast(),
            needed,
            &mut needed,
        )
    };
    if queried == 0 {
        return Err(io::Error::last_os_error());
    }

    // Safety:
    // - The call above filled `buffer` with a TOKEN_USER structure.
    let sid = unsafe { (*buffer.as_ptr().cast::<TOKEN_USER>()).User.Sid };
    let mut sid_text: *mut u16 = ptr::null_mut();
    let converted = unsafe {
        // Safety:
        // - `sid` points into `buffer`, which is alive for the call.
        ConvertSidToStringSidW(sid, &mut sid_text)
    };
    if converted == 0 {
        return Err(io::Error::last_os_error());
    }
    let text = unsafe {
        // Safety:
        // - `sid_text` is a NUL-terminated string allocated by the conversion.
        let len = (0..).take_while(|offset| *sid_text.add(*offset) != 0).count();
        String::from_utf16_lossy(std::slice::from_raw_parts(sid_text, len))
    };
    unsafe {
        // Safety:
        // - Frees the LocalAlloc'd SID string exactly once.
        LocalFree(sid_text.cast());
    }
    Ok(text)
}

/// SYSTEM and the creating user get full access. A pipe created by a LocalSystem service
/// additionally admits interactive users so the desktop shell can reach it.
fn pipe_sddl() -> io::Result<String> {
    let owner = current_user_sid()?;
    let mut sddl = format!("D:P(A;;GA;;;SY)(A;;GA;;;{owner})");
    if owner == LOCAL_SYSTEM_SID {
        sddl.push_str("(A;;GRGW;;;IU)");
    }
    Ok(sddl)
}

#[derive(Debug)]
pub struct LocalListener {
    name: Vec<u16>,
    display_name: String,
    sddl: String,
    pending: Mutex<Option<OwnedHandle>>,
}

impl LocalListener {
    pub fn bind(endpoint: &ChannelEndpoint) -> Result<Self, ChannelError> {
        let listener = Self {
            name: to_wide(endpoint.address().as_os_str()),
            display_name: endpoint.to_string(),
            sddl: pipe_sddl().map_err(ChannelError::Io)?,
            pending: Mutex::new(None),
        };
        let first = listener.create_instance(true).map_err(|error| {
            if raw_os_error_is(&error, ERROR_ACCESS_DENIED) {
                ChannelError::Io(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is already served by another process", listener.display_name),
                ))
            } else {
                ChannelError::Io(error)
            }
        })?;
        *listener.lock_pending() = Some(first);
        Ok(listener)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<OwnedHandle>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn create_instance(&self, first: bool) -> io::Result<OwnedHandle> {
        let descriptor = SecurityDescriptor::from_sddl(&self.sddl)?;
        let attributes = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: descriptor.0,
            bInheritHandle: 0,
        };
        let open_mode = if first {
            PIPE_ACCESS_DUPLEX | FILE_FLAG_FIRST_PIPE_INSTANCE
        } else {
            PIPE_ACCESS_DUPLEX
        };
        let handle = unsafe {
            // Safety:
            // - `self.name` is NUL-terminated; `attributes` and the descriptor it points to
            //   live until the call returns.
            CreateNamedPipeW(
                self.name.as_ptr(),
                open_mode,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
                PIPE_UNLIMITED_INSTANCES,
                PIPE_BUFFER_BYTES,
                PIPE_BUFFER_BYTES,
                0,
                &attributes,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        // Safety:
        // - `CreateNamedPipeW` returned a valid handle owned by us.
        Ok(unsafe { OwnedHandle::from_raw_handle(handle) })
    }

    /// Waits for one client on the prepared pipe instance, then prepares the next one so
    /// the name never disappears while a connection is being served.
    pub fn accept(&self) -> Result<LocalStream, ChannelError> {
        let instance = match self.lock_pending().take() {
            Some(instance) => instance,
            None => self.create_instance(false).map_err(ChannelError::Io)?,
        };

        let connected = unsafe {
            // Safety:
            // - `instance` is a valid server pipe handle; synchronous connect.
            ConnectNamedPipe(instance.as_raw_handle(), ptr::null_mut())
        };
        if connected == 0 {
            let error = io::Error::last_os_error();
            if !raw_os_error_is(&error, ERROR_PIPE_CONNECTED) {
                if raw_os_error_is(&error, ERROR_PIPE_NOT_CONNECTED) {
                    return Err(ChannelError::Disconnected);
                }
                return Err(ChannelError::from_io(error));
            }
        }

        if let Ok(next) = self.create_instance(false) {
            *self.lock_pending() = Some(next);
        }
        Ok(LocalStream {
            inner: File::from(instance),
        })
    }
}
