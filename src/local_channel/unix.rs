use std::{
    fs, io,
    net::Shutdown,
    os::unix::{
        fs::PermissionsExt,
        net::{UnixListener, UnixStream},
    },
    path::PathBuf,
};

use super::{ChannelEndpoint, ChannelError, LocalStream};

pub(super) type StreamInner = UnixStream;

pub(super) fn connect(endpoint: &ChannelEndpoint) -> Result<StreamInner, ChannelError> {
    UnixStream::connect(endpoint.address()).map_err(ChannelError::from_io)
}

pub(super) fn is_aborted(_error: &io::Error) -> bool {
    false
}

/// A second handle to the socket; shutting it down ends any blocked read on the original.
pub(super) struct IoInterrupt {
    stream: UnixStream,
}

impl IoInterrupt {
    pub(super) fn for_current_io(stream: &StreamInner) -> io::Result<Self> {
        stream.try_clone().map(|stream| Self { stream })
    }

    pub(super) fn interrupt(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[derive(Debug)]
pub struct LocalListener {
    listener: UnixListener,
    path: PathBuf,
}

impl LocalListener {
    /// Binds the socket, replacing a stale file left behind by a crashed process.
    pub fn bind(endpoint: &ChannelEndpoint) -> Result<Self, ChannelError> {
        let path = endpoint.address().to_path_buf();
        if path.exists() {
            match UnixStream::connect(&path) {
                Ok(_) => {
                    return Err(ChannelError::Io(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("{} is already served by a live process", path.display()),
                    )))
                }
                Err(_) => {
                    fs::remove_file(&path).map_err(ChannelError::Io)?;
                }
            }
        }

        let listener = UnixListener::bind(&path).map_err(ChannelError::Io)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(ChannelError::Io)?;
        Ok(Self { listener, path })
    }

    pub fn accept(&self) -> Result<LocalStream, ChannelError> {
        let (stream, _) = self.listener.accept().map_err(ChannelError::from_io)?;
        Ok(LocalStream { inner: stream })
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
