use crate::EngineError;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Child;

/// A pseudo-terminal pair for engines that must hand the child a terminal
/// while the invoking process has none.
///
/// The child gets the slave side as its stdio; [`relay`](Self::relay)
/// pumps the master side to standard output until the child exits.
pub struct Pty {
    master: OwnedFd,
    slave_path: PathBuf,
}

impl Pty {
    #[allow(unsafe_code)]
    pub fn open() -> Result<Self, EngineError> {
        // SAFETY: posix_openpt has no preconditions; the fd is validated
        // before OwnedFd takes unique ownership of it.
        let fd = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: fd was just returned by posix_openpt and is not shared.
        let master = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: fd is a valid open pty master for both calls.
        let prepared = unsafe { libc::grantpt(fd) == 0 && libc::unlockpt(fd) == 0 };
        if !prepared {
            return Err(std::io::Error::last_os_error().into());
        }

        let mut name = [0u8; 128];
        // SAFETY: name is writable for its whole length, which is passed
        // as the buffer size; ptsname_r NUL-terminates on success.
        let rc = unsafe { libc::ptsname_r(fd, name.as_mut_ptr().cast(), name.len()) };
        if rc != 0 {
            return Err(std::io::Error::from_raw_os_error(rc).into());
        }
        let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
        let slave_path = PathBuf::from(String::from_utf8_lossy(&name[..end]).into_owned());
        Ok(Self { master, slave_path })
    }

    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Open the slave side for the child's stdin/stdout/stderr.
    pub fn open_slave(&self) -> Result<File, EngineError> {
        Ok(std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.slave_path)?)
    }

    /// Copy everything the child writes to the terminal onto standard
    /// output until it exits, then drain whatever is left buffered.
    #[allow(unsafe_code)]
    pub fn relay(&self, child: &mut Child) -> Result<std::process::ExitStatus, EngineError> {
        let status = loop {
            self.pump(100)?;
            if let Some(status) = child.try_wait()? {
                break status;
            }
        };
        while self.pump(0)? {}
        Ok(status)
    }

    /// One poll/read/write round. Returns whether any bytes moved.
    #[allow(unsafe_code)]
    fn pump(&self, timeout_ms: i32) -> Result<bool, EngineError> {
        let fd = self.master.as_raw_fd();
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pollfd is a single valid struct for the duration of the call.
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready <= 0 || pollfd.revents & libc::POLLIN == 0 {
            return Ok(false);
        }
        let mut buf = [0u8; 4096];
        // SAFETY: buf is writable for the length passed; fd stays open for
        // the lifetime of self.
        let count = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if count <= 0 {
            // EIO after the slave side closes means end of stream.
            return Ok(false);
        }
        #[allow(clippy::cast_sign_loss)]
        let count = count as usize;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&buf[..count])?;
        stdout.flush()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::process::{Command, Stdio};

    #[test]
    fn open_yields_usable_pair() {
        let pty = Pty::open().unwrap();
        assert!(pty.slave_path().starts_with("/dev/pts"));

        let mut slave = pty.open_slave().unwrap();
        slave.write_all(b"ping\n").unwrap();
        // terminal line discipline echoes back through the master
        let mut master = std::fs::File::from(pty.master.try_clone().unwrap());
        let mut buf = [0u8; 16];
        let n = master.read(&mut buf).unwrap();
        assert!(n > 0);
    }

    #[test]
    fn relay_returns_child_exit_status() {
        let pty = Pty::open().unwrap();
        let slave = pty.open_slave().unwrap();
        let mut child = Command::new("/bin/sh")
            .args(["-c", "exit 7"])
            .stdin(Stdio::from(slave.try_clone().unwrap()))
            .stdout(Stdio::from(slave.try_clone().unwrap()))
            .stderr(Stdio::from(slave))
            .spawn()
            .unwrap();
        let status = pty.relay(&mut child).unwrap();
        assert_eq!(status.code(), Some(7));
    }
}
