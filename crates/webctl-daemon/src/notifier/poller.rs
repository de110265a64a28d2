//! Level-triggered readiness wait over registered descriptors.

use std::io;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use super::{Descriptor, NotifierKind};

type Source = (Descriptor, NotifierKind, Arc<dyn AsFd + Send + Sync>);

/// Descriptors to poll, captured at one notifier-registry version.
pub struct PollSet {
    version: u64,
    sources: Vec<Source>,
}

impl PollSet {
    pub(crate) const fn new(version: u64, sources: Vec<Source>) -> Self {
        Self { version, sources }
    }

    /// Registry version the snapshot was taken at.
    pub const fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

const fn interest(kind: NotifierKind) -> PollFlags {
    match kind {
        NotifierKind::Read => PollFlags::POLLIN,
        NotifierKind::Write => PollFlags::POLLOUT,
        NotifierKind::Exception => PollFlags::POLLPRI,
    }
}

fn is_ready(kind: NotifierKind, revents: PollFlags) -> bool {
    let ready = match kind {
        NotifierKind::Read => PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
        NotifierKind::Write => PollFlags::POLLOUT | PollFlags::POLLERR,
        NotifierKind::Exception => PollFlags::POLLPRI,
    };
    revents.intersects(ready)
}

/// Block until a descriptor in `set` is ready or `timeout` elapses.
///
/// Returns the ready (descriptor, kind) pairs, in registration order. An
/// interrupted wait returns no pairs.
pub fn wait_ready(set: &PollSet, timeout: Duration) -> io::Result<Vec<(Descriptor, NotifierKind)>> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    if set.sources.is_empty() {
        std::thread::sleep(Duration::from_millis(u64::from(millis)));
        return Ok(Vec::new());
    }

    let mut fds: Vec<PollFd<'_>> = set
        .sources
        .iter()
        .map(|(_, kind, src)| PollFd::new(src.as_fd(), interest(*kind)))
        .collect();

    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) | Err(Errno::EINTR) => return Ok(Vec::new()),
        Ok(_) => {}
        Err(e) => return Err(io::Error::from(e)),
    }

    Ok(set
        .sources
        .iter()
        .zip(&fds)
        .filter(|((_, kind, _), fd)| fd.revents().is_some_and(|r| is_ready(*kind, r)))
        .map(|((descriptor, kind, _), _)| (*descriptor, *kind))
        .collect())
}
