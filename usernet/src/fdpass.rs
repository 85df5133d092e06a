//! Fd-passing listener: VMMs that cannot speak the datagram protocol
//! directly connect over a stream socket and receive one end of a
//! connected datagram socketpair via SCM_RIGHTS. The kept end gets its
//! own session loop.

use crate::leases::LeaseTable;
use crate::switch::{SwitchParams, run_session};
use crate::UsernetError;
use nix::sys::socket::{
    AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType, sendmsg, socketpair,
};
use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn run_listener(
    listener: UnixListener,
    params: SwitchParams,
    leases: Arc<Mutex<LeaseTable>>,
    shutdown: Arc<AtomicBool>,
) {
    if let Err(e) = listener.set_nonblocking(true) {
        tracing::error!(error = %e, "fd listener setup failed");
        return;
    }
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = hand_over(stream, &params, &leases, &shutdown) {
                    tracing::warn!(error = %e, "fd handover failed");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                tracing::error!(error = %e, "fd listener accept failed");
                break;
            }
        }
    }
    tracing::debug!("fd listener stopped");
}

fn hand_over(
    stream: UnixStream,
    params: &SwitchParams,
    leases: &Arc<Mutex<LeaseTable>>,
    shutdown: &Arc<AtomicBool>,
) -> Result<(), UsernetError> {
    let (ours, theirs) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::empty(),
    )
    .map_err(std::io::Error::from)?;

    send_fd(&stream, &theirs)?;
    drop(theirs);
    tracing::info!("handed datagram fd to peer");

    let params = params.clone();
    let leases = Arc::clone(leases);
    let shutdown = Arc::clone(shutdown);
    std::thread::Builder::new()
        .name("usernet-session".to_string())
        .spawn(move || {
            // The session owns both the socketpair end and the stream;
            // closing the stream tells the peer the session is gone.
            let _stream = stream;
            run_session(ours.as_raw_fd(), &params, leases, shutdown);
            drop(ours);
        })
        .map_err(UsernetError::Io)?;
    Ok(())
}

fn send_fd(stream: &UnixStream, fd: &OwnedFd) -> Result<(), UsernetError> {
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    // One data byte so the peer's recvmsg returns.
    let iov = [IoSlice::new(b"F")];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::cmsg_space;
    use nix::sys::socket::{RecvMsg, recvmsg};
    use std::io::IoSliceMut;
    use std::os::fd::RawFd;

    #[test]
    fn fd_arrives_with_scm_rights() {
        let (a, b) = UnixStream::pair().unwrap();
        let (ours, _theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        send_fd(&a, &ours).unwrap();

        let mut data = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut data)];
        let mut space = cmsg_space!([RawFd; 1]);
        let msg: RecvMsg<'_, '_, ()> = recvmsg(
            b.as_raw_fd(),
            &mut iov,
            Some(&mut space),
            MsgFlags::empty(),
        )
        .unwrap();
        let received: Vec<RawFd> = msg
            .cmsgs()
            .unwrap()
            .filter_map(|c| match c {
                nix::sys::socket::ControlMessageOwned::ScmRights(fds) => Some(fds),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(received.len(), 1);
        assert_eq!(data, *b"F");
        for fd in received {
            unsafe { libc::close(fd) };
        }
    }
}
