//! In-process transport over depth-one crossbeam channels.
//!
//! The sender keeps a receiver clone so it can evict an unread record
//! before pushing a newer one.
use std::io;

use crossbeam_channel as xch;

use super::{ChannelClient, ChannelServer, Inbox, Outbox, Wait};

pub struct LatestSender {
    tx: xch::Sender<String>,
    evict: xch::Receiver<String>,
}

pub struct LatestReceiver {
    rx: xch::Receiver<String>,
}

/// One direction of a conflated in-process channel.
pub fn latest_channel() -> (LatestSender, LatestReceiver) {
    let (tx, rx) = xch::bounded(1);
    (
        LatestSender {
            tx,
            evict: rx.clone(),
        },
        LatestReceiver { rx },
    )
}

/// Connected server and client halves.
pub fn local_pair() -> (
    ChannelServer<LatestSender, LatestReceiver>,
    ChannelClient<LatestSender, LatestReceiver>,
) {
    let (state_tx, state_rx) = latest_channel();
    let (command_tx, command_rx) = latest_channel();
    (
        ChannelServer::new(state_tx, command_rx),
        ChannelClient::new(command_tx, state_rx),
    )
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "peer disconnected")
}

impl Outbox for LatestSender {
    fn send_latest(&mut self, record: &str) -> io::Result<()> {
        let mut pending = record.to_string();
        // Two attempts: the reader may take the stale record between ours.
        for _ in 0..2 {
            match self.tx.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(xch::TrySendError::Full(back)) => {
                    let _ = self.evict.try_recv();
                    pending = back;
                }
                Err(xch::TrySendError::Disconnected(_)) => return Err(disconnected()),
            }
        }
        tracing::trace!("record dropped: channel refilled concurrently");
        Ok(())
    }
}

impl Inbox for LatestReceiver {
    fn recv_latest(&mut self, wait: Wait) -> io::Result<Option<String>> {
        let first = match wait {
            Wait::NonBlocking => match self.rx.try_recv() {
                Ok(r) => Some(r),
                Err(xch::TryRecvError::Empty) => None,
                Err(xch::TryRecvError::Disconnected) => return Err(disconnected()),
            },
            Wait::For(d) => match self.rx.recv_timeout(d) {
                Ok(r) => Some(r),
                Err(xch::RecvTimeoutError::Timeout) => None,
                Err(xch::RecvTimeoutError::Disconnected) => return Err(disconnected()),
            },
            Wait::Forever => Some(self.rx.recv().map_err(|_| disconnected())?),
        };
        Ok(first.map(|r| self.rx.try_iter().last().unwrap_or(r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unread_record_is_replaced() {
        let (mut tx, mut rx) = latest_channel();
        tx.send_latest("1").unwrap();
        tx.send_latest("2").unwrap();
        assert_eq!(rx.recv_latest(Wait::NonBlocking).unwrap().as_deref(), Some("2"));
        assert_eq!(rx.recv_latest(Wait::NonBlocking).unwrap(), None);
    }

    #[test]
    fn dropped_sender_is_reported_to_receiver() {
        let (tx, mut rx) = latest_channel();
        drop(tx);
        assert_eq!(
            rx.recv_latest(Wait::NonBlocking).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
