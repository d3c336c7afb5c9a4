// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;

use nix::sys::eventfd::EventFd;

/// Kind of a response whose processing is delayed to the session worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    InputPsc,
    OutputPsc,
    LastFlag,
}

/// A complete firmware response, kept aside until the session state allows processing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseWork {
    pub kind: WorkKind,
    pub data: Vec<u8>,
}

/// Pollable queue of offloaded responses of a session.
///
/// Items are kept in arrival order. At most one input port settings change is pending at any
/// time, since only the latest one describes the stream. The FD signals while there is work the
/// worker has not looked at yet: items the worker leaves in the queue with
/// [`WorkQueue::park`] do not keep it signaled.
pub struct WorkQueue {
    event: EventFd,
    signaled: bool,
    pending: VecDeque<ResponseWork>,
}

impl WorkQueue {
    pub fn new() -> nix::Result<Self> {
        EventFd::new().map(|event| Self {
            event,
            signaled: false,
            pending: Default::default(),
        })
    }

    fn signal(&mut self) -> nix::Result<()> {
        if !self.signaled {
            let _ = self.event.write(1)?;
            self.signaled = true;
        }
        Ok(())
    }

    fn clear_signal(&mut self) {
        if self.signaled {
            let _ = self
                .event
                .read()
                .map_err(|e| log::error!("error while reading work queue fd: {:#}", e));
            self.signaled = false;
        }
    }

    /// Add `work` at the end of the queue. A pending input port settings change is replaced by a
    /// newer one, and returned.
    pub fn push(&mut self, work: ResponseWork) -> nix::Result<Option<ResponseWork>> {
        let replaced = match work.kind {
            WorkKind::InputPsc => self.take(WorkKind::InputPsc),
            WorkKind::OutputPsc | WorkKind::LastFlag => None,
        };
        self.pending.push_back(work);
        self.signal()?;

        Ok(replaced)
    }

    /// Take all the pending items, in queueing order.
    pub fn take_all(&mut self) -> Vec<ResponseWork> {
        self.clear_signal();
        self.pending.drain(..).collect()
    }

    /// Put back an item the worker could not process yet, without signaling the FD.
    pub fn park(&mut self, work: ResponseWork) {
        if self.contains(work.kind) {
            log::warn!("dropping parked {:?} work superseded by a newer one", work.kind);
            return;
        }
        self.pending.push_front(work);
    }

    /// Remove and return all the pending items of `kind`, in queueing order.
    pub fn take_kind(&mut self, kind: WorkKind) -> Vec<ResponseWork> {
        let (taken, kept): (VecDeque<ResponseWork>, VecDeque<ResponseWork>) =
            self.pending.drain(..).partition(|w| w.kind == kind);
        self.pending = kept;
        if self.pending.is_empty() {
            self.clear_signal();
        }
        taken.into()
    }

    /// Remove and return the oldest pending item of `kind`, if any.
    pub fn take(&mut self, kind: WorkKind) -> Option<ResponseWork> {
        let pos = self.pending.iter().position(|w| w.kind == kind)?;
        let work = self.pending.remove(pos);
        if self.pending.is_empty() {
            self.clear_signal();
        }
        work
    }

    pub fn contains(&self, kind: WorkKind) -> bool {
        self.pending.iter().any(|w| w.kind == kind)
    }

    /// Drop all pending items.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.clear_signal();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl AsFd for WorkQueue {
    fn as_fd(&self) -> BorrowedFd {
        self.event.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::epoll::*;

    use super::*;

    fn work(kind: WorkKind, tag: u8) -> ResponseWork {
        ResponseWork {
            kind,
            data: vec![tag],
        }
    }

    #[test]
    fn input_psc_is_replaced() {
        let mut queue = WorkQueue::new().unwrap();

        assert_eq!(queue.push(work(WorkKind::InputPsc, 1)).unwrap(), None);
        assert_eq!(queue.push(work(WorkKind::LastFlag, 2)).unwrap(), None);
        assert_eq!(
            queue.push(work(WorkKind::InputPsc, 3)).unwrap(),
            Some(work(WorkKind::InputPsc, 1))
        );
        assert_eq!(queue.len(), 2);

        assert_eq!(
            queue.take_all(),
            vec![work(WorkKind::LastFlag, 2), work(WorkKind::InputPsc, 3)]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn buffer_responses_are_all_kept() {
        let mut queue = WorkQueue::new().unwrap();

        assert_eq!(queue.push(work(WorkKind::LastFlag, 1)).unwrap(), None);
        assert_eq!(queue.push(work(WorkKind::OutputPsc, 2)).unwrap(), None);
        assert_eq!(queue.push(work(WorkKind::LastFlag, 3)).unwrap(), None);
        assert_eq!(queue.push(work(WorkKind::OutputPsc, 4)).unwrap(), None);
        assert_eq!(queue.len(), 4);

        assert_eq!(
            queue.take_kind(WorkKind::LastFlag),
            vec![work(WorkKind::LastFlag, 1), work(WorkKind::LastFlag, 3)]
        );
        assert_eq!(
            queue.take_all(),
            vec![work(WorkKind::OutputPsc, 2), work(WorkKind::OutputPsc, 4)]
        );
        assert!(queue.take_kind(WorkKind::OutputPsc).is_empty());
    }

    #[test]
    fn take_and_park() {
        let mut queue = WorkQueue::new().unwrap();

        queue.push(work(WorkKind::OutputPsc, 1)).unwrap();
        queue.push(work(WorkKind::InputPsc, 2)).unwrap();
        assert_eq!(queue.take(WorkKind::LastFlag), None);
        assert_eq!(
            queue.take(WorkKind::InputPsc),
            Some(work(WorkKind::InputPsc, 2))
        );

        queue.park(work(WorkKind::InputPsc, 2));
        assert!(queue.contains(WorkKind::InputPsc));
        // A parked item never replaces a newer one.
        queue.park(work(WorkKind::InputPsc, 4));
        assert_eq!(
            queue.take(WorkKind::InputPsc),
            Some(work(WorkKind::InputPsc, 2))
        );

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn work_queue_polling() {
        let mut queue = WorkQueue::new().unwrap();
        let epoll = Epoll::new(EpollCreateFlags::empty()).unwrap();
        epoll
            .add(queue.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 1))
            .unwrap();

        let mut events = [EpollEvent::empty()];
        assert_eq!(epoll.wait(&mut events, EpollTimeout::ZERO).unwrap(), 0);

        queue.push(work(WorkKind::InputPsc, 1)).unwrap();
        assert_eq!(epoll.wait(&mut events, EpollTimeout::ZERO).unwrap(), 1);
        queue.push(work(WorkKind::LastFlag, 2)).unwrap();
        assert_eq!(epoll.wait(&mut events, EpollTimeout::ZERO).unwrap(), 1);

        // The worker looks at everything and parks what it cannot process yet.
        let items = queue.take_all();
        assert_eq!(epoll.wait(&mut events, EpollTimeout::ZERO).unwrap(), 0);
        queue.park(items[0].clone());
        assert_eq!(epoll.wait(&mut events, EpollTimeout::ZERO).unwrap(), 0);
        assert_eq!(queue.len(), 1);

        // New work signals again.
        queue.push(work(WorkKind::OutputPsc, 3)).unwrap();
        assert_eq!(epoll.wait(&mut events, EpollTimeout::ZERO).unwrap(), 1);
        queue.clear();
        assert_eq!(epoll.wait(&mut events, EpollTimeout::ZERO).unwrap(), 0);
    }
}
