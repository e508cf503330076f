//! Fragment flow control and recombination
//!
//! The controller has a fixed pool of data packet buffers shared by every connection. The
//! [`FlowManager`] keeps one global first-in first-out queue of outbound fragments and counts
//! the fragments in flight per link; a fragment leaves the queue only while the total number in
//! flight is below the pool size. The *Number of Completed Packets* notifications from the
//! controller replenish the pool and re-trigger the drain.
//!
//! Inbound, the manager recombines each link's fragments back into basic frames. Recombination
//! faults do not reach the protocols above, the partial state is dropped and the fault logged.

use crate::cid::ChannelId;
use crate::frame::{fragment, BasicFrame, Fragment};
use core::fmt;
use lazuli_core::ConnectionHandle;
use std::collections::{HashMap, VecDeque};

/// A fragment cleared for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFragment {
    pub handle: ConnectionHandle,
    pub start: bool,
    pub data: Vec<u8>,
}

/// Error from submitting a service data unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendSduError {
    UnknownLink(ConnectionHandle),
    SduTooLarge(usize),
}

impl fmt::Display for SendSduError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SendSduError::UnknownLink(handle) => write!(f, "no link for connection handle {}", handle),
            SendSduError::SduTooLarge(size) => {
                write!(f, "a service data unit of {} bytes cannot be framed", size)
            }
        }
    }
}

impl std::error::Error for SendSduError {}

struct Reassembly {
    raw: Vec<u8>,
    total: Option<usize>,
}

#[derive(Default)]
struct LinkState {
    in_flight: usize,
    recombine: Option<Reassembly>,
}

/// Fragmentation, recombination, and credit bookkeeping for every link
///
/// All methods are synchronous. Methods that can clear fragments for transmission return them;
/// the caller transmits each returned [`TxFragment`] immediately and in order.
pub struct FlowManager {
    fragment_limit: usize,
    max_in_flight: usize,
    in_flight: usize,
    links: HashMap<ConnectionHandle, LinkState>,
    tx_queue: VecDeque<(ConnectionHandle, Fragment)>,
}

impl FlowManager {
    /// Create a new `FlowManager`
    ///
    /// `fragment_limit` is the maximum payload of one data packet and `max_in_flight` is the
    /// total number of data packet buffers in the controller, both as reported by the buffer
    /// size commands.
    ///
    /// # Panic
    /// Neither `fragment_limit` nor `max_in_flight` may be zero.
    pub fn new(fragment_limit: usize, max_in_flight: usize) -> Self {
        assert_ne!(0, fragment_limit, "the controller reported a zero data packet length");
        assert_ne!(0, max_in_flight, "the controller reported zero data packet buffers");

        FlowManager {
            fragment_limit,
            max_in_flight,
            in_flight: 0,
            links: HashMap::new(),
            tx_queue: VecDeque::new(),
        }
    }

    pub fn get_fragment_limit(&self) -> usize {
        self.fragment_limit
    }

    pub fn get_max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// The total number of fragments currently in flight
    pub fn get_in_flight(&self) -> usize {
        self.in_flight
    }

    /// Begin bookkeeping for a link
    ///
    /// Returns false when the link already exists.
    pub fn add_link(&mut self, handle: ConnectionHandle) -> bool {
        match self.links.entry(handle) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(LinkState::default());

                true
            }
        }
    }

    /// Tear down a link
    ///
    /// Queued fragments for the link are dropped, its reassembly buffer is discarded, and its
    /// in flight count is released back to the pool. Releasing the count can clear queued
    /// fragments of *other* links for transmission, so this returns fragments like the send
    /// methods do.
    pub fn remove_link(&mut self, handle: ConnectionHandle) -> Vec<TxFragment> {
        let Some(link) = self.links.remove(&handle) else {
            return Vec::new();
        };

        self.tx_queue.retain(|(queued_handle, _)| *queued_handle != handle);

        self.in_flight -= link.in_flight;

        self.drain()
    }

    /// Submit a service data unit for transfer
    ///
    /// The payload is framed for `channel_id`, fragmented, and queued. The returned fragments
    /// are the ones cleared for immediate transmission by the available credit; the rest stay
    /// queued until [`completed_packets`](FlowManager::completed_packets) replenishes the pool.
    pub fn send_sdu(
        &mut self,
        handle: ConnectionHandle,
        channel_id: ChannelId,
        payload: Vec<u8>,
    ) -> Result<Vec<TxFragment>, SendSduError> {
        if !self.links.contains_key(&handle) {
            return Err(SendSduError::UnknownLink(handle));
        }

        if payload.len() > <u16>::MAX.into() {
            return Err(SendSduError::SduTooLarge(payload.len()));
        }

        let frame = BasicFrame::new(channel_id, payload);

        for piece in fragment(frame, self.fragment_limit) {
            self.tx_queue.push_back((handle, piece));
        }

        Ok(self.drain())
    }

    /// Process a completed packets notification for a link
    ///
    /// The link's in flight count is decremented by `count`, floored at zero, and the transmit
    /// queue is drained against the replenished pool.
    pub fn completed_packets(&mut self, handle: ConnectionHandle, count: usize) -> Vec<TxFragment> {
        match self.links.get_mut(&handle) {
            Some(link) => {
                if count > link.in_flight {
                    log::warn!(
                        "completed packets notification for {} completes {} packets but only {} are in flight",
                        handle,
                        count,
                        link.in_flight
                    );
                }

                let decrement = count.min(link.in_flight);

                link.in_flight -= decrement;
                self.in_flight -= decrement;
            }
            None => log::warn!("completed packets notification for unknown connection handle {}", handle),
        }

        self.drain()
    }

    /// Recombine an inbound fragment
    ///
    /// Returns the completed basic frame once the fragment finishes a recombination. Faults
    /// (a continuation without a frame in progress, a start fragment interrupting a frame in
    /// progress, or data overrunning the declared length) drop the partial state and are
    /// logged, they produce no frame.
    pub fn recv_fragment(&mut self, handle: ConnectionHandle, start: bool, data: &[u8]) -> Option<BasicFrame> {
        let Some(link) = self.links.get_mut(&handle) else {
            log::warn!("dropping fragment for unknown connection handle {}", handle);

            return None;
        };

        if start {
            if link.recombine.is_some() {
                log::warn!(
                    "new frame started on {} while one was being recombined, dropping the partial frame",
                    handle
                );
            }

            link.recombine = Some(Reassembly {
                raw: data.to_vec(),
                total: None,
            });
        } else {
            match link.recombine.as_mut() {
                Some(reassembly) => reassembly.raw.extend_from_slice(data),
                None => {
                    log::warn!("dropping continuation fragment on {}, no frame is being recombined", handle);

                    return None;
                }
            }
        }

        enum Progress {
            Incomplete,
            Complete,
            Overrun,
        }

        let progress = match link.recombine.as_mut() {
            None => return None,
            Some(reassembly) => {
                // the frame header itself may be split across fragments
                if reassembly.total.is_none() && reassembly.raw.len() >= BasicFrame::HEADER_SIZE {
                    let length = <u16>::from_le_bytes([reassembly.raw[0], reassembly.raw[1]]) as usize;

                    reassembly.total = Some(BasicFrame::HEADER_SIZE + length);
                }

                match reassembly.total {
                    Some(total) if reassembly.raw.len() > total => Progress::Overrun,
                    Some(total) if reassembly.raw.len() == total => Progress::Complete,
                    _ => Progress::Incomplete,
                }
            }
        };

        match progress {
            Progress::Incomplete => None,
            Progress::Overrun => {
                log::warn!(
                    "recombination on {} overran the declared frame length, dropping the frame",
                    handle
                );

                link.recombine = None;

                None
            }
            Progress::Complete => {
                let reassembly = link.recombine.take()?;

                match BasicFrame::try_from_slice(&reassembly.raw) {
                    Ok(frame) => Some(frame),
                    Err(error) => {
                        log::warn!("dropping recombined frame from {}: {}", handle, error);

                        None
                    }
                }
            }
        }
    }

    fn drain(&mut self) -> Vec<TxFragment> {
        let mut transmit = Vec::new();

        while self.in_flight < self.max_in_flight {
            let Some((handle, piece)) = self.tx_queue.pop_front() else {
                break;
            };

            let Some(link) = self.links.get_mut(&handle) else {
                // the link went away after the fragment was queued
                continue;
            };

            link.in_flight += 1;
            self.in_flight += 1;

            transmit.push(TxFragment {
                handle,
                start: piece.is_start_fragment(),
                data: piece.into_data(),
            });
        }

        transmit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    fn handle(raw: u16) -> ConnectionHandle {
        ConnectionHandle::try_from(raw).unwrap()
    }

    fn recombine_all(manager: &mut FlowManager, fragments: Vec<TxFragment>) -> Vec<BasicFrame> {
        fragments
            .into_iter()
            .filter_map(|f| manager.recv_fragment(f.handle, f.start, &f.data))
            .collect()
    }

    #[test]
    fn fragments_clear_only_up_to_the_credit() {
        let mut manager = FlowManager::new(4, 2);

        manager.add_link(handle(0x40));

        // 4 byte header + 10 byte payload fragments into 4 pieces
        let cleared = manager.send_sdu(handle(0x40), ChannelId::AttributeProtocol, vec![0; 10]).unwrap();

        assert_eq!(2, cleared.len());
        assert_eq!(2, manager.get_in_flight());
        assert!(cleared[0].start);
        assert!(!cleared[1].start);

        let cleared = manager.completed_packets(handle(0x40), 1);

        assert_eq!(1, cleared.len());
        assert_eq!(2, manager.get_in_flight());

        let cleared = manager.completed_packets(handle(0x40), 2);

        assert_eq!(1, cleared.len());
        assert_eq!(1, manager.get_in_flight());

        assert!(manager.completed_packets(handle(0x40), 1).is_empty());
        assert_eq!(0, manager.get_in_flight());
    }

    #[test]
    fn queue_is_first_in_first_out_across_links() {
        let mut manager = FlowManager::new(64, 1);

        manager.add_link(handle(0x40));
        manager.add_link(handle(0x41));

        let first = manager.send_sdu(handle(0x40), ChannelId::AttributeProtocol, vec![1]).unwrap();
        let second = manager.send_sdu(handle(0x41), ChannelId::AttributeProtocol, vec![2]).unwrap();

        assert_eq!(1, first.len());
        assert!(second.is_empty());

        let drained = manager.completed_packets(handle(0x40), 1);

        assert_eq!(1, drained.len());
        assert_eq!(handle(0x41), drained[0].handle);
    }

    #[test]
    fn completed_packets_never_underflow() {
        let mut manager = FlowManager::new(64, 3);

        manager.add_link(handle(0x40));

        manager.send_sdu(handle(0x40), ChannelId::AttributeProtocol, vec![0; 8]).unwrap();

        // more completions than packets in flight
        manager.completed_packets(handle(0x40), 100);

        assert_eq!(0, manager.get_in_flight());

        // and the pool is still bounded afterwards
        let cleared = manager
            .send_sdu(handle(0x40), ChannelId::AttributeProtocol, vec![0; 1000])
            .unwrap();

        assert_eq!(3, cleared.len());
        assert_eq!(3, manager.get_in_flight());
    }

    #[test]
    fn removing_a_link_releases_its_credit() {
        let mut manager = FlowManager::new(64, 2);

        manager.add_link(handle(0x40));
        manager.add_link(handle(0x41));

        // link 0x40 occupies the whole pool and has a fragment still queued
        let cleared = manager
            .send_sdu(handle(0x40), ChannelId::AttributeProtocol, vec![0; 150])
            .unwrap();

        assert_eq!(2, cleared.len());

        let queued_for_41 = manager.send_sdu(handle(0x41), ChannelId::AttributeProtocol, vec![7]).unwrap();

        assert!(queued_for_41.is_empty());

        let released = manager.remove_link(handle(0x40));

        // the queued fragment of 0x40 is gone, the one of 0x41 got the freed credit
        assert_eq!(1, released.len());
        assert_eq!(handle(0x41), released[0].handle);
        assert_eq!(1, manager.get_in_flight());
    }

    #[test]
    fn recombination_of_a_split_header() {
        let mut manager = FlowManager::new(64, 8);

        manager.add_link(handle(0x40));

        // header split in the middle, payload in a third fragment
        assert!(manager.recv_fragment(handle(0x40), true, &[0x02, 0x00]).is_none());
        assert!(manager.recv_fragment(handle(0x40), false, &[0x04, 0x00]).is_none());

        let frame = manager.recv_fragment(handle(0x40), false, &[0xAA, 0xBB]).unwrap();

        assert_eq!(ChannelId::AttributeProtocol, frame.get_channel_id());
        assert_eq!(&[0xAA, 0xBB], frame.get_payload());
    }

    #[test]
    fn continuation_without_a_frame_in_progress_is_dropped() {
        let mut manager = FlowManager::new(64, 8);

        manager.add_link(handle(0x40));

        assert!(manager.recv_fragment(handle(0x40), false, &[0x01, 0x02]).is_none());

        // the fault leaves no state behind, a proper frame still recombines
        let frame = manager
            .recv_fragment(handle(0x40), true, &[0x01, 0x00, 0x04, 0x00, 0x55])
            .unwrap();

        assert_eq!(&[0x55], frame.get_payload());
    }

    #[test]
    fn start_fragment_discards_a_frame_in_progress() {
        let mut manager = FlowManager::new(64, 8);

        manager.add_link(handle(0x40));

        assert!(manager
            .recv_fragment(handle(0x40), true, &[0x10, 0x00, 0x04, 0x00, 0x01])
            .is_none());

        let frame = manager
            .recv_fragment(handle(0x40), true, &[0x01, 0x00, 0x06, 0x00, 0x77])
            .unwrap();

        assert_eq!(ChannelId::SecurityManager, frame.get_channel_id());
        assert_eq!(&[0x77], frame.get_payload());
    }

    #[test]
    fn overrunning_the_declared_length_drops_the_frame()  {
        let mut manager = FlowManager::new(64, 8);

        manager.add_link(handle(0x40));

        assert!(manager.recv_fragment(handle(0x40), true, &[0x01, 0x00, 0x04, 0x00]).is_none());
        assert!(manager.recv_fragment(handle(0x40), false, &[0x01, 0x02, 0x03]).is_none());

        // the overrun dropped the buffer, a continuation now has nothing to continue
        assert!(manager.recv_fragment(handle(0x40), false, &[0x04]).is_none());
    }

    #[test]
    fn disconnection_tears_down_the_reassembly_buffer() {
        let mut manager = FlowManager::new(64, 8);

        manager.add_link(handle(0x40));

        assert!(manager.recv_fragment(handle(0x40), true, &[0x02, 0x00, 0x04, 0x00]).is_none());

        manager.remove_link(handle(0x40));
        manager.add_link(handle(0x40));

        // the partial frame did not survive the reconnection
        assert!(manager.recv_fragment(handle(0x40), false, &[0xAA, 0xBB]).is_none());
    }

    #[quickcheck]
    fn fragmentation_recombination_round_trip(payload: Vec<u8>, fragment_size: u8) -> TestResult {
        if fragment_size == 0 {
            return TestResult::discard();
        }

        let mut manager = FlowManager::new(fragment_size as usize, usize::MAX);

        manager.add_link(handle(0x40));

        let fragments = manager
            .send_sdu(handle(0x40), ChannelId::AttributeProtocol, payload.clone())
            .unwrap();

        let frames = recombine_all(&mut manager, fragments);

        TestResult::from_bool(frames.len() == 1 && frames[0].get_payload() == payload.as_slice())
    }

    #[quickcheck]
    fn in_flight_count_is_always_within_the_pool(operations: Vec<(bool, u8)>) -> bool {
        let mut manager = FlowManager::new(5, 4);

        manager.add_link(handle(0x40));

        for (is_send, argument) in operations {
            if is_send {
                manager
                    .send_sdu(handle(0x40), ChannelId::AttributeProtocol, vec![0; argument as usize])
                    .unwrap();
            } else {
                manager.completed_packets(handle(0x40), argument as usize);
            }

            if manager.get_in_flight() > manager.get_max_in_flight() {
                return false;
            }
        }

        // replenishing everything must drain the queue completely
        loop {
            let cleared = manager.completed_packets(handle(0x40), manager.get_max_in_flight());

            if manager.get_in_flight() > manager.get_max_in_flight() {
                return false;
            }

            if cleared.is_empty() {
                break;
            }
        }

        manager.completed_packets(handle(0x40), manager.get_max_in_flight());

        if manager.get_in_flight() != 0 {
            return false;
        }

        // with the queue drained a fresh unit clears for transmission immediately
        let cleared = manager
            .send_sdu(handle(0x40), ChannelId::AttributeProtocol, Vec::new())
            .unwrap();

        cleared.len() == 1 && manager.get_in_flight() == 1
    }
}
