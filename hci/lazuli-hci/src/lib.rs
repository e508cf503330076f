//! The Host side of the Host Controller Interface
//!
//! This crate turns the raw packet stream of a Bluetooth controller into commands with awaitable
//! responses and broadcast events. A [`Host`] is created together with the receiver half of its
//! interface channel; the interface driver forwards everything received on that channel to the
//! controller verbatim and calls [`feed`](Host::feed) with every chunk of bytes read back, no
//! matter how the chunks are split.
//!
//! ## Command flow
//! [`send_command`](Host::send_command) registers a pending entry for the command and suspends
//! the caller until the controller answers with a *Command Complete* or *Command Status* event
//! for the command's opcode. Controllers process commands strictly in order, so when the same
//! opcode is outstanding more than once the oldest entry wins. Commands addressing a specific
//! connection (or advertising set) can also provide a [`ResponseKey`], in which case the handle
//! field inside the return parameter must match too. This keeps two concurrent commands with
//! the same opcode but different handles from stealing each other's completion.
//!
//! ## Events
//! Events that are not command responses are broadcast to the subscribers of their event kind,
//! see [`subscribe`](Host::subscribe). An event nobody subscribed to is logged and dropped; it
//! never resolves a command.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod acl;
pub mod commands;
pub mod events;
pub mod opcodes;
pub mod packet;

use crate::acl::HciAclData;
use crate::events::parameters::{CommandCompleteData, CommandStatusData};
use crate::events::{Events, EventsData};
use crate::opcodes::HciCommand;
use crate::packet::{Packet, PacketKind, Recombiner};
use core::fmt;
use lazuli_core::errors::Error;
use lazuli_core::ConnectionHandle;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Configuration of a [`Host`]
#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    /// How long to wait for the controller to answer a command
    pub command_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            command_timeout: Duration::from_secs(2),
        }
    }
}

/// Error from sending a command to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// The controller did not answer within the command timeout
    Timeout,
    /// The controller answered with an error status
    Controller(Error),
    /// The interface channel to the controller is closed
    InterfaceClosed,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandError::Timeout => f.write_str("the controller did not respond to the command"),
            CommandError::Controller(error) => write!(f, "controller error: {}", error),
            CommandError::InterfaceClosed => f.write_str("the interface to the controller is closed"),
        }
    }
}

impl std::error::Error for CommandError {}

/// A key for matching a command response by the handle within its return parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKey {
    /// Match the connection handle field
    Connection(ConnectionHandle),
    /// Match the advertising handle field
    Advertising(u8),
}

struct PendingCommand {
    id: u64,
    opcode: u16,
    key: Option<ResponseKey>,
    response: oneshot::Sender<Result<Vec<u8>, CommandError>>,
}

struct HostInner {
    recombiner: Recombiner,
    pending: VecDeque<PendingCommand>,
    subscribers: HashMap<Events, Vec<mpsc::UnboundedSender<EventsData>>>,
    acl_router: Option<mpsc::UnboundedSender<HciAclData>>,
    next_pending_id: u64,
}

/// The host side of the interface to a controller
///
/// A `Host` is cheap to clone; clones share the pending command table, the subscriber table, and
/// the interface channel.
#[derive(Clone)]
pub struct Host {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    inner: Arc<Mutex<HostInner>>,
    command_timeout: Duration,
}

impl Host {
    /// Create a new `Host`
    ///
    /// The returned receiver is the interface channel. The interface driver must write every
    /// received `Vec<u8>` to the controller in the order received.
    pub fn new(config: HostConfig) -> (Host, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (writer, interface_receiver) = mpsc::unbounded_channel();

        let inner = HostInner {
            recombiner: Recombiner::new(),
            pending: VecDeque::new(),
            subscribers: HashMap::new(),
            acl_router: None,
            next_pending_id: 0,
        };

        let host = Host {
            writer,
            inner: Arc::new(Mutex::new(inner)),
            command_timeout: config.command_timeout,
        };

        (host, interface_receiver)
    }

    fn lock_inner(&self) -> MutexGuard<'_, HostInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Feed bytes received from the controller
    ///
    /// Chunk boundaries may fall anywhere. Every packet completed by this chunk is processed
    /// before `feed` returns.
    pub fn feed(&self, chunk: &[u8]) {
        let mut inner = self.lock_inner();

        let mut next = inner.recombiner.feed(chunk);

        while let Some(packet) = next {
            Self::process_packet(&mut inner, packet);

            next = inner.recombiner.feed(&[]);
        }
    }

    /// Send a command and await its response
    ///
    /// The returned bytes are the raw return parameter of the command, beginning with the status
    /// byte that was already checked for success. Commands answered with a *Command Status*
    /// event resolve with an empty return parameter.
    pub async fn send_command(&self, command: HciCommand, parameter: Vec<u8>) -> Result<Vec<u8>, CommandError> {
        self.send_command_internal(command, parameter, None).await
    }

    /// Send a command whose response is matched by a handle
    ///
    /// This is required when the same opcode may be outstanding for multiple connections (or
    /// advertising sets) at once. The handle field within the return parameter must equal `key`
    /// for a completion to resolve this command.
    pub async fn send_command_for(
        &self,
        command: HciCommand,
        parameter: Vec<u8>,
        key: ResponseKey,
    ) -> Result<Vec<u8>, CommandError> {
        self.send_command_internal(command, parameter, Some(key)).await
    }

    /// Send a command that has no response
    pub fn send_command_no_response(&self, command: HciCommand, parameter: Vec<u8>) -> Result<(), CommandError> {
        self.writer
            .send(Self::command_packet(command, &parameter))
            .map_err(|_| CommandError::InterfaceClosed)
    }

    /// Send an ACL data packet to the controller
    pub fn send_acl(&self, data: &HciAclData) -> Result<(), CommandError> {
        let mut wire = Vec::with_capacity(1 + acl::HciAclData::HEADER_SIZE + data.get_payload().len());

        wire.push(PacketKind::Acl.indicator());
        wire.extend_from_slice(&data.to_packet());

        self.writer.send(wire).map_err(|_| CommandError::InterfaceClosed)
    }

    /// Subscribe to an event
    ///
    /// Every decoded event of the kind `event` that is not a command response is sent to the
    /// returned receiver. Dropping the receiver unsubscribes.
    pub fn subscribe(&self, event: Events) -> mpsc::UnboundedReceiver<EventsData> {
        let (sender, receiver) = mpsc::unbounded_channel();

        self.lock_inner().subscribers.entry(event).or_default().push(sender);

        receiver
    }

    /// Set the router for inbound ACL data packets
    ///
    /// Inbound ACL data received while no router is set is dropped.
    pub fn set_acl_router(&self, router: mpsc::UnboundedSender<HciAclData>) {
        self.lock_inner().acl_router = Some(router);
    }

    fn command_packet(command: HciCommand, parameter: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(4 + parameter.len());

        packet.push(PacketKind::Command.indicator());
        packet.extend_from_slice(&command.into_opcode().to_le_bytes());
        packet.push(parameter.len() as u8);
        packet.extend_from_slice(parameter);

        packet
    }

    async fn send_command_internal(
        &self,
        command: HciCommand,
        parameter: Vec<u8>,
        key: Option<ResponseKey>,
    ) -> Result<Vec<u8>, CommandError> {
        let opcode = command.into_opcode();

        let (response_sender, response_receiver) = oneshot::channel();

        let id = {
            let mut inner = self.lock_inner();

            let id = inner.next_pending_id;

            inner.next_pending_id += 1;

            inner.pending.push_back(PendingCommand {
                id,
                opcode,
                key,
                response: response_sender,
            });

            id
        };

        if self.writer.send(Self::command_packet(command, &parameter)).is_err() {
            self.lock_inner().pending.retain(|pending| pending.id != id);

            return Err(CommandError::InterfaceClosed);
        }

        log::trace!("sent command {}", command);

        match tokio::time::timeout(self.command_timeout, response_receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommandError::InterfaceClosed),
            Err(_) => {
                self.lock_inner().pending.retain(|pending| pending.id != id);

                log::warn!("command {} timed out", command);

                Err(CommandError::Timeout)
            }
        }
    }

    fn process_packet(inner: &mut HostInner, packet: Packet) {
        match packet.get_kind() {
            PacketKind::Event => match EventsData::try_from_packet(packet.get_bytes()) {
                Ok(EventsData::CommandComplete(data)) => Self::resolve_command_complete(inner, data),
                Ok(EventsData::CommandStatus(data)) => Self::resolve_command_status(inner, data),
                Ok(data) => Self::broadcast_event(inner, data),
                Err(error) => log::error!("invalid event packet: {}", error),
            },
            PacketKind::Acl => match HciAclData::try_from_packet(packet.get_bytes()) {
                Ok(data) => Self::route_acl_data(inner, data),
                Err(error) => log::error!("invalid ACL data packet: {}", error),
            },
            kind => log::error!("dropping unexpected {} packet from the controller", kind),
        }
    }

    fn response_key_matches(key: Option<&ResponseKey>, return_parameter: &[u8]) -> bool {
        match key {
            None => true,
            Some(ResponseKey::Connection(handle)) => return_parameter
                .get(1..3)
                .map(|bytes| <u16>::from_le_bytes([bytes[0], bytes[1]]) & 0xFFF == handle.get_raw_handle())
                .unwrap_or(false),
            Some(ResponseKey::Advertising(handle)) => {
                return_parameter.get(1).map(|byte| byte == handle).unwrap_or(false)
            }
        }
    }

    fn resolve_command_complete(inner: &mut HostInner, data: CommandCompleteData) {
        let opcode = match data.command_opcode {
            Some(opcode) => opcode,
            // only an update of the number of command packets the controller accepts
            None => return,
        };

        let position = inner
            .pending
            .iter()
            .position(|pending| pending.opcode == opcode && Self::response_key_matches(pending.key.as_ref(), &data.return_parameter));

        let Some(pending) = position.and_then(|index| inner.pending.remove(index)) else {
            log::warn!(
                "dropping command complete event for opcode {:#06x}, no command is awaiting it",
                opcode
            );

            return;
        };

        let status = data
            .return_parameter
            .first()
            .map(|byte| Error::from(*byte))
            .unwrap_or(Error::MissingErrorCode);

        let result = status
            .ok_or_else(CommandError::Controller)
            .map(|_| data.return_parameter);

        // the sender fails when the command timed out in the meantime, the timeout
        // is the resolution of the command in that case
        let _ = pending.response.send(result);
    }

    fn resolve_command_status(inner: &mut HostInner, data: CommandStatusData) {
        let opcode = match data.command_opcode {
            Some(opcode) => opcode,
            None => return,
        };

        let position = inner.pending.iter().position(|pending| pending.opcode == opcode);

        let Some(pending) = position.and_then(|index| inner.pending.remove(index)) else {
            log::warn!(
                "dropping command status event for opcode {:#06x}, no command is awaiting it",
                opcode
            );

            return;
        };

        let result = data.status.ok_or_else(CommandError::Controller).map(|_| Vec::new());

        let _ = pending.response.send(result);
    }

    fn broadcast_event(inner: &mut HostInner, data: EventsData) {
        let event = data.get_event();

        match inner.subscribers.get_mut(&event) {
            Some(senders) if !senders.is_empty() => {
                senders.retain(|sender| sender.send(data.clone()).is_ok());

                if senders.is_empty() {
                    log::trace!("all subscribers of {:?} events are gone", event);
                }
            }
            _ => log::trace!("dropping {:?} event, nothing is subscribed to it", event),
        }
    }

    fn route_acl_data(inner: &mut HostInner, data: HciAclData) {
        match inner.acl_router.as_ref() {
            Some(router) => {
                if router.send(data).is_err() {
                    log::warn!("dropping ACL data, the ACL router is gone");

                    inner.acl_router = None;
                }
            }
            None => log::warn!("dropping ACL data, no ACL router is set"),
        }
    }
}
