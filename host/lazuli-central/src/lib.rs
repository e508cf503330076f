//! The central role
//!
//! A [`Central`] owns everything the central role of a host needs: the scan state, connection
//! establishment, per link flow control, and the attribute bearers of the established links.
//! It is constructed with [`Central::setup`], which probes the controller once for its
//! supported commands and buffer sizes, and from then on drives everything through a single
//! engine task.
//!
//! ## Command families
//! Controllers expose two mutually exclusive command families for scanning and connecting, the
//! legacy family and the extended family. The family is chosen once during setup from the
//! controller's supported commands and used for the lifetime of the `Central`; the two are
//! never mixed.
//!
//! ## Events
//! The `Central` reports everything that happens through the [`CentralEvent`] receiver
//! returned by `setup`: discovered advertisers, the scan state, established and failed
//! connections, and disconnections. A connection is reported only after the remote version and
//! feature queries finished, so a [`ConnectedPeer`] is always fully populated; a peer store
//! can answer those queries from cache to skip the round trips.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod store;

pub use lazuli_hci::commands::{ConnectionParameters, PeerAddress, ScanParameters};
pub use store::{LeFeatures, MemoryStore, NoStore, PeerStore, RemoteInfo, RemoteVersion};

use core::fmt;
use lazuli_att::{Bearer, BearerConfig};
use lazuli_core::errors::Error as ControllerError;
use lazuli_core::{BluetoothDeviceAddress, ConnectionHandle};
use lazuli_gatt as gatt;
use lazuli_hci::acl::{AclBroadcastFlag, AclPacketBoundary, HciAclData};
use lazuli_hci::commands;
use lazuli_hci::events::parameters::LeAddressType;
use lazuli_hci::events::{Events, EventsData, LeMeta, LeMetaData};
use lazuli_hci::{CommandError, Host};
use lazuli_l2cap::{ChannelId, FlowManager, OutboundSdu, TxFragment};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Configuration of a [`Central`]
#[derive(Debug, Clone, Copy)]
pub struct CentralConfig {
    /// How long to wait for a remote version or feature event after its command
    pub remote_query_timeout: Duration,
    /// Whether the controller should filter duplicate advertising reports
    pub filter_duplicates: bool,
    /// Configuration for the attribute bearer of every link
    pub bearer: BearerConfig,
}

impl Default for CentralConfig {
    fn default() -> Self {
        CentralConfig {
            remote_query_timeout: Duration::from_secs(2),
            filter_duplicates: true,
            bearer: BearerConfig::default(),
        }
    }
}

/// The scan and connect command family of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    Legacy,
    Extended,
}

impl fmt::Display for CommandFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandFamily::Legacy => f.write_str("legacy"),
            CommandFamily::Extended => f.write_str("extended"),
        }
    }
}

/// A discovered advertiser
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisingReport {
    pub address: BluetoothDeviceAddress,
    pub address_type: LeAddressType,
    pub connectable: bool,
    /// `None` when the controller reported no RSSI for this report
    pub rssi: Option<i8>,
    /// The raw advertising data bytes
    pub data: Vec<u8>,
}

/// An established connection with its remote information
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectedPeer {
    pub handle: ConnectionHandle,
    pub address: BluetoothDeviceAddress,
    pub address_type: LeAddressType,
    pub version: RemoteVersion,
    pub features: LeFeatures,
}

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectFailureReason {
    /// The controller completed the connection with an error status
    Status(ControllerError),
    /// The connection was established but querying the remote information failed
    RemoteInfo(CommandError),
}

impl fmt::Display for ConnectFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectFailureReason::Status(error) => write!(f, "connection failed: {}", error),
            ConnectFailureReason::RemoteInfo(error) => {
                write!(f, "querying the remote information failed: {}", error)
            }
        }
    }
}

/// The events of a [`Central`]
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    /// Scanning started or stopped; emitted only on actual transitions
    ScanStateChanged(bool),
    Discovered(AdvertisingReport),
    Connected(ConnectedPeer),
    ConnectFailed {
        peer: BluetoothDeviceAddress,
        reason: ConnectFailureReason,
    },
    /// A pending connection was cancelled by its timeout
    ConnectionCancelled,
    Disconnected {
        handle: ConnectionHandle,
        reason: ControllerError,
    },
}

/// Error from [`Central::setup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupError {
    Command(CommandError),
    InvalidReturnParameter(commands::ReturnParameterError),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SetupError::Command(error) => fmt::Display::fmt(error, f),
            SetupError::InvalidReturnParameter(error) => fmt::Display::fmt(error, f),
        }
    }
}

impl std::error::Error for SetupError {}

impl From<CommandError> for SetupError {
    fn from(error: CommandError) -> Self {
        SetupError::Command(error)
    }
}

impl From<commands::ReturnParameterError> for SetupError {
    fn from(error: commands::ReturnParameterError) -> Self {
        SetupError::InvalidReturnParameter(error)
    }
}

/// Error from [`Central::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// A connection attempt is already pending, only one may exist at a time
    AlreadyConnecting,
    Command(CommandError),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectError::AlreadyConnecting => f.write_str("a connection attempt is already pending"),
            ConnectError::Command(error) => fmt::Display::fmt(error, f),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<CommandError> for ConnectError {
    fn from(error: CommandError) -> Self {
        ConnectError::Command(error)
    }
}

struct PendingConnection {
    peer: BluetoothDeviceAddress,
    cancel_timer: Option<JoinHandle<()>>,
}

struct LinkEntry {
    bearer: Bearer,
    peer: BluetoothDeviceAddress,
    security_manager: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

struct CentralShared {
    scanning: bool,
    pending_connection: Option<PendingConnection>,
    links: HashMap<ConnectionHandle, LinkEntry>,
    flow: FlowManager,
    store: Box<dyn PeerStore>,
}

/// The central role of a host
pub struct Central {
    host: Host,
    shared: Arc<Mutex<CentralShared>>,
    events: mpsc::UnboundedSender<CentralEvent>,
    sdu_sender: mpsc::UnboundedSender<OutboundSdu>,
    family: CommandFamily,
    config: CentralConfig,
}

impl Central {
    /// Set up the central role on a controller
    ///
    /// The supported commands of the controller are probed to commit to a scan and connect
    /// command family, the data buffer information is read to size the flow control, and the
    /// engine task is spawned. `store` answers and records the per peer remote information and
    /// discovery caches.
    pub async fn setup(
        host: Host,
        store: Box<dyn PeerStore>,
        config: CentralConfig,
    ) -> Result<(Central, mpsc::UnboundedReceiver<CentralEvent>), SetupError> {
        let (command, parameter) = commands::read_local_supported_commands();

        let return_parameter = host.send_command(command, parameter).await?;

        let supported = commands::SupportedCommands::try_from_return(&return_parameter)?;

        let family = if supported.supports_extended_scan_and_connect() {
            CommandFamily::Extended
        } else {
            CommandFamily::Legacy
        };

        let (command, parameter) = commands::le_read_buffer_size();

        let return_parameter = host.send_command(command, parameter).await?;

        let le_buffer = commands::LeBufferSize::try_from_return(&return_parameter)?;

        let (fragment_limit, buffer_count) = if le_buffer.is_unavailable() {
            // no dedicated LE buffer pool, the shared pool is used for LE data
            let (command, parameter) = commands::read_buffer_size();

            let return_parameter = host.send_command(command, parameter).await?;

            let shared_buffer = commands::BufferSize::try_from_return(&return_parameter)?;

            (
                shared_buffer.acl_data_packet_length as usize,
                shared_buffer.total_num_acl_data_packets as usize,
            )
        } else {
            (
                le_buffer.le_acl_data_packet_length as usize,
                le_buffer.total_num_le_acl_data_packets as usize,
            )
        };

        log::info!(
            "central using the {} command family, {} data buffers of {} bytes",
            family,
            buffer_count,
            fragment_limit
        );

        let (events_sender, events_receiver) = mpsc::unbounded_channel();
        let (sdu_sender, sdu_receiver) = mpsc::unbounded_channel();
        let (acl_sender, acl_receiver) = mpsc::unbounded_channel();

        host.set_acl_router(acl_sender);

        let subscriptions = EngineSubscriptions {
            connection_complete: host.subscribe(Events::LeMeta(LeMeta::ConnectionComplete)),
            enhanced_connection_complete: host.subscribe(Events::LeMeta(LeMeta::EnhancedConnectionComplete)),
            disconnection_complete: host.subscribe(Events::DisconnectionComplete),
            completed_packets: host.subscribe(Events::NumberOfCompletedPackets),
            advertising_reports: host.subscribe(Events::LeMeta(LeMeta::AdvertisingReport)),
            extended_advertising_reports: host.subscribe(Events::LeMeta(LeMeta::ExtendedAdvertisingReport)),
        };

        let shared = Arc::new(Mutex::new(CentralShared {
            scanning: false,
            pending_connection: None,
            links: HashMap::new(),
            flow: FlowManager::new(fragment_limit, buffer_count),
            store,
        }));

        let central = Central {
            host,
            shared,
            events: events_sender,
            sdu_sender,
            family,
            config,
        };

        tokio::spawn(central.engine().run(acl_receiver, sdu_receiver, subscriptions));

        Ok((central, events_receiver))
    }

    fn lock_shared(&self) -> MutexGuard<'_, CentralShared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn engine(&self) -> Engine {
        Engine {
            host: self.host.clone(),
            shared: self.shared.clone(),
            events: self.events.clone(),
            sdu_sender: self.sdu_sender.clone(),
            remote_query_timeout: self.config.remote_query_timeout,
            bearer_config: self.config.bearer,
        }
    }

    fn emit(&self, event: CentralEvent) {
        if self.events.send(event).is_err() {
            log::trace!("the central event receiver is gone");
        }
    }

    /// The command family committed to during setup
    pub fn get_command_family(&self) -> CommandFamily {
        self.family
    }

    pub fn is_scanning(&self) -> bool {
        self.lock_shared().scanning
    }

    /// Start scanning
    ///
    /// Starting while already scanning does nothing. [`CentralEvent::ScanStateChanged`] is
    /// emitted only when scanning actually starts.
    pub async fn start_scanning(&self, parameters: ScanParameters) -> Result<(), CommandError> {
        {
            let mut shared = self.lock_shared();

            if shared.scanning {
                return Ok(());
            }

            // claim the transition before suspending on the commands
            shared.scanning = true;
        }

        let result = match self.family {
            CommandFamily::Legacy => {
                let (command, parameter) = commands::le_set_scan_parameters(&parameters);

                match self.host.send_command(command, parameter).await {
                    Ok(_) => {
                        let (command, parameter) =
                            commands::le_set_scan_enable(true, self.config.filter_duplicates);

                        self.host.send_command(command, parameter).await.map(|_| ())
                    }
                    Err(error) => Err(error),
                }
            }
            CommandFamily::Extended => {
                let (command, parameter) = commands::le_set_extended_scan_parameters(&parameters);

                match self.host.send_command(command, parameter).await {
                    Ok(_) => {
                        let (command, parameter) =
                            commands::le_set_extended_scan_enable(true, self.config.filter_duplicates);

                        self.host.send_command(command, parameter).await.map(|_| ())
                    }
                    Err(error) => Err(error),
                }
            }
        };

        match result {
            Ok(()) => {
                log::info!("scanning started");

                self.emit(CentralEvent::ScanStateChanged(true));

                Ok(())
            }
            Err(error) => {
                self.lock_shared().scanning = false;

                Err(error)
            }
        }
    }

    /// Stop scanning
    ///
    /// Stopping while not scanning does nothing.
    pub async fn stop_scanning(&self) -> Result<(), CommandError> {
        {
            let mut shared = self.lock_shared();

            if !shared.scanning {
                return Ok(());
            }

            shared.scanning = false;
        }

        let (command, parameter) = match self.family {
            CommandFamily::Legacy => commands::le_set_scan_enable(false, self.config.filter_duplicates),
            CommandFamily::Extended => {
                commands::le_set_extended_scan_enable(false, self.config.filter_duplicates)
            }
        };

        match self.host.send_command(command, parameter).await {
            Ok(_) => {
                log::info!("scanning stopped");

                self.emit(CentralEvent::ScanStateChanged(false));

                Ok(())
            }
            Err(error) => {
                self.lock_shared().scanning = true;

                Err(error)
            }
        }
    }

    /// Connect to a peer
    ///
    /// At most one connection may be pending at a time; a second attempt fails immediately
    /// with [`ConnectError::AlreadyConnecting`]. The outcome of the attempt arrives on the
    /// event receiver as one of `Connected`, `ConnectFailed`, or `ConnectionCancelled`.
    ///
    /// When `timeout` is given, a timer cancels the attempt once it elapses. The cancellation
    /// races the connection completion within the controller; whichever wins, exactly one
    /// outcome event is emitted.
    pub async fn connect(
        &self,
        peer: PeerAddress,
        parameters: ConnectionParameters,
        timeout: Option<Duration>,
    ) -> Result<(), ConnectError> {
        {
            let mut shared = self.lock_shared();

            if shared.pending_connection.is_some() {
                return Err(ConnectError::AlreadyConnecting);
            }

            shared.pending_connection = Some(PendingConnection {
                peer: peer.address,
                cancel_timer: None,
            });
        }

        let (command, parameter) = match self.family {
            CommandFamily::Legacy => commands::le_create_connection(peer, &parameters),
            CommandFamily::Extended => commands::le_extended_create_connection(peer, &parameters),
        };

        if let Err(error) = self.host.send_command(command, parameter).await {
            self.lock_shared().pending_connection = None;

            return Err(error.into());
        }

        log::info!("connecting to {}", peer.address);

        if let Some(duration) = timeout {
            let host = self.host.clone();

            let timer = tokio::spawn(async move {
                tokio::time::sleep(duration).await;

                log::debug!("connection establishment timed out, cancelling");

                let (command, parameter) = commands::le_create_connection_cancel();

                match host.send_command(command, parameter).await {
                    Ok(_) => {}
                    Err(CommandError::Controller(ControllerError::CommandDisallowed)) => {
                        // the connection completed while the cancel was in flight
                        log::debug!("connection cancel lost the race to the completion");
                    }
                    Err(error) => log::warn!("connection cancel failed: {}", error),
                }
            });

            let mut shared = self.lock_shared();

            match shared.pending_connection.as_mut() {
                Some(pending) => pending.cancel_timer = Some(timer),
                // the completion already arrived while the command response was processed
                None => timer.abort(),
            }
        }

        Ok(())
    }

    /// Disconnect a link
    ///
    /// The link's bookkeeping is dropped and [`CentralEvent::Disconnected`] emitted once the
    /// controller reports the disconnection complete.
    pub async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), CommandError> {
        let (command, parameter) =
            commands::disconnect(handle, ControllerError::RemoteUserTerminatedConnection);

        self.host.send_command(command, parameter).await.map(|_| ())
    }

    /// Get the attribute bearer of a link
    pub fn get_bearer(&self, handle: ConnectionHandle) -> Option<Bearer> {
        self.lock_shared().links.get(&handle).map(|link| link.bearer.clone())
    }

    /// Get a GATT client for a link
    ///
    /// When the peer store holds a directory for the peer it seeds the client, so discovery
    /// is served from the cache.
    pub fn gatt_client(&self, handle: ConnectionHandle) -> Option<gatt::Client> {
        let shared = self.lock_shared();

        let link = shared.links.get(&handle)?;

        let bearer = link.bearer.clone();

        Some(match shared.store.directory(link.peer) {
            Some(directory) => gatt::Client::with_directory(bearer, directory),
            None => gatt::Client::new(bearer),
        })
    }

    /// Record a link's discovered directory in the peer store
    ///
    /// Returns false when the link does not exist.
    pub fn save_directory(&self, handle: ConnectionHandle, directory: gatt::Directory) -> bool {
        let mut shared = self.lock_shared();

        let peer = shared.links.get(&handle).map(|link| link.peer);

        match peer {
            Some(peer) => {
                shared.store.set_directory(peer, directory);

                true
            }
            None => false,
        }
    }

    /// Subscribe to the security manager channel of a link
    ///
    /// Inbound frames on the security manager channel are forwarded to the returned receiver.
    /// Without a subscriber they are dropped.
    pub fn security_manager_channel(&self, handle: ConnectionHandle) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        let mut shared = self.lock_shared();

        let link = shared.links.get_mut(&handle)?;

        let (sender, receiver) = mpsc::unbounded_channel();

        link.security_manager = Some(sender);

        Some(receiver)
    }
}

struct EngineSubscriptions {
    connection_complete: mpsc::UnboundedReceiver<EventsData>,
    enhanced_connection_complete: mpsc::UnboundedReceiver<EventsData>,
    disconnection_complete: mpsc::UnboundedReceiver<EventsData>,
    completed_packets: mpsc::UnboundedReceiver<EventsData>,
    advertising_reports: mpsc::UnboundedReceiver<EventsData>,
    extended_advertising_reports: mpsc::UnboundedReceiver<EventsData>,
}

/// The common fields of the legacy and enhanced connection completions
struct ConnectionCompletion {
    status: ControllerError,
    handle: ConnectionHandle,
    address_type: LeAddressType,
    address: BluetoothDeviceAddress,
}

/// The single dispatch point of a [`Central`]
struct Engine {
    host: Host,
    shared: Arc<Mutex<CentralShared>>,
    events: mpsc::UnboundedSender<CentralEvent>,
    sdu_sender: mpsc::UnboundedSender<OutboundSdu>,
    remote_query_timeout: Duration,
    bearer_config: BearerConfig,
}

impl Engine {
    async fn run(
        self,
        mut acl_receiver: mpsc::UnboundedReceiver<HciAclData>,
        mut sdu_receiver: mpsc::UnboundedReceiver<OutboundSdu>,
        mut subscriptions: EngineSubscriptions,
    ) {
        loop {
            tokio::select! {
                Some(data) = acl_receiver.recv() => self.process_inbound_acl(data),
                Some(sdu) = sdu_receiver.recv() => self.process_outbound_sdu(sdu),
                Some(event) = subscriptions.connection_complete.recv() => self.process_connection_event(event),
                Some(event) = subscriptions.enhanced_connection_complete.recv() => self.process_connection_event(event),
                Some(event) = subscriptions.disconnection_complete.recv() => self.process_disconnection(event),
                Some(event) = subscriptions.completed_packets.recv() => self.process_completed_packets(event),
                Some(event) = subscriptions.advertising_reports.recv() => self.process_advertising_reports(event),
                Some(event) = subscriptions.extended_advertising_reports.recv() => self.process_advertising_reports(event),
                else => break,
            }
        }

        log::debug!("the central engine task is exiting");
    }

    fn lock_shared(&self) -> MutexGuard<'_, CentralShared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: CentralEvent) {
        if self.events.send(event).is_err() {
            log::trace!("the central event receiver is gone");
        }
    }

    fn transmit(&self, fragments: Vec<TxFragment>) {
        for fragment in fragments {
            let boundary = if fragment.start {
                AclPacketBoundary::FirstNonFlushable
            } else {
                AclPacketBoundary::ContinuingFragment
            };

            let data = HciAclData::new(fragment.handle, boundary, AclBroadcastFlag::NoBroadcast, fragment.data);

            if self.host.send_acl(&data).is_err() {
                log::warn!("the interface is closed, dropping outbound fragments");

                return;
            }
        }
    }

    fn process_inbound_acl(&self, data: HciAclData) {
        let handle = data.get_handle();
        let start = data.get_packet_boundary_flag().is_start();

        let mut shared = self.lock_shared();

        let Some(frame) = shared.flow.recv_fragment(handle, start, data.get_payload()) else {
            return;
        };

        match frame.get_channel_id() {
            ChannelId::AttributeProtocol => {
                let bearer = shared.links.get(&handle).map(|link| link.bearer.clone());

                drop(shared);

                match bearer {
                    Some(bearer) => bearer.process_pdu(frame.get_payload()),
                    None => log::warn!("dropping attribute PDU for unknown link {}", handle),
                }
            }
            ChannelId::SecurityManager => {
                let Some(link) = shared.links.get_mut(&handle) else {
                    log::warn!("dropping security manager PDU for unknown link {}", handle);

                    return;
                };

                match link.security_manager.as_ref() {
                    Some(sender) => {
                        if sender.send(frame.into_payload()).is_err() {
                            log::warn!("the security manager subscriber of {} is gone", handle);

                            link.security_manager = None;
                        }
                    }
                    None => {
                        log::warn!("dropping security manager PDU on {}, nothing is subscribed", handle)
                    }
                }
            }
            channel => log::warn!("dropping inbound frame on {} for the unhandled {}", handle, channel),
        }
    }

    fn process_outbound_sdu(&self, sdu: OutboundSdu) {
        let cleared = {
            let mut shared = self.lock_shared();

            match shared.flow.send_sdu(sdu.handle, sdu.channel_id, sdu.payload) {
                Ok(cleared) => cleared,
                Err(error) => {
                    log::warn!("dropping an outbound service data unit: {}", error);

                    return;
                }
            }
        };

        self.transmit(cleared);
    }

    fn process_completed_packets(&self, event: EventsData) {
        let entries = match event {
            EventsData::NumberOfCompletedPackets(entries) => entries,
            other => {
                log::error!("the engine received an unexpected event: {:?}", other.get_event());

                return;
            }
        };

        let cleared = {
            let mut shared = self.lock_shared();

            entries
                .into_iter()
                .flat_map(|entry| {
                    shared
                        .flow
                        .completed_packets(entry.connection_handle, entry.completed_packets as usize)
                })
                .collect()
        };

        self.transmit(cleared);
    }

    fn process_advertising_reports(&self, event: EventsData) {
        match event {
            EventsData::LeMeta(LeMetaData::AdvertisingReport(reports)) => {
                for report in reports {
                    // ADV_IND and ADV_DIRECT_IND are the connectable advertising types
                    let connectable = matches!(report.event_type, 0x00 | 0x01);

                    self.emit(CentralEvent::Discovered(AdvertisingReport {
                        address: report.address,
                        address_type: report.address_type,
                        connectable,
                        rssi: (report.rssi != 127).then_some(report.rssi),
                        data: report.data,
                    }));
                }
            }
            EventsData::LeMeta(LeMetaData::ExtendedAdvertisingReport(reports)) => {
                for report in reports {
                    let connectable = report.event_type & 0x0001 != 0;

                    self.emit(CentralEvent::Discovered(AdvertisingReport {
                        address: report.address,
                        address_type: report.address_type,
                        connectable,
                        rssi: (report.rssi != 127).then_some(report.rssi),
                        data: report.data,
                    }));
                }
            }
            other => log::error!("the engine received an unexpected event: {:?}", other.get_event()),
        }
    }

    fn process_connection_event(&self, event: EventsData) {
        let completion = match event {
            EventsData::LeMeta(LeMetaData::ConnectionComplete(data)) => ConnectionCompletion {
                status: data.status,
                handle: data.connection_handle,
                address_type: data.peer_address_type,
                address: data.peer_address,
            },
            EventsData::LeMeta(LeMetaData::EnhancedConnectionComplete(data)) => ConnectionCompletion {
                status: data.status,
                handle: data.connection_handle,
                address_type: data.peer_address_type,
                address: data.peer_address,
            },
            other => {
                log::error!("the engine received an unexpected event: {:?}", other.get_event());

                return;
            }
        };

        if completion.status == ControllerError::UnknownConnectionIdentifier {
            // this is the completion of our own connection cancel
            match self.lock_shared().pending_connection.take() {
                Some(pending) => {
                    if let Some(timer) = pending.cancel_timer {
                        timer.abort();
                    }

                    log::info!("the connection attempt to {} was cancelled", pending.peer);

                    self.emit(CentralEvent::ConnectionCancelled);
                }
                None => log::warn!("connection cancellation completed without a pending connection"),
            }

            return;
        }

        if completion.status != ControllerError::NoError {
            match self.lock_shared().pending_connection.take() {
                Some(pending) => {
                    if let Some(timer) = pending.cancel_timer {
                        timer.abort();
                    }

                    log::warn!("connecting to {} failed: {}", pending.peer, completion.status);

                    self.emit(CentralEvent::ConnectFailed {
                        peer: pending.peer,
                        reason: ConnectFailureReason::Status(completion.status),
                    });
                }
                None => log::warn!(
                    "a connection completed with {} without a pending connection",
                    completion.status
                ),
            }

            return;
        }

        let cached = {
            let mut shared = self.lock_shared();

            match shared.pending_connection.take() {
                Some(pending) => {
                    if let Some(timer) = pending.cancel_timer {
                        timer.abort();
                    }
                }
                None => log::warn!("a connection completed without a pending connection"),
            }

            shared.flow.add_link(completion.handle);

            let bearer = Bearer::new(completion.handle, self.sdu_sender.clone(), self.bearer_config);

            shared.links.insert(
                completion.handle,
                LinkEntry {
                    bearer,
                    peer: completion.address,
                    security_manager: None,
                },
            );

            shared.store.remote_info(completion.address)
        };

        log::info!("connected to {} on {}", completion.address, completion.handle);

        let finalizer = ConnectionFinalizer {
            host: self.host.clone(),
            shared: self.shared.clone(),
            events: self.events.clone(),
            query_timeout: self.remote_query_timeout,
        };

        tokio::spawn(finalizer.finalize(completion, cached));
    }

    fn process_disconnection(&self, event: EventsData) {
        let data = match event {
            EventsData::DisconnectionComplete(data) => data,
            other => {
                log::error!("the engine received an unexpected event: {:?}", other.get_event());

                return;
            }
        };

        let (known, released) = {
            let mut shared = self.lock_shared();

            let known = shared.links.remove(&data.connection_handle).is_some();

            let released = shared.flow.remove_link(data.connection_handle);

            (known, released)
        };

        self.transmit(released);

        if known {
            log::info!("disconnected from {}: {}", data.connection_handle, data.reason);

            self.emit(CentralEvent::Disconnected {
                handle: data.connection_handle,
                reason: data.reason,
            });
        } else {
            log::warn!(
                "disconnection complete for the unknown connection handle {}",
                data.connection_handle
            );
        }
    }
}

/// Completes a connection by gathering the remote information
///
/// This runs in its own task so that the engine keeps processing events while the version and
/// feature queries are in flight.
struct ConnectionFinalizer {
    host: Host,
    shared: Arc<Mutex<CentralShared>>,
    events: mpsc::UnboundedSender<CentralEvent>,
    query_timeout: Duration,
}

impl ConnectionFinalizer {
    async fn finalize(self, completion: ConnectionCompletion, cached: Option<RemoteInfo>) {
        let info = match cached {
            Some(info) => {
                log::debug!("serving the remote information of {} from the store", completion.address);

                info
            }
            None => match self.query_remote_info(completion.handle).await {
                Ok(info) => {
                    self.shared
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .store
                        .set_remote_info(completion.address, info);

                    info
                }
                Err(error) => {
                    log::warn!("querying the remote information on {} failed: {}", completion.handle, error);

                    let _ = self.events.send(CentralEvent::ConnectFailed {
                        peer: completion.address,
                        reason: ConnectFailureReason::RemoteInfo(error),
                    });

                    return;
                }
            },
        };

        let _ = self.events.send(CentralEvent::Connected(ConnectedPeer {
            handle: completion.handle,
            address: completion.address,
            address_type: completion.address_type,
            version: info.version,
            features: info.features,
        }));
    }

    async fn query_remote_info(&self, handle: ConnectionHandle) -> Result<RemoteInfo, CommandError> {
        let mut version_events = self.host.subscribe(Events::ReadRemoteVersionInformationComplete);
        let mut feature_events = self.host.subscribe(Events::LeMeta(LeMeta::ReadRemoteFeaturesComplete));

        // some controllers spuriously answer the first remote version read with nothing at
        // all, the read is retried exactly once before the failure propagates
        let mut version = None;

        for attempt in 0..2 {
            let (command, parameter) = commands::read_remote_version_information(handle);

            self.host.send_command(command, parameter).await?;

            match Self::wait_for_version(&mut version_events, handle, self.query_timeout).await {
                Some(remote_version) => {
                    version = Some(remote_version);

                    break;
                }
                None if attempt == 0 => {
                    log::debug!("the remote version read on {} returned nothing, retrying once", handle)
                }
                None => {}
            }
        }

        let version = version.ok_or(CommandError::Timeout)?;

        let (command, parameter) = commands::le_read_remote_features(handle);

        self.host.send_command(command, parameter).await?;

        let features = Self::wait_for_features(&mut feature_events, handle, self.query_timeout)
            .await
            .ok_or(CommandError::Timeout)?;

        Ok(RemoteInfo { version, features })
    }

    async fn wait_for_version(
        events: &mut mpsc::UnboundedReceiver<EventsData>,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> Option<RemoteVersion> {
        let wait = async {
            while let Some(event) = events.recv().await {
                if let EventsData::ReadRemoteVersionInformationComplete(data) = event {
                    if data.connection_handle != handle {
                        continue;
                    }

                    if data.status != ControllerError::NoError {
                        return None;
                    }

                    return Some(RemoteVersion {
                        version: data.version,
                        manufacturer_name: data.manufacturer_name,
                        subversion: data.subversion,
                    });
                }
            }

            None
        };

        tokio::time::timeout(timeout, wait).await.unwrap_or(None)
    }

    async fn wait_for_features(
        events: &mut mpsc::UnboundedReceiver<EventsData>,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> Option<LeFeatures> {
        let wait = async {
            while let Some(event) = events.recv().await {
                if let EventsData::LeMeta(LeMetaData::ReadRemoteFeaturesComplete(data)) = event {
                    if data.connection_handle != handle {
                        continue;
                    }

                    if data.status != ControllerError::NoError {
                        return None;
                    }

                    return Some(LeFeatures(data.features));
                }
            }

            None
        };

        tokio::time::timeout(timeout, wait).await.unwrap_or(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazuli_hci::HostConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PEER: BluetoothDeviceAddress = BluetoothDeviceAddress([0x31, 0xF2, 0xAC, 0x4A, 0x19, 0xB3]);

    fn peer_address() -> PeerAddress {
        PeerAddress {
            address_type: LeAddressType::Public,
            address: PEER,
        }
    }

    fn command_complete(opcode: u16, return_parameter: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x04, 0x0E, (3 + return_parameter.len()) as u8, 1];

        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.extend_from_slice(return_parameter);

        packet
    }

    fn command_status(status: u8, opcode: u16) -> Vec<u8> {
        let mut packet = vec![0x04, 0x0F, 4, status, 1];

        packet.extend_from_slice(&opcode.to_le_bytes());

        packet
    }

    fn le_connection_complete(status: u8, handle: u16, peer: BluetoothDeviceAddress) -> Vec<u8> {
        let mut packet = vec![0x04, 0x3E, 19, 0x01, status];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.push(0x00); // central role
        packet.push(0x00); // public peer address
        packet.extend_from_slice(&peer.0);
        packet.extend_from_slice(&0x0018u16.to_le_bytes());
        packet.extend_from_slice(&0u16.to_le_bytes());
        packet.extend_from_slice(&0x01F4u16.to_le_bytes());
        packet.push(0x00);

        packet
    }

    fn remote_version_complete(handle: u16) -> Vec<u8> {
        let mut packet = vec![0x04, 0x0C, 8, 0x00];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.push(0x0B);
        packet.extend_from_slice(&0x000Fu16.to_le_bytes());
        packet.extend_from_slice(&0x2107u16.to_le_bytes());

        packet
    }

    fn remote_features_complete(handle: u16) -> Vec<u8> {
        let mut packet = vec![0x04, 0x3E, 12, 0x04, 0x00];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.extend_from_slice(&[0x01, 0, 0, 0, 0, 0, 0, 0]);

        packet
    }

    fn disconnection_complete(handle: u16, reason: u8) -> Vec<u8> {
        let mut packet = vec![0x04, 0x05, 4, 0x00];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.push(reason);

        packet
    }

    /// Answer every command on the wire through `handler` and record the opcodes seen
    fn spawn_controller(
        host: &Host,
        mut wire: mpsc::UnboundedReceiver<Vec<u8>>,
        mut handler: impl FnMut(u16) -> Vec<Vec<u8>> + Send + 'static,
    ) -> Arc<Mutex<Vec<u16>>> {
        let feeder = host.clone();

        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_in_task = seen.clone();

        tokio::spawn(async move {
            while let Some(packet) = wire.recv().await {
                if packet[0] != 0x01 {
                    continue;
                }

                let opcode = <u16>::from_le_bytes([packet[1], packet[2]]);

                seen_in_task.lock().unwrap().push(opcode);

                for response in handler(opcode) {
                    feeder.feed(&response);
                }
            }
        });

        seen
    }

    fn setup_responses(opcode: u16, extended: bool) -> Option<Vec<Vec<u8>>> {
        match opcode {
            // read local supported commands
            0x1002 => {
                let mut mask = vec![0u8; 65];

                if extended {
                    mask[1 + 37] = 0b1110_0000;
                }

                Some(vec![command_complete(opcode, &mask)])
            }
            // le read buffer size: 27 byte packets, 4 buffers
            0x2002 => Some(vec![command_complete(opcode, &[0x00, 0x1B, 0x00, 0x04])]),
            _ => None,
        }
    }

    async fn setup_central(
        extended: bool,
        store: Box<dyn PeerStore>,
        mut handler: impl FnMut(u16) -> Vec<Vec<u8>> + Send + 'static,
    ) -> (
        Central,
        mpsc::UnboundedReceiver<CentralEvent>,
        Arc<Mutex<Vec<u16>>>,
        Host,
    ) {
        let (host, wire) = Host::new(HostConfig::default());

        let seen = spawn_controller(&host, wire, move |opcode| {
            setup_responses(opcode, extended).unwrap_or_else(|| handler(opcode))
        });

        let (central, events) = Central::setup(host.clone(), store, CentralConfig::default())
            .await
            .unwrap();

        (central, events, seen, host)
    }

    #[tokio::test]
    async fn setup_commits_to_the_extended_family_when_supported() {
        let (central, _events, _seen, _host) = setup_central(true, Box::new(NoStore), |_| Vec::new()).await;

        assert_eq!(CommandFamily::Extended, central.get_command_family());
    }

    #[tokio::test]
    async fn setup_falls_back_to_the_legacy_family() {
        let (central, _events, _seen, _host) = setup_central(false, Box::new(NoStore), |_| Vec::new()).await;

        assert_eq!(CommandFamily::Legacy, central.get_command_family());
    }

    #[tokio::test]
    async fn setup_uses_the_shared_buffer_when_the_le_pool_is_empty() {
        let (host, wire) = Host::new(HostConfig::default());

        let _seen = spawn_controller(&host, wire, |opcode| match opcode {
            0x1002 => vec![command_complete(opcode, &[0u8; 65])],
            0x2002 => vec![command_complete(opcode, &[0x00, 0x00, 0x00, 0x00])],
            0x1005 => vec![command_complete(opcode, &[0x00, 0xFB, 0x00, 0x40, 0x08, 0x00, 0x00, 0x00])],
            _ => Vec::new(),
        });

        let (central, _events) = Central::setup(host, Box::new(NoStore), CentralConfig::default())
            .await
            .unwrap();

        let shared = central.lock_shared();

        assert_eq!(251, shared.flow.get_fragment_limit());
        assert_eq!(8, shared.flow.get_max_in_flight());
    }

    #[tokio::test]
    async fn scanning_toggles_are_idempotent() {
        let (central, mut events, seen, _host) = setup_central(false, Box::new(NoStore), |opcode| match opcode {
            0x200B | 0x200C => vec![command_complete(opcode, &[0x00])],
            _ => Vec::new(),
        })
        .await;

        central.start_scanning(ScanParameters::default()).await.unwrap();
        central.start_scanning(ScanParameters::default()).await.unwrap();

        assert!(central.is_scanning());

        central.stop_scanning().await.unwrap();
        central.stop_scanning().await.unwrap();

        assert!(!central.is_scanning());

        assert_eq!(Some(CentralEvent::ScanStateChanged(true)), events.recv().await);
        assert_eq!(Some(CentralEvent::ScanStateChanged(false)), events.recv().await);

        let seen = seen.lock().unwrap();

        assert_eq!(1, seen.iter().filter(|opcode| **opcode == 0x200B).count());
        assert_eq!(2, seen.iter().filter(|opcode| **opcode == 0x200C).count());
    }

    #[tokio::test]
    async fn extended_family_scans_with_extended_commands() {
        let (central, _events, seen, _host) = setup_central(true, Box::new(NoStore), |opcode| match opcode {
            0x2041 | 0x2042 => vec![command_complete(opcode, &[0x00])],
            _ => Vec::new(),
        })
        .await;

        central.start_scanning(ScanParameters::default()).await.unwrap();

        let seen = seen.lock().unwrap();

        assert!(seen.contains(&0x2041));
        assert!(seen.contains(&0x2042));
        assert!(!seen.contains(&0x200B));
        assert!(!seen.contains(&0x200C));
    }

    #[tokio::test]
    async fn connect_emits_a_fully_populated_connected_event() {
        let (central, mut events, _seen, _host) =
            setup_central(false, Box::new(MemoryStore::new()), |opcode| match opcode {
                0x200D => vec![command_status(0x00, opcode), le_connection_complete(0x00, 0x40, PEER)],
                0x041D => vec![command_status(0x00, opcode), remote_version_complete(0x40)],
                0x2016 => vec![command_status(0x00, opcode), remote_features_complete(0x40)],
                _ => Vec::new(),
            })
            .await;

        central
            .connect(peer_address(), ConnectionParameters::default(), None)
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            CentralEvent::Connected(peer) => {
                assert_eq!(0x40, peer.handle.get_raw_handle());
                assert_eq!(PEER, peer.address);
                assert_eq!(LeAddressType::Public, peer.address_type);
                assert_eq!(0x0B, peer.version.version);
                assert_eq!(0x000F, peer.version.manufacturer_name);
                assert_eq!(0x2107, peer.version.subversion);
                assert!(peer.features.is_set(0));
            }
            event => panic!("expected a connected event, got {:?}", event),
        }

        let handle = ConnectionHandle::try_from(0x40u16).unwrap();

        assert!(central.get_bearer(handle).is_some());
        assert!(central.gatt_client(handle).is_some());
    }

    #[tokio::test]
    async fn only_one_connection_may_be_pending() {
        let (central, _events, _seen, _host) = setup_central(false, Box::new(NoStore), |opcode| match opcode {
            0x200D => vec![command_status(0x00, opcode)],
            _ => Vec::new(),
        })
        .await;

        central
            .connect(peer_address(), ConnectionParameters::default(), None)
            .await
            .unwrap();

        let error = central
            .connect(peer_address(), ConnectionParameters::default(), None)
            .await
            .unwrap_err();

        assert_eq!(ConnectError::AlreadyConnecting, error);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_version_read_is_retried_exactly_once() {
        let version_reads = Arc::new(AtomicUsize::new(0));

        let reads = version_reads.clone();

        let (central, mut events, _seen, _host) =
            setup_central(false, Box::new(MemoryStore::new()), move |opcode| match opcode {
                0x200D => vec![command_status(0x00, opcode), le_connection_complete(0x00, 0x40, PEER)],
                0x041D => {
                    if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                        // spuriously return nothing to the first read
                        vec![command_status(0x00, opcode)]
                    } else {
                        vec![command_status(0x00, opcode), remote_version_complete(0x40)]
                    }
                }
                0x2016 => vec![command_status(0x00, opcode), remote_features_complete(0x40)],
                _ => Vec::new(),
            })
            .await;

        central
            .connect(peer_address(), ConnectionParameters::default(), None)
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            CentralEvent::Connected(peer) => assert_eq!(0x0B, peer.version.version),
            event => panic!("expected a connected event, got {:?}", event),
        }

        assert_eq!(2, version_reads.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_cancels_the_pending_connection() {
        let (central, mut events, seen, _host) = setup_central(false, Box::new(NoStore), |opcode| match opcode {
            0x200D => vec![command_status(0x00, opcode)],
            0x200E => vec![
                command_complete(opcode, &[0x00]),
                le_connection_complete(0x02, 0x00, BluetoothDeviceAddress::zeroed()),
            ],
            _ => Vec::new(),
        })
        .await;

        central
            .connect(peer_address(), ConnectionParameters::default(), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(Some(CentralEvent::ConnectionCancelled), events.recv().await);

        assert!(seen.lock().unwrap().contains(&0x200E));

        // the pending connection slot is free again
        central
            .connect(peer_address(), ConnectionParameters::default(), None)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_completion_racing_the_cancel_wins() {
        let (central, mut events, _seen, _host) =
            setup_central(false, Box::new(MemoryStore::new()), |opcode| match opcode {
                0x200D => vec![command_status(0x00, opcode)],
                // the cancel is disallowed because the connection completed concurrently
                0x200E => vec![
                    command_complete(opcode, &[0x0C]),
                    le_connection_complete(0x00, 0x40, PEER),
                ],
                0x041D => vec![command_status(0x00, opcode), remote_version_complete(0x40)],
                0x2016 => vec![command_status(0x00, opcode), remote_features_complete(0x40)],
                _ => Vec::new(),
            })
            .await;

        central
            .connect(peer_address(), ConnectionParameters::default(), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            CentralEvent::Connected(peer) => assert_eq!(PEER, peer.address),
            event => panic!("expected a connected event, got {:?}", event),
        }

        // no cancelled event may follow the connected event
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn connection_failure_status_emits_connect_failed() {
        let (central, mut events, _seen, _host) = setup_central(false, Box::new(NoStore), |opcode| match opcode {
            0x200D => vec![
                command_status(0x00, opcode),
                le_connection_complete(0x3E, 0x00, BluetoothDeviceAddress::zeroed()),
            ],
            _ => Vec::new(),
        })
        .await;

        central
            .connect(peer_address(), ConnectionParameters::default(), None)
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            CentralEvent::ConnectFailed { peer, reason } => {
                assert_eq!(PEER, peer);
                assert_eq!(
                    ConnectFailureReason::Status(
                        ControllerError::ConnectionFailedToBeEstablishedOrSynchronizationTimeout
                    ),
                    reason
                );
            }
            event => panic!("expected a connect failed event, got {:?}", event),
        }
    }

    #[tokio::test]
    async fn disconnection_tears_down_the_link() {
        let (central, mut events, _seen, host) =
            setup_central(false, Box::new(MemoryStore::new()), |opcode| match opcode {
                0x200D => vec![command_status(0x00, opcode), le_connection_complete(0x00, 0x40, PEER)],
                0x041D => vec![command_status(0x00, opcode), remote_version_complete(0x40)],
                0x2016 => vec![command_status(0x00, opcode), remote_features_complete(0x40)],
                _ => Vec::new(),
            })
            .await;

        central
            .connect(peer_address(), ConnectionParameters::default(), None)
            .await
            .unwrap();

        assert!(matches!(events.recv().await, Some(CentralEvent::Connected(_))));

        host.feed(&disconnection_complete(0x40, 0x13));

        let handle = ConnectionHandle::try_from(0x40u16).unwrap();

        assert_eq!(
            Some(CentralEvent::Disconnected {
                handle,
                reason: ControllerError::RemoteUserTerminatedConnection,
            }),
            events.recv().await
        );

        assert!(central.get_bearer(handle).is_none());
    }

    #[tokio::test]
    async fn cached_remote_info_skips_the_queries() {
        let mut store = MemoryStore::new();

        store.set_remote_info(
            PEER,
            RemoteInfo {
                version: RemoteVersion {
                    version: 9,
                    manufacturer_name: 2,
                    subversion: 3,
                },
                features: LeFeatures([0xFF, 0, 0, 0, 0, 0, 0, 0]),
            },
        );

        let (central, mut events, seen, _host) = setup_central(false, Box::new(store), |opcode| match opcode {
            0x200D => vec![command_status(0x00, opcode), le_connection_complete(0x00, 0x40, PEER)],
            _ => Vec::new(),
        })
        .await;

        central
            .connect(peer_address(), ConnectionParameters::default(), None)
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            CentralEvent::Connected(peer) => assert_eq!(9, peer.version.version),
            event => panic!("expected a connected event, got {:?}", event),
        }

        let seen = seen.lock().unwrap();

        assert!(!seen.contains(&0x041D));
        assert!(!seen.contains(&0x2016));
    }

    #[tokio::test]
    async fn inbound_notifications_reach_the_bearer() {
        let (central, mut events, _seen, host) =
            setup_central(false, Box::new(MemoryStore::new()), |opcode| match opcode {
                0x200D => vec![command_status(0x00, opcode), le_connection_complete(0x00, 0x40, PEER)],
                0x041D => vec![command_status(0x00, opcode), remote_version_complete(0x40)],
                0x2016 => vec![command_status(0x00, opcode), remote_features_complete(0x40)],
                _ => Vec::new(),
            })
            .await;

        central
            .connect(peer_address(), ConnectionParameters::default(), None)
            .await
            .unwrap();

        assert!(matches!(events.recv().await, Some(CentralEvent::Connected(_))));

        let handle = ConnectionHandle::try_from(0x40u16).unwrap();

        let bearer = central.get_bearer(handle).unwrap();

        let mut updates = bearer.value_updates();

        // a handle value notification for attribute 0x0021 within a basic frame
        host.feed(&[
            0x02, 0x40, 0x00, 0x08, 0x00, // ACL header, start fragment
            0x04, 0x00, 0x04, 0x00, // basic frame header for the attribute channel
            0x1B, 0x21, 0x00, 0x99,
        ]);

        let update = updates.recv().await.unwrap();

        assert_eq!(0x0021, update.attribute_handle);
        assert_eq!(vec![0x99], update.value);
    }
}
