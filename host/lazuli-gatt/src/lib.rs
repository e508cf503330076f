//! Generic Attribute Profile client
//!
//! GATT structures a peer's attributes into services containing characteristics containing
//! descriptors. The [`Client`] here discovers that structure through the attribute protocol
//! and records it in a [`Directory`].
//!
//! A single query can only return as many entries as fit into one response PDU, so every level
//! is discovered with an iterative, handle range bounded loop: query from a cursor to the end
//! of the range, append what came back, move the cursor past the last returned entry, and stop
//! when the range is exhausted. The server signals exhaustion either by an entry reaching the
//! end of the range or with an *attribute not found* error response, which is the normal end of
//! iteration and never surfaced as a failure.
//!
//! Discovery results are cached in the directory. Re-discovering an already enumerated level
//! returns the recorded nodes without querying the peer; a directory exported from an earlier
//! session can be re-injected with [`Client::with_directory`] to skip discovery entirely.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod directory;

pub use directory::{
    CharacteristicNode, CharacteristicProperties, DescriptorNode, Directory, IncludedService, ServiceNode,
};

use core::fmt;
use lazuli_att::pdu::HandleRange;
use lazuli_att::Bearer;
use lazuli_core::Uuid;

/// The attribute type of a primary service declaration
pub const PRIMARY_SERVICE: Uuid = Uuid::from_u16(0x2800);

/// The attribute type of an include declaration
pub const INCLUDE: Uuid = Uuid::from_u16(0x2802);

/// The attribute type of a characteristic declaration
pub const CHARACTERISTIC: Uuid = Uuid::from_u16(0x2803);

/// Error from a discovery procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The attribute protocol transaction failed
    Att(lazuli_att::Error),
    /// A declaration value did not match its fixed layout
    InvalidDeclaration(&'static str),
    /// The handle given to a discovery procedure is not in the directory
    UnknownHandle(u16),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Att(error) => fmt::Display::fmt(error, f),
            Error::InvalidDeclaration(what) => write!(f, "invalid {} declaration", what),
            Error::UnknownHandle(handle) => {
                write!(f, "attribute handle {:#06x} is not in the directory", handle)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<lazuli_att::Error> for Error {
    fn from(error: lazuli_att::Error) -> Self {
        Error::Att(error)
    }
}

/// A GATT client for one link
pub struct Client {
    bearer: Bearer,
    directory: Directory,
}

impl Client {
    /// Create a client with an empty directory
    pub fn new(bearer: Bearer) -> Self {
        Client {
            bearer,
            directory: Directory::new(),
        }
    }

    /// Create a client over a directory discovered earlier
    ///
    /// Levels already enumerated within `directory` are served from it without querying the
    /// peer. The directory must come from the same peer (and the peer's attribute table must
    /// not have changed) for the cache to be valid.
    pub fn with_directory(bearer: Bearer, directory: Directory) -> Self {
        Client { bearer, directory }
    }

    pub fn get_bearer(&self) -> &Bearer {
        &self.bearer
    }

    pub fn get_directory(&self) -> &Directory {
        &self.directory
    }

    pub fn into_directory(self) -> Directory {
        self.directory
    }

    /// Drop the cached directory, forcing re-discovery
    pub fn invalidate(&mut self) {
        self.directory.invalidate();
    }

    /// Discover the primary services of the peer
    pub async fn discover_services(&mut self) -> Result<Vec<ServiceNode>, Error> {
        if self.directory.services_complete {
            log::trace!("serving the service list from the directory");

            return Ok(self.directory.services.clone());
        }

        let mut cursor = 0x0001u16;

        loop {
            let range = HandleRange {
                starting_handle: cursor,
                ending_handle: 0xFFFF,
            };

            let entries = match self.bearer.read_by_group_type(range, PRIMARY_SERVICE).await {
                Ok(entries) => entries,
                Err(error) if error.is_attribute_not_found() => break,
                Err(error) => return Err(error.into()),
            };

            let mut last_end = cursor;

            for entry in entries {
                let uuid = Uuid::try_from_le_slice(&entry.value)
                    .map_err(|_| Error::InvalidDeclaration("service"))?;

                self.directory.services.push(ServiceNode {
                    handle: entry.attribute_handle,
                    end_group_handle: entry.group_end_handle,
                    uuid,
                    characteristics_discovered: false,
                    includes_discovered: false,
                });

                last_end = entry.group_end_handle;
            }

            cursor = match last_end.checked_add(1) {
                Some(next) => next,
                // the last service reaches the end of the handle range
                None => break,
            };
        }

        self.directory.services_complete = true;

        Ok(self.directory.services.clone())
    }

    /// Discover the include definitions of a service
    pub async fn discover_includes(&mut self, service_handle: u16) -> Result<Vec<IncludedService>, Error> {
        let service_index = self
            .directory
            .service_index_by_handle(service_handle)
            .ok_or(Error::UnknownHandle(service_handle))?;

        if self.directory.services[service_index].includes_discovered {
            return Ok(self.cloned_includes(service_index));
        }

        let range = self.directory.services[service_index].handle_range();

        let entries = self.read_by_type_over(*range.start(), *range.end(), INCLUDE).await?;

        for (handle, value) in entries {
            // the included service UUID field is only present for 16 bit UUIDs
            let uuid = match value.len() {
                4 => None,
                6 => Some(Uuid::from_u16(<u16>::from_le_bytes([value[4], value[5]]))),
                _ => return Err(Error::InvalidDeclaration("include")),
            };

            self.directory.includes.push(IncludedService {
                service: service_index,
                handle,
                included_service_handle: <u16>::from_le_bytes([value[0], value[1]]),
                included_end_group_handle: <u16>::from_le_bytes([value[2], value[3]]),
                uuid,
            });
        }

        self.directory.services[service_index].includes_discovered = true;

        Ok(self.cloned_includes(service_index))
    }

    /// Discover the characteristics of a service
    ///
    /// A characteristic declaration does not state where the characteristic ends. The end of
    /// each one is only knowable once the *next* declaration (or the end of the service) is
    /// known, so the previous node's end handle is back-filled as the iteration advances and
    /// the last node is closed with the service's own end handle.
    pub async fn discover_characteristics(&mut self, service_handle: u16) -> Result<Vec<CharacteristicNode>, Error> {
        let service_index = self
            .directory
            .service_index_by_handle(service_handle)
            .ok_or(Error::UnknownHandle(service_handle))?;

        if self.directory.services[service_index].characteristics_discovered {
            log::trace!(
                "serving the characteristics of service {:#06x} from the directory",
                service_handle
            );

            return Ok(self.cloned_characteristics(service_index));
        }

        let range = self.directory.services[service_index].handle_range();
        let service_end = *range.end();

        let entries = self.read_by_type_over(*range.start(), service_end, CHARACTERISTIC).await?;

        let mut new_nodes: Vec<CharacteristicNode> = Vec::with_capacity(entries.len());

        for (declaration_handle, value) in entries {
            if value.len() != 5 && value.len() != 19 {
                return Err(Error::InvalidDeclaration("characteristic"));
            }

            let uuid = Uuid::try_from_le_slice(&value[3..])
                .map_err(|_| Error::InvalidDeclaration("characteristic"))?;

            if let Some(previous) = new_nodes.last_mut() {
                previous.end_handle = declaration_handle - 1;
            }

            new_nodes.push(CharacteristicNode {
                service: service_index,
                declaration_handle,
                value_handle: <u16>::from_le_bytes([value[1], value[2]]),
                properties: CharacteristicProperties::from_raw(value[0]),
                uuid,
                end_handle: service_end,
                descriptors_discovered: false,
            });
        }

        self.directory.characteristics.append(&mut new_nodes);

        self.directory.services[service_index].characteristics_discovered = true;

        Ok(self.cloned_characteristics(service_index))
    }

    /// Discover the descriptors of a characteristic
    ///
    /// The characteristic is named by the handle of its value attribute.
    pub async fn discover_descriptors(&mut self, value_handle: u16) -> Result<Vec<DescriptorNode>, Error> {
        let characteristic_index = self
            .directory
            .characteristic_index_by_value_handle(value_handle)
            .ok_or(Error::UnknownHandle(value_handle))?;

        if self.directory.characteristics[characteristic_index].descriptors_discovered {
            return Ok(self.cloned_descriptors(characteristic_index));
        }

        let end = self.directory.characteristics[characteristic_index].end_handle;

        let mut cursor = match value_handle.checked_add(1) {
            Some(next) => next,
            None => end.wrapping_add(1),
        };

        while cursor != 0 && cursor <= end {
            let range = HandleRange {
                starting_handle: cursor,
                ending_handle: end,
            };

            let entries = match self.bearer.find_information(range).await {
                Ok(entries) => entries,
                Err(error) if error.is_attribute_not_found() => break,
                Err(error) => return Err(error.into()),
            };

            let mut last_handle = cursor;

            for (handle, uuid) in entries {
                self.directory.descriptors.push(DescriptorNode {
                    characteristic: characteristic_index,
                    handle,
                    uuid,
                });

                last_handle = handle;
            }

            cursor = match last_handle.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }

        self.directory.characteristics[characteristic_index].descriptors_discovered = true;

        Ok(self.cloned_descriptors(characteristic_index))
    }

    /// Discover all services, characteristics, and descriptors
    pub async fn discover_all(&mut self) -> Result<(), Error> {
        let service_handles: Vec<u16> = self
            .discover_services()
            .await?
            .into_iter()
            .map(|service| service.handle)
            .collect();

        for service_handle in service_handles {
            let value_handles: Vec<u16> = self
                .discover_characteristics(service_handle)
                .await?
                .into_iter()
                .map(|characteristic| characteristic.value_handle)
                .collect();

            for value_handle in value_handles {
                self.discover_descriptors(value_handle).await?;
            }
        }

        Ok(())
    }

    /// Run a read by type iteration over a handle range
    async fn read_by_type_over(
        &mut self,
        start: u16,
        end: u16,
        attribute_type: Uuid,
    ) -> Result<Vec<(u16, Vec<u8>)>, Error> {
        let mut collected = Vec::new();

        let mut cursor = start;

        while cursor != 0 && cursor <= end {
            let range = HandleRange {
                starting_handle: cursor,
                ending_handle: end,
            };

            let entries = match self.bearer.read_by_type(range, attribute_type).await {
                Ok(entries) => entries,
                Err(error) if error.is_attribute_not_found() => break,
                Err(error) => return Err(error.into()),
            };

            let mut last_handle = cursor;

            for entry in entries {
                last_handle = entry.attribute_handle;

                collected.push((entry.attribute_handle, entry.value));
            }

            cursor = match last_handle.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }

        Ok(collected)
    }

    fn cloned_includes(&self, service_index: usize) -> Vec<IncludedService> {
        self.directory
            .includes
            .iter()
            .filter(|include| include.service == service_index)
            .cloned()
            .collect()
    }

    fn cloned_characteristics(&self, service_index: usize) -> Vec<CharacteristicNode> {
        self.directory
            .characteristics
            .iter()
            .filter(|characteristic| characteristic.service == service_index)
            .cloned()
            .collect()
    }

    fn cloned_descriptors(&self, characteristic_index: usize) -> Vec<DescriptorNode> {
        self.directory
            .descriptors
            .iter()
            .filter(|descriptor| descriptor.characteristic == characteristic_index)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazuli_att::BearerConfig;
    use lazuli_core::ConnectionHandle;
    use lazuli_l2cap::OutboundSdu;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// A canned attribute server
    ///
    /// Answers every request on the outbound channel with the next canned response PDU and
    /// counts the requests it served.
    struct CannedServer {
        query_count: Arc<AtomicUsize>,
        task: tokio::task::JoinHandle<()>,
    }

    impl CannedServer {
        fn start(bearer: Bearer, mut outbound: mpsc::UnboundedReceiver<OutboundSdu>, responses: Vec<Vec<u8>>) -> Self {
            let query_count = Arc::new(AtomicUsize::new(0));

            let count = query_count.clone();

            let task = tokio::spawn(async move {
                let mut canned = responses.into_iter();

                while let Some(sdu) = outbound.recv().await {
                    assert_eq!(lazuli_l2cap::ChannelId::AttributeProtocol, sdu.channel_id);

                    count.fetch_add(1, Ordering::SeqCst);

                    match canned.next() {
                        Some(response) => bearer.process_pdu(&response),
                        None => panic!("the client queried more often than expected"),
                    }
                }
            });

            CannedServer { query_count, task }
        }

        fn queries(&self) -> usize {
            self.query_count.load(Ordering::SeqCst)
        }

        async fn stop(self) {
            self.task.abort();

            let _ = self.task.await;
        }
    }

    fn new_client() -> (Client, Bearer, mpsc::UnboundedReceiver<OutboundSdu>) {
        let (outbound, outbound_receiver) = mpsc::unbounded_channel();

        let handle = ConnectionHandle::try_from(0x40u16).unwrap();

        let bearer = Bearer::new(handle, outbound, BearerConfig::default());

        (Client::new(bearer.clone()), bearer, outbound_receiver)
    }

    fn attribute_not_found(request_opcode: u8, handle: u16) -> Vec<u8> {
        let mut response = vec![0x01, request_opcode];

        response.extend_from_slice(&handle.to_le_bytes());
        response.push(0x0A);

        response
    }

    #[tokio::test]
    async fn service_discovery_terminates_on_attribute_not_found() {
        let (mut client, bearer, outbound) = new_client();

        // three services over two response pages, then the end of range error
        let responses = vec![
            vec![
                0x11, 0x06, // two 16 bit entries
                0x01, 0x00, 0x05, 0x00, 0x00, 0x18, //
                0x06, 0x00, 0x0B, 0x00, 0x01, 0x18,
            ],
            vec![
                0x11, 0x06, //
                0x0C, 0x00, 0x10, 0x00, 0x0F, 0x18,
            ],
            attribute_not_found(0x10, 0x0011),
        ];

        let server = CannedServer::start(bearer, outbound, responses);

        let services = client.discover_services().await.unwrap();

        assert_eq!(3, services.len());
        assert_eq!(3, server.queries());
        assert_eq!(0x0001, services[0].handle);
        assert_eq!(0x0010, services[2].end_group_handle);
        assert_eq!(Uuid::from_u16(0x180F), services[2].uuid);
        assert!(client.get_directory().services_complete());

        server.stop().await;
    }

    #[tokio::test]
    async fn n_single_service_pages_issue_n_plus_one_queries() {
        let (mut client, bearer, outbound) = new_client();

        let responses = vec![
            vec![0x11, 0x06, 0x01, 0x00, 0x04, 0x00, 0x00, 0x18],
            vec![0x11, 0x06, 0x05, 0x00, 0x08, 0x00, 0x01, 0x18],
            vec![0x11, 0x06, 0x09, 0x00, 0x0C, 0x00, 0x0F, 0x18],
            attribute_not_found(0x10, 0x000D),
        ];

        let server = CannedServer::start(bearer, outbound, responses);

        let services = client.discover_services().await.unwrap();

        assert_eq!(3, services.len());
        assert_eq!(4, server.queries());

        server.stop().await;
    }

    #[tokio::test]
    async fn service_discovery_page_ending_at_0x0010_issues_exactly_two_queries() {
        let (mut client, bearer, outbound) = new_client();

        let responses = vec![
            vec![
                0x11, 0x06, //
                0x01, 0x00, 0x0B, 0x00, 0x00, 0x18, //
                0x0C, 0x00, 0x10, 0x00, 0x01, 0x18,
            ],
            attribute_not_found(0x10, 0x0011),
        ];

        let server = CannedServer::start(bearer, outbound, responses);

        let services = client.discover_services().await.unwrap();

        assert_eq!(2, services.len());
        assert_eq!(0x0010, services.last().unwrap().end_group_handle);
        assert_eq!(2, server.queries());

        server.stop().await;
    }

    #[tokio::test]
    async fn service_reaching_the_end_of_the_handle_range_stops_without_another_query() {
        let (mut client, bearer, outbound) = new_client();

        let responses = vec![vec![
            0x11, 0x06, //
            0x01, 0x00, 0xFF, 0xFF, 0x00, 0x18,
        ]];

        let server = CannedServer::start(bearer, outbound, responses);

        let services = client.discover_services().await.unwrap();

        assert_eq!(1, services.len());
        assert_eq!(1, server.queries());

        server.stop().await;
    }

    #[tokio::test]
    async fn cached_services_issue_no_queries() {
        let (mut client, bearer, outbound) = new_client();

        let responses = vec![
            vec![
                0x11, 0x06, //
                0x01, 0x00, 0x05, 0x00, 0x00, 0x18,
            ],
            attribute_not_found(0x10, 0x0006),
        ];

        let server = CannedServer::start(bearer, outbound, responses);

        client.discover_services().await.unwrap();

        assert_eq!(2, server.queries());

        let cached = client.discover_services().await.unwrap();

        assert_eq!(1, cached.len());
        assert_eq!(2, server.queries());

        server.stop().await;
    }

    #[tokio::test]
    async fn characteristic_end_handles_are_back_filled() {
        let (mut client, bearer, outbound) = new_client();

        let responses = vec![
            // one service covering handles 1 to 0x20
            vec![0x11, 0x06, 0x01, 0x00, 0x20, 0x00, 0x0F, 0x18],
            attribute_not_found(0x10, 0x0021),
            // two characteristic declarations in one page
            vec![
                0x09, 0x07, //
                0x02, 0x00, 0x02, 0x03, 0x00, 0x19, 0x2A, //
                0x08, 0x00, 0x10, 0x09, 0x00, 0x1A, 0x2A,
            ],
            attribute_not_found(0x08, 0x0009),
        ];

        let server = CannedServer::start(bearer, outbound, responses);

        client.discover_services().await.unwrap();

        let characteristics = client.discover_characteristics(0x0001).await.unwrap();

        assert_eq!(2, characteristics.len());

        // the first characteristic is closed by the second declaration
        assert_eq!(0x0007, characteristics[0].end_handle);
        assert_eq!(0x0003, characteristics[0].value_handle);
        assert!(characteristics[0].properties.contains(CharacteristicProperties::READ));

        // the last one is closed by the service end handle
        assert_eq!(0x0020, characteristics[1].end_handle);
        assert_eq!(Uuid::from_u16(0x2A1A), characteristics[1].uuid);

        assert_eq!(4, server.queries());

        server.stop().await;
    }

    #[tokio::test]
    async fn descriptor_discovery_is_bounded_by_the_characteristic() {
        let (mut client, bearer, outbound) = new_client();

        let responses = vec![
            vec![0x11, 0x06, 0x01, 0x00, 0x06, 0x00, 0x0F, 0x18],
            attribute_not_found(0x10, 0x0007),
            vec![0x09, 0x07, 0x02, 0x00, 0x12, 0x03, 0x00, 0x19, 0x2A],
            attribute_not_found(0x08, 0x0004),
            // descriptors at handles 4 and 5, then end of range
            vec![0x05, 0x01, 0x04, 0x00, 0x02, 0x29, 0x05, 0x00, 0x02, 0x29],
            attribute_not_found(0x04, 0x0006),
        ];

        let server = CannedServer::start(bearer, outbound, responses);

        client.discover_all().await.unwrap();

        let descriptors = client.get_directory().descriptors_of(0x0003);

        assert_eq!(2, descriptors.len());
        assert_eq!(0x0004, descriptors[0].handle);
        assert_eq!(Uuid::from_u16(0x2902), descriptors[0].uuid);

        assert_eq!(6, server.queries());

        server.stop().await;
    }

    #[tokio::test]
    async fn reinjected_directory_skips_discovery() {
        let (_, bearer, outbound) = new_client();

        let mut first_client = Client::new(bearer.clone());

        let responses = vec![
            vec![0x11, 0x06, 0x01, 0x00, 0x05, 0x00, 0x00, 0x18],
            attribute_not_found(0x10, 0x0006),
        ];

        let server = CannedServer::start(bearer.clone(), outbound, responses);

        first_client.discover_services().await.unwrap();

        let exported = first_client.into_directory();

        // a fresh client over the exported directory never queries
        let mut second_client = Client::with_directory(bearer, exported);

        let services = second_client.discover_services().await.unwrap();

        assert_eq!(1, services.len());
        assert_eq!(2, server.queries());

        server.stop().await;
    }

    #[tokio::test]
    async fn discovery_error_is_propagated() {
        let (mut client, bearer, outbound) = new_client();

        // a read not permitted error is a real failure, not an end of range
        let responses = vec![vec![0x01, 0x10, 0x01, 0x00, 0x02]];

        let server = CannedServer::start(bearer, outbound, responses);

        let error = client.discover_services().await.unwrap_err();

        assert!(matches!(error, Error::Att(lazuli_att::Error::ErrorResponse { .. })));
        assert!(!client.get_directory().services_complete());

        server.stop().await;
    }
}
