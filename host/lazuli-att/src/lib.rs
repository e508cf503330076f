//! Attribute Protocol client
//!
//! The attribute protocol is a strict request and response protocol: a client sends a request
//! PDU over the attribute channel and the server answers with the matching response or with an
//! error response naming the request it rejects. A [`Bearer`] implements the client side of one
//! link. It pairs every outstanding request with the server PDU expected to answer it, bounds
//! the wait with the transaction timeout, and re-emits the server initiated notifications and
//! indications as [`ValueUpdate`]s.
//!
//! The protocol allows only one outstanding transaction per link, but the `Bearer` does not
//! enforce that; a caller that pipelines requests anyway gets its responses matched in
//! registration order.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod pdu;

use crate::pdu::{ClientPduName, ErrorCode, HandleRange, ServerPduName, TransferFormatError};
use core::fmt;
use lazuli_core::{ConnectionHandle, Uuid};
use lazuli_l2cap::{ChannelId, OutboundSdu};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// The minimum and default maximum transmission unit of the attribute protocol on LE
pub const DEFAULT_MTU: u16 = 23;

/// Configuration of a [`Bearer`]
#[derive(Debug, Clone, Copy)]
pub struct BearerConfig {
    /// How long to wait for the server to answer a request
    pub transaction_timeout: Duration,
}

impl Default for BearerConfig {
    fn default() -> Self {
        BearerConfig {
            transaction_timeout: Duration::from_secs(30),
        }
    }
}

/// Error from an attribute protocol transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The server did not answer within the transaction timeout
    Timeout,
    /// The server rejected the request with an error response
    ErrorResponse {
        request: ClientPduName,
        attribute_handle: u16,
        error: ErrorCode,
    },
    /// The response body did not match the layout of its opcode
    TransferFormat(TransferFormatError),
    /// The channel towards the connection is closed
    ChannelClosed,
}

impl Error {
    /// Check if this error is an error response with the code [`AttributeNotFound`]
    ///
    /// The attribute protocol signals an exhausted handle range this way, so iterative queries
    /// treat it as their normal end and not as a failure.
    ///
    /// [`AttributeNotFound`]: ErrorCode::AttributeNotFound
    pub fn is_attribute_not_found(&self) -> bool {
        matches!(
            self,
            Error::ErrorResponse {
                error: ErrorCode::AttributeNotFound,
                ..
            }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Timeout => f.write_str("the server did not respond within the transaction timeout"),
            Error::ErrorResponse {
                request,
                attribute_handle,
                error,
            } => write!(
                f,
                "the server rejected the {} for attribute handle {:#06x}: {}",
                request, attribute_handle, error
            ),
            Error::TransferFormat(error) => fmt::Display::fmt(error, f),
            Error::ChannelClosed => f.write_str("the channel towards the connection is closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<TransferFormatError> for Error {
    fn from(error: TransferFormatError) -> Self {
        Error::TransferFormat(error)
    }
}

/// A server initiated value update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueUpdate {
    pub attribute_handle: u16,
    pub value: Vec<u8>,
    pub kind: ValueUpdateKind,
}

/// Whether a value update was a notification or an indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueUpdateKind {
    Notification,
    /// Indications were already confirmed towards the server when they are emitted
    Indication,
}

struct Waiter {
    id: u64,
    request: ClientPduName,
    expected: ServerPduName,
    response: oneshot::Sender<Result<Vec<u8>, Error>>,
}

struct BearerInner {
    waiters: VecDeque<Waiter>,
    update_subscribers: Vec<mpsc::UnboundedSender<ValueUpdate>>,
    next_waiter_id: u64,
    mtu: u16,
}

/// The attribute protocol client bearer of one link
///
/// A `Bearer` is cheap to clone; clones share the waiter table and the negotiated MTU.
#[derive(Clone)]
pub struct Bearer {
    handle: ConnectionHandle,
    outbound: mpsc::UnboundedSender<OutboundSdu>,
    inner: Arc<Mutex<BearerInner>>,
    transaction_timeout: Duration,
}

impl Bearer {
    /// Create a new `Bearer` for a link
    ///
    /// Everything the bearer sends is submitted to `outbound` as a service data unit for the
    /// attribute protocol channel of `handle`.
    pub fn new(handle: ConnectionHandle, outbound: mpsc::UnboundedSender<OutboundSdu>, config: BearerConfig) -> Self {
        let inner = BearerInner {
            waiters: VecDeque::new(),
            update_subscribers: Vec::new(),
            next_waiter_id: 0,
            mtu: DEFAULT_MTU,
        };

        Bearer {
            handle,
            outbound,
            inner: Arc::new(Mutex::new(inner)),
            transaction_timeout: config.transaction_timeout,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, BearerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_connection_handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Get the negotiated maximum transmission unit
    pub fn get_mtu(&self) -> u16 {
        self.lock_inner().mtu
    }

    /// Subscribe to server initiated value updates
    pub fn value_updates(&self) -> mpsc::UnboundedReceiver<ValueUpdate> {
        let (sender, receiver) = mpsc::unbounded_channel();

        self.lock_inner().update_subscribers.push(sender);

        receiver
    }

    /// Perform a request transaction
    ///
    /// Sends `request_pdu` and suspends until the server answers with an `expected` PDU, an
    /// error response naming `request`, or the transaction timeout elapses. The returned bytes
    /// are the body of the response after its opcode.
    pub async fn request(
        &self,
        request: ClientPduName,
        expected: ServerPduName,
        request_pdu: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let (response_sender, response_receiver) = oneshot::channel();

        let id = {
            let mut inner = self.lock_inner();

            let id = inner.next_waiter_id;

            inner.next_waiter_id += 1;

            inner.waiters.push_back(Waiter {
                id,
                request,
                expected,
                response: response_sender,
            });

            id
        };

        if self.send_sdu(request_pdu).is_err() {
            self.lock_inner().waiters.retain(|waiter| waiter.id != id);

            return Err(Error::ChannelClosed);
        }

        match tokio::time::timeout(self.transaction_timeout, response_receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                self.lock_inner().waiters.retain(|waiter| waiter.id != id);

                log::warn!("{} on {} timed out", request, self.handle);

                Err(Error::Timeout)
            }
        }
    }

    /// Exchange the maximum transmission unit
    ///
    /// The negotiated MTU becomes the minimum of `client_rx_mtu` and the MTU returned by the
    /// server, and is returned.
    pub async fn exchange_mtu(&self, client_rx_mtu: u16) -> Result<u16, Error> {
        let body = self
            .request(
                ClientPduName::ExchangeMtuRequest,
                ServerPduName::ExchangeMtuResponse,
                pdu::exchange_mtu_request(client_rx_mtu),
            )
            .await?;

        let server_rx_mtu = pdu::parse_exchange_mtu_response(&body)?;

        let mtu = client_rx_mtu.min(server_rx_mtu).max(DEFAULT_MTU);

        self.lock_inner().mtu = mtu;

        Ok(mtu)
    }

    /// Find information about the attributes within a handle range
    pub async fn find_information(&self, range: HandleRange) -> Result<Vec<(u16, Uuid)>, Error> {
        let body = self
            .request(
                ClientPduName::FindInformationRequest,
                ServerPduName::FindInformationResponse,
                pdu::find_information_request(range),
            )
            .await?;

        Ok(pdu::parse_find_information_response(&body)?)
    }

    /// Read the attributes of a type within a handle range
    pub async fn read_by_type(&self, range: HandleRange, attribute_type: Uuid) -> Result<Vec<pdu::ReadByTypeEntry>, Error> {
        let body = self
            .request(
                ClientPduName::ReadByTypeRequest,
                ServerPduName::ReadByTypeResponse,
                pdu::read_by_type_request(range, attribute_type),
            )
            .await?;

        Ok(pdu::parse_read_by_type_response(&body)?)
    }

    /// Read the attribute groupings of a group type within a handle range
    pub async fn read_by_group_type(
        &self,
        range: HandleRange,
        group_type: Uuid,
    ) -> Result<Vec<pdu::ReadByGroupTypeEntry>, Error> {
        let body = self
            .request(
                ClientPduName::ReadByGroupTypeRequest,
                ServerPduName::ReadByGroupTypeResponse,
                pdu::read_by_group_type_request(range, group_type),
            )
            .await?;

        Ok(pdu::parse_read_by_group_type_response(&body)?)
    }

    /// Read an attribute value
    pub async fn read(&self, attribute_handle: u16) -> Result<Vec<u8>, Error> {
        self.request(
            ClientPduName::ReadRequest,
            ServerPduName::ReadResponse,
            pdu::read_request(attribute_handle),
        )
        .await
    }

    /// Read part of an attribute value starting at an offset
    pub async fn read_blob(&self, attribute_handle: u16, value_offset: u16) -> Result<Vec<u8>, Error> {
        self.request(
            ClientPduName::ReadBlobRequest,
            ServerPduName::ReadBlobResponse,
            pdu::read_blob_request(attribute_handle, value_offset),
        )
        .await
    }

    /// Write an attribute value
    pub async fn write(&self, attribute_handle: u16, value: &[u8]) -> Result<(), Error> {
        self.request(
            ClientPduName::WriteRequest,
            ServerPduName::WriteResponse,
            pdu::write_request(attribute_handle, value),
        )
        .await
        .map(|_| ())
    }

    /// Write an attribute value without acknowledgement
    pub fn write_command(&self, attribute_handle: u16, value: &[u8]) -> Result<(), Error> {
        self.send_sdu(pdu::write_command(attribute_handle, value))
            .map_err(|_| Error::ChannelClosed)
    }

    /// Process an inbound attribute protocol PDU
    ///
    /// This is called with the payload of every basic frame received on the attribute protocol
    /// channel of the bearer's link. Responses resolve the oldest matching waiter; PDUs that
    /// nothing waits for are logged and dropped.
    pub fn process_pdu(&self, payload: &[u8]) {
        let Some((&opcode, body)) = payload.split_first() else {
            log::warn!("dropping empty attribute PDU from {}", self.handle);

            return;
        };

        let Ok(name) = ServerPduName::try_from(opcode) else {
            log::warn!(
                "dropping attribute PDU with unknown opcode {:#04x} from {}",
                opcode,
                self.handle
            );

            return;
        };

        match name {
            ServerPduName::ErrorResponse => self.process_error_response(body),
            ServerPduName::HandleValueNotification => self.process_value_update(body, ValueUpdateKind::Notification),
            ServerPduName::HandleValueIndication => {
                // an indication must be confirmed before anything else is done with it
                if self.send_sdu(pdu::handle_value_confirmation()).is_err() {
                    log::warn!("unable to confirm an indication on {}", self.handle);

                    return;
                }

                self.process_value_update(body, ValueUpdateKind::Indication)
            }
            name => self.process_response(name, body),
        }
    }

    fn send_sdu(&self, payload: Vec<u8>) -> Result<(), mpsc::error::SendError<OutboundSdu>> {
        self.outbound.send(OutboundSdu {
            handle: self.handle,
            channel_id: ChannelId::AttributeProtocol,
            payload,
        })
    }

    fn process_response(&self, name: ServerPduName, body: &[u8]) {
        let mut inner = self.lock_inner();

        let position = inner.waiters.iter().position(|waiter| waiter.expected == name);

        match position.and_then(|index| inner.waiters.remove(index)) {
            Some(waiter) => {
                let _ = waiter.response.send(Ok(body.to_vec()));
            }
            None => log::warn!("dropping {} from {}, no request is awaiting it", name, self.handle),
        }
    }

    fn process_error_response(&self, body: &[u8]) {
        let error_response = match pdu::ErrorResponse::try_from_body(body) {
            Ok(error_response) => error_response,
            Err(error) => {
                log::warn!("dropping malformed error response from {}: {}", self.handle, error);

                return;
            }
        };

        let mut inner = self.lock_inner();

        let position = inner
            .waiters
            .iter()
            .position(|waiter| u8::from(waiter.request) == error_response.request_opcode);

        match position.and_then(|index| inner.waiters.remove(index)) {
            Some(waiter) => {
                let error = Error::ErrorResponse {
                    request: waiter.request,
                    attribute_handle: error_response.attribute_handle,
                    error: error_response.error,
                };

                let _ = waiter.response.send(Err(error));
            }
            None => log::warn!(
                "dropping error response for request opcode {:#04x} from {}, no request is awaiting it",
                error_response.request_opcode,
                self.handle
            ),
        }
    }

    fn process_value_update(&self, body: &[u8], kind: ValueUpdateKind) {
        let (attribute_handle, value) = match pdu::parse_handle_value(body) {
            Ok(parts) => parts,
            Err(error) => {
                log::warn!("dropping malformed value update from {}: {}", self.handle, error);

                return;
            }
        };

        let mut inner = self.lock_inner();

        let update = ValueUpdate {
            attribute_handle,
            value,
            kind,
        };

        inner
            .update_subscribers
            .retain(|subscriber| subscriber.send(update.clone()).is_ok());

        if inner.update_subscribers.is_empty() {
            log::trace!("dropping value update from {}, nothing is subscribed", self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_test_bearer() -> (Bearer, mpsc::UnboundedReceiver<OutboundSdu>) {
        let (outbound, outbound_receiver) = mpsc::unbounded_channel();

        let handle = ConnectionHandle::try_from(0x40u16).unwrap();

        (Bearer::new(handle, outbound, BearerConfig::default()), outbound_receiver)
    }

    #[tokio::test]
    async fn request_resolves_on_the_expected_response() {
        let (bearer, mut outbound) = new_test_bearer();

        let server = bearer.clone();

        let task = tokio::spawn(async move {
            let sdu = outbound.recv().await.unwrap();

            assert_eq!(ChannelId::AttributeProtocol, sdu.channel_id);
            assert_eq!(vec![0x0A, 0x21, 0x00], sdu.payload);

            server.process_pdu(&[0x0B, 0xAA, 0xBB]);
        });

        let value = bearer.read(0x21).await.unwrap();

        assert_eq!(vec![0xAA, 0xBB], value);

        task.await.unwrap();
    }

    #[tokio::test]
    async fn error_response_rejects_the_matching_request() {
        let (bearer, mut outbound) = new_test_bearer();

        let server = bearer.clone();

        let task = tokio::spawn(async move {
            outbound.recv().await.unwrap();

            // error response naming the read by group type request
            server.process_pdu(&[0x01, 0x10, 0x11, 0x00, 0x0A]);
        });

        let error = bearer
            .read_by_group_type(
                HandleRange {
                    starting_handle: 0x11,
                    ending_handle: 0xFFFF,
                },
                Uuid::from_u16(0x2800),
            )
            .await
            .unwrap_err();

        assert!(error.is_attribute_not_found());

        task.await.unwrap();
    }

    #[tokio::test]
    async fn pipelined_requests_resolve_in_registration_order() {
        let (bearer, mut outbound) = new_test_bearer();

        let server = bearer.clone();

        let task = tokio::spawn(async move {
            outbound.recv().await.unwrap();
            outbound.recv().await.unwrap();

            server.process_pdu(&[0x0B, 0x01]);
            server.process_pdu(&[0x0B, 0x02]);
        });

        let (first, second) = tokio::join!(bearer.read(0x10), bearer.read(0x11));

        assert_eq!(vec![0x01], first.unwrap());
        assert_eq!(vec![0x02], second.unwrap());

        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transaction_timeout_unregisters_the_waiter() {
        let (bearer, _outbound) = new_test_bearer();

        let error = bearer.read(0x21).await.unwrap_err();

        assert_eq!(Error::Timeout, error);
        assert!(bearer.lock_inner().waiters.is_empty());
    }

    #[tokio::test]
    async fn exchange_mtu_negotiates_the_minimum() {
        let (bearer, mut outbound) = new_test_bearer();

        let server = bearer.clone();

        let task = tokio::spawn(async move {
            let sdu = outbound.recv().await.unwrap();

            assert_eq!(vec![0x02, 0x00, 0x02], sdu.payload);

            server.process_pdu(&[0x03, 0x9B, 0x00]);
        });

        let mtu = bearer.exchange_mtu(512).await.unwrap();

        assert_eq!(155, mtu);
        assert_eq!(155, bearer.get_mtu());

        task.await.unwrap();
    }

    #[tokio::test]
    async fn notification_is_emitted_as_a_value_update() {
        let (bearer, _outbound) = new_test_bearer();

        let mut updates = bearer.value_updates();

        bearer.process_pdu(&[0x1B, 0x21, 0x00, 0x11, 0x22]);

        let update = updates.recv().await.unwrap();

        assert_eq!(0x0021, update.attribute_handle);
        assert_eq!(vec![0x11, 0x22], update.value);
        assert_eq!(ValueUpdateKind::Notification, update.kind);
    }

    #[tokio::test]
    async fn indication_is_confirmed_before_it_is_emitted() {
        let (bearer, mut outbound) = new_test_bearer();

        let mut updates = bearer.value_updates();

        bearer.process_pdu(&[0x1D, 0x21, 0x00, 0x33]);

        // the confirmation is on the channel before the update can be observed
        let confirmation = outbound.recv().await.unwrap();

        assert_eq!(vec![0x1E], confirmation.payload);

        let update = updates.recv().await.unwrap();

        assert_eq!(ValueUpdateKind::Indication, update.kind);
        assert_eq!(0x0021, update.attribute_handle);
    }

    #[tokio::test]
    async fn orphan_response_is_dropped() {
        let (bearer, _outbound) = new_test_bearer();

        bearer.process_pdu(&[0x0B, 0xAA]);
        bearer.process_pdu(&[0x01, 0x0A, 0x21, 0x00, 0x01]);

        assert!(bearer.lock_inner().waiters.is_empty());
    }
}
