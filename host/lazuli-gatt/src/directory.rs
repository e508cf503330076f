//! The discovered attribute directory
//!
//! A [`Directory`] is the tree of services, characteristics, and descriptors discovered on a
//! peer. The nodes live in flat tables and reference their parent by table index, so walking
//! *up* the tree (which service does this notification handle belong to?) is an index lookup
//! and the whole directory serializes as plain data for use as a discovery cache in a later
//! session.
//!
//! Each level records whether its children were fully enumerated. Once a parent is marked, the
//! discovery engine serves its children from the directory without touching the peer again,
//! until the directory is explicitly invalidated.

use lazuli_core::Uuid;
use serde::{Deserialize, Serialize};

/// The properties of a characteristic
///
/// A bit set from the characteristic declaration describing the operations its value supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const BROADCAST: CharacteristicProperties = CharacteristicProperties(0x01);
    pub const READ: CharacteristicProperties = CharacteristicProperties(0x02);
    pub const WRITE_WITHOUT_RESPONSE: CharacteristicProperties = CharacteristicProperties(0x04);
    pub const WRITE: CharacteristicProperties = CharacteristicProperties(0x08);
    pub const NOTIFY: CharacteristicProperties = CharacteristicProperties(0x10);
    pub const INDICATE: CharacteristicProperties = CharacteristicProperties(0x20);
    pub const AUTHENTICATED_SIGNED_WRITES: CharacteristicProperties = CharacteristicProperties(0x40);
    pub const EXTENDED_PROPERTIES: CharacteristicProperties = CharacteristicProperties(0x80);

    pub fn from_raw(raw: u8) -> Self {
        CharacteristicProperties(raw)
    }

    pub fn to_raw(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: CharacteristicProperties) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A discovered service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub handle: u16,
    pub end_group_handle: u16,
    pub uuid: Uuid,
    pub(crate) characteristics_discovered: bool,
    pub(crate) includes_discovered: bool,
}

impl ServiceNode {
    /// The handle range covered by this service
    pub fn handle_range(&self) -> core::ops::RangeInclusive<u16> {
        self.handle..=self.end_group_handle
    }
}

/// A discovered include definition within a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludedService {
    /// Index of the including service within the directory's service table
    pub(crate) service: usize,
    pub handle: u16,
    pub included_service_handle: u16,
    pub included_end_group_handle: u16,
    /// Only present when the included service has a 16 bit service UUID
    pub uuid: Option<Uuid>,
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicNode {
    /// Index of the owning service within the directory's service table
    pub(crate) service: usize,
    pub declaration_handle: u16,
    pub value_handle: u16,
    pub properties: CharacteristicProperties,
    pub uuid: Uuid,
    /// The last handle belonging to this characteristic
    pub end_handle: u16,
    pub(crate) descriptors_discovered: bool,
}

/// A discovered descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorNode {
    /// Index of the owning characteristic within the directory's characteristic table
    pub(crate) characteristic: usize,
    pub handle: u16,
    pub uuid: Uuid,
}

/// The directory of everything discovered on a peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    pub(crate) services: Vec<ServiceNode>,
    pub(crate) includes: Vec<IncludedService>,
    pub(crate) characteristics: Vec<CharacteristicNode>,
    pub(crate) descriptors: Vec<DescriptorNode>,
    pub(crate) services_complete: bool,
}

impl Directory {
    pub fn new() -> Self {
        Directory::default()
    }

    /// All discovered services in handle order
    pub fn services(&self) -> &[ServiceNode] {
        &self.services
    }

    /// Check whether the service list was fully enumerated
    pub fn services_complete(&self) -> bool {
        self.services_complete
    }

    /// Get a service by the handle of its declaration
    pub fn service_by_handle(&self, handle: u16) -> Option<&ServiceNode> {
        self.service_index_by_handle(handle).map(|index| &self.services[index])
    }

    /// Get the service whose handle range contains `handle`
    pub fn service_containing(&self, handle: u16) -> Option<&ServiceNode> {
        self.services.iter().find(|service| service.handle_range().contains(&handle))
    }

    /// The discovered include definitions of a service
    pub fn includes_of(&self, service_handle: u16) -> Vec<&IncludedService> {
        match self.service_index_by_handle(service_handle) {
            Some(index) => self.includes.iter().filter(|include| include.service == index).collect(),
            None => Vec::new(),
        }
    }

    /// The discovered characteristics of a service
    pub fn characteristics_of(&self, service_handle: u16) -> Vec<&CharacteristicNode> {
        match self.service_index_by_handle(service_handle) {
            Some(index) => self
                .characteristics
                .iter()
                .filter(|characteristic| characteristic.service == index)
                .collect(),
            None => Vec::new(),
        }
    }

    /// The discovered descriptors of a characteristic
    pub fn descriptors_of(&self, characteristic_value_handle: u16) -> Vec<&DescriptorNode> {
        match self.characteristic_index_by_value_handle(characteristic_value_handle) {
            Some(index) => self
                .descriptors
                .iter()
                .filter(|descriptor| descriptor.characteristic == index)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Get a characteristic by the handle of its value attribute
    ///
    /// This is the lookup for resolving which characteristic a notification or indication
    /// belongs to.
    pub fn characteristic_by_value_handle(&self, value_handle: u16) -> Option<&CharacteristicNode> {
        self.characteristic_index_by_value_handle(value_handle)
            .map(|index| &self.characteristics[index])
    }

    /// Get the service a characteristic belongs to
    pub fn service_of(&self, characteristic: &CharacteristicNode) -> Option<&ServiceNode> {
        self.services.get(characteristic.service)
    }

    /// Get the characteristic a descriptor belongs to
    pub fn characteristic_of(&self, descriptor: &DescriptorNode) -> Option<&CharacteristicNode> {
        self.characteristics.get(descriptor.characteristic)
    }

    /// Drop everything discovered
    ///
    /// After invalidation every level is re-queried on its next discovery.
    pub fn invalidate(&mut self) {
        *self = Directory::default();
    }

    pub(crate) fn service_index_by_handle(&self, handle: u16) -> Option<usize> {
        self.services.iter().position(|service| service.handle == handle)
    }

    pub(crate) fn characteristic_index_by_value_handle(&self, value_handle: u16) -> Option<usize> {
        self.characteristics
            .iter()
            .position(|characteristic| characteristic.value_handle == value_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn small_directory() -> Directory {
        Directory {
            services: vec![
                ServiceNode {
                    handle: 0x0001,
                    end_group_handle: 0x000B,
                    uuid: Uuid::from_u16(0x1800),
                    characteristics_discovered: true,
                    includes_discovered: false,
                },
                ServiceNode {
                    handle: 0x0010,
                    end_group_handle: 0x001F,
                    uuid: Uuid::from_u16(0x180F),
                    characteristics_discovered: true,
                    includes_discovered: false,
                },
            ],
            includes: Vec::new(),
            characteristics: vec![
                CharacteristicNode {
                    service: 0,
                    declaration_handle: 0x0002,
                    value_handle: 0x0003,
                    properties: CharacteristicProperties::from_raw(0x02),
                    uuid: Uuid::from_u16(0x2A00),
                    end_handle: 0x000B,
                    descriptors_discovered: false,
                },
                CharacteristicNode {
                    service: 1,
                    declaration_handle: 0x0011,
                    value_handle: 0x0012,
                    properties: CharacteristicProperties::from_raw(0x12),
                    uuid: Uuid::from_u16(0x2A19),
                    end_handle: 0x001F,
                    descriptors_discovered: true,
                },
            ],
            descriptors: vec![DescriptorNode {
                characteristic: 1,
                handle: 0x0013,
                uuid: Uuid::from_u16(0x2902),
            }],
            services_complete: true,
        }
    }

    #[test]
    fn upward_lookup_by_value_handle() {
        let directory = small_directory();

        let characteristic = directory.characteristic_by_value_handle(0x0012).unwrap();

        assert_eq!(Uuid::from_u16(0x2A19), characteristic.uuid);

        let service = directory.service_of(characteristic).unwrap();

        assert_eq!(Uuid::from_u16(0x180F), service.uuid);

        let descriptor = &directory.descriptors_of(0x0012)[0];

        assert_eq!(Uuid::from_u16(0x2902), descriptor.uuid);
        assert_eq!(
            Uuid::from_u16(0x2A19),
            directory.characteristic_of(descriptor).unwrap().uuid
        );
    }

    #[test]
    fn service_containing_uses_the_handle_range() {
        let directory = small_directory();

        assert_eq!(
            Uuid::from_u16(0x1800),
            directory.service_containing(0x0003).unwrap().uuid
        );
        assert_eq!(
            Uuid::from_u16(0x180F),
            directory.service_containing(0x001F).unwrap().uuid
        );
        assert!(directory.service_containing(0x000C).is_none());
    }

    #[test]
    fn properties_bit_set() {
        let properties = CharacteristicProperties::from_raw(0x12);

        assert!(properties.contains(CharacteristicProperties::READ));
        assert!(properties.contains(CharacteristicProperties::NOTIFY));
        assert!(!properties.contains(CharacteristicProperties::WRITE));
    }

    #[test]
    fn directory_serialization_round_trip() {
        let directory = small_directory();

        let serialized = bincode::serialize(&directory).unwrap();

        let deserialized: Directory = bincode::deserialize(&serialized).unwrap();

        assert_eq!(directory, deserialized);
        assert!(deserialized.services_complete());
        assert!(deserialized.characteristic_by_value_handle(0x0012).is_some());
    }

    #[test]
    fn invalidation_clears_every_level() {
        let mut directory = small_directory();

        directory.invalidate();

        assert!(directory.services().is_empty());
        assert!(!directory.services_complete());
        assert!(directory.characteristic_by_value_handle(0x0012).is_none());
    }
}
